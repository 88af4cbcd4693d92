//! Domain services used by the websocket gateway and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and all room-directed fan-out so
//! the gateway can stay focused on protocol translation and auth
//! plumbing. Every participant-visible event for a room is broadcast
//! while that room's lock is held, which makes delivery order match the
//! order state changes were applied.

pub mod archive;
pub mod quiz;
pub mod room;
