//! Broadcast hub module
//!
//! Tracks connected participants and relays chat messages between them.

mod broadcast;
mod registry;

pub use broadcast::*;
pub use registry::*;
