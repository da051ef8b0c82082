//! Configuration module
//!
//! Handles loading the hub's server settings.

mod hub;

pub use hub::*;
