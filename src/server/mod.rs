//! WebSocket server module
//!
//! Accepts WebSocket connections from chat clients and runs each one as a
//! participant of the hub.

mod handler;
mod websocket;

pub use websocket::WebSocketServer;
