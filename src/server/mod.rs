//! Tool server module
//!
//! Exposes the shell registry to tool clients over WebSocket or stdio and
//! routes their calls to the registry.

mod handler;
mod protocol;
mod stdio;
mod tools;
mod websocket;

pub use handler::*;
pub use stdio::*;
pub use tools::*;
pub use websocket::*;
