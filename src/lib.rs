//! termgate - a WebSocket to SSH session gateway
//!
//! Lets a browser terminal drive a remote shell over one persistent
//! WebSocket. Each connection carries at most one live session; connects,
//! credential exchange, shell traffic, and teardown all travel as JSON
//! events on the same socket.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames, shell output chunks, etc.)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod auth;
pub mod config;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ConnectionConfig, GatewayConfig};
pub use registry::ConnectionRegistry;
pub use server::Gateway;
