//! Transport layer for boxpool.
//!
//! HTTP via axum: JSON status routes, multipart upload and the WebSocket
//! liveness channel.

pub mod http;

pub use http::{ServerConfig, serve};
