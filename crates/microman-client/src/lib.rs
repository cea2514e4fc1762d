//! Microman client
//!
//! A WebSocket client for the gateway protocol with request correlation
//! and a bounded wait per request.

pub mod client;
pub mod error;

pub use client::SocketClient;
pub use error::{ClientError, Result};
