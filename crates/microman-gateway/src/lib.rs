//! Microman gateway
//!
//! Accepts WebSocket clients, admits their requests onto the work channel
//! and delivers worker replies and broadcasts back to the sockets this
//! instance owns.

pub mod connection;
pub mod error;
pub mod gateway;
pub mod router;
pub mod throttle;

pub use connection::{ConnectionHandle, ConnectionRegistry};
pub use error::{GatewayError, InboundError};
pub use gateway::Gateway;
pub use router::{ConnectionRouter, PublishHandler, WorkSink};
pub use throttle::{Throttle, ThrottleError, TOTAL_KEY};
