//! Microman processes
//!
//! Demo topic handlers, access tokens and the single-process setup used by
//! the `microman` binary and the end-to-end tests.

pub mod auth;
pub mod handlers;
pub mod standalone;

pub use handlers::{HandlerOptions, Profile};
pub use standalone::Standalone;
