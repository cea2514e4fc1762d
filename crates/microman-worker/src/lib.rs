//! Microman worker
//!
//! A worker binds a dispatch table of topic handlers to the work channel
//! and publishes their replies and broadcasts on the publish channel.

pub mod dispatcher;
pub mod handler;
pub mod registry;
pub mod stats;
pub mod worker;

pub use dispatcher::{DispatchError, Dispatcher, Outcome};
pub use handler::{HandlerContext, HandlerError, HandlerResult, PublishSink, TopicHandler};
pub use registry::{Registration, RegistryError, TopicRegistry};
pub use stats::{ConsumerStats, Settlement, StatsSnapshot};
pub use worker::Worker;
