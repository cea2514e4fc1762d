//! Worker dispatcher
//!
//! Looks up the handler for a work item, enforces its session requirement
//! and contains handler failures, turning them into `error` replies.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, Location};
use std::sync::{Arc, Once};

use futures_util::FutureExt;
use microman_core::{PublishEnvelope, WorkItem, ERROR_TOPIC};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::handler::{HandlerContext, HandlerError, PublishSink};
use crate::registry::TopicRegistry;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No handler registered for topic {0}")]
    UnknownTopic(String),

    #[error("Topic {0} requires a session")]
    SessionRequired(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("{message}")]
    Panicked {
        message: String,
        /// Panic location, plus application frames when backtraces are enabled
        excerpt: String,
    },
}

/// How a work item ended, used to settle its delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Failed,
}

pub struct Dispatcher {
    registry: Arc<TopicRegistry>,
    publisher: Arc<dyn PublishSink>,
}

impl Dispatcher {
    pub fn new(registry: Arc<TopicRegistry>, publisher: Arc<dyn PublishSink>) -> Self {
        install_panic_hook();
        Self {
            registry,
            publisher,
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Run the handler for `item`
    pub async fn dispatch(&self, item: WorkItem) -> Result<(), DispatchError> {
        let topic = item.topic().to_string();
        let registration = self
            .registry
            .get(&topic)
            .ok_or_else(|| DispatchError::UnknownTopic(topic.clone()))?;

        if registration.require_session
            && !item.session.as_ref().is_some_and(|session| session.is_valid())
        {
            return Err(DispatchError::SessionRequired(topic));
        }

        let ctx = HandlerContext::new(
            item.message,
            item.meta,
            item.session,
            Arc::clone(&self.publisher),
        );
        let handler = Arc::clone(&registration.handler);
        match AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(panic) => Err(DispatchError::Panicked {
                message: panic_message(panic.as_ref()),
                excerpt: PANIC_SITE
                    .with(|site| site.borrow_mut().take())
                    .unwrap_or_default(),
            }),
        }
    }

    /// Dispatch and answer failures with an `error` reply.
    ///
    /// With `reply_on_failure` unset the failure is only logged; the caller
    /// is about to requeue the item.
    pub async fn process(&self, item: WorkItem, reply_on_failure: bool) -> Outcome {
        let topic = item.topic().to_string();
        let meta = item.meta.clone();

        let err = match self.dispatch(item).await {
            Ok(()) => {
                debug!(topic = %topic, "Handled");
                return Outcome::Handled;
            }
            Err(err) => err,
        };

        match &err {
            DispatchError::Panicked { message, excerpt } => {
                error!(topic = %topic, panic = %message, stack = %excerpt, "Handler panicked")
            }
            DispatchError::Handler(source) => {
                warn!(topic = %topic, error = %source, chain = %source_chain(source), "Handler failed")
            }
            _ => warn!(topic = %topic, error = %err, "Dispatch failed"),
        }

        if reply_on_failure {
            let reply = PublishEnvelope::reply(
                ERROR_TOPIC,
                json!({ "message": err.to_string() }),
                meta,
                None,
            );
            if let Err(publish_err) = self.publisher.publish(reply).await {
                error!(topic = %topic, error = %publish_err, "Failed to publish error reply");
            }
        }
        Outcome::Failed
    }
}

const EXCERPT_FRAMES: usize = 6;

thread_local! {
    static PANIC_SITE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record a stack excerpt for every panic on the panicking thread, then
/// defer to the previously installed hook
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let excerpt = stack_excerpt(info.location(), &Backtrace::capture());
            PANIC_SITE.with(|site| *site.borrow_mut() = Some(excerpt));
            previous(info);
        }));
    });
}

fn stack_excerpt(location: Option<&Location<'_>>, trace: &Backtrace) -> String {
    let mut lines = Vec::new();
    if let Some(location) = location {
        lines.push(format!("at {}:{}", location.file(), location.line()));
    }
    if trace.status() == BacktraceStatus::Captured {
        let rendered = trace.to_string();
        lines.extend(
            rendered
                .lines()
                .filter_map(frame_symbol)
                .filter(|symbol| {
                    !["std::", "core::", "alloc::", "<core::", "<alloc::", "__rust"]
                        .iter()
                        .any(|prefix| symbol.starts_with(prefix))
                })
                .take(EXCERPT_FRAMES)
                .map(str::to_string),
        );
    }
    lines.join(" | ")
}

/// Symbol of a rendered backtrace line such as `  12: worker::run`
fn frame_symbol(line: &str) -> Option<&str> {
    let (index, symbol) = line.trim().split_once(": ")?;
    (!index.is_empty() && index.chars().all(|c| c.is_ascii_digit())).then_some(symbol)
}

/// `error: cause: root cause`, skipping causes already quoted by their parent
fn source_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !chain.ends_with(&text) {
            chain.push_str(": ");
            chain.push_str(&text);
        }
        source = cause.source();
    }
    chain
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::RecordingSink;
    use crate::handler::HandlerResult;
    use microman_core::{Message, Meta, Session};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INVOCATIONS: AtomicUsize = AtomicUsize::new(0);

    async fn echo(ctx: HandlerContext) -> HandlerResult {
        ctx.reply(ctx.topic().to_string(), ctx.payload().clone()).await
    }

    async fn guarded(ctx: HandlerContext) -> HandlerResult {
        INVOCATIONS.fetch_add(1, Ordering::SeqCst);
        ctx.reply("guarded", json!({})).await
    }

    async fn failing(_ctx: HandlerContext) -> HandlerResult {
        Err(HandlerError::msg("Boom"))
    }

    async fn panicking(_ctx: HandlerContext) -> HandlerResult {
        panic!("handler exploded")
    }

    fn dispatcher(sink: Arc<RecordingSink>) -> Dispatcher {
        let mut registry = TopicRegistry::new();
        registry
            .register_public("echo.get", echo)
            .unwrap()
            .register("guarded", guarded)
            .unwrap()
            .register_public("failing", failing)
            .unwrap()
            .register_public("panicking", panicking)
            .unwrap();
        Dispatcher::new(Arc::new(registry), sink)
    }

    fn item(topic: &str, session: Option<Session>) -> WorkItem {
        let mut meta = Meta::default();
        meta.socket_id = Some("s1".to_string());
        WorkItem {
            message: Message {
                topic: topic.to_string(),
                payload: json!({"value": "ABC"}),
            },
            meta,
            session,
        }
    }

    fn error_message(envelope: &PublishEnvelope) -> String {
        let reply = envelope.payload.reply.as_ref().unwrap();
        assert_eq!(reply.topic, ERROR_TOPIC);
        reply.payload["message"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler() {
        let sink = Arc::new(RecordingSink::default());
        let outcome = dispatcher(sink.clone()).process(item("echo.get", None), true).await;

        assert_eq!(outcome, Outcome::Handled);
        let published = sink.published.lock();
        let reply = published[0].payload.reply.as_ref().unwrap();
        assert_eq!(reply.topic, "echo.get");
        assert_eq!(reply.payload, json!({"value": "ABC"}));
    }

    #[tokio::test]
    async fn test_unknown_topic_replies_error() {
        let sink = Arc::new(RecordingSink::default());
        let outcome = dispatcher(sink.clone()).process(item("nope", None), true).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(
            error_message(&sink.published.lock()[0]),
            "No handler registered for topic nope"
        );
    }

    #[tokio::test]
    async fn test_session_required_skips_handler() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());
        let before = INVOCATIONS.load(Ordering::SeqCst);

        let outcome = dispatcher.process(item("guarded", None), true).await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), before);
        assert_eq!(
            error_message(&sink.published.lock()[0]),
            "Topic guarded requires a session"
        );

        let incomplete = Session::new("u1", "");
        assert!(matches!(
            dispatcher.dispatch(item("guarded", Some(incomplete))).await,
            Err(DispatchError::SessionRequired(_))
        ));

        let session = Session::new("u1", "a@b.se");
        assert_eq!(
            dispatcher.process(item("guarded", Some(session)), true).await,
            Outcome::Handled
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let sink = Arc::new(RecordingSink::default());
        let outcome = dispatcher(sink.clone()).process(item("failing", None), true).await;

        assert_eq!(outcome, Outcome::Failed);
        let published = sink.published.lock();
        assert_eq!(error_message(&published[0]), "Boom");
        assert_eq!(published[0].socket_id(), Some("s1"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        let outcome = dispatcher.process(item("panicking", None), true).await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(error_message(&sink.published.lock()[0]), "handler exploded");

        match dispatcher.dispatch(item("panicking", None)).await {
            Err(DispatchError::Panicked { message, excerpt }) => {
                assert_eq!(message, "handler exploded");
                assert!(excerpt.starts_with("at "));
                assert!(excerpt.contains("dispatcher.rs"));
            }
            other => panic!("expected a contained panic, got {:?}", other.err()),
        }

        // The dispatcher keeps working after a panic.
        assert_eq!(
            dispatcher.process(item("echo.get", None), true).await,
            Outcome::Handled
        );
    }

    #[derive(Debug, thiserror::Error)]
    #[error("lookup failed")]
    struct LookupError {
        #[source]
        cause: std::io::Error,
    }

    #[test]
    fn test_source_chain() {
        let err = LookupError {
            cause: std::io::Error::new(std::io::ErrorKind::NotFound, "no such record"),
        };
        assert_eq!(source_chain(&err), "lookup failed: no such record");

        let quoted = HandlerError::Publish(microman_broker::BrokerError::Closed);
        assert_eq!(source_chain(&quoted), quoted.to_string());
    }

    #[test]
    fn test_frame_symbol() {
        assert_eq!(frame_symbol("  12: worker::run"), Some("worker::run"));
        assert_eq!(frame_symbol("             at ./src/lib.rs:3:5"), None);
    }

    #[tokio::test]
    async fn test_no_reply_when_retrying() {
        let sink = Arc::new(RecordingSink::default());
        let outcome = dispatcher(sink.clone()).process(item("failing", None), false).await;

        assert_eq!(outcome, Outcome::Failed);
        assert!(sink.published.lock().is_empty());
    }
}
