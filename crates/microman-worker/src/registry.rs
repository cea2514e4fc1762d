//! Topic registry
//!
//! The dispatch table of a worker, validated when it is built.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use microman_core::{binding_key, topic_matches};
use thiserror::Error;

use crate::handler::TopicHandler;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Topic must not be empty")]
    EmptyTopic,

    #[error("Topic already registered: {0}")]
    Duplicate(String),

    #[error("No topics registered")]
    NoTopics,

    #[error("Topic {topic} matches none of the bindings {bindings:?}")]
    Unbound { topic: String, bindings: Vec<String> },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A handler and whether it needs an attached session
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn TopicHandler>,
    pub require_session: bool,
}

#[derive(Clone, Default)]
pub struct TopicRegistry {
    handlers: HashMap<String, Registration>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that requires a session
    pub fn register<H>(&mut self, topic: &str, handler: H) -> Result<&mut Self>
    where
        H: TopicHandler + 'static,
    {
        self.register_with(topic, Arc::new(handler), true)
    }

    /// Register a handler open to connections without a session
    pub fn register_public<H>(&mut self, topic: &str, handler: H) -> Result<&mut Self>
    where
        H: TopicHandler + 'static,
    {
        self.register_with(topic, Arc::new(handler), false)
    }

    pub fn register_with(
        &mut self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
        require_session: bool,
    ) -> Result<&mut Self> {
        if topic.trim().is_empty() {
            return Err(RegistryError::EmptyTopic);
        }
        if self.handlers.contains_key(topic) {
            return Err(RegistryError::Duplicate(topic.to_string()));
        }
        self.handlers.insert(
            topic.to_string(),
            Registration {
                handler,
                require_session,
            },
        );
        Ok(self)
    }

    pub fn get(&self, topic: &str) -> Option<&Registration> {
        self.handlers.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Registered topics in sorted order
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// One binding per registered topic, `:` normalized to `.`
    pub fn default_bindings(&self) -> Vec<String> {
        self.handlers
            .keys()
            .map(|topic| binding_key(topic))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Bindings to consume with.
    ///
    /// Empty `configured` derives them from the registered topics. Otherwise
    /// every registered topic must be routable through one of them.
    pub fn resolve_bindings(&self, configured: &[String]) -> Result<Vec<String>> {
        if self.handlers.is_empty() {
            return Err(RegistryError::NoTopics);
        }
        if configured.is_empty() {
            return Ok(self.default_bindings());
        }

        let bindings: Vec<String> = configured
            .iter()
            .map(|binding| binding_key(binding))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for topic in self.topics() {
            let key = binding_key(&topic);
            if !bindings.iter().any(|pattern| topic_matches(pattern, &key)) {
                return Err(RegistryError::Unbound { topic, bindings });
            }
        }
        Ok(bindings)
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}
