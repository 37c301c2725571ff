//! Queue name to handler lookup for the worker pools.

use super::handler::{SharedHandler, TaskHandler};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, SharedHandler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.queue_names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `queue_name`, replacing any earlier one
    pub fn register(&mut self, queue_name: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.register_shared(queue_name, Arc::new(handler));
    }

    pub fn register_shared(&mut self, queue_name: impl Into<String>, handler: SharedHandler) {
        let queue_name = queue_name.into();
        info!(
            queue = %queue_name,
            handler = handler.handler_name(),
            "📝 Registering task handler"
        );
        if self.handlers.insert(queue_name.clone(), handler).is_some() {
            warn!(queue = %queue_name, "Replaced previously registered handler");
        }
    }

    pub fn get(&self, queue_name: &str) -> Option<SharedHandler> {
        self.handlers.get(queue_name).cloned()
    }

    pub fn contains(&self, queue_name: &str) -> bool {
        self.handlers.contains_key(queue_name)
    }

    /// Registered queue names, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
