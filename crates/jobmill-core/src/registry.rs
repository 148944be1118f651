//! Action registry - resolving opaque action names to application code
//!
//! Job records reference their work by name; the embedding application
//! registers a handler per name before the engine starts. The core never
//! calls into application code except through this seam, which keeps the
//! engine testable with fake registries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::types::RunContext;

/// Future type returned by action handlers
pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback invoked when a job fires
pub type ActionHandler = Arc<dyn Fn(RunContext) -> ActionFuture + Send + Sync>;

/// Name-keyed set of action handlers supplied by the embedding application.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, ActionHandler>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |ctx| Box::pin(handler(ctx))));
    }

    /// Look up a handler by action name.
    pub fn get(&self, name: &str) -> Option<ActionHandler> {
        self.handlers.get(name).cloned()
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
