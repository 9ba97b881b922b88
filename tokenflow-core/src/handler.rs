//! Task handlers and the registry the engine dispatches through.
//!
//! Handlers are externally supplied and stateless from the engine's point
//! of view. A handler receives an owned snapshot of the run variables,
//! never the live context, and returns a partial update the engine merges
//! under its own critical section. Handlers must not call back into the
//! engine or into other handlers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::types::VarMap;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("no handler registered for task type `{0}`")]
    NotRegistered(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Convenience for handler bodies rejecting their input.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// An externally supplied unit of work bound to a service task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, data: VarMap) -> Result<VarMap, HandlerError>;
}

/// Adapter for plain synchronous closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(VarMap) -> Result<VarMap, HandlerError> + Send + Sync,
{
    async fn run(&self, data: VarMap) -> Result<VarMap, HandlerError> {
        (self.0)(data)
    }
}

/// Maps service-task handler keys to handlers. Owned by an [`crate::engine::Engine`];
/// there is no process-wide registry state.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(key.into(), Arc::new(handler));
    }

    /// Register a synchronous closure as a handler.
    pub fn register_fn<F>(&mut self, key: impl Into<String>, f: F)
    where
        F: Fn(VarMap) -> Result<VarMap, HandlerError> + Send + Sync + 'static,
    {
        self.register(key, FnHandler(f));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Invoke the handler for `key` with a read-only snapshot.
    pub async fn dispatch(&self, key: &str, snapshot: VarMap) -> Result<VarMap, HandlerError> {
        match self.get(key) {
            Some(handler) => handler.run(snapshot).await,
            None => Err(HandlerError::NotRegistered(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_returns_partial_update() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("validate", |data: VarMap| {
            let mut update = VarMap::new();
            update.insert("valid".into(), json!(data.contains_key("order_id")));
            Ok(update)
        });

        let mut snapshot = VarMap::new();
        snapshot.insert("order_id".into(), json!("ord-1"));
        let update = registry.dispatch("validate", snapshot).await.unwrap();
        assert_eq!(update.get("valid"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn unknown_key_is_not_registered() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch("missing", VarMap::new()).await.unwrap_err();
        assert_eq!(err, HandlerError::NotRegistered("missing".into()));
    }

    #[tokio::test]
    async fn async_trait_handlers_work() {
        struct Enrich;

        #[async_trait]
        impl TaskHandler for Enrich {
            async fn run(&self, _data: VarMap) -> Result<VarMap, HandlerError> {
                tokio::task::yield_now().await;
                let mut update = VarMap::new();
                update.insert("enriched".into(), json!(true));
                Ok(update)
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register("enrich", Enrich);
        let update = registry.dispatch("enrich", VarMap::new()).await.unwrap();
        assert_eq!(update.get("enriched"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn handler_errors_carry_their_message() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("reject", |_| Err(HandlerError::failed("bad input")));
        let err = registry.dispatch("reject", VarMap::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "bad input");
    }
}
