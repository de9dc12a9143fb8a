//! Step handler contract and registry.
//!
//! A handler is an opaque, single-method contract: it consumes the task
//! context plus upstream results and either returns a results document or
//! fails. Failures are data — they carry an optional error class and an
//! optional server backoff hint ("catch, annotate, re-raise") and are
//! persisted into the step's `results` column, never propagated as engine
//! errors. Handlers must not call back into the state machines or the
//! readiness engine.
//!
//! The registry maps `(namespace, name)` to a handler; it is populated at
//! startup and immutable afterwards. No reflection, no dynamic lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handler-reported failure. `backoff_request_seconds` is an explicit,
/// server-honored backoff hint that takes precedence over exponential policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub message: String,
    pub error_class: Option<String>,
    pub backoff_request_seconds: Option<i32>,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_class: None,
            backoff_request_seconds: None,
        }
    }

    pub fn with_class(mut self, error_class: impl Into<String>) -> Self {
        self.error_class = Some(error_class.into());
        self
    }

    pub fn with_backoff(mut self, seconds: i32) -> Self {
        self.backoff_request_seconds = Some(seconds);
        self
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_class {
            Some(class) => write!(f, "{class}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HandlerFailure {}

impl From<anyhow::Error> for HandlerFailure {
    fn from(err: anyhow::Error) -> Self {
        HandlerFailure::new(err.to_string())
    }
}

/// Metadata about the step being executed, handed to the handler alongside
/// its inputs.
#[derive(Debug, Clone, Serialize)]
pub struct StepMetadata {
    pub workflow_step_id: i64,
    pub task_id: i64,
    pub name: String,
    pub attempt: i32,
    pub retry_limit: i32,
    pub handler_config: Option<Value>,
}

/// The full handler input: task context, upstream results keyed by parent
/// step name, and step metadata.
#[derive(Debug, Clone, Serialize)]
pub struct StepHandlerInput {
    pub task_context: Value,
    pub upstream_results: HashMap<String, Value>,
    pub step_metadata: StepMetadata,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn call(&self, input: StepHandlerInput) -> Result<Value, HandlerFailure>;
}

/// Adapter for plain functions; mostly used by tests and small embedders.
struct FnStepHandler<F>(F);

#[async_trait]
impl<F> StepHandler for FnStepHandler<F>
where
    F: Fn(StepHandlerInput) -> Result<Value, HandlerFailure> + Send + Sync,
{
    async fn call(&self, input: StepHandlerInput) -> Result<Value, HandlerFailure> {
        (self.0)(input)
    }
}

/// Wrap a synchronous closure as a [`StepHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepHandlerInput) -> Result<Value, HandlerFailure> + Send + Sync + 'static,
{
    Arc::new(FnStepHandler(f))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandlerKey {
    namespace: String,
    name: String,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) {
        self.handlers.insert(
            HandlerKey {
                namespace: namespace.into(),
                name: name.into(),
            },
            handler,
        );
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers
            .get(&HandlerKey {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registered_handler_is_invocable() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "billing",
            "charge_card",
            handler_fn(|input| Ok(json!({"echo": input.step_metadata.name}))),
        );

        let handler = registry.get("billing", "charge_card").unwrap();
        let result = handler
            .call(StepHandlerInput {
                task_context: json!({}),
                upstream_results: HashMap::new(),
                step_metadata: StepMetadata {
                    workflow_step_id: 1,
                    task_id: 1,
                    name: "charge_card".to_string(),
                    attempt: 1,
                    retry_limit: 3,
                    handler_config: None,
                },
            })
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": "charge_card"}));
    }

    #[test]
    fn lookup_misses_on_wrong_namespace() {
        let mut registry = HandlerRegistry::new();
        registry.register("billing", "charge_card", handler_fn(|_| Ok(json!({}))));
        assert!(registry.get("fulfillment", "charge_card").is_none());
        assert!(registry.get("billing", "refund").is_none());
    }

    #[test]
    fn failure_annotations_compose() {
        let failure = HandlerFailure::new("gateway unavailable")
            .with_class("GatewayError")
            .with_backoff(60);
        assert_eq!(failure.backoff_request_seconds, Some(60));
        assert_eq!(failure.to_string(), "GatewayError: gateway unavailable");
    }
}
