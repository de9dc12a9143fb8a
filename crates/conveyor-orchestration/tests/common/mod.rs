//! Shared harness for orchestration integration tests: a pool-backed system
//! context with in-memory messaging, registries built per test, and a few
//! reusable handlers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;

use conveyor_orchestration::orchestration::{TaskInitializer, WorkflowCoordinator};
use conveyor_shared::config::ConveyorConfig;
use conveyor_shared::registry::{
    handler_fn, HandlerFailure, HandlerRegistry, StepHandler, StepHandlerInput,
    TaskDefinitionRegistry,
};
use conveyor_shared::system_context::SystemContext;

pub struct TestHarness {
    pub context: Arc<SystemContext>,
    pub coordinator: WorkflowCoordinator,
    pub initializer: TaskInitializer,
}

/// Deterministic config: no jitter, tight re-enqueue delays.
pub fn test_config() -> ConveyorConfig {
    let mut config = ConveyorConfig::default();
    config.backoff.jitter = false;
    config.backoff.reenqueue_processing_delay_seconds = 1;
    config.backoff.reenqueue_default_delay_seconds = 1;
    config
}

pub async fn harness(
    pool: PgPool,
    handlers: HandlerRegistry,
    definitions: TaskDefinitionRegistry,
) -> anyhow::Result<TestHarness> {
    let context = Arc::new(SystemContext::with_pool_and_config(pool, test_config()).await?);
    let handlers = Arc::new(handlers);
    let definitions = Arc::new(definitions);
    let coordinator =
        WorkflowCoordinator::new(context.clone(), handlers.clone(), definitions.clone());
    let initializer = TaskInitializer::new(context.clone(), definitions);
    Ok(TestHarness {
        context,
        coordinator,
        initializer,
    })
}

/// Push every error transition of a task into the past so backoff windows
/// have elapsed.
pub async fn age_error_transitions(
    pool: &PgPool,
    task_id: i64,
    seconds: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE conveyor.workflow_step_transitions wst \
         SET created_at = wst.created_at - make_interval(secs => $2) \
         FROM conveyor.workflow_steps ws \
         WHERE ws.workflow_step_id = wst.workflow_step_id \
           AND ws.task_id = $1 \
           AND wst.to_state = 'error'",
    )
    .bind(task_id)
    .bind(seconds as f64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Handler that succeeds with a fixed payload.
pub fn ok_handler() -> Arc<dyn StepHandler> {
    handler_fn(|_| Ok(json!({"ok": true})))
}

/// Handler that appends its step name to a shared log, then succeeds.
pub fn recording_handler(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn StepHandler> {
    handler_fn(move |input: StepHandlerInput| {
        log.lock()
            .unwrap()
            .push(input.step_metadata.name.clone());
        Ok(json!({"ok": true, "step": input.step_metadata.name}))
    })
}

/// Handler that always fails with the given message.
pub fn failing_handler(message: &'static str) -> Arc<dyn StepHandler> {
    handler_fn(move |_| Err(HandlerFailure::new(message).with_class("TestError")))
}

/// Handler that fails the first `failures` invocations, then succeeds.
pub fn flaky_handler(failures: u32, counter: Arc<AtomicU32>) -> Arc<dyn StepHandler> {
    handler_fn(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(HandlerFailure::new(format!("transient failure #{}", n + 1)))
        } else {
            Ok(json!({"ok": true, "succeeded_on_attempt": n + 1}))
        }
    })
}

/// Handler that fails and requests an explicit server backoff.
pub fn backoff_requesting_handler(seconds: i32) -> Arc<dyn StepHandler> {
    handler_fn(move |_| {
        Err(HandlerFailure::new("rate limited upstream")
            .with_class("RateLimited")
            .with_backoff(seconds))
    })
}

/// Handler that sleeps; used to exercise the deadline path.
pub struct SleepyHandler {
    pub sleep: Duration,
}

#[async_trait]
impl StepHandler for SleepyHandler {
    async fn call(&self, _input: StepHandlerInput) -> Result<Value, HandlerFailure> {
        tokio::time::sleep(self.sleep).await;
        Ok(json!({"ok": true}))
    }
}
