//! Step executor behavior: claim races, deadlines, explicit backoff hints,
//! configuration failures, and sequential halt semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;

use common::*;
use conveyor_orchestration::orchestration::{StepExecutor, StepOutcome};
use conveyor_shared::models::{Task, WorkflowStep};
use conveyor_shared::registry::{
    HandlerRegistry, StepTemplate, TaskDefinition, TaskDefinitionRegistry,
};

/// A step freshly claimed by another worker is skipped silently.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn claimed_step_is_skipped(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "handle", ok_handler());

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(10, "test", "single")
            .with_step(StepTemplate::new(1, "only", "handle")),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(10, json!({})).await?;
    let task = Task::find_by_id(&pool, created.task_id).await?.unwrap();

    let viable = harness
        .coordinator
        .discovery()
        .find_viable_steps(created.task_id, None)
        .await?;
    assert_eq!(viable.len(), 1);

    // Another worker wins the claim between discovery and execution.
    sqlx::query(
        "UPDATE conveyor.workflow_steps SET in_process = TRUE WHERE workflow_step_id = $1",
    )
    .bind(created.step_ids["only"])
    .execute(&pool)
    .await?;

    let executor = executor_for(&harness);
    let outcomes = executor.execute_batch(&task, viable).await?;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].outcome, StepOutcome::Skipped));

    // The lost claim consumed no attempt.
    let step = WorkflowStep::find_by_id(&pool, created.step_ids["only"])
        .await?
        .unwrap();
    assert_eq!(step.attempts, 0);
    Ok(())
}

/// A handler that outlives its deadline is failed with the synthetic
/// timeout marker; downstream treatment is identical to a regular failure.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn handler_deadline_produces_timeout_failure(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "test",
        "sleepy",
        Arc::new(SleepyHandler {
            sleep: Duration::from_secs(5),
        }),
    );

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(11, "test", "slow").with_step(
            StepTemplate::new(1, "nap", "sleepy").with_timeout_seconds(1),
        ),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(11, json!({})).await?;
    let task = Task::find_by_id(&pool, created.task_id).await?.unwrap();

    let viable = harness
        .coordinator
        .discovery()
        .find_viable_steps(created.task_id, None)
        .await?;
    let executor = executor_for(&harness);
    let outcomes = executor.execute_batch(&task, viable).await?;

    match &outcomes[0].outcome {
        StepOutcome::Failed {
            error,
            permanently_blocked,
        } => {
            assert!(error.contains("timed out"));
            assert!(!permanently_blocked, "timeouts respect the retry budget");
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }

    let step = WorkflowStep::find_by_id(&pool, created.step_ids["nap"])
        .await?
        .unwrap();
    let results = step.results.clone().unwrap();
    assert_eq!(results["error"]["timeout"], json!(true));
    assert_eq!(results["error"]["error_class"], json!("TimeoutError"));
    assert_eq!(step.get_current_state(&pool).await?.as_deref(), Some("error"));
    assert!(!step.in_process);
    Ok(())
}

/// Explicit backoff hint: even though 2^attempts is small, the server hint
/// holds the step back for its full window.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn explicit_backoff_hint_is_honored(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "throttled", backoff_requesting_handler(60));

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(12, "test", "throttled_task")
            .with_step(StepTemplate::new(1, "call", "throttled")),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(12, json!({})).await?;

    harness.coordinator.process_task(created.task_id).await?;

    let step = WorkflowStep::find_by_id(&pool, created.step_ids["call"])
        .await?
        .unwrap();
    assert_eq!(step.backoff_request_seconds, Some(60));

    // Aging the failure past the exponential window changes nothing: the
    // hint is anchored to last_attempted_at.
    age_error_transitions(&pool, created.task_id, 10).await?;
    let rows = harness
        .coordinator
        .discovery()
        .sql_executor()
        .get_step_readiness_status(created.task_id, None)
        .await?;
    assert!(!rows[0].ready_for_execution);
    let expected = step.last_attempted_at.unwrap() + chrono::Duration::seconds(60);
    assert_eq!(rows[0].next_retry_at.unwrap(), expected);
    Ok(())
}

/// A step whose handler is not registered is a configuration failure: failed
/// immediately and never retried.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn missing_handler_fails_fast(pool: PgPool) -> anyhow::Result<()> {
    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(13, "test", "misconfigured")
            .with_step(StepTemplate::new(1, "ghost", "not_registered")),
    )?;

    let harness = harness(pool.clone(), HandlerRegistry::new(), definitions).await?;
    let created = harness.initializer.create_task(13, json!({})).await?;
    let task = Task::find_by_id(&pool, created.task_id).await?.unwrap();

    let viable = harness
        .coordinator
        .discovery()
        .find_viable_steps(created.task_id, None)
        .await?;
    let executor = executor_for(&harness);
    let outcomes = executor.execute_batch(&task, viable).await?;

    assert!(outcomes[0].is_permanently_blocked());
    let step = WorkflowStep::find_by_id(&pool, created.step_ids["ghost"])
        .await?
        .unwrap();
    assert!(!step.retryable, "configuration failures are not retried");

    let rows = harness
        .coordinator
        .discovery()
        .sql_executor()
        .get_step_readiness_status(created.task_id, None)
        .await?;
    assert!(!rows[0].ready_for_execution);
    Ok(())
}

/// Sequential default: all siblings are attempted even when one fails.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn sequential_batch_attempts_all_siblings_by_default(
    pool: PgPool,
) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "fails", failing_handler("boom"));
    handlers.register("test", "works", ok_handler());

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(14, "test", "siblings")
            .with_step(StepTemplate::new(1, "x", "fails"))
            .with_step(StepTemplate::new(2, "y", "works")),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(14, json!({})).await?;
    let task = Task::find_by_id(&pool, created.task_id).await?.unwrap();

    let viable = harness
        .coordinator
        .discovery()
        .find_viable_steps(created.task_id, None)
        .await?;
    assert_eq!(viable.len(), 2);

    let executor = executor_for(&harness);
    let outcomes = executor.execute_batch(&task, viable).await?;
    assert_eq!(outcomes.len(), 2, "failure must not abort the sibling");
    assert!(outcomes
        .iter()
        .any(|o| matches!(o.outcome, StepOutcome::Failed { .. })));
    assert!(outcomes
        .iter()
        .any(|o| matches!(o.outcome, StepOutcome::Completed { .. })));
    Ok(())
}

/// Sequential halt-on-first-failure: the task opted in, so the batch stops
/// at the first failure.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn sequential_batch_halts_when_opted_in(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "fails", failing_handler("boom"));
    handlers.register("test", "works", ok_handler());

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(15, "test", "halting")
            .halt_on_first_failure()
            .with_step(StepTemplate::new(1, "x", "fails"))
            .with_step(StepTemplate::new(2, "y", "works")),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(15, json!({})).await?;
    let task = Task::find_by_id(&pool, created.task_id).await?.unwrap();

    let viable = harness
        .coordinator
        .discovery()
        .find_viable_steps(created.task_id, None)
        .await?;
    let executor = executor_for(&harness);
    let outcomes = executor.execute_batch(&task, viable).await?;

    assert_eq!(outcomes.len(), 1, "batch stops at the first failure");
    assert!(matches!(outcomes[0].outcome, StepOutcome::Failed { .. }));
    Ok(())
}

fn executor_for(harness: &TestHarness) -> StepExecutor {
    harness.coordinator.executor().clone()
}
