//! End-to-end coordinator tests over real task DAGs: linear chains, diamond
//! concurrency, retryable failures with backoff, and permanent blocking.

mod common;

use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use serde_json::json;
use sqlx::PgPool;

use common::*;
use conveyor_orchestration::orchestration::FinalizationAction;
use conveyor_shared::models::orchestration::{ExecutionStatus, HealthStatus};
use conveyor_shared::models::{Task, TaskTransition, WorkflowStep, WorkflowStepTransition};
use conveyor_shared::registry::{
    HandlerRegistry, StepTemplate, TaskDefinition, TaskDefinitionRegistry,
};

/// Linear chain a -> b -> c: every handler succeeds, every step records the
/// full pending -> in_progress -> complete audit chain, and the task ends
/// complete.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn linear_chain_completes(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "handle", ok_handler());

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(1, "test", "linear_chain")
            .with_step(StepTemplate::new(1, "a", "handle"))
            .with_step(StepTemplate::new(2, "b", "handle").depends_on(&["a"]))
            .with_step(StepTemplate::new(3, "c", "handle").depends_on(&["b"])),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness
        .initializer
        .create_task(1, json!({"input": 6}))
        .await?;

    let result = harness.coordinator.process_task(created.task_id).await?;
    assert_eq!(result.action, FinalizationAction::Completed);
    assert_eq!(result.execution_status, Some(ExecutionStatus::AllComplete));
    assert_eq!(result.health_status, Some(HealthStatus::Healthy));

    // Task audit chain: pending -> in_progress -> complete.
    let task_history = TaskTransition::list_for_task(&pool, created.task_id).await?;
    let states: Vec<&str> = task_history.iter().map(|t| t.to_state.as_str()).collect();
    assert_eq!(states, vec!["pending", "in_progress", "complete"]);

    // Each step has exactly three transitions and is processed.
    for step_id in created.step_ids.values() {
        let history = WorkflowStepTransition::list_for_step(&pool, *step_id).await?;
        let states: Vec<&str> = history.iter().map(|t| t.to_state.as_str()).collect();
        assert_eq!(states, vec!["pending", "in_progress", "complete"]);

        let step = WorkflowStep::find_by_id(&pool, *step_id).await?.unwrap();
        assert!(step.processed);
        assert!(!step.in_process);
        assert_eq!(step.attempts, 1);
    }
    Ok(())
}

/// Diamond root -> (left, right) -> merge with concurrent execution: order
/// respects dependencies, both branches run, and the task completes.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn concurrent_diamond_respects_dependencies(pool: PgPool) -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "record", recording_handler(log.clone()));

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(2, "test", "diamond")
            .concurrent()
            .with_step(StepTemplate::new(1, "root", "record"))
            .with_step(StepTemplate::new(2, "left", "record").depends_on(&["root"]))
            .with_step(StepTemplate::new(3, "right", "record").depends_on(&["root"]))
            .with_step(
                StepTemplate::new(4, "merge", "record").depends_on(&["left", "right"]),
            ),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(2, json!({})).await?;

    let result = harness.coordinator.process_task(created.task_id).await?;
    assert_eq!(result.action, FinalizationAction::Completed);

    let order = log.lock().unwrap().clone();
    assert_eq!(order.len(), 4, "all four steps must run exactly once");
    let position =
        |name: &str| order.iter().position(|n| n == name).expect("step ran");
    assert!(position("root") < position("left"));
    assert!(position("root") < position("right"));
    assert!(position("merge") > position("left"));
    assert!(position("merge") > position("right"));

    let context = harness
        .coordinator
        .discovery()
        .get_execution_context(created.task_id)
        .await?
        .unwrap();
    assert_eq!(context.completed_steps, 4);
    assert_eq!(context.execution_status, ExecutionStatus::AllComplete);
    Ok(())
}

/// Retryable failure, then success: the first pass leaves the step in error
/// with backoff in effect and re-enqueues the task; once the window elapses
/// the second pass succeeds and last_failure_at still points at the first
/// failure.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn retryable_failure_then_success(pool: PgPool) -> anyhow::Result<()> {
    let attempts_seen = Arc::new(AtomicU32::new(0));

    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "steady", ok_handler());
    handlers.register("test", "flaky", flaky_handler(1, attempts_seen));

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(3, "test", "flaky_chain")
            .with_step(StepTemplate::new(1, "a", "steady"))
            .with_step(
                StepTemplate::new(2, "b", "flaky")
                    .depends_on(&["a"])
                    .with_retry_limit(3),
            ),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(3, json!({})).await?;
    let step_b = created.step_ids["b"];

    // First pass: a completes, b fails once and enters backoff.
    let result = harness.coordinator.process_task(created.task_id).await?;
    assert_eq!(result.action, FinalizationAction::Reenqueued);

    let step = WorkflowStep::find_by_id(&pool, step_b).await?.unwrap();
    assert_eq!(step.attempts, 1);
    assert_eq!(step.get_current_state(&pool).await?.as_deref(), Some("error"));

    let rows = harness
        .coordinator
        .discovery()
        .sql_executor()
        .get_step_readiness_status(created.task_id, Some(&[step_b]))
        .await?;
    assert!(!rows[0].ready_for_execution, "backoff window still open");
    assert!(rows[0].last_failure_at.is_some());

    // The task is failed-but-recovering, never blocked: 2^1 = 2s window.
    let context = harness
        .coordinator
        .discovery()
        .get_execution_context(created.task_id)
        .await?
        .unwrap();
    assert_eq!(context.failed_steps, 1);
    assert_eq!(context.permanently_blocked_steps, 0);
    assert_eq!(
        context.execution_status,
        ExecutionStatus::WaitingForDependencies
    );

    // Open the window and run again: attempt 2 succeeds.
    age_error_transitions(&pool, created.task_id, 5).await?;
    let result = harness.coordinator.process_task(created.task_id).await?;
    assert_eq!(result.action, FinalizationAction::Completed);

    let step = WorkflowStep::find_by_id(&pool, step_b).await?.unwrap();
    assert_eq!(step.attempts, 2);
    assert!(step.processed);

    // The failure history survives success.
    let rows = harness
        .coordinator
        .discovery()
        .sql_executor()
        .get_step_readiness_status(created.task_id, Some(&[step_b]))
        .await?;
    assert!(rows[0].last_failure_at.is_some());
    assert_eq!(rows[0].current_state, "complete");
    Ok(())
}

/// Permanent failure blocks the task: once attempts reach retry_limit the
/// step is permanently blocked and the task transitions to error.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn permanent_failure_blocks_task(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "doomed", failing_handler("payment declined"));

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(4, "test", "doomed_task")
            .with_step(StepTemplate::new(1, "b", "doomed").with_retry_limit(2)),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(4, json!({})).await?;
    let step_b = created.step_ids["b"];

    // Attempt 1 fails; the task waits out the backoff window.
    let result = harness.coordinator.process_task(created.task_id).await?;
    assert_eq!(result.action, FinalizationAction::Reenqueued);

    // Attempt 2 exhausts the budget.
    age_error_transitions(&pool, created.task_id, 10).await?;
    let result = harness.coordinator.process_task(created.task_id).await?;
    assert_eq!(result.action, FinalizationAction::Failed);
    assert_eq!(
        result.execution_status,
        Some(ExecutionStatus::BlockedByFailures)
    );
    assert_eq!(result.health_status, Some(HealthStatus::Blocked));

    let step = WorkflowStep::find_by_id(&pool, step_b).await?.unwrap();
    assert_eq!(step.attempts, 2);

    let rows = harness
        .coordinator
        .discovery()
        .sql_executor()
        .get_step_readiness_status(created.task_id, None)
        .await?;
    assert!(!rows[0].retry_eligible);
    assert!(rows[0].is_permanently_blocked());

    let task = Task::find_by_id(&pool, created.task_id).await?.unwrap();
    assert_eq!(task.get_current_state(&pool).await?.as_deref(), Some("error"));

    // The error record is attached to the step's results.
    let results = WorkflowStep::find_by_id(&pool, step_b)
        .await?
        .unwrap()
        .results
        .unwrap();
    assert_eq!(results["error"]["message"], "payment declined");
    Ok(())
}

/// Finalizing twice does not compound: the second pass observes the terminal
/// state and no-ops into the same answer.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn finalize_is_idempotent(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "handle", ok_handler());

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(5, "test", "single")
            .with_step(StepTemplate::new(1, "only", "handle")),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(5, json!({})).await?;

    harness.coordinator.process_task(created.task_id).await?;

    let first = harness
        .coordinator
        .finalizer()
        .finalize_task(created.task_id)
        .await?;
    let second = harness
        .coordinator
        .finalizer()
        .finalize_task(created.task_id)
        .await?;
    assert_eq!(first.action, FinalizationAction::Completed);
    assert_eq!(second.action, FinalizationAction::Completed);

    // No extra transition was appended by the second finalize.
    let history = TaskTransition::list_for_task(&pool, created.task_id).await?;
    assert_eq!(
        history.iter().filter(|t| t.to_state == "complete").count(),
        1
    );
    Ok(())
}

/// Re-delivered messages for settled tasks are harmless.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn settled_task_coordination_is_a_no_op(pool: PgPool) -> anyhow::Result<()> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("test", "handle", ok_handler());

    let mut definitions = TaskDefinitionRegistry::new();
    definitions.register(
        TaskDefinition::new(6, "test", "single")
            .with_step(StepTemplate::new(1, "only", "handle")),
    )?;

    let harness = harness(pool.clone(), handlers, definitions).await?;
    let created = harness.initializer.create_task(6, json!({})).await?;

    harness.coordinator.process_task(created.task_id).await?;
    let replay = harness.coordinator.process_task(created.task_id).await?;
    assert_eq!(replay.action, FinalizationAction::NoAction);
    Ok(())
}

/// Unknown task ids surface loudly instead of spinning.
#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
async fn unknown_task_is_an_error(pool: PgPool) -> anyhow::Result<()> {
    let harness = harness(
        pool,
        HandlerRegistry::new(),
        TaskDefinitionRegistry::new(),
    )
    .await?;
    let result = harness.coordinator.process_task(123_456).await;
    assert!(matches!(
        result,
        Err(conveyor_shared::errors::OrchestrationError::TaskNotFound(123_456))
    ));
    Ok(())
}
