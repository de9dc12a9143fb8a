//! Orchestrator worker process: load configuration, run migrations, and
//! consume the task queue until interrupted.
//!
//! Handler and definition registration is the embedding application's job;
//! this binary wires an empty registry pair and is mostly useful as the
//! skeleton an embedder copies.

use std::sync::Arc;

use anyhow::Context as _;
use tracing::info;

use conveyor_orchestration::orchestration::{TaskQueueProcessor, WorkflowCoordinator};
use conveyor_orchestration::telemetry;
use conveyor_shared::database::migrator::MIGRATOR;
use conveyor_shared::registry::{HandlerRegistry, TaskDefinitionRegistry};
use conveyor_shared::system_context::SystemContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let context = Arc::new(
        SystemContext::new()
            .await
            .context("failed to build system context")?,
    );

    MIGRATOR
        .run(context.database_pool())
        .await
        .context("failed to run migrations")?;

    context
        .message_client()
        .ensure_task_queue()
        .await
        .context("failed to create task queue")?;

    let handlers = Arc::new(HandlerRegistry::new());
    let definitions = Arc::new(TaskDefinitionRegistry::new());
    let coordinator = Arc::new(WorkflowCoordinator::new(
        context.clone(),
        handlers,
        definitions,
    ));
    let processor = TaskQueueProcessor::new(context.clone(), coordinator);

    info!(
        processor_id = %context.processor_id(),
        queue = context.message_client().task_queue(),
        provider = context.message_client().provider_name(),
        "Orchestrator started"
    );

    tokio::select! {
        _ = processor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received; stopping");
        }
    }
    Ok(())
}
