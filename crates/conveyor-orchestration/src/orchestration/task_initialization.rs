//! Task initializer: materialize a registered definition into task, step,
//! and edge rows, atomically, with the initial pending transitions.
//!
//! Acyclicity is enforced here, before any row is written — the readiness
//! engine assumes the edge set of every task is a DAG. Context validation
//! against the definition's schema (when one is declared) also happens here,
//! so a malformed task fails fast instead of failing its first step.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use conveyor_shared::errors::{OrchestrationError, OrchestrationResult};
use conveyor_shared::messaging::EnqueueReason;
use conveyor_shared::models::{
    NewTask, NewTaskTransition, NewWorkflowStep, NewWorkflowStepTransition, Task, TaskTransition,
    WorkflowStep, WorkflowStepEdge, WorkflowStepTransition,
};
use conveyor_shared::registry::{TaskDefinition, TaskDefinitionRegistry};
use conveyor_shared::system_context::SystemContext;

#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task_id: i64,
    pub correlation_id: Uuid,
    /// Step ids keyed by step name, in case the caller wants to watch
    /// specific steps.
    pub step_ids: HashMap<String, i64>,
}

#[derive(Debug, Clone)]
pub struct TaskInitializer {
    context: Arc<SystemContext>,
    definitions: Arc<TaskDefinitionRegistry>,
}

impl TaskInitializer {
    pub fn new(context: Arc<SystemContext>, definitions: Arc<TaskDefinitionRegistry>) -> Self {
        Self {
            context,
            definitions,
        }
    }

    /// Create a task from a registered definition and enqueue its first
    /// processing message.
    pub async fn create_task(
        &self,
        named_task_id: i64,
        task_context: Value,
    ) -> OrchestrationResult<CreatedTask> {
        let definition = self
            .definitions
            .get(named_task_id)
            .ok_or(OrchestrationError::DefinitionNotFound(named_task_id))?;

        definition.validate()?;
        self.validate_context(&definition, &task_context)?;

        let correlation_id = Uuid::now_v7();
        let mut tx = self.context.database_pool().begin().await?;

        let task = Task::create(
            &mut *tx,
            NewTask {
                named_task_id,
                context: Some(task_context),
                correlation_id,
            },
        )
        .await?;

        let mut step_ids: HashMap<String, i64> = HashMap::with_capacity(definition.steps.len());
        for template in &definition.steps {
            let step = WorkflowStep::create(
                &mut *tx,
                NewWorkflowStep {
                    task_id: task.task_id,
                    named_step_id: template.named_step_id,
                    name: template.name.clone(),
                    retry_limit: template.retry_limit,
                    retryable: template.retryable,
                    inputs: template.handler_config.clone(),
                },
            )
            .await?;
            step_ids.insert(template.name.clone(), step.workflow_step_id);
        }

        for template in &definition.steps {
            let child_id = step_ids[&template.name];
            for parent_name in &template.depends_on {
                // validate() guarantees the name resolves.
                let parent_id = step_ids[parent_name];
                WorkflowStepEdge::create(&mut *tx, parent_id, child_id).await?;
            }
        }

        TaskTransition::create_in(
            &mut tx,
            NewTaskTransition {
                task_id: task.task_id,
                from_state: None,
                to_state: "pending".to_string(),
                metadata: None,
            },
        )
        .await?;
        for step_id in step_ids.values() {
            WorkflowStepTransition::create_in(
                &mut tx,
                NewWorkflowStepTransition {
                    workflow_step_id: *step_id,
                    from_state: None,
                    to_state: "pending".to_string(),
                    metadata: None,
                },
            )
            .await?;
        }

        tx.commit().await?;

        self.context
            .message_client()
            .enqueue_task(
                task.task_id,
                EnqueueReason::Initial,
                None,
                Some(correlation_id),
            )
            .await
            .map_err(|e| OrchestrationError::MessagingError(e.to_string()))?;

        info!(
            task_id = task.task_id,
            correlation_id = %correlation_id,
            definition = %definition.name,
            steps = step_ids.len(),
            "Task created and enqueued"
        );
        Ok(CreatedTask {
            task_id: task.task_id,
            correlation_id,
            step_ids,
        })
    }

    fn validate_context(
        &self,
        definition: &TaskDefinition,
        task_context: &Value,
    ) -> OrchestrationResult<()> {
        let Some(schema) = &definition.task_context_schema else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(schema).map_err(|e| {
            OrchestrationError::ContextValidation(format!(
                "invalid context schema on definition '{}': {e}",
                definition.name
            ))
        })?;
        if !validator.is_valid(task_context) {
            return Err(OrchestrationError::ContextValidation(format!(
                "task context does not satisfy the schema of definition '{}'",
                definition.name
            )));
        }
        Ok(())
    }
}
