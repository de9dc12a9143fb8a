//! Task fixtures: a task row plus the transition chain that puts it in the
//! requested state.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::ConveyorResult;
use crate::models::core::task::{NewTask, Task};
use crate::models::core::task_transition::{NewTaskTransition, TaskTransition};
use crate::state_machine::states::TaskState;

use super::base::SqlxFactory;

#[derive(Debug, Clone)]
pub struct TaskFactory {
    named_task_id: i64,
    context: Option<Value>,
    correlation_id: Uuid,
    state: TaskState,
}

impl TaskFactory {
    pub fn new() -> Self {
        Self {
            named_task_id: 1,
            context: Some(json!({})),
            correlation_id: Uuid::now_v7(),
            state: TaskState::Pending,
        }
    }

    pub fn with_named_task_id(mut self, named_task_id: i64) -> Self {
        self.named_task_id = named_task_id;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn pending(mut self) -> Self {
        self.state = TaskState::Pending;
        self
    }

    pub fn in_progress(mut self) -> Self {
        self.state = TaskState::InProgress;
        self
    }
}

impl Default for TaskFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SqlxFactory<Task> for TaskFactory {
    async fn create(&self, pool: &PgPool) -> ConveyorResult<Task> {
        let task = Task::create(
            pool,
            NewTask {
                named_task_id: self.named_task_id,
                context: self.context.clone(),
                correlation_id: self.correlation_id,
            },
        )
        .await?;

        TaskTransition::create(
            pool,
            NewTaskTransition {
                task_id: task.task_id,
                from_state: None,
                to_state: TaskState::Pending.to_string(),
                metadata: None,
            },
        )
        .await?;

        if self.state == TaskState::InProgress {
            TaskTransition::create(
                pool,
                NewTaskTransition {
                    task_id: task.task_id,
                    from_state: Some(TaskState::Pending.to_string()),
                    to_state: TaskState::InProgress.to_string(),
                    metadata: None,
                },
            )
            .await?;
        }

        Ok(task)
    }
}
