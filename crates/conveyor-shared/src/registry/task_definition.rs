//! Task definitions: the per-template shape of a workflow.
//!
//! Loading definitions from declarative sources is outside the core; the
//! embedding application constructs these at startup (however it likes) and
//! registers them by `named_task_id`. The initializer materializes a
//! definition into task/step/edge rows, and the executor consults it for
//! concurrency, handler references, and timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{OrchestrationError, OrchestrationResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub named_step_id: i64,
    pub name: String,
    /// Handler name resolved against the definition's namespace.
    pub handler: String,
    pub depends_on: Vec<String>,
    pub retry_limit: i32,
    pub retryable: bool,
    pub timeout_seconds: Option<u64>,
    pub handler_config: Option<Value>,
}

impl StepTemplate {
    pub fn new(named_step_id: i64, name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            named_step_id,
            name: name.into(),
            handler: handler.into(),
            depends_on: Vec::new(),
            retry_limit: 3,
            retryable: true,
            timeout_seconds: None,
            handler_config: None,
        }
    }

    pub fn depends_on(mut self, parents: &[&str]) -> Self {
        self.depends_on = parents.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_handler_config(mut self, config: Value) -> Self {
        self.handler_config = Some(config);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub named_task_id: i64,
    pub namespace: String,
    pub name: String,
    /// Run independent ready steps in parallel when true; otherwise one at a
    /// time in dependency-level order.
    pub concurrent: bool,
    /// Sequential mode only: stop a batch at the first failure instead of
    /// attempting the remaining siblings.
    pub halt_on_first_failure: bool,
    /// Optional JSON Schema the task context must satisfy at creation.
    pub task_context_schema: Option<Value>,
    pub steps: Vec<StepTemplate>,
}

impl TaskDefinition {
    pub fn new(
        named_task_id: i64,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            named_task_id,
            namespace: namespace.into(),
            name: name.into(),
            concurrent: false,
            halt_on_first_failure: false,
            task_context_schema: None,
            steps: Vec::new(),
        }
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    pub fn halt_on_first_failure(mut self) -> Self {
        self.halt_on_first_failure = true;
        self
    }

    pub fn with_context_schema(mut self, schema: Value) -> Self {
        self.task_context_schema = Some(schema);
        self
    }

    pub fn with_step(mut self, step: StepTemplate) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validate that `depends_on` references resolve and the edge set forms a
    /// DAG (Kahn's algorithm).
    pub fn validate(&self) -> OrchestrationResult<()> {
        let names: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        if names.len() != self.steps.len() {
            return Err(OrchestrationError::CycleDetected(format!(
                "duplicate step names in definition '{}'",
                self.name
            )));
        }

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (idx, step) in self.steps.iter().enumerate() {
            for parent in &step.depends_on {
                let parent_idx = names.get(parent.as_str()).ok_or_else(|| {
                    OrchestrationError::CycleDetected(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, parent
                    ))
                })?;
                children[*parent_idx].push(idx);
                in_degree[idx] += 1;
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for child in &children[node] {
                in_degree[*child] -= 1;
                if in_degree[*child] == 0 {
                    queue.push_back(*child);
                }
            }
        }

        if visited != self.steps.len() {
            return Err(OrchestrationError::CycleDetected(format!(
                "definition '{}' contains a dependency cycle",
                self.name
            )));
        }
        Ok(())
    }
}

/// In-process registry of task definitions keyed by `named_task_id`.
/// Populated at startup; mutation is initialization-time only.
#[derive(Debug, Default)]
pub struct TaskDefinitionRegistry {
    definitions: HashMap<i64, Arc<TaskDefinition>>,
}

impl TaskDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, validating its DAG first.
    pub fn register(&mut self, definition: TaskDefinition) -> OrchestrationResult<()> {
        definition.validate()?;
        self.definitions
            .insert(definition.named_task_id, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, named_task_id: i64) -> Option<Arc<TaskDefinition>> {
        self.definitions.get(&named_task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
