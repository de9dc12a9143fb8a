//! Startup-time registries: step handlers and task definitions.

pub mod handler_registry;
pub mod task_definition;

pub use handler_registry::{
    handler_fn, HandlerFailure, HandlerRegistry, StepHandler, StepHandlerInput, StepMetadata,
};
pub use task_definition::{StepTemplate, TaskDefinition, TaskDefinitionRegistry};
