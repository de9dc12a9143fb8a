//! Database access: the embedded migrator and the SQL function executor that
//! fronts the readiness engine.

pub mod migrator;
pub mod sql_functions;

pub use sql_functions::SqlFunctionExecutor;
