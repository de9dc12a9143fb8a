//! Embedded sqlx migrator; integration tests attach it via
//! `#[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]`
//! and the orchestrator binary runs it at startup.

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
