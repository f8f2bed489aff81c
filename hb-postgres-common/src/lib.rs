//! # hb-postgres-common
//!
//! Shared building blocks for Postgres-backed infrastructure: a connection
//! gateway, a migration ledger and reconciliation engine, a TTL-aware
//! key/value persist store, and a durable job queue with `FOR UPDATE SKIP
//! LOCKED` claim semantics.

pub mod error;
pub mod gateway;
pub mod jobs;
pub mod metrics;
pub mod migrations;
pub mod persist;
pub mod retry;

pub use gateway::{PgGateway, PgGatewayError};
pub use migrations::engine::{MigrationEngine, MigrationError};
pub use migrations::{MigrationDescriptor, MigrationGroup};
