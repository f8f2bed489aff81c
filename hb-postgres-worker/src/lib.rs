//! Worker Pool: handler registry, retry/backoff, and the claim loop that drives
//! `hb_postgres_common::jobs::QueueDriver`.

pub mod config;
pub mod error;
pub mod handlers;
pub mod worker;
