//! Handler registry: maps a job-type tag read from a payload prefix to a
//! user-registered [`JobHandler`]. The queue driver never inspects payload
//! bytes; decoding the tag is this layer's job.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use hb_postgres_common::jobs::{decode_tagged, encode_tagged};

/// A user-registered handler for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The tag this handler is registered under; must match what producers pass
    /// to [`encode_tagged`].
    fn job_type(&self) -> &str;

    /// Process one job's body. Errors are retried up to [`JobHandler::max_retry_count`]
    /// times before the job is marked `failed`.
    async fn handle(&self, body: &[u8]) -> Result<(), eyre::Error>;

    /// Number of retries (beyond the first attempt) before giving up.
    fn max_retry_count(&self) -> u32 {
        3
    }
}

/// Looks up a [`JobHandler`] by job-type tag.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl JobHandler + 'static) {
        self.handlers
            .insert(handler.job_type().to_owned(), Arc::new(handler));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        fn job_type(&self) -> &str {
            "noop"
        }

        async fn handle(&self, _body: &[u8]) -> Result<(), eyre::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(Noop);

        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }
}
