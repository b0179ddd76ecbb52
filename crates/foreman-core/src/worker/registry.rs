//! Registry of workers (kind -> worker).
//!
//! Design:
//! - Built during initialization (mutable).
//! - Used during runtime (immutable).
//! This keeps the dispatch path lock-free.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::EngineError;
use crate::worker::JobWorker;

#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn JobWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker under its own `worker_type`. Exactly one worker per
    /// kind; duplicates are an error.
    pub fn register(&mut self, worker: Arc<dyn JobWorker>) -> Result<(), EngineError> {
        let kind = worker.worker_type().to_string();
        if self.workers.contains_key(&kind) {
            return Err(EngineError::DuplicateWorker(kind));
        }
        self.workers.insert(kind, worker);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn JobWorker>> {
        self.workers.get(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobRecord, WorkerError};
    use crate::worker::JobContext;
    use async_trait::async_trait;

    struct NoopWorker;

    #[async_trait]
    impl JobWorker for NoopWorker {
        fn worker_type(&self) -> &str {
            "noop"
        }

        fn validate(&self, _job: &JobRecord) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn execute(&self, _ctx: &JobContext, _job: &JobRecord) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(NoopWorker)).unwrap();

        let err = registry.register(Arc::new(NoopWorker)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateWorker(kind) if kind == "noop"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noop").is_some());
    }
}
