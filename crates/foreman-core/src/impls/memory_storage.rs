//! In-memory key-ordered storage backend.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::EngineError;
use crate::ports::Storage;

/// `BTreeMap` behind a mutex. The default backend; also what the queue's
/// recovery tests run against.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let map = self.map.lock().await;
        Ok(map.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EngineError> {
        let mut map = self.map.lock().await;
        map.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let mut map = self.map.lock().await;
        map.remove(key);
        Ok(())
    }

    async fn scan_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, EngineError> {
        let map = self.map.lock().await;
        let range = (
            Bound::Included(start.to_string()),
            Bound::Excluded(end.to_string()),
        );
        Ok(map
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
