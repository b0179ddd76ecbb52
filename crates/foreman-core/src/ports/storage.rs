//! Storage port: abstract key-ordered storage.
//!
//! The queue, job and log stores persist through this interface and never
//! prescribe an on-disk format. Keys are ASCII, `/`-segmented, and sort
//! lexicographically in the order the stores rely on (zero-padded sequence
//! numbers, fixed-width ULIDs).

use async_trait::async_trait;

use crate::domain::EngineError;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EngineError>;

    async fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// All `(key, value)` pairs with `start <= key < end`, ascending by key.
    async fn scan_range(&self, start: &str, end: &str)
    -> Result<Vec<(String, Vec<u8>)>, EngineError>;
}

/// Half-open range covering every key that begins with `prefix`.
/// Valid because engine keys only use ASCII below `~`.
pub fn prefix_range(prefix: &str) -> (String, String) {
    (prefix.to_string(), format!("{prefix}~"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_brackets_the_prefix() {
        let (start, end) = prefix_range("logs/step-A/");
        assert!(start < end);
        assert!("logs/step-A/0000000001".to_string() >= start);
        assert!("logs/step-A/0000000001".to_string() < end);
        assert!("logs/step-B/0000000001".to_string() >= end);
    }
}
