//! Persistence collaborators. Every call is best-effort: callers log failures
//! and carry on.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::types::PlayerResult;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait GameStore: Send + Sync {
    /// Durable copy of a room keyed by its code, expiring after `ttl`.
    async fn backup_game(&self, code: &str, snapshot: &serde_json::Value, ttl: Duration) -> Result<(), StoreError>;

    async fn save_results(&self, code: &str, results: &[PlayerResult]) -> Result<(), StoreError>;

    /// Bumps the approval counter for a community-approved word and returns it.
    async fn record_word_approval(&self, language: &str, word: &str) -> Result<u64, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    backups: DashMap<String, (serde_json::Value, Instant)>,
    results: DashMap<String, Vec<String>>,
    approvals: DashMap<(String, String), u64>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn backup(&self, code: &str) -> Option<serde_json::Value> {
        let entry = self.backups.get(code)?;
        let (snapshot, expires_at) = entry.value();
        (Instant::now() < *expires_at).then(|| snapshot.clone())
    }

    /// Saved result sets for a room, oldest first, as JSON.
    pub fn results(&self, code: &str) -> Vec<String> {
        self.results.get(code).map(|r| r.clone()).unwrap_or_default()
    }

    pub fn approvals(&self, language: &str, word: &str) -> u64 {
        self.approvals
            .get(&(language.to_string(), word.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn backup_game(&self, code: &str, snapshot: &serde_json::Value, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        self.backups.retain(|_, (_, expires_at)| *expires_at > now);
        self.backups
            .insert(code.to_string(), (snapshot.clone(), now + ttl));
        Ok(())
    }

    async fn save_results(&self, code: &str, results: &[PlayerResult]) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(results)?;
        self.results.entry(code.to_string()).or_default().push(encoded);
        Ok(())
    }

    async fn record_word_approval(&self, language: &str, word: &str) -> Result<u64, StoreError> {
        let mut count = self
            .approvals
            .entry((language.to_string(), word.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }
}
