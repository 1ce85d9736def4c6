//! C2: the processed-email dedup registry. Persisted records live in the
//! document warehouse; an in-process LRU caches terminal-success lookups
//! so a hot scan loop doesn't round-trip to Mongo for emails it just
//! marked itself.

use std::{num::NonZeroUsize, sync::Mutex};

use async_trait::async_trait;
use cuenly_common::model::ProcessedStatus;
use lru::LruCache;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum Error {
    #[error("registry backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// The persistence surface this module needs from the document warehouse.
/// Kept narrow and backend-agnostic so tests can supply an in-memory fake.
#[async_trait]
pub trait ProcessedEmailBackend: Send + Sync {
    async fn lookup(&self, key: &str) -> anyhow::Result<Option<ProcessedStatus>>;
    async fn upsert(
        &self,
        key: &str,
        status: ProcessedStatus,
        reason: Option<&str>,
        owner_email: &str,
        account: &str,
    ) -> anyhow::Result<()>;
    /// Atomic compare-and-set: inserts a `Pending` claim row if no row
    /// exists yet for `key`, or flips an existing row back to `Pending` if
    /// its status is [`ProcessedStatus::is_reclaimable`] (an AI-quota skip
    /// or a transient failure). A row left `Pending`/`Processing` (another
    /// claim still in flight) or in a permanent status (`Done`,
    /// `MissingMetadata`) never matches. Returns `true` if this call won
    /// the claim.
    async fn try_claim(&self, key: &str, owner_email: &str, account: &str) -> anyhow::Result<bool>;
    async fn set_message_id(&self, key: &str, message_id: &str) -> anyhow::Result<()>;
    async fn lookup_by_message_id(
        &self,
        message_id: &str,
    ) -> anyhow::Result<Option<ProcessedStatus>>;
    /// Deletes `key`'s row outright, so a future scan can claim it again.
    /// Used after a transient (retryable) processing failure — a
    /// permanent skip or success instead calls `upsert` with a terminal
    /// status, never this.
    async fn release_claim(&self, key: &str) -> anyhow::Result<()>;
}

/// Only terminal-success statuses are cacheable: anything else (skipped
/// for AI quota, duplicate, missing attachment) must be re-checked against
/// the backend every time, since those conditions can change between
/// scans (quota resets, a retry succeeds).
fn is_cacheable(status: ProcessedStatus) -> bool {
    status.is_terminal_success()
}

pub struct ProcessedEmailRegistry<B: ProcessedEmailBackend> {
    backend: B,
    cache: Mutex<LruCache<String, ProcessedStatus>>,
}

impl<B: ProcessedEmailBackend> ProcessedEmailRegistry<B> {
    pub fn new(backend: B, cache_capacity: NonZeroUsize) -> Self {
        Self {
            backend,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// Returns whether `key` has already been durably processed. A
    /// `skipped_ai_limit*` status does NOT count as processed: the
    /// scanner must retry those emails once quota is available again.
    #[instrument(skip(self))]
    pub async fn was_processed(&self, key: &str) -> Result<bool, Error> {
        if let Some(status) = self.cache.lock().unwrap().get(key).copied() {
            return Ok(is_cacheable(status));
        }

        let status = self.backend.lookup(key).await?;
        Ok(match status {
            Some(status) if is_cacheable(status) => {
                self.cache.lock().unwrap().put(key.to_string(), status);
                true
            }
            Some(_) | None => false,
        })
    }

    #[instrument(skip(self))]
    pub async fn mark_processed(
        &self,
        key: &str,
        status: ProcessedStatus,
        reason: Option<&str>,
        owner_email: &str,
        account: &str,
    ) -> Result<(), Error> {
        self.backend
            .upsert(key, status, reason, owner_email, account)
            .await?;
        if is_cacheable(status) {
            self.cache
                .lock()
                .unwrap()
                .put(key.to_string(), status);
        } else {
            self.cache.lock().unwrap().pop(key);
        }
        Ok(())
    }

    /// Atomically claims `key` for processing so two concurrent workers
    /// don't both act on the same email. Returns `false` if another
    /// worker already holds (or finished) the claim.
    #[instrument(skip(self))]
    pub async fn claim_for_processing(
        &self,
        key: &str,
        owner_email: &str,
        account: &str,
    ) -> Result<bool, Error> {
        Ok(self.backend.try_claim(key, owner_email, account).await?)
    }

    /// Releases a claim after a transient failure so the key is eligible
    /// to be claimed and retried on the next scan. Never used for a
    /// permanent skip or success — those call `mark_processed` instead.
    #[instrument(skip(self))]
    pub async fn release_claim(&self, key: &str) -> Result<(), Error> {
        self.backend.release_claim(key).await?;
        self.cache.lock().unwrap().pop(key);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_message_id(&self, key: &str, message_id: &str) -> Result<(), Error> {
        self.backend.set_message_id(key, message_id).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn was_processed_by_message_id(&self, message_id: &str) -> Result<bool, Error> {
        let status = self.backend.lookup_by_message_id(message_id).await?;
        Ok(matches!(status, Some(status) if is_cacheable(status)))
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, sync::Mutex as StdMutex};

    use super::*;

    #[derive(Default)]
    struct FakeBackend {
        rows: StdMutex<HashMap<String, (ProcessedStatus, String)>>,
        by_message_id: StdMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl ProcessedEmailBackend for FakeBackend {
        async fn lookup(&self, key: &str) -> anyhow::Result<Option<ProcessedStatus>> {
            Ok(self.rows.lock().unwrap().get(key).map(|(s, _)| *s))
        }

        async fn upsert(
            &self,
            key: &str,
            status: ProcessedStatus,
            _reason: Option<&str>,
            _owner_email: &str,
            _account: &str,
        ) -> anyhow::Result<()> {
            self.rows
                .lock()
                .unwrap()
                .insert(key.to_string(), (status, key.to_string()));
            Ok(())
        }

        async fn try_claim(
            &self,
            key: &str,
            _owner_email: &str,
            _account: &str,
        ) -> anyhow::Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            match rows.get(key).map(|(status, _)| *status) {
                None => {
                    rows.insert(key.to_string(), (ProcessedStatus::Pending, key.to_string()));
                    Ok(true)
                }
                Some(status) if status.is_reclaimable() => {
                    rows.insert(key.to_string(), (ProcessedStatus::Pending, key.to_string()));
                    Ok(true)
                }
                Some(_) => Ok(false),
            }
        }

        async fn release_claim(&self, key: &str) -> anyhow::Result<()> {
            self.rows.lock().unwrap().remove(key);
            Ok(())
        }

        async fn set_message_id(&self, key: &str, message_id: &str) -> anyhow::Result<()> {
            self.by_message_id
                .lock()
                .unwrap()
                .insert(message_id.to_string(), key.to_string());
            Ok(())
        }

        async fn lookup_by_message_id(
            &self,
            message_id: &str,
        ) -> anyhow::Result<Option<ProcessedStatus>> {
            let Some(key) = self.by_message_id.lock().unwrap().get(message_id).cloned() else {
                return Ok(None);
            };
            self.lookup(&key).await
        }
    }

    #[tokio::test]
    async fn unprocessed_key_returns_false() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        assert!(!registry.was_processed("k1").await.unwrap());
    }

    #[tokio::test]
    async fn ai_limit_skip_is_not_terminal() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        registry
            .mark_processed(
                "k1",
                ProcessedStatus::SkippedAiLimit,
                None,
                "owner@example.com",
                "acct",
            )
            .await
            .unwrap();
        assert!(!registry.was_processed("k1").await.unwrap());
    }

    #[tokio::test]
    async fn done_is_terminal_and_cached() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        registry
            .mark_processed("k1", ProcessedStatus::Done, None, "owner@example.com", "acct")
            .await
            .unwrap();
        assert!(registry.was_processed("k1").await.unwrap());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        assert!(registry
            .claim_for_processing("k1", "owner@example.com", "acct")
            .await
            .unwrap());
        assert!(!registry
            .claim_for_processing("k1", "owner@example.com", "acct")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ai_limit_skip_can_be_reclaimed_without_explicit_release() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        registry
            .mark_processed(
                "k1",
                ProcessedStatus::SkippedAiLimitUnread,
                Some("AI quota exhausted"),
                "owner@example.com",
                "acct",
            )
            .await
            .unwrap();
        assert!(registry
            .claim_for_processing("k1", "owner@example.com", "acct")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_metadata_skip_is_permanent() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        registry
            .mark_processed(
                "k1",
                ProcessedStatus::MissingMetadata,
                Some("no pdf/xml attachment found"),
                "owner@example.com",
                "acct",
            )
            .await
            .unwrap();
        assert!(!registry
            .claim_for_processing("k1", "owner@example.com", "acct")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn released_claim_can_be_reclaimed() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        assert!(registry
            .claim_for_processing("k1", "owner@example.com", "acct")
            .await
            .unwrap());
        registry.release_claim("k1").await.unwrap();
        assert!(registry
            .claim_for_processing("k1", "owner@example.com", "acct")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn message_id_lookup_follows_the_claimed_key() {
        let registry =
            ProcessedEmailRegistry::new(FakeBackend::default(), NonZeroUsize::new(16).unwrap());
        registry
            .mark_processed("k1", ProcessedStatus::Done, None, "owner@example.com", "acct")
            .await
            .unwrap();
        registry.set_message_id("k1", "<msg-1>").await.unwrap();
        assert!(registry
            .was_processed_by_message_id("<msg-1>")
            .await
            .unwrap());
    }
}
