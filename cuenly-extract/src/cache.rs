//! C13: a Redis-keyed, hash-addressed cache for vision-extraction results.
//! Reads never fail the caller (any error is a cache miss); writes are
//! best-effort.

use std::time::Duration;

use redis::AsyncCommands;
use serde_json::Value;
use tracing::{instrument, warn};

const TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const KEY_PREFIX: &str = "cuenly:openai:cache:";

pub struct ResultCache {
    client: redis::Client,
}

impl ResultCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn key_for(identifier: &str) -> String {
        let digest = md5::compute(identifier.as_bytes());
        format!("{KEY_PREFIX}{digest:x}")
    }

    /// Looks up a cached extraction by content-hash or path `identifier`.
    /// Any Redis or deserialization error is treated as a cache miss.
    #[instrument(skip(self))]
    pub async fn get(&self, identifier: &str) -> Option<Value> {
        let result: anyhow::Result<Option<Value>> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let raw: Option<String> = conn.get(Self::key_for(identifier)).await?;
            let Some(raw) = raw else { return Ok(None) };
            Ok(Some(serde_json::from_str(&raw)?))
        }
        .await;

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Stores an extraction result tagged with `_cache_source`/`_cache_key`
    /// metadata, with a 7-day TTL. Failures are logged and swallowed.
    #[instrument(skip(self, extraction))]
    pub async fn put(&self, identifier: &str, source: &str, mut extraction: Value) {
        if let Value::Object(map) = &mut extraction {
            map.insert("_cache_source".to_string(), Value::String(source.to_string()));
            map.insert(
                "_cache_key".to_string(),
                Value::String(Self::key_for(identifier)),
            );
        }

        let result: anyhow::Result<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let serialized = serde_json::to_string(&extraction)?;
            conn.set_ex::<_, _, ()>(Self::key_for(identifier), serialized, TTL.as_secs())
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "cache write failed (non-fatal)");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_for_is_stable_md5_of_identifier() {
        let a = ResultCache::key_for("/tmp/invoice.pdf");
        let b = ResultCache::key_for("/tmp/invoice.pdf");
        let c = ResultCache::key_for("/tmp/other.pdf");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(KEY_PREFIX));
    }
}
