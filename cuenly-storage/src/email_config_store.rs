//! C3: the encrypted per-tenant IMAP account config store. Secret fields
//! are enciphered at rest via [`cuenly_crypto::MasterKey`]; legacy
//! plaintext values are accepted on read and re-enciphered on next write.

use async_trait::async_trait;
use cuenly_common::model::{EmailConfig, TenantId};
use cuenly_crypto::MasterKey;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config store backend error: {0}")]
    Backend(#[from] anyhow::Error),
    #[error("stored secret could not be decrypted: {0}")]
    Decrypt(#[from] cuenly_crypto::DecryptError),
}

/// The persistence surface this module needs from the document warehouse.
#[async_trait]
pub trait EmailConfigBackend: Send + Sync {
    async fn list(&self, owner_email: &str) -> anyhow::Result<Vec<EmailConfig>>;
    /// All active configs across every tenant, used by the scheduler's
    /// fan-out to enumerate mailboxes without knowing tenants in advance.
    async fn list_all_active(&self) -> anyhow::Result<Vec<EmailConfig>>;
    async fn upsert(&self, config: &EmailConfig) -> anyhow::Result<()>;
    async fn ensure_indexes(&self) -> anyhow::Result<()>;
}

pub struct EmailConfigStore<B: EmailConfigBackend> {
    backend: B,
    master_key: MasterKey,
}

impl<B: EmailConfigBackend> EmailConfigStore<B> {
    pub fn new(backend: B, master_key: MasterKey) -> Self {
        Self {
            backend,
            master_key,
        }
    }

    #[instrument(skip(self))]
    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        self.backend.ensure_indexes().await?;
        Ok(())
    }

    /// Lists configs for `owner_email`. Secrets are never included unless
    /// `include_password` is set, matching the read surface's default.
    #[instrument(skip(self))]
    pub async fn list_configs(
        &self,
        owner_email: &str,
        include_password: bool,
    ) -> Result<Vec<EmailConfig>, Error> {
        let mut configs = self.backend.list(owner_email).await?;
        if !include_password {
            for config in &mut configs {
                config.secret_ciphertext.clear();
            }
        }
        Ok(configs)
    }

    /// Lists every active mailbox across all tenants, secrets stripped.
    /// Used by the fan-out sweep, which has no single owner to scope to.
    #[instrument(skip(self))]
    pub async fn list_all_active_configs(&self) -> Result<Vec<EmailConfig>, Error> {
        let mut configs = self.backend.list_all_active().await?;
        for config in &mut configs {
            config.secret_ciphertext.clear();
        }
        Ok(configs)
    }

    /// Decrypts a config's secret, re-enciphering and persisting it first
    /// if it is still in legacy plaintext form.
    #[instrument(skip(self, config))]
    pub async fn reveal_secret(
        &self,
        tenant: &TenantId,
        config: &mut EmailConfig,
    ) -> Result<cuenly_crypto::SecretString, Error> {
        let aad = tenant.0.as_bytes();

        if MasterKey::is_legacy_plaintext(&config.secret_ciphertext) {
            let plaintext = self
                .master_key
                .decrypt(aad, &config.secret_ciphertext)?;
            let plaintext_str = String::from_utf8_lossy(&plaintext).into_owned();
            config.secret_ciphertext = self.master_key.encrypt(aad, plaintext_str.as_bytes());
            self.backend.upsert(config).await?;
            return Ok(cuenly_crypto::SecretString::new(plaintext_str));
        }

        let plaintext = self.master_key.decrypt(aad, &config.secret_ciphertext)?;
        Ok(cuenly_crypto::SecretString::new(
            String::from_utf8_lossy(&plaintext).into_owned(),
        ))
    }

    /// Enciphers `secret` and stores it, enforcing the per-tenant
    /// `(owner_email, username)` uniqueness via the backend's upsert.
    #[instrument(skip(self, secret))]
    pub async fn save_secret(
        &self,
        tenant: &TenantId,
        mut config: EmailConfig,
        secret: &str,
    ) -> Result<(), Error> {
        config.secret_ciphertext = self.master_key.encrypt(tenant.0.as_bytes(), secret.as_bytes());
        self.backend.upsert(&config).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeBackend {
        rows: Mutex<Vec<EmailConfig>>,
    }

    #[async_trait]
    impl EmailConfigBackend for FakeBackend {
        async fn list(&self, owner_email: &str) -> anyhow::Result<Vec<EmailConfig>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.tenant.0 == owner_email)
                .cloned()
                .collect())
        }

        async fn list_all_active(&self) -> anyhow::Result<Vec<EmailConfig>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.active)
                .cloned()
                .collect())
        }

        async fn upsert(&self, config: &EmailConfig) -> anyhow::Result<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows
                .iter_mut()
                .find(|c| c.tenant == config.tenant && c.username == config.username)
            {
                *existing = config.clone();
            } else {
                rows.push(config.clone());
            }
            Ok(())
        }

        async fn ensure_indexes(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config(tenant: &str) -> EmailConfig {
        EmailConfig {
            tenant: TenantId(tenant.to_string()),
            host: "imap.example.com".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            secret_ciphertext: String::new(),
            use_oauth2: false,
            folder: "INBOX".to_string(),
            active: true,
            subject_terms: vec!["factura electronica".to_string()],
        }
    }

    #[tokio::test]
    async fn list_configs_omits_secret_by_default() {
        let store = EmailConfigStore::new(FakeBackend::default(), MasterKey::derive(b"k"));
        let tenant = TenantId("t1".to_string());
        store
            .save_secret(&tenant, config("t1"), "app-password")
            .await
            .unwrap();

        let configs = store.list_configs("t1", false).await.unwrap();
        assert_eq!(configs.len(), 1);
        assert!(configs[0].secret_ciphertext.is_empty());
    }

    #[tokio::test]
    async fn reveal_secret_roundtrips_through_encryption() {
        let store = EmailConfigStore::new(FakeBackend::default(), MasterKey::derive(b"k"));
        let tenant = TenantId("t1".to_string());
        store
            .save_secret(&tenant, config("t1"), "app-password")
            .await
            .unwrap();

        let mut configs = store.list_configs("t1", true).await.unwrap();
        let secret = store.reveal_secret(&tenant, &mut configs[0]).await.unwrap();
        assert_eq!(secret.expose(), "app-password");
    }

    #[tokio::test]
    async fn legacy_plaintext_secret_is_reenciphered_on_reveal() {
        use base64::Engine;

        let backend = FakeBackend::default();
        let mut legacy = config("t1");
        // A genuine legacy-plaintext ciphertext: version byte 0 + raw bytes.
        let mut raw = vec![0u8];
        raw.extend_from_slice(b"legacy-password");
        legacy.secret_ciphertext = base64::engine::general_purpose::STANDARD.encode(raw);
        backend.upsert(&legacy).await.unwrap();

        let store = EmailConfigStore::new(backend, MasterKey::derive(b"k"));
        let tenant = TenantId("t1".to_string());
        let mut configs = store.list_configs("t1", true).await.unwrap();
        assert!(MasterKey::is_legacy_plaintext(&configs[0].secret_ciphertext));

        let secret = store.reveal_secret(&tenant, &mut configs[0]).await.unwrap();
        assert_eq!(secret.expose(), "legacy-password");

        let configs_after = store.list_configs("t1", true).await.unwrap();
        assert!(!MasterKey::is_legacy_plaintext(
            &configs_after[0].secret_ciphertext
        ));
    }
}
