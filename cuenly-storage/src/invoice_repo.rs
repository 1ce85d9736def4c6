//! C9: the invoice document warehouse. Resolves a stable header id for an
//! extracted invoice, applies the source-priority upsert rule, and
//! declares the indexes the warehouse needs to serve lookups cheaply.

use async_trait::async_trait;
use cuenly_common::model::{InvoiceHeader, SourceTag};
use regex::Regex;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum Error {
    #[error("warehouse backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// A header already stored in the warehouse, as seen by the upsert path.
#[derive(Clone, Debug)]
pub struct ExistingHeader {
    pub id: String,
    pub source: SourceTag,
    pub minio_key: Option<String>,
}

/// The narrow persistence surface this module needs from the document
/// warehouse (a MongoDB collection in production).
#[async_trait]
pub trait InvoiceBackend: Send + Sync {
    async fn find_by_owner_and_cdc(
        &self,
        owner_email: &str,
        cdc: &str,
    ) -> anyhow::Result<Option<ExistingHeader>>;
    async fn find_by_owner_and_message_id(
        &self,
        owner_email: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<ExistingHeader>>;
    async fn upsert_header(
        &self,
        id: &str,
        header: &InvoiceHeader,
        minio_key: Option<&str>,
    ) -> anyhow::Result<()>;
    async fn ensure_indexes(&self) -> anyhow::Result<()>;
}

pub struct InvoiceRepository<B: InvoiceBackend> {
    backend: B,
}

/// Extracts every run of 44 consecutive ASCII digits from `s` — the shape
/// an existing `minio_key` path segment takes when it embeds a CDC.
fn extract_44_digit_tokens(s: &str) -> Vec<&str> {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\d{44}").expect("valid regex"));
    re.find_iter(s).map(|m| m.as_str()).collect()
}

impl<B: InvoiceBackend> InvoiceRepository<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    #[instrument(skip(self))]
    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        self.backend.ensure_indexes().await?;
        Ok(())
    }

    /// Resolves the stable header id for an invoice, in priority order:
    /// `(owner, cdc)` when a CDC is known, else `(owner, message_id)` when
    /// an email message id is known, else a freshly-minted
    /// `<owner>:<extraction_id>` id for CDC-less, message-id-less vision
    /// extractions that can't be deduplicated any other way.
    #[instrument(skip(self, header))]
    pub async fn resolve_header_id(
        &self,
        owner_email: &str,
        header: &InvoiceHeader,
        extraction_id: &str,
    ) -> Result<(String, Option<ExistingHeader>), Error> {
        if let Some(cdc) = &header.cdc {
            if let Some(existing) = self
                .backend
                .find_by_owner_and_cdc(owner_email, cdc.as_str())
                .await?
            {
                return Ok((existing.id.clone(), Some(existing)));
            }
            return Ok((format!("{owner_email}:{}", cdc.as_str()), None));
        }

        if let Some(message_id) = &header.email_message_id {
            if let Some(existing) = self
                .backend
                .find_by_owner_and_message_id(owner_email, message_id)
                .await?
            {
                return Ok((existing.id.clone(), Some(existing)));
            }
            return Ok((format!("{owner_email}:{message_id}"), None));
        }

        Ok((format!("{owner_email}:{extraction_id}"), None))
    }

    /// Applies the source-priority upsert rule: an incoming header is
    /// written unless an existing record outranks it. Equal priority is
    /// allowed to overwrite (a re-run of the same source refreshing its
    /// own data); only a STRICTLY LOWER incoming priority is skipped.
    ///
    /// When an existing `minio_key` already embeds this invoice's CDC (as
    /// one of its 44-digit tokens), it is preserved across the overwrite
    /// even if the incoming write carries no `minio_key` of its own —
    /// vision/email sources often don't have an artifact to attach.
    #[instrument(skip(self, header))]
    pub async fn upsert_header(
        &self,
        owner_email: &str,
        header: &InvoiceHeader,
        extraction_id: &str,
        incoming_minio_key: Option<&str>,
    ) -> Result<UpsertOutcome, Error> {
        let (id, existing) = self
            .resolve_header_id(owner_email, header, extraction_id)
            .await?;

        if let Some(existing) = &existing {
            if header.source.priority() < existing.source.priority() {
                return Ok(UpsertOutcome::SkippedLowerPriority { id });
            }
        }

        let minio_key = incoming_minio_key
            .map(str::to_string)
            .or_else(|| preserve_minio_key(existing.as_ref(), header));

        self.backend
            .upsert_header(&id, header, minio_key.as_deref())
            .await?;

        Ok(UpsertOutcome::Written { id })
    }
}

fn preserve_minio_key(existing: Option<&ExistingHeader>, header: &InvoiceHeader) -> Option<String> {
    let existing = existing?;
    let key = existing.minio_key.as_ref()?;
    let cdc = header.cdc?;
    if extract_44_digit_tokens(key).iter().any(|t| *t == cdc.as_str()) {
        Some(key.clone())
    } else {
        None
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpsertOutcome {
    Written { id: String },
    SkippedLowerPriority { id: String },
}

/// The index set the warehouse's invoice collection must have, created
/// idempotently at startup via [`InvoiceBackend::ensure_indexes`].
pub mod indexes {
    /// `(owner_email, cdc)`, unique, partial on `cdc` existing (vision
    /// extractions with no CDC yet must not collide on a shared null).
    pub const OWNER_CDC_PARTIAL_UNIQUE: &str = "owner_email_1_cdc_1_partial_unique";
    pub const OWNER_MESSAGE_ID: &str = "owner_email_1_message_id_1";
    pub const OWNER_FECHA_EMISION_DESC: &str = "owner_email_1_fecha_emision_-1";
    pub const FUENTE: &str = "fuente_1";
    pub const MES_PROCESO: &str = "mes_proceso_1";
    pub const EMISOR_RUC: &str = "emisor.ruc_1";
    pub const RECEPTOR_RUC: &str = "receptor.ruc_1";
    /// Items subdocuments are keyed `(header_id, linea)`, unique.
    pub const ITEMS_HEADER_LINEA_UNIQUE: &str = "items_header_id_1_linea_1_unique";
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, sync::Mutex};

    use chrono::NaiveDate;
    use cuenly_common::{model::TenantId, time::TimestampMillis};
    use rust_decimal::Decimal;

    use super::*;

    fn header(source: SourceTag, cdc: Option<&str>) -> InvoiceHeader {
        InvoiceHeader {
            tenant: TenantId("t1".to_string()),
            cdc: cdc.map(|c| cuenly_common::model::Cdc::parse(c).unwrap()),
            numero_factura: "001-001-0000123".to_string(),
            timbrado: "12345678".to_string(),
            ruc_emisor: "80012345-1".to_string(),
            razon_social_emisor: "Acme SA".to_string(),
            receptor_ruc: None,
            receptor_nombre: None,
            receptor_email: None,
            fecha: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            moneda: cuenly_common::model::Currency::Gs,
            tipo_cambio: Decimal::ONE,
            subtotal_exentas: Decimal::ZERO,
            subtotal_gravada_5: Decimal::ZERO,
            subtotal_gravada_10: Decimal::ZERO,
            iva_5: Decimal::ZERO,
            iva_10: Decimal::ZERO,
            total: Decimal::new(100_000, 0),
            descripcion_factura: "Venta de mercaderias".to_string(),
            items: vec![],
            source,
            email_message_id: None,
            minio_key: None,
            mes_proceso: "2024-01".to_string(),
            created_at: TimestampMillis::now(),
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        by_cdc: Mutex<HashMap<(String, String), ExistingHeader>>,
    }

    #[async_trait]
    impl InvoiceBackend for FakeBackend {
        async fn find_by_owner_and_cdc(
            &self,
            owner_email: &str,
            cdc: &str,
        ) -> anyhow::Result<Option<ExistingHeader>> {
            Ok(self
                .by_cdc
                .lock()
                .unwrap()
                .get(&(owner_email.to_string(), cdc.to_string()))
                .cloned())
        }

        async fn find_by_owner_and_message_id(
            &self,
            _owner_email: &str,
            _message_id: &str,
        ) -> anyhow::Result<Option<ExistingHeader>> {
            Ok(None)
        }

        async fn upsert_header(
            &self,
            id: &str,
            header: &InvoiceHeader,
            minio_key: Option<&str>,
        ) -> anyhow::Result<()> {
            if let Some(cdc) = &header.cdc {
                self.by_cdc.lock().unwrap().insert(
                    ("owner@example.com".to_string(), cdc.as_str().to_string()),
                    ExistingHeader {
                        id: id.to_string(),
                        source: header.source,
                        minio_key: minio_key.map(str::to_string),
                    },
                );
            }
            Ok(())
        }

        async fn ensure_indexes(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lower_priority_source_is_skipped() {
        let repo = InvoiceRepository::new(FakeBackend::default());
        let cdc = "1".repeat(44);

        let xml_header = header(SourceTag::XmlNativo, Some(&cdc));
        repo.upsert_header("owner@example.com", &xml_header, "e1", None)
            .await
            .unwrap();

        let vision_header = header(SourceTag::OpenaiVisionImage, Some(&cdc));
        let outcome = repo
            .upsert_header("owner@example.com", &vision_header, "e2", None)
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::SkippedLowerPriority { .. }));
    }

    #[tokio::test]
    async fn equal_priority_source_overwrites() {
        let repo = InvoiceRepository::new(FakeBackend::default());
        let cdc = "2".repeat(44);

        let first = header(SourceTag::OpenaiVision, Some(&cdc));
        repo.upsert_header("owner@example.com", &first, "e1", None)
            .await
            .unwrap();

        let second = header(SourceTag::OpenaiVision, Some(&cdc));
        let outcome = repo
            .upsert_header("owner@example.com", &second, "e2", None)
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Written { .. }));
    }

    #[tokio::test]
    async fn existing_minio_key_is_preserved_when_incoming_has_none() {
        let repo = InvoiceRepository::new(FakeBackend::default());
        let cdc = "3".repeat(44);

        let xml_header = header(SourceTag::XmlNativo, Some(&cdc));
        repo.upsert_header(
            "owner@example.com",
            &xml_header,
            "e1",
            Some(&format!("2024/owner/01/{cdc}.xml")),
        )
        .await
        .unwrap();

        let overwrite = header(SourceTag::XmlNativo, Some(&cdc));
        repo.upsert_header("owner@example.com", &overwrite, "e2", None)
            .await
            .unwrap();

        let stored = repo
            .backend
            .find_by_owner_and_cdc("owner@example.com", &cdc)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.minio_key.unwrap().contains(&cdc));
    }

    #[test]
    fn extract_44_digit_tokens_finds_embedded_cdc() {
        let cdc = "4".repeat(44);
        let path = format!("2024/owner/01/1200_{cdc}.xml");
        let tokens = extract_44_digit_tokens(&path);
        assert_eq!(tokens, vec![cdc.as_str()]);
    }
}
