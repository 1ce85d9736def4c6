//! The shared data model: invoice headers/items, email configuration,
//! the processed-email registry entry, subscriptions, users, and queue jobs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::time::TimestampMillis;

/// A tenant-scoped identifier. Newtype over [`String`] so call sites can't
/// accidentally pass a raw email address or CDC where a tenant id is
/// expected.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The 44-digit Paraguayan fiscal control code (`Código de Control`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cdc(pub [u8; 44]);

impl Cdc {
    /// Parses a CDC from its ASCII-digit string form.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 44 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let mut out = [0u8; 44];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: `parse` only constructs this from ASCII digits.
        std::str::from_utf8(&self.0).expect("CDC is always ASCII")
    }

    /// Bytes 10..18 of the CDC encode the issuance date as `YYYYMMDD`.
    pub fn embedded_date_digits(&self) -> &str {
        std::str::from_utf8(&self.0[10..18]).expect("CDC is always ASCII")
    }
}

/// The currency an invoice total is denominated in.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Currency {
    /// Paraguayan guaraní, the overwhelmingly common case.
    #[serde(rename = "PYG")]
    Gs,
    #[serde(rename = "USD")]
    Usd,
    /// Any other ISO-4217-ish literal encountered in source documents,
    /// preserved verbatim rather than rejected.
    Other(String),
}

impl Default for Currency {
    fn default() -> Self {
        Self::Gs
    }
}

impl Currency {
    /// Normalizes the free-text currency literals seen in XML/vision output
    /// (`"Gs"`, `"Gs."`, `"GUARANIES"`, `"PYG"`, ...) to a closed variant.
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        match upper.as_str() {
            "PYG" | "GS" | "GS." | "GUARANI" | "GUARANIES" | "GUARANÍES" =>
                Self::Gs,
            "USD" | "US$" | "DOLARES" | "DÓLARES" => Self::Usd,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

/// Where an [`InvoiceHeader`] was derived from, used to resolve conflicting
/// upserts for the same `(tenant, cdc)`. Higher [`SourceTag::priority`] wins.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SourceTag {
    /// Parsed directly from the signed SIFEN XML attachment.
    XmlNativo,
    /// Extracted from a rendered PDF page by the vision model, with a
    /// machine-readable text layer available as an OCR hint.
    OpenaiVision,
    /// Extracted from a rendered PDF page by the vision model with no text
    /// layer at all (pure image).
    OpenaiVisionImage,
    /// Recovered from the email body/subject alone, no attachment parsed.
    Email,
}

impl SourceTag {
    /// Higher priority sources may overwrite a lower-priority existing
    /// record for the same invoice; lower priority sources may not.
    pub fn priority(self) -> u16 {
        match self {
            Self::XmlNativo => 100,
            Self::OpenaiVision => 50,
            Self::OpenaiVisionImage => 40,
            Self::Email => 10,
        }
    }
}

/// A single line item on an invoice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub descripcion: String,
    pub cantidad: Decimal,
    pub precio_unitario: Decimal,
    pub total: Decimal,
    /// IVA rate bucket this item's tax falls under (0, 5, or 10 percent).
    pub iva_rate: u8,
}

/// The canonical, source-agnostic representation of an extracted invoice,
/// keyed by `(tenant, cdc)` once a CDC is known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvoiceHeader {
    pub tenant: TenantId,
    pub cdc: Option<Cdc>,
    /// SIFEN document number (`dNumDoc`), e.g. `"001-001-0000123"`.
    pub numero_factura: String,
    /// SIFEN stamp/authorization number (`dNumTim`).
    pub timbrado: String,
    pub ruc_emisor: String,
    pub razon_social_emisor: String,
    /// Receiver RUC, when the document or vision extraction names one.
    /// Absent for consumer-final invoices that only name the issuer.
    pub receptor_ruc: Option<String>,
    pub receptor_nombre: Option<String>,
    pub receptor_email: Option<String>,
    pub fecha: chrono::NaiveDate,
    pub moneda: Currency,
    /// Exchange rate to guaraníes in effect at `fecha`; `1` for
    /// guaraní-denominated invoices.
    pub tipo_cambio: Decimal,
    pub subtotal_exentas: Decimal,
    /// Taxable base (before VAT) at the 5% bracket.
    pub subtotal_gravada_5: Decimal,
    /// Taxable base (before VAT) at the 10% bracket.
    pub subtotal_gravada_10: Decimal,
    pub iva_5: Decimal,
    pub iva_10: Decimal,
    pub total: Decimal,
    pub descripcion_factura: String,
    pub items: Vec<InvoiceItem>,
    pub source: SourceTag,
    pub email_message_id: Option<String>,
    /// Key of the stored source artifact (PDF/XML/image) in object storage,
    /// once `cuenly-storage::artifact_store` has written it.
    pub minio_key: Option<String>,
    /// Processing month, `YYYY-MM`, derived from `fecha` at mapping time and
    /// used for monthly reporting aggregates.
    pub mes_proceso: String,
    pub created_at: TimestampMillis,
}

impl InvoiceHeader {
    /// Sum of both VAT brackets, the `total_iva` quantity older callers
    /// expect as a single figure.
    pub fn total_iva(&self) -> Decimal {
        self.iva_5 + self.iva_10
    }
}

/// A registered IMAP mailbox this tenant wants scanned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailConfig {
    pub tenant: TenantId,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Either a plaintext app-password or an OAuth2 refresh token, always
    /// stored encrypted at rest; see `cuenly-crypto` / the encrypted config
    /// store.
    pub secret_ciphertext: String,
    pub use_oauth2: bool,
    pub folder: String,
    pub active: bool,
    /// Normalized, matched substring-first against each scanned subject;
    /// see the scanner's own NFKD normalization (C5).
    #[serde(default)]
    pub subject_terms: Vec<String>,
}

/// Tracks which emails in a mailbox have already been ingested, to make
/// rescans idempotent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessedEmailEntry {
    pub tenant: TenantId,
    pub account: String,
    pub uid: u32,
    pub status: ProcessedStatus,
    pub processed_at: TimestampMillis,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Error,
    /// Logged and skipped: malformed input, unparseable dates/amounts.
    MissingMetadata,
    SkippedAiLimit,
    /// Quota was exhausted before extraction was attempted; the message is
    /// left unread so a future quota reset reprocesses it.
    SkippedAiLimitUnread,
    PendingAiUnread,
    RetryRequested,
}

impl ProcessedStatus {
    /// Whether this status counts as durably, successfully processed: a
    /// `skipped_ai_limit*` outcome must be revisited once quota resets, so
    /// it is never terminal.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether a claim row left in this status may be re-claimed by a
    /// future scan. `Pending`/`Processing` are deliberately excluded: that
    /// row belongs to a claim still in flight (or one a crashed worker
    /// never released), and reclaiming it here would break the exclusivity
    /// `try_claim` exists to provide. `Done`/`MissingMetadata` are
    /// excluded because both are permanent: a finished invoice never
    /// changes, and a `MissingMetadata` email's content won't either.
    pub fn is_reclaimable(self) -> bool {
        matches!(
            self,
            Self::Failed
                | Self::Error
                | Self::SkippedAiLimit
                | Self::SkippedAiLimitUnread
                | Self::PendingAiUnread
                | Self::RetryRequested
        )
    }
}

/// A tenant's billing subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub tenant: TenantId,
    pub plan: String,
    pub status: SubscriptionStatus,
    pub billing_day_of_month: u8,
    pub next_billing_date: chrono::NaiveDate,
    pub retry_count: u32,
    pub started_at: chrono::NaiveDate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

/// An account holder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub tenant: TenantId,
    pub email: String,
    pub ai_quota_limit: u32,
    pub ai_quota_used: u32,
}

/// A unit of work enqueued onto the Redis-backed job queue (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub func_name: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub status: JobStatus,
    pub created_at: TimestampMillis,
    pub started_at: Option<TimestampMillis>,
    pub ended_at: Option<TimestampMillis>,
    pub meta: serde_json::Map<String, serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub exc_info: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn source_priority_is_strictly_ordered_by_spec() {
        assert!(SourceTag::XmlNativo.priority() > SourceTag::OpenaiVision.priority());
        assert!(
            SourceTag::OpenaiVision.priority()
                > SourceTag::OpenaiVisionImage.priority()
        );
        assert!(SourceTag::OpenaiVisionImage.priority() > SourceTag::Email.priority());
    }

    #[test]
    fn currency_normalizes_common_literals() {
        assert_eq!(Currency::normalize("Gs."), Currency::Gs);
        assert_eq!(Currency::normalize("GUARANIES"), Currency::Gs);
        assert_eq!(Currency::normalize("PYG"), Currency::Gs);
        assert_eq!(Currency::normalize("USD"), Currency::Usd);
        assert_eq!(
            Currency::normalize("EUR"),
            Currency::Other("EUR".to_string())
        );
    }

    #[test]
    fn cdc_rejects_wrong_length_or_non_digits() {
        assert!(Cdc::parse("123").is_none());
        assert!(Cdc::parse(&"a".repeat(44)).is_none());
        assert!(Cdc::parse(&"1".repeat(44)).is_some());
    }

    #[test]
    fn cdc_embedded_date_digits_is_bytes_10_to_18() {
        let mut s = "0".repeat(44);
        s.replace_range(10..18, "20240115");
        let cdc = Cdc::parse(&s).unwrap();
        assert_eq!(cdc.embedded_date_digits(), "20240115");
    }
}
