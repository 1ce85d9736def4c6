//! The ingestion error taxonomy (§7).
//!
//! Each component crate defines its own `thiserror` error enum for its
//! internal failure modes (e.g. `cuenly_imap::Error`,
//! `cuenly_extract::Error`). [`IngestError`] is the coarser classification
//! a job handler uses to decide whether to retry, fail permanently, or
//! record a non-error [`Outcome`].

use thiserror::Error;

/// How a job handler should react to a failed extraction/ingestion attempt.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The AI/vision extraction step failed in a way that will never
    /// succeed on retry (malformed prompt, unsupported document, content
    /// policy rejection). The job is aborted, no retry.
    #[error("AI_FATAL: {0}")]
    AiFatal(String),

    /// A transient failure: network blip, rate limit, IMAP connection
    /// drop, Mongo/Redis timeout. The job should be retried with backoff.
    #[error("AI_RETRYABLE: {0}")]
    Retryable(String),

    /// The tenant's AI extraction quota for the billing period is
    /// exhausted; the email is left unprocessed for a future run rather
    /// than marked failed.
    #[error("AI_LIMIT_REACHED")]
    AiLimitReached,

    /// The document failed structural/business validation (missing RUC,
    /// non-positive total, malformed CDC, ...).
    #[error("VALIDATION: {0}")]
    Validation(String),

    /// IMAP connection establishment, STARTTLS/SSL, or authentication
    /// failed for a configured mailbox.
    #[error("EMAIL_CONNECTION: {0}")]
    EmailConnection(String),

    /// IMAP authentication specifically (bad password, expired OAuth2
    /// token) — distinguished from [`Self::EmailConnection`] because it is
    /// surfaced to the tenant as "reconnect your mailbox", not retried.
    #[error("EMAIL_AUTH: {0}")]
    EmailAuth(String),

    /// An email fetched successfully but could not be parsed as a
    /// message (malformed MIME, missing headers).
    #[error("EMAIL_PARSE: {0}")]
    EmailParse(String),

    /// A storage-layer failure: the artifact store, document warehouse,
    /// or job queue was unreachable or rejected a write.
    #[error("STORAGE: {0}")]
    Storage(String),
}

impl IngestError {
    /// Whether a job handler should requeue this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Retryable(_) | Self::EmailConnection(_) | Self::Storage(_)
        )
    }
}

/// A recorded, non-error result of processing a single email or attachment.
/// These are not failures for the job: they are outcomes the caller records
/// and moves on from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// A new invoice was parsed and upserted.
    InvoiceParsed,
    /// The parsed invoice's `(tenant, cdc)` already existed at an equal or
    /// higher [`crate::model::SourceTag`] priority; the upsert was skipped.
    Duplicate,
    /// The email had no parseable attachment or link.
    NoAttachment,
    /// This email UID was already present in the processed-email registry.
    AlreadyProcessed,
}
