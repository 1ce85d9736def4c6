//! C4-C9 assembled end to end: leases an IMAP session for one mailbox,
//! scans it for matching subjects, resolves an attachment per matched
//! UID, extracts it (XML natively or via the vision fallback), maps the
//! result to the canonical header, and persists it. This is the body the
//! fan-out's queued jobs and the `process` CLI command both drive.

use cuenly_common::error::{IngestError, Outcome};
use cuenly_common::model::{EmailConfig, ProcessedStatus, SourceTag, TenantId};
use cuenly_extract::vision::VisionError;
use cuenly_extract::{mapper, xml_parser};
use cuenly_imap::pool::Leased;
use cuenly_imap::resolver::Kind;
use cuenly_imap::scanner::ScanWindow;
use cuenly_imap::{AccountConfig, AttachmentResolver, ConnectionPool, PoolError, Scanner};
use cuenly_storage::artifact_store::SaveOptions;
use cuenly_storage::invoice_repo::UpsertOutcome;
use cuenly_storage::{ArtifactStore, EmailConfigStore, InvoiceRepository, ProcessedEmailRegistry};
use tracing::{instrument, warn};

use crate::backends::{
    MongoEmailConfigBackend, MongoInvoiceBackend, MongoProcessedEmailBackend, Vision,
};

/// Tallies one account's scan, for the worker/CLI caller to log or return
/// as a job result.
#[derive(Debug, Default, serde::Serialize)]
pub struct AccountSummary {
    pub scanned: usize,
    pub parsed: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

fn record_outcome(summary: &mut AccountSummary, outcome: Outcome) {
    match outcome {
        Outcome::InvoiceParsed => summary.parsed += 1,
        Outcome::Duplicate => summary.duplicates += 1,
        Outcome::NoAttachment | Outcome::AlreadyProcessed => summary.skipped += 1,
    }
}

/// The concrete backends this pipeline is wired against in the shipped
/// binary. Borrowed rather than generic: there is exactly one production
/// backend set, assembled once by `Runtime`.
pub struct PipelineContext<'a> {
    pub email_configs: &'a EmailConfigStore<MongoEmailConfigBackend>,
    pub processed: &'a ProcessedEmailRegistry<MongoProcessedEmailBackend>,
    pub invoices: &'a InvoiceRepository<MongoInvoiceBackend>,
    pub artifacts: &'a ArtifactStore,
    pub imap_pool: &'a ConnectionPool,
    pub resolver: &'a AttachmentResolver,
    /// `None` when no `OPENAI_API_KEY` is configured; PDF attachments are
    /// then left unprocessed (`SkippedAiLimitUnread`) rather than failing
    /// the job.
    pub vision: Option<&'a Vision>,
}

/// Scans and processes one tenant's mailbox. Returns `Ok` with a summary
/// even when the mailbox has no matching messages, or isn't registered, or
/// is inactive (a zero-scanned summary); only connection/auth/storage
/// failures that prevent scanning at all are surfaced as `Err`.
#[instrument(skip(ctx), fields(tenant = %tenant.0, %username))]
pub async fn process_account(
    ctx: &PipelineContext<'_>,
    tenant: &TenantId,
    username: &str,
) -> Result<AccountSummary, IngestError> {
    let configs = ctx
        .email_configs
        .list_configs(&tenant.0, true)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;
    let Some(mut config) = configs.into_iter().find(|c| c.username == username && c.active)
    else {
        return Ok(AccountSummary::default());
    };

    let secret = ctx
        .email_configs
        .reveal_secret(tenant, &mut config)
        .await
        .map_err(|e| IngestError::EmailAuth(e.to_string()))?;

    let account_cfg = AccountConfig {
        host: config.host.clone(),
        port: config.port,
        username: config.username.clone(),
        password: (!config.use_oauth2).then(|| secret.expose().to_string()),
        oauth2_access_token: config.use_oauth2.then(|| secret.expose().to_string()),
        folder: config.folder.clone(),
    };

    let mut leased = ctx
        .imap_pool
        .get_connection(&account_cfg)
        .await
        .map_err(classify_pool_error)?;

    let window = ScanWindow {
        since: None,
        before: None,
        unseen_only: true,
    };
    // On error the session was consumed inside `Scanner::scan`'s
    // `spawn_blocking` and never returned to `leased`; dropping it here
    // leaks the pool slot rather than risk double-taking it below, the
    // same tradeoff `ConnectionPool`'s own doc comment calls out.
    let uids = Scanner::scan(&mut leased, window, &config.subject_terms)
        .await
        .map_err(|e| IngestError::EmailConnection(e.to_string()))?;

    let mut summary = AccountSummary::default();
    for uid in uids {
        summary.scanned += 1;
        match process_one_uid(ctx, &mut leased, tenant, &config, uid).await {
            Ok(outcome) => record_outcome(&mut summary, outcome),
            Err(IngestError::EmailConnection(msg)) => {
                warn!(uid, error = %msg, "IMAP session lost mid-scan, aborting remaining UIDs for this account");
                summary.failed += 1;
                return Ok(summary);
            }
            Err(e) => {
                warn!(uid, error = %e, "failed to process email");
                summary.failed += 1;
            }
        }
    }

    ctx.imap_pool.return_connection(leased).await;
    Ok(summary)
}

async fn process_one_uid(
    ctx: &PipelineContext<'_>,
    leased: &mut Leased,
    tenant: &TenantId,
    config: &EmailConfig,
    uid: u32,
) -> Result<Outcome, IngestError> {
    let key = format!("{}:{}:{uid}", tenant.0, config.username);

    let claimed = ctx
        .processed
        .claim_for_processing(&key, &tenant.0, &config.username)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;
    if !claimed {
        return Ok(Outcome::AlreadyProcessed);
    }

    let result = process_claimed_uid(ctx, leased, tenant, config, uid, &key).await;
    if let Err(e) = &result {
        if e.is_retryable() {
            // A permanent failure (AiFatal/Validation/EmailAuth/EmailParse)
            // leaves the row in place: retrying could never succeed, so the
            // claim stands as a permanent skip marker. Only transient
            // failures release it so the next scan can retry the UID.
            let _ = ctx.processed.release_claim(&key).await;
        }
    }
    result
}

async fn process_claimed_uid(
    ctx: &PipelineContext<'_>,
    leased: &mut Leased,
    tenant: &TenantId,
    config: &EmailConfig,
    uid: u32,
    key: &str,
) -> Result<Outcome, IngestError> {
    let raw = Scanner::fetch_full(leased, uid)
        .await
        .map_err(|e| IngestError::EmailConnection(e.to_string()))?;
    let message_id = extract_message_id(&raw);

    let resolved = match ctx.resolver.resolve(&raw).await {
        Ok(resolved) => resolved,
        Err(_) => {
            mark(ctx, key, config, tenant, ProcessedStatus::MissingMetadata, Some("no pdf/xml attachment found")).await?;
            let _ = Scanner::mark_seen(leased, uid).await;
            return Ok(Outcome::NoAttachment);
        }
    };

    let (parsed, source) = match resolved.kind {
        Kind::Xml => {
            let parsed = xml_parser::parse(&resolved.bytes)
                .map_err(|e| IngestError::Validation(e.to_string()))?;
            (parsed, SourceTag::XmlNativo)
        }
        Kind::Pdf => {
            let Some(vision) = ctx.vision else {
                mark(ctx, key, config, tenant, ProcessedStatus::SkippedAiLimitUnread, Some("no vision backend configured")).await?;
                return Ok(Outcome::NoAttachment);
            };
            match vision.extract_from_pdf(&resolved.bytes, &tenant.0).await {
                Ok(value) => {
                    let parsed: xml_parser::ParsedInvoice = serde_json::from_value(value)
                        .map_err(|e| IngestError::Validation(e.to_string()))?;
                    (parsed, SourceTag::OpenaiVision)
                }
                Err(VisionError::QuotaReached) => {
                    mark(ctx, key, config, tenant, ProcessedStatus::SkippedAiLimitUnread, Some("AI quota exhausted")).await?;
                    return Ok(Outcome::AlreadyProcessed);
                }
                Err(VisionError::Remision) => {
                    mark(ctx, key, config, tenant, ProcessedStatus::MissingMetadata, Some("delivery note, not a fiscal invoice")).await?;
                    let _ = Scanner::mark_seen(leased, uid).await;
                    return Ok(Outcome::NoAttachment);
                }
                Err(VisionError::Fatal(msg)) => return Err(IngestError::AiFatal(msg)),
                Err(e) => return Err(IngestError::Retryable(e.to_string())),
            }
        }
    };

    if !parsed.is_minimally_complete() {
        mark(ctx, key, config, tenant, ProcessedStatus::MissingMetadata, Some("extraction missing mandatory fields")).await?;
        return Ok(Outcome::NoAttachment);
    }

    let save_opts = SaveOptions {
        force_pdf: false,
        owner_email: tenant.0.clone(),
        date: parsed.fecha.unwrap_or_else(|| chrono::Utc::now().date_naive()),
    };
    let saved = ctx
        .artifacts
        .save_binary(&resolved.bytes, &resolved.filename, &save_opts)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

    let header = mapper::map_to_header(&parsed, tenant.clone(), source, message_id.clone(), saved.remote_key.clone());

    let upsert_outcome = ctx
        .invoices
        .upsert_header(&tenant.0, &header, key, saved.remote_key.as_deref())
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

    if let Some(message_id) = &message_id {
        let _ = ctx.processed.set_message_id(key, message_id).await;
    }

    let outcome = match upsert_outcome {
        UpsertOutcome::Written { .. } => Outcome::InvoiceParsed,
        UpsertOutcome::SkippedLowerPriority { .. } => Outcome::Duplicate,
    };
    mark(ctx, key, config, tenant, ProcessedStatus::Done, None).await?;
    // The invoice is already durably upserted and the registry entry
    // already terminal; a failure to flag the IMAP message \Seen isn't
    // worth re-claiming and redoing the work above over.
    let _ = Scanner::mark_seen(leased, uid).await;

    Ok(outcome)
}

async fn mark(
    ctx: &PipelineContext<'_>,
    key: &str,
    config: &EmailConfig,
    tenant: &TenantId,
    status: ProcessedStatus,
    reason: Option<&str>,
) -> Result<(), IngestError> {
    ctx.processed
        .mark_processed(key, status, reason, &tenant.0, &config.username)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))
}

fn extract_message_id(raw: &[u8]) -> Option<String> {
    mail_parser::MessageParser::default()
        .parse(raw)?
        .message_id()
        .map(str::to_string)
}

fn classify_pool_error(e: PoolError) -> IngestError {
    match e {
        PoolError::AuthFailed(msg) => IngestError::EmailAuth(msg),
        other => IngestError::EmailConnection(other.to_string()),
    }
}
