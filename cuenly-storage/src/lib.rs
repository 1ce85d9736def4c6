//! Storage-layer components: the content-addressed artifact store (C1),
//! the processed-email registry (C2), and the invoice document warehouse
//! (C9).

/// Content-addressed temp/scratch storage for downloaded attachments.
pub mod artifact_store;
/// The encrypted per-tenant IMAP account config store.
pub mod email_config_store;
/// The document-warehouse-backed invoice repository.
pub mod invoice_repo;
/// The in-process + persisted processed-email dedup registry.
pub mod processed_registry;

pub use artifact_store::ArtifactStore;
pub use email_config_store::EmailConfigStore;
pub use invoice_repo::InvoiceRepository;
pub use processed_registry::ProcessedEmailRegistry;
