//! IMAP-facing components: the connection pool (C4), the subject/date
//! scanner (C5), and the attachment/link resolver (C6).

pub mod pool;
pub mod resolver;
pub mod scanner;

pub use pool::{ConnectionPool, PoolError, PoolKey};
pub use resolver::AttachmentResolver;
pub use scanner::Scanner;

/// The resolved, decrypted form of an [`cuenly_common::model::EmailConfig`]
/// ready to open a session: secrets have already been read out of the
/// encrypted config store by the caller.
#[derive(Clone, Debug)]
pub struct AccountConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub oauth2_access_token: Option<String>,
    pub folder: String,
}
