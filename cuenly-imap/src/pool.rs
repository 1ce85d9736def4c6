//! C4: a per-process IMAP connection pool keyed by `(host, port, username)`.
//! Sessions are blocking (the `imap` crate has no async-native equivalent
//! in this ecosystem), so every IMAP call runs inside
//! [`tokio::task::spawn_blocking`].

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use native_tls::TlsStream;
use std::net::TcpStream;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::AccountConfig;

const DEFAULT_MAX_IDLE: usize = 5;
const DEFAULT_MAX_ACTIVE: usize = 5;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);
const CONNECT_RETRIES: u32 = 3;
const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(2);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);
const NOOP_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("IMAP_POOL_EXHAUSTED: all {max_active} active sessions for this account are in use")]
    PoolExhausted { max_active: usize },
    #[error("IMAP_AUTH_FAILED: {0}")]
    AuthFailed(String),
    #[error("IMAP connection error: {0}")]
    Connection(String),
    #[error("operation timed out")]
    Timeout,
}

/// Identifies a distinct pool of sessions: one account can only ever share
/// sessions with requests for the exact same host/port/username.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl From<&AccountConfig> for PoolKey {
    fn from(cfg: &AccountConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
        }
    }
}

/// `imap::ClientBuilder::connect` normalizes both SSL-from-connect (port
/// 993) and STARTTLS to the same upgraded-TLS stream type, so the pool
/// only ever deals with one concrete session type.
pub(crate) type BoxSession = imap::Session<TlsStream<TcpStream>>;

struct PooledSession {
    session: BoxSession,
    idle_since: Instant,
}

#[derive(Default)]
struct KeyState {
    idle: VecDeque<PooledSession>,
    active_count: usize,
    last_error: Option<String>,
}

pub struct ConnectionPool {
    max_idle: usize,
    max_active: usize,
    idle_ttl: Duration,
    state: Arc<Mutex<HashMap<PoolKey, KeyState>>>,
}

/// A session on loan from the pool. Drop without returning it to leak the
/// slot rather than corrupt pool accounting; callers should always call
/// [`ConnectionPool::return_connection`].
pub struct Leased {
    pub key: PoolKey,
    session: Option<BoxSession>,
}

impl Leased {
    fn new(key: PoolKey, session: BoxSession) -> Self {
        Self {
            key,
            session: Some(session),
        }
    }

    /// Takes the session out for use in a blocking task. Callers must put
    /// it back with [`Self::put`] before the session is next needed.
    pub(crate) fn take(&mut self) -> BoxSession {
        self.session.take().expect("session already taken")
    }

    pub(crate) fn put(&mut self, session: BoxSession) {
        self.session = Some(session);
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_IDLE, DEFAULT_MAX_ACTIVE, DEFAULT_IDLE_TTL)
    }

    pub fn with_limits(max_idle: usize, max_active: usize, idle_ttl: Duration) -> Self {
        Self {
            max_idle,
            max_active,
            idle_ttl,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drains the idle queue for this account, returning the first session
    /// that passes a `NOOP` health check; otherwise opens a new one unless
    /// the active cap is already reached.
    #[instrument(skip(self, cfg), fields(host = %cfg.host, user = %cfg.username))]
    pub async fn get_connection(&self, cfg: &AccountConfig) -> Result<Leased, PoolError> {
        let key = PoolKey::from(cfg);

        loop {
            let candidate = {
                let mut guard = self.state.lock().await;
                let entry = guard.entry(key.clone()).or_default();
                entry.idle.pop_front()
            };

            let Some(pooled) = candidate else { break };
            match health_check(pooled.session).await {
                Ok(session) => {
                    let mut guard = self.state.lock().await;
                    guard.entry(key.clone()).or_default().active_count += 1;
                    return Ok(Leased::new(key, session));
                }
                Err(_) => continue, // unhealthy: drop and try the next idle session
            }
        }

        {
            let mut guard = self.state.lock().await;
            let entry = guard.entry(key.clone()).or_default();
            if entry.active_count >= self.max_active {
                return Err(PoolError::PoolExhausted {
                    max_active: self.max_active,
                });
            }
            entry.active_count += 1;
        }

        match connect_with_retry(cfg).await {
            Ok(session) => Ok(Leased::new(key, session)),
            Err(e) => {
                let mut guard = self.state.lock().await;
                let entry = guard.entry(key.clone()).or_default();
                entry.active_count -= 1;
                entry.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Re-tests liveness before returning a session to the idle queue;
    /// unhealthy sessions are dropped instead.
    #[instrument(skip(self, leased))]
    pub async fn return_connection(&self, mut leased: Leased) {
        let key = leased.key.clone();
        let session = leased.take();

        let healthy = health_check(session).await;
        let mut guard = self.state.lock().await;
        let entry = guard.entry(key.clone()).or_default();
        entry.active_count = entry.active_count.saturating_sub(1);

        if let Ok(session) = healthy {
            if entry.idle.len() < self.max_idle {
                entry.idle.push_back(PooledSession {
                    session,
                    idle_since: Instant::now(),
                });
            } else {
                let _ = spawn_logout(session);
            }
        }
    }

    pub async fn last_error(&self, key: &PoolKey) -> Option<String> {
        self.state.lock().await.get(key).and_then(|e| e.last_error.clone())
    }

    /// Removes idle sessions older than the configured TTL. Intended to be
    /// driven by a background loop on a fixed interval.
    #[instrument(skip(self))]
    pub async fn sweep_idle(&self) {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        for (key, entry) in guard.iter_mut() {
            let ttl = self.idle_ttl;
            let before = entry.idle.len();
            let mut kept = VecDeque::new();
            while let Some(pooled) = entry.idle.pop_front() {
                if now.duration_since(pooled.idle_since) > ttl {
                    let _ = spawn_logout(pooled.session);
                } else {
                    kept.push_back(pooled);
                }
            }
            entry.idle = kept;
            if before != entry.idle.len() {
                tracing::debug!(?key, removed = before - entry.idle.len(), "swept idle IMAP sessions");
            }
        }
    }

    /// Drains both idle and active-session bookkeeping. Active sessions
    /// already on loan are not forcibly closed; this only guarantees idle
    /// sessions are logged out.
    #[instrument(skip(self))]
    pub async fn close_all(&self) {
        let mut guard = self.state.lock().await;
        for (_, entry) in guard.iter_mut() {
            while let Some(pooled) = entry.idle.pop_front() {
                let _ = spawn_logout(pooled.session);
            }
        }
        guard.clear();
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn health_check(mut session: BoxSession) -> Result<BoxSession, ()> {
    let result = tokio::time::timeout(
        NOOP_DEADLINE,
        tokio::task::spawn_blocking(move || {
            let ok = session.noop().is_ok();
            (session, ok)
        }),
    )
    .await;

    match result {
        Ok(Ok((session, true))) => Ok(session),
        _ => Err(()),
    }
}

fn spawn_logout(mut session: BoxSession) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let _ = session.logout();
    })
}

async fn connect_with_retry(cfg: &AccountConfig) -> Result<BoxSession, PoolError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match connect_once(cfg).await {
            Ok(session) => return Ok(session),
            Err(PoolError::AuthFailed(msg)) => {
                return Err(PoolError::AuthFailed(msg));
            }
            Err(e) if attempt >= CONNECT_RETRIES => return Err(e),
            Err(e) => {
                let backoff = CONNECT_BACKOFF_BASE * 2u32.pow(attempt - 1);
                warn!(attempt, error = %e, backoff_secs = backoff.as_secs(), "IMAP connect failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn connect_once(cfg: &AccountConfig) -> Result<BoxSession, PoolError> {
    let cfg = cfg.clone();
    let connect = tokio::task::spawn_blocking(move || -> Result<BoxSession, PoolError> {
        let builder = imap::ClientBuilder::new(&cfg.host, cfg.port);
        let builder = if cfg.port != 993 {
            builder.starttls()
        } else {
            builder
        };
        let client = builder
            .connect()
            .map_err(|e| PoolError::Connection(e.to_string()))?;
        authenticate(client, &cfg)
    });

    match tokio::time::timeout(HANDSHAKE_DEADLINE, connect).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(PoolError::Connection(join_err.to_string())),
        Err(_) => Err(PoolError::Timeout),
    }
}

fn authenticate(
    client: imap::Client<TlsStream<TcpStream>>,
    cfg: &AccountConfig,
) -> Result<BoxSession, PoolError> {
    if let Some(oauth_token) = &cfg.oauth2_access_token {
        let auth = Xoauth2 {
            user: cfg.username.clone(),
            access_token: oauth_token.clone(),
        };
        client
            .authenticate("XOAUTH2", &auth)
            .map_err(|(e, _)| classify_auth_error(&e.to_string()))
    } else {
        client
            .login(&cfg.username, cfg.password.as_deref().unwrap_or(""))
            .map_err(|(e, _)| classify_auth_error(&e.to_string()))
    }
}

fn classify_auth_error(msg: &str) -> PoolError {
    let lower = msg.to_lowercase();
    if lower.contains("authenticationfailed") || lower.contains("auth") {
        PoolError::AuthFailed(msg.to_string())
    } else {
        PoolError::Connection(msg.to_string())
    }
}

/// `XOAUTH2` SASL: the auth string is sent as-is, not base64-encoded by
/// this layer (the `imap` crate's authenticator handles that).
struct Xoauth2 {
    user: String,
    access_token: String,
}

impl imap::Authenticator for Xoauth2 {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_key_derives_from_account_config() {
        let cfg = AccountConfig {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            password: Some("secret".to_string()),
            oauth2_access_token: None,
            folder: "INBOX".to_string(),
        };
        let key = PoolKey::from(&cfg);
        assert_eq!(key.host, "imap.example.com");
        assert_eq!(key.port, 993);
    }

    #[test]
    fn classify_auth_error_matches_authenticationfailed() {
        assert!(matches!(
            classify_auth_error("NO [AUTHENTICATIONFAILED] invalid credentials"),
            PoolError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_auth_error("connection reset by peer"),
            PoolError::Connection(_)
        ));
    }
}
