//! C5: given an account session and a time window, searches by subject
//! and date, then returns matched UIDs in ascending order.

use std::time::Duration;

use thiserror::Error;
use tracing::instrument;
use unicode_normalization::UnicodeNormalization;

use crate::pool::Leased;

const CANDIDATE_CAP: usize = 200;
const FETCH_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("IMAP search failed: {0}")]
    Search(String),
    #[error("IMAP fetch failed: {0}")]
    Fetch(String),
    #[error("fetch timed out")]
    Timeout,
}

#[derive(Clone, Debug)]
pub struct ScanWindow {
    pub since: Option<chrono::NaiveDate>,
    pub before: Option<chrono::NaiveDate>,
    pub unseen_only: bool,
}

pub struct Scanner;

impl Scanner {
    /// Runs one scan against an already-selected `INBOX`. Returns matched
    /// UIDs sorted ascending.
    #[instrument(skip(leased, subject_terms))]
    pub async fn scan(
        leased: &mut Leased,
        window: ScanWindow,
        subject_terms: &[String],
    ) -> Result<Vec<u32>, ScanError> {
        let normalized_terms: Vec<String> =
            subject_terms.iter().map(|t| normalize_subject(t)).collect();

        let session = leased.take();
        let query = build_search_query(&window);

        let (session_back, uids) = tokio::task::spawn_blocking(move || {
            session
                .select("INBOX")
                .map_err(|e| ScanError::Search(e.to_string()))?;
            let uid_set = session
                .uid_search(&query)
                .map_err(|e| ScanError::Search(e.to_string()))?;
            Ok::<_, ScanError>((session, uid_set))
        })
        .await
        .map_err(|e| ScanError::Search(e.to_string()))??;

        let mut descending: Vec<u32> = uids.into_iter().collect();
        descending.sort_unstable_by(|a, b| b.cmp(a));
        descending.truncate(CANDIDATE_CAP);

        if descending.is_empty() {
            leased.put(session_back);
            return Ok(vec![]);
        }

        let uid_csv = descending
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut session = session_back;
        let fetch = tokio::task::spawn_blocking(move || {
            let fetches = session
                .uid_fetch(&uid_csv, "BODY.PEEK[HEADER.FIELDS (SUBJECT)]")
                .map_err(|e| ScanError::Fetch(e.to_string()))?;
            let headers: Vec<(u32, String)> = fetches
                .iter()
                .filter_map(|f| {
                    let uid = f.uid?;
                    let header = f.header().unwrap_or(&[]);
                    Some((uid, String::from_utf8_lossy(header).into_owned()))
                })
                .collect();
            Ok::<_, ScanError>((session, headers))
        });

        let (session_back, headers) =
            match tokio::time::timeout(FETCH_DEADLINE, fetch).await {
                Ok(Ok(result)) => result?,
                Ok(Err(join_err)) => return Err(ScanError::Fetch(join_err.to_string())),
                Err(_) => return Err(ScanError::Timeout),
            };

        leased.put(session_back);

        let mut matched: Vec<u32> = headers
            .into_iter()
            .filter(|(_, raw_header)| {
                let subject = extract_subject(raw_header);
                let normalized = normalize_subject(&subject);
                normalized_terms.iter().any(|term| normalized.contains(term.as_str()))
            })
            .map(|(uid, _)| uid)
            .collect();

        matched.sort_unstable();
        Ok(matched)
    }

    /// Fetches the full RFC822 message body for one already-matched UID.
    /// Bridges the UID-only result of [`Scanner::scan`] to
    /// [`crate::resolver::AttachmentResolver::resolve`], which needs the
    /// raw bytes.
    #[instrument(skip(leased))]
    pub async fn fetch_full(leased: &mut Leased, uid: u32) -> Result<Vec<u8>, ScanError> {
        let session = leased.take();
        let fetch = tokio::task::spawn_blocking(move || {
            session
                .select("INBOX")
                .map_err(|e| ScanError::Search(e.to_string()))?;
            let fetches = session
                .uid_fetch(uid.to_string(), "BODY.PEEK[]")
                .map_err(|e| ScanError::Fetch(e.to_string()))?;
            let raw = fetches
                .iter()
                .find_map(|f| f.body().map(<[u8]>::to_vec))
                .ok_or_else(|| ScanError::Fetch(format!("no body returned for uid {uid}")));
            Ok::<_, ScanError>((session, raw))
        });

        let (session_back, raw) = match tokio::time::timeout(FETCH_DEADLINE, fetch).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => return Err(ScanError::Fetch(join_err.to_string())),
            Err(_) => return Err(ScanError::Timeout),
        };
        leased.put(session_back);
        raw
    }

    /// Marks a UID `\Seen`, used after a message has been fully processed
    /// (or deliberately skipped per an error-handling policy that still
    /// wants it marked read).
    #[instrument(skip(leased))]
    pub async fn mark_seen(leased: &mut Leased, uid: u32) -> Result<(), ScanError> {
        let session = leased.take();
        let result = tokio::task::spawn_blocking(move || {
            session
                .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
                .map_err(|e| ScanError::Fetch(e.to_string()))?;
            Ok::<_, ScanError>(session)
        })
        .await
        .map_err(|e| ScanError::Fetch(e.to_string()))?;

        match result {
            Ok(session_back) => {
                leased.put(session_back);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn build_search_query(window: &ScanWindow) -> String {
    let mut parts = vec![if window.unseen_only { "UNSEEN" } else { "ALL" }.to_string()];
    if let Some(since) = window.since {
        parts.push(format!("SINCE {}", imap_date(since)));
    }
    if let Some(before) = window.before {
        parts.push(format!("BEFORE {}", imap_date(before)));
    }
    parts.join(" ")
}

fn imap_date(date: chrono::NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// Extracts the `Subject:` line's value from a raw `HEADER.FIELDS
/// (SUBJECT)` fetch, undoing simple RFC 2047 MIME encoded-words.
fn extract_subject(raw_header: &str) -> String {
    raw_header
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("subject:"))
        .map(|line| line.splitn(2, ':').nth(1).unwrap_or("").trim())
        .map(decode_mime_words)
        .unwrap_or_default()
}

/// Decodes RFC 2047 encoded-words (`=?charset?Q?...?=` / `=?charset?B?...?=`)
/// found in a raw header value. Unrecognized charsets fall back to the raw
/// bytes interpreted as UTF-8 lossily; this is a best-effort decode for
/// subject matching, not a MIME-correctness guarantee.
fn decode_mime_words(s: &str) -> String {
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("=?") {
        out.push_str(&rest[..start]);
        let Some(body) = rest[start + 2..].find("?=").map(|end| &rest[start..start + 2 + end + 2])
        else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        out.push_str(&decode_one_encoded_word(body).unwrap_or_else(|| body.to_string()));
        rest = &rest[start + body.len()..];
    }
    out.push_str(rest);
    out
}

fn decode_one_encoded_word(word: &str) -> Option<String> {
    let inner = word.strip_prefix("=?")?.strip_suffix("?=")?;
    let mut parts = inner.splitn(3, '?');
    let _charset = parts.next()?;
    let encoding = parts.next()?;
    let text = parts.next()?;

    match encoding.to_ascii_uppercase().as_str() {
        "B" => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(text)
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        }
        "Q" => Some(decode_quoted_printable_word(text)),
        _ => None,
    }
}

fn decode_quoted_printable_word(text: &str) -> String {
    let mut bytes = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '_' => bytes.push(b' '),
            '=' => {
                let hi = chars.next();
                let lo = chars.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                        bytes.push(byte);
                        continue;
                    }
                }
            }
            other => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Unicode-NFKD normalizes, lowercases, and strips combining diacritics so
/// subject matching is accent-insensitive.
fn normalize_subject(s: &str) -> String {
    s.nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_subject_strips_diacritics_and_lowercases() {
        assert_eq!(
            normalize_subject("Factura Electrónica"),
            "factura electronica"
        );
    }

    #[test]
    fn search_query_includes_since_and_before() {
        let window = ScanWindow {
            since: chrono::NaiveDate::from_ymd_opt(2024, 1, 1),
            before: chrono::NaiveDate::from_ymd_opt(2024, 2, 1),
            unseen_only: true,
        };
        let query = build_search_query(&window);
        assert!(query.starts_with("UNSEEN"));
        assert!(query.contains("SINCE 01-Jan-2024"));
        assert!(query.contains("BEFORE 01-Feb-2024"));
    }

    #[test]
    fn extract_subject_reads_header_line() {
        let raw = "Subject: Factura 123\r\n\r\n";
        assert_eq!(extract_subject(raw), "Factura 123");
    }
}
