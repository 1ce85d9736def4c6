//! C6: walks a parsed message's MIME tree for PDF/XML attachments, and
//! failing that, follows candidate download links found in HTML bodies.

use std::time::Duration;

use mail_parser::{MessageParser, MimeHeaders};
use thiserror::Error;
use tracing::instrument;

const LINK_KEYWORDS: &[&str] = &[
    "pdf",
    "descargar",
    "imprimir",
    "visualizar",
    "factura electrónica",
    "generar pdf",
];

const TOP_LEVEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOP_LEVEL_READ_TIMEOUT: Duration = Duration::from_secs(15);
const RECURSIVE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const RECURSIVE_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DOWNLOAD_ATTEMPTS: u32 = 2;
const RECURSIVE_FANOUT_CAP: usize = 5;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no PDF or XML candidate found")]
    NoCandidate,
    #[error("download failed: {0}")]
    Download(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Pdf,
    Xml,
}

#[derive(Clone, Debug)]
pub struct ResolvedAttachment {
    pub filename: String,
    pub kind: Kind,
    pub bytes: Vec<u8>,
}

pub struct AttachmentResolver {
    client: reqwest::Client,
}

impl AttachmentResolver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
                )
                .build()
                .expect("reqwest client config is static and valid"),
        }
    }

    /// Walks `raw_message`'s MIME tree for a PDF/XML attachment; if none is
    /// found, extracts candidate links from any HTML body and downloads
    /// the first one that resolves to a PDF or XML.
    #[instrument(skip(self, raw_message))]
    pub async fn resolve(&self, raw_message: &[u8]) -> Result<ResolvedAttachment, ResolveError> {
        let message = MessageParser::default()
            .parse(raw_message)
            .ok_or(ResolveError::NoCandidate)?;

        for attachment in message.attachments() {
            let filename = attachment.attachment_name().unwrap_or("attachment").to_string();
            let content_type = attachment
                .content_type()
                .map(|ct| ct.ctype().to_string())
                .unwrap_or_default();
            if let Some(kind) = classify(&filename, &content_type, attachment.contents()) {
                return Ok(ResolvedAttachment {
                    filename,
                    kind,
                    bytes: attachment.contents().to_vec(),
                });
            }
        }

        let mut candidates = Vec::new();
        for html in message.html_bodies() {
            candidates.extend(extract_candidate_links(&html.text_contents().unwrap_or_default()));
        }

        for url in candidates {
            if let Ok(resolved) = self
                .download(&url, TOP_LEVEL_CONNECT_TIMEOUT, TOP_LEVEL_READ_TIMEOUT, 0)
                .await
            {
                return Ok(resolved);
            }
        }

        Err(ResolveError::NoCandidate)
    }

    async fn download(
        &self,
        url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        depth: usize,
    ) -> Result<ResolvedAttachment, ResolveError> {
        let mut last_err = None;
        for _attempt in 0..MAX_DOWNLOAD_ATTEMPTS {
            match self.try_download_once(url, connect_timeout, read_timeout).await {
                Ok(response) => return self.classify_response(url, response, depth).await,
                Err(e) => last_err = Some(e),
            }
        }
        Err(ResolveError::Download(
            last_err.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    async fn try_download_once(
        &self,
        url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<reqwest::Response, String> {
        self.client
            .get(url)
            .timeout(connect_timeout + read_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())
    }

    async fn classify_response(
        &self,
        url: &str,
        response: reqwest::Response,
        depth: usize,
    ) -> Result<ResolvedAttachment, ResolveError> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ResolveError::Download(e.to_string()))?;

        let filename = cuenly_storage_filename_hint(url);

        if let Some(kind) = classify(&filename, &content_type, &bytes) {
            return Ok(ResolvedAttachment {
                filename,
                kind,
                bytes: bytes.to_vec(),
            });
        }

        if depth < 1 && looks_like_html(&content_type, &bytes) {
            let text = String::from_utf8_lossy(&bytes);
            let mut nested = extract_candidate_links(&text);
            nested.truncate(RECURSIVE_FANOUT_CAP);
            for nested_url in nested {
                if let Ok(resolved) = Box::pin(self.download(
                    &nested_url,
                    RECURSIVE_CONNECT_TIMEOUT,
                    RECURSIVE_READ_TIMEOUT,
                    depth + 1,
                ))
                .await
                {
                    return Ok(resolved);
                }
            }
        }

        Err(ResolveError::NoCandidate)
    }
}

impl Default for AttachmentResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn cuenly_storage_filename_hint(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or("download")
        .to_string()
}

fn looks_like_html(content_type: &str, bytes: &[u8]) -> bool {
    content_type.contains("html") || bytes.starts_with(b"<!DOCTYPE") || bytes.starts_with(b"<html")
}

/// Classifies content by extension/Content-Type first, then falls back to
/// magic bytes (`%PDF-`, `<?xml`) when those are ambiguous.
fn classify(filename: &str, content_type: &str, bytes: &[u8]) -> Option<Kind> {
    let lower_name = filename.to_lowercase();
    if lower_name.ends_with(".pdf") || content_type.contains("pdf") || bytes.starts_with(b"%PDF-") {
        return Some(Kind::Pdf);
    }
    if lower_name.ends_with(".xml")
        || content_type.contains("xml")
        || bytes.starts_with(b"<?xml")
    {
        return Some(Kind::Xml);
    }
    None
}

/// Extracts anchor URLs whose href or text contains one of [`LINK_KEYWORDS`],
/// or whose href ends in `.pdf`.
fn extract_candidate_links(html: &str) -> Vec<String> {
    let mut out = Vec::new();
    // ASCII-only lowercasing, not `to_lowercase()`: it preserves `html`'s
    // byte offsets exactly, which the slicing below relies on. A handful
    // of codepoints (e.g. Turkish İ) expand under full Unicode lowercasing
    // and would misalign `lower`'s indices against `html`'s.
    let lower = html.to_ascii_lowercase();
    let mut search_from = 0usize;

    while let Some(tag_start) = lower[search_from..].find("<a ") {
        let abs_start = search_from + tag_start;
        let Some(tag_end) = lower[abs_start..].find('>') else {
            break;
        };
        let abs_tag_end = abs_start + tag_end;
        let tag = &html[abs_start..=abs_tag_end];
        let tag_lower = &lower[abs_start..=abs_tag_end];

        let close_tag_offset = lower[abs_tag_end..].find("</a>");
        let anchor_text_lower = close_tag_offset
            .map(|off| &lower[abs_tag_end + 1..abs_tag_end + off])
            .unwrap_or("");

        if let Some(href) = extract_href(tag) {
            let href_lower = href.to_lowercase();
            let matches = LINK_KEYWORDS
                .iter()
                .any(|kw| href_lower.contains(kw) || tag_lower.contains(kw) || anchor_text_lower.contains(kw))
                || href_lower.ends_with(".pdf");
            if matches {
                out.push(href);
            }
        }

        search_from = abs_tag_end + 1;
    }

    out
}

fn extract_href(tag: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let idx = lower.find("href=")?;
    let rest = &tag[idx + 5..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let end = rest[1..].find(quote)?;
    Some(rest[1..1 + end].to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_detects_pdf_by_magic_bytes() {
        assert_eq!(classify("unknown", "", b"%PDF-1.4"), Some(Kind::Pdf));
    }

    #[test]
    fn classify_detects_xml_by_extension() {
        assert_eq!(classify("invoice.xml", "", b""), Some(Kind::Xml));
    }

    #[test]
    fn extract_candidate_links_matches_keyword_in_href() {
        let html = r#"<p>See <a href="https://x.com/descargar?id=1">here</a> for your invoice.</p>"#;
        let links = extract_candidate_links(html);
        assert_eq!(links, vec!["https://x.com/descargar?id=1".to_string()]);
    }

    #[test]
    fn extract_candidate_links_matches_pdf_extension() {
        let html = r#"<a href="https://x.com/file.pdf">link</a>"#;
        let links = extract_candidate_links(html);
        assert_eq!(links, vec!["https://x.com/file.pdf".to_string()]);
    }

    #[test]
    fn extract_candidate_links_ignores_unrelated_anchors() {
        let html = r#"<a href="https://x.com/about">About us</a>"#;
        assert!(extract_candidate_links(html).is_empty());
    }

    #[test]
    fn extract_candidate_links_survives_length_changing_lowercase() {
        let html = "<p>İstanbul invoice</p><a href=\"https://x.com/file.pdf\">descargar</a>";
        let links = extract_candidate_links(html);
        assert_eq!(links, vec!["https://x.com/file.pdf".to_string()]);
    }
}
