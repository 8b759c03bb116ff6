//! Page Fetcher
//!
//! Downloads a page and reduces it to plain text for evidence extraction.
//! Only `http(s)` URLs on public hosts are fetched; HTML is rendered to text
//! with `html2text`, and both the download and the output are capped in size.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use html2text::render::TrivialDecorator;
use reqwest::Client;
use tracing::debug;

use crate::gateway::{retry_after_header, ToolError};

/// Maximum download size (5MB)
const MAX_DOWNLOAD_SIZE: usize = 5 * 1024 * 1024;

/// Maximum extracted text (characters)
const MAX_OUTPUT_CHARS: usize = 60_000;

/// Render width; wide enough that paragraphs are not wrapped.
const RENDER_WIDTH: usize = 10_000;

const USER_AGENT: &str = concat!("research-agent/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, ToolError>;
}

pub struct HttpFetcher {
    client: Client,
    allow_private_hosts: bool,
    max_chars: usize,
    max_download_bytes: usize,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            allow_private_hosts: false,
            max_chars: MAX_OUTPUT_CHARS,
            max_download_bytes: MAX_DOWNLOAD_SIZE,
        }
    }

    /// Permit loopback and private addresses (local test servers).
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn with_max_download_bytes(mut self, max_bytes: usize) -> Self {
        self.max_download_bytes = max_bytes;
        self
    }

    fn validate_url(&self, raw: &str) -> Result<url::Url, ToolError> {
        let url = url::Url::parse(raw).map_err(|e| ToolError::permanent(format!("invalid URL {}: {}", raw, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::permanent(format!("unsupported URL scheme: {}", url.scheme())));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ToolError::permanent(format!("URL has no host: {}", raw)))?;

        if !self.allow_private_hosts && is_private_host(host) {
            return Err(ToolError::permanent(format!("blocked private address: {}", host)));
        }

        Ok(url)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, raw_url: &str) -> Result<String, ToolError> {
        let url = self.validate_url(raw_url)?;

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| ToolError::from_reqwest("fetch", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            return Err(ToolError::from_status("fetch", status, "", retry_after));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_download_bytes as u64 {
                return Err(ToolError::permanent(format!("page too large: {} bytes", length)));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_lowercase();

        let is_html = content_type.contains("text/html") || content_type.contains("application/xhtml");
        if !is_html && !content_type.starts_with("text/") {
            return Err(ToolError::permanent(format!("unsupported content type: {}", content_type)));
        }

        // Chunked responses carry no length, so the cap is enforced while reading
        let mut body: Vec<u8> = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| ToolError::from_reqwest("fetch", e))?;
            if body.len() + chunk.len() > self.max_download_bytes {
                return Err(ToolError::permanent(format!(
                    "page too large: over {} bytes",
                    self.max_download_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let text = if is_html {
            html_to_text(&body)?
        } else {
            tidy_text(&String::from_utf8_lossy(&body))
        };
        let text = truncate_chars(text, self.max_chars);

        debug!(url = %url, chars = text.len(), "Fetched page");
        Ok(text)
    }
}

/// Render an HTML document to readable plain text.
pub fn html_to_text(html: &[u8]) -> Result<String, ToolError> {
    let rendered = html2text::from_read_with_decorator(html, RENDER_WIDTH, TrivialDecorator::new())
        .map_err(|e| ToolError::permanent(format!("unreadable HTML: {}", e)))?;
    Ok(tidy_text(&rendered))
}

/// Collapse runs of whitespace within lines and of blank lines between them.
fn tidy_text(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut gap = false;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            gap = !lines.is_empty();
            continue;
        }
        if gap {
            lines.push(String::new());
            gap = false;
        }
        lines.push(line);
    }
    lines.join("\n")
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

fn is_private_host(host: &str) -> bool {
    let lower = host.trim_start_matches('[').trim_end_matches(']').to_lowercase();
    if lower == "localhost" || lower.ends_with(".local") || lower.ends_with(".internal") {
        return true;
    }

    match lower.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
        }
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            let unique_local = first & 0xfe00 == 0xfc00;
            let link_local = first & 0xffc0 == 0xfe80;
            let mapped_private = ip
                .to_ipv4_mapped()
                .is_some_and(|v4| v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified());
            ip.is_loopback() || ip.is_unspecified() || unique_local || link_local || mapped_private
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ToolErrorKind;

    #[test]
    fn test_html_to_text_strips_markup() {
        let html = r#"<html><head><style>p { color: red }</style></head>
            <body><script>var x = "<p>not text</p>";</script>
            <h1>QUIC &amp; HTTP/3</h1><!-- nav -->
            <p>HTTP/3 runs over&nbsp;<b>QUIC</b>.</p><p>It removes head-of-line blocking.</p>
            </body></html>"#;

        let text = html_to_text(html.as_bytes()).unwrap();
        assert!(text.contains("QUIC & HTTP/3"));
        assert!(text.contains("HTTP/3 runs over QUIC."));
        assert!(text.contains("It removes head-of-line blocking."));
        assert!(!text.contains("not text"));
        assert!(!text.contains("color"));
        assert!(!text.contains("nav"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_html_to_text_decodes_entities() {
        let html = "<p>Google&#8217;s I/O &#x2014; pricing is &euro;19 &copy; 2025</p>";
        assert_eq!(
            html_to_text(html.as_bytes()).unwrap(),
            "Google\u{2019}s I/O \u{2014} pricing is \u{20ac}19 \u{a9} 2025"
        );
    }

    #[test]
    fn test_tidy_text_collapses_blank_runs() {
        assert_eq!(tidy_text("\n\n  one   two \n\n\n\tthree\n\n"), "one two\n\nthree");
    }

    #[test]
    fn test_is_private_host() {
        assert!(is_private_host("localhost"));
        assert!(is_private_host("127.0.0.1"));
        assert!(is_private_host("192.168.1.10"));
        assert!(is_private_host("[::1]"));
        assert!(is_private_host("[fd12:3456:789a::1]"));
        assert!(is_private_host("[fc00::1]"));
        assert!(is_private_host("[fe80::1]"));
        assert!(is_private_host("[::ffff:10.0.0.1]"));
        assert!(!is_private_host("example.com"));
        assert!(!is_private_host("8.8.8.8"));
        assert!(!is_private_host("[2606:4700::1111]"));
    }

    #[tokio::test]
    async fn test_rejects_bad_urls_permanently() {
        let fetcher = HttpFetcher::new();
        for url in ["not a url", "ftp://example.com/file", "http://127.0.0.1:8080/admin"] {
            let err = fetcher.fetch(url).await.unwrap_err();
            assert_eq!(err.kind, ToolErrorKind::Permanent, "{}", url);
        }
    }

    #[tokio::test]
    async fn test_fetches_and_extracts_html() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/article")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html><body><p>First paragraph.</p><p>Second paragraph.</p></body></html>")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new().allow_private_hosts().with_max_chars(20);
        let text = fetcher.fetch(&format!("{}/article", server.url())).await.unwrap();
        assert_eq!(text.chars().count(), 20);
        assert!(text.starts_with("First paragraph."));
    }

    #[tokio::test]
    async fn test_status_and_content_type_classification() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/missing").with_status(404).create_async().await;
        server.mock("GET", "/flaky").with_status(502).create_async().await;
        server
            .mock("GET", "/image.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(vec![0u8; 16])
            .create_async()
            .await;

        let fetcher = HttpFetcher::new().allow_private_hosts();
        let base = server.url();

        let err = fetcher.fetch(&format!("{}/missing", base)).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Permanent);
        let err = fetcher.fetch(&format!("{}/flaky", base)).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Transient);
        let err = fetcher.fetch(&format!("{}/image.png", base)).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_chunked_body_over_cap_is_rejected() {
        use std::io::Write;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/huge")
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_chunked_body(|w| {
                for _ in 0..64 {
                    w.write_all(&[b'a'; 1024])?;
                }
                Ok(())
            })
            .create_async()
            .await;

        let fetcher = HttpFetcher::new().allow_private_hosts().with_max_download_bytes(4 * 1024);
        let err = fetcher.fetch(&format!("{}/huge", server.url())).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Permanent);
        assert!(err.message.contains("page too large: over 4096 bytes"));
    }
}
