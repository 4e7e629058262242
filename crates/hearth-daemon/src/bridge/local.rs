//! Pass-through bridge to the hub web application over loopback HTTP.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::{debug, warn};

use super::{BridgedRequest, BridgedResponse, Method, RequestBridge, parse_header_block};

/// Request headers that describe the tunnel hop rather than the
/// request itself; the local client regenerates these.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "content-length",
    "upgrade",
    "te",
    "trailer",
];

/// Response headers that must not travel back through the tunnel.
const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "trailer",
];

/// Bridge construction errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Forwards tunneled requests to the hub's web interface.
#[derive(Debug)]
pub struct LocalWebBridge {
    http: reqwest::Client,
    base_url: String,
}

impl LocalWebBridge {
    /// Create a bridge targeting the web application at `base_url`
    /// (e.g. `http://127.0.0.1:8080`).
    pub fn new(base_url: &str) -> Result<Self, BridgeError> {
        if base_url.is_empty() {
            return Err(BridgeError::Config("base_url is empty".into()));
        }

        // Ensure a TLS crypto provider is installed (reqwest uses
        // rustls-no-provider). The `Err` case just means it was already
        // installed, safe to ignore.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    fn request_headers(request: &BridgedRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in parse_header_block(&request.header_block) {
            if SKIP_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => debug!(header = %name, "Dropping unrepresentable request header"),
            }
        }
        if let Ok(forwarded) = HeaderValue::from_str(&request.originating_ip) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), forwarded);
        }
        headers
    }

    fn response_header_block(headers: &HeaderMap) -> String {
        let mut block = String::new();
        for (name, value) in headers {
            if SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            let Ok(value) = value.to_str() else {
                debug!(header = %name, "Dropping unrepresentable response header");
                continue;
            };
            block.push_str(name.as_str());
            block.push_str(": ");
            block.push_str(value);
            block.push_str("\r\n");
        }
        block
    }
}

#[async_trait]
impl RequestBridge for LocalWebBridge {
    async fn handle(&self, request: BridgedRequest) -> BridgedResponse {
        if !request.url.starts_with('/') {
            return BridgedResponse::bad_request();
        }

        let url = format!("{}{}", self.base_url, request.url);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let headers = Self::request_headers(&request);

        let result = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(request.body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Local web request failed");
                return BridgedResponse::bad_gateway();
            }
        };

        let status = u32::from(response.status().as_u16());
        let header_block = Self::response_header_block(response.headers());
        match response.bytes().await {
            Ok(body) => BridgedResponse {
                status,
                header_block,
                body,
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Failed reading local web response body");
                BridgedResponse::bad_gateway()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn sample_request(url: &str, header_block: &str) -> BridgedRequest {
        BridgedRequest {
            originating_ip: "1.2.3.4".to_string(),
            method: Method::Get,
            url: url.to_string(),
            header_block: header_block.to_string(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn rejects_empty_base_url() {
        assert!(LocalWebBridge::new("").is_err());
    }

    #[test]
    fn hop_headers_are_dropped_and_forwarded_for_added() {
        let request = sample_request("/", "Host: hub\r\nConnection: close\r\nAccept: */*\r\n");
        let headers = LocalWebBridge::request_headers(&request);
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get("accept").unwrap(), "*/*");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.2.3.4");
    }

    #[tokio::test]
    async fn relative_url_is_required() {
        let bridge = LocalWebBridge::new("http://127.0.0.1:1").unwrap();
        let reply = bridge
            .handle(sample_request("http://evil.example/", ""))
            .await;
        assert_eq!(reply.status, 400);
    }

    #[tokio::test]
    async fn unreachable_application_yields_bad_gateway() {
        // nothing listens on port 1
        let bridge = LocalWebBridge::new("http://127.0.0.1:1").unwrap();
        let reply = bridge.handle(sample_request("/json.htm", "")).await;
        assert_eq!(reply.status, 502);
    }
}
