//! Bridge between tunneled requests and the hub's local web application.
//!
//! The relay hands the daemon bare request material (url, header block,
//! body); the bridge turns that into a real request against the web
//! application and hands back status, headers, and body for the reply
//! PDU. The bridge never fails: anything unusable becomes a stock
//! error reply.

mod local;

use async_trait::async_trait;
use bytes::Bytes;

pub use local::{BridgeError, LocalWebBridge};

/// HTTP method of a tunneled request. The relay does not carry a method
/// field; a request with a body is a POST, anything else a GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Derive the method from the request body, as the wire contract
    /// defines it.
    pub const fn from_body(body: &[u8]) -> Self {
        if body.is_empty() { Self::Get } else { Self::Post }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// A tunneled request, decoded from the relay's field sequence.
#[derive(Debug, Clone)]
pub struct BridgedRequest {
    /// IP of the remote browser, as reported by the relay.
    pub originating_ip: String,
    pub method: Method,
    /// Absolute path (plus query) on the hub web application.
    pub url: String,
    /// Raw `Name: value\r\n` lines as carried on the wire.
    pub header_block: String,
    pub body: Bytes,
}

/// The reply material that goes back into a response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedResponse {
    pub status: u32,
    /// `Name: value\r\n` lines, one per header.
    pub header_block: String,
    pub body: Bytes,
}

impl BridgedResponse {
    /// Stock reply for requests the bridge cannot make sense of.
    pub fn bad_request() -> Self {
        Self::stock(400, "Bad Request")
    }

    /// Stock reply when the local web application is unreachable.
    pub fn bad_gateway() -> Self {
        Self::stock(502, "Bad Gateway")
    }

    fn stock(status: u32, title: &str) -> Self {
        let body = format!(
            "<html><head><title>{title}</title></head><body><h1>{status} {title}</h1></body></html>"
        );
        Self {
            status,
            header_block: "Content-Type: text/html\r\n".to_string(),
            body: Bytes::from(body),
        }
    }
}

/// Delegates a tunneled request to the local web application.
#[async_trait]
pub trait RequestBridge: Send + Sync {
    /// Produce a reply. Implementations must not fail; malformed input
    /// yields [`BridgedResponse::bad_request`] and connectivity trouble
    /// [`BridgedResponse::bad_gateway`].
    async fn handle(&self, request: BridgedRequest) -> BridgedResponse;
}

/// Split a raw header block into name/value pairs, skipping lines that
/// are not `Name: value`.
pub(crate) fn parse_header_block(block: &str) -> Vec<(String, String)> {
    block
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
