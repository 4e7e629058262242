//! Tunnel client error types.

/// Errors that can occur in the tunnel client.
///
/// Everything here is transient from the connection's point of view:
/// the run loop answers each with a backoff and a fresh dial. The two
/// permanent outcomes (unusable credentials, authentication rejection)
/// are states, not errors.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read idle for {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("Connection closed by relay")]
    Closed,

    #[error("Store error: {0}")]
    Store(#[from] crate::storage::DatabaseError),
}
