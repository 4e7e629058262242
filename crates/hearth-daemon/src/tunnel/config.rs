//! Tunnel client configuration.

use std::path::PathBuf;
use std::time::Duration;

use hearth_proto::SUBSYSTEM_HTTP;

/// Configuration for the daemon's tunnel connection to the relay.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Relay hostname (connected outward, never listened on).
    pub relay_host: String,

    /// Relay TCP port.
    pub relay_port: u16,

    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,

    /// How long a read may sit idle before the connection is recycled.
    pub read_timeout: Duration,

    /// Bitmask of relay subsystems this daemon is willing to serve.
    pub allowed_subsystems: u32,

    /// Application version string sent during authentication.
    pub app_version: String,

    /// Skip certificate verification for the relay connection.
    ///
    /// Defaults to `true`: the daemon talks to exactly one well-known
    /// relay and favors connectivity over chain validation. Set to
    /// `false` together with [`Self::relay_ca_cert`] to pin the relay's
    /// CA instead.
    pub insecure_skip_verify: bool,

    /// Path to a PEM CA certificate to verify the relay against. When
    /// set, verification is enabled regardless of
    /// [`Self::insecure_skip_verify`].
    pub relay_ca_cert: Option<PathBuf>,
}

impl TunnelConfig {
    /// Create a config for the given relay endpoint with defaults.
    pub fn new(relay_host: String, relay_port: u16, app_version: String) -> Self {
        Self {
            relay_host,
            relay_port,
            reconnect_delay: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            allowed_subsystems: SUBSYSTEM_HTTP,
            app_version,
            insecure_skip_verify: true,
            relay_ca_cert: None,
        }
    }
}
