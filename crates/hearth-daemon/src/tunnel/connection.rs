//! The tunnel connection state machine.
//!
//! One `TunnelConnection` owns one TLS session to the relay and runs as
//! a single task, so every socket operation is strictly sequential: at
//! most one read and one write are ever in flight, and no PDU is
//! dispatched before the previous one's handling (including any reply
//! write) has finished. Transport failures are transient (close, wait
//! a fixed delay, dial again); an authentication rejection or an
//! explicit shutdown is final.
//!
//! While a login is in flight the connection holds the shared
//! credentials lock, from the moment the TLS handshake completes until
//! the relay's verdict arrives. The guard lives in an `Option` on the
//! connection; releasing is `Option::take`, so every exit path out of
//! the pending-login phase lets go of the lock exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, error, info, warn};

use hearth_proto::{
    Decoded, FieldError, Pdu, PduType, PayloadReader, PayloadWriter, SUBSYSTEM_HTTP, encode,
    try_decode,
};

use crate::bridge::{BridgedRequest, Method, RequestBridge};
use crate::storage::Database;

use super::config::TunnelConfig;
use super::credentials::{Credentials, CredentialsLock, PREF_INSTANCE_ID};
use super::error::TunnelError;

/// Read granularity for the relay stream.
const READ_CHUNK: usize = 4096;

/// Upper bound on the originating-ip dedup set.
const SEEN_IPS_CAP: usize = 1024;

/// Where the connection currently sits. `Stopped` is terminal and
/// entered exactly once; every other state can recur across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticating,
    Authenticated,
    Stopped,
}

type RelayStream = TlsStream<TcpStream>;

/// Why a session ended for good rather than with a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    AuthRejected,
}

/// Outcome of dispatching one PDU.
enum Flow {
    Continue,
    Terminal(SessionEnd),
}

/// Result of picking apart a request PDU's payload.
enum ParsedRequest {
    Http(BridgedRequest),
    OtherSubsystem(u32),
}

/// Dedup set for "incoming connection" log lines. Reset when full so a
/// long-lived daemon cannot grow it without bound.
struct SeenIps {
    set: HashSet<String>,
}

impl SeenIps {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
        }
    }

    /// True the first time an address is seen (and after a reset).
    fn first_sighting(&mut self, ip: &str) -> bool {
        if self.set.contains(ip) {
            return false;
        }
        if self.set.len() >= SEEN_IPS_CAP {
            self.set.clear();
        }
        self.set.insert(ip.to_string());
        true
    }
}

/// A single outbound relay connection: dial, authenticate, serve.
pub struct TunnelConnection {
    config: TunnelConfig,
    credentials: Credentials,
    store: Database,
    bridge: Arc<dyn RequestBridge>,
    connector: TlsConnector,
    creds_lock: CredentialsLock,
    /// Held while a login awaits its verdict; `Some` doubles as the
    /// "do I hold the lock" flag.
    auth_guard: Option<OwnedMutexGuard<()>>,
    state_tx: watch::Sender<ConnectionState>,
    seen_ips: SeenIps,
}

impl TunnelConnection {
    /// Build a connection. Credentials are validated here: without an
    /// api key and password the connection is born `Stopped` and
    /// [`Self::run`] returns without ever dialing.
    pub fn new(
        config: TunnelConfig,
        credentials: Credentials,
        store: Database,
        bridge: Arc<dyn RequestBridge>,
        connector: TlsConnector,
        creds_lock: CredentialsLock,
    ) -> Self {
        let initial = if credentials.is_complete() {
            ConnectionState::Disconnected
        } else {
            warn!("Relay credentials not configured; tunnel disabled");
            ConnectionState::Stopped
        };
        let (state_tx, _) = watch::channel(initial);
        Self {
            config,
            credentials,
            store,
            bridge,
            connector,
            creds_lock,
            auth_guard: None,
            state_tx,
            seen_ips: SeenIps::new(),
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Drive the connection until shutdown or a permanent stop.
    ///
    /// Transport errors close the session, wait the fixed reconnect
    /// delay, and dial again with the current credentials (including a
    /// relay-reassigned instance id). The loop checks the shutdown
    /// signal before scheduling any further work.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.current_state() == ConnectionState::Stopped {
            return;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.connect_and_run(&mut shutdown).await {
                Ok(SessionEnd::Shutdown | SessionEnd::AuthRejected) => break,
                Err(e) => {
                    // A failure between handshake and the auth verdict
                    // must not keep the shared lock hostage.
                    self.release_auth_guard();
                    self.set_state(ConnectionState::Disconnected);
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(
                        error = %e,
                        delay = ?self.config.reconnect_delay,
                        "Tunnel connection lost, reconnecting"
                    );
                    tokio::select! {
                        () = sleep(self.config.reconnect_delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.release_auth_guard();
        self.set_state(ConnectionState::Stopped);
        info!("Tunnel connection stopped");
    }

    /// One full session: dial, handshake, log in, serve PDUs.
    async fn connect_and_run(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, TunnelError> {
        self.set_state(ConnectionState::Connecting);
        let tcp = self.connect_tcp().await?;
        if *shutdown.borrow() {
            return Ok(SessionEnd::Shutdown);
        }

        self.set_state(ConnectionState::Handshaking);
        let server_name = ServerName::try_from(self.config.relay_host.clone())
            .map_err(|e| TunnelError::Tls(format!("invalid relay host name: {e}")))?;
        let mut stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::Tls(e.to_string()))?;
        if *shutdown.borrow() {
            return Ok(SessionEnd::Shutdown);
        }

        // Nobody may rewrite the stored identity while this login is in
        // flight; hold the lock until the relay's verdict.
        self.acquire_auth_guard().await;
        self.send_authenticate(&mut stream).await?;

        self.read_loop(&mut stream, shutdown).await
    }

    /// Resolve the relay and try every address in order.
    async fn connect_tcp(&self) -> Result<TcpStream, TunnelError> {
        let addrs: Vec<_> =
            tokio::net::lookup_host((self.config.relay_host.as_str(), self.config.relay_port))
                .await
                .map_err(|e| TunnelError::Resolve(e.to_string()))?
                .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(%addr, "Connected to relay");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(TunnelError::Connect(last_err.map_or_else(
            || "relay host resolved to no addresses".to_string(),
            |e| e.to_string(),
        )))
    }

    /// Read and dispatch PDUs until the session ends one way or the
    /// other. Every read is armed with the idle timeout; data arrival
    /// disarms it.
    async fn read_loop(
        &mut self,
        stream: &mut RelayStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, TunnelError> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            // Drain every complete frame before reading again.
            loop {
                if *shutdown.borrow() {
                    return Ok(SessionEnd::Shutdown);
                }
                match try_decode(&buf) {
                    Decoded::Incomplete => break,
                    Decoded::Malformed { type_id, skip } => {
                        warn!(type_id, "Skipping frame with unknown PDU type");
                        buf.advance(skip);
                    }
                    Decoded::Pdu { pdu, consumed } => {
                        buf.advance(consumed);
                        if let Flow::Terminal(end) = self.dispatch(stream, &pdu).await? {
                            return Ok(end);
                        }
                    }
                }
            }

            tokio::select! {
                read = timeout(self.config.read_timeout, stream.read_buf(&mut buf)) => {
                    match read {
                        Err(_elapsed) => return Err(TunnelError::IdleTimeout(self.config.read_timeout)),
                        Ok(Ok(0)) => return Err(TunnelError::Closed),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => return Err(e.into()),
                    }
                }
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
            }
        }
    }

    /// Route one PDU. Anything unexpected is logged and survived; the
    /// relay stream is never torn down over a protocol anomaly.
    async fn dispatch(
        &mut self,
        stream: &mut RelayStream,
        pdu: &Pdu,
    ) -> Result<Flow, TunnelError> {
        match pdu.kind {
            PduType::Request => {
                if self.credentials.allowed_subsystems & SUBSYSTEM_HTTP == 0 {
                    warn!("Web access disallowed by subsystem mask, denying request");
                    return Ok(Flow::Continue);
                }
                self.handle_request(stream, &pdu.payload).await?;
                Ok(Flow::Continue)
            }
            PduType::AssignKey => {
                self.handle_assign_key(stream, &pdu.payload).await?;
                Ok(Flow::Continue)
            }
            PduType::Enquire => {
                // Heartbeat. Reply only; the loop is already reading.
                Self::write_pdu(stream, PduType::Enquire, &[]).await?;
                Ok(Flow::Continue)
            }
            PduType::AuthResp => Ok(self.handle_auth_resp(&pdu.payload)),
            PduType::Authenticate | PduType::Response => {
                warn!(kind = ?pdu.kind, "Ignoring client-bound PDU arriving from the relay");
                Ok(Flow::Continue)
            }
        }
    }

    /// Serve one proxied web request and write the reply PDU.
    async fn handle_request(
        &mut self,
        stream: &mut RelayStream,
        payload: &[u8],
    ) -> Result<(), TunnelError> {
        let request = match parse_request(payload) {
            Err(e) => {
                warn!(error = %e, "Invalid request PDU");
                return Ok(());
            }
            Ok(ParsedRequest::OtherSubsystem(subsystem)) => {
                warn!(subsystem, "Request for unsupported subsystem");
                return Ok(());
            }
            Ok(ParsedRequest::Http(request)) => request,
        };

        if self.seen_ips.first_sighting(&request.originating_ip) {
            info!(ip = %request.originating_ip, "Incoming connection from new address");
        }
        debug!(method = request.method.as_str(), url = %request.url, "Proxying web request");

        let reply = self.bridge.handle(request).await;

        let mut w = PayloadWriter::new();
        w.add_u32(reply.status);
        w.add_part(reply.header_block.as_bytes());
        w.add_part(&reply.body);
        Self::write_pdu(stream, PduType::Response, &w.finish()).await
    }

    /// The relay handed us a new instance id: persist it, adopt it, and
    /// log in again on the same stream.
    async fn handle_assign_key(
        &mut self,
        stream: &mut RelayStream,
        payload: &[u8],
    ) -> Result<(), TunnelError> {
        let mut fields = PayloadReader::new(payload);
        let new_id = match fields.next_part() {
            Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Err(e) => {
                warn!(error = %e, "Invalid assign-key PDU");
                return Ok(());
            }
        };
        info!(instance_id = %new_id, "Relay assigned an instance id");

        if let Err(e) = self.store.set_preference(PREF_INSTANCE_ID, &new_id).await {
            // The id still applies to this session; a store hiccup must
            // not take the tunnel down.
            error!(error = %e, "Failed to persist assigned instance id");
        }
        self.credentials.instance_id = new_id;

        self.acquire_auth_guard().await;
        self.send_authenticate(stream).await
    }

    /// Handle the relay's login verdict.
    fn handle_auth_resp(&mut self, payload: &[u8]) -> Flow {
        let was_pending = self.current_state() == ConnectionState::Authenticating;
        // The verdict ends the login round trip: let go of the shared
        // lock before any parsing, so a malformed PDU cannot keep it.
        self.release_auth_guard();

        if !was_pending {
            warn!("Authentication response outside a pending login, ignoring");
            return Flow::Continue;
        }

        let mut fields = PayloadReader::new(payload);
        let verdict = match fields.next_u32() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Invalid authentication response PDU");
                return Flow::Continue;
            }
        };
        let reason = match fields.next_part() {
            Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Err(e) => {
                warn!(error = %e, "Invalid authentication response PDU");
                return Flow::Continue;
            }
        };

        if verdict == 0 {
            error!(reason = %reason, "Relay rejected authentication, stopping tunnel");
            return Flow::Terminal(SessionEnd::AuthRejected);
        }
        info!("Authenticated with relay");
        self.set_state(ConnectionState::Authenticated);
        Flow::Continue
    }

    /// Send the credentials PDU and enter the pending-login phase.
    async fn send_authenticate(&mut self, stream: &mut RelayStream) -> Result<(), TunnelError> {
        self.set_state(ConnectionState::Authenticating);
        let mut w = PayloadWriter::new();
        w.add_part(self.credentials.api_key.as_bytes());
        w.add_part(self.credentials.instance_id.as_bytes());
        w.add_part(self.credentials.password.as_bytes());
        w.add_part(self.credentials.app_version.as_bytes());
        w.add_u32(self.credentials.allowed_subsystems);
        Self::write_pdu(stream, PduType::Authenticate, &w.finish()).await
    }

    /// Single-flight write: the connection task owns the stream and
    /// awaits completion before touching the socket again.
    async fn write_pdu(
        stream: &mut RelayStream,
        kind: PduType,
        payload: &[u8],
    ) -> Result<(), TunnelError> {
        let frame = encode(kind, payload);
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Take the shared credentials lock unless this connection already
    /// holds it (a re-login triggered while one is pending must not
    /// self-deadlock).
    async fn acquire_auth_guard(&mut self) {
        if self.auth_guard.is_none() {
            self.auth_guard = Some(Arc::clone(&self.creds_lock).lock_owned().await);
            debug!("Acquired credentials lock");
        }
    }

    /// Release the shared credentials lock if held. `Option::take`
    /// makes a double release impossible.
    fn release_auth_guard(&mut self) {
        if self.auth_guard.take().is_some() {
            debug!("Released credentials lock");
        }
    }
}

/// Decode a request PDU's field sequence: originating ip, subsystem,
/// and, for the web subsystem, url, header block, and body.
fn parse_request(payload: &[u8]) -> Result<ParsedRequest, FieldError> {
    let mut fields = PayloadReader::new(payload);
    let originating_ip = String::from_utf8_lossy(fields.next_part()?).into_owned();
    let subsystem = fields.next_u32()?;
    if subsystem != SUBSYSTEM_HTTP {
        return Ok(ParsedRequest::OtherSubsystem(subsystem));
    }

    let url = String::from_utf8_lossy(fields.next_part()?).into_owned();
    let header_block = String::from_utf8_lossy(fields.next_part()?).into_owned();
    let body = Bytes::copy_from_slice(fields.next_part()?);
    let method = Method::from_body(&body);
    Ok(ParsedRequest::Http(BridgedRequest {
        originating_ip,
        method,
        url,
        header_block,
        body,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use async_trait::async_trait;

    use crate::bridge::BridgedResponse;
    use crate::tunnel::tls::build_connector;

    use super::*;

    struct NoopBridge;

    #[async_trait]
    impl RequestBridge for NoopBridge {
        async fn handle(&self, _request: BridgedRequest) -> BridgedResponse {
            BridgedResponse::bad_request()
        }
    }

    fn test_credentials() -> Credentials {
        Credentials {
            api_key: "k1".into(),
            instance_id: String::new(),
            password: "p1".into(),
            app_version: "1.0".into(),
            allowed_subsystems: SUBSYSTEM_HTTP,
        }
    }

    async fn test_connection(credentials: Credentials) -> (TunnelConnection, CredentialsLock) {
        let config = TunnelConfig::new("127.0.0.1".into(), 1, "1.0".into());
        let store = Database::open_in_memory().await.unwrap();
        let connector = build_connector(&config).unwrap();
        let lock = CredentialsLock::default();
        let conn = TunnelConnection::new(
            config,
            credentials,
            store,
            Arc::new(NoopBridge),
            connector,
            Arc::clone(&lock),
        );
        (conn, lock)
    }

    fn auth_resp_payload(verdict: u32, reason: &str) -> Bytes {
        let mut w = PayloadWriter::new();
        w.add_u32(verdict);
        w.add_part(reason.as_bytes());
        w.finish()
    }

    #[tokio::test]
    async fn incomplete_credentials_mean_stopped_at_birth() {
        let (conn, _lock) = test_connection(Credentials {
            api_key: String::new(),
            ..test_credentials()
        })
        .await;
        assert_eq!(conn.current_state(), ConnectionState::Stopped);

        // run returns without dialing anything
        let (_tx, rx) = watch::channel(false);
        conn.run(rx).await;
    }

    #[tokio::test]
    async fn auth_success_releases_lock_once_and_authenticates() {
        let (mut conn, lock) = test_connection(test_credentials()).await;
        conn.set_state(ConnectionState::Authenticating);
        conn.auth_guard = Some(Arc::clone(&lock).lock_owned().await);
        assert!(lock.try_lock().is_err());

        let flow = conn.handle_auth_resp(&auth_resp_payload(1, ""));
        assert!(matches!(flow, Flow::Continue));
        assert_eq!(conn.current_state(), ConnectionState::Authenticated);
        assert!(conn.auth_guard.is_none());
        assert!(lock.try_lock().is_ok());

        // a second release is a no-op, not a double unlock
        conn.release_auth_guard();
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn auth_rejection_releases_lock_and_is_terminal() {
        let (mut conn, lock) = test_connection(test_credentials()).await;
        conn.set_state(ConnectionState::Authenticating);
        conn.auth_guard = Some(Arc::clone(&lock).lock_owned().await);

        let flow = conn.handle_auth_resp(&auth_resp_payload(0, "bad password"));
        assert!(matches!(
            flow,
            Flow::Terminal(SessionEnd::AuthRejected)
        ));
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn malformed_auth_resp_still_releases_lock() {
        let (mut conn, lock) = test_connection(test_credentials()).await;
        conn.set_state(ConnectionState::Authenticating);
        conn.auth_guard = Some(Arc::clone(&lock).lock_owned().await);

        // truncated: verdict present, reason part missing
        let mut w = PayloadWriter::new();
        w.add_u32(1);
        let flow = conn.handle_auth_resp(&w.finish());
        assert!(matches!(flow, Flow::Continue));
        // still pending, but the lock is free
        assert_eq!(conn.current_state(), ConnectionState::Authenticating);
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn auth_resp_outside_login_is_ignored() {
        let (mut conn, _lock) = test_connection(test_credentials()).await;
        conn.set_state(ConnectionState::Authenticated);

        let flow = conn.handle_auth_resp(&auth_resp_payload(0, "nope"));
        assert!(matches!(flow, Flow::Continue));
        assert_eq!(conn.current_state(), ConnectionState::Authenticated);
    }

    #[test]
    fn parse_request_splits_http_fields() {
        let mut w = PayloadWriter::new();
        w.add_part(b"1.2.3.4");
        w.add_u32(SUBSYSTEM_HTTP);
        w.add_part(b"/json.htm");
        w.add_part(b"Host: x\r\n");
        w.add_part(b"");
        let payload = w.finish();

        let Ok(ParsedRequest::Http(request)) = parse_request(&payload) else {
            panic!("expected an http request");
        };
        assert_eq!(request.originating_ip, "1.2.3.4");
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.url, "/json.htm");
        assert_eq!(request.header_block, "Host: x\r\n");
        assert!(request.body.is_empty());
    }

    #[test]
    fn parse_request_flags_other_subsystems() {
        let mut w = PayloadWriter::new();
        w.add_part(b"1.2.3.4");
        w.add_u32(99);
        let payload = w.finish();

        assert!(matches!(
            parse_request(&payload),
            Ok(ParsedRequest::OtherSubsystem(99))
        ));
    }

    #[test]
    fn parse_request_reports_truncation() {
        let mut w = PayloadWriter::new();
        w.add_part(b"1.2.3.4");
        let payload = w.finish();
        assert!(parse_request(&payload).is_err());
    }

    #[test]
    fn seen_ips_dedups_and_stays_bounded() {
        let mut seen = SeenIps::new();
        assert!(seen.first_sighting("1.2.3.4"));
        assert!(!seen.first_sighting("1.2.3.4"));
        assert!(seen.first_sighting("5.6.7.8"));

        for i in 0..SEEN_IPS_CAP {
            seen.first_sighting(&format!("10.0.{}.{}", i / 256, i % 256));
        }
        assert!(seen.set.len() <= SEEN_IPS_CAP);
    }
}
