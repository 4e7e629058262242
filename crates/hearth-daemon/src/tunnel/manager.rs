//! Tunnel lifecycle management.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bridge::RequestBridge;
use crate::storage::Database;

use super::config::TunnelConfig;
use super::connection::{ConnectionState, TunnelConnection};
use super::credentials::{Credentials, CredentialsLock};
use super::error::TunnelError;
use super::tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

/// Owns the tunnel connection's worker task: `start` spawns it, `stop`
/// signals it and joins. `Stopped` is terminal.
pub struct TunnelManager {
    config: TunnelConfig,
    store: Database,
    bridge: Arc<dyn RequestBridge>,
    creds_lock: CredentialsLock,
    lifecycle: Lifecycle,
    shutdown_tx: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
}

impl TunnelManager {
    pub fn new(
        config: TunnelConfig,
        store: Database,
        bridge: Arc<dyn RequestBridge>,
        creds_lock: CredentialsLock,
    ) -> Self {
        Self {
            config,
            store,
            bridge,
            creds_lock,
            lifecycle: Lifecycle::NotStarted,
            shutdown_tx: None,
            worker: None,
            state_rx: None,
        }
    }

    /// Load credentials, build the TLS context, and spawn the
    /// connection worker. Does nothing when already started or stopped.
    pub async fn start(&mut self) -> Result<(), TunnelError> {
        if self.lifecycle != Lifecycle::NotStarted {
            return Ok(());
        }

        let credentials = Credentials::load(
            &self.store,
            self.config.app_version.clone(),
            self.config.allowed_subsystems,
        )
        .await?;
        let connector = tls::build_connector(&self.config)?;

        let connection = TunnelConnection::new(
            self.config.clone(),
            credentials,
            self.store.clone(),
            Arc::clone(&self.bridge),
            connector,
            Arc::clone(&self.creds_lock),
        );
        self.state_rx = Some(connection.state());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.worker = Some(tokio::spawn(connection.run(shutdown_rx)));
        self.lifecycle = Lifecycle::Running;

        info!(
            host = %self.config.relay_host,
            port = self.config.relay_port,
            "Tunnel worker started"
        );
        Ok(())
    }

    /// Signal the connection to stop and join the worker task.
    /// Idempotent; calling before `start` is a no-op.
    pub async fn stop(&mut self) {
        if self.lifecycle == Lifecycle::NotStarted {
            return;
        }
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Tunnel worker failed");
            }
        }
        if self.lifecycle == Lifecycle::Running {
            info!("Tunnel worker stopped");
        }
        self.lifecycle = Lifecycle::Stopped;
    }

    /// Observe the connection's state; `None` before `start`.
    pub fn state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use crate::bridge::{BridgedRequest, BridgedResponse};

    use super::*;

    struct NoopBridge;

    #[async_trait]
    impl RequestBridge for NoopBridge {
        async fn handle(&self, _request: BridgedRequest) -> BridgedResponse {
            BridgedResponse::bad_request()
        }
    }

    async fn test_manager() -> TunnelManager {
        let store = Database::open_in_memory().await.unwrap();
        let config = TunnelConfig::new("127.0.0.1".into(), 1, "1.0".into());
        TunnelManager::new(
            config,
            store,
            Arc::new(NoopBridge),
            CredentialsLock::default(),
        )
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let mut manager = test_manager().await;
        manager.stop().await;
        assert!(manager.state().is_none());
        // a premature stop does not use up the lifecycle
        manager.start().await.unwrap();
        assert!(manager.state().is_some());
        manager.stop().await;
        // stopped is terminal: a later start stays inert
        manager.start().await.unwrap();
        assert!(manager.worker.is_none());
    }

    #[tokio::test]
    async fn unconfigured_credentials_stop_immediately() {
        let mut manager = test_manager().await;
        manager.start().await.unwrap();

        let mut state = manager.state().unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Stopped)
            .await
            .unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut manager = test_manager().await;
        manager.start().await.unwrap();
        manager.stop().await;
        manager.stop().await;
    }
}
