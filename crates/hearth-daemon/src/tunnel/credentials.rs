//! Relay identity material and the lock that guards it.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use hearth_core::db::base64_decode;

use crate::storage::{Database, DatabaseError};

/// Preference key holding the account api key.
pub const PREF_API_KEY: &str = "myhearth_api_key";
/// Preference key holding the relay-assigned instance id.
pub const PREF_INSTANCE_ID: &str = "myhearth_instance_id";
/// Preference key holding the base64-encoded account password.
pub const PREF_PASSWORD: &str = "myhearth_password";

/// Guards the persisted identity fields against concurrent mutation.
///
/// Shared with any other subsystem that reads or rewrites the stored
/// credentials; the tunnel connection holds it for the whole
/// authenticate round trip so nobody can swap the instance id out from
/// under a login in flight.
pub type CredentialsLock = Arc<Mutex<()>>;

/// The identity the daemon presents to the relay.
///
/// Only `instance_id` changes at runtime (the relay may assign a new
/// one); the rest is fixed for the life of the connection.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub instance_id: String,
    /// Decoded password; stored base64-encoded, decoded exactly once
    /// at load time.
    pub password: String,
    pub app_version: String,
    pub allowed_subsystems: u32,
}

impl Credentials {
    /// Load credentials from the preference store.
    pub async fn load(
        store: &Database,
        app_version: String,
        allowed_subsystems: u32,
    ) -> Result<Self, DatabaseError> {
        let api_key = store.get_preference(PREF_API_KEY).await?.unwrap_or_default();
        let instance_id = store
            .get_preference(PREF_INSTANCE_ID)
            .await?
            .unwrap_or_default();
        let stored_password = store
            .get_preference(PREF_PASSWORD)
            .await?
            .unwrap_or_default();

        let password = if stored_password.is_empty() {
            String::new()
        } else {
            match base64_decode(&stored_password) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!(error = %e, "Stored password is not valid base64");
                    String::new()
                }
            }
        };

        Ok(Self {
            api_key,
            instance_id,
            password,
            app_version,
            allowed_subsystems,
        })
    }

    /// Whether this identity can be presented to the relay at all.
    /// An absent api key or password makes the tunnel permanently
    /// unavailable until the hub is re-registered.
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.password.is_empty()
    }
}
