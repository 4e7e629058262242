//! SQLite-backed persistence for the daemon.
//!
//! One small table of key/value preferences; the tunnel's identity
//! material (api key, instance id, password) lives here alongside
//! whatever the rest of the hub stores.

mod db;
mod prefs;

pub use db::Database;
pub use hearth_core::db::DatabaseError;
