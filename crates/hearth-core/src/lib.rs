//! Hearth core library.
//!
//! Shared plumbing for the Hearth daemon: `SQLite` pool helpers and
//! base64 codecs ([`db`]) and tracing subscriber setup
//! ([`tracing_init`]).

pub mod db;
pub mod tracing_init;
