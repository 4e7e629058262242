//! Hearth Daemon Library
//!
//! Core functionality for the Hearth remote-access daemon:
//! - SQLite storage for persisted preferences and credentials
//! - Request bridge into the hub's local web application
//! - Tunnel client maintaining the outbound relay connection

pub mod bridge;
pub mod storage;
pub mod tunnel;
