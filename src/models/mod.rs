//! Core data models of the gateway.
//!
//! Records map to database tables via `sqlx::FromRow` where the local SQLite
//! backend stores them, and serialize as JSON via `serde`.

pub mod bucket;
pub mod file;
pub mod permission;
pub mod quota;
pub mod transfer;
pub mod upload;
