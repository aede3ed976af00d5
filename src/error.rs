//! Typed error enums for each fallible subsystem, following the teacher's
//! one-enum-per-subsystem convention rather than a single catch-all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session is closed")]
    Closed,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("table value serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("table database error: {0}")]
    Sql(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    Duplicate(String),
    #[error("{0} is not registered")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),
}
