//! Error handling for the ServeFirst client

use std::fmt;
use thiserror::Error;

use servefirst_auth::AuthError;
use servefirst_postgrest::PostgrestError;
use servefirst_storage::StorageError;

use crate::importer::ImportError;

/// Unified error type for the ServeFirst client
#[derive(Error, Debug)]
pub enum Error {
    /// Authentication service errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Document database errors
    #[error("Database error: {0}")]
    Database(#[from] PostgrestError),

    /// Object storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local filesystem errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Document import errors
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// Missing or malformed form input, raised before any network call
    #[error("Validation error: {0}")]
    Validation(String),

    /// The current user may not perform the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation needs the cloud and the client is offline
    #[error("Offline: {0}")]
    Offline(String),

    /// The local key-value store failed or holds corrupt data
    #[error("Local store error: {0}")]
    LocalStore(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn validation<T: fmt::Display>(msg: T) -> Self {
        Error::Validation(msg.to_string())
    }

    pub fn permission_denied<T: fmt::Display>(msg: T) -> Self {
        Error::PermissionDenied(msg.to_string())
    }

    pub fn not_found<T: fmt::Display>(msg: T) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub fn local_store<T: fmt::Display>(msg: T) -> Self {
        Error::LocalStore(msg.to_string())
    }

    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// The cloud could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Offline(_) => true,
            Error::Database(e) => e.is_network(),
            Error::Auth(e) => e.is_network(),
            Error::Storage(StorageError::NetworkError(e)) => e.status().is_none(),
            _ => false,
        }
    }

    /// The cloud answered but refused the request.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::PermissionDenied(_) => true,
            Error::Database(e) => e.is_permission_denied(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
