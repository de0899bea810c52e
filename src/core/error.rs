/// ocikit Error Module
///
/// This module defines the structured failure record surfaced by every
/// connection and statement operation, plus the application-level error
/// type used by configuration loading and the command-line front end.
use crate::core::db::driver::{Driver, Handle};
use std::fmt;
use thiserror::Error;

/// Where a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Raised before any native call was made (bad input, missing handle)
    Local,
    /// Reported by the native driver through its diagnostics channel
    Native,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Local => f.write_str("local"),
            FailureKind::Native => f.write_str("native"),
        }
    }
}

/// A diagnostic record captured from the driver, or a fixed local message.
///
/// `code`, `offset` and `sql_text` are zero/empty when the failure did not
/// come from a structured native diagnostic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failure (code {code}): {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub code: i32,
    pub message: String,
    pub offset: usize,
    pub sql_text: String,
}

impl Failure {
    /// Builds a failure that never touched the native driver.
    pub fn local(message: impl Into<String>) -> Self {
        Failure {
            kind: FailureKind::Local,
            code: 0,
            message: message.into(),
            offset: 0,
            sql_text: String::new(),
        }
    }

    /// Captures the driver's current diagnostic for `handle`, or for the
    /// global channel when no handle is given.
    ///
    /// Diagnostics are last-write-wins per channel, so this has to run right
    /// after the failing native call and before any other call on the same
    /// handle. When the driver has nothing recorded the failure falls back to
    /// `fallback` with a zero code.
    pub fn from_handle<D: Driver + ?Sized>(
        driver: &D,
        handle: Option<Handle>,
        fallback: Option<&str>,
    ) -> Self {
        match driver.error(handle) {
            Some(diag) => Failure {
                kind: FailureKind::Native,
                code: diag.code,
                message: diag.message,
                offset: diag.offset,
                sql_text: diag.sql_text,
            },
            None => Failure {
                kind: FailureKind::Native,
                code: 0,
                message: fallback.unwrap_or_default().to_string(),
                offset: 0,
                sql_text: String::new(),
            },
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == FailureKind::Local
    }
}

/// Application-level error type for everything around the core handles:
/// configuration files, I/O and output rendering.
#[derive(Error, Debug)]
pub enum OciError {
    /// Connection or statement failure
    #[error(transparent)]
    Failure(#[from] Failure),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON rendering errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<toml::de::Error> for OciError {
    fn from(err: toml::de::Error) -> Self {
        OciError::Config(err.to_string())
    }
}

/// Result type for connection and statement operations.
pub type Result<T> = std::result::Result<T, Failure>;

/// Result type for configuration and front-end code.
pub type AppResult<T> = std::result::Result<T, OciError>;
