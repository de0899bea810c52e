/// Core Module for ocikit
///
/// This module holds the handle-owning layer: the native driver surface,
/// connections, statements, and the failure types they report.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{AppResult, Failure, FailureKind, OciError, Result};
