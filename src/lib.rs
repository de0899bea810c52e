// Core infrastructure modules
pub mod core;

pub mod config;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::config::ConnectionConfig;
pub use crate::core::db::{
    BindOptions, BindSlot, BindType, CommitMode, Connection, Row, Rows, SessionMode, SqlSource,
    SqliteDriver, Statement, StatementType, Value,
};
pub use crate::core::{Failure, FailureKind, OciError, Result};
