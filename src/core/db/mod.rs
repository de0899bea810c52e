/// Database Module
///
/// The database layer is split into four concerns:
/// - **Driver surface** (`driver.rs`): opaque handles, diagnostics and the `Driver` trait
/// - **Connection Management** (`connection.rs`): connect strategies, transactions, release
/// - **Statements** (`statement.rs`): binding, execution and lazy row streaming
/// - **SQLite driver** (`sqlite.rs`): the native driver backed by the SQLite C library
///
/// ## Error Handling
///
/// Native calls only signal failure; the structured `Failure` is read from the
/// driver's diagnostics channel immediately afterwards, scoped to the handle
/// the call was made on.
pub mod connection;
pub mod driver;
pub mod sqlite;
pub mod statement;

pub use connection::Connection;
pub use driver::{
    BindOptions, BindSlot, BindType, CommitMode, ConnHandle, ConnectStrategy, Diagnostic, Driver,
    Handle, Row, SessionMode, StatementType, StmtHandle, Value,
};
pub use sqlite::SqliteDriver;
pub use statement::{Rows, SqlSource, Statement};
