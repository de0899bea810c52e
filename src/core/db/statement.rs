/// Statement Module
///
/// A `Statement` owns one prepared native statement handle and borrows the
/// `Connection` that produced it. It binds parameters, executes, and streams
/// rows one fetch at a time.

use crate::core::db::connection::Connection;
use crate::core::db::driver::{
    BindOptions, BindSlot, CommitMode, Driver, Row, StatementType, StmtHandle,
};
use crate::core::db::sqlite::SqliteDriver;
use crate::core::{Failure, Result};
use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::iter::FusedIterator;
use tracing::{debug, trace};

/// Where SQL text comes from: a string, raw bytes, or a reader drained in full.
pub enum SqlSource<'a> {
    Text(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    Reader(Box<dyn Read + 'a>),
}

impl<'a> SqlSource<'a> {
    pub fn reader(reader: impl Read + 'a) -> Self {
        SqlSource::Reader(Box::new(reader))
    }

    /// The SQL as a string, or `None` if it is not valid UTF-8, contains a
    /// NUL byte, or the reader fails.
    pub fn into_sql(self) -> Option<String> {
        let sql = match self {
            SqlSource::Text(text) => text.into_owned(),
            SqlSource::Bytes(bytes) => String::from_utf8(bytes.into_owned()).ok()?,
            SqlSource::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).ok()?;
                String::from_utf8(buf).ok()?
            }
        };
        (!sql.contains('\0')).then_some(sql)
    }
}

impl<'a> From<&'a str> for SqlSource<'a> {
    fn from(sql: &'a str) -> Self {
        SqlSource::Text(Cow::Borrowed(sql))
    }
}

impl From<String> for SqlSource<'_> {
    fn from(sql: String) -> Self {
        SqlSource::Text(Cow::Owned(sql))
    }
}

impl<'a> From<&'a String> for SqlSource<'a> {
    fn from(sql: &'a String) -> Self {
        SqlSource::Text(Cow::Borrowed(sql.as_str()))
    }
}

impl<'a> From<&'a [u8]> for SqlSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        SqlSource::Bytes(Cow::Borrowed(bytes))
    }
}

impl From<Vec<u8>> for SqlSource<'_> {
    fn from(bytes: Vec<u8>) -> Self {
        SqlSource::Bytes(Cow::Owned(bytes))
    }
}

impl<'a, R: Read + 'a> From<&'a mut R> for SqlSource<'a> {
    fn from(reader: &'a mut R) -> Self {
        SqlSource::Reader(Box::new(reader))
    }
}

/// A prepared statement tied to the connection that parsed it.
pub struct Statement<'c, D: Driver = SqliteDriver> {
    connection: &'c Connection<D>,
    handle: StmtHandle,
}

impl<'c, D: Driver> Statement<'c, D> {
    pub(crate) fn new(connection: &'c Connection<D>, handle: StmtHandle) -> Self {
        debug!("Prepared statement handle {:?}", handle);
        Statement { connection, handle }
    }

    pub fn connection(&self) -> &'c Connection<D> {
        self.connection
    }

    pub fn handle(&self) -> StmtHandle {
        self.handle
    }

    fn failure(&self) -> Failure {
        Failure::from_handle(self.connection.driver(), Some(self.handle.into()), None)
    }

    /// Binds a named placeholder to `slot` as a character string whose
    /// capacity is inferred from the slot's current value.
    pub fn bind_by_name(&mut self, name: &str, slot: &BindSlot) -> Result<&mut Self> {
        self.bind_by_name_with(name, slot, BindOptions::default())
    }

    /// Binds a named placeholder to `slot` with an explicit capacity and type.
    ///
    /// The driver reads the slot when the statement executes and writes
    /// output values back into it.
    pub fn bind_by_name_with(
        &mut self,
        name: &str,
        slot: &BindSlot,
        options: BindOptions,
    ) -> Result<&mut Self> {
        match self.connection.driver().bind_by_name(self.handle, name, slot, options) {
            Ok(()) => Ok(self),
            Err(_) => Err(self.failure()),
        }
    }

    /// Executes the statement with the given commit behaviour.
    pub fn execute(&mut self, mode: CommitMode) -> Result<&mut Self> {
        debug!("Executing statement {:?} ({:?})", self.handle, mode);
        match self.connection.driver().execute(self.handle, mode) {
            Ok(()) => Ok(self),
            Err(_) => Err(self.failure()),
        }
    }

    /// Next row of the current cursor, or `None` when it is exhausted.
    pub fn fetch(&mut self) -> Result<Option<Row>> {
        match self.connection.driver().fetch_assoc(self.handle) {
            Ok(row) => {
                trace!("Fetched {} from {:?}", if row.is_some() { "row" } else { "end of data" }, self.handle);
                Ok(row)
            }
            Err(_) => Err(self.failure()),
        }
    }

    /// Executes once and yields numbered rows lazily.
    ///
    /// The sequence is forward-only. Calling `query` again re-executes the
    /// statement and starts a new cursor.
    pub fn query(&mut self) -> Rows<'_, 'c, D> {
        Rows {
            statement: self,
            row_num: 0,
            state: RowsState::Pending,
        }
    }

    /// Rows affected by the last DML, or rows fetched so far for a query.
    pub fn num_rows(&self) -> Result<u64> {
        self.connection
            .driver()
            .num_rows(self.handle)
            .map_err(|_| self.failure())
    }

    /// Number of result columns. Non-zero means the statement returns rows,
    /// including `RETURNING` DML.
    pub fn num_fields(&self) -> Result<usize> {
        self.connection
            .driver()
            .num_fields(self.handle)
            .map_err(|_| self.failure())
    }

    pub fn statement_type(&self) -> Result<StatementType> {
        self.connection
            .driver()
            .statement_type(self.handle)
            .map_err(|_| self.failure())
    }
}

impl<D: Driver> Drop for Statement<'_, D> {
    fn drop(&mut self) {
        debug!("Freeing statement handle {:?}", self.handle);
        self.connection.driver().free_statement(self.handle);
    }
}

impl<D: Driver> fmt::Debug for Statement<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowsState {
    Pending,
    Streaming,
    Done,
}

/// Lazy `(row number, row)` sequence returned by [`Statement::query`].
///
/// Row numbers start at 1. A failure is yielded once, then the sequence ends.
pub struct Rows<'s, 'c, D: Driver = SqliteDriver> {
    statement: &'s mut Statement<'c, D>,
    row_num: usize,
    state: RowsState,
}

impl<D: Driver> Iterator for Rows<'_, '_, D> {
    type Item = Result<(usize, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == RowsState::Pending {
            if let Err(e) = self.statement.execute(CommitMode::CommitOnSuccess) {
                self.state = RowsState::Done;
                return Some(Err(e));
            }
            self.state = RowsState::Streaming;
        }
        if self.state == RowsState::Done {
            return None;
        }

        match self.statement.fetch() {
            Ok(Some(row)) => {
                self.row_num += 1;
                Some(Ok((self.row_num, row)))
            }
            Ok(None) => {
                self.state = RowsState::Done;
                None
            }
            Err(e) => {
                self.state = RowsState::Done;
                Some(Err(e))
            }
        }
    }
}

impl<D: Driver> FusedIterator for Rows<'_, '_, D> {}
