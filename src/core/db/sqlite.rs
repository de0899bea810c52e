/// SQLite Native Driver
///
/// Implements the native call surface on top of the SQLite C library via
/// `rusqlite`. Handles are plain ids into driver-owned registries; sessions
/// are reference counted so that statements keep their session alive after
/// the connection handle that produced them has been closed.
///
/// ## Connect strategies
///
/// - `Default` shares a live session opened with the same credentials by
///   another default handle.
/// - `Persistent` reuses a session parked in the idle pool (or a live
///   persistent one). Closing the last persistent handle rolls back any open
///   transaction and parks the session again instead of closing it.
/// - `Exclusive` always opens a new session.
///
/// ## Cursors
///
/// Executing a query does not read its rows. Each `fetch_assoc` steps the
/// live SQLite statement once, so rows and step failures arrive in cursor
/// order. Statements that write are stepped to completion at `execute`,
/// with any `RETURNING` rows queued for fetching.

use crate::config::{ConnectionConfig, Password};
use crate::core::db::driver::{
    BindOptions, BindSlot, BindType, CallFailed, CommitMode, ConnHandle, ConnectStrategy, Diagnostic,
    Driver, Handle, NativeResult, Row, SessionMode, StatementType, StmtHandle, Value,
};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use ouroboros::self_referencing;
use regex::Regex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, CachedStatement, ToSql};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use tracing::{debug, warn};

/// Error codes reported for conditions the driver detects itself
pub mod codes {
    /// Operation on a handle the driver does not know
    pub const INVALID_HANDLE: i32 = -2;
    /// Generic failure that did not come with a SQLite result code
    pub const DRIVER_ERROR: i32 = 1;
    /// Empty or unusable statement text
    pub const INVALID_STATEMENT: i32 = 900;
    /// Datatype conversion failure on a bind
    pub const INCONSISTENT_DATATYPES: i32 = 932;
    /// A placeholder in the statement has no bound value
    pub const NOT_ALL_BOUND: i32 = 1008;
    /// Bind name not present in the statement
    pub const BAD_BIND_NAME: i32 = 1036;
    /// Numeric conversion failure on a bind
    pub const INVALID_NUMBER: i32 = 1722;
    /// Output value longer than the bind capacity
    pub const BUFFER_TOO_SMALL: i32 = 6502;
    /// Unsupported character set requested at connect
    pub const BAD_CHARSET: i32 = 12705;
    /// Unknown session mode bits requested at connect
    pub const BAD_MODE: i32 = 24300;
    /// Fetch on a statement that has not been executed
    pub const FETCH_BEFORE_EXECUTE: i32 = 24374;
}

const DUAL_VIEW_SQL: &str = "CREATE TEMP VIEW IF NOT EXISTS dual AS SELECT 'X' AS dummy;";

static BIND_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^:?(?:[A-Za-z][A-Za-z0-9_$#]*|[0-9]+)$").expect("valid bind name pattern"));

/// Identity used to share and pool sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    username: String,
    password: Password,
    connect: Option<String>,
    charset: String,
    session_mode: SessionMode,
}

impl SessionKey {
    fn new(config: &ConnectionConfig) -> Self {
        SessionKey {
            username: config.username().to_string(),
            password: config.password().clone(),
            connect: config.connect().map(str::to_string),
            charset: config.charset().to_string(),
            session_mode: config.session_mode(),
        }
    }

    fn is_in_memory(&self) -> bool {
        matches!(self.connect.as_deref(), None | Some("") | Some(":memory:"))
    }
}

struct Session {
    id: u64,
    key: SessionKey,
    conn: rusqlite::Connection,
}

struct ConnEntry {
    session: Rc<Session>,
    strategy: ConnectStrategy,
}

struct Bound {
    slot: BindSlot,
    /// Capacity in bytes for character and binary output
    capacity: usize,
    bind_type: BindType,
}

/// A stepping SQLite statement together with the session it borrows from
#[self_referencing]
struct LiveRows {
    session: Rc<Session>,
    #[borrows(session)]
    #[not_covariant]
    statement: CachedStatement<'this>,
    #[borrows(mut statement)]
    #[not_covariant]
    rows: rusqlite::Rows<'this>,
}

/// Result cursor of an executed statement
struct Cursor {
    columns: Vec<String>,
    /// Rows already stepped, delivered before the live statement is touched
    queued: VecDeque<Row>,
    /// `None` once the statement is exhausted or has failed
    live: Option<LiveRows>,
}

impl Cursor {
    /// Next row, stepping the live statement when nothing is queued.
    fn next_row(&mut self, sql: &str) -> Result<Option<Row>, Diagnostic> {
        if let Some(row) = self.queued.pop_front() {
            return Ok(Some(row));
        }
        let Some(live) = self.live.as_mut() else {
            return Ok(None);
        };

        let columns = &self.columns;
        let stepped = live.with_rows_mut(|rows| -> rusqlite::Result<Option<Row>> {
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let mut record = Row::with_capacity(columns.len());
            for (index, column) in columns.iter().enumerate() {
                record.insert(column.clone(), column_value(row.get_ref(index)?));
            }
            Ok(Some(record))
        });
        match stepped {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.live = None;
                Ok(None)
            }
            Err(e) => {
                self.live = None;
                Err(diagnostic(&e, sql))
            }
        }
    }

    /// Steps the live statement to completion, queueing every row.
    fn drain(&mut self, sql: &str) -> Result<(), Diagnostic> {
        let mut rows = VecDeque::new();
        while let Some(row) = self.next_row(sql)? {
            rows.push_back(row);
        }
        self.queued = rows;
        Ok(())
    }
}

struct StmtEntry {
    session: Rc<Session>,
    sql: String,
    /// Keyed by normalized name
    binds: IndexMap<String, Bound>,
    cursor: Option<Cursor>,
    num_fields: usize,
    rows_affected: u64,
    fetched: u64,
}

/// Native driver backed by SQLite.
///
/// Single-threaded: all state sits behind `Cell`/`RefCell`.
#[derive(Default)]
pub struct SqliteDriver {
    next_id: Cell<u64>,
    connections: RefCell<HashMap<ConnHandle, ConnEntry>>,
    statements: RefCell<HashMap<StmtHandle, StmtEntry>>,
    idle: RefCell<HashMap<SessionKey, Vec<Rc<Session>>>>,
    diagnostics: RefCell<HashMap<Option<Handle>, Diagnostic>>,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct sessions currently open, pooled ones included.
    pub fn session_count(&self) -> usize {
        let mut ids: HashSet<u64> = self
            .connections
            .borrow()
            .values()
            .map(|entry| entry.session.id)
            .collect();
        ids.extend(self.statements.borrow().values().map(|entry| entry.session.id));
        ids.extend(self.idle.borrow().values().flatten().map(|session| session.id));
        ids.len()
    }

    /// Sessions parked in the persistent pool.
    pub fn idle_session_count(&self) -> usize {
        self.idle.borrow().values().map(Vec::len).sum()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.borrow().len()
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    /// Runs one native call: clears the channel, then records a diagnostic
    /// on it if the call fails.
    fn guarded<T>(
        &self,
        channel: Option<Handle>,
        call: impl FnOnce() -> Result<T, Diagnostic>,
    ) -> NativeResult<T> {
        self.diagnostics.borrow_mut().remove(&channel);
        call().map_err(|diag| {
            debug!("Native call on {:?} failed: {} ({})", channel, diag.message, diag.code);
            self.diagnostics.borrow_mut().insert(channel, diag);
            CallFailed
        })
    }

    fn session(&self, conn: ConnHandle) -> Result<Rc<Session>, Diagnostic> {
        self.connections
            .borrow()
            .get(&conn)
            .map(|entry| Rc::clone(&entry.session))
            .ok_or_else(|| Diagnostic::new(codes::INVALID_HANDLE, "invalid connection handle"))
    }

    fn find_live(&self, key: &SessionKey, strategy: ConnectStrategy) -> Option<Rc<Session>> {
        self.connections
            .borrow()
            .values()
            .find(|entry| entry.strategy == strategy && entry.session.key == *key)
            .map(|entry| Rc::clone(&entry.session))
    }

    fn take_idle(&self, key: &SessionKey) -> Option<Rc<Session>> {
        self.idle.borrow_mut().get_mut(key).and_then(Vec::pop)
    }

    fn open_session(&self, key: SessionKey) -> Result<Rc<Session>, Diagnostic> {
        let conn = match key.connect.as_deref() {
            Some(path) if !key.is_in_memory() => rusqlite::Connection::open(path),
            _ => rusqlite::Connection::open_in_memory(),
        }
        .map_err(|e| diagnostic(&e, ""))?;

        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| diagnostic(&e, ""))?;
        if !key.is_in_memory() {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
                .map_err(|e| diagnostic(&e, ""))?;
        }
        conn.execute_batch(DUAL_VIEW_SQL)
            .map_err(|e| diagnostic(&e, DUAL_VIEW_SQL))?;

        let id = self.next_id();
        debug!(
            "Opened session {} for '{}' on {:?} (mode {:#x})",
            id,
            key.username,
            key.connect,
            key.session_mode.bits()
        );
        Ok(Rc::new(Session { id, key, conn }))
    }

    fn with_statement<T>(
        &self,
        stmt: StmtHandle,
        f: impl FnOnce(&mut StmtEntry) -> Result<T, Diagnostic>,
    ) -> NativeResult<T> {
        self.guarded(Some(stmt.into()), || {
            let mut statements = self.statements.borrow_mut();
            let entry = statements
                .get_mut(&stmt)
                .ok_or_else(|| Diagnostic::new(codes::INVALID_HANDLE, "invalid statement handle"))?;
            f(entry)
        })
    }
}

impl Driver for SqliteDriver {
    fn connect(&self, strategy: ConnectStrategy, config: &ConnectionConfig) -> NativeResult<ConnHandle> {
        self.guarded(None, || {
            let key = SessionKey::new(config);
            if !charset_supported(&key.charset) {
                return Err(Diagnostic::new(
                    codes::BAD_CHARSET,
                    format!("unsupported character set '{}'", key.charset),
                ));
            }
            if key.session_mode.has_unknown_bits() {
                return Err(Diagnostic::new(
                    codes::BAD_MODE,
                    format!("bad value for session mode {:#x}", key.session_mode.bits()),
                ));
            }

            let session = match strategy {
                ConnectStrategy::Exclusive => self.open_session(key)?,
                ConnectStrategy::Persistent => {
                    match self
                        .take_idle(&key)
                        .or_else(|| self.find_live(&key, ConnectStrategy::Persistent))
                    {
                        Some(session) => {
                            debug!("Reusing persistent session {}", session.id);
                            session
                        }
                        None => self.open_session(key)?,
                    }
                }
                ConnectStrategy::Default => match self.find_live(&key, ConnectStrategy::Default) {
                    Some(session) => session,
                    None => self.open_session(key)?,
                },
            };

            let handle = ConnHandle(self.next_id());
            self.connections
                .borrow_mut()
                .insert(handle, ConnEntry { session, strategy });
            Ok(handle)
        })
    }

    fn close(&self, conn: ConnHandle) {
        self.diagnostics.borrow_mut().remove(&Some(conn.into()));
        let Some(entry) = self.connections.borrow_mut().remove(&conn) else {
            warn!("Close requested for unknown connection handle {:?}", conn);
            return;
        };

        if entry.strategy != ConnectStrategy::Persistent || Rc::strong_count(&entry.session) > 1 {
            return;
        }
        if !entry.session.conn.is_autocommit() {
            if let Err(e) = entry.session.conn.execute_batch("ROLLBACK") {
                warn!("Discarding persistent session {}: rollback failed: {}", entry.session.id, e);
                return;
            }
        }
        debug!("Parking persistent session {}", entry.session.id);
        self.idle
            .borrow_mut()
            .entry(entry.session.key.clone())
            .or_default()
            .push(entry.session);
    }

    fn parse(&self, conn: ConnHandle, sql: &str) -> NativeResult<StmtHandle> {
        self.guarded(Some(conn.into()), || {
            let session = self.session(conn)?;
            if sql.trim().is_empty() {
                return Err(Diagnostic::new(codes::INVALID_STATEMENT, "invalid SQL statement").with_sql(sql, 0));
            }
            let num_fields = {
                let prepared = session.conn.prepare_cached(sql).map_err(|e| diagnostic(&e, sql))?;
                prepared.column_count()
            };

            let handle = StmtHandle(self.next_id());
            self.statements.borrow_mut().insert(
                handle,
                StmtEntry {
                    session,
                    sql: sql.to_string(),
                    binds: IndexMap::new(),
                    cursor: None,
                    num_fields,
                    rows_affected: 0,
                    fetched: 0,
                },
            );
            Ok(handle)
        })
    }

    fn bind_by_name(
        &self,
        stmt: StmtHandle,
        name: &str,
        slot: &BindSlot,
        options: BindOptions,
    ) -> NativeResult<()> {
        self.with_statement(stmt, |entry| {
            let illegal = || {
                Diagnostic::new(codes::BAD_BIND_NAME, format!("illegal variable name/number '{}'", name))
                    .with_sql(&entry.sql, 0)
            };
            if !BIND_NAME.is_match(name) {
                return Err(illegal());
            }

            let key = normalize(name);
            let known = {
                let prepared = entry
                    .session
                    .conn
                    .prepare_cached(&entry.sql)
                    .map_err(|e| diagnostic(&e, &entry.sql))?;
                parameter_names(&prepared)
                    .iter()
                    .any(|p| p.as_deref() == Some(key.as_str()))
                    || prepared
                        .column_names()
                        .iter()
                        .any(|column| column.eq_ignore_ascii_case(&key))
            };
            if !known {
                return Err(illegal());
            }

            let capacity = options.max_length.unwrap_or_else(|| slot.get().byte_len());
            entry.binds.insert(
                key,
                Bound {
                    slot: slot.clone(),
                    capacity,
                    bind_type: options.bind_type,
                },
            );
            Ok(())
        })
    }

    fn execute(&self, stmt: StmtHandle, mode: CommitMode) -> NativeResult<()> {
        self.with_statement(stmt, |entry| {
            let session = Rc::clone(&entry.session);
            if mode == CommitMode::NoAutoCommit && session.conn.is_autocommit() {
                session
                    .conn
                    .execute_batch("BEGIN")
                    .map_err(|e| diagnostic(&e, &entry.sql))?;
            }

            entry.run()?;

            if mode == CommitMode::CommitOnSuccess && !session.conn.is_autocommit() {
                session
                    .conn
                    .execute_batch("COMMIT")
                    .map_err(|e| diagnostic(&e, &entry.sql))?;
            }
            Ok(())
        })
    }

    fn fetch_assoc(&self, stmt: StmtHandle) -> NativeResult<Option<Row>> {
        self.with_statement(stmt, |entry| {
            let Some(cursor) = entry.cursor.as_mut() else {
                return Err(Diagnostic::new(
                    codes::FETCH_BEFORE_EXECUTE,
                    "fetch attempted before the statement was executed",
                )
                .with_sql(&entry.sql, 0));
            };
            let row = cursor.next_row(&entry.sql)?;
            if row.is_some() {
                entry.fetched += 1;
            }
            Ok(row)
        })
    }

    fn num_rows(&self, stmt: StmtHandle) -> NativeResult<u64> {
        self.with_statement(stmt, |entry| {
            Ok(if entry.num_fields > 0 {
                entry.fetched
            } else {
                entry.rows_affected
            })
        })
    }

    fn num_fields(&self, stmt: StmtHandle) -> NativeResult<usize> {
        self.with_statement(stmt, |entry| Ok(entry.num_fields))
    }

    fn statement_type(&self, stmt: StmtHandle) -> NativeResult<StatementType> {
        self.with_statement(stmt, |entry| Ok(StatementType::from_sql(&entry.sql)))
    }

    fn commit(&self, conn: ConnHandle) -> NativeResult<()> {
        self.guarded(Some(conn.into()), || {
            let session = self.session(conn)?;
            if !session.conn.is_autocommit() {
                session.conn.execute_batch("COMMIT").map_err(|e| diagnostic(&e, ""))?;
            }
            Ok(())
        })
    }

    fn rollback(&self, conn: ConnHandle) -> NativeResult<()> {
        self.guarded(Some(conn.into()), || {
            let session = self.session(conn)?;
            if !session.conn.is_autocommit() {
                session.conn.execute_batch("ROLLBACK").map_err(|e| diagnostic(&e, ""))?;
            }
            Ok(())
        })
    }

    fn free_statement(&self, stmt: StmtHandle) {
        self.diagnostics.borrow_mut().remove(&Some(stmt.into()));
        if self.statements.borrow_mut().remove(&stmt).is_none() {
            warn!("Free requested for unknown statement handle {:?}", stmt);
        }
    }

    fn error(&self, handle: Option<Handle>) -> Option<Diagnostic> {
        self.diagnostics.borrow().get(&handle).cloned()
    }
}

impl StmtEntry {
    /// Binds inputs and opens a new cursor, replacing any previous one.
    ///
    /// Queries are left unstepped. Writes run to completion here, and output
    /// binds are written from the first result row.
    fn run(&mut self) -> Result<(), Diagnostic> {
        self.cursor = None;
        self.fetched = 0;
        let session = Rc::clone(&self.session);
        let sql = self.sql.as_str();

        let (columns, readonly, params, inputs) = {
            let prepared = session.conn.prepare_cached(sql).map_err(|e| diagnostic(&e, sql))?;
            let columns: Vec<String> = prepared.column_names().into_iter().map(String::from).collect();

            let mut params = Vec::with_capacity(prepared.parameter_count());
            let mut inputs = HashSet::new();
            for name in parameter_names(&prepared) {
                let bound = name.as_ref().and_then(|name| self.binds.get(name)).ok_or_else(|| {
                    Diagnostic::new(codes::NOT_ALL_BOUND, "not all variables bound").with_sql(sql, 0)
                })?;
                let value = bound
                    .slot
                    .get()
                    .coerce(bound.bind_type)
                    .ok_or_else(|| conversion_failure(bound.bind_type, sql))?;
                params.push(value);
                inputs.extend(name);
            }
            (columns, prepared.readonly(), params, inputs)
        };
        let outputs: Vec<(&String, &Bound)> = self
            .binds
            .iter()
            .filter(|(name, _)| !inputs.contains(*name))
            .collect();

        let live = LiveRows::try_new(
            Rc::clone(&session),
            |session| session.conn.prepare_cached(sql),
            |statement| statement.query(params_from_iter(params.iter())),
        )
        .map_err(|e| diagnostic(&e, sql))?;
        let mut cursor = Cursor {
            columns,
            queued: VecDeque::new(),
            live: Some(live),
        };

        if !readonly || cursor.columns.is_empty() {
            cursor.drain(sql)?;
        } else if !outputs.is_empty() {
            if let Some(first) = cursor.next_row(sql)? {
                cursor.queued.push_back(first);
            }
        }

        let mut written = Vec::new();
        if let Some(first) = cursor.queued.front() {
            for (name, bound) in outputs {
                let Some((_, value)) = first.iter().find(|(column, _)| column.eq_ignore_ascii_case(name)) else {
                    continue;
                };
                let value = value
                    .coerce(bound.bind_type)
                    .ok_or_else(|| conversion_failure(bound.bind_type, sql))?;
                if matches!(bound.bind_type, BindType::Chr | BindType::Bin) && value.byte_len() > bound.capacity {
                    return Err(Diagnostic::new(
                        codes::BUFFER_TOO_SMALL,
                        format!(
                            "buffer too small for :{} ({} bytes, capacity {})",
                            name,
                            value.byte_len(),
                            bound.capacity
                        ),
                    )
                    .with_sql(sql, 0));
                }
                written.push((bound.slot.clone(), value));
            }
        }
        for (slot, value) in written {
            slot.set(value);
        }

        self.num_fields = cursor.columns.len();
        self.rows_affected = if cursor.columns.is_empty() {
            session.conn.changes()
        } else {
            0
        };
        self.cursor = Some(cursor);
        Ok(())
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Text(s) => ValueRef::Text(s.as_bytes()),
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(r) => ValueRef::Real(*r),
            Value::Binary(b) => ValueRef::Blob(b),
        }))
    }
}

/// Fetched columns come back as character data; only BLOBs stay binary.
fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Text(i.to_string()),
        ValueRef::Real(f) => Value::Text(f.to_string()),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Binary(b.to_vec()),
    }
}

/// Placeholder names of a prepared statement in index order, normalized;
/// anonymous `?` placeholders yield `None`.
fn parameter_names(prepared: &rusqlite::Statement<'_>) -> Vec<Option<String>> {
    (1..=prepared.parameter_count())
        .map(|index| prepared.parameter_name(index).map(normalize))
        .collect()
}

/// Strips the placeholder prefix and folds case.
fn normalize(name: &str) -> String {
    name.trim_start_matches([':', '@', '$', '?']).to_ascii_uppercase()
}

fn charset_supported(charset: &str) -> bool {
    matches!(
        charset.to_ascii_uppercase().as_str(),
        "" | "AL32UTF8" | "UTF8" | "UTF-8"
    )
}

fn conversion_failure(bind_type: BindType, sql: &str) -> Diagnostic {
    let diag = match bind_type {
        BindType::Int | BindType::Float => Diagnostic::new(codes::INVALID_NUMBER, "invalid number"),
        BindType::Chr | BindType::Bin => {
            Diagnostic::new(codes::INCONSISTENT_DATATYPES, "inconsistent datatypes")
        }
    };
    diag.with_sql(sql, 0)
}

/// Maps a SQLite error to a diagnostic. Errors SQLite can pin to a token
/// carry that token's byte offset in the SQL text.
fn diagnostic(err: &rusqlite::Error, sql: &str) -> Diagnostic {
    let (code, message, offset) = match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            (e.extended_code, msg.clone().unwrap_or_else(|| e.to_string()), 0)
        }
        rusqlite::Error::SqlInputError {
            error, msg, offset, ..
        } => (error.extended_code, msg.clone(), usize::try_from(*offset).unwrap_or(0)),
        other => (codes::DRIVER_ERROR, other.to_string(), 0),
    };
    Diagnostic {
        code,
        message,
        offset,
        sql_text: sql.to_string(),
    }
}
