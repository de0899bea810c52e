/// Native Driver Surface
///
/// This module defines the call surface a native database driver exposes to
/// `Connection` and `Statement`: opaque handles, the failure indicator, the
/// diagnostics record and the value types that cross the boundary.
///
/// Native calls only report *that* they failed (`CallFailed`). The details
/// live in the driver's diagnostics channel and are read with
/// [`Driver::error`], keyed by the handle the failing call was made on.
use crate::config::ConnectionConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;
use std::str::FromStr;

/// Opaque native connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u64);

/// Opaque native statement handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtHandle(pub u64);

/// Either kind of handle, used to scope diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    Connection(ConnHandle),
    Statement(StmtHandle),
}

impl From<ConnHandle> for Handle {
    fn from(handle: ConnHandle) -> Self {
        Handle::Connection(handle)
    }
}

impl From<StmtHandle> for Handle {
    fn from(handle: StmtHandle) -> Self {
        Handle::Statement(handle)
    }
}

/// Failure indicator returned by a native call. Carries no detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFailed;

pub type NativeResult<T> = std::result::Result<T, CallFailed>;

/// Raw diagnostic record as stored by the driver
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Diagnostic {
    pub code: i32,
    pub message: String,
    pub offset: usize,
    pub sql_text: String,
}

impl Diagnostic {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            message: message.into(),
            offset: 0,
            sql_text: String::new(),
        }
    }

    pub fn with_sql(mut self, sql: &str, offset: usize) -> Self {
        self.sql_text = sql.to_string();
        self.offset = offset;
        self
    }
}

/// How the driver should obtain a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStrategy {
    /// Plain connect; the driver may hand back a session already opened with
    /// identical credentials
    Default,
    /// Driver-level pooled session that outlives `close`
    Persistent,
    /// Always a brand-new session, never shared
    Exclusive,
}

impl ConnectStrategy {
    /// Exclusive wins over persistent, which wins over the plain strategy.
    pub fn for_config(config: &ConnectionConfig) -> Self {
        if config.is_exclusive() {
            ConnectStrategy::Exclusive
        } else if config.is_persistent() {
            ConnectStrategy::Persistent
        } else {
            ConnectStrategy::Default
        }
    }
}

/// Session privilege bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub struct SessionMode(u32);

impl SessionMode {
    pub const DEFAULT: SessionMode = SessionMode(0);
    pub const SYSDBA: SessionMode = SessionMode(0x0002);
    pub const SYSOPER: SessionMode = SessionMode(0x0004);
    pub const SYSASM: SessionMode = SessionMode(0x8000);

    const KNOWN: u32 = 0x0002 | 0x0004 | 0x8000;

    /// Keeps every bit, known or not. Drivers reject unknown bits at connect.
    pub const fn from_bits_retain(bits: u32) -> Self {
        SessionMode(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SessionMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_privileged(self) -> bool {
        self.0 & Self::KNOWN != 0
    }

    pub const fn has_unknown_bits(self) -> bool {
        self.0 & !Self::KNOWN != 0
    }
}

impl BitOr for SessionMode {
    type Output = SessionMode;

    fn bitor(self, rhs: SessionMode) -> SessionMode {
        SessionMode(self.0 | rhs.0)
    }
}

impl FromStr for SessionMode {
    type Err = String;

    /// Accepts `default`, `sysdba`, `sysoper`, `sysasm`, combined with `|` or `,`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(['|', ','])
            .map(|part| part.trim().to_ascii_lowercase())
            .try_fold(SessionMode::DEFAULT, |mode, part| match part.as_str() {
                "" | "default" => Ok(mode),
                "sysdba" => Ok(mode | SessionMode::SYSDBA),
                "sysoper" => Ok(mode | SessionMode::SYSOPER),
                "sysasm" => Ok(mode | SessionMode::SYSASM),
                other => Err(format!("unknown session mode '{}'", other)),
            })
    }
}

impl TryFrom<String> for SessionMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Transaction behaviour applied when a statement executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Commit the active transaction as soon as the statement succeeds
    #[default]
    CommitOnSuccess,
    /// Leave the transaction open for an explicit commit or rollback
    NoAutoCommit,
}

/// Native type a bound value is converted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindType {
    /// Character string
    #[default]
    Chr,
    Int,
    Float,
    /// Raw bytes
    Bin,
}

/// Per-bind options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindOptions {
    /// Buffer capacity in bytes; `None` infers it from the slot's current value
    pub max_length: Option<usize>,
    pub bind_type: BindType,
}

impl BindOptions {
    pub fn new(max_length: Option<usize>, bind_type: BindType) -> Self {
        BindOptions {
            max_length,
            bind_type,
        }
    }
}

/// A database value as it crosses the driver boundary
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts to the representation of `bind_type`, or `None` when the value
    /// has no sensible form in that type.
    pub fn coerce(&self, bind_type: BindType) -> Option<Value> {
        match (bind_type, self) {
            (_, Value::Null) => Some(Value::Null),
            (BindType::Chr, Value::Text(_)) => Some(self.clone()),
            (BindType::Chr, Value::Binary(b)) => String::from_utf8(b.clone()).ok().map(Value::Text),
            (BindType::Chr, other) => Some(Value::Text(other.to_string())),
            (BindType::Int, Value::Integer(_)) => Some(self.clone()),
            (BindType::Int, Value::Real(f)) => {
                (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then(|| Value::Integer(*f as i64))
            }
            (BindType::Int, Value::Text(s)) => s.trim().parse().ok().map(Value::Integer),
            (BindType::Float, Value::Integer(i)) => Some(Value::Real(*i as f64)),
            (BindType::Float, Value::Real(_)) => Some(self.clone()),
            (BindType::Float, Value::Text(s)) => s.trim().parse().ok().map(Value::Real),
            (BindType::Bin, Value::Binary(_)) => Some(self.clone()),
            (BindType::Bin, Value::Text(s)) => Some(Value::Binary(s.clone().into_bytes())),
            _ => None,
        }
    }

    /// Length in bytes of the value's native representation.
    pub fn byte_len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Text(s) => s.len(),
            Value::Binary(b) => b.len(),
            other => other.to_string().len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Binary(b) => write!(f, "<BLOB: {} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// A caller-owned, shared value slot the driver reads at execution time and
/// writes back into for output binds.
///
/// Cloning a slot clones the reference, not the value.
#[derive(Debug, Clone, Default)]
pub struct BindSlot(Rc<RefCell<Value>>);

impl BindSlot {
    pub fn new(value: impl Into<Value>) -> Self {
        BindSlot(Rc::new(RefCell::new(value.into())))
    }

    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: impl Into<Value>) {
        *self.0.borrow_mut() = value.into();
    }
}

/// One fetched row: column name to value, in result-set column order
pub type Row = IndexMap<String, Value>;

/// Statement kind as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    /// Anonymous block or transaction start
    Begin,
    Declare,
    Call,
    Unknown,
}

impl StatementType {
    /// Classifies SQL text by its leading keyword.
    pub fn from_sql(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| !c.is_ascii_alphabetic())
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" => StatementType::Select,
            "INSERT" | "REPLACE" => StatementType::Insert,
            "UPDATE" => StatementType::Update,
            "DELETE" => StatementType::Delete,
            "CREATE" => StatementType::Create,
            "DROP" => StatementType::Drop,
            "ALTER" => StatementType::Alter,
            "BEGIN" => StatementType::Begin,
            "DECLARE" => StatementType::Declare,
            "CALL" => StatementType::Call,
            _ => StatementType::Unknown,
        }
    }
}

/// The native call surface wrapped by `Connection` and `Statement`.
///
/// Every fallible call clears the diagnostic of the channel it reports on
/// before it runs, and records a fresh one when it fails. `close` and
/// `free_statement` are best-effort and never fail.
pub trait Driver {
    fn connect(&self, strategy: ConnectStrategy, config: &ConnectionConfig) -> NativeResult<ConnHandle>;

    fn close(&self, conn: ConnHandle);

    fn parse(&self, conn: ConnHandle, sql: &str) -> NativeResult<StmtHandle>;

    fn bind_by_name(
        &self,
        stmt: StmtHandle,
        name: &str,
        slot: &BindSlot,
        options: BindOptions,
    ) -> NativeResult<()>;

    fn execute(&self, stmt: StmtHandle, mode: CommitMode) -> NativeResult<()>;

    /// `Ok(None)` once the cursor is exhausted.
    fn fetch_assoc(&self, stmt: StmtHandle) -> NativeResult<Option<Row>>;

    fn num_rows(&self, stmt: StmtHandle) -> NativeResult<u64>;

    /// Number of columns in the statement's result set; zero for DML and DDL.
    fn num_fields(&self, stmt: StmtHandle) -> NativeResult<usize>;

    fn statement_type(&self, stmt: StmtHandle) -> NativeResult<StatementType>;

    fn commit(&self, conn: ConnHandle) -> NativeResult<()>;

    fn rollback(&self, conn: ConnHandle) -> NativeResult<()>;

    fn free_statement(&self, stmt: StmtHandle);

    /// Most recent diagnostic for `handle`, or for the global channel.
    fn error(&self, handle: Option<Handle>) -> Option<Diagnostic>;
}
