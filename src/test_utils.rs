/// # Test Utilities Module
///
/// A scripted in-memory driver for unit tests. It records every native call,
/// tracks which handles are alive, and lets a test inject failures and
/// diagnostics on specific channels.

use crate::config::ConnectionConfig;
use crate::core::db::driver::{
    BindOptions, BindSlot, CallFailed, CommitMode, ConnHandle, ConnectStrategy, Diagnostic, Driver,
    Handle, NativeResult, Row, StatementType, StmtHandle, Value,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};

/// A native call as seen by the scripted driver
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect(ConnectStrategy),
    Close(ConnHandle),
    Parse(String),
    Bind(String),
    Execute(CommitMode),
    Fetch(StmtHandle),
    NumRows(StmtHandle),
    NumFields(StmtHandle),
    StatementType(StmtHandle),
    Commit(ConnHandle),
    Rollback(ConnHandle),
    Free(StmtHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Connect,
    Parse,
    Bind,
    Execute,
    Commit,
}

#[derive(Debug)]
struct ScriptedStatement {
    sql: String,
    binds: Vec<(String, BindSlot)>,
    cursor: Option<VecDeque<Row>>,
    fetched: u64,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    calls: Vec<Call>,
    open: HashSet<ConnHandle>,
    statements: HashMap<StmtHandle, ScriptedStatement>,
    diagnostics: HashMap<Option<Handle>, Diagnostic>,
    last_error_query: Option<Option<Handle>>,
    failures: HashMap<Op, VecDeque<Option<Diagnostic>>>,
    rows: HashMap<String, Vec<Row>>,
    outputs: HashMap<String, Value>,
}

/// Scripted driver used by the unit tests
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    state: RefCell<State>,
}

/// Builds a row of text values in the given column order.
pub fn row(columns: &[(&str, &str)]) -> Row {
    columns
        .iter()
        .map(|(name, value)| (name.to_string(), Value::from(*value)))
        .collect()
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn open_connections(&self) -> usize {
        self.state.borrow().open.len()
    }

    pub fn live_statements(&self) -> usize {
        self.state.borrow().statements.len()
    }

    /// The handle passed to the most recent `error` query.
    pub fn last_error_query(&self) -> Option<Option<Handle>> {
        self.state.borrow().last_error_query
    }

    pub fn set_diagnostic(&self, handle: Option<Handle>, diag: Diagnostic) {
        self.state.borrow_mut().diagnostics.insert(handle, diag);
    }

    pub fn script_rows(&self, sql: &str, rows: Vec<Row>) {
        self.state.borrow_mut().rows.insert(sql.to_string(), rows);
    }

    /// Value written into any slot bound under `name` when a statement executes.
    pub fn script_output(&self, name: &str, value: Value) {
        self.state.borrow_mut().outputs.insert(name.to_string(), value);
    }

    pub fn fail_connect(&self, diag: Diagnostic) {
        self.push_failure(Op::Connect, Some(diag));
    }

    /// Connect fails without leaving any diagnostic behind.
    pub fn fail_connect_silently(&self) {
        self.push_failure(Op::Connect, None);
    }

    pub fn fail_next_parse(&self, diag: Diagnostic) {
        self.push_failure(Op::Parse, Some(diag));
    }

    pub fn fail_next_bind(&self, diag: Diagnostic) {
        self.push_failure(Op::Bind, Some(diag));
    }

    pub fn fail_next_execute(&self, diag: Diagnostic) {
        self.push_failure(Op::Execute, Some(diag));
    }

    pub fn fail_next_commit(&self, diag: Diagnostic) {
        self.push_failure(Op::Commit, Some(diag));
    }

    fn push_failure(&self, op: Op, diag: Option<Diagnostic>) {
        self.state
            .borrow_mut()
            .failures
            .entry(op)
            .or_default()
            .push_back(diag);
    }

    /// Records `call`, resets the channel, and applies any injected failure.
    fn begin(&self, call: Call, op: Option<Op>, channel: Option<Handle>) -> NativeResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(call);
        state.diagnostics.remove(&channel);

        let injected = op.and_then(|op| state.failures.get_mut(&op).and_then(VecDeque::pop_front));
        match injected {
            Some(diag) => {
                if let Some(diag) = diag {
                    state.diagnostics.insert(channel, diag);
                }
                Err(CallFailed)
            }
            None => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        state.next_id
    }
}

impl Driver for ScriptedDriver {
    fn connect(&self, strategy: ConnectStrategy, _config: &ConnectionConfig) -> NativeResult<ConnHandle> {
        self.begin(Call::Connect(strategy), Some(Op::Connect), None)?;
        let handle = ConnHandle(self.next_id());
        self.state.borrow_mut().open.insert(handle);
        Ok(handle)
    }

    fn close(&self, conn: ConnHandle) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Close(conn));
        state.open.remove(&conn);
    }

    fn parse(&self, conn: ConnHandle, sql: &str) -> NativeResult<StmtHandle> {
        self.begin(Call::Parse(sql.to_string()), Some(Op::Parse), Some(conn.into()))?;
        let handle = StmtHandle(self.next_id());
        self.state.borrow_mut().statements.insert(
            handle,
            ScriptedStatement {
                sql: sql.to_string(),
                binds: Vec::new(),
                cursor: None,
                fetched: 0,
            },
        );
        Ok(handle)
    }

    fn bind_by_name(
        &self,
        stmt: StmtHandle,
        name: &str,
        slot: &BindSlot,
        _options: BindOptions,
    ) -> NativeResult<()> {
        self.begin(Call::Bind(name.to_string()), Some(Op::Bind), Some(stmt.into()))?;
        if let Some(entry) = self.state.borrow_mut().statements.get_mut(&stmt) {
            entry.binds.push((name.to_string(), slot.clone()));
        }
        Ok(())
    }

    fn execute(&self, stmt: StmtHandle, mode: CommitMode) -> NativeResult<()> {
        self.begin(Call::Execute(mode), Some(Op::Execute), Some(stmt.into()))?;
        let mut state = self.state.borrow_mut();
        let State {
            statements,
            rows,
            outputs,
            ..
        } = &mut *state;
        let Some(entry) = statements.get_mut(&stmt) else {
            return Err(CallFailed);
        };
        for (name, slot) in &entry.binds {
            if let Some(value) = outputs.get(name) {
                slot.set(value.clone());
            }
        }
        entry.cursor = Some(rows.get(&entry.sql).cloned().unwrap_or_default().into());
        entry.fetched = 0;
        Ok(())
    }

    fn fetch_assoc(&self, stmt: StmtHandle) -> NativeResult<Option<Row>> {
        self.begin(Call::Fetch(stmt), None, Some(stmt.into()))?;
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.statements.get_mut(&stmt) else {
            return Err(CallFailed);
        };
        if let Some(cursor) = entry.cursor.as_mut() {
            let row = cursor.pop_front();
            if row.is_some() {
                entry.fetched += 1;
            }
            return Ok(row);
        }
        state.diagnostics.insert(
            Some(stmt.into()),
            Diagnostic::new(24374, "define not done before fetch or execute and fetch"),
        );
        Err(CallFailed)
    }

    fn num_rows(&self, stmt: StmtHandle) -> NativeResult<u64> {
        self.begin(Call::NumRows(stmt), None, Some(stmt.into()))?;
        Ok(self
            .state
            .borrow()
            .statements
            .get(&stmt)
            .map_or(0, |entry| entry.fetched))
    }

    /// Column count of the first scripted row for the statement's SQL.
    fn num_fields(&self, stmt: StmtHandle) -> NativeResult<usize> {
        self.begin(Call::NumFields(stmt), None, Some(stmt.into()))?;
        let state = self.state.borrow();
        let entry = state.statements.get(&stmt).ok_or(CallFailed)?;
        Ok(state
            .rows
            .get(&entry.sql)
            .and_then(|rows| rows.first())
            .map_or(0, |row| row.len()))
    }

    fn statement_type(&self, stmt: StmtHandle) -> NativeResult<StatementType> {
        self.begin(Call::StatementType(stmt), None, Some(stmt.into()))?;
        let state = self.state.borrow();
        let entry = state.statements.get(&stmt).ok_or(CallFailed)?;
        Ok(StatementType::from_sql(&entry.sql))
    }

    fn commit(&self, conn: ConnHandle) -> NativeResult<()> {
        self.begin(Call::Commit(conn), Some(Op::Commit), Some(conn.into()))
    }

    fn rollback(&self, conn: ConnHandle) -> NativeResult<()> {
        self.begin(Call::Rollback(conn), None, Some(conn.into()))
    }

    fn free_statement(&self, stmt: StmtHandle) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Free(stmt));
        state.statements.remove(&stmt);
    }

    fn error(&self, handle: Option<Handle>) -> Option<Diagnostic> {
        let mut state = self.state.borrow_mut();
        state.last_error_query = Some(handle);
        state.diagnostics.get(&handle).cloned()
    }
}
