/// Connection Management Module
///
/// `Connection` owns one native connection handle from `connect` to `close`,
/// picks the driver's connect strategy from its configuration, and produces
/// statements through `parse`.

use crate::config::ConnectionConfig;
use crate::core::db::driver::{ConnHandle, ConnectStrategy, Driver};
use crate::core::db::sqlite::SqliteDriver;
use crate::core::db::statement::{SqlSource, Statement};
use crate::core::{Failure, Result};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// A database connection over a native driver.
///
/// The handle is either absent or valid. Operations take `&self` so that
/// statements can borrow the connection while it still commits and rolls
/// back; the `Cell` keeps the type single-threaded.
pub struct Connection<D: Driver = SqliteDriver> {
    driver: Rc<D>,
    config: ConnectionConfig,
    handle: Cell<Option<ConnHandle>>,
}

impl<D: Driver> Connection<D> {
    /// Creates an unconnected connection. No native call is made.
    pub fn new(driver: Rc<D>, config: ConnectionConfig) -> Self {
        Connection {
            driver,
            config,
            handle: Cell::new(None),
        }
    }

    /// Establishes the native connection.
    ///
    /// Does nothing when a handle already exists, unless `force` is set; a
    /// forced reconnect releases the old handle before asking for a new one.
    ///
    /// # Errors
    ///
    /// Returns a native `Failure` read from the driver's global diagnostics
    /// channel, since no handle exists to scope it to.
    pub fn connect(&self, force: bool) -> Result<&Self> {
        if self.handle.get().is_some() && !force {
            return Ok(self);
        }
        self.close();

        let strategy = ConnectStrategy::for_config(&self.config);
        debug!(
            "Connecting as '{}' to {:?} ({:?})",
            self.config.username(),
            self.config.connect(),
            strategy
        );
        match self.driver.connect(strategy, &self.config) {
            Ok(handle) => {
                self.handle.set(Some(handle));
                Ok(self)
            }
            Err(_) => Err(Failure::from_handle(
                &*self.driver,
                None,
                Some("Unable to create connection handle"),
            )),
        }
    }

    /// Prepares SQL text, connecting first if needed.
    ///
    /// `sql` may be a string, raw bytes, or a reader that is drained into a
    /// string before anything reaches the driver.
    ///
    /// # Errors
    ///
    /// A local "Invalid sql string" failure when the source is not valid
    /// UTF-8 text; otherwise any connect failure, or the prepare failure
    /// scoped to this connection's handle.
    pub fn parse<'s>(&self, sql: impl Into<SqlSource<'s>>) -> Result<Statement<'_, D>> {
        let sql = sql
            .into()
            .into_sql()
            .ok_or_else(|| Failure::local("Invalid sql string"))?;

        let handle = self.connect(false)?.handle()?;
        match self.driver.parse(handle, &sql) {
            Ok(stmt) => Ok(Statement::new(self, stmt)),
            Err(_) => Err(Failure::from_handle(&*self.driver, Some(handle.into()), None)),
        }
    }

    /// Commits the active transaction.
    pub fn commit(&self) -> Result<&Self> {
        let handle = self.handle()?;
        match self.driver.commit(handle) {
            Ok(()) => Ok(self),
            Err(_) => Err(Failure::from_handle(&*self.driver, Some(handle.into()), None)),
        }
    }

    /// Rolls back the active transaction.
    pub fn rollback(&self) -> Result<&Self> {
        let handle = self.handle()?;
        match self.driver.rollback(handle) {
            Ok(()) => Ok(self),
            Err(_) => Err(Failure::from_handle(&*self.driver, Some(handle.into()), None)),
        }
    }

    /// Releases the native handle if there is one. Safe to call repeatedly.
    pub fn close(&self) -> &Self {
        if let Some(handle) = self.handle.take() {
            debug!("Closing connection handle {:?}", handle);
            self.driver.close(handle);
        }
        self
    }

    /// The current native handle.
    ///
    /// # Errors
    ///
    /// A local failure when the connection has no handle.
    pub fn handle(&self) -> Result<ConnHandle> {
        self.handle
            .get()
            .ok_or_else(|| Failure::local("Connection handle not initialized"))
    }

    pub fn is_connected(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: Driver> Drop for Connection<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: Driver> fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("handle", &self.handle.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::driver::{Diagnostic, Handle, SessionMode};
    use crate::test_utils::{Call, ScriptedDriver};

    fn scripted(config: ConnectionConfig) -> (Rc<ScriptedDriver>, Connection<ScriptedDriver>) {
        let driver = Rc::new(ScriptedDriver::new());
        let conn = Connection::new(Rc::clone(&driver), config);
        (driver, conn)
    }

    #[test]
    fn test_new_makes_no_native_call() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        assert!(!conn.is_connected());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        conn.connect(false).unwrap();
        let first = conn.handle().unwrap();

        conn.connect(false).unwrap();
        assert_eq!(conn.handle().unwrap(), first);
        assert_eq!(driver.count(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[test]
    fn test_forced_reconnect_releases_old_handle_first() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        conn.connect(false).unwrap();
        let old = conn.handle().unwrap();

        conn.connect(true).unwrap();
        let new = conn.handle().unwrap();
        assert_ne!(old, new);

        let calls = driver.calls();
        let close_at = calls.iter().position(|c| *c == Call::Close(old)).unwrap();
        let reconnect_at = calls.iter().rposition(|c| matches!(c, Call::Connect(_))).unwrap();
        assert!(close_at < reconnect_at);
        assert_eq!(driver.open_connections(), 1);
    }

    #[test]
    fn test_strategy_precedence() {
        let (driver, conn) = scripted(
            ConnectionConfig::new("scott", "tiger")
                .with_persistent(true)
                .with_exclusive(true),
        );
        conn.connect(false).unwrap();
        assert_eq!(driver.calls()[0], Call::Connect(ConnectStrategy::Exclusive));

        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger").with_persistent(true));
        conn.connect(false).unwrap();
        assert_eq!(driver.calls()[0], Call::Connect(ConnectStrategy::Persistent));

        let (driver, conn) = scripted(
            ConnectionConfig::new("sys", "pw").with_session_mode(SessionMode::SYSDBA),
        );
        conn.connect(false).unwrap();
        assert_eq!(driver.calls()[0], Call::Connect(ConnectStrategy::Default));
    }

    #[test]
    fn test_connect_failure_reads_global_channel() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "wrong"));
        driver.fail_connect(Diagnostic::new(1017, "invalid username/password; logon denied"));

        let err = conn.connect(false).unwrap_err();
        assert!(!err.is_local());
        assert_eq!(err.code, 1017);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_connect_failure_without_diagnostic_uses_fallback() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        driver.fail_connect_silently();

        let err = conn.connect(false).unwrap_err();
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "Unable to create connection handle");
    }

    #[test]
    fn test_commit_without_handle_is_local_failure() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));

        let err = conn.commit().unwrap_err();
        assert!(err.is_local());
        assert_eq!(err.code, 0);
        assert_eq!(err.offset, 0);
        assert!(err.sql_text.is_empty());
        insta::assert_snapshot!(err.to_string(), @"local failure (code 0): Connection handle not initialized");

        assert!(conn.rollback().unwrap_err().is_local());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_failed_commit_keeps_connection() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        conn.connect(false).unwrap();
        let handle = conn.handle().unwrap();
        driver.fail_next_commit(Diagnostic::new(2091, "transaction rolled back"));

        let err = conn.commit().unwrap_err();
        assert_eq!(err.code, 2091);
        assert_eq!(conn.handle().unwrap(), handle);
        conn.commit().unwrap();
        conn.rollback().unwrap();
    }

    #[test]
    fn test_invalid_sql_source_makes_no_native_call() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));

        let err = conn.parse(&[0xff_u8, 0xfe][..]).unwrap_err();
        assert!(err.is_local());
        assert_eq!(err.message, "Invalid sql string");
        assert!(driver.calls().is_empty());

        let err = conn.parse("SELECT 1\0").unwrap_err();
        assert_eq!(err.message, "Invalid sql string");
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_parse_connects_lazily_and_scopes_failures() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        let stmt = conn.parse("SELECT 1 FROM DUAL").unwrap();
        assert!(conn.is_connected());
        drop(stmt);

        let handle = conn.handle().unwrap();
        driver.fail_next_parse(Diagnostic::new(900, "invalid SQL statement").with_sql("SELEC 1", 0));
        let err = conn.parse("SELEC 1").unwrap_err();
        assert_eq!(err.code, 900);
        assert_eq!(err.sql_text, "SELEC 1");
        assert_eq!(
            driver.last_error_query(),
            Some(Some(Handle::Connection(handle)))
        );
    }

    #[test]
    fn test_parse_from_reader() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        let mut source = std::io::Cursor::new(b"SELECT 1 FROM DUAL".to_vec());
        let _stmt = conn.parse(&mut source).unwrap();
        assert!(driver
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Parse(sql) if sql == "SELECT 1 FROM DUAL")));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (driver, conn) = scripted(ConnectionConfig::new("scott", "tiger"));
        conn.close();
        conn.connect(false).unwrap();
        conn.close().close();
        assert!(!conn.is_connected());
        assert_eq!(driver.count(|c| matches!(c, Call::Close(_))), 1);
    }

    #[test]
    fn test_drop_releases_handle() {
        let driver = Rc::new(ScriptedDriver::new());
        {
            let conn = Connection::new(Rc::clone(&driver), ConnectionConfig::new("scott", "tiger"));
            conn.connect(false).unwrap();
            assert_eq!(driver.open_connections(), 1);
        }
        assert_eq!(driver.open_connections(), 0);
    }
}
