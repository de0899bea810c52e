use crate::core::db::driver::SessionMode;
use crate::core::{AppResult, OciError};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// A password that never shows up in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Password(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Credentials and options for one connection.
///
/// Built once, then handed to `Connection::new`; a connection never changes
/// its configuration afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    username: String,
    password: Password,
    /// Driver-specific connect identifier (DSN)
    connect: Option<String>,
    /// Character set, empty for the driver default
    charset: String,
    session_mode: SessionMode,
    persistent: bool,
    exclusive: bool,
}

impl ConnectionConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        ConnectionConfig {
            username: username.into(),
            password: Password::new(password),
            ..Default::default()
        }
    }

    pub fn with_connect(mut self, connect: impl Into<String>) -> Self {
        self.connect = Some(connect.into());
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn with_session_mode(mut self, session_mode: SessionMode) -> Self {
        self.session_mode = session_mode;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &Password {
        &self.password
    }

    pub fn connect(&self) -> Option<&str> {
        self.connect.as_deref()
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn session_mode(&self) -> SessionMode {
        self.session_mode
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = ocikit::config::load_config("ocikit.toml").expect("Failed to load config");
/// println!("{:?}", config.connection);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> AppResult<Config> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Default location of the configuration file, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ocikit").join("config.toml"))
}

/// Loads the file at `path`, or the default file when it exists, or falls
/// back to an empty configuration.
pub fn load_or_default(path: Option<&Path>) -> AppResult<Config> {
    let loaded = match path {
        Some(path) => load_config(path),
        None => match default_config_path() {
            Some(path) if path.exists() => load_config(&path),
            _ => Ok(Config::default()),
        },
    };
    loaded.map_err(|e| match e {
        OciError::Io(io) => OciError::Config(format!("unable to read configuration: {}", io)),
        other => other,
    })
}
