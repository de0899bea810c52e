use clap::Parser;
use ocikit::config::{self, ConnectionConfig};
use ocikit::core::AppResult;
use ocikit::{CommitMode, Connection, SqlSource, SqliteDriver};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use tracing::info;

/// Runs one SQL statement and prints its result: one JSON object per row,
/// or the number of affected rows.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Options {
    /// Configuration file; defaults to ocikit/config.toml in the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect identifier, overriding the configured one
    #[arg(long)]
    connect: Option<String>,

    /// SQL text, or `-` to read it from stdin
    #[arg(default_value = "-")]
    sql: String,
}

fn run(options: Options) -> AppResult<()> {
    let config = config::load_or_default(options.config.as_deref())?;
    let mut conn_config: ConnectionConfig = config.connection;
    if let Some(dsn) = options.connect {
        conn_config = conn_config.with_connect(dsn);
    }

    let conn = Connection::new(Rc::new(SqliteDriver::new()), conn_config);
    let source = match options.sql.as_str() {
        "-" => SqlSource::reader(io::stdin()),
        sql => SqlSource::from(sql),
    };
    let mut stmt = conn.parse(source)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if stmt.num_fields()? > 0 {
        for row in stmt.query() {
            let (_, row) = row?;
            writeln!(out, "{}", serde_json::to_string(&row)?)?;
        }
    } else {
        stmt.execute(CommitMode::CommitOnSuccess)?;
        writeln!(out, "{} row(s) affected", stmt.num_rows()?)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt().with_writer(io::stderr).init();
    let options = Options::parse();

    info!("Starting ocikit...");
    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            if let ocikit::OciError::Failure(failure) = &e {
                if !failure.sql_text.is_empty() {
                    eprintln!("  at offset {} in: {}", failure.offset, failure.sql_text);
                }
            }
            ExitCode::FAILURE
        }
    }
}
