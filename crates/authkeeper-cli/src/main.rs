//! Authkeeper CLI
//!
//! Runs administrative commands against the authkeeper store and dumps or
//! restores per-database snapshots. State lives in `storage.data_dir` and is
//! written back after every mutating invocation.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use authkeeper_core::auth::challenge::client_key;
use authkeeper_core::config::{LoggingConfig, ServerConfig};
use authkeeper_core::dump::RestoreOptions;
use authkeeper_core::server::AuthServer;

/// Authentication and user management for a document database.
#[derive(Parser)]
#[command(name = "authkeeper")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "AUTHKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run command documents in one client session, printing each reply.
    Exec {
        /// Database the commands run against.
        #[arg(long, default_value = "admin")]
        db: String,

        /// Log in with challenge-response before running the commands.
        #[arg(long, requires = "password")]
        user: Option<String>,

        /// Password for --user.
        #[arg(long, env = "AUTHKEEPER_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Database the user is defined in, if not --db.
        #[arg(long)]
        auth_db: Option<String>,

        /// Print Prometheus metrics after the commands.
        #[arg(long)]
        print_metrics: bool,

        /// Command documents, e.g. '{"usersInfo": 1}'.
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Write a snapshot of one database.
    Dump {
        #[arg(long)]
        db: String,

        /// Dump root; the snapshot lands in <out>/<db>.
        #[arg(long)]
        out: PathBuf,
    },

    /// Load a snapshot into one database.
    Restore {
        /// Target database.
        #[arg(long)]
        db: String,

        /// Snapshot directory, or a dump root holding <db>.
        #[arg(long)]
        dir: PathBuf,

        /// Remove the database's existing entries first.
        #[arg(long)]
        drop: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };

    // Apply CLI overrides
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = Some(data_dir);
    }

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    // Setup tracing
    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = ?config.storage.data_dir,
        authorization = config.security.authorization,
        "starting authkeeper"
    );

    let server = AuthServer::open(config)?;

    match args.command {
        Command::Exec {
            db,
            user,
            password,
            auth_db,
            print_metrics,
            commands,
        } => {
            let credentials = user.zip(password);
            let ok = exec(&server, &db, auth_db.as_deref(), credentials, &commands)?;
            server.persist()?;
            if print_metrics {
                if let Some(metrics) = server.metrics() {
                    print!("{}", metrics.encode()?);
                }
            }
            if !ok {
                bail!("one or more commands failed");
            }
        }
        Command::Dump { db, out } => {
            let report = server.dump(&db, &out)?;
            println!(
                "dumped {} users, {} roles, {} indexes to {}",
                report.users,
                report.roles,
                report.indexes,
                report.dir.display()
            );
        }
        Command::Restore { db, dir, drop } => {
            let report = server.restore(&db, &dir, &RestoreOptions { drop, cancel: None })?;
            server.persist()?;
            println!(
                "restored {} users, {} roles, {} indexes into {} (from {})",
                report.users, report.roles, report.indexes, report.db, report.source_db
            );
        }
    }

    Ok(())
}

/// Run `commands` in one session. Returns whether every command succeeded.
fn exec(
    server: &AuthServer,
    db: &str,
    auth_db: Option<&str>,
    credentials: Option<(String, String)>,
    commands: &[String],
) -> anyhow::Result<bool> {
    let mut session = server.new_session();

    if let Some((user, password)) = credentials {
        let auth_db = auth_db.unwrap_or(db);
        let reply = server.run(&mut session, auth_db, &serde_json::json!({"getnonce": 1}));
        let Some(nonce) = reply.get("nonce").and_then(Value::as_str).map(str::to_string) else {
            bail!("getnonce failed: {reply}");
        };
        let key = client_key(&user, &password, &nonce);
        let reply = server.run(
            &mut session,
            auth_db,
            &serde_json::json!({"authenticate": 1, "user": user, "nonce": nonce, "key": key}),
        );
        if !reply.is_ok() {
            bail!("authentication failed: {reply}");
        }
    }

    let mut all_ok = true;
    for raw in commands {
        let command: Value =
            serde_json::from_str(raw).with_context(|| format!("parsing command {raw}"))?;
        let reply = server.run(&mut session, db, &command);
        all_ok &= reply.is_ok();
        println!("{reply}");
    }
    Ok(all_ok)
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command replies.
    if config.json {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}
