//! LLMule broker -- entry point.
//!
//! Loads configuration, opens the store, bootstraps the first admin
//! account, starts the heartbeat monitor and the settlement reconciler,
//! and serves the client API plus the provider WebSocket endpoint until a
//! shutdown signal arrives.

use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use llmule::auth::users::bootstrap_admin;
use llmule::config::{Config, LoggingConfig};
use llmule::db::Database;
use llmule::ledger::spawn_reconciler;
use llmule::registry::spawn_heartbeat_monitor;
use llmule::{build_app, AppState};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

const USAGE: &str = "\
Usage: llmule [-c <path>]

  -c, --config <path>   configuration file (default: llmule.toml, or the
                        LLMULE_CONFIG environment variable)
  -h, --help            show this help
  -V, --version         show the version

The RUST_LOG environment variable overrides the configured log level.
";

/// Resolve the configuration path: `--config` beats `LLMULE_CONFIG` beats
/// the default. Help, version, and bad flags exit here.
fn config_path_from_args() -> PathBuf {
    let mut path = std::env::var_os("LLMULE_CONFIG").map(PathBuf::from);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => match args.next() {
                Some(value) => path = Some(PathBuf::from(value)),
                None => fail_usage("the --config flag needs a path"),
            },
            "-h" | "--help" => {
                print!("{USAGE}");
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("llmule {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => fail_usage(&format!("unrecognized argument '{other}'")),
        }
    }

    path.unwrap_or_else(|| PathBuf::from("llmule.toml"))
}

fn fail_usage(message: &str) -> ! {
    eprintln!("llmule: {message}");
    eprintln!("{USAGE}");
    std::process::exit(2);
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path_from_args();
    let config = Config::load(&config_path)?;
    init_tracing(&config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting llmule"
    );

    let db = Database::open(&config.database.path)?;
    tracing::info!(path = %config.database.path.display(), "Store opened");

    // On an empty user table, create the admin account and show its key --
    // this is the only time the plaintext ever leaves the process.
    match bootstrap_admin(&db, &config.auth.default_admin_name)? {
        Some(created) => {
            tracing::info!(admin = %created.user.name, "Created initial admin account");
            println!();
            println!("  Admin API key (shown once, store it now):");
            println!("  {}", created.plaintext_key);
            println!();
        }
        None => tracing::debug!("Users already present, no admin bootstrap"),
    }

    if !config.auth.enabled {
        tracing::warn!("auth.enabled = false: every request runs as an admin");
    }
    if config.auth.allow_anonymous_providers {
        tracing::warn!("Anonymous providers enabled: they serve traffic but never earn MULE");
    }

    let listen_addr = config.listen_addr();
    let (state, reconcile_rx) = AppState::new(config, db);

    let reconciler = spawn_reconciler(state.ledger.clone(), reconcile_rx);
    let monitor = spawn_heartbeat_monitor(
        state.registry.clone(),
        state.pending.clone(),
        state.config.dispatch.clone(),
    );

    let app = build_app(state.clone());
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    println!("  llmule v{} is up", env!("CARGO_PKG_VERSION"));
    println!("  clients:   http://{listen_addr}/v1/");
    println!("  providers: ws://{listen_addr}/v1/providers/connect");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The monitor loops forever, so stop it; dropping the last AppState
    // closes the reconcile channel and lets the reconciler drain out.
    tracing::info!("Shutting down");
    monitor.abort();
    drop(state);
    let _ = reconciler.await;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Install the global subscriber. `RUST_LOG` wins when set; otherwise the
/// configured level applies to llmule and the HTTP layer, with everything
/// else at warn.
fn init_tracing(logging: &LoggingConfig) {
    let fallback = format!(
        "warn,llmule={level},tower_http={level}",
        level = logging.level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received"),
        _ = term.recv() => tracing::info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Interrupt received");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
