//! Rollcall CLI - drive the school-management data layer from a terminal.
//!
//! Fetches API paths through the session cache and reports on the session
//! window. Mostly useful for poking at a backend and checking cache keys.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rollcall_core::auth::SessionStats;
use rollcall_core::{
    ApiClient, Config, FetchConfig, FetchUnit, MemoryStorage, SessionDecision, SessionManager,
    SessionStorage, TtlStore,
};

/// Set to a directory to write a daily-rolling log file instead of stderr
const LOG_DIR_ENV: &str = "ROLLCALL_LOG_DIR";

/// Bearer token for authenticated requests
const TOKEN_ENV: &str = "ROLLCALL_TOKEN";

const USAGE: &str = "\
Usage: rollcall <command>

Commands:
  get <path>... [--force]   Fetch API paths through the session cache
  session                   Start a session and print its state
  config [--save]           Print the effective configuration, or write it
                            to the config file
  help                      Show this message

Environment:
  ROLLCALL_API_URL, ROLLCALL_TOKEN, ROLLCALL_CACHE_TTL_MINUTES,
  ROLLCALL_SESSION_WINDOW_MINUTES, ROLLCALL_SESSION_MAX_EXTENSIONS,
  ROLLCALL_LOG_DIR, RUST_LOG";

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so buffered file output is flushed.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let file_appender = tracing_appender::rolling::daily(dir, "rollcall.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
                .with(filter)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// Everything the commands share: one storage instance backs both the
/// cache and the session record.
struct Context {
    config: Config,
    store: TtlStore,
    sessions: SessionManager,
    client: ApiClient,
}

impl Context {
    fn new(config: Config) -> Result<Self> {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let store = TtlStore::new(storage.clone()).with_prefix(config.cache.key_prefix.clone());
        let sessions = SessionManager::new(storage).with_policy(config.session_policy());

        let mut client = ApiClient::new(config.api.base_url.clone(), config.api.timeout())?;
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                client.set_token(token);
            }
        }

        Ok(Self {
            config,
            store,
            sessions,
            client,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config = Config::load()?;
    info!(base_url = %config.api.base_url, "Rollcall starting");

    match command.as_str() {
        "get" => {
            let ctx = Context::new(config)?;
            run_get(&ctx, &args[1..]).await
        }
        "session" => {
            let ctx = Context::new(config)?;
            run_session(&ctx)
        }
        "config" => {
            if args[1..].iter().any(|a| a == "--save") {
                let path = config.save()?;
                println!("Saved configuration to {}", path.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            Ok(())
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

/// Fetch each path through its own unit. Repeated paths are served from
/// the cache unless `--force` is given.
async fn run_get(ctx: &Context, args: &[String]) -> Result<()> {
    let force = args.iter().any(|a| a == "--force");
    let paths: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();
    if paths.is_empty() {
        bail!("get needs at least one path\n\n{}", USAGE);
    }

    match ctx.sessions.resolve() {
        SessionDecision::ForceLogout => {
            ctx.sessions.init_session();
        }
        decision => info!(?decision, "Session checked"),
    }

    let mut failures = 0;
    for path in paths {
        let config = FetchConfig::new()
            .with_cache_key(path.as_str())
            .with_ttl(ctx.config.default_ttl());
        let producer = ctx.client.get_producer(path);
        let unit: FetchUnit<Value> = FetchUnit::new(ctx.store.clone(), producer, config)?;

        if force {
            unit.refetch().await;
        } else {
            unit.sync().await;
        }

        let state = unit.snapshot();
        if let Some(error) = state.error {
            eprintln!("{}: {}", path, error);
            failures += 1;
            continue;
        }

        if let Some(entry) = ctx.store.info(&unit.cache_key()) {
            eprintln!("{} (cached {})", path, entry.age_display());
        }
        if let Some(data) = state.data {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    }

    if failures > 0 {
        bail!("{} request(s) failed", failures);
    }
    Ok(())
}

fn run_session(ctx: &Context) -> Result<()> {
    let info = ctx.sessions.init_session();
    info!(start_time = %info.start_time, "Session started");

    let check = ctx.sessions.check_session();
    println!("state:          {:?}", check.state);
    println!("valid:          {}", check.is_valid);
    println!("should extend:  {}", check.should_extend);

    if let Some(stats) = ctx.sessions.get_session_stats() {
        print_stats(&stats);
    }
    Ok(())
}

fn print_stats(stats: &SessionStats) {
    println!("started:        {}", stats.start_time.format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "extensions:     {}/{} ({} left)",
        stats.extension_count, stats.max_extensions, stats.extensions_left
    );
    println!("expires in:     {} min", stats.minutes_until_expiry());
}
