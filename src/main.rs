#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use event_relayer::config::{self, LoggingConfig};
use event_relayer::context::RelayerContext;
use event_relayer::error::Error;
use event_relayer::service;
use event_relayer::store::SledStore;

/// The Event Relayer Command-line tool
///
/// Start the relayer from a config file:
///
///     $ event-relayer -vv -c <CONFIG_FILE_PATH>
#[derive(StructOpt)]
#[structopt(name = "Event Relayer")]
struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    verbose: i32,
    /// File that contains the configuration.
    #[structopt(
        short = "c",
        long = "config-path",
        value_name = "PATH",
        parse(from_os_str)
    )]
    config_path: Option<PathBuf>,
}

#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> event_relayer::Result<()> {
    let config_path = args
        .config_path
        .clone()
        .or_else(|| std::env::var_os("CONFIG_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./src/config/relayer.config.json"));
    let (config, warnings) = config::load_with_warnings(&config_path)?;
    let _guard = setup_logger(args.verbose, &config.logging)?;
    for warning in warnings {
        tracing::warn!("{warning}");
    }
    tracing::info!("configuration loaded from {}", config_path.display());

    let db_path = std::env::var_os("DATABASE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.database.path.clone());
    let store = Arc::new(SledStore::open(&db_path)?);
    let ctx = RelayerContext::new(config);
    service::start_background_services(&ctx, store).await?;
    tracing::info!("relayer started");

    wait_for_shutdown().await?;
    tracing::warn!("shutting down...");
    ctx.shutdown();
    // let the queue drain in-flight handlers before the process exits.
    tokio::time::sleep(Duration::from_secs(2)).await;
    if env_flag("CLEAR_DB_ON_EXIT") {
        tracing::warn!("clearing the database at {}", db_path.display());
        if let Err(e) = std::fs::remove_dir_all(&db_path) {
            tracing::error!("failed to clear the database: {e}");
        }
    }
    tracing::info!("clean exit");
    Ok(())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn setup_logger(
    verbosity: i32,
    logging: &LoggingConfig,
) -> event_relayer::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing::Level;
    let level = match std::env::var("LOG_LEVEL") {
        Ok(level) => level
            .parse::<Level>()
            .map_err(|_| Error::InvalidConfig(format!("unknown LOG_LEVEL {level}")))?,
        Err(_) if verbosity > 0 => match verbosity {
            1 => Level::WARN,
            2 => Level::INFO,
            3 => Level::DEBUG,
            _ => Level::TRACE,
        },
        Err(_) => logging
            .level
            .parse::<Level>()
            .map_err(|_| Error::InvalidConfig(format!("unknown log level {}", logging.level)))?,
    };
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(
            format!("event_relayer={level}")
                .parse()
                .map_err(|_| Error::Generic("invalid log directive"))?,
        );
    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(level)
        .with_env_filter(env_filter);

    let file_logging = env_flag("ENABLE_FILE_LOGGING") || logging.enable_file_logging;
    if file_logging {
        let log_path = std::env::var_os("LOG_PATH")
            .map(PathBuf::from)
            .or_else(|| logging.log_path.clone())
            .unwrap_or_else(|| PathBuf::from("./event-relayer.log"));
        let dir = log_path.parent().unwrap_or_else(|| Path::new("."));
        let file = log_path
            .file_name()
            .ok_or(Error::Generic("LOG_PATH has no file name"))?;
        let appender = tracing_appender::rolling::never(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        builder.with_writer(writer).with_ansi(false).init();
        Ok(Some(guard))
    } else {
        builder.init();
        Ok(None)
    }
}

async fn wait_for_shutdown() -> event_relayer::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
