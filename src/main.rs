use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use nsmux::config::{Args, Config};
use nsmux::trans::GoawayFlags;
use nsmux::{Error, ProxyFs};

/// Where debug builds write their log.
const DEBUG_LOG_PATH: &str = "/var/log/nsmux.dbg";

/// Grace period granted to translators at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_logging() {
    // release builds are silent; tracing is compiled out there
    if !cfg!(debug_assertions) {
        return;
    }
    let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(DEBUG_LOG_PATH)
    else {
        return;
    };
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nsmux=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    debug!(">> starting initialization");

    let args = Args::parse();
    let config = match Config::resolve(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("nsmux: bad configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let fs = match ProxyFs::new(config).await {
        Ok(fs) => fs,
        Err(err) => {
            eprintln!("nsmux: failed to initialize the root node: {}", err);
            return ExitCode::FAILURE;
        }
    };
    info!(dir = fs.config().dir.as_str(), "mirroring directory");
    debug!(">> initialization complete, serving");

    wait_for_shutdown().await;

    // ask every dynamic translator to go away, forcing the stubborn
    match fs.registry().shutdown_all(GoawayFlags::empty(), true, SHUTDOWN_GRACE).await {
        Ok(()) => {}
        Err(Error::Busy) => {
            if let Err(err) =
                fs.registry().shutdown_all(GoawayFlags::FORCE, true, SHUTDOWN_GRACE).await
            {
                eprintln!("nsmux: could not shut down all translators: {}", err);
                return ExitCode::FAILURE;
            }
        }
        Err(err) => {
            eprintln!("nsmux: could not shut down all translators: {}", err);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
