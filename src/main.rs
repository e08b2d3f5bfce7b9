//! Keyspace engine host
//!
//! Loads the configuration, installs logging and drives the engine's
//! periodic work (`server_cron` at `hz`, `before_sleep` after every tick)
//! until Ctrl-C. Client I/O is attached by embedding the library; this
//! binary owns only the event loop.
//!
//! ## Usage
//!
//! ```text
//! redis-keyspace [path/to/config.toml]
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | REDIS_KEYSPACE_DATABASES | Number of databases |
//! | REDIS_KEYSPACE_HZ | Cron frequency |
//! | REDIS_KEYSPACE_REQUIREPASS | Password; empty disables AUTH |
//! | REDIS_KEYSPACE_NOTIFY | Keyspace event classes, e.g. `KEA` |
//! | REDIS_KEYSPACE_LOGLEVEL | debug, verbose, notice, warning |
//! | RUST_LOG | Overrides the log level entirely |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use redis_keyspace::config::ServerConfig;
use redis_keyspace::observability::init_tracing;
use redis_keyspace::redis::Server;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

fn load_config() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(&path)?,
        None => ServerConfig::default(),
    };
    Ok(config.apply_env()?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Fatal error loading the config: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.loglevel, config.log_json);

    let pidfile = config.pidfile.clone();
    let period = Duration::from_millis(1000 / config.hz);
    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        run_id = server.run_id(),
        databases = server.num_dbs(),
        hz = server.config().hz,
        "keyspace engine started"
    );

    if let Some(path) = &pidfile {
        if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
            warn!(path = %path.display(), error = %e, "failed to write pidfile");
        }
    }

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                server.server_cron();
                server.before_sleep();
            }
            _ = signal::ctrl_c() => {
                info!("received Ctrl-C, shutting down");
                break;
            }
        }
    }

    server.shutdown();
    if let Some(path) = &pidfile {
        let _ = std::fs::remove_file(path);
    }
    info!("bye");
    Ok(())
}
