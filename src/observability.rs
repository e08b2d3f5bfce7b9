//! Logging setup.
//!
//! `RUST_LOG` wins over the configured level when set.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global fmt subscriber. Later calls are no-ops.
pub fn init_tracing(level: &str, json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(map_level(level)));
        let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
        let result = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {}", e);
        }
    });
}

/// Accept the classic server level names alongside tracing's own.
fn map_level(level: &str) -> &str {
    match level {
        "verbose" => "debug",
        "notice" => "info",
        "warning" => "warn",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_level() {
        assert_eq!(map_level("notice"), "info");
        assert_eq!(map_level("warning"), "warn");
        assert_eq!(map_level("verbose"), "debug");
        assert_eq!(map_level("trace"), "trace");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("debug", false);
        init_tracing("info", true);
    }
}
