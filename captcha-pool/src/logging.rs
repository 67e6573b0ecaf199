//! Tracing setup for hosts and worker processes.
//!
//! `RUST_LOG` wins when set. Otherwise `CAPTCHA_POOL_LOG` picks the level for
//! this crate (default info). `LOG_FORMAT=json` switches to JSON lines.
//! Output always goes to stderr: a worker's stdout carries protocol frames.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV_VAR: &str = "CAPTCHA_POOL_LOG";

/// Install a global subscriber. A subscriber that is already installed is kept.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV_VAR).ok();
        EnvFilter::new(filter_directives(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn filter_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    // Frame-level codec tracing stays off unless asked for via RUST_LOG.
    format!("captcha_pool={level},captcha_pool::bridge::codec=off")
}
