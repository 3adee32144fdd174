//! Logging: the sink for evaluator log frames, and subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level of a log frame emitted by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Output of Pkl's `trace()`.
    Info,
    Warn,
}

impl LogLevel {
    pub fn from_wire(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::Info),
            1 => Some(Self::Warn),
            _ => None,
        }
    }
}

/// Receives log frames for one evaluator.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, frame_uri: &str);
}

/// Forwards evaluator logs to `tracing` under the `pkl::log` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, frame_uri: &str) {
        match level {
            LogLevel::Info => tracing::info!(target: "pkl::log", %frame_uri, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "pkl::log", %frame_uri, "{}", message),
        }
    }
}

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `PKL_CLIENT_LOG` picks the level for
/// this crate and evaluator logs (default `info`). `LOG_FORMAT=json` switches
/// to JSON lines. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PKL_CLIENT_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pkl_client={level},pkl::log={level}"))
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
