use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level parsed from CLI or config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logger(level: Option<LogLevel>) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        let level = level.unwrap_or_default();
        EnvFilter::new(format!("portway={}", level.as_str()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Record a user connection event on a proxy
    pub fn connection(proxy: &str, peer: &str, event: &str) {
        info!(proxy = proxy, peer = peer, event = event, "Connection");
    }

    /// Record a login attempt
    pub fn login(peer: &str, user: &str, success: bool) {
        if success {
            info!(peer = peer, user = user, "Login successful");
        } else {
            warn!(peer = peer, user = user, "Login failed");
        }
    }
}
