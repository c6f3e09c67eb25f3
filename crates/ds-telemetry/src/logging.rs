use tracing_subscriber::{fmt, EnvFilter};

/// Output encoding for the process-wide subscriber.
///
/// The engine logs structured fields (`job_id`, `card_type`, `seq`) on
/// every scheduler and store event; `Json` keeps those fields machine-
/// readable for shipped logs, `Human` renders them inline for terminals
/// and test output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` from the environment (`json` or anything else
    /// for human-readable), matching the engine's env-driven config style.
    pub fn from_env() -> LogFormat {
        match std::env::var("LOG_FORMAT") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Human,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Human => "human",
            LogFormat::Json => "json",
        }
    }
}

/// Install the process-wide subscriber, picking the format from
/// `LOG_FORMAT`.
///
/// `default_filter` applies when `RUST_LOG` is unset; embedders typically
/// pass something like `"info,ds_engine=debug"`. Repeated calls (library
/// consumers, test binaries) leave the first subscriber in place.
pub fn init(service: &str, default_filter: &str) {
    init_with_format(service, default_filter, LogFormat::from_env());
}

/// Install the process-wide subscriber with an explicit format.
pub fn init_with_format(service: &str, default_filter: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = fmt().with_env_filter(filter).with_target(true);

    let installed = match format {
        LogFormat::Human => builder.try_init().is_ok(),
        // Spans carry no extra context here (fields ride on the events
        // themselves), so the per-line span lists are dropped from the
        // JSON encoding.
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service, format = format.as_str(), "tracing initialised");
    }
}
