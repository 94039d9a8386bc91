use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON lines; anything else is plain text.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Plain,
        }
    }
}

/// Filter for our own crates when `RUST_LOG` is not set.
fn default_directives(level: Option<&str>) -> String {
    let level = level_from(level);
    format!("observatory={level},observatory_daemon={level}")
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `OBSERVATORY_LOG`. Output always goes to stderr since
/// the engine process speaks frames on stdout.
pub fn init_tracing() -> Result<(), TryInitError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_directives(
            std::env::var("OBSERVATORY_LOG").ok().as_deref(),
        )),
    };

    let format = LogFormat::from_env_value(std::env::var("LOG_FORMAT").ok().as_deref());
    let output = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Plain => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
}

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}
