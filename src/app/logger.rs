use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};
use crate::config::Config;

/// Initialize tracing. Command-line flags win over the `[observability]`
/// section; `RUST_LOG` can still refine both.
pub fn init(args: &Args, config: &Config) {
    let level = args
        .log_level
        .map(|l| l.to_string())
        .unwrap_or_else(|| config.observability.log_level.clone());

    let filter = EnvFilter::from_default_env()
        .add_directive(level.parse().unwrap_or_else(|_| "info".parse().unwrap()));

    let format = match args.log_format {
        Some(f) => f,
        None => match config.observability.log_format.as_str() {
            "json" => LogFormat::Structured,
            "pretty" => LogFormat::Debug,
            _ => LogFormat::Text,
        },
    };

    let trace_sub = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color);

    match format {
        LogFormat::Structured => trace_sub.json().init(),
        LogFormat::Debug => trace_sub.pretty().init(),
        LogFormat::Text => trace_sub.init(),
    };
}
