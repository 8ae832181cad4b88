/// Tracing setup for the server.
///
/// MNEMODB_LOG         filter directives, falling back to RUST_LOG, then "info"
/// MNEMODB_LOG_FORMAT  json (default) | pretty | compact

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to JSON.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }

    fn from_env() -> Self {
        std::env::var("MNEMODB_LOG_FORMAT").map_or(LogFormat::Json, |raw| LogFormat::parse(&raw))
    }
}

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_env("MNEMODB_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logging() {
    let format = LogFormat::from_env();
    let registry = tracing_subscriber::registry().with(filter_from_env());
    match format {
        LogFormat::Json => registry.with(fmt::layer().with_writer(std::io::stdout).json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_writer(std::io::stdout).pretty()).init(),
        LogFormat::Compact => registry.with(fmt::layer().with_writer(std::io::stdout).compact()).init(),
    }

    tracing::info!(?format, "MnemoDB logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_names() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(" Compact "), LogFormat::Compact);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }
}
