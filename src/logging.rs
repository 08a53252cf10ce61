use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Command-line adjustments applied on top of `[logging]`
#[derive(Debug, Clone, Default)]
pub struct LogOverrides {
    pub level: Option<String>,
    pub format: Option<String>,
    /// Include thread ids, files and line numbers in console output
    pub detailed: bool,
}

/// Filter directive for console output. `RUST_LOG` still wins when set.
pub fn console_directive(config: &LoggingConfig, overrides: &LogOverrides) -> String {
    let level = overrides.level.as_deref().unwrap_or(&config.level);
    format!("nutflix={}", level)
}

/// Install the global subscriber: a console layer plus an optional
/// non-blocking file layer. Keep the returned guard alive to flush the file.
pub fn init_logging(config: &LoggingConfig, overrides: &LogOverrides) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directive(config, overrides)));

    let detailed = overrides.detailed;
    let format = overrides.format.as_deref().unwrap_or(&config.format);
    let console: Box<dyn Layer<Registry> + Send + Sync> = match format {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        "pretty" => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(detailed)
            .with_file(detailed)
            .with_line_number(detailed)
            .boxed(),
        other => {
            eprintln!("Warning: Unknown log format '{}', using default", other);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(detailed)
                .with_file(detailed)
                .with_line_number(detailed)
                .boxed()
        }
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> =
        vec![console.with_filter(env_filter).boxed()];
    let mut guard = None;

    if let Some(file) = &config.file {
        let path = Path::new(file);
        let directory = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .with_context(|| format!("log file path '{}' has no file name", file))?;
        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating log directory {}", directory.display()))?;

        let level = LevelFilter::from_str(&config.file_level)
            .with_context(|| format!("invalid file_level '{}'", config.file_level))?;
        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);

        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(level)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_directive_prefers_override() {
        let config = LoggingConfig::default();
        assert_eq!(console_directive(&config, &LogOverrides::default()), "nutflix=info");

        let overrides = LogOverrides {
            level: Some("debug".to_string()),
            ..LogOverrides::default()
        };
        assert_eq!(console_directive(&config, &overrides), "nutflix=debug");
    }

    #[test]
    fn test_file_levels_parse() {
        assert_eq!(LevelFilter::from_str("debug").unwrap(), LevelFilter::DEBUG);
        assert!(LevelFilter::from_str("chatty").is_err());
    }
}
