use anyhow::Context as _;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initializes the global logger.
///
/// Filter directives are taken from the first of: the verbosity flags, the `RUST_LOG` environment variable, and the
/// configured `log_level`. Without any of these, `info` and above is logged. Logs are written to standard error so that
/// standard output stays free for records.
///
/// # Errors
///
/// If the configured directives are invalid, or a global logger is already installed, an error is returned.
pub fn initialize_logging(
    verbosity: Option<LevelFilter>, log_level: Option<&str>, json: bool,
) -> Result<(), anyhow::Error> {
    let filter = build_filter(verbosity, log_level)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if json {
        builder.json().try_init().map_err(anyhow::Error::msg)
    } else {
        builder.compact().try_init().map_err(anyhow::Error::msg)
    }
}

fn build_filter(verbosity: Option<LevelFilter>, log_level: Option<&str>) -> Result<EnvFilter, anyhow::Error> {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());

    if let Some(level) = verbosity {
        return Ok(EnvFilter::default().add_directive(level.into()));
    }

    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(builder.from_env_lossy());
    }

    match log_level {
        Some(directives) => builder
            .parse(directives)
            .with_context(|| format!("Invalid log level '{}'.", directives)),
        None => Ok(builder.parse_lossy("")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_wins() {
        let filter = build_filter(Some(LevelFilter::TRACE), Some("warn")).unwrap();
        assert_eq!(filter.to_string(), "trace");
    }

    #[test]
    fn invalid_configured_level() {
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return;
        }
        assert!(build_filter(None, Some("squitter=loud")).is_err());

        let filter = build_filter(None, Some("warn")).unwrap();
        assert_eq!(filter.to_string(), "warn");
    }
}
