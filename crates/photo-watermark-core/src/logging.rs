//! Logging configuration and initialization

use crate::config::{LogOutput, LoggingConfig};
use crate::error::{ExportError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const LOG_FILE_PREFIX: &str = "photo-watermark.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging with the default console configuration
pub fn init_default_logging() -> Result<()> {
    init_logging(&LoggingConfig::default())
}

/// Initialize the logging system. `RUST_LOG` takes precedence over the
/// configured level. Calling this more than once is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(&config.level)?;
    let layers = build_layers(config)?;

    match tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) => {
            let error_msg = e.to_string();
            if error_msg.contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(ExportError::LoggingError {
                    message: format!("Failed to initialize logging: {}", e),
                })
            }
        }
    }
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| ExportError::LoggingError {
        message: format!("Invalid log level {:?}: {}", level, e),
    })
}

fn build_layers(config: &LoggingConfig) -> Result<Vec<BoxedLayer>> {
    let layer: BoxedLayer = match config.output_type {
        LogOutput::Console => {
            if config.json {
                fmt::layer().json().with_writer(std::io::stderr).boxed()
            } else {
                fmt::layer().with_target(true).with_writer(std::io::stderr).boxed()
            }
        }
        LogOutput::File => {
            let directory = config.output_path.clone().ok_or_else(|| ExportError::LoggingError {
                message: "File logging requires an output_path".to_string(),
            })?;
            std::fs::create_dir_all(&directory).map_err(|e| ExportError::LoggingError {
                message: format!("Failed to create log directory {:?}: {}", directory, e),
            })?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);

            if config.json {
                fmt::layer().json().with_writer(appender).boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(appender).boxed()
            }
        }
    };
    Ok(vec![layer])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_logging_init_is_repeatable() {
        let _ = init_default_logging();
        assert!(init_default_logging().is_ok());
    }

    #[test]
    fn test_file_output_requires_path() {
        let config = LoggingConfig {
            output_type: LogOutput::File,
            ..Default::default()
        };
        let err = build_layers(&config).err().unwrap();
        assert_eq!(err.error_type(), "logging_error");
    }

    #[test]
    fn test_file_output_creates_directory() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        let config = LoggingConfig {
            output_type: LogOutput::File,
            output_path: Some(logs.clone()),
            json: true,
            ..Default::default()
        };
        assert_eq!(build_layers(&config).unwrap().len(), 1);
        assert!(logs.is_dir());
    }
}
