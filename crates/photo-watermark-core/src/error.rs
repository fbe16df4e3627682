//! Error types for the export engine

use std::path::PathBuf;

/// Main error type for export operations
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid export request: {message}")]
    InvalidRequest { message: String },

    #[error("Failed to create output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to read image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Font error: {message}")]
    Font { message: String },

    #[error("Template error: {message}")]
    Template { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Logging initialization failed: {message}")]
    LoggingError { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Export of {name} panicked: {message}")]
    Panicked { name: String, message: String },
}

impl ExportError {
    /// Get the error type as a string for categorization
    pub fn error_type(&self) -> &'static str {
        match self {
            ExportError::Io(_) => "io_error",
            ExportError::InvalidRequest { .. } => "invalid_request",
            ExportError::OutputDirectory { .. } => "output_directory",
            ExportError::Decode(_) => "decode_error",
            ExportError::Encode(_) => "encode_error",
            ExportError::Storage { .. } => "storage_error",
            ExportError::Font { .. } => "font_error",
            ExportError::Template { .. } => "template_error",
            ExportError::ConfigError { .. } => "config_error",
            ExportError::LoggingError { .. } => "logging_error",
            ExportError::Serialization(_) => "serialization_error",
            ExportError::Panicked { .. } => "panic",
        }
    }

    /// Whether the error is raised synchronously at submission time
    /// rather than absorbed into job state.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            ExportError::InvalidRequest { .. } | ExportError::OutputDirectory { .. }
        )
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        ExportError::InvalidRequest {
            message: message.into(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ExportError>;
