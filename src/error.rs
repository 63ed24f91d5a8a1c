//! Top-level error types for the BMS ingestor
//!
//! Each boundary owns its own error enum (`ConfigError`, `TlsSetupError`,
//! `TransportError`, `StorageError`); `IngestError` collects the ones that
//! can abort startup or the service lifecycle.

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::transport::mqtt::tls::TlsSetupError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for ingestor operations
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Initialization failed: {message}")]
    Initialization { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl IngestError {
    /// Whether this error must abort the process before the main loop
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            IngestError::Config(_)
                | IngestError::Tls(_)
                | IngestError::Storage(_)
                | IngestError::Initialization { .. }
        )
    }

    /// Error text safe for logs and terminal output
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    pub fn initialization<S: Into<String>>(message: S) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret|apikey)[=:]\s*\S+").ok());

static BEARER_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Sanitize error messages to prevent credentials leaking into logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").into_owned();
    }
    if let Some(re) = BEARER_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "Bearer ***").into_owned();
    }
    if let Some(re) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").into_owned();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for ingestor operations
pub type IngestResult<T> = Result<T, IngestError>;
