//! Error taxonomy for the celery bridge
//!
//! Per-request failures are classified by [`ErrorKind`], which decides the HTTP
//! status returned to the caller. Process-level failures surface as
//! [`BridgeError`] and end the process.

use crate::config::ConfigError;
use crate::transport::session::SessionError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Classification of a failed submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The task cannot be represented as a celery message
    Encoding,
    /// No live session, or the broker refused to open a channel
    Channel,
    /// The broker rejected or did not acknowledge the publish
    Publish,
}

impl ErrorKind {
    /// HTTP status code reported for this kind of failure
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Encoding => 400,
            ErrorKind::Channel | ErrorKind::Publish => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Encoding => "encoding",
            ErrorKind::Channel => "channel",
            ErrorKind::Publish => "publish",
        }
    }
}

/// Fatal errors that stop the bridge process
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("HTTP server error: {message}")]
    Http { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn http<S: Into<String>>(message: S) -> Self {
        Self::Http {
            message: message.into(),
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

static URI_CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(amqps?)://[^\s/@:]+:[^\s/@]+@").expect("static regex is valid")
});

static SECRET_PAIRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static regex is valid")
});

const MAX_ERROR_LEN: usize = 500;

/// Strip credentials from error text before it leaves the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = URI_CREDENTIALS
        .replace_all(message, "${1}://***:***@")
        .to_string();

    sanitized = SECRET_PAIRS.replace_all(&sanitized, "${1}=***").to_string();

    if sanitized.len() > MAX_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
