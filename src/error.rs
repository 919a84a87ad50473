//! Error types for the Lark authorization helper

use thiserror::Error;

/// Main error type for the authorization helper
#[derive(Debug, Error)]
pub enum LarkError {
    /// App credentials missing or malformed - raised before any I/O
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Lark answered with a non-zero status code in the JSON payload
    #[error("Lark API error (code {code}): {message}")]
    Provider {
        /// Numeric status code from the response body
        code: i64,
        /// Provider message text
        message: String,
    },

    /// The identity provider redirected back with an error
    #[error("Authorization failed: {error} - {description}")]
    Callback {
        /// The `error` query parameter
        error: String,
        /// The `error_description` query parameter
        description: String,
    },

    /// No callback arrived within the allowed window
    #[error("Timed out waiting for the authorization callback after {0} seconds")]
    Timeout(u64),

    /// The callback listener shut down before producing a result
    #[error("Callback listener closed before an authorization code was received")]
    ListenerClosed,

    /// Token persistence failed
    #[error("Failed to persist tokens to env file: {source}")]
    Persist {
        /// Underlying filesystem error
        #[source]
        source: std::io::Error,
    },

    /// Browser could not be opened
    #[error("Could not open browser: {0}")]
    BrowserOpen(String),

    /// Response body did not match the documented shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for authorization operations
pub type Result<T> = std::result::Result<T, LarkError>;

impl LarkError {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a provider rejection error
    pub fn provider(code: i64, message: impl Into<String>) -> Self {
        Self::Provider {
            code,
            message: message.into(),
        }
    }

    /// Create a callback error from the redirect's `error` parameters
    pub fn callback(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Callback {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Create a persistence error wrapping a filesystem failure
    #[must_use]
    pub fn persist(source: std::io::Error) -> Self {
        Self::Persist { source }
    }

    /// Create an invalid response error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }
}
