//! Configuration for the authorization helper.
//!
//! Credentials come from the `LARK_APP_ID` / `LARK_APP_SECRET` environment
//! variables; everything else has fixed defaults that match the hosted Lark
//! endpoints. The base URL and callback port are overridable so tests can
//! point the client at local listeners.

use std::path::PathBuf;

use crate::error::{LarkError, Result};

/// Hosted Lark open platform base URL.
pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn";

/// Local port the callback listener binds by default.
pub const DEFAULT_CALLBACK_PORT: u16 = 8080;

/// Scopes requested during authorization. `offline_access` is required for
/// Lark to issue a refresh token alongside the access token.
pub const DEFAULT_SCOPES: &str = "bitable:app offline_access";

const DEFAULT_ENV_FILE: &str = ".env";

/// Settings for one authorization helper instance.
#[derive(Debug, Clone)]
pub struct LarkConfig {
    /// Lark app id (`cli_...`)
    pub app_id: String,
    /// Lark app secret
    pub app_secret: String,
    /// Provider base URL, without a trailing slash
    pub base_url: String,
    /// Local port for the OAuth callback; 0 binds an ephemeral port
    pub callback_port: u16,
    /// Env file that receives the persisted tokens
    pub env_file: PathBuf,
    /// Space-separated scopes to request
    pub scopes: String,
    /// Whether to launch the system browser automatically
    pub open_browser: bool,
}

impl LarkConfig {
    /// Create a configuration with the given credentials and default
    /// endpoints, port, scopes, and env-file path.
    #[must_use]
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            callback_port: DEFAULT_CALLBACK_PORT,
            env_file: PathBuf::from(DEFAULT_ENV_FILE),
            scopes: DEFAULT_SCOPES.to_string(),
            open_browser: true,
        }
    }

    /// Load credentials from `LARK_APP_ID` / `LARK_APP_SECRET`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either variable is unset, so the
    /// failure surfaces before any listener or network call is attempted.
    pub fn from_env() -> Result<Self> {
        let app_id = std::env::var("LARK_APP_ID")
            .map_err(|_| LarkError::invalid_config("LARK_APP_ID is not set"))?;
        let app_secret = std::env::var("LARK_APP_SECRET")
            .map_err(|_| LarkError::invalid_config("LARK_APP_SECRET is not set"))?;
        Ok(Self::new(app_id, app_secret))
    }
}
