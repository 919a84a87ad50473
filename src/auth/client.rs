//! The authorization orchestrator.
//!
//! Drives the full authorization-code flow end to end: start the callback
//! listener, build the authorization URL, open the system browser, await
//! the redirect, exchange the code for user tokens through an app-level
//! access token, and persist the result into the env-file store.
//!
//! The flow is strictly linear and single-attempt. Any failure at any step
//! aborts the whole flow; there is no retry - the caller restarts the
//! entire sequence to try again.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;

use crate::auth::callback::CallbackServer;
use crate::auth::store::{EnvFileStore, TokenSet};
use crate::config::LarkConfig;
use crate::error::{LarkError, Result};

const AUTHORIZE_PATH: &str = "/open-apis/authen/v1/authorize";
const APP_TOKEN_PATH: &str = "/open-apis/auth/v3/app_access_token/internal";
const USER_TOKEN_PATH: &str = "/open-apis/authen/v1/oidc/access_token";
const REFRESH_TOKEN_PATH: &str = "/open-apis/authen/v1/oidc/refresh_access_token";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from the app access token endpoint
#[derive(Debug, Deserialize)]
struct AppAccessTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    app_access_token: Option<String>,
}

/// Response from the user token and refresh endpoints
#[derive(Debug, Deserialize)]
struct UserTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<UserTokenData>,
}

#[derive(Debug, Deserialize)]
struct UserTokenData {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// A refreshed access token, returned by
/// [`LarkAuthClient::refresh_access_token`]. The caller decides whether and
/// when to persist it.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    /// The new user access token
    pub access_token: String,
    /// Validity in seconds, when the provider reported one
    pub expires_in: Option<u64>,
}

/// Orchestrates the Lark user-authorization flow.
#[derive(Debug)]
pub struct LarkAuthClient {
    config: LarkConfig,
    store: EnvFileStore,
    http: reqwest::Client,
}

impl LarkAuthClient {
    /// Create a client from the given configuration.
    ///
    /// # Errors
    ///
    /// Fails immediately, before any network call, if the app id or secret
    /// is empty.
    pub fn new(config: LarkConfig) -> Result<Self> {
        if config.app_id.trim().is_empty() {
            return Err(LarkError::invalid_config("app id must not be empty"));
        }
        if config.app_secret.trim().is_empty() {
            return Err(LarkError::invalid_config("app secret must not be empty"));
        }
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let store = EnvFileStore::new(config.env_file.clone());
        Ok(Self {
            config,
            store,
            http,
        })
    }

    /// The env-file store this client persists into.
    #[must_use]
    pub fn store(&self) -> &EnvFileStore {
        &self.store
    }

    /// Run the full authorization flow and leave valid user tokens in the
    /// env file.
    ///
    /// Steps, strictly ordered: start the callback listener, build the
    /// authorization URL, open the browser, await the redirect, exchange
    /// the code for user tokens, persist them.
    ///
    /// # Errors
    ///
    /// Propagates the first failure from any step: bind errors, the
    /// provider's callback error, the 5-minute callback timeout, provider
    /// rejections (`code != 0`), and persistence failures.
    pub async fn authorize(&self) -> Result<TokenSet> {
        let mut server = CallbackServer::new();
        let pending = server.start(self.config.callback_port).await?;
        let port = server
            .local_addr()
            .map_or(self.config.callback_port, |addr| addr.port());
        let redirect_uri = format!("http://localhost:{port}/callback");

        let state = generate_state();
        let auth_url = self.build_authorize_url(&redirect_uri, &state);
        tracing::info!("authorization URL: {auth_url}");

        if self.config.open_browser {
            match open_browser(&auth_url) {
                Ok(()) => tracing::info!("opened the system browser, waiting for authorization"),
                Err(e) => {
                    tracing::warn!("could not open the browser, open the URL manually: {e}");
                }
            }
        } else {
            tracing::info!("browser launch disabled, open the URL manually");
        }

        let code = match pending.wait().await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("authorization callback failed: {e}");
                server.stop().await;
                return Err(e);
            }
        };

        tracing::info!("exchanging authorization code for user tokens");
        let exchanged = self.exchange_code(&code).await;
        server.stop().await;
        let tokens = match exchanged {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("token exchange failed: {e}");
                return Err(e);
            }
        };

        self.store.save_token_set(&tokens)?;
        tracing::info!(path = %self.store.path().display(), "user tokens saved");
        Ok(tokens)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// Independent of the main flow and reusable on its own. Does not
    /// persist anything; pair with
    /// [`EnvFileStore::save_access_token`] to update the stored token.
    ///
    /// # Errors
    ///
    /// Propagates network failures and provider rejections (`code != 0`).
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let app_token = self.app_access_token().await?;
        let url = format!("{}{REFRESH_TOKEN_PATH}", self.config.base_url);
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });

        let response: UserTokenResponse = self
            .http
            .post(&url)
            .bearer_auth(&app_token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if response.code != 0 {
            tracing::error!("token refresh rejected (code {}): {}", response.code, response.msg);
            return Err(LarkError::provider(response.code, response.msg));
        }
        let data = response
            .data
            .ok_or_else(|| LarkError::invalid_response("refresh response carried no data"))?;

        tracing::info!("access token refreshed");
        Ok(RefreshedToken {
            access_token: data.access_token,
            expires_in: data.expires_in,
        })
    }

    /// Return a usable access token, refreshing and re-persisting it first
    /// when the stored one looks stale.
    ///
    /// # Errors
    ///
    /// Fails if no tokens are stored yet, or if the refresh round-trip or
    /// persistence fails.
    pub async fn ensure_valid_token(&self) -> Result<String> {
        let Some(stored) = self.store.load()? else {
            return Err(LarkError::invalid_config(
                "no stored tokens; run the authorization flow first",
            ));
        };

        if !stored.needs_refresh() {
            return Ok(stored.access_token);
        }

        if stored.refresh_token.is_empty() {
            return Err(LarkError::invalid_config(
                "stored access token is stale and no refresh token is available",
            ));
        }

        tracing::info!("stored access token looks stale, refreshing");
        let refreshed = self.refresh_access_token(&stored.refresh_token).await?;
        self.store
            .save_access_token(&refreshed.access_token, refreshed.expires_in)?;
        Ok(refreshed.access_token)
    }

    /// Obtain an app-level access token via the server-to-server exchange.
    ///
    /// Used only as the bearer credential for the user-token calls; never
    /// persisted.
    async fn app_access_token(&self) -> Result<String> {
        let url = format!("{}{APP_TOKEN_PATH}", self.config.base_url);
        let body = serde_json::json!({
            "app_id": self.config.app_id,
            "app_secret": self.config.app_secret,
        });

        let response: AppAccessTokenResponse =
            self.http.post(&url).json(&body).send().await?.json().await?;

        if response.code != 0 {
            tracing::error!(
                "app access token rejected (code {}): {}",
                response.code,
                response.msg
            );
            return Err(LarkError::provider(response.code, response.msg));
        }
        response
            .app_access_token
            .ok_or_else(|| LarkError::invalid_response("response carried no app_access_token"))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        let app_token = self.app_access_token().await?;
        let url = format!("{}{USER_TOKEN_PATH}", self.config.base_url);
        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
        });

        let response: UserTokenResponse = self
            .http
            .post(&url)
            .bearer_auth(&app_token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if response.code != 0 {
            return Err(LarkError::provider(response.code, response.msg));
        }
        let data = response
            .data
            .ok_or_else(|| LarkError::invalid_response("token response carried no data"))?;

        Ok(TokenSet {
            access_token: data.access_token,
            refresh_token: data.refresh_token.unwrap_or_default(),
            expires_in: data.expires_in,
        })
    }

    fn build_authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        let params = [
            ("app_id", self.config.app_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", self.config.scopes.as_str()),
            ("state", state),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}{AUTHORIZE_PATH}?{query}", self.config.base_url)
    }
}

/// Generate the anti-forgery `state` value: 16 CSPRNG bytes, base64url.
fn generate_state() -> String {
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Open a URL in the system's default browser. Fire-and-forget: only the
/// OS-level spawn is checked, not whether a page actually loaded.
fn open_browser(url: &str) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open")
            .arg(url)
            .spawn()
            .map_err(|e| LarkError::BrowserOpen(e.to_string()))?;
    }

    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open")
            .arg(url)
            .spawn()
            .map_err(|e| LarkError::BrowserOpen(e.to_string()))?;
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()
            .map_err(|e| LarkError::BrowserOpen(e.to_string()))?;
    }

    Ok(())
}

/// Percent-encode a string for URL query parameters.
/// Preserves unreserved characters per RFC 3986.
fn percent_encode(s: &str) -> String {
    use std::fmt::Write;
    let mut result = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                let _ = write!(result, "%{byte:02X}");
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> LarkAuthClient {
        LarkAuthClient::new(LarkConfig::new("cli_test_app", "s3cret")).unwrap()
    }

    #[test]
    fn empty_app_id_fails_before_any_io() {
        let err = LarkAuthClient::new(LarkConfig::new("", "s3cret")).unwrap_err();
        assert!(matches!(err, LarkError::InvalidConfig(_)));
    }

    #[test]
    fn empty_app_secret_fails_before_any_io() {
        let err = LarkAuthClient::new(LarkConfig::new("cli_test_app", "   ")).unwrap_err();
        assert!(matches!(err, LarkError::InvalidConfig(_)));
    }

    #[test]
    fn authorize_url_carries_all_four_parameters() {
        let client = test_client();
        let url = client.build_authorize_url("http://localhost:8080/callback", "st4te");

        assert!(url.starts_with("https://open.feishu.cn/open-apis/authen/v1/authorize?"));
        assert!(url.contains("app_id=cli_test_app"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcallback"));
        assert!(url.contains("scope=bitable%3Aapp%20offline_access"));
        assert!(url.contains("state=st4te"));
    }

    #[test]
    fn state_values_are_unique_and_urlsafe() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn percent_encoding_preserves_unreserved_characters() {
        assert_eq!(percent_encode("hello"), "hello");
        assert_eq!(percent_encode("hello world"), "hello%20world");
        assert_eq!(percent_encode("a+b"), "a%2Bb");
        assert_eq!(
            percent_encode("http://localhost:8080/callback"),
            "http%3A%2F%2Flocalhost%3A8080%2Fcallback"
        );
    }
}
