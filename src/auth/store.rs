//! Token persistence into a dotenv-style env file.
//!
//! The store owns three keys and nothing else: every unrelated line in the
//! file is preserved verbatim, known keys are replaced in place, and
//! missing keys are appended at the end. Updates are a plain
//! read-modify-write without locking - the helper assumes a single
//! operator running one flow at a time.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{LarkError, Result};

/// Env key holding the user access token.
pub const ACCESS_TOKEN_KEY: &str = "LARK_USER_ACCESS_TOKEN";
/// Env key holding the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "LARK_REFRESH_TOKEN";
/// Env key holding the access token expiry as Unix seconds.
pub const EXPIRES_AT_KEY: &str = "LARK_TOKEN_EXPIRES_AT";

/// Safety margin when comparing the stored expiry against the clock.
const EXPIRY_BUFFER_SECS: u64 = 60;

/// User tokens produced by the token-exchange step.
///
/// The in-memory copy is discarded after persistence; callers reload from
/// the store to use the tokens again.
#[derive(Debug, Clone)]
pub struct TokenSet {
    /// User access token
    pub access_token: String,
    /// Refresh token; empty if the provider did not issue one
    pub refresh_token: String,
    /// Validity in seconds as reported by the provider
    pub expires_in: Option<u64>,
}

/// Tokens read back from the env file.
#[derive(Debug, Clone)]
pub struct StoredTokens {
    /// User access token
    pub access_token: String,
    /// Refresh token
    pub refresh_token: String,
    /// Expiry as Unix seconds; absent for tokens saved by older runs
    pub expires_at: Option<u64>,
}

impl StoredTokens {
    /// Whether the access token should be refreshed before use.
    ///
    /// Compares the persisted expiry (with a safety buffer) against the
    /// clock. Tokens persisted without an expiry fall back to a length
    /// check: anything shorter than 20 characters cannot be a real Lark
    /// token. The fallback says nothing about actual freshness - it is a
    /// carried-over limitation, not an expiry mechanism.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(now_secs())
    }

    fn needs_refresh_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => now + EXPIRY_BUFFER_SECS >= expires_at,
            None => self.access_token.len() < 20,
        }
    }
}

/// Dotenv-style file store for the helper's three token keys.
#[derive(Debug, Clone)]
pub struct EnvFileStore {
    path: PathBuf,
}

impl EnvFileStore {
    /// Create a store backed by the given file. The file does not need to
    /// exist yet; the first save creates it.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a full token set: access token, refresh token, and the
    /// computed expiry (`now + expires_in`) when the provider reported one.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the file cannot be read or written.
    pub fn save_token_set(&self, tokens: &TokenSet) -> Result<()> {
        let expires_at = tokens.expires_in.map(|secs| now_secs() + secs);
        let mut entries = vec![
            (ACCESS_TOKEN_KEY, tokens.access_token.clone()),
            (REFRESH_TOKEN_KEY, tokens.refresh_token.clone()),
        ];
        if let Some(expires_at) = expires_at {
            entries.push((EXPIRES_AT_KEY, expires_at.to_string()));
        }
        self.update(&entries)
    }

    /// Persist a refreshed access token (and its expiry) without touching
    /// the refresh-token line.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the file cannot be read or written.
    pub fn save_access_token(&self, access_token: &str, expires_in: Option<u64>) -> Result<()> {
        let mut entries = vec![(ACCESS_TOKEN_KEY, access_token.to_string())];
        if let Some(secs) = expires_in {
            entries.push((EXPIRES_AT_KEY, (now_secs() + secs).to_string()));
        }
        self.update(&entries)
    }

    /// Load the stored tokens, if both token keys are present.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the file exists but cannot be read.
    pub fn load(&self) -> Result<Option<StoredTokens>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LarkError::persist(e)),
        };

        let access_token = env_value(&content, ACCESS_TOKEN_KEY);
        let refresh_token = env_value(&content, REFRESH_TOKEN_KEY);
        let expires_at = env_value(&content, EXPIRES_AT_KEY).and_then(|v| v.parse().ok());

        Ok(match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token)) => Some(StoredTokens {
                access_token,
                refresh_token,
                expires_at,
            }),
            _ => None,
        })
    }

    fn update(&self, entries: &[(&str, String)]) -> Result<()> {
        let mut content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(LarkError::persist(e)),
        };
        for (key, value) in entries {
            content = upsert_line(&content, key, value);
        }
        std::fs::write(&self.path, content).map_err(LarkError::persist)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn line_key(line: &str) -> Option<&str> {
    line.split_once('=').map(|(key, _)| key.trim())
}

fn env_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}

/// Replace the first `KEY=` line with `KEY=value`, dropping any stale
/// duplicates, or append the line if the key is absent. All other lines
/// pass through untouched.
fn upsert_line(content: &str, key: &str, value: &str) -> String {
    let entry = format!("{key}={value}");
    let mut out: Vec<String> = Vec::new();
    let mut replaced = false;

    for line in content.lines() {
        if line_key(line) == Some(key) {
            if !replaced {
                out.push(entry.clone());
                replaced = true;
            }
            continue;
        }
        out.push(line.to_string());
    }
    if !replaced {
        out.push(entry);
    }

    let mut result = out.join("\n");
    result.push('\n');
    result
}
