//! # Lark OAuth helper
//!
//! User-authorization helper for the Lark (Feishu) open platform:
//! a local callback listener, an authorization-code orchestrator, and
//! dotenv-file token persistence, packaged as a library with a small CLI.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lark_oauth::{LarkAuthClient, LarkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Credentials come from LARK_APP_ID / LARK_APP_SECRET
//!     let client = LarkAuthClient::new(LarkConfig::from_env()?)?;
//!     client.authorize().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## What it does
//!
//! [`LarkAuthClient::authorize`] binds a transient HTTP listener on
//! localhost, opens the system browser to Lark's authorization page, waits
//! (up to five minutes) for the redirect carrying the authorization code,
//! exchanges the code for user tokens via an app-level access token, and
//! writes the result into a dotenv-style env file. Unrelated lines in that
//! file are never touched.
//!
//! Later runs can call [`LarkAuthClient::ensure_valid_token`] to get a
//! usable access token, refreshing through
//! [`LarkAuthClient::refresh_access_token`] when the stored one is past
//! its persisted expiry.
//!
//! ## Logging
//!
//! The library only emits [`tracing`] events; binaries install a
//! subscriber once at startup. Nothing in this crate owns global state.

pub mod auth;
pub mod config;
pub mod error;

pub use auth::callback::{CallbackServer, PendingCode};
pub use auth::client::{LarkAuthClient, RefreshedToken};
pub use auth::store::{EnvFileStore, StoredTokens, TokenSet};
pub use config::LarkConfig;
pub use error::{LarkError, Result};
