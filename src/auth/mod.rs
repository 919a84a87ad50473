//! Lark user-authorization flow
//!
//! Implements the OAuth2 authorization-code flow against the Lark
//! (Feishu) open platform. The flow works as follows:
//!
//! 1. Start a transient local HTTP listener for the redirect callback
//! 2. Open the browser to the authorization URL (with an anti-forgery
//!    `state` value)
//! 3. The user approves and Lark redirects back with an authorization code
//! 4. Obtain an app-level access token via the server-to-server exchange
//! 5. Exchange the code (authorized by the app-level token) for user tokens
//! 6. Persist the tokens into a local env file
//!
//! # Example
//!
//! ```no_run
//! use lark_oauth::{LarkAuthClient, LarkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LarkConfig::from_env()?;
//!     let client = LarkAuthClient::new(config)?;
//!
//!     // Runs the browser flow and saves the tokens to .env
//!     let tokens = client.authorize().await?;
//!     println!("access token valid for {:?} seconds", tokens.expires_in);
//!     Ok(())
//! }
//! ```
//!
//! # Coordination
//!
//! The listener and the orchestrator share exactly one synchronization
//! point: a one-shot channel whose sender lives in a single-slot mutex.
//! Whichever terminal event happens first - code received, provider
//! error, or timeout - takes the sender and resolves the pending future;
//! everything after that is a no-op. There is no retry anywhere in the
//! flow; a failed attempt is restarted from the top.

pub mod callback;
pub mod client;
pub mod store;

pub use callback::{CALLBACK_TIMEOUT, CallbackServer, PendingCode};
pub use client::{LarkAuthClient, RefreshedToken};
pub use store::{EnvFileStore, StoredTokens, TokenSet};
