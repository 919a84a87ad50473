//! Lark user-authorization helper CLI.
//!
//! Subcommands:
//! - `authorize` runs the browser flow and saves the tokens
//! - `refresh` exchanges the stored refresh token for a new access token
//! - `status` reports on the stored tokens without touching the network
//!
//! Credentials come from the `LARK_APP_ID` / `LARK_APP_SECRET` environment
//! variables.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lark_oauth::config::DEFAULT_CALLBACK_PORT;
use lark_oauth::{EnvFileStore, LarkAuthClient, LarkConfig, LarkError};

/// Lark (Feishu) user-authorization helper
#[derive(Parser, Debug)]
#[command(name = "lark-oauth", version)]
struct Cli {
    /// Env file that receives the tokens
    #[arg(long, default_value = ".env", global = true)]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the browser authorization flow and save the tokens
    Authorize {
        /// Local port for the OAuth callback
        #[arg(long, default_value_t = DEFAULT_CALLBACK_PORT)]
        port: u16,

        /// Print the authorization URL instead of opening the browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Refresh the stored access token and save it
    Refresh,

    /// Show whether stored tokens exist and are still fresh
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "lark_oauth=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> lark_oauth::Result<()> {
    match cli.command {
        Command::Authorize { port, no_browser } => {
            let mut config = LarkConfig::from_env()?;
            config.env_file = cli.env_file;
            config.callback_port = port;
            config.open_browser = !no_browser;

            let client = LarkAuthClient::new(config)?;
            let tokens = client.authorize().await?;
            println!(
                "Authorization complete. Tokens saved to {}",
                client.store().path().display()
            );
            if tokens.refresh_token.is_empty() {
                println!("Note: the provider did not issue a refresh token.");
            }
        }

        Command::Refresh => {
            let store = EnvFileStore::new(cli.env_file.clone());
            let Some(stored) = store.load()? else {
                return Err(LarkError::invalid_config(
                    "no stored tokens; run `lark-oauth authorize` first",
                ));
            };
            if stored.refresh_token.is_empty() {
                return Err(LarkError::invalid_config(
                    "no refresh token stored; run `lark-oauth authorize` again",
                ));
            }

            let mut config = LarkConfig::from_env()?;
            config.env_file = cli.env_file;
            let client = LarkAuthClient::new(config)?;

            let refreshed = client.refresh_access_token(&stored.refresh_token).await?;
            client
                .store()
                .save_access_token(&refreshed.access_token, refreshed.expires_in)?;
            println!("Access token refreshed.");
        }

        Command::Status => {
            let store = EnvFileStore::new(cli.env_file);
            match store.load()? {
                None => println!("No tokens stored."),
                Some(stored) => {
                    if stored.needs_refresh() {
                        println!("Tokens stored, access token is stale; run `lark-oauth refresh`.");
                    } else {
                        println!("Tokens stored, access token is fresh.");
                    }
                }
            }
        }
    }
    Ok(())
}
