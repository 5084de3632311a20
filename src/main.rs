use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use schwab_broker::accounts::{account_numbers, positions_by_account};
use schwab_broker::config::{load_config, BrokerConfig};
use schwab_broker::oauth::extract_authorization_code;
use schwab_broker::AuthContext;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "schwab-broker", version, about = "Brokerage OAuth token lifecycle and API access")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, env = "SCHWAB_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the URL that starts the authorization-code flow
    AuthUrl,
    /// Exchange the code from the redirect URL for tokens
    Authorize {
        /// Full URL the browser was redirected to; read from stdin when omitted
        #[arg(long)]
        returned_url: Option<String>,
    },
    /// Show the stored token state without refreshing
    Status,
    /// Make sure a usable token exists, refreshing if needed
    Ensure,
    /// List linked accounts
    Accounts {
        /// Include flattened positions per account
        #[arg(long)]
        positions: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schwab_broker=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path).context("Failed to load configuration")?,
        None => BrokerConfig::default(),
    }
    .with_env_overrides()
    .context("Invalid environment override")?;

    let ctx = AuthContext::initialize(config)
        .await
        .context("Failed to initialize auth context")?;
    info!(backend = %ctx.backend(), "Auth context ready");

    match cli.command {
        Command::AuthUrl => {
            println!("{}", ctx.authorization_url());
        }
        Command::Authorize { returned_url } => {
            let returned_url = match returned_url {
                Some(url) => url,
                None => {
                    println!("Open this URL, log in and approve access:\n");
                    println!("{}\n", ctx.authorization_url());
                    println!("Paste the full URL you were redirected to:");
                    read_line().await?
                }
            };

            let code = extract_authorization_code(&returned_url)?;
            let tokens = ctx
                .exchanger()
                .exchange_code(&code)
                .await
                .context("Authorization code exchange failed")?;
            println!("Authorized; access token valid until {}", tokens.expires_at);
        }
        Command::Status => {
            let manager = ctx.token_manager();
            let state = manager.state().await?;
            match manager.stored_tokens().await? {
                Some(tokens) => println!("{} (expires {})", state, tokens.expires_at),
                None => println!("{}", state),
            }
        }
        Command::Ensure => {
            let manager = ctx.token_manager();
            match manager.ensure_valid_token().await? {
                Some(tokens) => println!("Token valid until {}", tokens.expires_at),
                None => {
                    warn!("Re-authentication required");
                    eprintln!("Re-authentication required: run `schwab-broker authorize`");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::Accounts { positions } => {
            let client = ctx.api_client(Arc::new(ctx.token_manager()));
            if positions {
                let by_account = positions_by_account(&client).await?;
                println!("{}", serde_json::to_string_pretty(&by_account)?);
            } else {
                for account in account_numbers(&client).await? {
                    println!("{}\t{}", account.account_number, account.hash_value);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn read_line() -> Result<String> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}
