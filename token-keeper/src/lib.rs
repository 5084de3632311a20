//! Background token keeper.
//!
//! Keeps the stored brokerage token fresh by running the token manager on a
//! fixed interval, so interactive tools find a usable token without waiting
//! on a refresh.
//!
//! ```text
//!   interval tick
//!        ↓
//! ┌─────────────────────────────┐
//! │  TokenManager               │
//! │  - ensure_valid_token()     │──→ refresh grant (single-flight)
//! └─────────────────────────────┘
//!        ↓
//!   KeeperStatus (last check, state, errors)
//! ```
//!
//! The keeper never starts the authorization-code flow. When a token cannot
//! be produced it records that re-authentication is required and keeps
//! checking; a later manual `authorize` is picked up on the next tick.

use chrono::{DateTime, Utc};
use schwab_broker::{TokenManager, TokenState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Default check interval in seconds.
pub const DEFAULT_INTERVAL_SECONDS: u64 = 60;

/// Status information for the keeper.
#[derive(Clone, Debug, Default)]
pub struct KeeperStatus {
    /// Last completed check, successful or not
    pub last_check: Option<DateTime<Utc>>,
    /// Token state observed after the last check
    pub last_state: Option<TokenState>,
    /// Last error message (if any)
    pub last_error: Option<String>,
    /// Total number of checks
    pub check_count: u64,
    /// Checks that did not end with a usable token
    pub error_count: u64,
}

/// Periodic token checker.
pub struct TokenKeeper {
    tokens: Arc<TokenManager>,
    period: Duration,
    status: Arc<Mutex<KeeperStatus>>,
}

impl TokenKeeper {
    pub fn new(tokens: Arc<TokenManager>, period: Duration) -> Self {
        Self {
            tokens,
            period,
            status: Arc::new(Mutex::new(KeeperStatus::default())),
        }
    }

    /// Returns a clone of the status tracker for external monitoring.
    pub fn status(&self) -> Arc<Mutex<KeeperStatus>> {
        Arc::clone(&self.status)
    }

    /// Run one check and record its outcome.
    pub async fn check_once(&self) {
        let outcome = match self.tokens.ensure_valid_token().await {
            Ok(Some(tokens)) => {
                debug!(expires_at = %tokens.expires_at, "Token usable");
                Ok(TokenState::Valid)
            }
            Ok(None) => {
                let state = self.tokens.state().await.unwrap_or(TokenState::Missing);
                warn!(state = %state, "Re-authentication required");
                Err((Some(state), "re-authentication required".to_string()))
            }
            Err(e) => {
                error!(error = %e, "Token check failed");
                Err((None, e.to_string()))
            }
        };

        // Update status only after all awaits on the token manager
        let mut status = self.status.lock().await;
        status.last_check = Some(Utc::now());
        status.check_count += 1;
        match outcome {
            Ok(state) => {
                status.last_state = Some(state);
                status.last_error = None;
            }
            Err((state, message)) => {
                if state.is_some() {
                    status.last_state = state;
                }
                status.last_error = Some(message);
                status.error_count += 1;
            }
        }
    }

    /// Starts the check loop (non-blocking).
    ///
    /// The first check runs immediately. Abort the returned handle to stop.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.period.as_secs(), "Starting token keeper");

            let mut ticker = interval(self.period);
            loop {
                ticker.tick().await;
                self.check_once().await;
            }
        })
    }
}

/// Interval from `TOKEN_KEEPER_INTERVAL_SECONDS`, falling back to the default
/// when unset, unparseable or zero.
pub fn interval_from_env() -> Duration {
    let seconds = std::env::var("TOKEN_KEEPER_INTERVAL_SECONDS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&s| s > 0)
        .unwrap_or(DEFAULT_INTERVAL_SECONDS);
    Duration::from_secs(seconds)
}
