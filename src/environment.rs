//! Execution-environment detection.
//!
//! Decides once, at startup, whether the process runs inside cloud compute
//! (tokens and credentials live in the cloud secret store) or locally (tokens
//! live in a JSON file next to the process).

use crate::config::ProbeConfig;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

const TOKEN_PATH: &str = "/latest/api/token";
const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

/// Where the token set is persisted. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    CloudSecret,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Local => f.write_str("local"),
            StorageBackend::CloudSecret => f.write_str("cloud_secret"),
        }
    }
}

/// Configured backend choice; `Auto` defers to the metadata probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    #[default]
    Auto,
    Local,
    CloudSecret,
}

impl FromStr for BackendPreference {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "local" => Ok(BackendPreference::Local),
            "cloud_secret" | "cloud" => Ok(BackendPreference::CloudSecret),
            _ => Err(()),
        }
    }
}

/// Resolve the backend for this process, probing only when the preference is `Auto`.
pub async fn select_backend(preference: BackendPreference, probe: &ProbeConfig) -> StorageBackend {
    match preference {
        BackendPreference::Local => StorageBackend::Local,
        BackendPreference::CloudSecret => StorageBackend::CloudSecret,
        BackendPreference::Auto => {
            if running_in_cloud(probe).await {
                StorageBackend::CloudSecret
            } else {
                StorageBackend::Local
            }
        }
    }
}

/// Returns true if the instance metadata service answers.
///
/// Tries the session-token protocol first and falls back to a plain GET.
/// Any error (including the short timeout) means "not in the cloud".
pub async fn running_in_cloud(probe: &ProbeConfig) -> bool {
    let client = match reqwest::Client::builder().timeout(probe.timeout()).build() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "Failed to build metadata probe client");
            return false;
        }
    };
    let base = probe.metadata_url.trim_end_matches('/');

    let session_token = match client
        .put(format!("{}{}", base, TOKEN_PATH))
        .header(TOKEN_TTL_HEADER, "21600")
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
        Ok(resp) => {
            debug!(status = %resp.status(), "Metadata token request refused");
            None
        }
        Err(e) => {
            debug!(error = %e, "Metadata token request failed");
            None
        }
    };

    let mut request = client.get(format!("{}{}", base, INSTANCE_ID_PATH));
    if let Some(token) = &session_token {
        request = request.header(TOKEN_HEADER, token);
    }

    match request.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            debug!(error = %e, "Instance metadata unreachable, assuming local environment");
            false
        }
    }
}
