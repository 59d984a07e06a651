//! Org sessions from the Salesforce CLI.
//!
//! Authentication is owned by `sf`; we only read the access token and
//! instance URL it already holds for an alias.

use serde::Deserialize;
use tokio::process::Command;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgSession {
    pub alias: String,
    pub instance_url: String,
    pub access_token: String,
    pub api_version: String,
}

impl OrgSession {
    /// `https://host/services/data/vNN.N`
    pub fn data_url(&self) -> String {
        format!(
            "{}/services/data/v{}",
            self.instance_url.trim_end_matches('/'),
            self.api_version
        )
    }
}

#[derive(Debug, Deserialize)]
struct DisplayEnvelope {
    status: i32,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<DisplayResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplayResult {
    access_token: Option<String>,
    instance_url: Option<String>,
}

/// Look up a live session with `sf org display --target-org <alias> --json`.
pub async fn session_from_cli(alias: &str, api_version: &str) -> Result<OrgSession, StoreError> {
    log::info!("Fetching session for org alias '{}'", alias);
    let output = Command::new("sf")
        .args(["org", "display", "--target-org", alias, "--json"])
        .output()
        .await
        .map_err(|e| StoreError::Session {
            alias: alias.to_string(),
            message: format!("could not run `sf` ({e}); is the Salesforce CLI installed?"),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_display_output(alias, api_version, &stdout)
}

pub(crate) fn parse_display_output(
    alias: &str,
    api_version: &str,
    stdout: &str,
) -> Result<OrgSession, StoreError> {
    let failure = |message: String| StoreError::Session {
        alias: alias.to_string(),
        message,
    };

    let envelope: DisplayEnvelope = serde_json::from_str(stdout.trim())
        .map_err(|e| failure(format!("unreadable CLI output: {e}")))?;
    if envelope.status != 0 {
        return Err(failure(
            envelope
                .message
                .unwrap_or_else(|| format!("CLI exited with status {}", envelope.status)),
        ));
    }
    let result = envelope
        .result
        .ok_or_else(|| failure("CLI output has no result".to_string()))?;

    match (result.instance_url, result.access_token) {
        (Some(instance_url), Some(access_token)) if !access_token.is_empty() => Ok(OrgSession {
            alias: alias.to_string(),
            instance_url,
            access_token,
            api_version: api_version.to_string(),
        }),
        _ => Err(failure(
            "no access token; run `sf org login web` for this alias".to_string(),
        )),
    }
}
