//! Resume token encoding.
//!
//! A token is URL-safe base64 (no padding) of a JSON object with a numeric
//! `version` and the poll state. Only [`TOKEN_VERSION`] is readable; any other
//! version is rejected before the state is looked at.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use url::Url;

use super::PollerStatus;
use super::operation::{FinalStateVia, OperationKind};
use crate::error::PipelineError;

pub const TOKEN_VERSION: u32 = 1;

/// Everything needed to continue polling, and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
    pub kind: OperationKind,
    pub method: String,
    pub original_url: Url,
    pub polling_url: Url,
    pub status: PollerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_location: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state_via: Option<FinalStateVia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_status_code: Option<u16>,
    /// Set once a status response could not be interpreted; polling is over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
}

#[derive(Serialize)]
struct EncodeEnvelope<'a> {
    version: u32,
    state: &'a PollState,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<u64>,
}

#[derive(Deserialize)]
struct DecodeEnvelope {
    state: PollState,
}

/// # Errors
/// Returns `PipelineError::Json` if the state cannot be serialized.
pub fn encode(state: &PollState) -> Result<String, PipelineError> {
    let json = serde_json::to_vec(&EncodeEnvelope {
        version: TOKEN_VERSION,
        state,
    })?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// # Errors
/// Returns `UnsupportedTokenVersion` for a well-formed token of another
/// version and `InvalidResumeToken` for anything unreadable.
pub fn decode(token: &str) -> Result<PollState, PipelineError> {
    let json = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| PipelineError::InvalidResumeToken(format!("not base64url: {e}")))?;

    let probe: VersionProbe = serde_json::from_slice(&json)
        .map_err(|e| PipelineError::InvalidResumeToken(format!("not a token object: {e}")))?;
    let version = probe
        .version
        .ok_or_else(|| PipelineError::InvalidResumeToken("missing version".to_owned()))?;
    if version != u64::from(TOKEN_VERSION) {
        return Err(PipelineError::UnsupportedTokenVersion(
            u32::try_from(version).unwrap_or(u32::MAX),
        ));
    }

    let envelope: DecodeEnvelope = serde_json::from_slice(&json)
        .map_err(|e| PipelineError::InvalidResumeToken(format!("malformed state: {e}")))?;
    Ok(envelope.state)
}
