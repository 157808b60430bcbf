use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fetch::FetchOutcome;
use crate::registry::KnownScriptRegistry;

// ============================================================================
// Trust Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TrustStatus {
    Verified,
    Unverified,
    Error,
}

impl TrustStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            TrustStatus::Verified => "verified",
            TrustStatus::Unverified => "unverified",
            TrustStatus::Error => "error",
        }
    }
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one fetched reference against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TrustRecord {
    pub(crate) url: String,
    pub(crate) status: TrustStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) detail: Option<String>,
}

/// Exact digest comparison; no partial matches.
pub(crate) fn classify(outcome: &FetchOutcome, registry: &KnownScriptRegistry) -> TrustRecord {
    let (status, detail) = match &outcome.result {
        Err(e) => (TrustStatus::Error, Some(e.to_string())),
        Ok(fetched) => match registry.expected_digest(&outcome.url) {
            None => (
                TrustStatus::Unverified,
                Some("no registry entry for this URL".to_string()),
            ),
            Some(expected) if expected == fetched.digest.to_ascii_lowercase() => {
                (TrustStatus::Verified, None)
            }
            Some(expected) => (
                TrustStatus::Unverified,
                Some(format!(
                    "sha256 mismatch: expected {}, got {}",
                    expected, fetched.digest
                )),
            ),
        },
    };

    tracing::debug!(url = %outcome.url, %status, "classified");
    TrustRecord {
        url: outcome.url.clone(),
        status,
        detail,
    }
}
