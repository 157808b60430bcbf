use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::trust::TrustRecord;

// ============================================================================
// Bill of Materials
// ============================================================================

/// Everything a script pulls in: remote scripts (engine-verified) and
/// external binaries (reported by the narrator, not verified here).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BillOfMaterials {
    pub(crate) remote_scripts: Vec<TrustRecord>,
    pub(crate) external_binaries: Vec<String>,
}

impl BillOfMaterials {
    /// The engine's record list is taken as-is: never reordered, filtered, or
    /// replaced by collaborator output. Binary names are trimmed and
    /// deduplicated in first-seen order.
    pub(crate) fn aggregate(remote_scripts: Vec<TrustRecord>, external_binaries: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let external_binaries = external_binaries
            .into_iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty() && seen.insert(b.clone()))
            .collect();
        Self {
            remote_scripts,
            external_binaries,
        }
    }
}
