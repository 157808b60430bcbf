use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::LazyLock;

use crate::analysis::RiskScore;
use crate::static_analysis::{StaticReport, StaticSeverity};
use crate::trust::TrustRecord;

// ============================================================================
// Narrator Interface
// ============================================================================

/// What one analyzed child looked like, as seen by its parent's narrator.
#[derive(Debug, Clone)]
pub(crate) struct ChildSummary {
    pub(crate) url: String,
    pub(crate) risk_score: RiskScore,
    pub(crate) truncated: bool,
}

/// Verification results for one document's direct references.
#[derive(Debug, Clone, Default)]
pub(crate) struct VerificationContext {
    pub(crate) records: Vec<TrustRecord>,
    pub(crate) children: Vec<ChildSummary>,
}

impl VerificationContext {
    pub(crate) fn to_prompt_text(&self) -> String {
        if self.records.is_empty() {
            return "No remote scripts are fetched and executed by this script.".to_string();
        }
        let mut out = String::new();
        for record in &self.records {
            let _ = write!(out, "- {} [{}]", record.url, record.status);
            if let Some(detail) = &record.detail {
                let _ = write!(out, " {}", detail);
            }
            if let Some(child) = self.children.iter().find(|c| c.url == record.url) {
                if child.truncated {
                    let _ = write!(out, "; not analyzed (recursion depth limit)");
                } else {
                    let _ = write!(out, "; analyzed risk {}", child.risk_score);
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Input handed to a narrator for one document.
#[derive(Debug)]
pub(crate) struct NarrativeRequest<'a> {
    pub(crate) source: &'a str,
    pub(crate) depth: usize,
    pub(crate) script: &'a str,
    pub(crate) static_report: &'a StaticReport,
    pub(crate) verification: &'a VerificationContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Narrative {
    pub(crate) risk_score: RiskScore,
    pub(crate) report: String,
    pub(crate) external_binaries: Vec<String>,
}

/// Turns a script plus its verification context into a score and narrative.
/// An `Err` means no well-formed report could be produced.
pub(crate) trait Narrator: Send + Sync {
    fn narrate(&self, request: &NarrativeRequest<'_>) -> impl Future<Output = Result<Narrative>> + Send;
}

// ============================================================================
// Offline Narrator
// ============================================================================

static BINARY_ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[/\s=])([A-Za-z0-9][A-Za-z0-9._+-]*\.(?:tar\.gz|tar\.xz|tar\.bz2|tgz|zip|deb|rpm|bin|appimage|dmg|exe|msi|pkg))(?:$|[\s?#])",
    )
    .expect("artifact regex")
});

/// Rule-based narrator driven by the static pre-scan. Used with `--offline`
/// and as the deterministic narrator in tests.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StaticNarrator;

impl StaticNarrator {
    pub(crate) fn score(report: &StaticReport) -> RiskScore {
        let base = match report.max_severity() {
            None => 1,
            Some(StaticSeverity::Low) => 3,
            Some(StaticSeverity::Medium) => 4,
            Some(StaticSeverity::High) => 6,
            Some(StaticSeverity::Critical) => 9,
        };
        let repeated = report.count(StaticSeverity::High) + report.count(StaticSeverity::Critical);
        let bump = if repeated >= 3 { 1 } else { 0 };
        RiskScore::new(base + bump)
    }
}

impl Narrator for StaticNarrator {
    async fn narrate(&self, request: &NarrativeRequest<'_>) -> Result<Narrative> {
        let score = Self::score(request.static_report);
        let mut report = String::new();

        if request.static_report.findings.is_empty() {
            report.push_str("Findings: no suspicious patterns detected by the static pre-scan.\n");
        } else {
            report.push_str("Findings:\n");
            for (i, f) in request.static_report.findings.iter().enumerate() {
                let _ = writeln!(
                    report,
                    "  {}. [{}] {} (line {})",
                    i + 1,
                    f.severity,
                    f.description,
                    f.line_number
                );
            }
        }
        report.push_str("\nRecommendation:\n  Offline rule-based assessment; review the script manually before running it.\n");

        Ok(Narrative {
            risk_score: score,
            report,
            external_binaries: binary_artifacts(request.script),
        })
    }
}

/// Downloaded artifact names that look like binaries or archives.
pub(crate) fn binary_artifacts(script: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for line in script.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        for caps in BINARY_ARTIFACT.captures_iter(line) {
            let name = caps[1].to_string();
            if seen.insert(name.clone()) {
                found.push(name);
            }
        }
    }
    found
}
