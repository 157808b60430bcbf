use anyhow::Result;
use colored::*;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

use crate::engine::AnalysisReport;
use crate::narrator::Narrative;
use crate::trust::TrustStatus;

// ============================================================================
// Risk Scale
// ============================================================================

/// Integer risk on a 1..=10 scale. Construction always clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub(crate) struct RiskScore(u8);

impl RiskScore {
    pub(crate) const MIN: RiskScore = RiskScore(1);
    pub(crate) const MAX: RiskScore = RiskScore(10);

    pub(crate) const fn new(value: i64) -> Self {
        let clamped = if value < Self::MIN.0 as i64 {
            Self::MIN.0 as i64
        } else if value > Self::MAX.0 as i64 {
            Self::MAX.0 as i64
        } else {
            value
        };
        RiskScore(clamped as u8)
    }

    pub(crate) fn value(self) -> u8 {
        self.0
    }

    pub(crate) fn level(self) -> RiskLevel {
        match self.0 {
            1..=2 => RiskLevel::Safe,
            3..=4 => RiskLevel::Low,
            5..=6 => RiskLevel::Medium,
            7..=8 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

impl fmt::Display for RiskScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/10", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub(crate) fn color(&self) -> Color {
        match self {
            RiskLevel::Safe => Color::Green,
            RiskLevel::Low => Color::Cyan,
            RiskLevel::Medium => Color::Yellow,
            RiskLevel::High => Color::Red,
            RiskLevel::Critical => Color::Magenta,
        }
    }
}

// ============================================================================
// Narrator Response Parsing
// ============================================================================

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("ANSI regex"));

static SCORE_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[?\s*(\d{1,3})\b").expect("score regex"));

const DANGEROUS_KEYWORDS: &[&str] = &[
    "reverse shell",
    "backdoor",
    "exfiltration",
    "malicious",
    "critical",
    "dangerous",
    "trojan",
    "keylogger",
    "rootkit",
    "exploit",
];

const NEGATIONS: &[&str] = &[
    "no ", "not ", "without ", "non-", "absence of ", "free of ", "doesn't ", "does not ",
    "don't ", "do not ", "didn't ", "did not ", "isn't ", "is not ", "aren't ", "are not ",
    "wasn't ", "was not ", "cannot ", "can't ",
];

/// Scores at or below this are checked against the findings.
const LOW_SCORE_CEILING: u8 = 3;
/// Score the contradiction guard raises a low score to.
const CONTRADICTION_FLOOR: RiskScore = RiskScore(7);

/// Strip markdown emphasis, ANSI escapes, and control characters so model
/// output cannot drive the terminal.
pub(crate) fn sanitize_ai_response(text: &str) -> String {
    let clean = text.replace("**", "").replace("__", "");
    let mut clean = ANSI_ESCAPE.replace_all(&clean, "").into_owned();
    clean.retain(|c| c == '\n' || c == '\t' || c == '\r' || !c.is_control());
    clean
}

#[derive(PartialEq)]
enum Section {
    None,
    Findings,
    Binaries,
    Recommendation,
}

/// Parse a narrator response of the form
///
/// ```text
/// RISK_SCORE: <1-10>
/// FINDINGS:
/// - ...
/// EXTERNAL_BINARIES:
/// - ...
/// RECOMMENDATION: ...
/// ```
///
/// A response without a readable `RISK_SCORE` is not a report.
pub(crate) fn parse_narrative(text: &str) -> Result<Narrative> {
    let clean = sanitize_ai_response(text);

    let mut score: Option<RiskScore> = None;
    let mut findings = Vec::new();
    let mut binaries = Vec::new();
    let mut recommendation = String::new();
    let mut section = Section::None;

    for line in clean.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("RISK_SCORE:") {
            if let Some(caps) = SCORE_VALUE.captures(rest) {
                if let Ok(n) = caps[1].parse::<i64>() {
                    score = Some(RiskScore::new(n));
                }
            }
            section = Section::None;
        } else if line == "FINDINGS:" {
            section = Section::Findings;
        } else if let Some(rest) = line.strip_prefix("EXTERNAL_BINARIES:") {
            section = Section::Binaries;
            binaries.extend(split_binaries(rest));
        } else if let Some(rest) = line.strip_prefix("RECOMMENDATION:") {
            section = Section::Recommendation;
            recommendation = rest.trim().to_string();
        } else if let Some(item) = line.strip_prefix('-') {
            match section {
                Section::Findings => findings.push(item.trim().to_string()),
                Section::Binaries => binaries.extend(split_binaries(item)),
                _ => {}
            }
        } else if section == Section::Recommendation && !line.is_empty() {
            if !recommendation.is_empty() {
                recommendation.push(' ');
            }
            recommendation.push_str(line);
        }
    }

    let Some(mut score) = score else {
        anyhow::bail!("Narrator response did not contain a RISK_SCORE line");
    };

    if score.value() <= LOW_SCORE_CEILING && mentions_danger(&findings) {
        tracing::warn!(
            score = score.value(),
            "low score contradicts findings, raising"
        );
        score = score.max(CONTRADICTION_FLOOR);
    }

    Ok(Narrative {
        risk_score: score,
        report: render_findings(&findings, &recommendation),
        external_binaries: binaries,
    })
}

fn split_binaries(text: &str) -> Vec<String> {
    text.split(',')
        .map(|b| b.trim().trim_matches('`').trim())
        .filter(|b| !b.is_empty() && !b.eq_ignore_ascii_case("none") && !b.eq_ignore_ascii_case("n/a"))
        .map(str::to_string)
        .collect()
}

/// True if any finding names a dangerous keyword without a negation in the
/// preceding 50 bytes of the same finding.
fn mentions_danger(findings: &[String]) -> bool {
    findings.iter().map(|f| f.to_lowercase()).any(|finding| {
        DANGEROUS_KEYWORDS.iter().any(|kw| {
            finding.match_indices(kw).any(|(pos, _)| {
                let mut start = pos.saturating_sub(50);
                while !finding.is_char_boundary(start) {
                    start += 1;
                }
                let prefix = &finding[start..pos];
                !NEGATIONS.iter().any(|neg| prefix.contains(neg))
            })
        })
    })
}

fn render_findings(findings: &[String], recommendation: &str) -> String {
    let mut out = String::new();
    if findings.is_empty() {
        out.push_str("Findings: none reported.\n");
    } else {
        out.push_str("Findings:\n");
        for (i, f) in findings.iter().enumerate() {
            out.push_str(&format!("  {}. {}\n", i + 1, f));
        }
    }
    if !recommendation.is_empty() {
        out.push_str("\nRecommendation:\n  ");
        out.push_str(recommendation);
        out.push('\n');
    }
    out
}

// ============================================================================
// Report Display
// ============================================================================

pub(crate) fn display_report(source: &str, root_digest: &str, root_status: &str, report: &AnalysisReport) {
    let level = report.risk_score.level();
    println!("\n{}", "═".repeat(51).bright_white());
    println!("{}", "          REMOTE SCRIPT ANALYSIS REPORT".bright_white().bold());
    println!("{}", "═".repeat(51).bright_white());

    println!("\n{:12} {}", "Source:".bold(), source);
    println!("{:12} {}", "SHA-256:".bold(), root_digest.bright_black());
    println!("{:12} {}", "Registry:".bold(), root_status);
    println!(
        "{:12} {} {}",
        "Risk:".bold(),
        report.risk_score.to_string().color(level.color()).bold(),
        format!("({})", level.as_str()).color(level.color())
    );

    println!("\n{}", report.report.trim_end());

    let bom = &report.bill_of_materials;
    println!("\n{}", "Bill of materials:".bold());
    if bom.remote_scripts.is_empty() {
        println!("  {}", "No remote scripts referenced.".bright_black());
    }
    for record in &bom.remote_scripts {
        let status = match record.status {
            TrustStatus::Verified => "✓ verified".green(),
            TrustStatus::Unverified => "⚠ unverified".yellow(),
            TrustStatus::Error => "✗ error".red(),
        };
        match &record.detail {
            Some(detail) => println!("  {} {} {}", status, record.url, format!("({})", detail).bright_black()),
            None => println!("  {} {}", status, record.url),
        }
    }
    if !bom.external_binaries.is_empty() {
        println!("  {} {}", "External binaries:".bright_white(), bom.external_binaries.join(", "));
    }

    println!("{}", "═".repeat(51).bright_white());
    println!(
        "\n{}",
        "Note: remote scripts are verified by digest only; external binaries are not verified."
            .bright_black()
    );
}
