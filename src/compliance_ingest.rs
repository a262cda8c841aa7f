//! Compliance ingestor: mirrors the rules engine's current results into the
//! summary and detail collections, one pack at a time.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delivery::Deadline;
use crate::errors::{PipelineError, PipelineResult};
use crate::records::{ComplianceDetail, ComplianceState, ComplianceSummary};
use crate::store::{NormalizedStore, ReconcileOutcome};

/// One rule evaluated against one resource, as reported by the rules engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub rule_name: String,
    pub resource_id: String,
    pub resource_type: String,
    pub compliance_state: ComplianceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackScore {
    pub pack_name: String,
    pub score: Option<f64>,
}

/// Full poll result of one pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackPollResult {
    pub pack_name: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub details: Vec<EvaluationResult>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum RulesEngineError {
    #[error("rules engine unavailable: {0}")]
    Transient(String),

    #[error("rules engine rejected the request: {0}")]
    Rejected(String),
}

impl RulesEngineError {
    fn into_pipeline(self, operation: &str) -> PipelineError {
        let transient = matches!(self, RulesEngineError::Transient(_));
        PipelineError::RulesEngine {
            operation: operation.to_string(),
            message: self.to_string(),
            transient,
        }
    }
}

/// The external configuration-compliance rules engine.
pub trait RulesEngine {
    fn list_pack_scores(&self, next_token: Option<&str>) -> Result<Page<PackScore>, RulesEngineError>;

    fn pack_details(
        &self,
        pack_name: &str,
        next_token: Option<&str>,
    ) -> Result<Page<EvaluationResult>, RulesEngineError>;
}

/// Serves recorded poll results, paginated like the live engine.
#[derive(Debug, Clone)]
pub struct SnapshotRulesEngine {
    packs: Vec<PackPollResult>,
    page_size: usize,
}

impl SnapshotRulesEngine {
    pub fn new(packs: Vec<PackPollResult>) -> Self {
        Self {
            packs,
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::malformed("snapshot", format!("cannot read {}: {e}", path.display()))
        })?;
        let packs: Vec<PackPollResult> = serde_json::from_str(&content)
            .map_err(|e| PipelineError::malformed("snapshot", e.to_string()))?;
        Ok(Self::new(packs))
    }

    fn page<T: Clone>(&self, items: &[T], next_token: Option<&str>) -> Result<Page<T>, RulesEngineError> {
        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RulesEngineError::Rejected(format!("invalid next token '{token}'")))?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let items_page = items.get(start..end).unwrap_or_default().to_vec();
        let next_token = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: items_page,
            next_token,
        })
    }
}

impl RulesEngine for SnapshotRulesEngine {
    fn list_pack_scores(&self, next_token: Option<&str>) -> Result<Page<PackScore>, RulesEngineError> {
        let scores: Vec<PackScore> = self
            .packs
            .iter()
            .map(|p| PackScore {
                pack_name: p.pack_name.clone(),
                score: p.score,
            })
            .collect();
        self.page(&scores, next_token)
    }

    fn pack_details(
        &self,
        pack_name: &str,
        next_token: Option<&str>,
    ) -> Result<Page<EvaluationResult>, RulesEngineError> {
        let pack = self
            .packs
            .iter()
            .find(|p| p.pack_name == pack_name)
            .ok_or_else(|| RulesEngineError::Rejected(format!("unknown pack '{pack_name}'")))?;
        self.page(&pack.details, next_token)
    }
}

/// Scores outside 0..=100 are recorded as unscored.
pub fn normalize_score(pack_name: &str, score: Option<f64>) -> Option<f64> {
    match score {
        Some(s) if s.is_finite() && (0.0..=100.0).contains(&s) => Some(s),
        Some(s) => {
            warn!(pack = pack_name, score = s, "discarding out-of-range compliance score");
            None
        }
        None => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackReport {
    pub pack_name: String,
    pub detail: ReconcileOutcome,
}

/// A pack left at its last committed state.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedPack {
    pub pack_name: String,
    pub reason: String,
    /// Whether redelivering the cycle could get this pack through.
    pub transient: bool,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub packs: Vec<PackReport>,
    pub failed: Vec<FailedPack>,
    /// Set when the budget ran out; the named pack and those after it were skipped.
    pub timed_out_at: Option<String>,
    /// Stored packs the engine no longer lists, removed after a complete pass.
    pub retired: Vec<PackReport>,
    pub total_packs: usize,
}

impl IngestReport {
    pub fn detail_changed(&self) -> bool {
        self.packs.iter().chain(&self.retired).any(|p| p.detail.changed())
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.timed_out_at.is_none()
    }
}

pub struct ComplianceIngestor<'a, E: RulesEngine> {
    store: &'a NormalizedStore,
    engine: &'a E,
}

impl<'a, E: RulesEngine> ComplianceIngestor<'a, E> {
    pub fn new(store: &'a NormalizedStore, engine: &'a E) -> Self {
        Self { store, engine }
    }

    /// Ingest every listed pack, then retire stored packs the listing no
    /// longer contains. Listing failures abort the cycle before any write;
    /// failures inside a pack are isolated to that pack.
    pub fn run(&self, deadline: &Deadline) -> PipelineResult<IngestReport> {
        let scores = self.list_scores(deadline)?;
        let listed: HashSet<String> = scores.iter().map(|s| s.pack_name.clone()).collect();
        let mut report = IngestReport {
            total_packs: scores.len(),
            ..IngestReport::default()
        };

        for score in scores {
            if deadline.check(&format!("pack {}", score.pack_name)).is_err() {
                warn!(pack = %score.pack_name, "invocation budget spent, deferring remaining packs");
                report.timed_out_at = Some(score.pack_name);
                break;
            }

            match self.ingest_pack(&score, deadline) {
                Ok(detail) => {
                    info!(
                        pack = %score.pack_name,
                        upserted = detail.upserted,
                        removed = detail.removed,
                        unchanged = detail.unchanged,
                        remaining_ms = deadline.remaining().as_millis() as u64,
                        "pack ingested"
                    );
                    report.packs.push(PackReport {
                        pack_name: score.pack_name,
                        detail,
                    });
                }
                Err(err) => {
                    warn!(pack = %score.pack_name, error = %err, "pack left at last committed state");
                    report.failed.push(FailedPack {
                        pack_name: score.pack_name,
                        transient: err.is_transient(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if report.timed_out_at.is_none() {
            self.retire_unlisted(&listed, &mut report);
        }

        Ok(report)
    }

    /// Remove stored packs that a complete listing no longer contains, so
    /// their detail stops feeding the backlog. Failures are reported per pack.
    fn retire_unlisted(&self, listed: &HashSet<String>, report: &mut IngestReport) {
        let stored = match self.store.summaries() {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "cannot list stored packs, skipping retirement");
                return;
            }
        };

        for summary in stored {
            let pack_name = summary.conformance_pack_name;
            if listed.contains(&pack_name) {
                continue;
            }
            match self.store.retire_pack(&pack_name) {
                Ok(detail) => {
                    info!(pack = %pack_name, removed = detail.removed, "pack no longer listed, retired");
                    report.retired.push(PackReport { pack_name, detail });
                }
                Err(err) => {
                    warn!(pack = %pack_name, error = %err, "failed to retire unlisted pack");
                    report.failed.push(FailedPack {
                        pack_name,
                        transient: err.is_transient(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn list_scores(&self, deadline: &Deadline) -> PipelineResult<Vec<PackScore>> {
        let mut scores = Vec::new();
        let mut seen = HashSet::new();
        let mut token: Option<String> = None;
        loop {
            deadline.check("list pack scores")?;
            let page = self
                .engine
                .list_pack_scores(token.as_deref())
                .map_err(|e| e.into_pipeline("list_pack_scores"))?;
            for score in page.items {
                if seen.insert(score.pack_name.clone()) {
                    scores.push(score);
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(packs = scores.len(), "listed conformance packs");
        Ok(scores)
    }

    /// Fetch every page before touching the store so a failed fetch never
    /// leaves the pack partially overwritten.
    fn ingest_pack(&self, score: &PackScore, deadline: &Deadline) -> PipelineResult<ReconcileOutcome> {
        let pack_name = score.pack_name.as_str();
        let mut details = Vec::new();
        let mut token: Option<String> = None;
        loop {
            deadline.check(&format!("pack {pack_name} details"))?;
            let page = self
                .engine
                .pack_details(pack_name, token.as_deref())
                .map_err(|e| e.into_pipeline("pack_details"))?;
            for result in page.items {
                if result.rule_name.trim().is_empty() || result.resource_id.trim().is_empty() {
                    warn!(pack = pack_name, ?result, "skipping evaluation without rule or resource");
                    continue;
                }
                details.push(ComplianceDetail::new(
                    pack_name,
                    &result.rule_name,
                    &result.resource_type,
                    &result.resource_id,
                    result.compliance_state,
                ));
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let summary = ComplianceSummary {
            conformance_pack_name: pack_name.to_string(),
            score: normalize_score(pack_name, score.score),
        };
        self.store.commit_pack(&summary, &details)
    }
}
