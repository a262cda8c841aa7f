//! Invocation handlers. Each handler is stateless: everything it needs comes
//! from the [`PipelineContext`] built once at startup.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::compliance_ingest::{ComplianceIngestor, IngestReport, RulesEngine};
use crate::config::PipelineConfig;
use crate::delivery::{Deadline, Dispatcher};
use crate::errors::{PipelineError, PipelineResult};
use crate::prioritizer::{PrioritizeReport, RemediationPrioritizer};
use crate::risk_ingest::{RiskEventIngestor, RiskOutcome};
use crate::store::NormalizedStore;

pub struct PipelineContext {
    pub config: PipelineConfig,
    pub store: NormalizedStore,
}

#[derive(Debug)]
pub struct CycleReport {
    pub ingest: IngestReport,
    pub prioritized: PrioritizeReport,
}

impl PipelineContext {
    pub fn open(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let store = NormalizedStore::open(&config)?;
        info!(
            data_dir = %config.data_dir,
            query_region = %config.query_region,
            encrypted = config.encryption_key_b64.is_some(),
            "normalized store opened"
        );
        Ok(Self { config, store })
    }

    pub fn with_store(config: PipelineConfig, store: NormalizedStore) -> Self {
        Self { config, store }
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.store, self.config.delivery.clone())
    }

    /// Scheduled compliance cycle: ingest every pack, then recompute the
    /// backlog.
    ///
    /// The backlog is recomputed on every cycle; a redelivered cycle thereby
    /// repairs a backlog commit that failed on an earlier attempt. Packs that
    /// committed stay committed and feed the backlog even when other packs
    /// failed or the budget ran out, so the backlog commit is not bound by
    /// the ingest deadline. An incomplete cycle is then reported as an error:
    /// transient unless every failed pack failed permanently.
    pub fn compliance_cycle<E: RulesEngine>(&self, engine: &E, deadline: &Deadline) -> PipelineResult<CycleReport> {
        let ingest = ComplianceIngestor::new(&self.store, engine).run(deadline)?;

        let prioritized = self.prioritize(&Deadline::unbounded())?;
        if ingest.detail_changed() && !prioritized.outcome.changed() {
            debug!("compliance detail changed without affecting the backlog");
        }

        if let Some(stage) = &ingest.timed_out_at {
            return Err(PipelineError::Timeout {
                stage: format!("pack {stage}"),
                budget_ms: deadline.budget_ms(),
            });
        }
        if !ingest.failed.is_empty() {
            let transient = ingest.failed.iter().any(|f| f.transient);
            warn!(failed = ?ingest.failed, transient, "compliance cycle incomplete");
            return Err(PipelineError::PartialFailure {
                failed: ingest.failed.len(),
                total: ingest.total_packs,
                packs: ingest.failed.iter().map(|f| f.pack_name.clone()).collect(),
                transient,
            });
        }

        Ok(CycleReport {
            ingest,
            prioritized,
        })
    }

    pub fn prioritize(&self, deadline: &Deadline) -> PipelineResult<PrioritizeReport> {
        RemediationPrioritizer::new(&self.store, &self.config.prioritizer).run(deadline)
    }

    pub fn risk_event(&self, payload: &Value) -> PipelineResult<RiskOutcome> {
        RiskEventIngestor::new(&self.store).handle(payload)
    }
}
