// src/tests/test_utils.rs
// Shared fixtures for the pipeline unit tests

use std::thread;
use std::time::Duration;

use crate::compliance_ingest::{
    EvaluationResult, PackPollResult, PackScore, Page, RulesEngine, RulesEngineError, SnapshotRulesEngine,
};
use crate::config::{DeliveryConfig, PipelineConfig, TableNames};
use crate::guidance::GuidanceEntry;
use crate::pipeline::PipelineContext;
use crate::records::ComplianceState;
use crate::store::NormalizedStore;
use crate::store_cipher::StoreCipher;

pub fn temp_store() -> NormalizedStore {
    NormalizedStore::temporary(&TableNames::default(), StoreCipher::plaintext())
        .expect("temporary store")
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        delivery: DeliveryConfig {
            retry_backoff_secs: 0,
            ..DeliveryConfig::default()
        },
        ..PipelineConfig::default()
    }
}

pub fn temp_context() -> PipelineContext {
    PipelineContext::with_store(test_config(), temp_store())
}

pub fn eval(rule: &str, resource: &str, state: ComplianceState) -> EvaluationResult {
    EvaluationResult {
        rule_name: rule.to_string(),
        resource_id: resource.to_string(),
        resource_type: "AWS::S3::Bucket".to_string(),
        compliance_state: state,
    }
}

pub fn pack(name: &str, score: f64, details: Vec<EvaluationResult>) -> PackPollResult {
    PackPollResult {
        pack_name: name.to_string(),
        score: Some(score),
        details,
    }
}

pub fn guidance(rule: &str, id: &str, hours: f64, skill: &str) -> GuidanceEntry {
    GuidanceEntry {
        rule_name: Some(rule.to_string()),
        guidance_id: Some(id.to_string()),
        labor_hours: Some(hours),
        skill_level: Some(skill.to_string()),
    }
}

/// Snapshot engine that refuses detail requests for one pack.
pub struct RejectingEngine {
    pub inner: SnapshotRulesEngine,
    pub rejected_pack: &'static str,
}

impl RulesEngine for RejectingEngine {
    fn list_pack_scores(&self, next_token: Option<&str>) -> Result<Page<PackScore>, RulesEngineError> {
        self.inner.list_pack_scores(next_token)
    }

    fn pack_details(
        &self,
        pack_name: &str,
        next_token: Option<&str>,
    ) -> Result<Page<EvaluationResult>, RulesEngineError> {
        if pack_name == self.rejected_pack {
            return Err(RulesEngineError::Rejected(format!("no such pack '{pack_name}'")));
        }
        self.inner.pack_details(pack_name, next_token)
    }
}

/// Snapshot engine that stalls on every detail page.
pub struct SlowEngine {
    pub inner: SnapshotRulesEngine,
    pub delay: Duration,
}

impl RulesEngine for SlowEngine {
    fn list_pack_scores(&self, next_token: Option<&str>) -> Result<Page<PackScore>, RulesEngineError> {
        self.inner.list_pack_scores(next_token)
    }

    fn pack_details(
        &self,
        pack_name: &str,
        next_token: Option<&str>,
    ) -> Result<Page<EvaluationResult>, RulesEngineError> {
        thread::sleep(self.delay);
        self.inner.pack_details(pack_name, next_token)
    }
}
