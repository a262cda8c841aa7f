//! Canonical records persisted by the normalized store.
//!
//! Attribute names are the durable contract with the query layer: every
//! record serializes as camelCase JSON.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

/// Joins composite attribute parts (`ruleNameResourceId` and friends).
pub const COMPOSITE_SEPARATOR: char = '#';

/// Escaped inside a part so that distinct part lists never join to the same key.
const COMPOSITE_PART: &AsciiSet = &CONTROLS.add(b'#').add(b'%');

pub fn composite_key(parts: &[&str]) -> String {
    let mut joined = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            joined.push(COMPOSITE_SEPARATOR);
        }
        joined.extend(utf8_percent_encode(part, COMPOSITE_PART));
    }
    joined
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    NotApplicable,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Unanswered,
}

/// Latest aggregate score of one conformance pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceSummary {
    pub conformance_pack_name: String,
    /// `None` when the rules engine could not score the pack.
    pub score: Option<f64>,
}

/// One rule evaluated against one resource inside a pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceDetail {
    pub conformance_pack_name: String,
    pub rule_name_resource_id: String,
    pub compliance_state: ComplianceState,
    pub rule_name: String,
    pub resource_type: String,
    pub resource_id: String,
}

impl ComplianceDetail {
    pub fn new(
        pack_name: &str,
        rule_name: &str,
        resource_type: &str,
        resource_id: &str,
        compliance_state: ComplianceState,
    ) -> Self {
        Self {
            conformance_pack_name: pack_name.to_string(),
            rule_name_resource_id: composite_key(&[rule_name, resource_id]),
            compliance_state,
            rule_name: rule_name.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        }
    }

    pub fn is_non_compliant(&self) -> bool {
        self.compliance_state == ComplianceState::NonCompliant
    }
}

/// Association of a rule family with one remediation guidance item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceMapping {
    /// Normalized join key, see [`crate::rule_names::join_key`].
    pub rule_name: String,
    pub guidance_id: String,
    pub skill_level: String,
    pub labor_hours: f64,
}

/// One outstanding unit of remediation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationBacklog {
    pub rule_name_guidance_id_resource_id: String,
    pub rule_name_prefix: String,
    pub rule_name: String,
    pub guidance_id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub skill_level: String,
    pub labor_hours: f64,
    pub labor_sprints: u32,
    pub rank: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireAnswer {
    pub workload_id: String,
    pub workload_name: String,
    pub lens_alias: String,
    pub lens_name: String,
    pub question_id: String,
    pub question_title: String,
    pub risk: RiskLevel,
}

impl QuestionnaireAnswer {
    pub fn workload_lens_key(&self) -> String {
        composite_key(&[&self.workload_id, &self.lens_alias])
    }
}

/// Flattened answer row keyed for direct reads by the reporting layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireRisk {
    pub workload_id_lens_alias: String,
    pub question_id: String,
    pub workload_id: String,
    pub workload_name: String,
    pub lens_alias: String,
    pub lens_name: String,
    pub question_title: String,
    pub risk: RiskLevel,
}

impl From<&QuestionnaireAnswer> for QuestionnaireRisk {
    fn from(answer: &QuestionnaireAnswer) -> Self {
        Self {
            workload_id_lens_alias: answer.workload_lens_key(),
            question_id: answer.question_id.clone(),
            workload_id: answer.workload_id.clone(),
            workload_name: answer.workload_name.clone(),
            lens_alias: answer.lens_alias.clone(),
            lens_name: answer.lens_name.clone(),
            question_title: answer.question_title.clone(),
            risk: answer.risk,
        }
    }
}
