//! Administrative load of the remediation guidance mapping.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::{PipelineError, PipelineResult};
use crate::records::GuidanceMapping;
use crate::rule_names::join_key;
use crate::store::{NormalizedStore, ReconcileOutcome};

pub const DEFAULT_LABOR_HOURS: f64 = 1.0;
pub const DEFAULT_SKILL_LEVEL: &str = "1";

/// One row of an authored guidance sheet. Blank cells are `None`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceEntry {
    pub rule_name: Option<String>,
    pub guidance_id: Option<String>,
    pub labor_hours: Option<f64>,
    pub skill_level: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Normalize sheet rows into mappings. Rows without a rule or guidance id are
/// skipped and the first row for a (rule, guidance) pair wins.
pub fn normalize_entries(entries: &[GuidanceEntry]) -> Vec<GuidanceMapping> {
    let mut seen = HashSet::new();
    let mut mappings = Vec::new();

    for entry in entries {
        let (Some(rule), Some(guidance_id)) = (non_blank(&entry.rule_name), non_blank(&entry.guidance_id))
        else {
            continue;
        };
        let rule_name = join_key(rule);
        if !seen.insert((rule_name.clone(), guidance_id.to_string())) {
            continue;
        }

        let labor_hours = match entry.labor_hours {
            Some(h) if h.is_finite() && h >= 0.0 => h,
            Some(h) => {
                warn!(rule = rule, guidance_id, hours = h, "invalid labor hours, using default");
                DEFAULT_LABOR_HOURS
            }
            None => DEFAULT_LABOR_HOURS,
        };

        mappings.push(GuidanceMapping {
            rule_name,
            guidance_id: guidance_id.to_string(),
            skill_level: non_blank(&entry.skill_level)
                .unwrap_or(DEFAULT_SKILL_LEVEL)
                .to_string(),
            labor_hours,
        });
    }
    mappings
}

pub fn read_guidance_file(path: &Path) -> PipelineResult<Vec<GuidanceEntry>> {
    let content = fs::read_to_string(path).map_err(|e| {
        PipelineError::malformed("guidance", format!("cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| PipelineError::malformed("guidance", e.to_string()))
}

/// Replace the stored mapping with `entries`.
pub fn load_guidance(store: &NormalizedStore, entries: &[GuidanceEntry]) -> PipelineResult<ReconcileOutcome> {
    let mappings = normalize_entries(entries);
    let outcome = store.replace_guidance(&mappings)?;
    info!(
        entries = entries.len(),
        mappings = mappings.len(),
        upserted = outcome.upserted,
        removed = outcome.removed,
        "guidance mapping loaded"
    );
    Ok(outcome)
}
