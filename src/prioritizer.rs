//! Remediation prioritizer: joins non-compliant detail with the guidance
//! mapping and reconciles the ranked backlog.
//!
//! The backlog is a pure function of the current detail and guidance rows,
//! so running it again over the same snapshot commits nothing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::config::PrioritizerConfig;
use crate::delivery::Deadline;
use crate::errors::PipelineResult;
use crate::records::{composite_key, ComplianceDetail, GuidanceMapping, RemediationBacklog};
use crate::rule_names::{join_key, rule_family};
use crate::store::{NormalizedStore, ReconcileOutcome};

#[derive(Debug, Clone)]
pub struct Backlog {
    /// Highest rank first.
    pub rows: Vec<RemediationBacklog>,
    /// Non-compliant rule families with no guidance. A data gap, not a fault.
    pub unmapped_families: Vec<String>,
}

pub fn labor_sprints(labor_hours: f64, config: &PrioritizerConfig) -> u32 {
    let sprints = config
        .sprint_rounding
        .apply(labor_hours / config.team_velocity_hours);
    if sprints.is_finite() && sprints > 0.0 {
        sprints.min(u32::MAX as f64) as u32
    } else {
        0
    }
}

struct Candidate {
    score: f64,
    row: RemediationBacklog,
}

fn by_priority(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.row.rule_name.cmp(&b.row.rule_name))
        .then_with(|| a.row.resource_id.cmp(&b.row.resource_id))
        .then_with(|| a.row.guidance_id.cmp(&b.row.guidance_id))
}

/// Compute the ranked backlog.
///
/// Score is family breadth (distinct non-compliant resources in the rule
/// family) over effort. Ranks are unique: the top row gets `rows.len()`,
/// the last row gets 1.
pub fn compute_backlog(
    details: &[ComplianceDetail],
    guidance: &[GuidanceMapping],
    config: &PrioritizerConfig,
) -> Backlog {
    let non_compliant: Vec<&ComplianceDetail> = details.iter().filter(|d| d.is_non_compliant()).collect();

    let mut breadth: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for detail in &non_compliant {
        breadth
            .entry(join_key(&detail.rule_name))
            .or_default()
            .insert(detail.resource_id.as_str());
    }

    let mut mapped: BTreeMap<String, Vec<&GuidanceMapping>> = BTreeMap::new();
    for mapping in guidance {
        mapped.entry(join_key(&mapping.rule_name)).or_default().push(mapping);
    }

    let mut candidates: BTreeMap<(String, String, String), Candidate> = BTreeMap::new();
    let mut unmapped = BTreeSet::new();

    for detail in non_compliant {
        let family_key = join_key(&detail.rule_name);
        let Some(mappings) = mapped.get(&family_key) else {
            unmapped.insert(rule_family(&detail.rule_name).to_string());
            continue;
        };
        let family_breadth = breadth.get(&family_key).map_or(1, |r| r.len()) as f64;

        for mapping in mappings {
            let key = (
                detail.rule_name.clone(),
                mapping.guidance_id.clone(),
                detail.resource_id.clone(),
            );
            let effort = mapping.labor_hours.max(config.min_effort_hours);
            candidates.entry(key).or_insert_with(|| Candidate {
                score: family_breadth / effort,
                row: RemediationBacklog {
                    rule_name_guidance_id_resource_id: composite_key(&[
                        &detail.rule_name,
                        &mapping.guidance_id,
                        &detail.resource_id,
                    ]),
                    rule_name_prefix: rule_family(&detail.rule_name).to_string(),
                    rule_name: detail.rule_name.clone(),
                    guidance_id: mapping.guidance_id.clone(),
                    resource_id: detail.resource_id.clone(),
                    resource_type: detail.resource_type.clone(),
                    skill_level: mapping.skill_level.clone(),
                    labor_hours: mapping.labor_hours,
                    labor_sprints: labor_sprints(mapping.labor_hours, config),
                    rank: 0,
                },
            });
        }
    }

    let mut ordered: Vec<Candidate> = candidates.into_values().collect();
    ordered.sort_by(by_priority);

    let total = ordered.len() as u64;
    let rows = ordered
        .into_iter()
        .enumerate()
        .map(|(position, mut candidate)| {
            candidate.row.rank = total - position as u64;
            candidate.row
        })
        .collect();

    Backlog {
        rows,
        unmapped_families: unmapped.into_iter().collect(),
    }
}

#[derive(Debug)]
pub struct PrioritizeReport {
    pub backlog: Backlog,
    pub outcome: ReconcileOutcome,
}

pub struct RemediationPrioritizer<'a> {
    store: &'a NormalizedStore,
    config: &'a PrioritizerConfig,
}

impl<'a> RemediationPrioritizer<'a> {
    pub fn new(store: &'a NormalizedStore, config: &'a PrioritizerConfig) -> Self {
        Self { store, config }
    }

    /// Recompute the backlog from the stored snapshot and reconcile it.
    pub fn run(&self, deadline: &Deadline) -> PipelineResult<PrioritizeReport> {
        let details = self.store.all_details()?;
        let guidance = self.store.guidance()?;
        let backlog = compute_backlog(&details, &guidance, self.config);

        if !backlog.unmapped_families.is_empty() {
            debug!(families = ?backlog.unmapped_families, "non-compliant rules without guidance");
        }

        deadline.check("backlog commit")?;
        let outcome = self.store.reconcile_backlog(&backlog.rows)?;
        info!(
            rows = backlog.rows.len(),
            upserted = outcome.upserted,
            removed = outcome.removed,
            unmapped = backlog.unmapped_families.len(),
            "remediation backlog reconciled"
        );
        Ok(PrioritizeReport { backlog, outcome })
    }
}
