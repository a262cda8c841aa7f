// Layered runtime configuration for the governance pipeline.
// defaults -> govern.toml (or $GOVERN_CONFIG) -> GOVERN_* environment

use std::collections::HashSet;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

pub const DEFAULT_CONFIG_FILE: &str = "govern.toml";
pub const CONFIG_PATH_VAR: &str = "GOVERN_CONFIG";
pub const ENV_PREFIX: &str = "GOVERN_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: String,
    /// Region of the federated query endpoint that reads the store.
    pub query_region: String,
    #[serde(default)]
    pub encryption_key_b64: Option<String>,
    #[serde(default)]
    pub tables: TableNames,
    #[serde(default)]
    pub prioritizer: PrioritizerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Identifiers of the persisted collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableNames {
    pub compliance_summary: String,
    pub compliance_detail: String,
    pub guidance_mapping: String,
    pub remediation_backlog: String,
    pub questionnaire_answer: String,
    pub questionnaire_risk: String,
    pub dead_letter: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            compliance_summary: "conformance-pack-compliance-summary".into(),
            compliance_detail: "conformance-pack-compliance-detail".into(),
            guidance_mapping: "conformance-pack-compliance-playbook".into(),
            remediation_backlog: "conformance-pack-compliance-remediation".into(),
            questionnaire_answer: "workload-review-answers".into(),
            questionnaire_risk: "workload-review-risks".into(),
            dead_letter: "pipeline-dead-letter".into(),
        }
    }
}

impl TableNames {
    fn all(&self) -> [(&'static str, &str); 7] {
        [
            ("compliance_summary", self.compliance_summary.as_str()),
            ("compliance_detail", self.compliance_detail.as_str()),
            ("guidance_mapping", self.guidance_mapping.as_str()),
            ("remediation_backlog", self.remediation_backlog.as_str()),
            ("questionnaire_answer", self.questionnaire_answer.as_str()),
            ("questionnaire_risk", self.questionnaire_risk.as_str()),
            ("dead_letter", self.dead_letter.as_str()),
        ]
    }
}

/// How fractional sprint counts are turned into whole sprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SprintRounding {
    #[default]
    Up,
    Down,
    Nearest,
}

impl SprintRounding {
    pub fn apply(self, value: f64) -> f64 {
        match self {
            SprintRounding::Up => value.ceil(),
            SprintRounding::Down => value.floor(),
            SprintRounding::Nearest => value.round(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizerConfig {
    /// Labor hours one team delivers per sprint.
    #[serde(default = "default_team_velocity_hours")]
    pub team_velocity_hours: f64,
    #[serde(default)]
    pub sprint_rounding: SprintRounding,
    /// Effort floor used by ranking so zero-hour guidance cannot dominate.
    #[serde(default = "default_min_effort_hours")]
    pub min_effort_hours: f64,
}

fn default_team_velocity_hours() -> f64 {
    40.0
}

fn default_min_effort_hours() -> f64 {
    0.5
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            team_velocity_hours: default_team_velocity_hours(),
            sprint_rounding: SprintRounding::default(),
            min_effort_hours: default_min_effort_hours(),
        }
    }
}

/// Redelivery policy applied at the trigger boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default = "default_redelivery_window_secs")]
    pub redelivery_window_secs: u64,
    #[serde(default = "default_invocation_budget_secs")]
    pub invocation_budget_secs: u64,
    /// Pause between in-process redelivery attempts.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_max_redeliveries() -> u32 {
    2
}

fn default_redelivery_window_secs() -> u64 {
    2 * 60 * 60
}

fn default_invocation_budget_secs() -> u64 {
    30
}

fn default_retry_backoff_secs() -> u64 {
    30
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: default_max_redeliveries(),
            redelivery_window_secs: default_redelivery_window_secs(),
            invocation_budget_secs: default_invocation_budget_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

impl DeliveryConfig {
    pub fn redelivery_window(&self) -> Duration {
        Duration::from_secs(self.redelivery_window_secs)
    }

    pub fn invocation_budget(&self) -> Duration {
        Duration::from_secs(self.invocation_budget_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: "govern-data".into(),
            query_region: "us-east-1".into(),
            encryption_key_b64: None,
            tables: TableNames::default(),
            prioritizer: PrioritizerConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.data_dir.trim().is_empty() {
            return Err(PipelineError::config("data_dir cannot be empty"));
        }
        if self.query_region.trim().is_empty() {
            return Err(PipelineError::config("query_region cannot be empty"));
        }

        let mut seen = HashSet::new();
        for (field, name) in self.tables.all() {
            if name.trim().is_empty() {
                return Err(PipelineError::config(format!(
                    "tables.{field} cannot be empty"
                )));
            }
            if !seen.insert(name) {
                return Err(PipelineError::config(format!(
                    "tables.{field} reuses table identifier '{name}'"
                )));
            }
        }

        let velocity = self.prioritizer.team_velocity_hours;
        if !velocity.is_finite() || velocity <= 0.0 {
            return Err(PipelineError::config(
                "prioritizer.team_velocity_hours must be a positive number",
            ));
        }
        let floor = self.prioritizer.min_effort_hours;
        if !floor.is_finite() || floor <= 0.0 {
            return Err(PipelineError::config(
                "prioritizer.min_effort_hours must be a positive number",
            ));
        }
        if self.delivery.invocation_budget_secs == 0 {
            return Err(PipelineError::config(
                "delivery.invocation_budget_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Figment with defaults, the TOML file at `path`, and `GOVERN_*` overrides.
pub fn figment_for(path: &str) -> Figment {
    Figment::from(Serialized::defaults(PipelineConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

pub fn extract_config(figment: Figment) -> PipelineResult<PipelineConfig> {
    let config: PipelineConfig = figment
        .extract()
        .map_err(|e| PipelineError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> PipelineResult<PipelineConfig> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    extract_config(figment_for(&path))
}
