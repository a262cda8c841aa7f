// src/tests/config.rs
use figment::providers::{Format, Serialized, Toml};
use figment::Figment;

use crate::config::{extract_config, PipelineConfig, SprintRounding};

fn from_toml(toml: &str) -> Figment {
    Figment::from(Serialized::defaults(PipelineConfig::default())).merge(Toml::string(toml))
}

#[test]
pub fn defaults_are_valid() {
    let config = extract_config(from_toml("")).expect("defaults should validate");
    assert_eq!(config.delivery.max_redeliveries, 2);
    assert_eq!(config.delivery.redelivery_window_secs, 7200);
    assert_eq!(config.prioritizer.sprint_rounding, SprintRounding::Up);
    assert!(config.encryption_key_b64.is_none());
}

#[test]
pub fn toml_overrides_nested_sections() {
    let config = extract_config(from_toml(
        r#"
        data_dir = "/var/lib/govern"
        query_region = "eu-west-1"

        [prioritizer]
        team_velocity_hours = 16.0
        sprint_rounding = "nearest"

        [tables]
        compliance_detail = "detail-v2"
        "#,
    ))
    .expect("valid overrides");

    assert_eq!(config.data_dir, "/var/lib/govern");
    assert_eq!(config.query_region, "eu-west-1");
    assert_eq!(config.prioritizer.team_velocity_hours, 16.0);
    assert_eq!(config.prioritizer.sprint_rounding, SprintRounding::Nearest);
    assert_eq!(config.tables.compliance_detail, "detail-v2");
    // untouched table names keep their defaults
    assert_eq!(config.tables.compliance_summary, "conformance-pack-compliance-summary");
}

#[test]
pub fn shared_table_identifiers_are_rejected() {
    let result = extract_config(from_toml(
        r#"
        [tables]
        questionnaire_answer = "reviews"
        questionnaire_risk = "reviews"
        "#,
    ));
    let err = result.unwrap_err().to_string();
    assert!(err.contains("questionnaire_risk"), "{err}");
}

#[test]
pub fn zero_velocity_fails_fast() {
    let result = extract_config(from_toml(
        r#"
        [prioritizer]
        team_velocity_hours = 0.0
        "#,
    ));
    assert!(result.unwrap_err().to_string().contains("team_velocity_hours"));
}

#[test]
pub fn empty_data_dir_fails() {
    let result = extract_config(from_toml(r#"data_dir = "  ""#));
    assert!(result.unwrap_err().to_string().contains("cannot be empty"));
}

#[test]
pub fn rounding_policies_differ_only_on_fractions() {
    assert_eq!(SprintRounding::Up.apply(0.1), 1.0);
    assert_eq!(SprintRounding::Down.apply(1.9), 1.0);
    assert_eq!(SprintRounding::Nearest.apply(1.5), 2.0);
    assert_eq!(SprintRounding::Up.apply(2.0), 2.0);
}
