//! Risk event ingestor: one review-tool answer change in, one answer row and
//! its risk projection out.

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{PipelineError, PipelineResult};
use crate::records::{QuestionnaireAnswer, RiskLevel};
use crate::store::NormalizedStore;

/// Only answer updates carry a risk change.
pub const UPDATE_ANSWER_EVENT: &str = "UpdateAnswer";

/// Flat answer event as published by the review tool integration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEvent {
    pub workload_id: Option<String>,
    pub workload_name: Option<String>,
    pub lens_alias: Option<String>,
    pub lens_name: Option<String>,
    pub question_id: Option<String>,
    pub question_title: Option<String>,
    pub risk: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    detail: EnvelopeDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeDetail {
    event_name: Option<String>,
    #[serde(default)]
    request_parameters: Option<RequestParameters>,
    #[serde(default)]
    response_elements: Option<ResponseElements>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestParameters {
    workload_id: Option<String>,
    lens_alias: Option<String>,
    question_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseElements {
    workload_name: Option<String>,
    lens_name: Option<String>,
    #[serde(default)]
    answer: Option<AnswerElement>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AnswerElement {
    question_title: Option<String>,
    risk: Option<String>,
}

/// Result of handling one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskOutcome {
    Recorded(QuestionnaireAnswer),
    /// A review-tool event that does not change an answer.
    Ignored { event_name: String },
}

/// Decode either the flat event or the review tool's change envelope.
pub fn parse_event(payload: &Value) -> PipelineResult<Result<RiskEvent, String>> {
    if payload.get("detail").is_none() {
        let event: RiskEvent = serde_json::from_value(payload.clone())
            .map_err(|e| PipelineError::malformed("event", e.to_string()))?;
        return Ok(Ok(event));
    }

    let envelope: Envelope = serde_json::from_value(payload.clone())
        .map_err(|e| PipelineError::malformed("detail", e.to_string()))?;
    let detail = envelope.detail;
    let event_name = detail.event_name.unwrap_or_default();
    if event_name != UPDATE_ANSWER_EVENT {
        return Ok(Err(event_name));
    }

    let params = detail
        .request_parameters
        .ok_or_else(|| PipelineError::malformed("requestParameters", "missing"))?;
    let response = detail.response_elements.unwrap_or_default();
    let answer = response.answer.unwrap_or_default();

    let lens_alias = match params.lens_alias {
        Some(alias) => Some(
            percent_decode_str(&alias)
                .decode_utf8()
                .map_err(|e| PipelineError::malformed("lensAlias", e.to_string()))?
                .into_owned(),
        ),
        None => None,
    };

    Ok(Ok(RiskEvent {
        workload_id: params.workload_id,
        workload_name: response.workload_name,
        lens_alias,
        lens_name: response.lens_name,
        question_id: params.question_id,
        question_title: answer.question_title,
        risk: answer.risk,
    }))
}

fn required(field: &str, value: Option<String>) -> PipelineResult<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(PipelineError::malformed(field, "missing or empty")),
    }
}

fn parse_risk(value: Option<String>) -> PipelineResult<RiskLevel> {
    let raw = required("risk", value)?;
    serde_json::from_value(Value::String(raw.to_ascii_uppercase()))
        .map_err(|_| PipelineError::malformed("risk", format!("unknown risk level '{raw}'")))
}

impl RiskEvent {
    /// Validate into a canonical answer. Display names fall back to ids.
    pub fn into_answer(self) -> PipelineResult<QuestionnaireAnswer> {
        let workload_id = required("workloadId", self.workload_id)?;
        let lens_alias = required("lensAlias", self.lens_alias)?;
        let question_id = required("questionId", self.question_id)?;
        let risk = parse_risk(self.risk)?;

        Ok(QuestionnaireAnswer {
            workload_name: self
                .workload_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| workload_id.clone()),
            lens_name: self
                .lens_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| lens_alias.clone()),
            question_title: self.question_title.unwrap_or_default(),
            workload_id,
            lens_alias,
            question_id,
            risk,
        })
    }
}

pub struct RiskEventIngestor<'a> {
    store: &'a NormalizedStore,
}

impl<'a> RiskEventIngestor<'a> {
    pub fn new(store: &'a NormalizedStore) -> Self {
        Self { store }
    }

    /// Upsert the answer carried by `payload`. Malformed events come back as
    /// [`PipelineError::Malformed`] and must not be redelivered.
    pub fn handle(&self, payload: &Value) -> PipelineResult<RiskOutcome> {
        let event = match parse_event(payload) {
            Ok(Ok(event)) => event,
            Ok(Err(event_name)) => {
                debug!(event_name = %event_name, "ignoring review event");
                return Ok(RiskOutcome::Ignored { event_name });
            }
            Err(err) => {
                warn!(error = %err, "rejecting undecodable review event");
                return Err(err);
            }
        };

        let answer = event.into_answer().inspect_err(|err| {
            warn!(error = %err, "rejecting review event");
        })?;

        self.store.upsert_answer(&answer)?;
        info!(
            workload_id = %answer.workload_id,
            lens_alias = %answer.lens_alias,
            question_id = %answer.question_id,
            risk = ?answer.risk,
            "answer recorded"
        );
        Ok(RiskOutcome::Recorded(answer))
    }
}
