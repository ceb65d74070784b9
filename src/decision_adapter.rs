//! Decision adapter (spec §4.4): the LLM client wrapper. Builds the prompt
//! payload, calls the external model, and normalises whatever comes back
//! into a [`Decision`] the execution engine can trust without re-validating.
//!
//! The external HTTP call (spec §6.4) is an explicit out-of-scope
//! collaborator — treated as best-effort, any failure degrades to `HOLD` —
//! so it is folded into this module behind [`DecisionSource`] rather than
//! split into its own file.

use serde_json::{json, Value};
use tracing::warn;

use crate::errors::ValidationError;
use crate::model::{Action, Decision, EntrySpec, EntryType, FeatureSnapshot};

const DEFAULT_MODEL: &str = "gpt-5";
const LLM_ENDPOINT: &str = "https://api.openai.com/v1/responses";

pub struct DecisionRequest<'a> {
    pub features: &'a FeatureSnapshot,
    pub reasons: &'a [String],
    pub meta: Value,
    pub constraints: Value,
}

impl<'a> DecisionRequest<'a> {
    fn prompt(&self) -> String {
        json!({
            "features": self.features,
            "reasons": self.reasons,
            "meta": self.meta,
            "constraints": self.constraints,
        })
        .to_string()
    }
}

/// Where the raw decision JSON text comes from. `Mock` lets tests exercise
/// the normalisation pipeline without a network call.
pub enum DecisionSource {
    OpenAi { http: reqwest::Client, api_key: String, model: String },
    Mock(fn(&DecisionRequest) -> String),
}

impl DecisionSource {
    pub fn openai(api_key: String) -> Self {
        DecisionSource::OpenAi {
            http: reqwest::Client::new(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    async fn fetch_raw(&self, request: &DecisionRequest<'_>) -> Option<String> {
        match self {
            DecisionSource::Mock(f) => Some(f(request)),
            DecisionSource::OpenAi { http, api_key, model } => {
                let body = json!({
                    "model": model,
                    "input": request.prompt(),
                    "reasoning": {"effort": "low"},
                    "text": {"verbosity": "low"},
                    "max_output_tokens": 400,
                });
                let resp = match http
                    .post(LLM_ENDPOINT)
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "decision source request failed");
                        return None;
                    }
                };
                let parsed: Value = match resp.json().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "decision source response was not JSON");
                        return None;
                    }
                };
                extract_message_text(&parsed)
            }
        }
    }
}

/// Pull the text content out of a `message`-typed output item, per §6.4.
fn extract_message_text(response: &Value) -> Option<String> {
    response
        .get("output")?
        .as_array()?
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("message"))?
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|c| c.get("text").and_then(Value::as_str))
        .map(String::from)
}

pub struct DecisionAdapter {
    source: DecisionSource,
}

impl DecisionAdapter {
    pub fn new(source: DecisionSource) -> Self {
        Self { source }
    }

    pub async fn decide(&self, request: DecisionRequest<'_>) -> Decision {
        if request.reasons.is_empty() {
            return Decision::hold("No triggers");
        }
        match self.source.fetch_raw(&request).await {
            Some(raw) => normalize(&raw),
            None => Decision::hold("Decision source unavailable"),
        }
    }
}

/// Strip ```json fences, parse, validate, and coerce — per spec §4.4 steps
/// 1-4. Any failure at any step degrades to `HOLD`, never propagates an
/// error.
pub fn normalize(raw: &str) -> Decision {
    let stripped = strip_code_fences(raw);
    let value: Value = match serde_json::from_str(&stripped) {
        Ok(v) => v,
        Err(_) => return Decision::hold("Unparseable decision response"),
    };

    let action = match value.get("action").and_then(Value::as_str).and_then(Action::from_str_lenient) {
        Some(action) => action,
        None => {
            let error = ValidationError::UnsupportedAction;
            warn!(%error, raw = ?value.get("action"), "degrading to HOLD");
            Action::Hold
        }
    };

    let size_pct = coerce_finite(value.get("size_pct"), "size_pct");
    let stop_atr = coerce_finite(value.get("stop_atr"), "stop_atr");
    let tp_atr = coerce_finite(value.get("tp_atr"), "tp_atr");
    let comment = value
        .get("comment")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let entry = value.get("entry").and_then(|e| {
        let entry_type = match e.get("type").and_then(Value::as_str) {
            Some("market") => EntryType::Market,
            Some("limit") => EntryType::Limit,
            _ => return None,
        };
        Some(EntrySpec { entry_type, offset_bps: coerce_finite(e.get("offset_bps"), "entry.offset_bps") })
    });

    let followups = match value.get("followups") {
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    };

    Decision { action, size_pct, entry, stop_atr, tp_atr, followups, comment }
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

/// Coerce a JSON value into a finite `f64`, logging a [`ValidationError`] and
/// returning `None` when the field is present but non-numeric or non-finite
/// rather than simply absent (spec §7's hook-failure never crashes, it just
/// degrades and surfaces as an error event).
fn coerce_finite(value: Option<&Value>, field: &'static str) -> Option<f64> {
    let value = value?;
    match value.as_f64().filter(|f| f.is_finite()) {
        Some(f) => Some(f),
        None => {
            let error = ValidationError::NonFinite(field);
            warn!(%error, raw = %value, "degrading to None");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_fences_are_stripped() {
        let raw = "```json\n{\"action\":\"HOLD\",\"comment\":\"ok\"}\n```";
        let decision = normalize(raw);
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.comment, "ok");
    }

    #[test]
    fn invalid_json_degrades_to_hold() {
        let decision = normalize("not json at all");
        assert_eq!(decision.action, Action::Hold);
    }

    #[test]
    fn unknown_action_degrades_to_hold() {
        let decision = normalize(r#"{"action":"DETONATE","comment":"x"}"#);
        assert_eq!(decision.action, Action::Hold);
    }

    #[test]
    fn non_finite_numbers_become_none() {
        let decision = normalize(r#"{"action":"OPEN_LONG","size_pct":"NaN","comment":"x"}"#);
        assert_eq!(decision.size_pct, None);
    }

    #[test]
    fn valid_entry_is_parsed() {
        let raw = r#"{"action":"OPEN_LONG","size_pct":25,"entry":{"type":"limit","offset_bps":-5},"comment":"go"}"#;
        let decision = normalize(raw);
        assert_eq!(decision.action, Action::OpenLong);
        assert_eq!(decision.size_pct, Some(25.0));
        let entry = decision.entry.unwrap();
        assert_eq!(entry.entry_type, EntryType::Limit);
        assert_eq!(entry.offset_bps, Some(-5.0));
    }

    #[test]
    fn followups_must_be_string_array() {
        let raw = r#"{"action":"HOLD","followups":["watch 15m"],"comment":"x"}"#;
        let decision = normalize(raw);
        assert_eq!(decision.followups, vec!["watch 15m".to_string()]);

        let raw2 = r#"{"action":"HOLD","followups":"not a list","comment":"x"}"#;
        assert!(normalize(raw2).followups.is_empty());
    }

    #[tokio::test]
    async fn empty_reasons_short_circuits_without_calling_source() {
        let adapter = DecisionAdapter::new(DecisionSource::Mock(|_| {
            panic!("source should not be called when reasons is empty")
        }));
        let snapshot = sample_snapshot();
        let decision = adapter
            .decide(DecisionRequest {
                features: &snapshot,
                reasons: &[],
                meta: json!({}),
                constraints: json!({}),
            })
            .await;
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.comment, "No triggers");
    }

    fn sample_snapshot() -> FeatureSnapshot {
        FeatureSnapshot {
            pair: "DOGE/USD".into(),
            ts_unix_ms: 0,
            timeframes: Default::default(),
            htf_anchors: Default::default(),
            orderbook: Default::default(),
            confluence: Default::default(),
            liquidity: Default::default(),
            regime: crate::model::RegimeSnapshot {
                trend: crate::model::Trend::Neutral,
                volatility: crate::model::Volatility::Normal,
                momentum: crate::model::Momentum::Neutral,
            },
            position: Default::default(),
            risk: Default::default(),
        }
    }
}
