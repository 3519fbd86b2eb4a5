//! Normalization of loosely-typed step definitions into canonical [`Step`]s.
//!
//! Older sequence payloads use several spellings for the same field
//! (`delay_days`, `delayDays`, `delay`; `body`, `content`, `body_template`).
//! They are accepted here once, at load time, so the dispatch path only ever
//! sees [`Step`].

use crate::error::{CadenceError, CadenceResult};
use crate::types::Step;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

const DELAY_KEYS: &[&str] = &["delay_days", "delayDays", "delay"];
const SUBJECT_KEYS: &[&str] = &["subject", "subject_template", "subjectTemplate"];
const BODY_KEYS: &[&str] = &["body", "body_template", "bodyTemplate", "content"];

/// Wire shape of a sequence definition before normalization.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RawSequence {
    pub name: String,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub steps: Value,
    #[serde(default = "default_true", alias = "isActive")]
    pub is_active: bool,
    #[serde(default, alias = "isOnboarding")]
    pub is_onboarding: bool,
}

fn default_true() -> bool {
    true
}

fn first_field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn parse_delay(value: &Value, position: usize) -> CadenceResult<u32> {
    let days = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        CadenceError::InvalidStep(format!("step {position}: delay is not a number: {value}"))
    })?;

    u32::try_from(days).map_err(|_| {
        CadenceError::InvalidStep(format!("step {position}: delay must be non-negative, got {days}"))
    })
}

fn text_field(
    obj: &serde_json::Map<String, Value>,
    keys: &[&str],
    position: usize,
    what: &str,
) -> CadenceResult<String> {
    match first_field(obj, keys) {
        Some(Value::String(s)) => Ok(s.clone()),
        None => Err(CadenceError::InvalidStep(format!(
            "step {position}: missing {what}"
        ))),
        Some(other) => Ok(other.to_string()),
    }
}

/// Convert a JSON step list into canonical steps, indexed by position.
///
/// A missing delay is accepted only on the first step (which always fires at
/// enrollment); everywhere else it is a configuration error.
pub fn normalize_steps(raw: &Value) -> CadenceResult<Vec<Step>> {
    let items = match raw {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        Value::String(s) => {
            // Some stores persisted the list as a JSON string.
            let parsed: Value = serde_json::from_str(s)?;
            return normalize_steps(&parsed);
        }
        other => {
            return Err(CadenceError::InvalidStep(format!(
                "steps must be a list, got {other}"
            )))
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(position, item)| {
            let obj = item.as_object().ok_or_else(|| {
                CadenceError::InvalidStep(format!("step {position}: expected an object"))
            })?;

            let delay_days = match first_field(obj, DELAY_KEYS) {
                Some(v) => parse_delay(v, position)?,
                None if position == 0 => 0,
                None => {
                    return Err(CadenceError::InvalidStep(format!(
                        "step {position}: missing delay_days"
                    )))
                }
            };

            Ok(Step {
                index: position as u32,
                delay_days,
                subject: text_field(obj, SUBJECT_KEYS, position, "subject")?,
                body: text_field(obj, BODY_KEYS, position, "body")?,
            })
        })
        .collect()
}

/// Check an already-canonical step list for internal consistency.
pub fn validate_steps(steps: &[Step]) -> CadenceResult<()> {
    for (position, step) in steps.iter().enumerate() {
        if step.index as usize != position {
            return Err(CadenceError::InvalidStep(format!(
                "step at position {position} carries index {}",
                step.index
            )));
        }
    }
    Ok(())
}
