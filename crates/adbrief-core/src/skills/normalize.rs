//! Field normalizers applied while deserializing skill payloads.
//!
//! Agents are loose about shapes: lists arrive as arrays of objects, short
//! text arrives as nested objects and confidence arrives as a number on
//! either a 0-1 or a 0-100 scale.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Keys tried, in order, when reducing a list item object to one string.
const LABEL_KEYS: &[&str] = &["name", "title", "label", "headline", "text", "value"];
const DETAIL_KEYS: &[&str] = &["description", "detail", "rationale", "summary"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Maps a score in `[0, 1]` (or `[0, 100]` when above 1) to a label.
    pub fn from_score(score: f64) -> Option<Self> {
        if !score.is_finite() || score < 0.0 {
            return None;
        }
        let fraction = if score > 1.0 {
            (score / 100.0).min(1.0)
        } else {
            score
        };
        Some(if fraction < 0.4 {
            Confidence::Low
        } else if fraction < 0.7 {
            Confidence::Medium
        } else {
            Confidence::High
        })
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().and_then(Self::from_score),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "low" => Some(Confidence::Low),
                "medium" | "moderate" => Some(Confidence::Medium),
                "high" => Some(Confidence::High),
                other => other
                    .trim_end_matches('%')
                    .parse::<f64>()
                    .ok()
                    .and_then(Self::from_score),
            },
            _ => None,
        }
    }
}

/// Flattens any JSON value into display text.
pub fn flatten_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) => items
            .iter()
            .map(flatten_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, value)| {
                let text = flatten_text(value);
                (!text.is_empty()).then(|| format!("{key}: {text}"))
            })
            .collect::<Vec<_>>()
            .join("; "),
    }
}

/// Reduces a value to a list of strings.
///
/// Object items become `"<label>: <detail>"` when they carry recognizable
/// keys and are flattened otherwise. A bare string becomes a single item.
pub fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .map(list_item)
            .filter(|s| !s.is_empty())
            .collect(),
        other => {
            let text = list_item(other);
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text]
            }
        }
    }
}

fn list_item(value: &Value) -> String {
    let Value::Object(map) = value else {
        return flatten_text(value);
    };
    let pick = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| map.get(*key))
            .map(flatten_text)
            .find(|s| !s.is_empty())
    };
    match (pick(LABEL_KEYS), pick(DETAIL_KEYS)) {
        (Some(label), Some(detail)) => format!("{label}: {detail}"),
        (Some(label), None) => label,
        (None, Some(detail)) => detail,
        (None, None) => flatten_text(value),
    }
}

pub(crate) fn de_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(flatten_text(&Value::deserialize(deserializer)?))
}

pub(crate) fn de_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.map(|value| flatten_text(&value)))
}

pub(crate) fn de_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(string_list(&Value::deserialize(deserializer)?))
}

pub(crate) fn de_opt_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.map(|value| string_list(&value)))
}

pub(crate) fn de_confidence<'de, D>(deserializer: D) -> Result<Option<Confidence>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(Confidence::from_value))
}
