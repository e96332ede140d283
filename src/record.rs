//! The structured form of a unit produced by the parse stage.
//!
//! Deserialisation is deliberately forgiving. Generators return years as
//! numbers or strings, omit empty collections, or emit `null` in place of a
//! list; all of these map onto the same record. An individual sub-entity that
//! does not deserialise is dropped rather than failing the whole record.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parsed biography of one subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiographyRecord {
    #[serde(default, deserialize_with = "loose_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub birthdate: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub deathdate: Option<String>,
    #[serde(default, deserialize_with = "lenient_items")]
    pub degrees: Vec<Degree>,
    #[serde(default, deserialize_with = "lenient_items")]
    pub employment: Vec<Employment>,
    #[serde(default, deserialize_with = "lenient_items")]
    pub visits: Vec<Visit>,
    #[serde(default, deserialize_with = "lenient_items")]
    pub honors: Vec<Honor>,
    #[serde(default, deserialize_with = "lenient_items")]
    pub parents: Vec<Parent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Degree {
    #[serde(default, deserialize_with = "loose_text")]
    pub degree_institution_name: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub degree_type: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub degree_year: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub degree_advisor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Employment {
    #[serde(default, deserialize_with = "loose_text")]
    pub employer: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub job_title: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub job_year_begin: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub job_year_end: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub reason_end: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    #[serde(default, deserialize_with = "loose_text")]
    pub visit_location: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub visit_reason: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub visit_year: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Honor {
    #[serde(default, deserialize_with = "loose_text")]
    pub honor_name: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub honor_year: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parent {
    #[serde(default, deserialize_with = "loose_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub birthdate: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub deathdate: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub profession: Option<String>,
}

impl BiographyRecord {
    /// Build a record from an already-parsed JSON value.
    ///
    /// The value must be an object; anything else is not a biography.
    pub fn from_value(value: Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err(format!("expected a JSON object, got {}", json_kind(&value)));
        }
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    /// Parse and validate a stored record payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, String> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        Self::from_value(value)
    }

    /// Total number of sub-entities across all collections.
    pub fn sub_entity_count(&self) -> usize {
        self.degrees.len()
            + self.employment.len()
            + self.visits.len()
            + self.honors.len()
            + self.parents.len()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Accept strings, numbers and booleans as text; blank strings become `None`.
fn loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Accept a list, a single object, or `null`; skip items that fail to deserialise.
fn lenient_items<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        Some(v @ Value::Object(_)) => serde_json::from_value(v).ok().into_iter().collect(),
        _ => Vec::new(),
    })
}
