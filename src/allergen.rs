//! Allergen records and the client-side severity estimate shown next to them.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::envelope::record_id;

const HIGH_RISK_NAMES: [&str; 8] = ["peanut", "nut", "shellfish", "fish", "sesame", "milk", "egg", "soy"];
const HIGH_RISK_TERMS: [&str; 9] = [
    "anaphylaxis", "anaphylactic", "severe", "fatal", "death", "emergency", "hospitalization", "respiratory", "breathing",
];
const MEDIUM_RISK_TERMS: [&str; 9] = [
    "reaction", "intolerance", "discomfort", "digestive", "rash", "hives", "swelling", "allergy", "itching",
];
/// Allergens found in more ingredients than this are at least `Medium`.
const WIDESPREAD_INGREDIENT_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.pad(s)
    }
}

/// Estimate severity from the allergen name, its description and how many
/// ingredients carry it. Case-insensitive substring matching.
pub fn assess_severity(name: &str, description: &str, related_ingredients: usize) -> Severity {
    let name = name.to_lowercase();
    let description = description.to_lowercase();
    if HIGH_RISK_NAMES.iter().any(|n| name.contains(n)) || HIGH_RISK_TERMS.iter().any(|t| description.contains(t)) {
        return Severity::High;
    }
    if MEDIUM_RISK_TERMS.iter().any(|t| description.contains(t)) || related_ingredients > WIDESPREAD_INGREDIENT_COUNT {
        return Severity::Medium;
    }
    Severity::Low
}

/// Wire shape as the backend sends it. Field names vary between endpoints and
/// some records carry both spellings; each one is read separately and
/// coalesced in `Allergen::from_raw`. `null` counts as absent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAllergen {
    #[serde(default, rename = "_id")]
    mongo_id: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    allergen_name: Option<String>,
    #[serde(default)]
    related_ingredients: Option<Vec<Value>>,
    #[serde(default)]
    ingredients: Option<Vec<Value>>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    is_system_level: Option<bool>,
}

/// First non-empty string.
fn first_text(candidates: [Option<String>; 2]) -> String {
    candidates.into_iter().flatten().find(|s| !s.is_empty()).unwrap_or_default()
}

/// Ingredient names; populated ingredient records contribute their `name`.
fn ingredient_names(items: Vec<Value>) -> Vec<String> {
    items
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            Value::Object(mut map) => match map.remove("name") {
                Some(Value::String(s)) => Some(s),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Allergen {
    pub id: String,
    pub name: String,
    pub related_ingredients: Vec<String>,
    pub description: String,
    pub severity: Severity,
    pub is_system_level: bool,
}

impl Allergen {
    /// Normalize one raw record. A severity sent by the server wins over the estimate.
    pub fn from_raw(raw: Value) -> Result<Self, serde_json::Error> {
        let r: RawAllergen = serde_json::from_value(raw)?;
        let name = first_text([r.name, r.allergen_name]);
        let description = first_text([r.description, r.desc]);
        let related_ingredients = ingredient_names(
            r.related_ingredients.filter(|v| !v.is_empty()).or(r.ingredients).unwrap_or_default(),
        );
        let severity = r
            .severity
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| assess_severity(&name, &description, related_ingredients.len()));
        Ok(Self {
            id: record_id(r.mongo_id).or_else(|| record_id(r.id)).unwrap_or_default(),
            name,
            related_ingredients,
            description,
            severity,
            is_system_level: r.is_system_level.unwrap_or(false),
        })
    }
}

/// Result of `allergens/check/{ingredient}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngredientCheck {
    #[serde(default)]
    pub ingredient: String,
    #[serde(default)]
    pub allergens: Vec<String>,
}
