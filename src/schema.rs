//! Domain types for contacts, comparisons, source documents and model records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Generate a prefixed identifier, e.g. `cmp_3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

// ============================================================================
// Contacts
// ============================================================================

/// A broker's client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Contact {
    pub fn new(user_id: &str, input: NewContact) -> Self {
        Self {
            id: new_id("ctc"),
            user_id: user_id.to_string(),
            name: input.name,
            email: input.email,
            phone: input.phone,
            company: input.company,
            notes: input.notes,
            created_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, patch: ContactPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if patch.email.is_some() {
            self.email = patch.email;
        }
        if patch.phone.is_some() {
            self.phone = patch.phone;
        }
        if patch.company.is_some() {
            self.company = patch.company;
        }
        if patch.notes.is_some() {
            self.notes = patch.notes;
        }
    }
}

// ============================================================================
// Comparisons
// ============================================================================

/// The unit of work: two or more competing quotes for one contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub id: String,
    pub user_id: String,
    pub contact_id: String,
    pub title: String,
    pub insurance_type: Option<String>,
    #[serde(flatten)]
    pub state: ComparisonStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComparison {
    pub contact_id: String,
    pub title: String,
    #[serde(default)]
    pub insurance_type: Option<String>,
}

impl Comparison {
    pub fn new(user_id: &str, input: NewComparison) -> Self {
        Self {
            id: new_id("cmp"),
            user_id: user_id.to_string(),
            contact_id: input.contact_id,
            title: input.title,
            insurance_type: input.insurance_type,
            state: ComparisonStatus::Uploading,
            created_at: Utc::now(),
        }
    }

    pub fn result(&self) -> Option<&ComparisonResult> {
        match &self.state {
            ComparisonStatus::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Apply a status write, enforcing the lifecycle.
    pub fn apply_status(&mut self, update: StatusUpdate) -> Result<(), (StatusKind, StatusKind)> {
        let from = self.state.kind();
        let to = update.kind();
        if !from.can_transition_to(to) {
            return Err((from, to));
        }
        self.state = match update {
            StatusUpdate::Processing => ComparisonStatus::Processing {
                started_at: Utc::now(),
            },
            StatusUpdate::Failed { error } => ComparisonStatus::Failed {
                error,
                failed_at: Utc::now(),
            },
        };
        Ok(())
    }

    /// Attach the result and complete the comparison in one step.
    pub fn complete(&mut self, result: ComparisonResult) -> Result<(), (StatusKind, StatusKind)> {
        let from = self.state.kind();
        if !from.can_transition_to(StatusKind::Completed) {
            return Err((from, StatusKind::Completed));
        }
        self.state = ComparisonStatus::Completed {
            result,
            completed_at: Utc::now(),
        };
        Ok(())
    }
}

/// Lifecycle state. Only `Completed` carries a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ComparisonStatus {
    Uploading,
    Processing {
        started_at: DateTime<Utc>,
    },
    Completed {
        result: ComparisonResult,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl ComparisonStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Uploading => StatusKind::Uploading,
            Self::Processing { .. } => StatusKind::Processing,
            Self::Completed { .. } => StatusKind::Completed,
            Self::Failed { .. } => StatusKind::Failed,
        }
    }
}

/// Payload-free status tag, used for transition checks and storage rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `uploading -> processing -> completed`, with `failed` reachable from
    /// either non-terminal state.
    pub fn can_transition_to(self, next: StatusKind) -> bool {
        matches!(
            (self, next),
            (Self::Uploading, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Uploading, Self::Failed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status writes other than completion, which goes through `store_result`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Processing,
    Failed { error: String },
}

impl StatusUpdate {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Processing => StatusKind::Processing,
            Self::Failed { .. } => StatusKind::Failed,
        }
    }
}

// ============================================================================
// Source documents
// ============================================================================

/// One uploaded quote file. Immutable once added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub id: String,
    pub comparison_id: String,
    pub file_name: String,
    pub storage_ref: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub page_count: Option<u32>,
    pub uploaded_at: DateTime<Utc>,
}

/// Stored document bytes.
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub mime_type: String,
}

// ============================================================================
// Model records
// ============================================================================

/// Per-document extraction output. Lives only for the duration of one run.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedQuote {
    pub file_name: String,
    pub data: QuoteData,
}

/// Structured fields the extraction prompt asks for. Every field tolerates
/// `null` and loosely-typed values; unknown keys are kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuoteData {
    #[serde(default, deserialize_with = "lenient::text")]
    pub insurer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium: Option<Premium>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub cover_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub basis_of_indemnity: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub third_party_liability: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub passenger_liability: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub sasria: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub territorial_limits: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub legal_cover: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub personal_accident: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub roadside_assistance: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub loss_of_use: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub credit_shortfall: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excess: Option<Excess>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub special_conditions: Vec<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub inclusions: Vec<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub exclusions: Vec<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub insured_item: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub policy_number: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub additional_notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuoteData {
    /// Keys with a nested structure. Any other shape stays in `extra` as-is.
    const NESTED: [&'static str; 2] = ["premium", "excess"];

    /// Build from a parsed model object. A scalar `premium` or `excess`
    /// (e.g. `"R450 per month"`) is kept verbatim in `extra`.
    pub fn from_model_output(value: Value) -> Result<Self, serde_json::Error> {
        let mut map = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut raw = Map::new();
        for key in Self::NESTED {
            if let Some(v) = map.remove(key) {
                match v {
                    Value::Object(_) | Value::Null => {
                        map.insert(key.to_string(), v);
                    }
                    other => {
                        raw.insert(key.to_string(), other);
                    }
                }
            }
        }

        let mut data: Self = serde_json::from_value(Value::Object(map))?;
        data.extra.extend(raw);
        Ok(data)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Premium {
    #[serde(default, deserialize_with = "lenient::amount")]
    pub monthly: Option<f64>,
    #[serde(default, deserialize_with = "lenient::amount")]
    pub annual: Option<f64>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Excess {
    #[serde(default, rename = "type", deserialize_with = "lenient::text")]
    pub excess_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub accident: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub theft: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub third_party: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub windscreen: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub acts_of_nature: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub other_excesses: Vec<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub notes: Option<String>,
}

/// Final comparison attached to a completed comparison. Never rewritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub summary: String,
    pub premium_comparison: Value,
    pub cover_comparison: Value,
    pub excess_comparison: Value,
    pub conditions_differences: Value,
    pub recommendation: String,
    pub email_draft: String,
}

impl ComparisonResult {
    /// Build from a parsed model object. Missing or mistyped top-level fields
    /// fall back to `""` for text and `{}` for sections.
    pub fn from_model_output(value: Value) -> Self {
        let mut map = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut text = |key: &str| match map.remove(key) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let summary = text("summary");
        let recommendation = text("recommendation");
        let email_draft = text("emailDraft");

        let mut section = |key: &str| match map.remove(key) {
            Some(v @ (Value::Object(_) | Value::Array(_))) => v,
            _ => Value::Object(Map::new()),
        };

        Self {
            summary,
            premium_comparison: section("premiumComparison"),
            cover_comparison: section("coverComparison"),
            excess_comparison: section("excessComparison"),
            conditions_differences: section("conditionsDifferences"),
            recommendation,
            email_draft,
        }
    }
}

/// Deserializers for model output that is only loosely typed.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn value_to_text(value: Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(value_to_text(Value::deserialize(d)?))
    }

    pub fn list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.into_iter().filter_map(value_to_text).collect(),
            other => value_to_text(other).into_iter().collect(),
        })
    }

    /// Numbers, or strings like `"R 1,234.50"`. Anything else is `None`.
    pub fn amount<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => {
                let digits: String = s
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                    .collect();
                digits.parse().ok()
            }
            _ => None,
        })
    }
}
