use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Source-specific record as returned by a [`crate::traits::SourceAdapter`].
///
/// `fields` is whatever the adapter extracted; only the normalizer registered
/// for the same source knows how to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: String,
    pub external_id: Option<String>,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(source: impl Into<String>, external_id: Option<String>) -> Self {
        Self {
            source: source.into(),
            external_id,
            fields: serde_json::Map::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Read a field as text. Numbers and booleans are stringified; arrays
    /// are joined with commas.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| match v {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            other => Some(other.to_string()),
        }
    }

    /// Read a field as a list of strings. A plain string is returned as a
    /// single element.
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

/// Where the work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    #[default]
    Office,
    Remote,
    Hybrid,
}

impl WorkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkMode::Office => "office",
            WorkMode::Remote => "remote",
            WorkMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "office" => Ok(WorkMode::Office),
            "remote" => Ok(WorkMode::Remote),
            "hybrid" => Ok(WorkMode::Hybrid),
            _ => Err(format!("Unknown work mode: {s}")),
        }
    }
}

/// (source, external id): the identity of a listing across time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub source: String,
    pub external_id: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// The normalized, source-agnostic listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub title: String,
    pub organization: String,
    pub description: String,
    pub location: String,
    pub compensation: Option<i64>,
    pub duration_months: Option<i32>,
    pub work_mode: WorkMode,
    pub skills: Vec<String>,
    pub application_url: String,
    pub source: String,
    pub external_id: String,
    pub posted_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub active: bool,
}

impl CanonicalRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            source: self.source.clone(),
            external_id: self.external_id.clone(),
        }
    }

    /// Compare the mutable fields. Skill order is not significant.
    pub fn differs_from(&self, other: &CanonicalRecord) -> bool {
        self.title != other.title
            || self.organization != other.organization
            || self.description != other.description
            || self.location != other.location
            || self.compensation != other.compensation
            || self.duration_months != other.duration_months
            || self.work_mode != other.work_mode
            || self.application_url != other.application_url
            || self.posted_date != other.posted_date
            || self.deadline != other.deadline
            || sorted_skills(&self.skills) != sorted_skills(&other.skills)
    }

    /// SHA-256 over the mutable fields, stable under skill reordering.
    pub fn content_hash(&self) -> String {
        let fingerprint = serde_json::json!([
            self.title,
            self.organization,
            self.description,
            self.location,
            self.compensation,
            self.duration_months,
            self.work_mode,
            self.application_url,
            self.posted_date,
            self.deadline,
            sorted_skills(&self.skills),
        ]);
        compute_hash(&fingerprint.to_string())
    }
}

fn sorted_skills(skills: &[String]) -> Vec<String> {
    let mut sorted: Vec<String> = skills.to_vec();
    sorted.sort();
    sorted
}

/// A persisted listing row.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub id: Uuid,
    pub record: CanonicalRecord,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Updated,
}

/// Emitted by the store for every inserted or materially changed listing.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub listing_id: Uuid,
    pub kind: ChangeKind,
    pub record: CanonicalRecord,
}

/// Outcome of a batch upsert.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertReport {
    pub inserted: u32,
    pub updated: u32,
    pub skipped: u32,
    #[serde(skip)]
    pub changes: Vec<ChangeEvent>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
