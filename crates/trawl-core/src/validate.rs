//! Field-level and business-level rules for canonical records.
//!
//! Errors exclude a record from the batch; warnings are reported but the
//! sanitized record still proceeds.

use chrono::{NaiveDate, Utc};
use serde::Serialize;

use crate::models::CanonicalRecord;
use crate::normalize::clean_text;

/// Maximum character lengths per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLimits {
    pub title: usize,
    pub organization: usize,
    pub description: usize,
    pub location: usize,
    pub skill: usize,
    pub max_skills: usize,
    pub url: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            title: 200,
            organization: 150,
            description: 5000,
            location: 150,
            skill: 50,
            max_skills: 30,
            url: 2048,
        }
    }
}

/// Result of validating one record.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub sanitized: CanonicalRecord,
}

/// A record excluded from its batch, with the reasons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub external_id: String,
    pub errors: Vec<String>,
}

/// Accepted (sanitized) and rejected records of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchValidation {
    pub accepted: Vec<CanonicalRecord>,
    pub rejected: Vec<RejectedRecord>,
    pub warnings: usize,
}

const TECHNICAL_TITLE_WORDS: &[&str] = &[
    "developer",
    "engineer",
    "engineering",
    "programmer",
    "software",
    "backend",
    "back-end",
    "frontend",
    "front-end",
    "full stack",
    "fullstack",
    "devops",
    "data scientist",
    "data science",
    "machine learning",
    "web",
    "android",
    "ios",
];

/// Lowercase words separated by single spaces; punctuation splits words.
fn word_string(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-word match only, so "scenarios" does not count as "ios".
fn is_technical_title(title: &str) -> bool {
    let padded = format!(" {} ", word_string(title));
    TECHNICAL_TITLE_WORDS
        .iter()
        .any(|phrase| padded.contains(&format!(" {} ", word_string(phrase))))
}

/// Truncate to at most `max` chars, never splitting a code point.
fn truncate_chars(value: &mut String, max: usize) -> bool {
    match value.char_indices().nth(max) {
        Some((byte_idx, _)) => {
            value.truncate(byte_idx);
            true
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    limits: FieldLimits,
}

impl Validator {
    pub fn new(limits: FieldLimits) -> Self {
        Self { limits }
    }

    pub fn validate(&self, record: &CanonicalRecord) -> ValidationOutcome {
        self.validate_at(record, Utc::now().date_naive())
    }

    /// Validate with an explicit `today` for the future-date check.
    pub fn validate_at(&self, record: &CanonicalRecord, today: NaiveDate) -> ValidationOutcome {
        let limits = &self.limits;
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut s = record.clone();

        s.title = clean_text(&s.title);
        s.organization = clean_text(&s.organization);
        s.location = clean_text(&s.location);
        s.description = s.description.trim().to_string();
        s.application_url = s.application_url.trim().to_string();
        s.source = s.source.trim().to_string();
        s.external_id = s.external_id.trim().to_string();

        for (field, value) in [
            ("title", &s.title),
            ("organization", &s.organization),
            ("source", &s.source),
            ("external_id", &s.external_id),
            ("application_url", &s.application_url),
        ] {
            if value.is_empty() {
                errors.push(format!("{field}: required field is empty"));
            }
        }

        for (field, value, max) in [
            ("title", &mut s.title, limits.title),
            ("organization", &mut s.organization, limits.organization),
            ("description", &mut s.description, limits.description),
            ("location", &mut s.location, limits.location),
        ] {
            if truncate_chars(value, max) {
                warnings.push(format!("{field}: truncated to {max} characters"));
            }
        }

        if truncate_chars(&mut s.application_url, limits.url) {
            warnings.push(format!("application_url: truncated to {} characters", limits.url));
        }
        if !s.application_url.is_empty() {
            match url::Url::parse(&s.application_url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => errors.push(format!(
                    "application_url: unsupported scheme '{}'",
                    parsed.scheme()
                )),
                Err(e) => errors.push(format!("application_url: {e}")),
            }
        }

        let mut skills: Vec<String> = Vec::with_capacity(s.skills.len());
        for skill in s.skills.drain(..) {
            let mut skill = clean_text(&skill);
            if skill.is_empty() {
                continue;
            }
            if truncate_chars(&mut skill, limits.skill) {
                warnings.push(format!("skills: '{skill}' truncated to {} characters", limits.skill));
            }
            // Truncation can make two skills equal; keep the first.
            if !skills.iter().any(|kept| kept.eq_ignore_ascii_case(&skill)) {
                skills.push(skill);
            }
        }
        if skills.len() > limits.max_skills {
            warnings.push(format!(
                "skills: {} skills, keeping the first {}",
                skills.len(),
                limits.max_skills
            ));
            skills.truncate(limits.max_skills);
        }
        s.skills = skills;

        if let Some(amount) = s.compensation
            && amount < 0
        {
            errors.push(format!("compensation: must be non-negative, got {amount}"));
        }
        if let Some(months) = s.duration_months
            && !(1..=24).contains(&months)
        {
            errors.push(format!("duration_months: must be within 1..=24, got {months}"));
        }

        if let (Some(posted), Some(deadline)) = (s.posted_date, s.deadline)
            && posted > deadline
        {
            errors.push(format!(
                "posted_date: {posted} is after deadline {deadline}"
            ));
        }
        if let Some(posted) = s.posted_date
            && posted > today
        {
            warnings.push(format!("posted_date: {posted} is in the future"));
        }
        if !s.title.is_empty() && s.title.eq_ignore_ascii_case(&s.organization) {
            warnings.push("title: identical to organization name".to_string());
        }
        if s.skills.is_empty() && is_technical_title(&s.title) {
            warnings.push("skills: technical title lists no required skills".to_string());
        }

        ValidationOutcome {
            valid: errors.is_empty(),
            errors,
            warnings,
            sanitized: s,
        }
    }

    /// Split a batch into sanitized accepted records and rejections.
    pub fn validate_batch(&self, records: &[CanonicalRecord]) -> BatchValidation {
        let today = Utc::now().date_naive();
        let mut batch = BatchValidation::default();

        for record in records {
            let outcome = self.validate_at(record, today);
            batch.warnings += outcome.warnings.len();
            for warning in &outcome.warnings {
                tracing::debug!(key = %record.natural_key(), warning = %warning, "Validation warning");
            }
            if outcome.valid {
                batch.accepted.push(outcome.sanitized);
            } else {
                batch.rejected.push(RejectedRecord {
                    external_id: record.external_id.clone(),
                    errors: outcome.errors,
                });
            }
        }
        batch
    }
}
