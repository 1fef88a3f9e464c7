//! In-batch duplicate detection.
//!
//! Exact duplicates (same lower-cased title, organization and location)
//! collapse to the first occurrence. Near duplicates are only scored and
//! reported; nothing is merged on similarity.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::CanonicalRecord;

/// Unique records plus the ones dropped as exact duplicates.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub unique: Vec<CanonicalRecord>,
    pub duplicates: Vec<CanonicalRecord>,
}

/// A scored pair of records, by external id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarPair {
    pub first: String,
    pub second: String,
    pub score: f64,
}

fn dedup_key(record: &CanonicalRecord) -> (String, String, String) {
    (
        record.title.trim().to_lowercase(),
        record.organization.trim().to_lowercase(),
        record.location.trim().to_lowercase(),
    )
}

/// Drop later records whose (title, organization, location) was already seen.
pub fn dedupe_batch(records: Vec<CanonicalRecord>) -> DedupOutcome {
    let mut seen = HashSet::new();
    let mut outcome = DedupOutcome::default();
    for record in records {
        if seen.insert(dedup_key(&record)) {
            outcome.unique.push(record);
        } else {
            outcome.duplicates.push(record);
        }
    }
    outcome
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard index of two token sets; two empty sets count as identical.
fn jaccard(a: &str, b: &str) -> f64 {
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

fn description_head(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Weighted similarity in [0, 1]: 0.4 title, 0.3 organization,
/// 0.2 location, 0.1 first 200 chars of description.
pub fn similarity(a: &CanonicalRecord, b: &CanonicalRecord) -> f64 {
    0.4 * jaccard(&a.title, &b.title)
        + 0.3 * jaccard(&a.organization, &b.organization)
        + 0.2 * jaccard(&a.location, &b.location)
        + 0.1 * jaccard(&description_head(&a.description), &description_head(&b.description))
}

/// Every pair scoring at least `min_score`, highest first.
pub fn similar_pairs(records: &[CanonicalRecord], min_score: f64) -> Vec<SimilarPair> {
    let mut pairs = Vec::new();
    for (i, a) in records.iter().enumerate() {
        for b in &records[i + 1..] {
            let score = similarity(a, b);
            if score >= min_score {
                pairs.push(SimilarPair {
                    first: a.external_id.clone(),
                    second: b.external_id.clone(),
                    score,
                });
            }
        }
    }
    pairs.sort_by(|x, y| y.score.total_cmp(&x.score));
    pairs
}
