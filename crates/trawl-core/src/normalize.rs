//! Raw record → canonical record mapping.
//!
//! The helpers here are pure and deterministic; the only clock dependency
//! (relative posted dates) takes `today` as a parameter.

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::Deserialize;

use crate::models::{CanonicalRecord, RawRecord, WorkMode, compute_hash};

/// Maps one source's raw record shape into a [`CanonicalRecord`].
pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: &RawRecord) -> CanonicalRecord;
}

/// Raw field names for each canonical field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub external_id: String,
    pub title: String,
    pub organization: String,
    pub description: String,
    pub location: String,
    pub compensation: String,
    pub duration: String,
    pub workplace_type: String,
    pub skills: String,
    pub application_url: String,
    pub posted: String,
    pub deadline: String,
}

impl FieldMap {
    /// Field names produced by the CSS-selector extractor.
    pub fn html_listing() -> Self {
        Self {
            external_id: "id".into(),
            title: "title".into(),
            organization: "company".into(),
            description: "description".into(),
            location: "location".into(),
            compensation: "stipend".into(),
            duration: "duration".into(),
            workplace_type: "work_type".into(),
            skills: "skills".into(),
            application_url: "apply_url".into(),
            posted: "posted".into(),
            deadline: "deadline".into(),
        }
    }

    /// Field names of the job-board JSON API payload.
    pub fn api_listing() -> Self {
        Self {
            external_id: "id".into(),
            title: "positionTitle".into(),
            organization: "companyName".into(),
            description: "descriptionText".into(),
            location: "formattedLocation".into(),
            compensation: "salary".into(),
            duration: "duration".into(),
            workplace_type: "workplaceType".into(),
            skills: "skills".into(),
            application_url: "applyUrl".into(),
            posted: "listedAt".into(),
            deadline: "expireAt".into(),
        }
    }
}

impl Default for FieldMap {
    fn default() -> Self {
        Self::html_listing()
    }
}

/// Table-driven normalizer: reads fields named by a [`FieldMap`].
#[derive(Debug, Clone, Default)]
pub struct FieldMapNormalizer {
    map: FieldMap,
}

impl FieldMapNormalizer {
    pub fn new(map: FieldMap) -> Self {
        Self { map }
    }

    pub fn normalize_at(&self, raw: &RawRecord, today: NaiveDate) -> CanonicalRecord {
        let m = &self.map;
        let text = |key: &str| raw.text(key).map(|s| clean_text(&s)).unwrap_or_default();

        let application_url = text(&m.application_url);
        let external_id = raw
            .external_id
            .clone()
            .or_else(|| raw.text(&m.external_id))
            .map(|s| clean_text(&s))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                // Listings without an id are keyed by their application URL.
                if application_url.is_empty() {
                    String::new()
                } else {
                    compute_hash(&application_url)[..16].to_string()
                }
            });

        let location = text(&m.location);
        let workplace_type = raw.text(&m.workplace_type);

        let mut skill_items = raw.list(&m.skills);
        if skill_items.is_empty()
            && let Some(joined) = raw.text(&m.skills)
        {
            skill_items.push(joined);
        }

        CanonicalRecord {
            title: text(&m.title),
            organization: text(&m.organization),
            description: text(&m.description),
            work_mode: classify_work_mode(&location, workplace_type.as_deref()),
            location,
            compensation: raw
                .text(&m.compensation)
                .and_then(|s| parse_compensation(&s)),
            duration_months: raw
                .text(&m.duration)
                .and_then(|s| parse_duration_months(&s)),
            skills: canonicalize_skills(&skill_items),
            application_url,
            source: raw.source.clone(),
            external_id,
            posted_date: raw
                .text(&m.posted)
                .and_then(|s| parse_posted_date(&s, today)),
            deadline: raw.text(&m.deadline).and_then(|s| parse_absolute_date(&s)),
            active: true,
        }
    }
}

impl Normalizer for FieldMapNormalizer {
    fn normalize(&self, raw: &RawRecord) -> CanonicalRecord {
        self.normalize_at(raw, Utc::now().date_naive())
    }
}

/// Trim and collapse internal whitespace runs to a single space.
pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A number found in free text, with its `k`/`lakh` multiplier.
#[derive(Debug, Clone, Copy)]
struct Amount {
    value: f64,
    multiplier: f64,
}

/// Scan `text` for numbers such as `20,000`, `1.5k`, `3 lakh`.
fn scan_amounts(text: &str) -> Vec<Amount> {
    let chars: Vec<char> = text.chars().collect();
    let mut amounts = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let mut digits = String::new();
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == ',' || chars[i] == '.') {
            if chars[i] != ',' {
                digits.push(chars[i]);
            }
            i += 1;
        }
        let digits = digits.trim_end_matches('.');
        let Ok(value) = digits.parse::<f64>() else {
            continue;
        };

        let rest: String = chars[i..].iter().collect::<String>();
        let rest = rest.trim_start().to_lowercase();
        let multiplier = if rest.starts_with("lakh") || rest.starts_with("lac") {
            100_000.0
        } else if rest.starts_with('k') && !rest[1..].starts_with(|c: char| c.is_alphabetic()) {
            1_000.0
        } else {
            1.0
        };
        amounts.push(Amount { value, multiplier });
    }
    amounts
}

/// Free-text compensation to an integer amount.
///
/// Supports currency symbols and thousands separators, a `k` suffix,
/// ranges (the lower bound wins), and "unpaid". Unparseable → `None`.
pub fn parse_compensation(text: &str) -> Option<i64> {
    let lower = clean_text(text).to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower.contains("unpaid") || lower.contains("no stipend") || lower == "none" {
        return Some(0);
    }

    let amounts = scan_amounts(&lower);
    let first = amounts.first()?;
    let mut multiplier = first.multiplier;
    // "10-15k": the suffix on the upper bound applies to both.
    if multiplier == 1.0
        && first.value < 1_000.0
        && let Some(second) = amounts.get(1)
    {
        multiplier = second.multiplier;
    }
    Some((first.value * multiplier).round() as i64)
}

fn word_number(word: &str) -> Option<f64> {
    let n = match word {
        "a" | "an" | "one" => 1.0,
        "two" => 2.0,
        "three" => 3.0,
        "four" => 4.0,
        "five" => 5.0,
        "six" => 6.0,
        "seven" => 7.0,
        "eight" => 8.0,
        "nine" => 9.0,
        "ten" => 10.0,
        "eleven" => 11.0,
        "twelve" => 12.0,
        "half" => 0.5,
        _ => return None,
    };
    Some(n)
}

/// First `<number> <unit>` pair in `text`, e.g. `("3", "months")`.
fn quantity_with_unit(text: &str) -> Option<(f64, String)> {
    let normalized = text.replace(['(', ')', ',', '+'], " ").replace('-', " ");
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    for (idx, token) in tokens.iter().enumerate() {
        // "3months" / "2wks"
        let split_at = token
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(token.len());
        let (num, unit_suffix) = token.split_at(split_at);

        let value = if !num.is_empty() {
            num.parse::<f64>().ok()
        } else {
            word_number(token)
        };
        let Some(value) = value else {
            continue;
        };

        let unit = if !unit_suffix.is_empty() {
            unit_suffix.to_string()
        } else if let Some(next) = tokens.get(idx + 1) {
            // "half a year"
            if *next == "a" || *next == "an" {
                tokens.get(idx + 2).map(|s| s.to_string()).unwrap_or_default()
            } else {
                next.to_string()
            }
        } else {
            continue;
        };
        return Some((value, unit));
    }
    None
}

/// Free-text duration to whole months.
///
/// "N months" → N, "N weeks" → round(N / 4.33), "N years" → 12·N, plus
/// word numbers ("six months"). Unrecognised → `None`.
pub fn parse_duration_months(text: &str) -> Option<i32> {
    let lower = clean_text(text).to_lowercase();
    if lower.is_empty() {
        return None;
    }
    let (value, unit) = quantity_with_unit(&lower)?;

    let months = if unit.starts_with("month") || unit == "mo" || unit == "mos" {
        value
    } else if unit.starts_with("week") || unit.starts_with("wk") {
        value / 4.33
    } else if unit.starts_with("year") || unit.starts_with("yr") {
        value * 12.0
    } else if unit.starts_with("day") {
        value / 30.0
    } else {
        return None;
    };
    Some(months.round() as i32)
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d %b' %y",
    "%d/%m/%Y",
    "%Y/%m/%d",
];

/// Parse an absolute date in one of the common listing formats.
pub fn parse_absolute_date(text: &str) -> Option<NaiveDate> {
    let cleaned = clean_text(text);
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&cleaned) {
        return Some(dt.date_naive());
    }
    // Epoch milliseconds, as job-board APIs like to send.
    if cleaned.len() >= 12
        && let Ok(millis) = cleaned.parse::<i64>()
    {
        return DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}

/// Drop a leading "Posted", "Posted:" or "Posted on" label.
fn strip_posted_label(text: &str) -> &str {
    let rest = match text.get(..6) {
        Some(head) if head.eq_ignore_ascii_case("posted") => &text[6..],
        _ => return text,
    };
    let rest = rest.trim_start().trim_start_matches(':').trim_start();
    match rest.get(..3) {
        Some(head) if head.eq_ignore_ascii_case("on ") => rest[3..].trim_start(),
        _ => rest,
    }
}

/// Relative or absolute posted date.
///
/// "today", "just now", "N hours ago" → `today`; "yesterday" → `today - 1`;
/// "N days/weeks/months ago" → subtracted; otherwise an absolute parse.
/// Offsets too large for the calendar yield `None`.
pub fn parse_posted_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let cleaned = clean_text(text);
    let unlabeled = strip_posted_label(&cleaned);
    if unlabeled.is_empty() {
        return None;
    }
    let lower = unlabeled.to_lowercase();

    if lower == "today" || lower == "just now" || lower.starts_with("few ") {
        return Some(today);
    }
    if lower == "yesterday" {
        return today.checked_sub_days(Days::new(1));
    }
    if lower.ends_with("ago") {
        let (value, unit) = quantity_with_unit(&lower)?;
        let n = value.max(0.0).round() as u64;
        return if unit.starts_with("second")
            || unit.starts_with("minute")
            || unit.starts_with("min")
            || unit.starts_with("hour")
            || unit.starts_with("hr")
        {
            Some(today)
        } else if unit.starts_with("day") {
            today.checked_sub_days(Days::new(n))
        } else if unit.starts_with("week") {
            n.checked_mul(7)
                .and_then(|days| today.checked_sub_days(Days::new(days)))
        } else if unit.starts_with("month") {
            u32::try_from(n)
                .ok()
                .and_then(|months| today.checked_sub_months(Months::new(months)))
        } else {
            None
        };
    }
    parse_absolute_date(unlabeled)
}

fn canonical_skill(lower: &str) -> Option<&'static str> {
    let name = match lower {
        "js" | "javascript" | "java script" | "es6" => "JavaScript",
        "ts" | "typescript" => "TypeScript",
        "py" | "python" | "python3" => "Python",
        "k8s" | "kubernetes" => "Kubernetes",
        "react" | "reactjs" | "react.js" => "React",
        "node" | "nodejs" | "node.js" => "Node.js",
        "vue" | "vuejs" | "vue.js" => "Vue.js",
        "angular" | "angularjs" => "Angular",
        "next" | "nextjs" | "next.js" => "Next.js",
        "go" | "golang" => "Go",
        "rust" => "Rust",
        "java" => "Java",
        "c++" | "cpp" => "C++",
        "c#" | "csharp" => "C#",
        "sql" => "SQL",
        "postgres" | "postgresql" => "PostgreSQL",
        "mysql" => "MySQL",
        "mongo" | "mongodb" => "MongoDB",
        "html" | "html5" => "HTML",
        "css" | "css3" => "CSS",
        "aws" | "amazon web services" => "AWS",
        "gcp" | "google cloud" => "GCP",
        "docker" => "Docker",
        "git" => "Git",
        "linux" => "Linux",
        "ml" | "machine learning" => "Machine Learning",
        "dl" | "deep learning" => "Deep Learning",
        "ai" | "artificial intelligence" => "Artificial Intelligence",
        "nlp" | "natural language processing" => "NLP",
        "tf" | "tensorflow" => "TensorFlow",
        "pytorch" | "torch" => "PyTorch",
        "django" => "Django",
        "flask" => "Flask",
        "excel" | "ms excel" | "ms-excel" | "microsoft excel" => "Excel",
        "figma" => "Figma",
        "ui/ux" | "ux/ui" | "ui ux" => "UI/UX",
        "dsa" | "data structures" => "Data Structures",
        _ => return None,
    };
    Some(name)
}

/// Map skill names through the alias table and drop duplicates
/// (case-insensitive), keeping first-seen order. Comma/semicolon/pipe
/// separated entries are split first.
pub fn canonicalize_skills(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut skills = Vec::new();

    for item in items {
        for part in item.split([',', ';', '|']) {
            let cleaned = clean_text(part);
            if cleaned.is_empty() {
                continue;
            }
            let name = canonical_skill(&cleaned.to_lowercase())
                .map(str::to_string)
                .unwrap_or(cleaned);
            if seen.insert(name.to_lowercase()) {
                skills.push(name);
            }
        }
    }
    skills
}

/// Work mode from location / workplace-type text, defaulting to office.
pub fn classify_work_mode(location: &str, workplace_type: Option<&str>) -> WorkMode {
    let haystack = format!("{} {}", location, workplace_type.unwrap_or("")).to_lowercase();
    if haystack.contains("hybrid") {
        WorkMode::Hybrid
    } else if haystack.contains("remote")
        || haystack.contains("work from home")
        || haystack.contains("wfh")
        || haystack.contains("anywhere")
    {
        WorkMode::Remote
    } else {
        WorkMode::Office
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 15).unwrap()
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  Software \n\t Intern  "), "Software Intern");
        assert_eq!(clean_text("   "), "");
    }

    #[test]
    fn compensation_examples() {
        assert_eq!(parse_compensation("₹20,000"), Some(20_000));
        assert_eq!(parse_compensation("15k"), Some(15_000));
        assert_eq!(parse_compensation("Unpaid"), Some(0));
        assert_eq!(parse_compensation(""), None);
    }

    #[test]
    fn compensation_ranges_take_lower_bound() {
        assert_eq!(parse_compensation("₹ 10,000 - 15,000 /month"), Some(10_000));
        assert_eq!(parse_compensation("10-15k"), Some(10_000));
        assert_eq!(parse_compensation("$2.5k to $4k per month"), Some(2_500));
        assert_eq!(parse_compensation("3 lakh per annum"), Some(300_000));
    }

    #[test]
    fn compensation_unparseable_is_none() {
        assert_eq!(parse_compensation("Performance based"), None);
        assert_eq!(parse_compensation("Competitive"), None);
    }

    #[test]
    fn duration_examples() {
        assert_eq!(parse_duration_months("3 months"), Some(3));
        assert_eq!(parse_duration_months("1 Month"), Some(1));
        assert_eq!(parse_duration_months("2 weeks"), Some(0));
        assert_eq!(parse_duration_months("8 weeks"), Some(2));
        assert_eq!(parse_duration_months("Six Months"), Some(6));
        assert_eq!(parse_duration_months("1 year"), Some(12));
        assert_eq!(parse_duration_months("6months"), Some(6));
        assert_eq!(parse_duration_months("flexible"), None);
        assert_eq!(parse_duration_months(""), None);
    }

    #[test]
    fn posted_date_relative() {
        let t = today();
        assert_eq!(parse_posted_date("Today", t), Some(t));
        assert_eq!(parse_posted_date("Just now", t), Some(t));
        assert_eq!(parse_posted_date("yesterday", t), NaiveDate::from_ymd_opt(2026, 3, 14));
        assert_eq!(parse_posted_date("3 days ago", t), NaiveDate::from_ymd_opt(2026, 3, 12));
        assert_eq!(parse_posted_date("2 weeks ago", t), NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(parse_posted_date("5 hours ago", t), Some(t));
        assert_eq!(parse_posted_date("30+ days ago", t), NaiveDate::from_ymd_opt(2026, 2, 13));
    }

    #[test]
    fn posted_date_absolute_and_garbage() {
        let t = today();
        assert_eq!(parse_posted_date("2026-01-05", t), NaiveDate::from_ymd_opt(2026, 1, 5));
        assert_eq!(parse_posted_date("5 Jan 2026", t), NaiveDate::from_ymd_opt(2026, 1, 5));
        assert_eq!(parse_posted_date("Jan 5, 2026", t), NaiveDate::from_ymd_opt(2026, 1, 5));
        assert_eq!(
            parse_posted_date("2026-01-05T10:00:00Z", t),
            NaiveDate::from_ymd_opt(2026, 1, 5)
        );
        assert_eq!(parse_posted_date("a while back", t), None);
        assert_eq!(parse_posted_date("", t), None);
    }

    #[test]
    fn posted_label_is_stripped_before_absolute_parse() {
        let t = today();
        let jan5 = NaiveDate::from_ymd_opt(2026, 1, 5);
        assert_eq!(parse_posted_date("Posted: 2026-01-05", t), jan5);
        assert_eq!(parse_posted_date("Posted on 5 Jan 2026", t), jan5);
        assert_eq!(parse_posted_date("posted 3 days ago", t), NaiveDate::from_ymd_opt(2026, 3, 12));
        assert_eq!(parse_posted_date("Posted:", t), None);
    }

    #[test]
    fn huge_relative_offsets_yield_none() {
        let t = today();
        assert_eq!(parse_posted_date("99999999999999999999 weeks ago", t), None);
        assert_eq!(parse_posted_date("99999999999999999999 months ago", t), None);
        assert_eq!(parse_posted_date("99999999999999999999 days ago", t), None);
        assert_eq!(parse_posted_date("5000000000 months ago", t), None);
    }

    #[test]
    fn epoch_millis_deadline() {
        assert_eq!(
            parse_absolute_date("1767225600000"),
            NaiveDate::from_ymd_opt(2026, 1, 1)
        );
    }

    #[test]
    fn skills_are_canonicalized_and_deduplicated() {
        let skills = canonicalize_skills(&[
            "js".into(),
            "JavaScript".into(),
            "k8s, Docker".into(),
            "reactjs".into(),
            "Kubernetes".into(),
            "  Kotlin ".into(),
        ]);
        assert_eq!(
            skills,
            vec!["JavaScript", "Kubernetes", "Docker", "React", "Kotlin"]
        );
    }

    #[test]
    fn work_mode_classification() {
        assert_eq!(classify_work_mode("Work From Home", None), WorkMode::Remote);
        assert_eq!(classify_work_mode("Bangalore", Some("Remote")), WorkMode::Remote);
        assert_eq!(classify_work_mode("Pune (Hybrid)", None), WorkMode::Hybrid);
        assert_eq!(classify_work_mode("Delhi", None), WorkMode::Office);
        assert_eq!(classify_work_mode("", None), WorkMode::Office);
    }

    #[test]
    fn normalizes_html_shaped_record() {
        let raw = RawRecord::new("board", Some("abc-1".into()))
            .with_field("title", "  Backend   Intern ")
            .with_field("company", "Acme Labs")
            .with_field("description", "Build APIs")
            .with_field("location", "Work From Home")
            .with_field("stipend", "₹ 12,000 /month")
            .with_field("duration", "3 Months")
            .with_field("skills", serde_json::json!(["py", "sql", "Python"]))
            .with_field("apply_url", "https://board.example.com/apply/abc-1")
            .with_field("posted", "2 days ago")
            .with_field("deadline", "2026-04-01");

        let record = FieldMapNormalizer::default().normalize_at(&raw, today());

        assert_eq!(record.title, "Backend Intern");
        assert_eq!(record.organization, "Acme Labs");
        assert_eq!(record.work_mode, WorkMode::Remote);
        assert_eq!(record.compensation, Some(12_000));
        assert_eq!(record.duration_months, Some(3));
        assert_eq!(record.skills, vec!["Python", "SQL"]);
        assert_eq!(record.external_id, "abc-1");
        assert_eq!(record.posted_date, NaiveDate::from_ymd_opt(2026, 3, 13));
        assert_eq!(record.deadline, NaiveDate::from_ymd_opt(2026, 4, 1));
        assert!(record.active);
    }

    #[test]
    fn normalizes_api_shaped_record() {
        let raw = RawRecord::new("api-board", None)
            .with_field("id", 98765)
            .with_field("positionTitle", "Data Intern")
            .with_field("companyName", "Globex")
            .with_field("formattedLocation", "Austin, TX")
            .with_field("workplaceType", "Hybrid")
            .with_field("salary", "$2,000 - $3,000")
            .with_field("applyUrl", "https://globex.example.com/jobs/98765");

        let record = FieldMapNormalizer::new(FieldMap::api_listing()).normalize_at(&raw, today());

        assert_eq!(record.external_id, "98765");
        assert_eq!(record.work_mode, WorkMode::Hybrid);
        assert_eq!(record.compensation, Some(2_000));
        assert!(record.skills.is_empty());
        assert_eq!(record.posted_date, None);
    }

    #[test]
    fn missing_id_falls_back_to_url_hash() {
        let raw = RawRecord::new("board", None)
            .with_field("title", "Intern")
            .with_field("apply_url", "https://x.example.com/a");
        let record = FieldMapNormalizer::default().normalize_at(&raw, today());
        assert_eq!(record.external_id.len(), 16);

        let bare = RawRecord::new("board", None).with_field("title", "Intern");
        assert!(FieldMapNormalizer::default().normalize_at(&bare, today()).external_id.is_empty());
    }
}
