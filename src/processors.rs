//! Text processors and value coercers.
//!
//! Extractors hand over raw text. Before a value reaches the merge it is
//! cleaned (HTML entities decoded, whitespace stripped) and coerced into the
//! field's declared type. The list steps compose into a `TextPipeline`.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
    "%B %d, %Y %I:%M %p",
    "%b %d, %Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y"];

fn entity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("entity pattern is a valid regex")
    })
}

/// Decodes HTML character references. Unknown named references are kept.
#[must_use]
pub fn remove_entities(text: &str) -> String {
    entity_regex()
        .replace_all(text, |caps: &Captures<'_>| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match body {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some('\u{a0}'),
                    _ => None,
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

/// One list-processing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TextStep {
    Strip,
    RemoveEntities,
    Split { token: String },
    Prefix { prefix: String },
    Exclude { values: Vec<String> },
    Slice { begin: usize, end: Option<usize> },
}

impl TextStep {
    fn apply(&self, values: Vec<String>) -> Vec<String> {
        match self {
            Self::Strip => values.into_iter().map(|v| v.trim().to_string()).collect(),
            Self::RemoveEntities => values.iter().map(|v| remove_entities(v)).collect(),
            Self::Split { token } => values
                .iter()
                .flat_map(|v| v.split(token.as_str()).map(str::to_string).collect::<Vec<_>>())
                .collect(),
            Self::Prefix { prefix } => values.into_iter().map(|v| format!("{prefix}{v}")).collect(),
            Self::Exclude { values: excluded } => {
                values.into_iter().filter(|v| !excluded.contains(v)).collect()
            }
            Self::Slice { begin, end } => values
                .into_iter()
                .map(|v| {
                    let chars: Vec<char> = v.chars().collect();
                    let end = end.unwrap_or(chars.len()).min(chars.len());
                    let begin = (*begin).min(end);
                    chars[begin..end].iter().collect()
                })
                .collect(),
        }
    }
}

/// Ordered list of text steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextPipeline {
    steps: Vec<TextStep>,
}

impl TextPipeline {
    /// The default cleaning applied to text fields: decode entities, strip.
    #[must_use]
    pub fn clean() -> Self {
        Self::default().then(TextStep::RemoveEntities).then(TextStep::Strip)
    }

    #[must_use]
    pub fn then(mut self, step: TextStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn apply(&self, values: Vec<String>) -> Vec<String> {
        self.steps.iter().fold(values, |acc, step| step.apply(acc))
    }
}

/// First non-empty string.
#[must_use]
pub fn take_first(values: Vec<String>) -> Option<String> {
    values.into_iter().find(|v| !v.is_empty())
}

pub fn to_int(text: &str) -> Result<i64, String> {
    let cleaned = remove_entities(text);
    let cleaned = cleaned.trim();
    cleaned
        .parse::<i64>()
        .map_err(|e| format!("'{cleaned}' is not an integer: {e}"))
}

pub fn to_float(text: &str) -> Result<f64, String> {
    let cleaned = remove_entities(text);
    let cleaned = cleaned.trim();
    cleaned
        .parse::<f64>()
        .map_err(|e| format!("'{cleaned}' is not a number: {e}"))
}

/// `"true"` in any case is true; every other text is false.
#[must_use]
pub fn to_bool(text: &str) -> bool {
    remove_entities(text).trim().eq_ignore_ascii_case("true")
}

/// Parses a date-time; naive values are taken as UTC.
pub fn to_date_time(text: &str) -> Result<DateTime<Utc>, String> {
    let cleaned = remove_entities(text);
    let cleaned = cleaned.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(cleaned) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Ok(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, fmt) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(naive.and_utc());
            }
        }
    }
    Err(format!("failed to convert datetime string: '{cleaned}'"))
}

/// Parses a calendar date, accepting date-time text as well.
pub fn to_date(text: &str) -> Result<NaiveDate, String> {
    let cleaned = remove_entities(text);
    let cleaned = cleaned.trim();
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, fmt) {
            return Ok(date);
        }
    }
    to_date_time(cleaned).map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_remove_entities() {
        assert_eq!(remove_entities("Joe&#39;s &amp; Co"), "Joe's & Co");
        assert_eq!(remove_entities("&#x41;&lt;b&gt;"), "A<b>");
        assert_eq!(remove_entities("&bogus; stays"), "&bogus; stays");
    }

    #[test]
    fn test_clean_pipeline() {
        let out = TextPipeline::clean().apply(strings(&["  R&amp;B  ", "\tjazz\n"]));
        assert_eq!(out, strings(&["R&B", "jazz"]));
    }

    #[test]
    fn test_split_prefix_exclude_slice() {
        let pipeline = TextPipeline::default()
            .then(TextStep::Split { token: ",".to_string() })
            .then(TextStep::Strip)
            .then(TextStep::Exclude { values: strings(&["", "n/a"]) })
            .then(TextStep::Prefix { prefix: "g:".to_string() })
            .then(TextStep::Slice { begin: 0, end: Some(5) });
        let out = pipeline.apply(strings(&["rock, n/a,, blues"]));
        assert_eq!(out, strings(&["g:roc", "g:blu"]));
    }

    #[test]
    fn test_take_first() {
        assert_eq!(take_first(strings(&["", "a", "b"])), Some("a".to_string()));
        assert_eq!(take_first(strings(&[""])), None);
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(to_int(" 42 "), Ok(42));
        assert!(to_int("forty").is_err());
        assert!((to_float("3.5").unwrap() - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bool_coercion() {
        assert!(to_bool(" TRUE "));
        assert!(!to_bool("yes"));
        assert!(!to_bool(""));
    }

    #[test]
    fn test_date_parsing() {
        let d = to_date("March 4, 2011").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2011, 3, 4).unwrap());
        let d = to_date("2011-03-04 20:30:00").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2011, 3, 4).unwrap());

        let dt = to_date_time("2011-03-04T20:30:00+02:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2011-03-04T18:30:00+00:00");
        let dt = to_date_time("03/04/2011 08:30 PM").unwrap();
        assert_eq!(dt.to_rfc3339(), "2011-03-04T20:30:00+00:00");

        let err = to_date_time("sometime soon").unwrap_err();
        assert!(err.contains("sometime soon"));
    }
}
