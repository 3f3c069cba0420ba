//! Payload shapes returned by the Knack REST API.
//!
//! Knack records are flat JSON objects keyed by opaque field ids
//! (`field_123`). Every field comes twice: the formatted value, which is often
//! HTML, and a `_raw` companion carrying the structured value. Accessors here
//! always prefer the raw value and fall back to the formatted one.

use chrono::NaiveDate;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Knack object ids and field ids used by the sync.
pub mod fields {
    pub const ESTABLISHMENT_OBJECT: &str = "object_2";
    pub const ESTABLISHMENT_NAME: &str = "field_44";
    pub const ESTABLISHMENT_AUSTRALIAN: &str = "field_3508";
    pub const ESTABLISHMENT_TRUST: &str = "field_3480";

    pub const STAFF_OBJECT: &str = "object_5";
    pub const STAFF_NAME: &str = "field_85";
    pub const STAFF_EMAIL: &str = "field_86";
    pub const STAFF_ESTABLISHMENT: &str = "field_110";

    pub const VESPA_OBJECT: &str = "object_10";
    pub const VESPA_NAME: &str = "field_187";
    pub const VESPA_EMAIL: &str = "field_197";
    pub const VESPA_ESTABLISHMENT: &str = "field_133";
    pub const VESPA_YEAR_GROUP: &str = "field_144";
    pub const VESPA_COURSE: &str = "field_2299";
    pub const VESPA_FACULTY: &str = "field_782";

    /// Per cycle: vision, effort, systems, practice, attitude, overall.
    pub const VESPA_SCORE_FIELDS: [[&str; 6]; 3] = [
        ["field_155", "field_156", "field_157", "field_158", "field_159", "field_160"],
        ["field_161", "field_162", "field_163", "field_164", "field_165", "field_166"],
        ["field_167", "field_168", "field_169", "field_170", "field_171", "field_172"],
    ];
    pub const VESPA_COMPLETION_DATES: [&str; 3] = ["field_855", "field_856", "field_857"];

    pub const QUESTIONNAIRE_OBJECT: &str = "object_29";
    pub const QUESTIONNAIRE_EMAIL: &str = "field_2732";
    pub const QUESTIONNAIRE_ESTABLISHMENT: &str = "field_1821";
    pub const QUESTIONNAIRE_COMPLETION_DATES: [&str; 3] = ["field_2742", "field_2743", "field_2744"];
}

/// One page of `GET /objects/{object}/records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPage {
    #[serde(deserialize_with = "number_or_string")]
    pub total_pages: u32,
    #[serde(deserialize_with = "number_or_string")]
    pub current_page: u32,
    #[serde(deserialize_with = "number_or_string")]
    pub total_records: u32,
    #[serde(default)]
    pub records: Vec<KnackRecord>,
}

impl RecordPage {
    pub fn is_last(&self) -> bool {
        self.current_page >= self.total_pages
    }
}

// Knack reports paging counters as numbers on some endpoints and strings on others.
fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| de::Error::custom(format!("expected a non-negative integer, got {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected a numeric string, got '{}'", s))),
        Value::Null => Ok(0),
        other => Err(de::Error::custom(format!("expected a number, got {}", other))),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnackRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl KnackRecord {
    fn raw(&self, field: &str) -> Option<&Value> {
        self.fields
            .get(&format!("{}_raw", field))
            .filter(|v| !v.is_null())
            .or_else(|| self.fields.get(field).filter(|v| !v.is_null()))
    }

    /// Plain text, with formatting markup removed.
    pub fn text(&self, field: &str) -> Option<String> {
        let value = match self.raw(field)? {
            Value::String(s) => strip_html(s),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.get("identifier").and_then(Value::as_str).map(strip_html))
                .collect::<Vec<_>>()
                .join(", "),
            Value::Object(obj) => obj
                .get("full")
                .or_else(|| obj.get("identifier"))
                .and_then(Value::as_str)
                .map(strip_html)
                .unwrap_or_default(),
            Value::Null => String::new(),
        };
        let value = value.trim().to_string();
        if value.is_empty() { None } else { Some(value) }
    }

    /// Email fields carry `{"email": "..."}` raw, or a `mailto:` link formatted.
    pub fn email(&self, field: &str) -> Option<String> {
        let candidate = match self.raw(field)? {
            Value::Object(obj) => obj.get("email").and_then(Value::as_str).map(str::to_string),
            Value::String(s) => Some(strip_html(s)),
            _ => None,
        }?;
        normalize_email(&candidate)
    }

    /// Name fields carry `{"first", "last", "full"}` raw.
    pub fn name(&self, field: &str) -> Option<String> {
        match self.raw(field)? {
            Value::Object(obj) => {
                if let Some(full) = obj.get("full").and_then(Value::as_str).filter(|s| !s.trim().is_empty()) {
                    return Some(full.trim().to_string());
                }
                let parts: Vec<&str> = ["title", "first", "middle", "last"]
                    .iter()
                    .filter_map(|k| obj.get(*k).and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                if parts.is_empty() { None } else { Some(parts.join(" ")) }
            }
            _ => self.text(field),
        }
    }

    /// Record ids of a connection field.
    pub fn connection_ids(&self, field: &str) -> Vec<String> {
        match self.raw(field) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(obj) => obj.get("id").and_then(Value::as_str).map(str::to_string),
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        }
    }

    pub fn first_connection(&self, field: &str) -> Option<String> {
        self.connection_ids(field).into_iter().next()
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        match self.raw(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => strip_html(s).trim().parse().ok(),
            _ => None,
        }
    }

    pub fn boolean(&self, field: &str) -> Option<bool> {
        match self.raw(field)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match strip_html(s).trim().to_ascii_lowercase().as_str() {
                "yes" | "true" | "1" => Some(true),
                "no" | "false" | "0" | "" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            _ => None,
        }
    }

    /// Date fields carry `{"date": "dd/mm/yyyy", ...}` raw.
    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        let raw = match self.raw(field)? {
            Value::Object(obj) => obj
                .get("date")
                .or_else(|| obj.get("date_formatted"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Value::String(s) => Some(strip_html(s)),
            _ => None,
        }?;
        parse_knack_date(&raw)
    }
}

/// Knack renders dates day-first; ISO dates also show up in exported data.
pub fn parse_knack_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed.split_whitespace().next()?;
    NaiveDate::parse_from_str(date_part, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y-%m-%d"))
        .ok()
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().trim_start_matches("mailto:").trim().to_lowercase();
    if email.is_empty() || !email.contains('@') || email.chars().any(char::is_whitespace) {
        None
    } else {
        Some(email)
    }
}

/// Remove tags and decode the handful of entities Knack emits.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: Value) -> KnackRecord {
        let mut obj = fields.as_object().cloned().unwrap_or_default();
        obj.insert("id".into(), json!("rec1"));
        serde_json::from_value(Value::Object(obj)).unwrap()
    }

    #[test]
    fn page_counters_accept_strings() {
        let page: RecordPage = serde_json::from_value(json!({
            "total_pages": 3,
            "current_page": "2",
            "total_records": 2500,
            "records": []
        }))
        .unwrap();
        assert_eq!(page.current_page, 2);
        assert!(!page.is_last());
    }

    #[test]
    fn email_prefers_raw_and_normalizes() {
        let r = record(json!({
            "field_197": "<a href=\"mailto:Jo.Bloggs@School.org\">Jo.Bloggs@School.org</a>",
            "field_197_raw": { "email": " Jo.Bloggs@School.org " }
        }));
        assert_eq!(r.email("field_197").as_deref(), Some("jo.bloggs@school.org"));

        let formatted_only = record(json!({
            "field_197": "<a href=\"mailto:a@b.com\">A@B.com</a>"
        }));
        assert_eq!(formatted_only.email("field_197").as_deref(), Some("a@b.com"));
    }

    #[test]
    fn rejects_blank_or_malformed_email() {
        assert_eq!(normalize_email("   "), None);
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("a b@c.com"), None);
    }

    #[test]
    fn name_joins_parts_when_full_missing() {
        let r = record(json!({ "field_187_raw": { "first": "Jo", "last": "Bloggs" } }));
        assert_eq!(r.name("field_187").as_deref(), Some("Jo Bloggs"));
    }

    #[test]
    fn connections_and_dates() {
        let r = record(json!({
            "field_133_raw": [{ "id": "est42", "identifier": "Example College" }],
            "field_855_raw": { "date": "14/10/2025", "iso_timestamp": "2025-10-14T00:00:00.000Z" }
        }));
        assert_eq!(r.first_connection("field_133").as_deref(), Some("est42"));
        assert_eq!(r.text("field_133").as_deref(), Some("Example College"));
        assert_eq!(r.date("field_855"), NaiveDate::from_ymd_opt(2025, 10, 14));
    }

    #[test]
    fn numbers_and_booleans_from_strings() {
        let r = record(json!({
            "field_155_raw": "7",
            "field_156": "<span>8</span>",
            "field_3508_raw": "Yes"
        }));
        assert_eq!(r.number("field_155"), Some(7.0));
        assert_eq!(r.number("field_156"), Some(8.0));
        assert_eq!(r.boolean("field_3508"), Some(true));
    }

    #[test]
    fn strips_markup() {
        assert_eq!(strip_html("<b>Year&nbsp;12</b> &amp; more"), "Year 12 & more");
    }
}
