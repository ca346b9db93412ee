use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("expected 7 comma-separated fields, found {0}")]
    FieldCount(usize),
    #[error("empty line")]
    Empty,
}

/// One line of the security event log:
/// `Date,Time,Level,Source,EventID,Category,Description`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub date: String,
    pub time: String,
    pub level: String,
    pub source: String,
    pub event_id: String,
    pub category: String,
    pub description: String,
    pub user: Option<String>,
    pub raw: String,
}

impl LogRecord {
    pub fn event_id_num(&self) -> Option<u32> {
        self.event_id.trim().parse().ok()
    }

    /// `"2025-06-28 23:09:08"`, the form incident details carry.
    pub fn timestamp_text(&self) -> String {
        format!("{} {}", self.date, self.time)
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        parse_incident_timestamp(&self.timestamp_text())
    }
}

pub fn parse_line(line: &str) -> Result<LogRecord, RecordError> {
    let raw = line.trim_end_matches(['\r', '\n']);
    if raw.trim().is_empty() {
        return Err(RecordError::Empty);
    }
    // Descriptions may contain commas, so only the first six separate fields.
    let parts: Vec<&str> = raw.splitn(7, ',').map(str::trim).collect();
    if parts.len() < 7 {
        return Err(RecordError::FieldCount(parts.len()));
    }
    let description = parts[6].to_string();
    let user = extract_user(&description);
    Ok(LogRecord {
        date: parts[0].to_string(),
        time: parts[1].to_string(),
        level: parts[2].to_string(),
        source: parts[3].to_string(),
        event_id: parts[4].to_string(),
        category: parts[5].to_string(),
        description,
        user,
        raw: raw.to_string(),
    })
}

/// True for the `Date,Time,LogLevel,...` header the batch exporter writes.
pub fn is_header_line(line: &str) -> bool {
    let first = line.split(',').next().unwrap_or("").trim();
    first.eq_ignore_ascii_case("date")
}

static RE_USER: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(?:User|Account):\s*([A-Za-z0-9_.\-\\]+?)\.?(?:\s|$)",
        r"\bby (?:user )?'?([A-Za-z0-9_.\-\\]+?)'?\.?(?:\s|$)",
        r"(?i)\b(?:user|account) ([A-Za-z0-9_.\-\\]+?)\.?(?:\s|$)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

const NOT_A_USER: &[&str] = &["account", "accounts", "was", "is", "has", "logged", "successfully", "a", "an", "the"];

/// Best-effort username lookup in a free-text event description.
pub fn extract_user(description: &str) -> Option<String> {
    for re in RE_USER.iter() {
        for caps in re.captures_iter(description) {
            let Some(m) = caps.get(1) else { continue };
            let candidate = m.as_str().trim_end_matches('.');
            if candidate.is_empty() || NOT_A_USER.contains(&candidate.to_ascii_lowercase().as_str()) {
                continue;
            }
            return Some(candidate.to_string());
        }
    }
    None
}

/// Normalizes a model-reported timestamp before parsing: drops a trailing UTC
/// marker and pads a missing fractional-seconds part with `.0`.
pub fn normalize_timestamp(raw: &str) -> String {
    let mut s = raw.trim();
    for suffix in ["Z", "z", " UTC", "UTC", "+00:00", "+0000"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.trim_end();
            break;
        }
    }
    let mut out = s.to_string();
    let time_part = out.rsplit(['T', ' ']).next().unwrap_or("");
    if !time_part.contains('.') {
        out.push_str(".0");
    }
    out
}

pub fn parse_incident_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = normalize_timestamp(raw);
    let fmts = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
    ];
    for f in fmts.iter() {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&s, f) {
            return Some(ndt);
        }
    }
    None
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}
