//! Deterministic anomaly and risk rules for the security event log.
//!
//! These are the same criteria the extraction instructions spell out, in a
//! form the pipeline can run and test without a model.

use crate::enrich::{lookup_field, RiskLevel};
use crate::extract::{ExtractionError, ExtractionRequest, ExtractionService};
use crate::prompt::OutputSchema;
use crate::record::{self, parse_incident_timestamp, LogRecord};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    ErrorLevel,
    SuspiciousConnection,
    SuspiciousProcess,
    AuditLogCleared,
    AccountLockout,
    Exfiltration,
}

impl Rule {
    pub fn risk(self) -> RiskLevel {
        match self {
            Rule::ErrorLevel | Rule::SuspiciousProcess | Rule::AccountLockout => RiskLevel::Medium,
            Rule::SuspiciousConnection | Rule::AuditLogCleared => RiskLevel::High,
            Rule::Exfiltration => RiskLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rules: Vec<Rule>,
    pub risk: RiskLevel,
}

impl RuleMatch {
    pub fn recommended_action(&self) -> &'static str {
        recommended_action(self.risk)
    }
}

pub fn recommended_action(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Critical => "Lock workstation and escalate immediately",
        RiskLevel::High => "Suspend user access and investigate",
        RiskLevel::Medium => "Notify security team",
        RiskLevel::Low => "No action required",
    }
}

static RE_EXFIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(exfiltrat\w*|mass (?:data|download|copy)|bulk (?:download|export))").unwrap()
});

/// Rules that fired for `rec`, or `None` when the line is not anomalous or
/// only rates `Low`.
pub fn evaluate(rec: &LogRecord) -> Option<RuleMatch> {
    let mut rules = Vec::new();
    let category = rec.category.to_ascii_lowercase();
    if rec.level.eq_ignore_ascii_case("error") {
        rules.push(Rule::ErrorLevel);
    }
    if category == "suspicious connection" {
        rules.push(Rule::SuspiciousConnection);
    }
    if category == "process creation" && rec.description.to_ascii_lowercase().contains("suspicious process") {
        rules.push(Rule::SuspiciousProcess);
    }
    match rec.event_id_num() {
        Some(1102) => rules.push(Rule::AuditLogCleared),
        Some(4740) => rules.push(Rule::AccountLockout),
        _ => {}
    }
    if RE_EXFIL.is_match(&rec.description) {
        rules.push(Rule::Exfiltration);
    }

    let risk = rules.iter().map(|r| r.risk()).max()?;
    if risk == RiskLevel::Low {
        return None;
    }
    Some(RuleMatch { rules, risk })
}

/// Lines of `input` that trip a rule, in input order. Unparsable lines and
/// headers are skipped.
pub fn scan(input: &str) -> Vec<(LogRecord, RuleMatch)> {
    let lines: Vec<&str> = input.lines().collect();
    lines
        .par_iter()
        .map(|l| {
            if record::is_header_line(l) {
                return None;
            }
            let rec = record::parse_line(l).ok()?;
            let m = evaluate(&rec)?;
            Some((rec, m))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

pub fn incident_for(rec: &LogRecord, m: &RuleMatch, incident_id: &str, schema: OutputSchema) -> Map<String, Value> {
    let user = rec.user.clone().unwrap_or_else(|| "unknown".to_string());
    let who = rec.user.as_deref().map(|u| format!("user '{u}'")).unwrap_or_else(|| "an unknown user".to_string());
    let action = m.recommended_action();
    let summary = format!(
        "On {} at {}, {} was involved in a {} event: {} Risk Level: {}. Recommended Action: {}.",
        rec.date, rec.time, who, rec.category, rec.description, m.risk, action
    );
    let value = match schema {
        OutputSchema::PerLine => json!({
            "incident_id": incident_id,
            "summary": summary,
            "risk_level": m.risk,
            "recommended_action": action,
            "details": {
                "user": user,
                "event": rec.raw,
                "timestamp": rec.timestamp_text(),
            }
        }),
        OutputSchema::IncidentArray => {
            let iso = format!("{}T{}", rec.date, rec.time);
            json!({
                "incident_id": incident_id,
                "summary": summary,
                "risk_level": m.risk,
                "user": user,
                "timestamp": iso,
                "recommended_action": action,
                "details": {
                    "timestamp": iso,
                    "user": user,
                    "event": rec.raw,
                    "event_id": rec.event_id,
                    "activity_type": rec.category,
                    "severity_score": severity_score(m.risk),
                }
            })
        }
    };
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn severity_score(risk: RiskLevel) -> u8 {
    match risk {
        RiskLevel::Critical => 10,
        RiskLevel::High => 8,
        RiskLevel::Medium => 5,
        RiskLevel::Low => 2,
    }
}

/// Offline stand-in for the extraction service: answers every request with
/// the incidents the rules find, in the requested schema.
pub struct RuleExtractor {
    schema: OutputSchema,
    next_seq: usize,
}

impl RuleExtractor {
    pub fn new(schema: OutputSchema) -> Self {
        Self { schema, next_seq: 1 }
    }

    /// Incidents for every anomalous line of `input`, numbering continuing
    /// across calls.
    pub fn incidents(&mut self, input: &str) -> Vec<Map<String, Value>> {
        self.incidents_where(input, |_| true)
    }

    fn incidents_where<F: Fn(&LogRecord) -> bool>(&mut self, input: &str, keep: F) -> Vec<Map<String, Value>> {
        scan(input)
            .into_iter()
            .filter(|(rec, _)| keep(rec))
            .map(|(rec, m)| {
                let id = format!("INC{}-{:04}", rec.date.replace('-', ""), self.next_seq);
                self.next_seq += 1;
                incident_for(&rec, &m, &id, self.schema)
            })
            .collect()
    }

    pub fn render(&self, incidents: Vec<Map<String, Value>>) -> String {
        match self.schema {
            OutputSchema::PerLine => incidents
                .into_iter()
                .filter_map(|m| serde_json::to_string_pretty(&Value::Object(m)).ok())
                .collect::<Vec<_>>()
                .join("\n\n"),
            OutputSchema::IncidentArray => {
                let arr = Value::Array(incidents.into_iter().map(Value::Object).collect());
                serde_json::to_string_pretty(&arr).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }
}

impl ExtractionService for RuleExtractor {
    fn name(&self) -> &str {
        "rules"
    }

    fn complete(&mut self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        let found = self.incidents(request.input);
        Ok(self.render(found))
    }
}

/// Rule incidents for lines of `chunk_text` whose timestamp none of the
/// `reported` incidents already covers.
pub fn supplement(
    extractor: &mut RuleExtractor,
    chunk_text: &str,
    reported: &[&Map<String, Value>],
) -> Vec<Map<String, Value>> {
    let covered: HashSet<_> = reported
        .iter()
        .filter_map(|m| lookup_field(m, "timestamp"))
        .filter_map(|v| v.as_str().and_then(parse_incident_timestamp))
        .collect();
    extractor.incidents_where(chunk_text, |rec| !matches!(rec.timestamp(), Some(t) if covered.contains(&t)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    #[default]
    Off,
    /// Append rule incidents the service missed.
    Supplement,
}

impl FromStr for RuleMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(RuleMode::Off),
            "supplement" => Ok(RuleMode::Supplement),
            other => Err(format!("unknown rule mode '{other}' (expected off | supplement)")),
        }
    }
}
