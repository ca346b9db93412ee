use crate::normalize::{IncidentCollection, RawIncident};
use crate::record::parse_incident_timestamp;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High, RiskLevel::Critical];

    /// Sort key: Critical=4, High=3, Medium=2, Low=1.
    pub fn order(self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
            RiskLevel::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

pub const REQUIRED_FIELDS: [&str; 6] = ["summary", "risk_level", "user", "timestamp", "recommended_action", "details"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("incident data is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
}

/// Looks `field` up at the top level, then under `details`.
pub fn lookup_field<'a>(incident: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    match incident.get(field) {
        Some(v) if !v.is_null() => Some(v),
        _ => incident.get("details").and_then(Value::as_object).and_then(|d| d.get(field)).filter(|v| !v.is_null()),
    }
}

/// Presentation-ready incident.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub timestamp: NaiveDateTime,
    pub date: NaiveDate,
    pub hour: u32,
    pub user: String,
    pub risk_level: RiskLevel,
    pub risk_level_order: u8,
    pub summary: String,
    pub recommended_action: String,
    pub details: Value,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedIncident {
    pub position: usize,
    pub chunk_index: usize,
    pub reason: DropReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DropReason {
    MissingField { field: String },
    InvalidRiskLevel { value: String },
    InvalidTimestamp { value: String },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MissingField { field } => write!(f, "missing field '{field}'"),
            DropReason::InvalidRiskLevel { value } => write!(f, "risk level '{value}' is not Low/Medium/High/Critical"),
            DropReason::InvalidTimestamp { value } => write!(f, "unparsable timestamp '{value}'"),
        }
    }
}

/// Enriched incidents, most recent first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IncidentTable {
    pub rows: Vec<IncidentRow>,
    pub dropped: Vec<DroppedIncident>,
    pub warnings: Vec<String>,
}

impl IncidentTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Required columns no incident carries.
pub fn missing_columns(incidents: &[RawIncident]) -> Vec<String> {
    let present: BTreeSet<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|f| incidents.iter().any(|i| lookup_field(&i.fields, f).is_some()))
        .collect();
    REQUIRED_FIELDS.iter().filter(|f| !present.contains(*f)).map(|f| f.to_string()).collect()
}

/// Validates the collection as a whole, then enriches each record. Records
/// that cannot be enriched are dropped individually.
pub fn enrich(collection: &IncidentCollection) -> Result<IncidentTable, SchemaError> {
    if collection.is_empty() {
        return Ok(IncidentTable::default());
    }
    let missing = missing_columns(&collection.incidents);
    if !missing.is_empty() {
        let err = SchemaError::MissingFields(missing);
        warn!("{err}");
        return Err(err);
    }

    let results: Vec<Result<IncidentRow, DropReason>> =
        collection.incidents.par_iter().map(enrich_one).collect();

    let mut table = IncidentTable::default();
    let mut bad_timestamps = 0usize;
    for (position, (raw, res)) in collection.incidents.iter().zip(results).enumerate() {
        match res {
            Ok(row) => table.rows.push(row),
            Err(reason) => {
                if matches!(reason, DropReason::InvalidTimestamp { .. }) {
                    bad_timestamps += 1;
                }
                warn!(chunk = raw.chunk_index, position, "dropping incident: {reason}");
                table.dropped.push(DroppedIncident { position, chunk_index: raw.chunk_index, reason });
            }
        }
    }
    if bad_timestamps > 0 && bad_timestamps == collection.len() {
        let msg = format!("all {bad_timestamps} incidents had unparsable timestamps");
        warn!("{msg}");
        table.warnings.push(msg);
    }
    // Stable sort keeps arrival order among equal timestamps.
    table.rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    info!(rows = table.rows.len(), dropped = table.dropped.len(), "enriched incidents");
    Ok(table)
}

fn text_field(fields: &Map<String, Value>, name: &str) -> Result<String, DropReason> {
    match lookup_field(fields, name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(DropReason::MissingField { field: name.to_string() }),
    }
}

pub fn enrich_one(raw: &RawIncident) -> Result<IncidentRow, DropReason> {
    let f = &raw.fields;
    let summary = text_field(f, "summary")?;
    let recommended_action = text_field(f, "recommended_action")?;
    let user = text_field(f, "user")?;
    let risk_text = text_field(f, "risk_level")?;
    let risk_level: RiskLevel = risk_text.parse().map_err(|_| DropReason::InvalidRiskLevel { value: risk_text.clone() })?;
    let details = match f.get("details") {
        Some(d @ Value::Object(_)) => d.clone(),
        Some(_) | None => return Err(DropReason::MissingField { field: "details".into() }),
    };
    let ts_text = text_field(f, "timestamp")?;
    let timestamp = parse_incident_timestamp(&ts_text).ok_or(DropReason::InvalidTimestamp { value: ts_text })?;

    Ok(IncidentRow {
        incident_id: f.get("incident_id").and_then(Value::as_str).map(str::to_string),
        date: timestamp.date(),
        hour: timestamp.hour(),
        timestamp,
        user,
        risk_level,
        risk_level_order: risk_level.order(),
        summary,
        recommended_action,
        details,
        chunk_index: raw.chunk_index,
    })
}
