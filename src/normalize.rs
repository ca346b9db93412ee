use crate::extract::RawModelResponse;
use crate::repair::{self, RepairError, RepairStage};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

/// One incident object as the service reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawIncident {
    pub chunk_index: usize,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizeWarning {
    /// Reply held no recoverable JSON.
    Unparsable { chunk_index: usize, reason: String, excerpt: String },
    /// Reply was valid JSON but a bare scalar.
    NotStructured { chunk_index: usize, found: String },
    /// An element that should have been an incident object was not.
    NotAnObject { chunk_index: usize, position: usize, found: String },
}

impl fmt::Display for NormalizeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeWarning::Unparsable { chunk_index, reason, excerpt } => {
                write!(f, "chunk {chunk_index}: could not parse response ({reason}): {excerpt}")
            }
            NormalizeWarning::NotStructured { chunk_index, found } => {
                write!(f, "chunk {chunk_index}: response is a JSON {found}, not an object or array")
            }
            NormalizeWarning::NotAnObject { chunk_index, position, found } => {
                write!(f, "chunk {chunk_index}: element {position} is a JSON {found}, not an incident object")
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IncidentCollection {
    pub incidents: Vec<RawIncident>,
    pub warnings: Vec<NormalizeWarning>,
    pub contributing_responses: usize,
}

impl IncidentCollection {
    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}

struct Contribution {
    chunk_index: usize,
    values: Vec<Value>,
    from_array: bool,
    supplement: bool,
}

/// Accumulates per-chunk replies and flattens them into one collection.
#[derive(Default)]
pub struct IncidentNormalizer {
    contributions: Vec<Contribution>,
    warnings: Vec<NormalizeWarning>,
}

impl IncidentNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repairs and records one reply. Returns how many values it contributed.
    pub fn push(&mut self, response: &RawModelResponse) -> usize {
        let chunk_index = response.chunk_index;
        let repaired = match repair::repair(&response.text) {
            Ok(r) => r,
            Err(RepairError::Empty) => {
                debug!(chunk = chunk_index, "empty response");
                return 0;
            }
            Err(e) => {
                self.warn(NormalizeWarning::Unparsable {
                    chunk_index,
                    reason: e.to_string(),
                    excerpt: excerpt(&response.text),
                });
                return 0;
            }
        };
        if repaired.stage != RepairStage::Strict {
            debug!(chunk = chunk_index, stage = ?repaired.stage, "response needed repair");
        }
        let (values, from_array) = match repaired.value {
            Value::Array(items) => (items, true),
            v @ Value::Object(_) => (vec![v], false),
            other => {
                self.warn(NormalizeWarning::NotStructured { chunk_index, found: kind_of(&other).to_string() });
                return 0;
            }
        };
        let n = values.len();
        self.contributions.push(Contribution { chunk_index, values, from_array, supplement: false });
        n
    }

    /// Adds incidents produced outside the service for `chunk_index`.
    pub fn push_supplement(&mut self, chunk_index: usize, incidents: Vec<Map<String, Value>>) {
        if incidents.is_empty() {
            return;
        }
        let values = incidents.into_iter().map(Value::Object).collect();
        self.contributions.push(Contribution { chunk_index, values, from_array: true, supplement: true });
    }

    /// Incident objects recorded so far for `chunk_index`.
    pub fn incidents_for(&self, chunk_index: usize) -> Vec<&Map<String, Value>> {
        self.contributions
            .iter()
            .filter(|c| c.chunk_index == chunk_index)
            .flat_map(|c| c.values.iter())
            .filter_map(Value::as_object)
            .collect()
    }

    pub fn finish(mut self) -> IncidentCollection {
        let contributing_responses = self.contributions.iter().filter(|c| !c.supplement).count();
        // The service sometimes wraps its whole answer in an extra array.
        if contributing_responses == 1 {
            if let Some(only) = self.contributions.iter_mut().find(|c| !c.supplement) {
                if only.from_array && only.values.len() == 1 && only.values[0].is_array() {
                    if let Some(Value::Array(inner)) = only.values.pop() {
                        only.values = inner;
                    }
                }
            }
        }

        let mut incidents = Vec::new();
        let mut warnings = std::mem::take(&mut self.warnings);
        for c in self.contributions {
            for (position, v) in c.values.into_iter().enumerate() {
                match v {
                    Value::Object(fields) => incidents.push(RawIncident { chunk_index: c.chunk_index, fields }),
                    other => {
                        let w = NormalizeWarning::NotAnObject { chunk_index: c.chunk_index, position, found: kind_of(&other).to_string() };
                        warn!("{w}");
                        warnings.push(w);
                    }
                }
            }
        }
        IncidentCollection { incidents, warnings, contributing_responses }
    }

    fn warn(&mut self, w: NormalizeWarning) {
        warn!("{w}");
        self.warnings.push(w);
    }
}

/// Convenience over a full set of replies.
pub fn normalize_responses<'a, I>(responses: I) -> IncidentCollection
where
    I: IntoIterator<Item = &'a RawModelResponse>,
{
    let mut n = IncidentNormalizer::new();
    for r in responses {
        n.push(r);
    }
    n.finish()
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn excerpt(s: &str) -> String {
    let t = s.trim();
    match t.char_indices().nth(120) {
        Some((i, _)) => format!("{}...", &t[..i]),
        None => t.to_string(),
    }
}
