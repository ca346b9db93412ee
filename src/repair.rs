//! Recovering JSON from free-text service replies.
//!
//! Stages run in order and the first that yields a value wins:
//! `Strict` parse of the whole reply, then a scan over every `{`/`[` in the
//! reply (after dropping Markdown fences). Each start is parsed as one or more
//! concatenated values and the candidate covering the most text is kept:
//! `Trimmed` for a single value, `Stream` for several. Anything else is dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStage {
    Strict,
    Trimmed,
    Stream,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub value: Value,
    pub stage: RepairStage,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepairError {
    #[error("empty response")]
    Empty,
    #[error("no JSON object or array found")]
    NoJson,
    #[error("unparsable JSON: {0}")]
    Invalid(String),
}

static RE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*```[A-Za-z0-9_-]*\s*$").unwrap()
});

pub fn repair(text: &str) -> Result<Repaired, RepairError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RepairError::Empty);
    }
    let strict_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(Repaired { value, stage: RepairStage::Strict }),
        Err(e) => e.to_string(),
    };

    let unfenced = RE_FENCE.replace_all(trimmed, "");
    let body = unfenced.as_ref();

    // Bracketed prose ("[chunk 1]", "{no issues}") fails to parse or parses
    // small, so every start is tried and the widest parse wins.
    let mut best: Option<(usize, Vec<Value>)> = None;
    let mut first_err: Option<String> = None;
    let mut found_start = false;
    let mut pos = 0;
    while let Some(offset) = body[pos..].find(['{', '[']) {
        found_start = true;
        let start = pos + offset;
        match parse_stream(&body[start..]) {
            Ok((values, consumed)) if !values.is_empty() => {
                if best.as_ref().map_or(true, |(widest, _)| consumed > *widest) {
                    best = Some((consumed, values));
                }
                pos = start + consumed;
            }
            Ok(_) => pos = start + 1,
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
                pos = start + 1;
            }
        }
    }

    match best {
        Some((_, mut values)) if values.len() == 1 => {
            let value = values.pop().unwrap_or(Value::Null);
            Ok(Repaired { value, stage: RepairStage::Trimmed })
        }
        Some((_, values)) => Ok(Repaired { value: Value::Array(values), stage: RepairStage::Stream }),
        None if !found_start => Err(RepairError::NoJson),
        None => Err(RepairError::Invalid(first_err.unwrap_or(strict_err))),
    }
}

/// Parses concatenated values such as `{..}\n\n{..}` or `{..},{..}` from the
/// start of `body`. Prose between values ends the stream. Returns the values
/// and the number of bytes they span.
fn parse_stream(body: &str) -> Result<(Vec<Value>, usize), String> {
    let mut out = Vec::new();
    let mut consumed = 0;
    loop {
        let rest = &body[consumed..];
        let candidate = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if !(candidate.starts_with('{') || candidate.starts_with('[')) {
            break;
        }
        let skipped = rest.len() - candidate.len();
        let mut it = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
        match it.next() {
            Some(Ok(v)) => {
                out.push(v);
                consumed += skipped + it.byte_offset();
            }
            Some(Err(e)) => {
                if out.is_empty() {
                    return Err(e.to_string());
                }
                break;
            }
            None => break,
        }
    }
    Ok((out, consumed))
}
