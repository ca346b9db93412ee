use crate::enrich::{IncidentRow, IncidentTable, RiskLevel};
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardSummary {
    pub total_events: usize,
    pub critical_events: usize,
    pub high_events: usize,
    pub suspicious_users: usize,
    pub by_risk_level: BTreeMap<String, usize>,
    pub by_hour: BTreeMap<u32, usize>,
    pub time_range: Option<(String, String)>,
}

impl DashboardSummary {
    pub fn from_rows(rows: &[IncidentRow]) -> Self {
        let count_risk = |r: RiskLevel| rows.iter().filter(|row| row.risk_level == r).count();
        let by_risk_level = rows
            .iter()
            .map(|r| r.risk_level.as_str().to_string())
            .counts()
            .into_iter()
            .collect();
        let by_hour = rows.iter().map(|r| r.hour).counts().into_iter().collect();
        let time_range = rows
            .iter()
            .map(|r| r.timestamp)
            .minmax()
            .into_option()
            .map(|(lo, hi)| (lo.to_string(), hi.to_string()));
        Self {
            total_events: rows.len(),
            critical_events: count_risk(RiskLevel::Critical),
            high_events: count_risk(RiskLevel::High),
            suspicious_users: rows.iter().map(|r| r.user.as_str()).unique().count(),
            by_risk_level,
            by_hour,
            time_range,
        }
    }

    pub fn from_table(table: &IncidentTable) -> Self {
        Self::from_rows(&table.rows)
    }
}

/// Risk/user filter. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub risk_levels: Vec<RiskLevel>,
    pub users: Vec<String>,
}

impl IncidentFilter {
    pub fn is_empty(&self) -> bool {
        self.risk_levels.is_empty() && self.users.is_empty()
    }

    pub fn matches(&self, row: &IncidentRow) -> bool {
        (self.risk_levels.is_empty() || self.risk_levels.contains(&row.risk_level))
            && (self.users.is_empty() || self.users.iter().any(|u| u == &row.user))
    }

    pub fn apply(&self, table: &IncidentTable) -> IncidentTable {
        IncidentTable {
            rows: table.rows.iter().filter(|r| self.matches(r)).cloned().collect(),
            dropped: table.dropped.clone(),
            warnings: table.warnings.clone(),
        }
    }
}

pub fn render_table(rows: &[IncidentRow]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<20} {:<14} {:<9} {:<40} {}\n", "Timestamp", "User", "Risk", "Recommended Action", "Summary"));
    for r in rows {
        out.push_str(&format!(
            "{:<20} {:<14} {:<9} {:<40} {}\n",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            clip(&r.user, 14),
            r.risk_level.as_str(),
            clip(&r.recommended_action, 40),
            r.summary
        ));
    }
    out
}

fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut t: String = s.chars().take(width.saturating_sub(1)).collect();
    t.push('~');
    t
}
