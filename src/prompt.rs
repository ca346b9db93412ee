use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which incident shape the extraction service is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    /// One JSON object per anomalous line, `user`/`timestamp` under `details`.
    #[default]
    PerLine,
    /// A single JSON array, `user`/`timestamp` at the top level.
    IncidentArray,
}

impl OutputSchema {
    pub fn instructions(self) -> &'static str {
        match self {
            OutputSchema::PerLine => PER_LINE_INSTRUCTIONS,
            OutputSchema::IncidentArray => INCIDENT_ARRAY_INSTRUCTIONS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputSchema::PerLine => "per_line",
            OutputSchema::IncidentArray => "incident_array",
        }
    }
}

impl fmt::Display for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputSchema {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "per_line" | "line" => Ok(OutputSchema::PerLine),
            "incident_array" | "array" => Ok(OutputSchema::IncidentArray),
            other => Err(format!("unknown output schema '{other}' (expected per_line | incident_array)")),
        }
    }
}

const PER_LINE_INSTRUCTIONS: &str = r#"You are a security monitoring agent reviewing system logs for insider threats and data theft.

Each input line has the form:
<Date>,<Time>,<Level>,<Source>,<EventID>,<Category>,<Description>

Process every line separately. Never merge lines and never reference other lines.
A line is anomalous if:
- Level = "Error"
- Category = "Suspicious Connection"
- Category = "Process Creation" and the description mentions a suspicious process
- EventID = 1102 (audit log cleared)
- EventID = 4740 (account lockout)

Risk levels:
- Medium: suspicious process creation or account lockout
- High: suspicious connection or audit log cleared
- Critical: clear evidence of severe compromise such as mass data exfiltration
- Low: anything else; produce no output

Recommended actions:
- Medium: Notify security team
- High: Suspend user access and investigate
- Critical: Lock workstation and escalate immediately

For each anomalous line with risk Medium or higher, output exactly one JSON object:
{
  "incident_id": "<unique identifier>",
  "summary": "<who, what, when, risk level, recommended action>",
  "risk_level": "<Medium|High|Critical>",
  "recommended_action": "<action>",
  "details": {
    "user": "<username if known>",
    "event": "<the original log line>",
    "timestamp": "<date> <time>"
  }
}
Output nothing for Low risk or non-anomalous lines."#;

const INCIDENT_ARRAY_INSTRUCTIONS: &str = r#"You are a security analyst that reviews log data for insider threats and data theft.

Always respond with a valid JSON array of incidents and nothing else. Each incident:
{
  "summary": "Brief description of the security incident",
  "risk_level": "Critical|High|Medium|Low",
  "user": "username involved",
  "timestamp": "ISO format timestamp",
  "recommended_action": "What should be done about this incident",
  "details": {
    "timestamp": "ISO format timestamp",
    "user": "username",
    "ip_address": "IP address",
    "session_id": "session identifier",
    "activity_type": "type of activity",
    "severity_score": 1-10
  }
}
Look for suspicious activity, unauthorized access attempts and data exfiltration.
Return [] when nothing is suspicious."#;
