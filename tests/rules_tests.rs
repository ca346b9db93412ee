use incidentscope::enrich::RiskLevel;
use incidentscope::prompt::OutputSchema;
use incidentscope::record::parse_line;
use incidentscope::rules::{evaluate, scan, supplement, Rule, RuleExtractor};
use serde_json::Value;

const MLOPEZ: &str = "2025-06-28,23:09:08,Error,Security,36887,Suspicious Connection,A suspicious connection was made to IP: 203.0.113.45 by MLopez.";

const MIXED: &str = "Date,Time,LogLevel,Source,EventID,Category,Description
2025-06-28,01:00:00,Information,Security,4624,Logon,An account was successfully logged on. User: jdoe
2025-06-28,02:22:48,Warning,Security,4688,Process Creation,User Intern launched a suspicious process powershell.exe -enc.
2025-06-28,03:09:22,Error,Security,4740,Account Lockout,A user account was locked out. Account: Intern.
2025-06-28,04:00:00,Information,Security,1102,Audit Log Cleared,The audit log was cleared by admin.
2025-06-28,05:00:00,Information,Security,4663,Object Access,Mass download of finance share by user bsmith.
not a log line
";

#[test]
fn suspicious_connection_rates_high() {
    let rec = parse_line(MLOPEZ).unwrap();
    let m = evaluate(&rec).unwrap();
    assert_eq!(m.risk, RiskLevel::High);
    assert!(m.rules.contains(&Rule::SuspiciousConnection));
    assert!(m.rules.contains(&Rule::ErrorLevel));
    assert_eq!(m.recommended_action(), "Suspend user access and investigate");
}

#[test]
fn single_line_becomes_one_per_line_incident() {
    let mut ex = RuleExtractor::new(OutputSchema::PerLine);
    let found = ex.incidents(MLOPEZ);
    assert_eq!(found.len(), 1);
    let inc = &found[0];
    assert_eq!(inc["risk_level"], "High");
    assert_eq!(inc["details"]["user"], "MLopez");
    assert_eq!(inc["details"]["timestamp"], "2025-06-28 23:09:08");
    assert_eq!(inc["details"]["event"], MLOPEZ);
    assert_eq!(inc["incident_id"], "INC20250628-0001");
}

#[test]
fn benign_lines_produce_nothing() {
    let rec = parse_line("2025-06-28,01:00:00,Information,Security,4624,Logon,An account was successfully logged on. User: jdoe").unwrap();
    assert!(evaluate(&rec).is_none());
}

#[test]
fn scan_skips_header_and_junk_and_keeps_order() {
    let hits = scan(MIXED);
    let risks: Vec<RiskLevel> = hits.iter().map(|(_, m)| m.risk).collect();
    assert_eq!(risks, vec![RiskLevel::Medium, RiskLevel::Medium, RiskLevel::High, RiskLevel::Critical]);
    let users: Vec<Option<&str>> = hits.iter().map(|(r, _)| r.user.as_deref()).collect();
    assert_eq!(users, vec![Some("Intern"), Some("Intern"), Some("admin"), Some("bsmith")]);
}

#[test]
fn array_schema_carries_top_level_user_and_iso_timestamp() {
    let mut ex = RuleExtractor::new(OutputSchema::IncidentArray);
    let found = ex.incidents(MIXED);
    assert_eq!(found.len(), 4);
    assert_eq!(found[3]["user"], "bsmith");
    assert_eq!(found[3]["timestamp"], "2025-06-28T05:00:00");
    assert_eq!(found[3]["details"]["severity_score"], 10);
    let rendered: Value = serde_json::from_str(&ex.render(found)).unwrap();
    assert_eq!(rendered.as_array().map(Vec::len), Some(4));
    assert_eq!(ex.render(Vec::new()), "[]");
}

#[test]
fn numbering_continues_across_calls() {
    let mut ex = RuleExtractor::new(OutputSchema::PerLine);
    ex.incidents(MLOPEZ);
    let second = ex.incidents(MLOPEZ);
    assert_eq!(second[0]["incident_id"], "INC20250628-0002");
}

#[test]
fn supplement_skips_lines_already_reported() {
    let mut ex = RuleExtractor::new(OutputSchema::PerLine);
    let reported = ex.incidents("2025-06-28,03:09:22,Error,Security,4740,Account Lockout,A user account was locked out. Account: Intern.");
    let refs: Vec<_> = reported.iter().collect();
    let extra = supplement(&mut ex, MIXED, &refs);
    let stamps: Vec<&str> = extra.iter().map(|m| m["details"]["timestamp"].as_str().unwrap()).collect();
    assert_eq!(stamps, vec!["2025-06-28 02:22:48", "2025-06-28 04:00:00", "2025-06-28 05:00:00"]);
}
