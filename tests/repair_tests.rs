use incidentscope::repair::{repair, RepairError, RepairStage};
use serde_json::json;

#[test]
fn clean_json_parses_strictly() {
    let r = repair(r#"[{"summary":"a"}]"#).unwrap();
    assert_eq!(r.stage, RepairStage::Strict);
    assert_eq!(r.value, json!([{"summary": "a"}]));
}

#[test]
fn strips_markdown_fences() {
    let text = "```json\n{\"summary\": \"fenced\", \"risk_level\": \"High\"}\n```";
    let r = repair(text).unwrap();
    assert_eq!(r.stage, RepairStage::Trimmed);
    assert_eq!(r.value["summary"], "fenced");
}

#[test]
fn trims_prose_around_a_single_value() {
    let text = "Here is what I found:\n[{\"summary\": \"braces } inside [strings]\"}]\nLet me know if you need more.";
    let r = repair(text).unwrap();
    assert_eq!(r.stage, RepairStage::Trimmed);
    assert_eq!(r.value[0]["summary"], "braces } inside [strings]");
}

#[test]
fn concatenated_objects_become_an_array() {
    let text = "{\"incident_id\": \"A\"}\n\n{\"incident_id\": \"B\"}\n\n{\"incident_id\": \"C\"}";
    let r = repair(text).unwrap();
    assert_eq!(r.stage, RepairStage::Stream);
    assert_eq!(r.value, json!([{"incident_id": "A"}, {"incident_id": "B"}, {"incident_id": "C"}]));
}

#[test]
fn prose_and_garbage_are_rejected() {
    assert_eq!(repair("   "), Err(RepairError::Empty));
    assert_eq!(repair("I cannot determine risk"), Err(RepairError::NoJson));
    assert!(matches!(repair("{ \"summary\": "), Err(RepairError::Invalid(_))));
}

#[test]
fn bracketed_prose_before_the_payload_is_skipped() {
    let text = "Analysis [chunk 1]:\n[{\"summary\":\"a\",\"risk_level\":\"High\"}]";
    let r = repair(text).unwrap();
    assert_eq!(r.stage, RepairStage::Trimmed);
    assert_eq!(r.value, json!([{"summary": "a", "risk_level": "High"}]));
}

#[test]
fn braced_prose_before_the_payload_is_skipped() {
    let text = "Note {no issues in line 3}. Incidents: {\"summary\":\"a\",\"risk_level\":\"Critical\"}";
    let r = repair(text).unwrap();
    assert_eq!(r.stage, RepairStage::Trimmed);
    assert_eq!(r.value, json!({"summary": "a", "risk_level": "Critical"}));
}

#[test]
fn widest_candidate_wins_over_a_small_leading_array() {
    let text = "Checked lines [1, 2]. Result:\n{\"incident_id\": \"A\"}\n{\"incident_id\": \"B\"}";
    let r = repair(text).unwrap();
    assert_eq!(r.stage, RepairStage::Stream);
    assert_eq!(r.value, json!([{"incident_id": "A"}, {"incident_id": "B"}]));
}
