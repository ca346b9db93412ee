use incidentscope::config::PipelineConfig;
use incidentscope::extract::{ExtractionError, ExtractionRequest, ExtractionService, SessionStrategy};
use incidentscope::pipeline::{enrich_responses, run_pipeline, run_source, PipelineError};
use incidentscope::prompt::OutputSchema;
use incidentscope::rules::{RuleExtractor, RuleMode};
use serde_json::json;
use std::collections::VecDeque;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Replays canned replies in call order and records the sessions it saw.
struct Scripted {
    replies: VecDeque<Result<String, ExtractionError>>,
    sessions: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    fn new(replies: Vec<Result<String, ExtractionError>>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let sessions = Arc::new(Mutex::new(Vec::new()));
        (Self { replies: replies.into(), sessions: sessions.clone() }, sessions)
    }
}

impl ExtractionService for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&mut self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        self.sessions.lock().unwrap().push(request.session_id.to_string());
        self.replies.pop_front().unwrap_or_else(|| Ok(String::new()))
    }
}

fn fast_config(lines_per_chunk: usize) -> PipelineConfig {
    PipelineConfig {
        lines_per_chunk,
        delay_between_chunks: 0.0,
        poll_timeout: 0.05,
        ..PipelineConfig::default()
    }
}

fn log_lines(n: usize) -> String {
    (0..n)
        .map(|i| format!("2025-06-28,{:02}:00:00,Information,Security,4624,Logon,An account was successfully logged on. User: u{i}\n", i % 24))
        .collect()
}

fn incident(id: &str, hour: u32) -> serde_json::Value {
    json!({
        "incident_id": id,
        "summary": format!("incident {id}"),
        "risk_level": "High",
        "user": format!("user-{id}"),
        "timestamp": format!("2025-06-28T{hour:02}:00:00Z"),
        "recommended_action": "Suspend user access and investigate",
        "details": {"activity_type": "Logon"}
    })
}

#[test]
fn failed_chunk_does_not_sink_the_run() {
    let (svc, _) = Scripted::new(vec![
        Ok(json!([incident("a", 1)]).to_string()),
        Err(ExtractionError::Transport("connection reset".into())),
        Ok(json!([incident("c", 3)]).to_string()),
    ]);
    let cancel = AtomicBool::new(false);
    let out = run_source(Cursor::new(log_lines(6).into_bytes()), &fast_config(2), svc, &cancel).unwrap();
    assert_eq!(out.chunks_received, 3);
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].chunk_index, 2);
    let chunks: Vec<usize> = out.collection.incidents.iter().map(|i| i.chunk_index).collect();
    assert_eq!(chunks, vec![1, 3]);
    assert_eq!(out.table.len(), 2);
    assert!(!out.cancelled);
}

#[test]
fn collection_follows_chunk_order() {
    let (svc, _) = Scripted::new(vec![
        Ok(json!([incident("1a", 5), incident("1b", 6), incident("1c", 7)]).to_string()),
        Ok(incident("2a", 1).to_string()),
        Ok(format!("Found two:\n{}\n\n{}", incident("3a", 9), incident("3b", 2))),
    ]);
    let cancel = AtomicBool::new(false);
    let out = run_source(Cursor::new(log_lines(3).into_bytes()), &fast_config(1), svc, &cancel).unwrap();
    let ids: Vec<&str> = out.collection.incidents.iter().map(|i| i.fields["incident_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["1a", "1b", "1c", "2a", "3a", "3b"]);
    // Table is re-sorted by time.
    assert_eq!(out.table.rows[0].incident_id.as_deref(), Some("3a"));
    assert_eq!(out.summary.total_events, 6);
}

#[test]
fn prose_reply_is_a_warning_not_an_error() {
    let (svc, _) = Scripted::new(vec![Ok("I cannot determine risk".into()), Ok(json!([incident("b", 4)]).to_string())]);
    let cancel = AtomicBool::new(false);
    let out = run_source(Cursor::new(log_lines(2).into_bytes()), &fast_config(1), svc, &cancel).unwrap();
    assert_eq!(out.collection.warnings.len(), 1);
    assert_eq!(out.table.len(), 1);
    assert!(out.failures.is_empty());
}

#[test]
fn each_chunk_gets_its_own_session() {
    let (svc, seen) = Scripted::new(Vec::new());
    let cfg = PipelineConfig { session_id: Some("42".into()), ..fast_config(2) };
    let cancel = AtomicBool::new(false);
    run_source(Cursor::new(log_lines(5).into_bytes()), &cfg, svc, &cancel).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["42-chunk-1", "42-chunk-2", "42-chunk-3"]);

    let (svc, seen) = Scripted::new(Vec::new());
    let cfg = PipelineConfig { session: SessionStrategy::Shared, ..cfg };
    run_source(Cursor::new(log_lines(4).into_bytes()), &cfg, svc, &cancel).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["42", "42"]);
}

#[test]
fn missing_column_leaves_an_empty_table() {
    let mut bad = incident("x", 1);
    bad.as_object_mut().unwrap().remove("summary");
    let (svc, _) = Scripted::new(vec![Ok(json!([bad]).to_string())]);
    let cancel = AtomicBool::new(false);
    let out = run_source(Cursor::new(log_lines(1).into_bytes()), &fast_config(5), svc, &cancel).unwrap();
    assert_eq!(out.collection.len(), 1);
    assert!(out.table.is_empty());
    assert!(out.schema_error.unwrap().contains("summary"));
}

#[test]
fn rule_extractor_end_to_end() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "Date,Time,LogLevel,Source,EventID,Category,Description").unwrap();
    write!(file, "{}", log_lines(4)).unwrap();
    writeln!(file, "2025-06-28,23:09:08,Error,Security,36887,Suspicious Connection,A suspicious connection was made to IP: 203.0.113.45 by MLopez.").unwrap();
    file.flush().unwrap();

    let cfg = PipelineConfig {
        input_filename: file.path().to_path_buf(),
        skip_header: true,
        ..fast_config(5)
    };
    let cancel = AtomicBool::new(false);
    let out = run_pipeline(&cfg, RuleExtractor::new(OutputSchema::PerLine), &cancel).unwrap();
    assert_eq!(out.chunks_received, 1);
    assert_eq!(out.producer.lines, 5);
    assert_eq!(out.table.len(), 1);
    let row = &out.table.rows[0];
    assert_eq!(row.user, "MLopez");
    assert_eq!(row.details["timestamp"], "2025-06-28 23:09:08");
    assert_eq!(row.risk_level.as_str(), "High");
}

#[test]
fn rule_backstop_fills_in_what_the_service_missed() {
    let text = "2025-06-28,03:09:22,Error,Security,4740,Account Lockout,A user account was locked out. Account: Intern.\n\
                2025-06-28,23:09:08,Error,Security,36887,Suspicious Connection,A suspicious connection was made to IP: 203.0.113.45 by MLopez.\n";
    let reported = json!({
        "incident_id": "svc-1",
        "summary": "Intern locked out",
        "risk_level": "Medium",
        "recommended_action": "Notify security team",
        "details": {"user": "Intern", "timestamp": "2025-06-28 03:09:22"}
    });
    let (svc, _) = Scripted::new(vec![Ok(reported.to_string())]);
    let cfg = PipelineConfig { rules: RuleMode::Supplement, ..fast_config(5) };
    let cancel = AtomicBool::new(false);
    let out = run_source(Cursor::new(text.as_bytes().to_vec()), &cfg, svc, &cancel).unwrap();
    let users: Vec<&str> = out.table.rows.iter().map(|r| r.user.as_str()).collect();
    assert_eq!(users, vec!["MLopez", "Intern"]);
    assert_eq!(out.collection.contributing_responses, 1);
}

#[test]
fn cancel_stops_a_slow_producer() {
    let (svc, _) = Scripted::new(Vec::new());
    let cfg = PipelineConfig { delay_between_chunks: 30.0, ..fast_config(1) };
    let cancel = AtomicBool::new(true);
    let started = Instant::now();
    let out = run_source(Cursor::new(log_lines(10).into_bytes()), &cfg, svc, &cancel).unwrap();
    assert!(out.cancelled);
    assert!(out.producer.stopped);
    assert!(!out.producer.detached);
    assert!(out.chunks_received <= 1);
    assert!(started.elapsed() < Duration::from_secs(10));
}

/// A source whose first read blocks until the release sender is dropped.
struct StalledSource {
    release: mpsc::Receiver<()>,
}

impl Read for StalledSource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        let _ = self.release.recv();
        Ok(0)
    }
}

#[test]
fn cancel_returns_while_the_source_is_stuck_in_a_read() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    thread::spawn(move || {
        let (svc, _) = Scripted::new(Vec::new());
        let source = BufReader::new(StalledSource { release: release_rx });
        let _ = done_tx.send(run_source(source, &fast_config(2), svc, &flag));
    });

    thread::sleep(Duration::from_millis(300));
    cancel.store(true, Ordering::SeqCst);
    let out = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("run kept waiting on a blocked source after cancel")
        .unwrap();
    assert!(out.cancelled);
    assert!(out.producer.stopped);
    assert!(out.producer.detached);
    assert_eq!(out.chunks_received, 0);
    drop(release_tx);
}

#[test]
fn missing_source_is_reported() {
    let cfg = PipelineConfig { input_filename: "/nonexistent/sys_log.txt".into(), ..fast_config(5) };
    let cancel = AtomicBool::new(false);
    let err = run_pipeline(&cfg, RuleExtractor::new(OutputSchema::PerLine), &cancel).unwrap_err();
    assert!(matches!(err, PipelineError::Source { .. }));
}

#[test]
fn invalid_config_is_rejected_before_reading() {
    let cfg = PipelineConfig { lines_per_chunk: 0, ..PipelineConfig::default() };
    let cancel = AtomicBool::new(false);
    let err = run_source(Cursor::new(Vec::<u8>::new()), &cfg, RuleExtractor::new(OutputSchema::PerLine), &cancel).unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[test]
fn saved_replies_can_be_enriched_offline() {
    let (col, table) = enrich_responses(&[json!([[incident("only", 10)]]).to_string()]);
    assert_eq!(col.len(), 1);
    let table = table.unwrap();
    assert_eq!(table.rows[0].hour, 10);
}
