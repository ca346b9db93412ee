use crate::chunker::{spawn_producer, ProducerReport};
use crate::config::{ConfigError, PipelineConfig};
use crate::enrich::{self, IncidentTable};
use crate::extract::{new_run_id, ExtractionClient, ExtractionService};
use crate::normalize::{IncidentCollection, IncidentNormalizer};
use crate::queue::{chunk_queue, Poll};
use crate::report::DashboardSummary;
use crate::rules::{self, RuleExtractor, RuleMode};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long a cancelled run keeps draining before it stops waiting on the
/// producer.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot open log source {path}: {source}")]
    Source { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start chunk producer: {0}")]
    Spawn(io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub chunks_received: usize,
    pub failures: Vec<ChunkFailure>,
    pub collection: IncidentCollection,
    pub table: IncidentTable,
    /// Set when the collection failed validation; `table` is then empty.
    pub schema_error: Option<String>,
    pub summary: DashboardSummary,
    pub producer: ProducerReport,
    pub cancelled: bool,
}

/// Runs the whole pipeline over `config.input_filename`.
pub fn run_pipeline<S: ExtractionService>(
    config: &PipelineConfig,
    service: S,
    cancel: &AtomicBool,
) -> Result<PipelineOutcome, PipelineError> {
    config.validate()?;
    let path = &config.input_filename;
    let file = File::open(path).map_err(|source| PipelineError::Source { path: path.clone(), source })?;
    run_source(BufReader::new(file), config, service, cancel)
}

/// Same as `run_pipeline`, reading from an already-open source.
pub fn run_source<R, S>(
    reader: R,
    config: &PipelineConfig,
    service: S,
    cancel: &AtomicBool,
) -> Result<PipelineOutcome, PipelineError>
where
    R: BufRead + Send + 'static,
    S: ExtractionService,
{
    config.validate()?;
    let run_id = config.session_id.clone().unwrap_or_else(new_run_id);
    info!(
        run = %run_id,
        chunk_lines = config.lines_per_chunk,
        schema = %config.output_schema,
        sessions = %config.session,
        "starting run"
    );

    let (tx, mut rx) = chunk_queue(config.queue_capacity);
    let mut producer = spawn_producer(reader, config.producer_options(), tx)
        .map_err(PipelineError::Spawn)?;
    let mut client = ExtractionClient::new(service, run_id.clone(), config.session, config.output_schema);
    let mut backstop = (config.rules == RuleMode::Supplement)
        .then(|| RuleExtractor::new(config.output_schema));
    let mut normalizer = IncidentNormalizer::new();
    let mut failures = Vec::new();
    let mut chunks_received = 0usize;
    let mut drain_until: Option<Instant> = None;
    let poll = config.poll_timeout();

    loop {
        match drain_until {
            None if cancel.load(Ordering::SeqCst) => {
                info!("cancellation requested; stopping producer");
                producer.stop();
                drain_until = Some(Instant::now() + SHUTDOWN_GRACE);
            }
            Some(deadline) if Instant::now() >= deadline => {
                warn!("no end of stream within the shutdown grace; giving up on the producer");
                break;
            }
            _ => {}
        }
        let chunk = match rx.get(poll) {
            Poll::Chunk(c) => c,
            // A stopped producer that stays quiet is blocked on its source.
            Poll::TimedOut if drain_until.is_some() => break,
            Poll::TimedOut => {
                debug!("no chunk yet");
                continue;
            }
            Poll::EndOfStream => break,
        };
        chunks_received += 1;
        let index = chunk.index;
        info!(chunk = index, lines = chunk.line_count, "processing chunk");
        match client.extract(&chunk) {
            Ok(resp) => {
                let n = normalizer.push(&resp);
                debug!(chunk = index, values = n, "response recorded");
            }
            Err(e) => {
                warn!(chunk = index, error = %e, "extraction failed; skipping chunk");
                failures.push(ChunkFailure { chunk_index: index, error: e.to_string() });
            }
        }
        if let Some(rule_ex) = backstop.as_mut() {
            let extra = {
                let reported = normalizer.incidents_for(index);
                rules::supplement(rule_ex, &chunk.text, &reported)
            };
            if !extra.is_empty() {
                debug!(chunk = index, added = extra.len(), "rule backstop added incidents");
            }
            normalizer.push_supplement(index, extra);
        }
    }

    let cancelled = drain_until.is_some();
    let producer_report = if cancelled {
        producer.join_within(SHUTDOWN_GRACE)
    } else {
        producer.join()
    };
    if let Some(e) = &producer_report.error {
        warn!(error = %e, "log source ended early");
    }
    let collection = normalizer.finish();
    let (table, schema_error) = match enrich::enrich(&collection) {
        Ok(t) => (t, None),
        Err(e) => {
            error!("{e}");
            (IncidentTable::default(), Some(e.to_string()))
        }
    };
    let summary = DashboardSummary::from_table(&table);
    info!(
        chunks = chunks_received,
        failed = failures.len(),
        incidents = table.len(),
        "run complete"
    );
    Ok(PipelineOutcome {
        run_id,
        chunks_received,
        failures,
        collection,
        table,
        schema_error,
        summary,
        producer: producer_report,
        cancelled,
    })
}

/// Normalizes and enriches saved service replies without running the stream.
pub fn enrich_responses(texts: &[String]) -> (IncidentCollection, Result<IncidentTable, enrich::SchemaError>) {
    let mut normalizer = IncidentNormalizer::new();
    for (i, text) in texts.iter().enumerate() {
        normalizer.push(&crate::extract::RawModelResponse { chunk_index: i + 1, text: text.clone() });
    }
    let collection = normalizer.finish();
    let table = enrich::enrich(&collection);
    (collection, table)
}
