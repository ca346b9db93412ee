use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use incidentscope::chat::ChatCompletionsService;
use incidentscope::chunker::{spawn_producer, ProducerOptions};
use incidentscope::config::{ExtractorKind, PipelineConfig};
use incidentscope::enrich::{IncidentTable, RiskLevel};
use incidentscope::extract::{ExtractionService, SessionStrategy};
use incidentscope::pipeline::{self, PipelineOutcome, SHUTDOWN_GRACE};
use incidentscope::prompt::OutputSchema;
use incidentscope::queue::{chunk_queue, Poll};
use incidentscope::report::{self, DashboardSummary, IncidentFilter};
use incidentscope::rules::{RuleExtractor, RuleMode};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tracing::{info, warn};

fn init_parallelism() {
    static START: Once = Once::new();
    START.call_once(|| {
        let n = num_cpus::get();
        let _ = rayon::ThreadPoolBuilder::new().num_threads(n).build_global();
    });
}

#[derive(Parser, Debug)]
#[command(name = "incidentscope", version, about = "Chunked security-log incident extraction")]
struct Cli {
    /// Log filter when RUST_LOG is unset (e.g. debug, incidentscope=trace)
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chunk a log, extract incidents and print the enriched table
    Run(RunArgs),
    /// Print chunks as the producer releases them
    Stream(StreamArgs),
    /// Normalize and enrich saved service replies
    Enrich(EnrichArgs),
    /// Run only the built-in rules over a log
    Rules(RulesArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Log file (`-` for stdin). Overrides the config file.
    #[arg(long = "input", short = 'i')]
    input: Option<String>,
    #[arg(long = "lines-per-chunk")]
    lines_per_chunk: Option<usize>,
    /// Seconds to wait between full chunks
    #[arg(long = "delay")]
    delay: Option<f64>,
    /// Drop the first line of the source
    #[arg(long = "skip-header", default_value_t = false)]
    skip_header: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON config file; flags below override it
    #[arg(long = "config", short = 'c')]
    config: Option<PathBuf>,
    #[command(flatten)]
    source: SourceArgs,
    /// rules | chat
    #[arg(long = "extractor")]
    extractor: Option<String>,
    #[arg(long = "endpoint")]
    endpoint: Option<String>,
    #[arg(long = "model")]
    model: Option<String>,
    /// per_line | incident_array
    #[arg(long = "schema")]
    schema: Option<OutputSchema>,
    /// per_chunk | shared
    #[arg(long = "session")]
    session: Option<SessionStrategy>,
    /// Reuse a fixed run/session id
    #[arg(long = "session-id")]
    session_id: Option<String>,
    /// off | supplement
    #[arg(long = "rules")]
    rules: Option<RuleMode>,
    #[arg(long = "queue-capacity")]
    queue_capacity: Option<usize>,
    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug)]
struct ViewArgs {
    /// Output format: json | table
    #[arg(long = "format", default_value = "json")]
    format: String,
    /// Keep only these risk levels. May be repeated.
    #[arg(long = "risk")]
    risk: Vec<RiskLevel>,
    /// Keep only these users. May be repeated.
    #[arg(long = "user")]
    user: Vec<String>,
    /// Print only the dashboard summary
    #[arg(long = "summary-only", default_value_t = false)]
    summary_only: bool,
}

#[derive(Args, Debug)]
struct StreamArgs {
    #[command(flatten)]
    source: SourceArgs,
}

#[derive(Args, Debug)]
struct EnrichArgs {
    /// Files holding one service reply each (`-` for stdin)
    #[arg(required = false)]
    responses: Vec<String>,
    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug)]
struct RulesArgs {
    /// Log file (`-` for stdin)
    input: String,
    /// per_line | incident_array
    #[arg(long = "schema", default_value = "incident_array")]
    schema: OutputSchema,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    incidentscope::logging::init_logging(cli.log_level.as_deref());
    init_parallelism();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let c = cancel.clone();
        let _ = ctrlc::set_handler(move || { c.store(true, Ordering::SeqCst); });
    }

    match cli.command {
        Command::Run(args) => cmd_run(args, &cancel),
        Command::Stream(args) => cmd_stream(args, &cancel),
        Command::Enrich(args) => cmd_enrich(args),
        Command::Rules(args) => cmd_rules(args),
    }
}

fn open_source(input: &str) -> anyhow::Result<Box<dyn BufRead + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let f = File::open(input).with_context(|| format!("cannot open log source {input}"))?;
    Ok(Box::new(BufReader::new(f)))
}

fn read_text(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).context("reading stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(input).with_context(|| format!("reading {input}"))
}

fn build_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(p) => PipelineConfig::from_file(p)?,
        None => PipelineConfig::default(),
    };
    let src = &args.source;
    if let Some(i) = &src.input {
        cfg.input_filename = PathBuf::from(i);
    }
    if let Some(n) = src.lines_per_chunk {
        cfg.lines_per_chunk = n;
    }
    if let Some(d) = src.delay {
        cfg.delay_between_chunks = d;
    }
    if src.skip_header {
        cfg.skip_header = true;
    }
    if let Some(k) = &args.extractor {
        cfg.extractor.kind = match k.to_ascii_lowercase().as_str() {
            "rules" => ExtractorKind::Rules,
            "chat" => ExtractorKind::Chat,
            other => bail!("unknown extractor '{other}' (expected rules | chat)"),
        };
    }
    if let Some(e) = &args.endpoint {
        cfg.extractor.endpoint = e.clone();
    }
    if let Some(m) = &args.model {
        cfg.extractor.model = m.clone();
    }
    if let Some(s) = args.schema {
        cfg.output_schema = s;
    }
    if let Some(s) = args.session {
        cfg.session = s;
    }
    if let Some(id) = &args.session_id {
        cfg.session_id = Some(id.clone());
    }
    if let Some(r) = args.rules {
        cfg.rules = r;
    }
    if let Some(q) = args.queue_capacity {
        cfg.queue_capacity = Some(q);
    }
    cfg.validate()?;
    Ok(cfg)
}

fn build_service(cfg: &PipelineConfig) -> anyhow::Result<Box<dyn ExtractionService>> {
    Ok(match cfg.extractor.kind {
        ExtractorKind::Rules => Box::new(RuleExtractor::new(cfg.output_schema)),
        ExtractorKind::Chat => {
            let svc = ChatCompletionsService::new(cfg.extractor.chat_settings())
                .context("configuring chat extraction service")?;
            Box::new(svc)
        }
    })
}

fn cmd_run(args: RunArgs, cancel: &AtomicBool) -> anyhow::Result<()> {
    let cfg = build_config(&args)?;
    let service = build_service(&cfg)?;
    let outcome: PipelineOutcome = if cfg.input_filename.as_os_str() == "-" {
        pipeline::run_source(BufReader::new(io::stdin()), &cfg, service, cancel)?
    } else {
        pipeline::run_pipeline(&cfg, service, cancel)?
    };
    if let Some(e) = &outcome.schema_error {
        eprintln!("[run] {e}");
    }
    emit(&outcome.table, &args.view, Some(&outcome))
}

fn cmd_stream(args: StreamArgs, cancel: &AtomicBool) -> anyhow::Result<()> {
    let src = &args.source;
    let input = src.input.clone().unwrap_or_else(|| "sys_log.txt".to_string());
    let lines_per_chunk = src.lines_per_chunk.unwrap_or(5);
    if lines_per_chunk == 0 {
        bail!("--lines-per-chunk must be a positive integer");
    }
    let delay = src.delay.unwrap_or(30.0);
    if !delay.is_finite() || delay < 0.0 {
        bail!("--delay must be a non-negative number of seconds");
    }
    let opts = ProducerOptions {
        lines_per_chunk,
        delay: Duration::from_secs_f64(delay),
        skip_header: src.skip_header,
    };

    let (tx, mut rx) = chunk_queue(None);
    let mut producer = spawn_producer(open_source(&input)?, opts, tx)
        .context("starting chunk producer")?;
    let mut drain_until: Option<Instant> = None;
    loop {
        match drain_until {
            None if cancel.load(Ordering::SeqCst) => {
                producer.stop();
                drain_until = Some(Instant::now() + SHUTDOWN_GRACE);
            }
            Some(deadline) if Instant::now() >= deadline => {
                warn!("no end of stream within the shutdown grace");
                break;
            }
            _ => {}
        }
        // Short polls once stopping so a blocked stdin read cannot hold us.
        let wait = if drain_until.is_some() { Duration::from_millis(100) } else { Duration::from_secs(1) };
        match rx.get(wait) {
            Poll::Chunk(chunk) => {
                println!("--- chunk {} ({} lines) ---", chunk.index, chunk.line_count);
                print!("{}", chunk.text);
                if !chunk.text.ends_with('\n') {
                    println!();
                }
            }
            Poll::TimedOut if drain_until.is_some() => break,
            Poll::TimedOut => continue,
            Poll::EndOfStream => break,
        }
    }
    let report = match drain_until {
        Some(_) => producer.join_within(SHUTDOWN_GRACE),
        None => producer.join(),
    };
    info!(
        chunks = report.chunks,
        lines = report.lines,
        stopped = report.stopped,
        detached = report.detached,
        "stream ended"
    );
    if let Some(e) = report.error {
        eprintln!("[stream] source ended early: {e}");
    }
    Ok(())
}

fn cmd_enrich(args: EnrichArgs) -> anyhow::Result<()> {
    let inputs = if args.responses.is_empty() {
        vec!["-".to_string()]
    } else {
        args.responses.clone()
    };
    let texts = inputs.iter().map(|p| read_text(p)).collect::<anyhow::Result<Vec<_>>>()?;
    let (collection, table) = pipeline::enrich_responses(&texts);
    for w in &collection.warnings {
        eprintln!("[enrich] {w}");
    }
    let table = table?;
    emit(&table, &args.view, None)
}

fn cmd_rules(args: RulesArgs) -> anyhow::Result<()> {
    let text = read_text(&args.input)?;
    let mut ex = RuleExtractor::new(args.schema);
    let found = ex.incidents(&text);
    println!("{}", ex.render(found));
    Ok(())
}

fn emit(table: &IncidentTable, view: &ViewArgs, outcome: Option<&PipelineOutcome>) -> anyhow::Result<()> {
    let filter = IncidentFilter { risk_levels: view.risk.clone(), users: view.user.clone() };
    let shown = filter.apply(table);
    let summary = DashboardSummary::from_table(&shown);
    if view.summary_only {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    match view.format.as_str() {
        "table" => {
            print!("{}", report::render_table(&shown.rows));
            println!(
                "\n{} events, {} critical, {} high, {} users",
                summary.total_events, summary.critical_events, summary.high_events, summary.suspicious_users
            );
            for d in &shown.dropped {
                eprintln!("[dropped] chunk {} #{}: {}", d.chunk_index, d.position, d.reason);
            }
        }
        "json" => {
            let value = match outcome {
                Some(o) if filter.is_empty() => serde_json::to_value(o)?,
                Some(o) => serde_json::json!({
                    "run_id": o.run_id,
                    "chunks_received": o.chunks_received,
                    "failures": o.failures,
                    "table": shown,
                    "summary": summary,
                    "cancelled": o.cancelled,
                }),
                None => serde_json::json!({ "table": shown, "summary": summary }),
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        other => bail!("unknown --format '{other}' (expected json | table)"),
    }
    Ok(())
}
