use crate::queue::ChunkSender;
use serde::Serialize;
use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A batch of consecutive raw log lines. `text` holds the lines exactly as
/// read, terminators included.
#[derive(Debug, PartialEq, Eq)]
pub struct LogChunk {
    pub index: usize,
    pub text: String,
    pub line_count: usize,
}

impl LogChunk {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }

    pub fn is_empty(&self) -> bool {
        self.line_count == 0
    }
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub lines_per_chunk: usize,
    pub delay: Duration,
    pub skip_header: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self { lines_per_chunk: 5, delay: Duration::from_secs(1), skip_header: false }
    }
}

/// What a chunk read produced. A `Failed` read still hands back the complete
/// lines gathered before the error.
#[derive(Debug)]
pub enum ChunkRead {
    Full(LogChunk),
    Partial(LogChunk),
    Failed(Option<LogChunk>, io::Error),
    Exhausted,
}

/// Pulls fixed-size batches of lines off a reader.
pub struct ChunkProducer<R> {
    reader: R,
    lines_per_chunk: usize,
    next_index: usize,
    header_pending: bool,
    done: bool,
}

impl<R: BufRead> ChunkProducer<R> {
    pub fn new(reader: R, lines_per_chunk: usize) -> Self {
        Self {
            reader,
            lines_per_chunk: lines_per_chunk.max(1),
            next_index: 1,
            header_pending: false,
            done: false,
        }
    }

    pub fn skip_header(mut self, skip: bool) -> Self {
        self.header_pending = skip;
        self
    }

    pub fn next_chunk(&mut self) -> ChunkRead {
        if self.done {
            return ChunkRead::Exhausted;
        }
        if self.header_pending {
            self.header_pending = false;
            let mut header = String::new();
            match self.reader.read_line(&mut header) {
                Ok(0) => {
                    self.done = true;
                    return ChunkRead::Exhausted;
                }
                Ok(_) => debug!(header = header.trim_end(), "skipped header line"),
                Err(e) => {
                    self.done = true;
                    return ChunkRead::Failed(None, e);
                }
            }
        }

        let mut text = String::new();
        let mut lines = 0usize;
        let mut line = String::new();
        while lines < self.lines_per_chunk {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    text.push_str(&line);
                    lines += 1;
                }
                Err(e) => {
                    self.done = true;
                    return ChunkRead::Failed(self.take_chunk(text, lines), e);
                }
            }
        }

        match self.take_chunk(text, lines) {
            None => {
                self.done = true;
                ChunkRead::Exhausted
            }
            Some(chunk) if lines == self.lines_per_chunk => ChunkRead::Full(chunk),
            Some(chunk) => {
                self.done = true;
                ChunkRead::Partial(chunk)
            }
        }
    }

    /// True when the reader has no more bytes. Errors count as "more input" so
    /// the next read surfaces them.
    pub fn at_eof(&mut self) -> bool {
        matches!(self.reader.fill_buf(), Ok(buf) if buf.is_empty())
    }

    fn take_chunk(&mut self, text: String, lines: usize) -> Option<LogChunk> {
        if lines == 0 {
            return None;
        }
        let chunk = LogChunk { index: self.next_index, text, line_count: lines };
        self.next_index += 1;
        Some(chunk)
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProducerReport {
    pub chunks: usize,
    pub lines: usize,
    pub stopped: bool,
    /// The thread was still blocked in a read when the caller gave up on it.
    pub detached: bool,
    pub error: Option<String>,
}

/// Owner of the background producer thread.
///
/// Dropping the handle requests a stop and detaches the thread.
pub struct ProducerHandle {
    stop: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<ProducerReport>>,
}

impl ProducerHandle {
    /// Ask the producer to send the end-of-stream marker and exit at its next
    /// suspension point.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }

    pub fn join(mut self) -> ProducerReport {
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(report)) => report,
            Some(Err(_)) => ProducerReport {
                error: Some("producer thread panicked".into()),
                ..Default::default()
            },
            None => ProducerReport::default(),
        }
    }

    /// Joins if the thread exits within `grace`. A thread stuck in a blocking
    /// read is detached instead and reported as such.
    pub fn join_within(self, grace: Duration) -> ProducerReport {
        let deadline = Instant::now() + grace;
        while let Some(t) = &self.thread {
            if t.is_finished() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("producer still blocked on its source; detaching");
                return ProducerReport { stopped: true, detached: true, ..Default::default() };
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.join()
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs a `ChunkProducer` on a background thread, feeding `sender` and
/// finishing the stream with exactly one end-of-stream marker.
pub fn spawn_producer<R>(reader: R, opts: ProducerOptions, sender: ChunkSender) -> io::Result<ProducerHandle>
where
    R: BufRead + Send + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel();
    let thread = thread::Builder::new()
        .name("chunk-producer".into())
        .spawn(move || {
            let producer = ChunkProducer::new(reader, opts.lines_per_chunk).skip_header(opts.skip_header);
            produce(producer, opts.delay, sender, stop_rx)
        })?;
    Ok(ProducerHandle { stop: Some(stop_tx), thread: Some(thread) })
}

fn produce<R: BufRead>(
    mut producer: ChunkProducer<R>,
    delay: Duration,
    sender: ChunkSender,
    stop: Receiver<()>,
) -> ProducerReport {
    let mut report = ProducerReport::default();
    loop {
        if stop_requested(&stop) {
            report.stopped = true;
            break;
        }
        let (chunk, full) = match producer.next_chunk() {
            ChunkRead::Full(c) => (c, true),
            ChunkRead::Partial(c) => (c, false),
            ChunkRead::Exhausted => break,
            ChunkRead::Failed(rest, e) => {
                warn!(error = %e, "log source read failed; ending stream early");
                report.error = Some(e.to_string());
                if let Some(c) = rest {
                    report.lines += c.line_count;
                    report.chunks += 1;
                    let _ = sender.put(c);
                }
                break;
            }
        };
        let index = chunk.index;
        report.lines += chunk.line_count;
        report.chunks += 1;
        debug!(chunk = index, lines = chunk.line_count, "queued chunk");
        if sender.put(chunk).is_err() {
            debug!(chunk = index, "consumer gone; producer exiting");
            return report;
        }
        if !full || producer.at_eof() {
            continue;
        }
        // Pace only between full chunks; a stop request cuts the wait short.
        match stop.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                report.stopped = true;
                break;
            }
        }
    }
    info!(chunks = report.chunks, lines = report.lines, stopped = report.stopped, "producer finished");
    sender.finish();
    report
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(mpsc::TryRecvError::Empty))
}
