//! FIFO hand-off between the chunk producer and the extraction loop.
//!
//! The end-of-stream marker can only be sent by consuming the sender, so a
//! stream carries at most one of them.

use crate::chunker::LogChunk;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug)]
enum Message {
    Chunk(LogChunk),
    EndOfStream,
}

#[derive(Debug, Error)]
#[error("chunk queue receiver dropped")]
pub struct QueueClosed;

/// Outcome of one poll. `TimedOut` only means "nothing yet"; callers poll again.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    Chunk(LogChunk),
    TimedOut,
    EndOfStream,
}

enum Tx {
    Unbounded(Sender<Message>),
    Bounded(SyncSender<Message>),
}

pub struct ChunkSender {
    tx: Tx,
}

pub struct ChunkReceiver {
    rx: Receiver<Message>,
    finished: bool,
}

/// `None` gives an unbounded queue; `Some(n)` blocks `put` once `n` chunks
/// are waiting.
pub fn chunk_queue(capacity: Option<usize>) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = match capacity {
        Some(n) => {
            let (tx, rx) = mpsc::sync_channel(n.max(1));
            (Tx::Bounded(tx), rx)
        }
        None => {
            let (tx, rx) = mpsc::channel();
            (Tx::Unbounded(tx), rx)
        }
    };
    (ChunkSender { tx }, ChunkReceiver { rx, finished: false })
}

impl ChunkSender {
    pub fn put(&self, chunk: LogChunk) -> Result<(), QueueClosed> {
        self.send(Message::Chunk(chunk)).map_err(|_| QueueClosed)
    }

    /// Enqueue the end-of-stream marker.
    pub fn finish(self) {
        let _ = self.send(Message::EndOfStream);
    }

    fn send(&self, msg: Message) -> Result<(), Message> {
        match &self.tx {
            Tx::Unbounded(tx) => tx.send(msg).map_err(|e| e.0),
            Tx::Bounded(tx) => tx.send(msg).map_err(|e| e.0),
        }
    }
}

impl ChunkReceiver {
    pub fn get(&mut self, timeout: Duration) -> Poll {
        if self.finished {
            return Poll::EndOfStream;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(Message::Chunk(c)) => Poll::Chunk(c),
            Ok(Message::EndOfStream) => {
                self.finished = true;
                Poll::EndOfStream
            }
            Err(RecvTimeoutError::Timeout) => Poll::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("chunk producer went away without an end-of-stream marker");
                self.finished = true;
                Poll::EndOfStream
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
