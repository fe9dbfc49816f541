//! Per-direction reader tasks.
//!
//! Each half-connection gets a reader task presenting a synchronous
//! byte-reader view over the chunks its stream consumer delivers. Reads
//! block until a chunk arrives or the channel closes; channel close is the
//! sole end-of-stream signal from the assembler side. On end-of-stream a
//! reader runs its cleanup exactly once: stream persistence, a
//! client-side request for conversation persistence, and in whichever
//! half closes last the requested persistence and credential harvesting
//! over the complete conversation.

pub mod factory;

pub use factory::{BidiFactory, Coordinator};

use crate::services::service_class;

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use colored::Colorize;
use crossbeam::channel::Receiver;
use crossbeam::sync::WaitGroup;

use self::factory::PipelineEnv;

/// Blocking byte-reader surface over the chunk channel. A closed channel
/// reads as end-of-stream; a residual slice is buffered between reads.
pub struct ByteReader {
    rx: Receiver<Vec<u8>>,
    residual: Vec<u8>,
    pos: usize,
}

impl ByteReader {
    pub(crate) fn new(rx: Receiver<Vec<u8>>) -> Self {
        ByteReader {
            rx,
            residual: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ByteReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.residual.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.residual = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.residual.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.residual[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Conversation state shared by the two reader halves of one connection.
pub(crate) struct ConvShared {
    pub(crate) buffers: Mutex<ConvBuffers>,
    /// Reader halves still running; the last one out triggers any pending
    /// combined analysis.
    pub(crate) open_halves: AtomicUsize,
}

impl ConvShared {
    pub(crate) fn new() -> Self {
        ConvShared {
            buffers: Mutex::new(ConvBuffers::default()),
            open_halves: AtomicUsize::new(2),
        }
    }
}

#[derive(Default)]
pub(crate) struct ConvBuffers {
    /// Exact interleaved conversation bytes, in arrival order.
    pub(crate) raw: Vec<u8>,
    /// Human-facing rendering: each chunk framed by a direction color.
    /// Lossy (UTF-8 replacement) by construction.
    pub(crate) colored: Vec<u8>,
    /// The client half has asked for the conversation to be persisted.
    pub(crate) save_requested: bool,
    /// Persistence already performed.
    pub(crate) saved: bool,
}

/// One direction's reader task state.
pub(crate) struct ReaderState {
    /// Directional flow identifier (sender first).
    ident: String,
    /// Connection identifier (client first), shared by both halves.
    conn_ident: String,
    server_port: u16,
    is_client: bool,
    reader: ByteReader,
    /// This direction's bytes, in order.
    data: Vec<u8>,
    shared: Arc<ConvShared>,
    env: Arc<PipelineEnv>,
}

impl ReaderState {
    pub(crate) fn new(
        ident: String,
        conn_ident: String,
        server_port: u16,
        is_client: bool,
        rx: Receiver<Vec<u8>>,
        shared: Arc<ConvShared>,
        env: Arc<PipelineEnv>,
    ) -> Self {
        ReaderState {
            ident,
            conn_ident,
            server_port,
            is_client,
            reader: ByteReader::new(rx),
            data: Vec::new(),
            shared,
            env,
        }
    }

    /// The reader loop. `_barrier` is this task's clone of the shutdown
    /// barrier; it drops when the task returns.
    pub(crate) fn run(mut self, _barrier: Option<WaitGroup>) {
        let mut buf = [0u8; 4096];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.consume(&buf[..n]),
                Err(_) => break,
            }
        }
        self.cleanup();
    }

    fn consume(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        let mut buffers = match self.shared.buffers.lock() {
            Ok(buffers) => buffers,
            Err(_) => return,
        };
        buffers.raw.extend_from_slice(bytes);
        let text = String::from_utf8_lossy(bytes);
        let framed = if self.is_client {
            (&*text).red()
        } else {
            (&*text).blue()
        };
        buffers
            .colored
            .extend_from_slice(format!("{}", framed).as_bytes());
    }

    /// Runs exactly once per direction, after end-of-stream.
    fn cleanup(&mut self) {
        if self.env.save_streams && !self.data.is_empty() {
            let class = service_class(self.server_port, &self.data);
            if self.env.persist.save_stream(class, &self.ident, &self.data) {
                self.env.stats.update(|c| c.saved_streams += 1);
            }
        }

        // The client half requests conversation persistence; whichever
        // half closes last performs it, so the artifact always covers
        // both directions in full.
        if self.is_client {
            if let Ok(mut buffers) = self.shared.buffers.lock() {
                buffers.save_requested = true;
            }
        }
        let remaining = self.shared.open_halves.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.persist_conversation();
        }

        // exactly one decrement per reader task, regardless of close order
        self.env.coordinator.leave();
    }

    fn persist_conversation(&self) {
        let mut buffers = match self.shared.buffers.lock() {
            Ok(buffers) => buffers,
            Err(_) => return,
        };
        if !buffers.save_requested || buffers.saved {
            return;
        }
        buffers.saved = true;
        if buffers.raw.is_empty() {
            return;
        }

        let class = service_class(self.server_port, &buffers.raw);
        for harvester in &self.env.harvesters {
            if let Some(mut creds) = harvester.harvest(&buffers.raw, &self.conn_ident) {
                log::debug!("{} harvester matched {}", harvester.name(), self.conn_ident);
                creds.service = class.to_string();
                if self.env.persist.write_credentials(&creds) {
                    self.env.stats.update(|c| c.credentials += 1);
                }
                break;
            }
        }

        let data = if self.env.save_colored {
            &buffers.colored
        } else {
            &buffers.raw
        };
        if self.env.persist.save_connection(class, &self.conn_ident, data) {
            self.env.stats.update(|c| c.saved_connections += 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    #[test]
    fn byte_reader_buffers_residual() {
        let (tx, rx) = bounded(4);
        tx.send(b"hello".to_vec()).unwrap();
        tx.send(b" world".to_vec()).unwrap();
        drop(tx);

        let mut reader = ByteReader::new(rx);
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b" world");
        // closed channel keeps reading as end-of-stream
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn byte_reader_skips_empty_chunks() {
        let (tx, rx) = bounded(4);
        tx.send(Vec::new()).unwrap();
        tx.send(b"x".to_vec()).unwrap();
        drop(tx);

        let mut reader = ByteReader::new(rx);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'x');
    }
}
