//! Bundled bidirectional consumer.
//!
//! The factory wires each new connection to two reader tasks over bounded
//! byte channels, tracks the count of active readers, and exposes the
//! shutdown barrier that drains the pipeline.

use crate::config::RuntimeConfig;
use crate::conntrack::flow_id::{Direction, FlowId};
use crate::conntrack::segment::Segment;
use crate::conntrack::seq::Seq;
use crate::persist::harvest::{default_harvesters, Harvester};
use crate::persist::Persist;
use crate::reader::{ConvShared, ReaderState};
use crate::stats::Stats;
use crate::stream::{ScatterGather, Stream, StreamFactory};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::channel::{bounded, Sender};
use crossbeam::sync::WaitGroup;

/// Tracks active reader tasks and the shutdown barrier.
pub struct Coordinator {
    active: AtomicUsize,
    barrier: Mutex<Option<WaitGroup>>,
}

impl Coordinator {
    fn new() -> Self {
        Coordinator {
            active: AtomicUsize::new(0),
            barrier: Mutex::new(Some(WaitGroup::new())),
        }
    }

    /// Registers one reader task; the returned barrier clone must live
    /// for the task's lifetime.
    pub(crate) fn register(&self) -> Option<WaitGroup> {
        self.active.fetch_add(1, Ordering::AcqRel);
        match self.barrier.lock() {
            Ok(barrier) => barrier.clone(),
            Err(_) => None,
        }
    }

    /// One reader task reached cleanup.
    pub(crate) fn leave(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Reader tasks that have not reached cleanup yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Blocks until every registered reader task has finished. One-shot:
    /// later calls return immediately.
    pub fn wait(&self) {
        let barrier = match self.barrier.lock() {
            Ok(mut barrier) => barrier.take(),
            Err(_) => None,
        };
        if let Some(wg) = barrier {
            wg.wait();
        }
    }
}

/// Everything the reader tasks need, shared across all connections.
pub(crate) struct PipelineEnv {
    pub(crate) persist: Persist,
    pub(crate) harvesters: Vec<Box<dyn Harvester>>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) save_colored: bool,
    pub(crate) save_streams: bool,
    pub(crate) require_init: bool,
    pub(crate) channel_capacity: usize,
    pub(crate) coordinator: Coordinator,
}

/// Stream factory producing the bundled bidirectional consumer: two
/// reader tasks per connection, fed over bounded byte channels.
pub struct BidiFactory {
    env: Arc<PipelineEnv>,
}

impl BidiFactory {
    pub fn new(config: &RuntimeConfig, stats: Arc<Stats>) -> Self {
        Self::with_harvesters(config, stats, default_harvesters())
    }

    /// Builds a factory with a caller-supplied harvester set.
    pub fn with_harvesters(
        config: &RuntimeConfig,
        stats: Arc<Stats>,
        harvesters: Vec<Box<dyn Harvester>>,
    ) -> Self {
        if config.save_colored {
            // artifacts are not a tty; force escape emission
            colored::control::set_override(true);
        }
        BidiFactory {
            env: Arc::new(PipelineEnv {
                persist: Persist::new(config.out.clone()),
                harvesters,
                stats,
                save_colored: config.save_colored,
                save_streams: config.save_streams,
                require_init: config.require_init,
                channel_capacity: config.byte_channel_capacity,
                coordinator: Coordinator::new(),
            }),
        }
    }

    /// Reader tasks that have not reached cleanup yet.
    pub fn active_readers(&self) -> usize {
        self.env.coordinator.active()
    }

    /// Blocks until every reader task has drained. Flush the assembler
    /// first (`flush_all`), or streams that never completed will keep
    /// their readers alive.
    pub fn wait(&self) {
        self.env.coordinator.wait();
    }
}

impl StreamFactory for BidiFactory {
    fn new_stream(&self, flow: &FlowId, _first: &Segment<'_>) -> Box<dyn Stream> {
        let conn_ident = flow.to_string();
        let server_port = flow.dst.port();
        let shared = Arc::new(ConvShared::new());
        let (client_tx, client_rx) = bounded(self.env.channel_capacity);
        let (server_tx, server_rx) = bounded(self.env.channel_capacity);

        for (is_client, rx) in [(true, client_rx), (false, server_rx)] {
            let ident = if is_client {
                flow.to_string()
            } else {
                flow.reverse().to_string()
            };
            let state = ReaderState::new(
                ident,
                conn_ident.clone(),
                server_port,
                is_client,
                rx,
                shared.clone(),
                self.env.clone(),
            );
            let barrier = self.env.coordinator.register();
            let name = format!("reader-{}", if is_client { "c2s" } else { "s2c" });
            if let Err(e) = thread::Builder::new()
                .name(name)
                .spawn(move || state.run(barrier))
            {
                log::error!("spawning reader for {}: {}", conn_ident, e);
                self.env.coordinator.leave();
            }
        }

        Box::new(BidiStream {
            ident: conn_ident,
            require_init: self.env.require_init,
            client_tx: Some(client_tx),
            server_tx: Some(server_tx),
        })
    }
}

/// The per-connection consumer: forwards ordered byte runs to the
/// direction's reader over its channel. Sends block when the channel is
/// full, backpressuring the assembler.
pub(crate) struct BidiStream {
    ident: String,
    require_init: bool,
    client_tx: Option<Sender<Vec<u8>>>,
    server_tx: Option<Sender<Vec<u8>>>,
}

impl Stream for BidiStream {
    fn accept(
        &mut self,
        segment: &Segment<'_>,
        _dir: Direction,
        next_seq: Option<Seq>,
        start: &mut bool,
    ) -> bool {
        if self.require_init && next_seq.is_none() && !*start && !segment.syn() {
            return false;
        }
        true
    }

    fn reassembled(&mut self, sg: &mut ScatterGather<'_>) {
        if sg.is_empty() {
            return;
        }
        let mut chunk = Vec::with_capacity(sg.len());
        sg.copy_into(&mut chunk);
        let tx = match sg.direction() {
            Direction::ClientToServer => self.client_tx.as_ref(),
            Direction::ServerToClient => self.server_tx.as_ref(),
        };
        if let Some(tx) = tx {
            if tx.send(chunk).is_err() {
                log::debug!("reader for {} is gone; dropping chunk", self.ident);
            }
        }
    }

    fn reassembly_complete(&mut self) -> bool {
        // dropping the senders closes both channels: the readers' sole
        // end-of-stream signal
        self.client_tx.take();
        self.server_tx.take();
        true
    }
}
