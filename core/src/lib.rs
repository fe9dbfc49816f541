// #![warn(missing_docs)]

//! A passive TCP stream reassembly core for packet-capture traffic
//! analysis.
//!
//! Given a stream of observed TCP segments, each carrying a direction
//! within a connection, a sequence number, payload bytes, and flag bits,
//! the core reconstructs the two unidirectional byte streams of each
//! connection, handling loss, reordering, duplication, and overlap, and
//! delivers ordered byte runs to per-connection consumers.
//!
//! The pieces:
//!
//! - [`Assembler`]: the stateful entry point. Feed it segments; it
//!   resolves overlaps, queues out-of-order data in bounded page pools,
//!   and invokes the consumer with contiguous runs. Timed flushes advance
//!   past gaps that will never fill.
//! - [`ConnPool`]: the flow-key → connection table, shareable across
//!   assemblers.
//! - [`Stream`]/[`StreamFactory`]: the consumer seam. Implement these to
//!   scan or persist reassembled bytes however you like.
//! - [`BidiFactory`]: the bundled consumer. Spawns two reader tasks per
//!   connection which mirror the conversation, run credential harvesters
//!   on completed connections, and persist artifacts under the configured
//!   output root.
//!
//! A minimal capture loop:
//!
//! ```no_run
//! use seine_core::config::default_config;
//! use seine_core::{Assembler, BidiFactory, ConnPool, FlowId, Segment, Stats};
//! use std::sync::Arc;
//!
//! let config = default_config();
//! let stats = Arc::new(Stats::new());
//! let pool = Arc::new(ConnPool::new(config.max_connections));
//! let factory = Arc::new(BidiFactory::new(&config, stats.clone()));
//! let mut assembler = Assembler::new(pool, factory.clone(), &config, stats);
//!
//! // for each captured packet, after link/IP/TCP parsing:
//! # let (flow, segment): (FlowId, Segment) = unimplemented!();
//! assembler.assemble(flow, segment);
//! assembler.poll_flush();
//!
//! // at shutdown:
//! assembler.flush_all();
//! factory.wait();
//! ```

pub mod assembler;
pub mod config;
pub mod conntrack;
pub mod persist;
pub mod reader;
pub mod services;
pub mod stats;
pub mod stream;

pub use self::assembler::{Assembler, FlushOptions};
pub use self::conntrack::flow_id::{ConnKey, Direction, FlowId};
pub use self::conntrack::segment::Segment;
pub use self::conntrack::seq::Seq;
pub use self::conntrack::ConnPool;
pub use self::reader::BidiFactory;
pub use self::stats::{Counters, Stats};
pub use self::stream::{DeliveryStats, ScatterGather, Stream, StreamFactory};

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate maplit;
