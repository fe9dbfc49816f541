//! Connection state management.
//!
//! Flow keys, payload pages, half-connections, and the shared connection
//! pool. The pool maps canonical flow keys to connection records; lookups
//! take the shared lock, creation and removal the exclusive one, and all
//! per-connection state is serialized through the connection mutex.

pub mod flow_id;
pub(crate) mod half;
pub(crate) mod page;
pub mod segment;
pub mod seq;

use self::flow_id::{ConnKey, Direction, FlowId};
use self::half::HalfConn;
use crate::stream::Stream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{bail, Result};
use hashlink::linked_hash_map::LinkedHashMap;

/// One tracked connection: two half-connections, the consumer stream, and
/// the per-connection mutex serializing every mutation.
pub struct Conn {
    pub(crate) key: ConnKey,
    /// Endpoint that sent the first observed segment (the client side).
    pub(crate) orig: SocketAddr,
    pub(crate) state: Mutex<ConnState>,
}

pub(crate) struct ConnState {
    pub(crate) c2s: HalfConn,
    pub(crate) s2c: HalfConn,
    pub(crate) stream: Box<dyn Stream>,
    pub(crate) last_seen: Instant,
    /// Guards the one-shot completion callback.
    pub(crate) completed: bool,
}

impl Conn {
    fn new(key: ConnKey, orig: SocketAddr, stream: Box<dyn Stream>) -> Self {
        Conn {
            key,
            orig,
            state: Mutex::new(ConnState {
                c2s: HalfConn::new(Direction::ClientToServer),
                s2c: HalfConn::new(Direction::ServerToClient),
                stream,
                last_seen: Instant::now(),
                completed: false,
            }),
        }
    }

    /// Direction of a segment sent from `src` within this connection.
    pub(crate) fn dir_of(&self, src: SocketAddr) -> Direction {
        if src == self.orig {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }
}

impl ConnState {
    /// Splits the state into the sending half, the reverse half, and the
    /// stream, for a segment travelling in `dir`.
    pub(crate) fn parts(
        &mut self,
        dir: Direction,
    ) -> (&mut HalfConn, &mut HalfConn, &mut dyn Stream) {
        match dir {
            Direction::ClientToServer => (&mut self.c2s, &mut self.s2c, self.stream.as_mut()),
            Direction::ServerToClient => (&mut self.s2c, &mut self.c2s, self.stream.as_mut()),
        }
    }

    pub(crate) fn both_closed(&self) -> bool {
        self.c2s.closed && self.s2c.closed
    }
}

/// Shared pool of tracked connections.
///
/// Multiple assemblers may share one pool; the `users` counter tracks how
/// many. Connections leave the pool when both halves are closed and the
/// stream's completion callback approves removal.
pub struct ConnPool {
    table: RwLock<LinkedHashMap<ConnKey, Arc<Conn>>>,
    users: AtomicUsize,
    max_connections: usize,
}

impl ConnPool {
    /// Creates a pool bounded to `max_connections` tracked connections
    /// (`0` = unlimited).
    pub fn new(max_connections: usize) -> Self {
        ConnPool {
            table: RwLock::new(LinkedHashMap::new()),
            users: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Registers an assembler using this pool.
    pub fn register(&self) {
        self.users.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases one assembler's use of this pool.
    pub fn release(&self) {
        self.users.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::Relaxed)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        match self.table.read() {
            Ok(table) => table.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the connection for `flow`, creating it from `make` on
    /// first sight. Fails when the table is at capacity.
    pub(crate) fn get_or_create(
        &self,
        flow: &FlowId,
        make: impl FnOnce() -> Box<dyn Stream>,
    ) -> Result<(Arc<Conn>, bool)> {
        let key = flow.key();
        if let Some(conn) = self.get(&key) {
            return Ok((conn, false));
        }
        let mut table = match self.table.write() {
            Ok(table) => table,
            Err(_) => bail!("connection table lock poisoned"),
        };
        // re-check: another assembler may have won the race
        if let Some(conn) = table.get(&key) {
            return Ok((conn.clone(), false));
        }
        if self.max_connections != 0 && table.len() >= self.max_connections {
            bail!("connection table full ({} entries)", table.len());
        }
        let conn = Arc::new(Conn::new(key, flow.src, make()));
        table.insert(key, conn.clone());
        Ok((conn, true))
    }

    /// Looks up an existing connection under the shared lock.
    pub(crate) fn get(&self, key: &ConnKey) -> Option<Arc<Conn>> {
        self.table.read().ok().and_then(|t| t.get(key).cloned())
    }

    /// Removes a connection record under the exclusive lock.
    pub(crate) fn remove(&self, key: &ConnKey) {
        if let Ok(mut table) = self.table.write() {
            table.remove(key);
        }
    }

    /// Snapshot of all tracked connections, oldest first.
    pub(crate) fn connections(&self) -> Vec<Arc<Conn>> {
        match self.table.read() {
            Ok(table) => table.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}
