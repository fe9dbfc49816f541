//! The stateful reassembly core.
//!
//! Accepts observed segments, resolves overlaps, decides send-now versus
//! queue, invokes the per-connection consumer with contiguous byte runs,
//! and performs timed flush and close. The entry points never return
//! errors: malformed or rejected segments are dropped with counter
//! increments, and resource exhaustion degrades to forced delivery.

use crate::config::RuntimeConfig;
use crate::conntrack::flow_id::{Direction, FlowId};
use crate::conntrack::half::HalfConn;
use crate::conntrack::page::{Page, PageCache};
use crate::conntrack::segment::Segment;
use crate::conntrack::seq::Seq;
use crate::conntrack::ConnPool;
use crate::stats::Stats;
use crate::stream::{ScatterGather, Stream, StreamFactory};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{tick, Receiver};

/// Initial page cache population; the cache doubles on demand.
const INITIAL_PAGES: usize = 128;

/// Cutoffs for a timed flush pass.
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// Queue heads seen before this instant are force-delivered past their
    /// gap.
    pub older_than: Instant,
    /// Halves whose connection has been quiet since before this instant
    /// are closed once their queue is empty.
    pub close_older_than: Instant,
}

/// Reassembles one direction-tagged segment stream into per-connection
/// byte streams.
///
/// Single-threaded at the entry point: a caller must not submit another
/// segment to the same assembler until `assemble` returns. Multiple
/// assemblers may share one [`ConnPool`]; they serialize per connection
/// via the connection mutex.
pub struct Assembler {
    pool: Arc<ConnPool>,
    factory: Arc<dyn StreamFactory>,
    cache: PageCache,
    stats: Arc<Stats>,
    max_pages_conn: usize,
    max_pages_total: usize,
    tcp_debug: bool,
    flush_interval: Duration,
    close_older_than: Duration,
    ticker: Receiver<Instant>,
    /// Transient return list, reused across calls.
    ret: Vec<Page>,
}

impl Assembler {
    pub fn new(
        pool: Arc<ConnPool>,
        factory: Arc<dyn StreamFactory>,
        config: &RuntimeConfig,
        stats: Arc<Stats>,
    ) -> Self {
        pool.register();
        let flush_interval = Duration::from_millis(config.flush_interval.max(1));
        Assembler {
            pool,
            factory,
            cache: PageCache::new(INITIAL_PAGES),
            stats,
            max_pages_conn: config.max_buffered_pages_per_connection,
            max_pages_total: config.max_buffered_pages_total,
            tcp_debug: config.tcp_debug,
            flush_interval,
            close_older_than: Duration::from_millis(config.close_older_than.max(1)),
            ticker: tick(flush_interval),
            ret: Vec::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Processes one observed segment for `flow`.
    pub fn assemble(&mut self, flow: FlowId, seg: Segment<'_>) {
        self.stats.update(|c| c.segments += 1);

        let factory = Arc::clone(&self.factory);
        let (conn, created) = match self
            .pool
            .get_or_create(&flow, || factory.new_stream(&flow, &seg))
        {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("dropping segment for {}: {}", flow, e);
                self.stats.update(|c| c.dropped_segments += 1);
                return;
            }
        };
        if created {
            self.stats.update(|c| c.connections += 1);
            if self.tcp_debug {
                log::debug!("new connection {}", conn.key);
            }
        }

        let dir = conn.dir_of(flow.src);
        let mut guard = match conn.state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("connection mutex poisoned for {}", conn.key);
                return;
            }
        };
        let state = &mut *guard;
        if seg.seen > state.last_seen {
            state.last_seen = seg.seen;
        }

        {
            let (half, rev, stream) = state.parts(dir);
            if half.closed {
                if self.tcp_debug {
                    log::debug!("{}: segment on closed {} half", conn.key, dir);
                }
                self.stats.update(|c| c.rejected_segments += 1);
                return;
            }
            if seg.seen > half.last_seen {
                half.last_seen = seg.seen;
            }

            let mut start = half.next_seq.is_none() && seg.syn();
            if !stream.accept(&seg, dir, half.next_seq, &mut start) {
                if self.tcp_debug {
                    log::debug!("{}: segment rejected by stream policy", conn.key);
                }
                self.stats.update(|c| c.rejected_segments += 1);
                return;
            }
            if seg.has_ack() {
                rev.ack_seq = Some(seg.ack);
            }
            if self.tcp_debug {
                log::debug!(
                    "{} {}: seq {} len {} flags {:#04x} peer ack {:?}",
                    conn.key,
                    dir,
                    seg.seq,
                    seg.len(),
                    seg.flags,
                    rev.ack_seq
                );
            }

            if seg.rst() {
                self.teardown(half, rev, &mut *stream);
            } else {
                self.handle_bytes(half, &mut *stream, &seg, start);
            }
        }

        let mut removed = false;
        if state.both_closed() && !state.completed {
            state.completed = true;
            removed = state.stream.reassembly_complete();
            self.stats.update(|c| c.connections_closed += 1);
        }
        drop(guard);
        if removed {
            self.pool.remove(&conn.key);
        }
    }

    /// Sequence decision and delivery for a non-RST segment (§ accept
    /// steps 6–9 of the state machine).
    fn handle_bytes(
        &mut self,
        half: &mut HalfConn,
        stream: &mut dyn Stream,
        seg: &Segment<'_>,
        start: bool,
    ) {
        let prior = half.next_seq;
        let mut queue = true;
        let mut base = seg.seq;

        match half.next_seq {
            None => {
                if seg.syn() {
                    // SYN consumes one sequence number; payload follows it
                    base = seg.seq.add(1);
                    half.next_seq = Some(base);
                    queue = false;
                } else if start {
                    half.next_seq = Some(seg.seq);
                    queue = false;
                }
            }
            Some(ns) => {
                if ns.delta(seg.seq) <= 0 {
                    queue = false;
                }
            }
        }

        let fin = if queue {
            self.queue_segment(half, stream, base, seg.payload, seg.seen, seg.fin())
        } else {
            self.deliver_now(half, stream, seg, base, prior)
        };
        if fin {
            Self::close_half(half, &mut self.cache);
        }
    }

    /// Immediate-delivery path: trims the leading overlap against
    /// `next_seq`, paginates the remainder, and sends it together with any
    /// queued pages that have become contiguous.
    fn deliver_now(
        &mut self,
        half: &mut HalfConn,
        stream: &mut dyn Stream,
        seg: &Segment<'_>,
        mut base: Seq,
        prior: Option<Seq>,
    ) -> bool {
        let mut payload = seg.payload;
        let ns = match half.next_seq {
            Some(ns) => ns,
            None => return false,
        };
        let d = ns.delta(base);
        if d < 0 {
            let lead = (-d) as usize;
            if lead >= payload.len() {
                if !payload.is_empty() {
                    half.overlap_packets += 1;
                    half.overlap_bytes += payload.len() as u64;
                }
                payload = &[];
            } else {
                half.overlap_packets += 1;
                half.overlap_bytes += lead as u64;
                payload = &payload[lead..];
            }
            base = ns;
        }

        let mut ret = std::mem::take(&mut self.ret);
        HalfConn::paginate(base, payload, seg.seen, &mut ret, &mut self.cache);
        if ret.is_empty() && !seg.fin() {
            self.ret = ret;
            return false;
        }
        let skip: isize = if prior.is_none() && !seg.syn() { -1 } else { 0 };
        let next = ret.last().map(|p| p.seq_end()).unwrap_or(ns);
        self.send_to_connection(half, stream, ret, next, skip, seg.fin())
    }

    /// Queues a future segment, degrading gracefully when page limits are
    /// hit: the segment is dropped and the queue head is forced out
    /// instead, skipping the gap.
    fn queue_segment(
        &mut self,
        half: &mut HalfConn,
        stream: &mut dyn Stream,
        seq: Seq,
        payload: &[u8],
        seen: Instant,
        end: bool,
    ) -> bool {
        if payload.is_empty() && !end {
            return false;
        }
        let over_conn = self.max_pages_conn != 0 && half.pages >= self.max_pages_conn;
        let over_total = self.max_pages_total != 0 && self.cache.used() >= self.max_pages_total;
        if over_conn || over_total {
            log::debug!(
                "page limit reached ({} held, {} in use); forcing out queue head",
                half.pages,
                self.cache.used()
            );
            self.stats.update(|c| c.dropped_segments += 1);
            let (_, fin) = self.skip_flush_half(half, stream);
            return fin;
        }
        if self.tcp_debug {
            log::debug!("queueing {} bytes at {}", payload.len(), seq);
        }
        half.insert_ooo(seq, payload, seen, end, &mut self.cache);
        false
    }

    /// Builds the scatter-gather view (saved prefix, `ret`, then any
    /// queued pages now contiguous), invokes the consumer under the
    /// connection mutex, then releases consumed pages and converts a
    /// keep-from request into fresh saved pages. Returns `true` when the
    /// delivery consumed a FIN.
    fn send_to_connection(
        &mut self,
        half: &mut HalfConn,
        stream: &mut dyn Stream,
        mut ret: Vec<Page>,
        next: Seq,
        skip: isize,
        fin_flag: bool,
    ) -> bool {
        let (next, queued_fin) = half.drain_contiguous(next, &mut ret, &mut self.cache);
        let fin = fin_flag || queued_fin;

        let saved_pages = std::mem::take(&mut half.saved);
        half.pages -= saved_pages.len();

        let mut chunks: Vec<&[u8]> = Vec::with_capacity(saved_pages.len() + ret.len());
        let mut saved_len = 0usize;
        for page in &saved_pages {
            if page.len() > 0 {
                chunks.push(page.bytes());
                saved_len += page.len();
            }
        }
        for page in &ret {
            if page.len() > 0 {
                chunks.push(page.bytes());
            }
        }

        if self.tcp_debug {
            let packets = ret.iter().filter(|p| p.packet_origin).count();
            log::debug!(
                "delivering {} pages ({} packets) {} skip {} fin {}",
                ret.len(),
                packets,
                half.dir,
                skip,
                fin
            );
        }

        let mut sg = ScatterGather {
            chunks,
            saved_len,
            skip,
            dir: half.dir,
            end: fin,
            stats: half.take_stats(),
            to_keep: -1,
        };
        stream.reassembled(&mut sg);
        let to_keep = sg.to_keep;
        drop(sg);

        let total = saved_len + ret.iter().map(|p| p.len()).sum::<usize>();
        if to_keep >= 0 && (to_keep as usize) < total {
            let keep_from = to_keep as usize;
            let mut new_saved: Vec<Page> = Vec::new();
            let mut pos = 0usize;
            for page in saved_pages.iter().chain(ret.iter()) {
                let len = page.len();
                if len == 0 || pos + len <= keep_from {
                    pos += len;
                    continue;
                }
                let off = keep_from.saturating_sub(pos);
                HalfConn::paginate(
                    page.seq.add(off as i32),
                    &page.bytes()[off..],
                    page.seen,
                    &mut new_saved,
                    &mut self.cache,
                );
                pos += len;
            }
            half.pages += new_saved.len();
            half.saved = new_saved;
        }

        for page in saved_pages {
            self.cache.replace(page);
        }
        for page in ret.drain(..) {
            self.cache.replace(page);
        }
        self.ret = ret;

        half.next_seq = Some(if fin { next.add(1) } else { next });
        fin
    }

    /// Forced delivery past a gap: advance to the queue head, deliver the
    /// contiguous run there, and count the skipped bytes as lost. Returns
    /// (delivered, fin-consumed).
    fn skip_flush_half(&mut self, half: &mut HalfConn, stream: &mut dyn Stream) -> (bool, bool) {
        let head_seq = match half.queue.front() {
            Some(page) => page.seq,
            None => return (false, false),
        };
        let skip = match half.next_seq {
            Some(ns) => ns.delta(head_seq) as isize,
            None => -1,
        };
        if skip > 0 {
            self.stats.update(|c| c.skipped_bytes += skip as u64);
        }
        self.stats.update(|c| c.flushed_deliveries += 1);
        let ret = std::mem::take(&mut self.ret);
        let fin = self.send_to_connection(half, stream, ret, head_seq, skip, false);
        (true, fin)
    }

    /// Drains and closes both halves (RST observed).
    fn teardown(
        &mut self,
        half: &mut HalfConn,
        rev: &mut HalfConn,
        stream: &mut dyn Stream,
    ) {
        for h in [half, rev] {
            while !h.queue.is_empty() {
                let (delivered, _) = self.skip_flush_half(h, &mut *stream);
                if !delivered {
                    break;
                }
            }
            Self::close_half(h, &mut self.cache);
        }
    }

    fn close_half(half: &mut HalfConn, cache: &mut PageCache) {
        if half.closed {
            return;
        }
        half.closed = true;
        half.release_all(cache);
    }

    /// Timed flush: force-delivers queue heads older than
    /// `opts.older_than` and closes halves quiet since before
    /// `opts.close_older_than`. Returns `(flushed, closed)` counts.
    pub fn flush_with_options(&mut self, opts: FlushOptions) -> (usize, usize) {
        let mut flushed = 0usize;
        let mut closed = 0usize;
        for conn in self.pool.connections() {
            let mut guard = match conn.state.lock() {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            let state = &mut *guard;
            for dir in [Direction::ClientToServer, Direction::ServerToClient] {
                let (half, _rev, stream) = state.parts(dir);
                if half.closed {
                    continue;
                }
                loop {
                    let stale =
                        matches!(half.queue.front(), Some(page) if page.seen < opts.older_than);
                    if !stale {
                        break;
                    }
                    let (delivered, fin) = self.skip_flush_half(half, &mut *stream);
                    if delivered {
                        flushed += 1;
                    }
                    if fin {
                        Self::close_half(half, &mut self.cache);
                    }
                    if !delivered || half.closed {
                        break;
                    }
                }
            }
            if state.c2s.last_seen < opts.close_older_than
                && state.s2c.last_seen < opts.close_older_than
            {
                for dir in [Direction::ClientToServer, Direction::ServerToClient] {
                    let (half, _rev, _stream) = state.parts(dir);
                    if !half.closed && half.queue.is_empty() {
                        Self::close_half(half, &mut self.cache);
                        closed += 1;
                    }
                }
            }
            let mut removed = false;
            if state.both_closed() && !state.completed {
                state.completed = true;
                removed = state.stream.reassembly_complete();
                self.stats.update(|c| c.connections_closed += 1);
            }
            drop(guard);
            if removed {
                self.pool.remove(&conn.key);
            }
        }
        (flushed, closed)
    }

    /// Drains every connection: repeatedly skip-flushes until each half is
    /// empty, then closes both. Returns the number of forced deliveries.
    pub fn flush_all(&mut self) -> usize {
        let mut flushed = 0usize;
        for conn in self.pool.connections() {
            let mut guard = match conn.state.lock() {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            let state = &mut *guard;
            for dir in [Direction::ClientToServer, Direction::ServerToClient] {
                let (half, _rev, stream) = state.parts(dir);
                while !half.queue.is_empty() {
                    let (delivered, fin) = self.skip_flush_half(half, &mut *stream);
                    if delivered {
                        flushed += 1;
                    }
                    if fin {
                        Self::close_half(half, &mut self.cache);
                    }
                    if !delivered {
                        break;
                    }
                }
                Self::close_half(half, &mut self.cache);
            }
            let mut removed = false;
            if !state.completed {
                state.completed = true;
                removed = state.stream.reassembly_complete();
                self.stats.update(|c| c.connections_closed += 1);
            }
            drop(guard);
            if removed {
                self.pool.remove(&conn.key);
            }
        }
        flushed
    }

    /// Drives periodic flushing from the configured cadence. Cheap to call
    /// once per batch; returns the flush counts when the interval has
    /// elapsed.
    pub fn poll_flush(&mut self) -> Option<(usize, usize)> {
        self.ticker.try_recv().ok()?;
        let now = Instant::now();
        let older_than = now.checked_sub(self.flush_interval)?;
        let close_older_than = now.checked_sub(self.close_older_than)?;
        Some(self.flush_with_options(FlushOptions {
            older_than,
            close_older_than,
        }))
    }
}

impl Drop for Assembler {
    fn drop(&mut self) {
        self.pool.release();
    }
}
