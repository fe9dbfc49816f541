//! One direction of a tracked TCP connection.
//!
//! Holds the ordered out-of-order queue, the saved tail retained by the
//! consumer between deliveries, and the per-direction counters. The queue
//! invariants: pages are strictly ordered by sequence number, no two pages
//! overlap, and the head starts after `next_seq` whenever `next_seq` is
//! known.

use crate::conntrack::flow_id::Direction;
use crate::conntrack::page::{Page, PageCache};
use crate::conntrack::seq::Seq;
use crate::stream::DeliveryStats;

use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug)]
pub(crate) struct HalfConn {
    pub(crate) dir: Direction,
    /// Next expected sequence number; `None` before the stream has started.
    pub(crate) next_seq: Option<Seq>,
    /// Highest ACK observed from the peer side.
    pub(crate) ack_seq: Option<Seq>,
    /// Out-of-order pages awaiting consumption, ordered by sequence.
    pub(crate) queue: VecDeque<Page>,
    /// Delivered pages retained at the consumer's request.
    pub(crate) saved: Vec<Page>,
    /// Pages currently held (queue + saved).
    pub(crate) pages: usize,
    /// Terminal flag; once set, no further segments are accepted.
    pub(crate) closed: bool,
    /// Timestamp of the latest accepted segment.
    pub(crate) last_seen: Instant,
    pub(crate) queued_packets: u64,
    pub(crate) queued_bytes: u64,
    pub(crate) overlap_packets: u64,
    pub(crate) overlap_bytes: u64,
}

impl HalfConn {
    pub(crate) fn new(dir: Direction) -> Self {
        HalfConn {
            dir,
            next_seq: None,
            ack_seq: None,
            queue: VecDeque::new(),
            saved: Vec::new(),
            pages: 0,
            closed: false,
            last_seen: Instant::now(),
            queued_packets: 0,
            queued_bytes: 0,
            overlap_packets: 0,
            overlap_bytes: 0,
        }
    }

    /// Inserts the payload range `[seq, seq + data.len())` into the queue,
    /// resolving overlaps against already-queued pages. New data wins on
    /// range boundaries; a queued page that fully contains the new range
    /// keeps its identity and has its interior overwritten. `end` marks a
    /// FIN riding on this segment.
    pub(crate) fn insert_ooo(
        &mut self,
        seq: Seq,
        data: &[u8],
        seen: Instant,
        end: bool,
        cache: &mut PageCache,
    ) {
        let start = seq;
        let mut buf = data;

        // Traverse queued pages from the tail towards the head. `pos` is
        // where whatever survives of the new range gets spliced in.
        let mut pos = self.queue.len();
        let mut i = self.queue.len();
        while i > 0 {
            let (cs, ce, clen) = {
                let cur = &self.queue[i - 1];
                (cur.seq, cur.seq_end(), cur.len())
            };
            let nend = start.add(buf.len() as i32);

            if nend.delta(cs) >= 0 {
                // New range lies entirely before `cur`.
                i -= 1;
                pos = i;
                continue;
            }
            if ce.delta(start) >= 0 {
                // New range lies entirely after `cur`.
                pos = i;
                break;
            }

            // Overlap. Dispatch on which edges the new range extends past.
            let covers_head = start.delta(cs) >= 0; // start <= cs
            let covers_tail = ce.delta(nend) >= 0; // end >= ce
            if covers_head && covers_tail {
                // New fully covers `cur`: drop the old page.
                let old = self.queue.remove(i - 1).unwrap();
                self.pages -= 1;
                self.overlap_packets += 1;
                self.overlap_bytes += clen as u64;
                cache.replace(old);
                i -= 1;
                pos = i;
                continue;
            }
            if covers_tail {
                // New extends past `cur`'s tail only: cut the old tail.
                let cut = start.delta(ce) as u64;
                self.queue[i - 1].truncate_to(start);
                self.overlap_packets += 1;
                self.overlap_bytes += cut;
                pos = i;
                break;
            }
            if covers_head {
                // New extends before `cur`'s head only: cut the new tail
                // and keep scanning towards the head.
                let keep = start.delta(cs) as usize;
                self.overlap_packets += 1;
                self.overlap_bytes += (buf.len() - keep) as u64;
                buf = &buf[..keep];
                i -= 1;
                pos = i;
                continue;
            }
            // New strictly inside `cur`: overwrite the interior bytes.
            self.overlap_packets += 1;
            self.overlap_bytes += buf.len() as u64;
            if !buf.is_empty() {
                self.queue[i - 1].overwrite(start, buf);
            }
            return;
        }

        if buf.is_empty() && !end {
            return;
        }

        // Splice the surviving bytes in as a chain of pages.
        self.queued_packets += 1;
        self.queued_bytes += buf.len() as u64;
        let mut at = start;
        let mut first = true;
        loop {
            let mut page = cache.acquire();
            let n = page.fill(at, buf, seen);
            page.packet_origin = first;
            first = false;
            at = at.add(n as i32);
            buf = &buf[n..];
            if buf.is_empty() {
                page.end = end;
                self.queue.insert(pos, page);
                self.pages += 1;
                break;
            }
            self.queue.insert(pos, page);
            self.pages += 1;
            pos += 1;
        }
    }

    /// Pops queued pages contiguous with `next` into `ret`, trimming or
    /// dropping pages the delivery has already passed. Returns the new
    /// expected sequence number and whether a FIN was consumed.
    pub(crate) fn drain_contiguous(
        &mut self,
        mut next: Seq,
        ret: &mut Vec<Page>,
        cache: &mut PageCache,
    ) -> (Seq, bool) {
        let mut fin = false;
        while let Some(front) = self.queue.front() {
            let d = next.delta(front.seq);
            if d > 0 {
                break;
            }
            let mut page = self.queue.pop_front().unwrap();
            self.pages -= 1;
            if d < 0 {
                let lead = (-d) as usize;
                if lead >= page.len() {
                    // Entirely old data.
                    if page.end {
                        fin = true;
                    }
                    self.overlap_packets += 1;
                    self.overlap_bytes += page.len() as u64;
                    let stop = page.end;
                    cache.replace(page);
                    if stop {
                        break;
                    }
                    continue;
                }
                self.overlap_packets += 1;
                self.overlap_bytes += lead as u64;
                page.trim_front(lead);
            }
            next = page.seq_end();
            let end = page.end;
            ret.push(page);
            if end {
                fin = true;
                break;
            }
        }
        (next, fin)
    }

    /// Returns every held page (queue and saved) to the cache.
    pub(crate) fn release_all(&mut self, cache: &mut PageCache) {
        for page in self.queue.drain(..) {
            cache.replace(page);
        }
        for page in self.saved.drain(..) {
            cache.replace(page);
        }
        self.pages = 0;
    }

    /// Snapshot and reset the per-direction counters; carried with each
    /// delivery.
    pub(crate) fn take_stats(&mut self) -> DeliveryStats {
        let stats = DeliveryStats {
            queued_packets: self.queued_packets,
            queued_bytes: self.queued_bytes,
            overlap_packets: self.overlap_packets,
            overlap_bytes: self.overlap_bytes,
        };
        self.queued_packets = 0;
        self.queued_bytes = 0;
        self.overlap_packets = 0;
        self.overlap_bytes = 0;
        stats
    }

    /// Splits a payload into a page chain appended to `ret` (delivery
    /// path; the queue is not involved).
    pub(crate) fn paginate(
        seq: Seq,
        data: &[u8],
        seen: Instant,
        ret: &mut Vec<Page>,
        cache: &mut PageCache,
    ) {
        let mut at = seq;
        let mut rest = data;
        let mut first = true;
        while !rest.is_empty() {
            let mut page = cache.acquire();
            let n = page.fill(at, rest, seen);
            page.packet_origin = first;
            first = false;
            at = at.add(n as i32);
            rest = &rest[n..];
            ret.push(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::page::PAGE_SIZE;

    fn half() -> HalfConn {
        HalfConn::new(Direction::ClientToServer)
    }

    fn ranges(h: &HalfConn) -> Vec<(u32, Vec<u8>)> {
        h.queue
            .iter()
            .map(|p| (p.seq.raw(), p.bytes().to_vec()))
            .collect()
    }

    fn insert(h: &mut HalfConn, cache: &mut PageCache, seq: u32, data: &[u8]) {
        h.insert_ooo(Seq(seq), data, Instant::now(), false, cache);
    }

    #[test]
    fn inserts_keep_sequence_order() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1010, b"KL");
        insert(&mut h, &mut cache, 1002, b"CD");
        insert(&mut h, &mut cache, 1006, b"GH");
        assert_eq!(
            ranges(&h),
            vec![
                (1002, b"CD".to_vec()),
                (1006, b"GH".to_vec()),
                (1010, b"KL".to_vec()),
            ]
        );
        assert_eq!(h.pages, 3);
        assert_eq!(h.queued_bytes, 6);
    }

    #[test]
    fn new_fully_covers_old() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1004, b"EF");
        insert(&mut h, &mut cache, 1002, b"cdefgh");
        assert_eq!(ranges(&h), vec![(1002, b"cdefgh".to_vec())]);
        assert_eq!(h.overlap_bytes, 2);
        assert_eq!(h.overlap_packets, 1);
        assert_eq!(h.pages, 1);
    }

    #[test]
    fn new_extends_past_old_tail() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1000, b"ABCD");
        insert(&mut h, &mut cache, 1002, b"cdEF");
        // old page keeps its head, new data wins from 1002 on
        assert_eq!(
            ranges(&h),
            vec![(1000, b"AB".to_vec()), (1002, b"cdEF".to_vec())]
        );
        assert_eq!(h.overlap_bytes, 2);
    }

    #[test]
    fn new_extends_before_old_head() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1004, b"EFGH");
        insert(&mut h, &mut cache, 1002, b"CDef");
        // new tail is cut where the old page begins
        assert_eq!(
            ranges(&h),
            vec![(1002, b"CD".to_vec()), (1004, b"EFGH".to_vec())]
        );
        assert_eq!(h.overlap_bytes, 2);
    }

    #[test]
    fn new_strictly_inside_old() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1000, b"ABCDEF");
        insert(&mut h, &mut cache, 1002, b"xy");
        // interior overwritten in place; page identity kept
        assert_eq!(ranges(&h), vec![(1000, b"ABxyEF".to_vec())]);
        assert_eq!(h.overlap_bytes, 2);
        assert_eq!(h.pages, 1);
    }

    #[test]
    fn exact_duplicate_absorbed() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1000, b"ABCD");
        insert(&mut h, &mut cache, 1000, b"ABCD");
        // duplicate fully covers the old page; one page remains
        assert_eq!(ranges(&h), vec![(1000, b"ABCD".to_vec())]);
        assert_eq!(h.overlap_bytes, 4);
        assert_eq!(h.pages, 1);
    }

    #[test]
    fn new_spans_several_old_pages() {
        let mut h = half();
        let mut cache = PageCache::new(8);
        insert(&mut h, &mut cache, 1002, b"CD");
        insert(&mut h, &mut cache, 1006, b"GH");
        insert(&mut h, &mut cache, 1000, b"abcdefghij");
        assert_eq!(ranges(&h), vec![(1000, b"abcdefghij".to_vec())]);
        assert_eq!(h.overlap_bytes, 4);
        assert_eq!(h.pages, 1);
    }

    #[test]
    fn long_payload_splits_into_chain() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        let data = vec![0x41u8; PAGE_SIZE + 10];
        insert(&mut h, &mut cache, 5000, &data);
        assert_eq!(h.pages, 2);
        assert_eq!(h.queue[0].len(), PAGE_SIZE);
        assert_eq!(h.queue[1].len(), 10);
        assert!(h.queue[0].packet_origin);
        assert!(!h.queue[1].packet_origin);
        assert_eq!(h.queue[1].seq.raw(), 5000 + PAGE_SIZE as u32);
    }

    #[test]
    fn fin_marker_queues_as_empty_end_page() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1000, b"AB");
        h.insert_ooo(Seq(1002), b"", Instant::now(), true, &mut cache);
        assert_eq!(h.pages, 2);
        assert!(h.queue[1].end);
        assert_eq!(h.queue[1].len(), 0);
    }

    #[test]
    fn drain_contiguous_stops_at_gap() {
        let mut h = half();
        let mut cache = PageCache::new(8);
        insert(&mut h, &mut cache, 1000, b"AB");
        insert(&mut h, &mut cache, 1002, b"CD");
        insert(&mut h, &mut cache, 1008, b"IJ");
        let mut ret = Vec::new();
        let (next, fin) = h.drain_contiguous(Seq(1000), &mut ret, &mut cache);
        assert_eq!(next, Seq(1004));
        assert!(!fin);
        assert_eq!(ret.len(), 2);
        assert_eq!(h.pages, 1);
        for p in ret {
            cache.replace(p);
        }
    }

    #[test]
    fn drain_trims_already_delivered_lead() {
        let mut h = half();
        let mut cache = PageCache::new(8);
        insert(&mut h, &mut cache, 1000, b"ABCD");
        let mut ret = Vec::new();
        let (next, _) = h.drain_contiguous(Seq(1002), &mut ret, &mut cache);
        assert_eq!(next, Seq(1004));
        assert_eq!(ret[0].bytes(), b"CD");
        assert_eq!(h.overlap_bytes, 2);
        for p in ret {
            cache.replace(p);
        }
    }

    #[test]
    fn page_accounting_after_release() {
        let mut h = half();
        let mut cache = PageCache::new(4);
        insert(&mut h, &mut cache, 1000, b"AB");
        insert(&mut h, &mut cache, 1004, b"EF");
        assert_eq!(cache.used(), 2);
        h.release_all(&mut cache);
        assert_eq!(cache.used(), 0);
        assert_eq!(h.pages, 0);
    }
}
