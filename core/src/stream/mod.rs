//! The consumer seam: stream factories, per-connection streams, and
//! scatter-gather deliveries.
//!
//! The core holds an opaque [`Stream`] handle per connection and invokes
//! it through the trait object; consumers provide the policy gate, the
//! ordered-byte callback, and the completion callback. A bundled
//! implementation that feeds per-direction reader tasks lives in
//! [`crate::reader`].

use crate::conntrack::flow_id::{Direction, FlowId};
use crate::conntrack::segment::Segment;
use crate::conntrack::seq::Seq;

/// Snapshot of the per-direction queue and overlap counters, carried with
/// each delivery and reset afterwards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub queued_packets: u64,
    pub queued_bytes: u64,
    pub overlap_packets: u64,
    pub overlap_bytes: u64,
}

/// An ordered byte delivery for one direction of a connection.
///
/// The byte view is the concatenation of `chunks`: first any bytes the
/// consumer retained from the previous delivery (`saved()` of them), then
/// the newly reassembled bytes. The consumer may call [`keep_from`] to
/// retain a tail of the view for the next delivery (e.g. a partial
/// protocol frame).
///
/// [`keep_from`]: ScatterGather::keep_from
pub struct ScatterGather<'a> {
    pub(crate) chunks: Vec<&'a [u8]>,
    pub(crate) saved_len: usize,
    pub(crate) skip: isize,
    pub(crate) dir: Direction,
    pub(crate) end: bool,
    pub(crate) stats: DeliveryStats,
    pub(crate) to_keep: isize,
}

impl<'a> ScatterGather<'a> {
    /// Total bytes in the view (saved prefix + new bytes).
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    /// Bytes missing before the first newly delivered byte: `0` when
    /// contiguous with the prior delivery, positive after a skip flush,
    /// negative when unknown (stream picked up mid-flow).
    pub fn skip(&self) -> isize {
        self.skip
    }

    /// Length of the leading portion of the view carried over from the
    /// previous delivery at the consumer's request.
    pub fn saved(&self) -> usize {
        self.saved_len
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// `true` for the delivery that consumes a FIN; no further bytes will
    /// arrive for this direction.
    pub fn end(&self) -> bool {
        self.end
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// The ordered byte runs making up the view.
    pub fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.chunks.iter().copied()
    }

    /// Appends the whole view to `out`.
    pub fn copy_into(&self, out: &mut Vec<u8>) {
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
    }

    /// Requests that view bytes from `offset` onward be retained and
    /// prepended to the next delivery. Offsets past the end retain
    /// nothing.
    pub fn keep_from(&mut self, offset: usize) {
        self.to_keep = offset as isize;
    }
}

/// Per-connection consumer the core invokes.
pub trait Stream: Send {
    /// Policy gate, invoked before a segment mutates half-connection
    /// state. `next_seq` is the half's current expectation (`None` before
    /// the stream has started); `start` may be forced true to begin the
    /// stream at this segment despite a missing SYN. Returning `false`
    /// drops the segment with no state change.
    fn accept(
        &mut self,
        segment: &Segment<'_>,
        dir: Direction,
        next_seq: Option<Seq>,
        start: &mut bool,
    ) -> bool;

    /// Ordered byte delivery. Runs under the connection mutex and is
    /// expected to block; blocking here is the assembler's backpressure.
    fn reassembled(&mut self, sg: &mut ScatterGather<'_>);

    /// Both directions are done; called exactly once per stream, after
    /// the last `reassembled`. Returning `true` lets the connection
    /// record be dropped from the pool.
    fn reassembly_complete(&mut self) -> bool;
}

/// Produces the consumer for each new connection, invoked on its first
/// accepted segment.
pub trait StreamFactory: Send + Sync {
    fn new_stream(&self, flow: &FlowId, first: &Segment<'_>) -> Box<dyn Stream>;
}
