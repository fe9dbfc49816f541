//! Run statistics.
//!
//! A single counters struct behind a dedicated mutex, shared through
//! [`Stats`] handles injected into the assembler and the reader pipeline
//! at construction. Counter updates are absorbed silently; reporting is
//! the embedding application's job via [`Stats::snapshot`].

use std::sync::Mutex;

use serde::Serialize;

/// Monotonic counters describing a capture run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Counters {
    /// Connections created in the pool.
    pub connections: u64,
    /// Connections whose streams completed.
    pub connections_closed: u64,
    /// Segments submitted to `assemble`.
    pub segments: u64,
    /// Segments dropped by stream policy or closed halves.
    pub rejected_segments: u64,
    /// Segments dropped by capacity limits.
    pub dropped_segments: u64,
    /// Bytes declared lost by skip flushes.
    pub skipped_bytes: u64,
    /// Forced deliveries performed by flushes.
    pub flushed_deliveries: u64,
    /// Conversation artifacts written.
    pub saved_connections: u64,
    /// Per-direction stream artifacts written.
    pub saved_streams: u64,
    /// Credential records emitted.
    pub credentials: u64,
}

/// Shared handle to the counters.
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<Counters>,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    /// Applies `f` to the counters under the mutex.
    pub(crate) fn update(&self, f: impl FnOnce(&mut Counters)) {
        if let Ok(mut counters) = self.counters.lock() {
            f(&mut counters);
        }
    }

    /// Returns a copy of the current counter values.
    pub fn snapshot(&self) -> Counters {
        self.counters
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_visible_in_snapshots() {
        let stats = Stats::new();
        stats.update(|c| c.segments += 3);
        stats.update(|c| c.credentials += 1);
        let snap = stats.snapshot();
        assert_eq!(snap.segments, 3);
        assert_eq!(snap.credentials, 1);
    }
}
