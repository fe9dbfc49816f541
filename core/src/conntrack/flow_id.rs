//! Flow identifiers.
//!
//! Provides the directional flow observed on the wire and the canonical,
//! direction-free key under which both halves of a connection resolve to
//! the same record.

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Direction of a segment within a connection. The sender of the first
/// observed segment becomes the client side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    #[inline]
    pub fn flip(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    /// `true` for the client → server direction.
    #[inline]
    pub fn is_client(self) -> bool {
        matches!(self, Direction::ClientToServer)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "c2s"),
            Direction::ServerToClient => write!(f, "s2c"),
        }
    }
}

/// A directional flow: the sending and receiving endpoints of one
/// observed segment. Network and transport endpoints travel together as
/// socket addresses.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize)]
pub struct FlowId {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowId {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        FlowId { src, dst }
    }

    /// The same flow seen from the opposite direction.
    pub fn reverse(&self) -> FlowId {
        FlowId {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Canonical connection key: both directions map to the same value.
    pub fn key(&self) -> ConnKey {
        ConnKey::new(self.src, self.dst)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.src, self.dst)
    }
}

/// A generic connection identifier, independent of the source and
/// destination address order.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct ConnKey(SocketAddr, SocketAddr);

impl ConnKey {
    pub(crate) fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        ConnKey(cmp::max(src, dst), cmp::min(src, dst))
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.0, self.1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn both_directions_share_a_key() {
        let fwd = FlowId::new(addr("10.0.0.1:40000"), addr("10.0.0.2:80"));
        let rev = fwd.reverse();
        assert_eq!(fwd.key(), rev.key());
        assert_ne!(fwd, rev);
    }

    #[test]
    fn distinct_ports_distinct_keys() {
        let a = FlowId::new(addr("10.0.0.1:40000"), addr("10.0.0.2:80"));
        let b = FlowId::new(addr("10.0.0.1:40001"), addr("10.0.0.2:80"));
        assert_ne!(a.key(), b.key());
    }
}
