//! Read-only introspection snapshots.
//!
//! Snapshots carry a version number so that tooling built against an older
//! layout can detect newer fields it does not understand; the structs are
//! `#[non_exhaustive]` for the same reason.

use std::{net::SocketAddr, time::Duration};

/// Layout revision of [`StatusSnapshot`]
pub const STATUS_VERSION: u16 = 1;

/// Per-connection packet and telegram counters
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// Datagrams sent to this peer
    pub packets_sent: u64,
    /// Datagrams received from this peer
    pub packets_recvd: u64,
    /// Bus telegrams delivered to this peer
    pub telegrams_sent: u64,
    /// Bus telegrams received from this peer
    pub telegrams_recvd: u64,
}

/// Snapshot of one connection record
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionStatus {
    /// Channel id on the wire
    pub channel: u8,
    /// Process-wide unique connection id
    pub conn_id: u32,
    /// Peer control endpoint
    pub remote: SocketAddr,
    /// Traffic counters
    pub stats: ConnectionStats,
    /// Loopback mode: detected on, detected off, or never evaluated
    pub loopback: Option<bool>,
}

/// Snapshot of the upstream session
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct UpstreamStatus {
    /// Connection record details
    pub connection: ConnectionStatus,
    /// Time since the session reached `Established`
    pub uptime: Duration,
    /// Keep-alive probes currently unanswered
    pub missed_heartbeats: u32,
}

/// Versioned, read-only view of the whole endpoint
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StatusSnapshot {
    /// Layout revision, currently [`STATUS_VERSION`]
    pub version: u16,
    /// Telegrams waiting for at least one destination
    pub queue_depth: usize,
    /// Upstream session, if one was ever initiated and is still live
    pub upstream: Option<UpstreamStatus>,
    /// Active downstream connections
    pub downstream: Vec<ConnectionStatus>,
}
