//! Protocol logic for multiplexing many EIBnet/IP tunneling clients onto one
//! upstream tunneling session.
//!
//! knxmux-proto contains a fully deterministic implementation of the
//! multiplexing core. It contains no networking code and does not get any
//! relevant timestamps from the operating system; most users will want the
//! tokio-based knxmux API instead.
//!
//! The most important type is [`Endpoint`], which owns the connection table
//! for both tunneling roles (the upstream session it runs as a client, and
//! the downstream peers it serves) together with the fan-out queue that
//! delivers every bus telegram exactly once per active destination. Feed it
//! datagrams and timeouts, collect [`Transmit`]s and [`Event`]s.

#![warn(missing_docs)]
#![allow(clippy::cognitive_complexity)]

use std::fmt;

use bytes::Bytes;

pub mod auth;
mod coding;
mod config;
mod connection;
mod endpoint;
pub mod frame;
mod packet;
mod queue;
mod status;
#[cfg(test)]
mod tests;
mod timer;

pub use crate::config::{EndpointConfig, ServerConfig, TunnelConfig};
pub use crate::connection::ConnectionError;
pub use crate::endpoint::{ConnectError, Endpoint, Event};
pub use crate::packet::{
    ConnectionHeader, Crd, Cri, DeviceDib, ErrorCode, FamiliesDib, Hpai, Packet, PacketDecodeError,
    DEFAULT_PORT,
};
pub use crate::queue::{ConsumerClass, ConsumerSet, DestSet, EnqueueError};
pub use crate::status::{
    ConnectionStats, ConnectionStatus, StatusSnapshot, UpstreamStatus, STATUS_VERSION,
};

/// Identifies one tunneling connection slot inside destination sets
///
/// Channel 0 always names the upstream session; downstream peers get 1
/// onwards. On the wire the upstream session uses whatever channel id its
/// gateway assigned, but destination tracking never sees that number.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// The upstream session's slot
    pub const UPSTREAM: Self = Self(0);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UPSTREAM {
            f.write_str("upstream")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Whether a connection record plays the initiator or acceptor role
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator: our upstream session towards the gateway
    Client = 0,
    /// The acceptor: a downstream peer tunneling through us
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

/// An outgoing UDP datagram
#[derive(Debug, Clone)]
pub struct Transmit {
    /// The socket address this datagram should be sent to
    pub destination: std::net::SocketAddr,
    /// Contents of the datagram
    pub contents: Bytes,
}
