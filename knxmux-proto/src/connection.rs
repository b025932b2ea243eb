//! Per-connection tunneling state machine.
//!
//! A `Connection` is one record of the connection table: the upstream session
//! (client role) or one downstream peer (server role). It owns the sequence
//! counters, the single in-flight telegram with its resend bookkeeping, and
//! the keep-alive accounting. It performs no I/O and keeps no clock; the
//! [`crate::endpoint::Endpoint`] feeds it packets and timeouts and forwards
//! the transmits it produces.
//!
//! Any method returning `Err` means the record has been invalidated: sequence
//! and acknowledgment mismatches are never papered over, the caller clears
//! the record and the peer has to reconnect.

use std::{net::SocketAddr, time::Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    config::TunnelConfig,
    packet::{ConnectionHeader, Cri, ErrorCode, Hpai, Packet},
    status::ConnectionStats,
    timer::{Timer, TimerTable},
    Side, Transmit,
};

/// Lifecycle of a connection record
///
/// `Unused` is represented by the record's absence from the table.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum State {
    /// Connect request sent, waiting for the response (client role only)
    Connecting,
    /// Handshake complete, telegrams may flow
    Established,
    /// Terminal; the record is about to be dropped from the table
    Closed,
}

/// The telegram currently awaiting acknowledgment
///
/// Tunneling allows a single outstanding request per connection, so this is
/// an `Option`, not a queue; ordering comes from the fan-out queue upstream
/// of the connection.
struct InFlight {
    serial: u64,
    seq: u8,
    cemi: Bytes,
    transmits: u32,
}

/// Reasons a connection record was invalidated
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No connect response arrived in time
    #[error("connect timed out")]
    ConnectTimedOut,
    /// The peer answered the connect request with an error status
    #[error("connect rejected: {0}")]
    ConnectRejected(ErrorCode),
    /// The resend budget for the in-flight telegram ran out
    #[error("no tunneling acknowledgment after {attempts} transmissions")]
    AckTimedOut {
        /// Transmissions performed, initial send included
        attempts: u32,
    },
    /// The peer acknowledged with an error status
    #[error("tunneling acknowledgment carried status {0}")]
    AckFailed(ErrorCode),
    /// Sequence or channel bookkeeping disagreed with the peer
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// A keep-alive reply carried an error status
    #[error("keep-alive reply carried status {0}")]
    HeartbeatFailed(ErrorCode),
    /// Too many keep-alive probes went unanswered
    #[error("keep-alive lost")]
    HeartbeatLost,
    /// A downstream peer stopped sending keep-alives
    #[error("peer stopped sending keep-alives")]
    PeerTimedOut,
    /// The peer sent a disconnect request
    #[error("closed by peer")]
    ClosedByPeer,
    /// The connection was closed on this side
    #[error("closed locally")]
    LocallyClosed,
}

/// One record of the connection table
pub(crate) struct Connection {
    side: Side,
    state: State,
    pub(crate) conn_id: u32,
    /// Channel id on the wire; assigned by the peer for the client role
    pub(crate) channel: u8,
    /// Peer control endpoint (where signaling goes)
    pub(crate) remote: SocketAddr,
    /// Peer data endpoint (where tunneling traffic goes)
    pub(crate) data_addr: SocketAddr,
    /// Endpoint we advertise in HPAIs
    local: SocketAddr,
    /// Next inbound sequence number we will accept
    seq_recv: u8,
    /// Sequence number the next outbound telegram will carry
    seq_sent: u8,
    in_flight: Option<InFlight>,
    pub(crate) missed_heartbeats: u32,
    /// Loopback mode: `None` until the detection scan has judged this record
    pub(crate) loopback: Option<bool>,
    timers: TimerTable,
    pub(crate) established_at: Option<Instant>,
    pub(crate) stats: ConnectionStats,
}

impl Connection {
    /// Create the upstream record and the connect request starting its handshake
    pub(crate) fn client(
        conn_id: u32,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
        config: &TunnelConfig,
    ) -> (Self, Transmit) {
        let hpai = Hpai::udp(local);
        let mut conn = Self {
            side: Side::Client,
            state: State::Connecting,
            conn_id,
            channel: 0,
            remote,
            data_addr: remote,
            local,
            seq_recv: 0,
            seq_sent: 0,
            in_flight: None,
            missed_heartbeats: 0,
            loopback: None,
            timers: TimerTable::default(),
            established_at: None,
            stats: ConnectionStats::default(),
        };
        conn.timers.set(Timer::Connect, now + config.connect_timeout);
        let transmit = conn.transmit(
            remote,
            &Packet::ConnectRequest {
                control: hpai,
                data: hpai,
                cri: Cri::tunnel(),
            },
        );
        (conn, transmit)
    }

    /// Create a downstream record for an accepted connect request
    ///
    /// The handshake is a single round trip, so the record starts out
    /// `Established`; the caller sends the connect response.
    pub(crate) fn server(
        conn_id: u32,
        channel: u8,
        local: SocketAddr,
        remote: SocketAddr,
        data_addr: SocketAddr,
        now: Instant,
        config: &TunnelConfig,
    ) -> Self {
        let mut conn = Self {
            side: Side::Server,
            state: State::Established,
            conn_id,
            channel,
            remote,
            data_addr,
            local,
            seq_recv: 0,
            seq_sent: 0,
            in_flight: None,
            missed_heartbeats: 0,
            loopback: None,
            timers: TimerTable::default(),
            established_at: Some(now),
            stats: ConnectionStats::default(),
        };
        conn.timers.set(Timer::Idle, now + config.peer_alive_timeout);
        conn
    }

    pub(crate) fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// Whether a new telegram may be started towards this peer
    pub(crate) fn send_idle(&self) -> bool {
        self.state == State::Established && self.in_flight.is_none()
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    fn transmit(&mut self, destination: SocketAddr, packet: &Packet) -> Transmit {
        self.stats.packets_sent += 1;
        Transmit {
            destination,
            contents: packet.encode(),
        }
    }

    /// Complete the client handshake from the peer's connect response
    pub(crate) fn on_connect_response(
        &mut self,
        now: Instant,
        config: &TunnelConfig,
        channel: u8,
        status: ErrorCode,
        data: Option<Hpai>,
    ) -> Result<(), ConnectionError> {
        if !(self.side.is_client() && self.state == State::Connecting) {
            trace!("dropping unexpected connect response");
            return Ok(());
        }
        self.timers.stop(Timer::Connect);
        if !status.is_ok() {
            return Err(ConnectionError::ConnectRejected(status));
        }
        self.channel = channel;
        if let Some(hpai) = data {
            self.data_addr = hpai.endpoint_or(self.remote);
        }
        self.state = State::Established;
        self.established_at = Some(now);
        self.timers
            .set(Timer::Heartbeat, now + config.heartbeat_interval);
        debug!(channel, "tunnel established");
        Ok(())
    }

    /// Begin sending a telegram; only valid when [`Self::send_idle`]
    pub(crate) fn start_send(
        &mut self,
        now: Instant,
        config: &TunnelConfig,
        serial: u64,
        cemi: Bytes,
    ) -> Transmit {
        debug_assert!(self.send_idle());
        let seq = self.seq_sent;
        let packet = Packet::TunnelingRequest {
            header: ConnectionHeader::request(self.channel, seq),
            cemi: cemi.clone(),
        };
        self.in_flight = Some(InFlight {
            serial,
            seq,
            cemi,
            transmits: 1,
        });
        self.timers.set(Timer::Ack, now + config.ack_timeout);
        self.stats.telegrams_sent += 1;
        trace!(channel = self.channel, seq, serial, "telegram out");
        let data_addr = self.data_addr;
        self.transmit(data_addr, &packet)
    }

    /// Process an acknowledgment for the in-flight telegram
    ///
    /// `Ok(Some(serial))` reports which queue entry was confirmed. A stale
    /// duplicate of the previous acknowledgment is tolerated; anything else
    /// out of step invalidates the record.
    pub(crate) fn on_tunneling_ack(
        &mut self,
        header: ConnectionHeader,
    ) -> Result<Option<u64>, ConnectionError> {
        if self.state != State::Established {
            trace!("dropping ack on unestablished connection");
            return Ok(None);
        }
        match &self.in_flight {
            Some(inflight) if header.seq == inflight.seq => {
                if !header.status.is_ok() {
                    return Err(ConnectionError::AckFailed(header.status));
                }
                let serial = inflight.serial;
                self.in_flight = None;
                self.seq_sent = self.seq_sent.wrapping_add(1);
                self.timers.stop(Timer::Ack);
                trace!(channel = self.channel, seq = header.seq, "telegram acked");
                Ok(Some(serial))
            }
            // a resend and its ack can cross on the wire, so the previous
            // telegram may be acknowledged twice
            _ if header.seq == self.seq_sent.wrapping_sub(1) => {
                trace!("duplicate ack ignored");
                Ok(None)
            }
            _ => Err(ConnectionError::ProtocolViolation(
                "tunneling ack out of sequence",
            )),
        }
    }

    /// Process an inbound telegram
    ///
    /// Returns the payload to hand to the fan-out engine (`None` for the
    /// re-acknowledged duplicate of the previous telegram) and the
    /// acknowledgment to send.
    pub(crate) fn on_tunneling_request(
        &mut self,
        now: Instant,
        config: &TunnelConfig,
        header: ConnectionHeader,
        cemi: Bytes,
    ) -> Result<(Option<Bytes>, Transmit), ConnectionError> {
        if self.state != State::Established {
            return Err(ConnectionError::ProtocolViolation(
                "tunneling request on unestablished connection",
            ));
        }
        self.touch(now, config);
        if header.seq == self.seq_recv {
            self.seq_recv = self.seq_recv.wrapping_add(1);
            self.stats.telegrams_recvd += 1;
            let ack = self.ack(header.seq);
            Ok((Some(cemi), ack))
        } else if header.seq == self.seq_recv.wrapping_sub(1) {
            // the peer missed our previous ack; repeat it, deliver nothing
            debug!(
                channel = self.channel,
                seq = header.seq,
                "re-acknowledging duplicate telegram"
            );
            let ack = self.ack(header.seq);
            Ok((None, ack))
        } else {
            Err(ConnectionError::ProtocolViolation(
                "tunneling request out of sequence",
            ))
        }
    }

    fn ack(&mut self, seq: u8) -> Transmit {
        let packet = Packet::TunnelingAck {
            header: ConnectionHeader {
                channel: self.channel,
                seq,
                status: ErrorCode::NO_ERROR,
            },
        };
        let data_addr = self.data_addr;
        self.transmit(data_addr, &packet)
    }

    /// Refresh the liveness window of a downstream peer
    fn touch(&mut self, now: Instant, config: &TunnelConfig) {
        if self.side.is_server() {
            self.timers.set(Timer::Idle, now + config.peer_alive_timeout);
        }
    }

    /// Answer a keep-alive probe from a downstream peer
    pub(crate) fn on_heartbeat_request(&mut self, now: Instant, config: &TunnelConfig) -> Transmit {
        self.touch(now, config);
        let packet = Packet::ConnectionStateResponse {
            channel: self.channel,
            status: ErrorCode::NO_ERROR,
        };
        let remote = self.remote;
        self.transmit(remote, &packet)
    }

    /// Process the reply to one of our keep-alive probes
    ///
    /// A reply arriving after its probe was already counted as missed still
    /// resets the miss counter: misses are consecutive, not cumulative.
    pub(crate) fn on_heartbeat_response(&mut self, status: ErrorCode) -> Result<(), ConnectionError> {
        if !status.is_ok() {
            return Err(ConnectionError::HeartbeatFailed(status));
        }
        self.missed_heartbeats = 0;
        self.timers.stop(Timer::HeartbeatTimeout);
        Ok(())
    }

    /// Drive every timer whose deadline has passed
    ///
    /// `Err` means the record is dead; the caller force-clears its queue
    /// bits and drops it.
    pub(crate) fn handle_timeout(
        &mut self,
        now: Instant,
        config: &TunnelConfig,
    ) -> Result<Vec<Transmit>, ConnectionError> {
        let mut out = Vec::new();
        let expired: Vec<Timer> = self.timers.expired(now).collect();
        for timer in expired {
            self.timers.stop(timer);
            match timer {
                Timer::Connect => return Err(ConnectionError::ConnectTimedOut),
                Timer::Ack => {
                    let Some(inflight) = &mut self.in_flight else {
                        continue;
                    };
                    if inflight.transmits >= config.max_transmits {
                        return Err(ConnectionError::AckTimedOut {
                            attempts: inflight.transmits,
                        });
                    }
                    inflight.transmits += 1;
                    let seq = inflight.seq;
                    let transmits = inflight.transmits;
                    let packet = Packet::TunnelingRequest {
                        header: ConnectionHeader::request(self.channel, seq),
                        cemi: inflight.cemi.clone(),
                    };
                    debug!(
                        channel = self.channel,
                        seq, transmits, "resending unacknowledged telegram"
                    );
                    let data_addr = self.data_addr;
                    out.push(self.transmit(data_addr, &packet));
                    self.timers.set(Timer::Ack, now + config.ack_timeout);
                }
                Timer::Heartbeat => {
                    self.timers
                        .set(Timer::Heartbeat, now + config.heartbeat_interval);
                    out.push(self.heartbeat(now, config));
                }
                Timer::HeartbeatTimeout => {
                    self.missed_heartbeats += 1;
                    if self.missed_heartbeats >= config.max_missed_heartbeats {
                        return Err(ConnectionError::HeartbeatLost);
                    }
                    debug!(
                        missed = self.missed_heartbeats,
                        "keep-alive went unanswered, probing again"
                    );
                    out.push(self.heartbeat(now, config));
                }
                Timer::Idle => return Err(ConnectionError::PeerTimedOut),
            }
        }
        Ok(out)
    }

    fn heartbeat(&mut self, now: Instant, config: &TunnelConfig) -> Transmit {
        let packet = Packet::ConnectionStateRequest {
            channel: self.channel,
            control: Hpai::udp(self.local),
        };
        self.timers
            .set(Timer::HeartbeatTimeout, now + config.heartbeat_timeout);
        let remote = self.remote;
        self.transmit(remote, &packet)
    }

    /// Tear the record down, optionally telling the peer
    ///
    /// Notification is skipped in loopback mode (the peer is this process)
    /// and when the peer initiated the disconnect itself.
    pub(crate) fn close(&mut self, notify: bool) -> Option<Transmit> {
        if self.state == State::Closed {
            return None;
        }
        self.state = State::Closed;
        self.timers.stop_all();
        self.in_flight = None;
        // nothing to notify before the handshake assigned a channel, and
        // nobody to notify when the peer is this same process
        if !notify || self.loopback == Some(true) || self.established_at.is_none() {
            return None;
        }
        let packet = Packet::DisconnectRequest {
            channel: self.channel,
            control: Hpai::udp(self.local),
        };
        let remote = self.remote;
        Some(self.transmit(remote, &packet))
    }
}
