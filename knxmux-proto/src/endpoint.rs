//! The multiplexing core: connection table, protocol dispatcher and fan-out.
//!
//! This object performs no I/O. Datagrams go in through [`Endpoint::handle`],
//! time goes in through [`Endpoint::handle_timeout`], and everything to be
//! sent comes back out of [`Endpoint::poll_transmit`] with application-level
//! happenings surfacing through [`Endpoint::poll_event`].
//!
//! The upstream session is an owned field rather than slot zero of the
//! downstream table; channel id 0 still names it inside destination sets,
//! but there is no index arithmetic anywhere for it to go wrong in.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    auth,
    config::{EndpointConfig, ServerConfig},
    connection::{Connection, ConnectionError},
    frame::{Dest, IndividualAddr, LData},
    packet::{
        ConnectionHeader, Crd, Cri, DeviceDib, ErrorCode, FamiliesDib, Hpai, Packet,
        PacketDecodeError,
    },
    queue::{ConsumerClass, ConsumerSet, DestSet, EnqueueError, TelegramQueue},
    status::{ConnectionStatus, StatusSnapshot, UpstreamStatus, STATUS_VERSION},
    ChannelId, Transmit,
};

/// Errors starting the upstream session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// There is already a live or connecting upstream session
    #[error("an upstream session already exists")]
    AlreadyConnected,
}

/// Things the application learns from [`Endpoint::poll_event`]
#[derive(Debug, Clone)]
pub enum Event {
    /// The upstream session completed its handshake
    UpstreamConnected,
    /// The upstream session is gone; queued relays have failed
    UpstreamLost {
        /// Why the session ended
        reason: ConnectionError,
    },
    /// A downstream peer completed its handshake
    PeerConnected {
        /// Channel assigned to the peer
        channel: ChannelId,
        /// Process-wide unique connection id
        conn_id: u32,
        /// The peer's control endpoint
        remote: SocketAddr,
    },
    /// A downstream peer is gone
    PeerDisconnected {
        /// Channel the peer held
        channel: ChannelId,
        /// Why the record was cleared
        reason: ConnectionError,
    },
    /// The authorization gate rejected a telegram
    ///
    /// The telegram was acknowledged on the wire but not forwarded; this is
    /// an observability signal, not a connection failure.
    Denied {
        /// Channel the telegram arrived on
        channel: ChannelId,
        /// Source address inside the telegram
        source: IndividualAddr,
        /// Destination inside the telegram
        dest: Dest,
    },
    /// A telegram accepted through [`Endpoint::enqueue`] reached the upstream
    Relayed {
        /// Queue serial returned by `enqueue`
        serial: u64,
    },
    /// A queued relay will never reach the upstream
    RelayFailed {
        /// Queue serial returned by `enqueue`
        serial: u64,
        /// Why delivery is impossible
        reason: ConnectionError,
    },
}

/// Protocol state for one UDP socket serving both tunneling roles
pub struct Endpoint {
    local_addr: SocketAddr,
    config: Arc<EndpointConfig>,
    server: Option<Arc<ServerConfig>>,
    upstream: Option<Connection>,
    downstream: Slab<Connection>,
    queue: TelegramQueue,
    registered: ConsumerSet,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,
    next_conn_id: u32,
}

impl Endpoint {
    /// Create an endpoint bound (logically) to `local_addr`
    ///
    /// Passing a `ServerConfig` enables the downstream server role; without
    /// it only the upstream client role is available and inbound handshake
    /// attempts are ignored.
    pub fn new(
        local_addr: SocketAddr,
        config: Arc<EndpointConfig>,
        server: Option<Arc<ServerConfig>>,
    ) -> Self {
        Self {
            local_addr,
            server,
            upstream: None,
            downstream: Slab::with_capacity(config.max_connections),
            queue: TelegramQueue::new(config.max_queue_depth),
            registered: ConsumerSet::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            next_conn_id: 0,
            config,
        }
    }

    /// The address this endpoint advertises in HPAIs
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the upstream tunneling session towards `remote`
    pub fn connect(&mut self, now: Instant, remote: SocketAddr) -> Result<(), ConnectError> {
        if self.upstream.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        let conn_id = self.alloc_conn_id();
        let tunnel = self.config.tunnel.clone();
        let (conn, transmit) = Connection::client(conn_id, self.local_addr, remote, now, &tunnel);
        debug!(%remote, conn_id, "connecting upstream");
        self.upstream = Some(conn);
        self.transmits.push_back(transmit);
        Ok(())
    }

    /// Whether the upstream session is currently usable
    pub fn upstream_established(&self) -> bool {
        self.upstream.as_ref().is_some_and(|u| u.is_established())
    }

    /// Process an incoming UDP datagram
    pub fn handle(&mut self, now: Instant, remote: SocketAddr, datagram: &[u8]) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(PacketDecodeError::UnsupportedService(service)) => {
                trace!(%remote, service, "ignoring unsupported service");
                return;
            }
            Err(e) => {
                debug!(%remote, "dropping malformed datagram: {e}");
                return;
            }
        };
        let tunnel = self.config.tunnel.clone();
        match packet {
            Packet::SearchRequest { discovery } => {
                if self.server.is_some() {
                    let destination = discovery.endpoint_or(remote);
                    let response = Packet::SearchResponse {
                        control: Hpai::udp(self.local_addr),
                        device: self.device_dib(),
                        families: FamiliesDib::ours(),
                    };
                    trace!(%destination, "answering search request");
                    self.transmits.push_back(Transmit {
                        destination,
                        contents: response.encode(),
                    });
                }
            }
            Packet::DescriptionRequest { control } => {
                if self.server.is_some() {
                    let destination = control.endpoint_or(remote);
                    let response = Packet::DescriptionResponse {
                        device: self.device_dib(),
                        families: FamiliesDib::ours(),
                    };
                    self.transmits.push_back(Transmit {
                        destination,
                        contents: response.encode(),
                    });
                }
            }
            Packet::ConnectRequest { control, data, cri } => {
                self.handle_connect_request(now, remote, control, data, cri);
            }
            Packet::ConnectResponse {
                channel,
                status,
                data,
                ..
            } => {
                let result = match self.upstream.as_mut() {
                    Some(up) if up.remote == remote => {
                        up.stats.packets_recvd += 1;
                        up.on_connect_response(now, &tunnel, channel, status, data)
                    }
                    _ => {
                        trace!(%remote, "connect response from unexpected source");
                        return;
                    }
                };
                match result {
                    Ok(()) => {
                        if self.upstream_established() {
                            self.events.push_back(Event::UpstreamConnected);
                            self.scan_loopback();
                        }
                    }
                    Err(reason) => self.close_upstream(reason, false),
                }
            }
            Packet::ConnectionStateRequest { channel, control } => {
                let destination = control.endpoint_or(remote);
                match self.route_downstream(channel, remote) {
                    Some(key) => {
                        let conn = &mut self.downstream[key];
                        conn.stats.packets_recvd += 1;
                        let mut transmit = conn.on_heartbeat_request(now, &tunnel);
                        transmit.destination = destination;
                        self.transmits.push_back(transmit);
                    }
                    None => {
                        trace!(channel, "connectionstate request for unknown channel");
                        let response = Packet::ConnectionStateResponse {
                            channel,
                            status: ErrorCode::CONNECTION_ID,
                        };
                        self.transmits.push_back(Transmit {
                            destination,
                            contents: response.encode(),
                        });
                    }
                }
            }
            Packet::ConnectionStateResponse { channel, status } => {
                if !self.is_upstream_peer(channel, remote) || !self.upstream_established() {
                    trace!(channel, "unmatched connectionstate response");
                    return;
                }
                let Some(up) = self.upstream.as_mut() else {
                    return;
                };
                up.stats.packets_recvd += 1;
                if let Err(reason) = up.on_heartbeat_response(status) {
                    self.close_upstream(reason, true);
                }
            }
            Packet::DisconnectRequest { channel, control } => {
                let destination = control.endpoint_or(remote);
                let response = Packet::DisconnectResponse {
                    channel,
                    status: ErrorCode::NO_ERROR,
                };
                self.transmits.push_back(Transmit {
                    destination,
                    contents: response.encode(),
                });
                if let Some(key) = self.route_downstream(channel, remote) {
                    self.close_downstream(key, ConnectionError::ClosedByPeer, false);
                } else if self.is_upstream_peer(channel, remote) {
                    self.close_upstream(ConnectionError::ClosedByPeer, false);
                } else {
                    trace!(channel, "disconnect request for unknown channel");
                }
            }
            Packet::DisconnectResponse { channel, status } => {
                trace!(channel, ?status, "disconnect confirmed");
            }
            Packet::TunnelingRequest { header, cemi } => {
                self.handle_tunneling_request(now, remote, header, cemi);
            }
            Packet::TunnelingAck { header } => {
                self.handle_tunneling_ack(remote, header);
            }
            Packet::DeviceConfigurationRequest { header, .. } => {
                // acknowledged but not interpreted; management payloads are
                // outside the relay's business
                if let Some(key) = self.route_downstream(header.channel, remote) {
                    let conn = &mut self.downstream[key];
                    conn.stats.packets_recvd += 1;
                    conn.stats.packets_sent += 1;
                    debug!(
                        channel = header.channel,
                        "acknowledging device management request"
                    );
                    let ack = Packet::DeviceConfigurationAck {
                        header: ConnectionHeader {
                            channel: header.channel,
                            seq: header.seq,
                            status: ErrorCode::NO_ERROR,
                        },
                    };
                    let destination = conn.data_addr;
                    self.transmits.push_back(Transmit {
                        destination,
                        contents: ack.encode(),
                    });
                }
            }
            Packet::DeviceConfigurationAck { header } => {
                trace!(channel = header.channel, "device management ack");
            }
            Packet::SearchResponse { .. } | Packet::DescriptionResponse { .. } => {
                trace!(%remote, "ignoring discovery response");
            }
        }
        self.drain(now);
    }

    /// Drive every timer whose deadline has passed, then the fan-out
    pub fn handle_timeout(&mut self, now: Instant) {
        let tunnel = self.config.tunnel.clone();
        match self.upstream.as_mut().map(|up| up.handle_timeout(now, &tunnel)) {
            Some(Ok(transmits)) => self.transmits.extend(transmits),
            Some(Err(reason)) => self.close_upstream(reason, true),
            None => {}
        }
        let keys: Vec<usize> = self.downstream.iter().map(|(key, _)| key).collect();
        for key in keys {
            let Some(conn) = self.downstream.get_mut(key) else {
                continue;
            };
            match conn.handle_timeout(now, &tunnel) {
                Ok(transmits) => self.transmits.extend(transmits),
                Err(reason) => self.close_downstream(key, reason, true),
            }
        }
        self.drain(now);
    }

    /// When [`Endpoint::handle_timeout`] next needs to run
    pub fn poll_timeout(&self) -> Option<Instant> {
        let upstream = self.upstream.as_ref().and_then(Connection::poll_timeout);
        let downstream = self
            .downstream
            .iter()
            .filter_map(|(_, conn)| conn.poll_timeout())
            .min();
        [upstream, downstream].into_iter().flatten().min()
    }

    /// Get the next datagram to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Get the next application-level event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Accept a telegram from a front end for relaying upstream
    ///
    /// Returns the queue serial; [`Event::Relayed`] or [`Event::RelayFailed`]
    /// with the same serial reports the outcome. Telegrams from front ends go
    /// upstream only, so nothing is fanned out to other consumers.
    pub fn enqueue(&mut self, now: Instant, cemi: Bytes) -> Result<u64, EnqueueError> {
        LData::parse(&cemi)?;
        if !self.upstream_established() {
            return Err(EnqueueError::UpstreamClosed);
        }
        let mut dests = DestSet::new();
        dests.insert(ChannelId::UPSTREAM);
        let serial = self.queue.enqueue(cemi, dests, ConsumerSet::new())?;
        trace!(serial, "front-end telegram queued for upstream");
        self.drain(now);
        Ok(serial)
    }

    /// Start setting the pending flag for `class` on future fan-out entries
    pub fn register_consumer(&mut self, class: ConsumerClass) {
        self.registered.insert(class);
    }

    /// Stop feeding `class` and release anything it still owed
    pub fn unregister_consumer(&mut self, class: ConsumerClass) {
        self.registered.remove(class);
        self.queue.clear_class_everywhere(class);
        self.queue.pop_complete();
    }

    /// Hand the next pending entry for `class` to its consumer
    pub fn consumer_pop(&mut self, class: ConsumerClass) -> Option<(u64, Bytes)> {
        let item = self.queue.next_for_class(class);
        self.queue.pop_complete();
        item
    }

    /// Whether [`Endpoint::consumer_pop`] would currently yield an entry
    pub fn has_consumer_work(&self, class: ConsumerClass) -> bool {
        self.queue.has_work_for_class(class)
    }

    /// Read-only snapshot for introspection
    pub fn status(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            version: STATUS_VERSION,
            queue_depth: self.queue.len(),
            upstream: self.upstream.as_ref().map(|up| UpstreamStatus {
                connection: Self::connection_status(up),
                uptime: up
                    .established_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default(),
                missed_heartbeats: up.missed_heartbeats,
            }),
            downstream: self
                .downstream
                .iter()
                .map(|(_, conn)| Self::connection_status(conn))
                .collect(),
        }
    }

    /// Tear everything down with best-effort notifications
    ///
    /// Loopback pairs skip the wire; everyone else gets a disconnect request.
    pub fn close(&mut self) {
        let keys: Vec<usize> = self.downstream.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_downstream(key, ConnectionError::LocallyClosed, true);
        }
        if self.upstream.is_some() {
            self.close_upstream(ConnectionError::LocallyClosed, true);
        }
    }

    fn connection_status(conn: &Connection) -> ConnectionStatus {
        ConnectionStatus {
            channel: conn.channel,
            conn_id: conn.conn_id,
            remote: conn.remote,
            stats: conn.stats,
            loopback: conn.loopback,
        }
    }

    fn device_dib(&self) -> DeviceDib {
        DeviceDib {
            medium: 0x02, // TP1
            status: 0,
            addr: self.config.individual_addr,
            project_id: 0,
            serial: [0; 6],
            multicast: std::net::Ipv4Addr::UNSPECIFIED,
            mac: [0; 6],
            name: self.config.device_name.clone(),
        }
    }

    fn alloc_conn_id(&mut self) -> u32 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Find the downstream record addressed by `channel`
    ///
    /// The source must be one of the peer's two recorded endpoints; channel
    /// ids alone are not trusted, since the upstream gateway hands out its
    /// own numbering independently of ours.
    fn route_downstream(&self, channel: u8, remote: SocketAddr) -> Option<usize> {
        let key = (channel as usize).checked_sub(1)?;
        let conn = self.downstream.get(key)?;
        (conn.remote == remote || conn.data_addr == remote).then_some(key)
    }

    /// Whether a packet with this channel id and source belongs to the
    /// upstream session
    fn is_upstream_peer(&self, channel: u8, remote: SocketAddr) -> bool {
        self.upstream
            .as_ref()
            .is_some_and(|u| u.channel == channel && (u.remote == remote || u.data_addr == remote))
    }

    fn handle_connect_request(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        control: Hpai,
        data: Hpai,
        cri: Cri,
    ) {
        if self.server.is_none() {
            trace!(%remote, "not serving; ignoring connect request");
            return;
        }
        let reply_to = control.endpoint_or(remote);
        if !cri.is_tunnel() {
            self.refuse_connect(reply_to, ErrorCode::CONNECTION_TYPE);
            return;
        }
        if !cri.is_link_layer_tunnel() {
            self.refuse_connect(reply_to, ErrorCode::CONNECTION_OPTION);
            return;
        }
        let data_addr = data.endpoint_or(remote);
        let tunnel = self.config.tunnel.clone();

        // a connect request from a data endpoint we already track is the
        // peer starting over; reuse its channel as a reconnect
        let existing = self
            .downstream
            .iter()
            .find(|(_, conn)| conn.data_addr == data_addr)
            .map(|(key, _)| key);
        let (key, channel) = match existing {
            Some(key) => {
                let channel = (key + 1) as u8;
                debug!(%data_addr, channel, "reconnect from known data endpoint");
                self.queue.clear_dest_everywhere(ChannelId(channel));
                self.queue.pop_complete();
                let conn_id = self.alloc_conn_id();
                self.downstream[key] = Connection::server(
                    conn_id,
                    channel,
                    self.local_addr,
                    remote,
                    data_addr,
                    now,
                    &tunnel,
                );
                self.events.push_back(Event::PeerDisconnected {
                    channel: ChannelId(channel),
                    reason: ConnectionError::ClosedByPeer,
                });
                (key, channel)
            }
            None => {
                if self.downstream.len() >= self.config.max_connections {
                    warn!(%remote, "no free tunnel slot");
                    self.refuse_connect(reply_to, ErrorCode::NO_MORE_CONNECTIONS);
                    return;
                }
                let conn_id = self.alloc_conn_id();
                let entry = self.downstream.vacant_entry();
                let key = entry.key();
                let channel = (key + 1) as u8;
                entry.insert(Connection::server(
                    conn_id,
                    channel,
                    self.local_addr,
                    remote,
                    data_addr,
                    now,
                    &tunnel,
                ));
                (key, channel)
            }
        };

        let conn = &mut self.downstream[key];
        conn.stats.packets_recvd += 1;
        conn.stats.packets_sent += 1;
        let conn_id = conn.conn_id;
        let response = Packet::ConnectResponse {
            channel,
            status: ErrorCode::NO_ERROR,
            data: Some(Hpai::udp(self.local_addr)),
            crd: Some(Crd {
                addr: self.config.individual_addr,
            }),
        };
        debug!(%remote, channel, conn_id, "tunnel accepted");
        self.transmits.push_back(Transmit {
            destination: reply_to,
            contents: response.encode(),
        });
        self.events.push_back(Event::PeerConnected {
            channel: ChannelId(channel),
            conn_id,
            remote,
        });
    }

    fn refuse_connect(&mut self, destination: SocketAddr, status: ErrorCode) {
        let response = Packet::ConnectResponse {
            channel: 0,
            status,
            data: None,
            crd: None,
        };
        self.transmits.push_back(Transmit {
            destination,
            contents: response.encode(),
        });
    }

    fn handle_tunneling_request(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        header: ConnectionHeader,
        cemi: Bytes,
    ) {
        let tunnel = self.config.tunnel.clone();
        if self.is_upstream_peer(header.channel, remote) {
            let result = match self.upstream.as_mut() {
                Some(up) => {
                    up.stats.packets_recvd += 1;
                    up.on_tunneling_request(now, &tunnel, header, cemi)
                }
                None => return,
            };
            match result {
                Ok((payload, ack)) => {
                    self.transmits.push_back(ack);
                    if let Some(cemi) = payload {
                        self.accept_from_upstream(cemi);
                    }
                }
                Err(reason) => self.close_upstream(reason, true),
            }
        } else if let Some(key) = self.route_downstream(header.channel, remote) {
            let channel = ChannelId(header.channel);
            let (result, loopback) = {
                let conn = &mut self.downstream[key];
                conn.stats.packets_recvd += 1;
                (
                    conn.on_tunneling_request(now, &tunnel, header, cemi),
                    conn.loopback == Some(true),
                )
            };
            match result {
                Ok((payload, ack)) => {
                    self.transmits.push_back(ack);
                    if let Some(cemi) = payload {
                        self.accept_from_downstream(channel, remote, loopback, cemi);
                    }
                }
                Err(reason) => self.close_downstream(key, reason, true),
            }
        } else {
            debug!(
                channel = header.channel,
                %remote,
                "tunneling request for unknown channel"
            );
        }
    }

    fn handle_tunneling_ack(&mut self, remote: SocketAddr, header: ConnectionHeader) {
        if self.is_upstream_peer(header.channel, remote) {
            let result = match self.upstream.as_mut() {
                Some(up) => {
                    up.stats.packets_recvd += 1;
                    up.on_tunneling_ack(header)
                }
                None => return,
            };
            match result {
                Ok(Some(serial)) => {
                    self.queue.clear_dest(serial, ChannelId::UPSTREAM);
                    self.events.push_back(Event::Relayed { serial });
                }
                Ok(None) => {}
                Err(reason) => self.close_upstream(reason, true),
            }
        } else if let Some(key) = self.route_downstream(header.channel, remote) {
            let channel = ChannelId(header.channel);
            let result = {
                let conn = &mut self.downstream[key];
                conn.stats.packets_recvd += 1;
                conn.on_tunneling_ack(header)
            };
            match result {
                Ok(Some(serial)) => {
                    self.queue.clear_dest(serial, channel);
                }
                Ok(None) => {}
                Err(reason) => self.close_downstream(key, reason, true),
            }
        } else {
            debug!(channel = header.channel, "tunneling ack for unknown channel");
        }
    }

    /// Fan a telegram from the upstream out to every active consumer
    fn accept_from_upstream(&mut self, cemi: Bytes) {
        let mut dests = DestSet::new();
        for (key, conn) in self.downstream.iter() {
            if conn.is_established() && conn.loopback != Some(true) {
                dests.insert(ChannelId((key + 1) as u8));
            }
        }
        let pending = self.registered;
        if dests.is_empty() && pending.is_empty() {
            trace!("telegram from upstream has no consumers");
            return;
        }
        match self.queue.enqueue(cemi, dests, pending) {
            Ok(serial) => trace!(serial, "telegram from upstream queued"),
            Err(e) => warn!("dropping telegram from upstream: {e}"),
        }
    }

    /// Admit a telegram from a downstream peer, gate permitting
    ///
    /// Downstream telegrams travel upstream only; fan-out to other peers
    /// happens on the bus, not inside the relay.
    fn accept_from_downstream(
        &mut self,
        channel: ChannelId,
        remote: SocketAddr,
        loopback: bool,
        cemi: Bytes,
    ) {
        let frame = match LData::parse(&cemi) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%channel, "dropping unparseable telegram: {e}");
                return;
            }
        };
        if let Some(server) = &self.server {
            let class = server.authorizer.classify(remote);
            if !auth::permits(class, &frame) {
                debug!(%channel, source = %frame.source, dest = %frame.dest(), "telegram denied");
                self.events.push_back(Event::Denied {
                    channel,
                    source: frame.source,
                    dest: frame.dest(),
                });
                return;
            }
        }
        if loopback {
            // our own upstream client talking to our server; the telegram
            // is already on the other role's path
            trace!(%channel, "loopback telegram short-circuited");
            return;
        }
        if !self.upstream_established() {
            debug!(%channel, "no upstream session, dropping telegram");
            return;
        }
        let mut dests = DestSet::new();
        dests.insert(ChannelId::UPSTREAM);
        match self.queue.enqueue(cemi, dests, ConsumerSet::new()) {
            Ok(serial) => trace!(serial, %channel, "downstream telegram queued for upstream"),
            Err(e) => warn!(%channel, "dropping downstream telegram: {e}"),
        }
    }

    /// One pass of the fan-out engine
    ///
    /// Starts at most one send per idle connection (tunneling allows a single
    /// outstanding request), completes loopback deliveries without touching
    /// the wire, and removes whatever the completion invariant releases at
    /// the head.
    fn drain(&mut self, now: Instant) {
        let tunnel = self.config.tunnel.clone();
        if let Some(up) = &mut self.upstream {
            if up.loopback == Some(true) && up.is_established() {
                for serial in self.queue.clear_dest_everywhere(ChannelId::UPSTREAM) {
                    trace!(serial, "loopback relay completed in-process");
                    self.events.push_back(Event::Relayed { serial });
                }
            } else if up.send_idle() {
                if let Some((serial, payload)) = self.queue.next_owed(ChannelId::UPSTREAM) {
                    self.transmits
                        .push_back(up.start_send(now, &tunnel, serial, payload));
                }
            }
        }
        for (key, conn) in self.downstream.iter_mut() {
            let channel = ChannelId((key + 1) as u8);
            if conn.loopback == Some(true) {
                self.queue.clear_dest_everywhere(channel);
                continue;
            }
            if conn.send_idle() {
                if let Some((serial, payload)) = self.queue.next_owed(channel) {
                    self.transmits
                        .push_back(conn.start_send(now, &tunnel, serial, payload));
                }
            }
        }
        self.queue.pop_complete();
    }

    /// Flag the loopback pair, once per upstream session
    ///
    /// Runs on the session's `Connecting -> Established` edge only; the
    /// upstream's flag moving off `None` makes any repeat a no-op.
    pub(crate) fn scan_loopback(&mut self) {
        let Some(up) = &mut self.upstream else {
            return;
        };
        if up.loopback.is_some() {
            return;
        }
        let mut found = false;
        for (_, conn) in self.downstream.iter_mut() {
            if conn.data_addr == self.local_addr {
                conn.loopback = Some(true);
                found = true;
                debug!(
                    channel = conn.channel,
                    "upstream session terminates at our own server; loopback on"
                );
                break;
            }
        }
        up.loopback = Some(found);
    }

    fn close_upstream(&mut self, reason: ConnectionError, notify: bool) {
        let Some(mut up) = self.upstream.take() else {
            return;
        };
        debug!(channel = up.channel, %reason, "upstream session closed");
        if let Some(transmit) = up.close(notify) {
            self.transmits.push_back(transmit);
        }
        for serial in self.queue.clear_dest_everywhere(ChannelId::UPSTREAM) {
            self.events.push_back(Event::RelayFailed {
                serial,
                reason: reason.clone(),
            });
        }
        self.queue.pop_complete();
        self.events.push_back(Event::UpstreamLost { reason });
    }

    fn close_downstream(&mut self, key: usize, reason: ConnectionError, notify: bool) {
        let mut conn = self.downstream.remove(key);
        let channel = ChannelId(conn.channel);
        debug!(%channel, %reason, "downstream connection closed");
        if let Some(transmit) = conn.close(notify) {
            self.transmits.push_back(transmit);
        }
        self.queue.clear_dest_everywhere(channel);
        self.queue.pop_complete();
        self.events.push_back(Event::PeerDisconnected { channel, reason });
    }
}
