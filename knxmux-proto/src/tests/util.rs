//! Deterministic harness: endpoints exchange datagrams through an in-memory
//! network with simulated time. No sockets, no sleeping.

use std::{
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    ConnectionHeader, Crd, Endpoint, EndpointConfig, ErrorCode, Event, Hpai, Packet, ServerConfig,
    Transmit,
};

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

pub(super) fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

/// Simulated clock shared by every node in a test
pub(super) struct Sim {
    pub(super) time: Instant,
}

impl Sim {
    pub(super) fn new() -> Self {
        Self {
            time: Instant::now(),
        }
    }

    pub(super) fn advance(&mut self, by: Duration) {
        self.time += by;
    }
}

/// Anything that can sit on the simulated network
pub(super) trait Node {
    fn addr(&self) -> SocketAddr;
    fn handle(&mut self, now: Instant, src: SocketAddr, datagram: &[u8]);
    fn handle_timeout(&mut self, now: Instant);
    fn poll_timeout(&self) -> Option<Instant>;
    fn poll_transmit(&mut self) -> Option<Transmit>;
}

/// Deliver datagrams and fire due timers until the network is quiescent
///
/// Datagrams addressed to nobody on the list are dropped, which doubles as
/// packet loss for tests that want it.
pub(super) fn drive(sim: &mut Sim, nodes: &mut [&mut dyn Node]) {
    loop {
        let mut moved = false;
        for i in 0..nodes.len() {
            while nodes[i].poll_timeout().is_some_and(|t| t <= sim.time) {
                nodes[i].handle_timeout(sim.time);
                moved = true;
            }
            while let Some(transmit) = nodes[i].poll_transmit() {
                moved = true;
                let src = nodes[i].addr();
                if let Some(j) = (0..nodes.len()).find(|&j| nodes[j].addr() == transmit.destination)
                {
                    nodes[j].handle(sim.time, src, &transmit.contents);
                }
            }
        }
        if !moved {
            return;
        }
    }
}

/// A real [`Endpoint`] plus the events it has emitted so far
pub(super) struct TestEndpoint {
    pub(super) endpoint: Endpoint,
    pub(super) addr: SocketAddr,
    pub(super) events: Vec<Event>,
}

impl TestEndpoint {
    pub(super) fn new(port: u16, server: bool) -> Self {
        Self::with_config(port, server, EndpointConfig::default())
    }

    pub(super) fn with_config(port: u16, server: bool, config: EndpointConfig) -> Self {
        Self::with_server_config(port, server.then(ServerConfig::default), config)
    }

    pub(super) fn with_server_config(
        port: u16,
        server: Option<ServerConfig>,
        config: EndpointConfig,
    ) -> Self {
        let addr = addr(port);
        Self {
            endpoint: Endpoint::new(addr, Arc::new(config), server.map(Arc::new)),
            addr,
            events: Vec::new(),
        }
    }

    pub(super) fn pump(&mut self) {
        while let Some(event) = self.endpoint.poll_event() {
            self.events.push(event);
        }
    }
}

impl Node for TestEndpoint {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn handle(&mut self, now: Instant, src: SocketAddr, datagram: &[u8]) {
        self.endpoint.handle(now, src, datagram);
        self.pump();
    }

    fn handle_timeout(&mut self, now: Instant) {
        self.endpoint.handle_timeout(now);
        self.pump();
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.endpoint.poll_timeout()
    }

    fn poll_transmit(&mut self) -> Option<Transmit> {
        self.endpoint.poll_transmit()
    }
}

/// Scripted wire-level peer, playing a gateway or a tunneling client
///
/// Speaks raw packets with its own counters so tests can misbehave in ways a
/// real [`Endpoint`] never would: withhold acknowledgments, repeat sequence
/// numbers, ignore keep-alives.
pub(super) struct FakePeer {
    pub(super) addr: SocketAddr,
    /// As a gateway: the channel it assigns. As a client: the channel learned
    pub(super) channel: u8,
    pub(super) seq_send: u8,
    pub(super) seq_recv: u8,
    server: bool,
    /// Withhold tunneling acks when false
    pub(super) ack_tunneling: bool,
    /// Withhold connectionstate responses when false
    pub(super) answer_heartbeats: bool,
    /// Telegrams accepted in sequence
    pub(super) telegrams: Vec<Bytes>,
    /// Sequence numbers of acks received for our own telegrams
    pub(super) acks: Vec<u8>,
    /// Every tunneling request seen, duplicates and resends included
    pub(super) requests_seen: u32,
    /// Disconnect requests received
    pub(super) disconnects: u32,
    /// Keep-alive probes received
    pub(super) heartbeats_seen: u32,
    /// Error status of a refused connect attempt (client role)
    pub(super) refused: Option<ErrorCode>,
    peer: Option<SocketAddr>,
    out: VecDeque<Transmit>,
}

impl FakePeer {
    /// A well-behaved upstream gateway assigning the given channel
    pub(super) fn gateway(port: u16, channel: u8) -> Self {
        Self {
            addr: addr(port),
            channel,
            seq_send: 0,
            seq_recv: 0,
            server: true,
            ack_tunneling: true,
            answer_heartbeats: true,
            telegrams: Vec::new(),
            acks: Vec::new(),
            requests_seen: 0,
            disconnects: 0,
            heartbeats_seen: 0,
            refused: None,
            peer: None,
            out: VecDeque::new(),
        }
    }

    /// A downstream tunneling client
    pub(super) fn client(port: u16) -> Self {
        Self {
            server: false,
            channel: 0,
            ..Self::gateway(port, 0)
        }
    }

    /// Begin the handshake towards `to`
    pub(super) fn connect(&mut self, to: SocketAddr) {
        let hpai = Hpai::udp(self.addr);
        self.peer = Some(to);
        self.push(
            to,
            &Packet::ConnectRequest {
                control: hpai,
                data: hpai,
                cri: crate::Cri::tunnel(),
            },
        );
    }

    /// Send a telegram over the established tunnel
    pub(super) fn send_telegram(&mut self, cemi: Bytes) {
        let to = self.peer.expect("no peer to send to");
        let packet = Packet::TunnelingRequest {
            header: ConnectionHeader::request(self.channel, self.seq_send),
            cemi,
        };
        self.seq_send = self.seq_send.wrapping_add(1);
        self.push(to, &packet);
    }

    /// Repeat the previous telegram with its old sequence number
    pub(super) fn resend_telegram(&mut self, cemi: Bytes) {
        let to = self.peer.expect("no peer to send to");
        let packet = Packet::TunnelingRequest {
            header: ConnectionHeader::request(self.channel, self.seq_send.wrapping_sub(1)),
            cemi,
        };
        self.push(to, &packet);
    }

    /// Send a telegram with an arbitrary sequence number
    pub(super) fn send_telegram_with_seq(&mut self, seq: u8, cemi: Bytes) {
        let to = self.peer.expect("no peer to send to");
        let packet = Packet::TunnelingRequest {
            header: ConnectionHeader::request(self.channel, seq),
            cemi,
        };
        self.push(to, &packet);
    }

    fn push(&mut self, destination: SocketAddr, packet: &Packet) {
        self.out.push_back(Transmit {
            destination,
            contents: packet.encode(),
        });
    }
}

impl Node for FakePeer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn handle(&mut self, _now: Instant, src: SocketAddr, datagram: &[u8]) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(_) => return,
        };
        match packet {
            Packet::ConnectRequest { data, .. } if self.server => {
                self.peer = Some(data.endpoint_or(src));
                let response = Packet::ConnectResponse {
                    channel: self.channel,
                    status: ErrorCode::NO_ERROR,
                    data: Some(Hpai::udp(self.addr)),
                    crd: Some(Crd {
                        addr: crate::frame::IndividualAddr::new(15, 15, 250),
                    }),
                };
                self.push(src, &response);
            }
            Packet::ConnectResponse {
                channel, status, ..
            } if !self.server => {
                if status.is_ok() {
                    self.channel = channel;
                    self.peer = Some(src);
                } else {
                    self.refused = Some(status);
                }
            }
            Packet::TunnelingRequest { header, cemi } => {
                self.requests_seen += 1;
                if self.ack_tunneling {
                    let ack = Packet::TunnelingAck {
                        header: ConnectionHeader {
                            channel: self.channel,
                            seq: header.seq,
                            status: ErrorCode::NO_ERROR,
                        },
                    };
                    self.push(src, &ack);
                }
                if header.seq == self.seq_recv {
                    self.seq_recv = self.seq_recv.wrapping_add(1);
                    self.telegrams.push(cemi);
                }
            }
            Packet::TunnelingAck { header } => {
                self.acks.push(header.seq);
            }
            Packet::ConnectionStateRequest { channel, control } => {
                self.heartbeats_seen += 1;
                if self.answer_heartbeats {
                    let response = Packet::ConnectionStateResponse {
                        channel,
                        status: ErrorCode::NO_ERROR,
                    };
                    self.push(control.endpoint_or(src), &response);
                }
            }
            Packet::DisconnectRequest { channel, control } => {
                self.disconnects += 1;
                let response = Packet::DisconnectResponse {
                    channel,
                    status: ErrorCode::NO_ERROR,
                };
                self.push(control.endpoint_or(src), &response);
            }
            _ => {}
        }
    }

    fn handle_timeout(&mut self, _now: Instant) {}

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn poll_transmit(&mut self) -> Option<Transmit> {
        self.out.pop_front()
    }
}
