//! The tokio binding: one UDP socket, one driver task, an async handle.
//!
//! The protocol state lives inside the driver task and is only touched
//! between awaits, so no lock is ever held across a blocking operation.
//! Every public method talks to the driver over a command channel and waits
//! on a oneshot for its outcome; closing a connection resolves the waiters
//! parked on it with an error instead of leaving them hanging.

use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use proto::{
    ConnectionError, ConsumerClass, EndpointConfig, EnqueueError, Event, ServerConfig,
    StatusSnapshot,
};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
};
use tracing::{debug, trace, warn};

use crate::consumer::{Consumer, Telegram, CONSUMER_BUFFER};

/// The driver task has exited and can no longer be reached
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("multiplexer is shut down")]
pub struct Closed;

/// Errors establishing the upstream session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectUpstreamError {
    /// The endpoint refused to start a session
    #[error(transparent)]
    Rejected(#[from] proto::ConnectError),
    /// The handshake failed
    #[error("upstream connect failed: {0}")]
    Connection(#[from] ConnectionError),
    /// The driver task is gone
    #[error(transparent)]
    Closed(#[from] Closed),
}

/// Errors relaying a telegram towards the bus
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The queue refused the telegram
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
    /// The upstream session died before acknowledging it
    #[error("relay failed: {0}")]
    Connection(#[from] ConnectionError),
    /// The driver task is gone
    #[error(transparent)]
    Closed(#[from] Closed),
}

enum Command {
    ConnectUpstream {
        remote: SocketAddr,
        done: oneshot::Sender<Result<(), ConnectUpstreamError>>,
    },
    Relay {
        cemi: Bytes,
        done: oneshot::Sender<Result<(), RelayError>>,
    },
    RegisterConsumer {
        class: ConsumerClass,
        tx: mpsc::Sender<Telegram>,
    },
    Status {
        done: oneshot::Sender<StatusSnapshot>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Async handle to a running multiplexer
///
/// Dropping the handle shuts the driver down gracefully: best-effort
/// disconnect notifications go out (skipped for loopback pairs) before the
/// task exits.
pub struct Multiplexer {
    cmd: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    local_addr: SocketAddr,
}

impl Multiplexer {
    /// Bind a UDP socket and start the driver task
    ///
    /// Pass a [`ServerConfig`] to serve downstream tunneling clients; without
    /// one only the upstream client role is active.
    pub async fn bind(
        addr: SocketAddr,
        config: EndpointConfig,
        server: Option<ServerConfig>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let endpoint = proto::Endpoint::new(local_addr, Arc::new(config), server.map(Arc::new));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            socket,
            endpoint,
            cmds: cmd_rx,
            events: event_tx,
            connect_waiter: None,
            relay_waiters: FxHashMap::default(),
            consumers: [None, None],
            shutdown_done: None,
        };
        tokio::spawn(driver.run());
        debug!(%local_addr, "multiplexer up");
        Ok(Self {
            cmd: cmd_tx,
            events: event_rx,
            local_addr,
        })
    }

    /// The bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Establish the upstream tunneling session towards `remote`
    ///
    /// Resolves once the handshake completes or fails; a timeout surfaces as
    /// [`ConnectionError::ConnectTimedOut`].
    pub async fn connect_upstream(&self, remote: SocketAddr) -> Result<(), ConnectUpstreamError> {
        let (done, rx) = oneshot::channel();
        self.cmd
            .send(Command::ConnectUpstream { remote, done })
            .map_err(|_| Closed)?;
        rx.await.map_err(|_| Closed)?
    }

    /// Relay a bus telegram (raw cEMI bytes) towards the upstream session
    ///
    /// This is the supervised send of the queue contract: it resolves when
    /// the upstream acknowledged the telegram, or fails after the bounded
    /// resends tore the session down.
    pub async fn relay(&self, cemi: Bytes) -> Result<(), RelayError> {
        let (done, rx) = oneshot::channel();
        self.cmd
            .send(Command::Relay { cemi, done })
            .map_err(|_| Closed)?;
        rx.await.map_err(|_| Closed)?
    }

    /// Subscribe a non-tunneling consumer class to the fan-out queue
    ///
    /// Every bus telegram arriving from the upstream is offered to the
    /// consumer; dropping the returned handle unsubscribes the class.
    pub fn register_consumer(&self, class: ConsumerClass) -> Result<Consumer, Closed> {
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        self.cmd
            .send(Command::RegisterConsumer { class, tx })
            .map_err(|_| Closed)?;
        Ok(Consumer::new(class, rx))
    }

    /// Read-only snapshot of connections and queue depth
    pub async fn status(&self) -> Result<StatusSnapshot, Closed> {
        let (done, rx) = oneshot::channel();
        self.cmd
            .send(Command::Status { done })
            .map_err(|_| Closed)?;
        rx.await.map_err(|_| Closed)
    }

    /// The next application-level event
    ///
    /// `None` once the driver task has exited.
    pub async fn event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Gracefully stop: notify peers, flush, tear the driver down
    pub async fn shutdown(self) {
        let (done, rx) = oneshot::channel();
        if self.cmd.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Driver {
    socket: UdpSocket,
    endpoint: proto::Endpoint,
    cmds: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    connect_waiter: Option<oneshot::Sender<Result<(), ConnectUpstreamError>>>,
    relay_waiters: FxHashMap<u64, oneshot::Sender<Result<(), RelayError>>>,
    consumers: [Option<mpsc::Sender<Telegram>>; 2],
    shutdown_done: Option<oneshot::Sender<()>>,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = [0u8; 1500];
        loop {
            self.flush().await;
            self.pump_events();
            self.feed_consumers();
            let deadline = self.endpoint.poll_timeout();
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, remote)) => self.endpoint.handle(Instant::now(), remote, &buf[..len]),
                    Err(e) => warn!("UDP receive failed: {e}"),
                },
                command = self.cmds.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    // every handle is gone; shut down
                    None => break,
                },
                () = sleep_opt(deadline) => self.endpoint.handle_timeout(Instant::now()),
            }
        }
        self.shutdown().await;
    }

    /// Returns true once the driver should stop
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ConnectUpstream { remote, done } => {
                match self.endpoint.connect(Instant::now(), remote) {
                    Ok(()) => self.connect_waiter = Some(done),
                    Err(e) => {
                        let _ = done.send(Err(e.into()));
                    }
                }
                false
            }
            Command::Relay { cemi, done } => {
                match self.endpoint.enqueue(Instant::now(), cemi) {
                    Ok(serial) => {
                        self.relay_waiters.insert(serial, done);
                    }
                    Err(e) => {
                        let _ = done.send(Err(e.into()));
                    }
                }
                false
            }
            Command::RegisterConsumer { class, tx } => {
                self.consumers[class as usize] = Some(tx);
                self.endpoint.register_consumer(class);
                false
            }
            Command::Status { done } => {
                let _ = done.send(self.endpoint.status(Instant::now()));
                false
            }
            Command::Shutdown { done } => {
                self.shutdown_done = Some(done);
                true
            }
        }
    }

    /// Put every pending datagram on the wire
    async fn flush(&mut self) {
        while let Some(transmit) = self.endpoint.poll_transmit() {
            if let Err(e) = self
                .socket
                .send_to(&transmit.contents, transmit.destination)
                .await
            {
                warn!(destination = %transmit.destination, "UDP send failed: {e}");
            }
        }
    }

    /// Resolve waiters and forward events to the application
    fn pump_events(&mut self) {
        while let Some(event) = self.endpoint.poll_event() {
            match &event {
                Event::UpstreamConnected => {
                    if let Some(waiter) = self.connect_waiter.take() {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Event::UpstreamLost { reason } => {
                    if let Some(waiter) = self.connect_waiter.take() {
                        let _ = waiter.send(Err(reason.clone().into()));
                    }
                }
                Event::Relayed { serial } => {
                    if let Some(waiter) = self.relay_waiters.remove(serial) {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Event::RelayFailed { serial, reason } => {
                    if let Some(waiter) = self.relay_waiters.remove(serial) {
                        let _ = waiter.send(Err(reason.clone().into()));
                    }
                }
                _ => {}
            }
            let _ = self.events.send(event);
        }
    }

    /// Move pending queue entries into consumer channels
    ///
    /// A full channel leaves the entry's pending flag set; it is offered
    /// again on the next pass, so a slow consumer never blocks the others.
    fn feed_consumers(&mut self) {
        for class in [ConsumerClass::Socket, ConsumerClass::Eibd] {
            let slot = class as usize;
            if self.consumers[slot]
                .as_ref()
                .is_some_and(|tx| tx.is_closed())
            {
                trace!(?class, "consumer dropped, unsubscribing");
                self.consumers[slot] = None;
                self.endpoint.unregister_consumer(class);
            }
            loop {
                let Some(tx) = &self.consumers[slot] else {
                    break;
                };
                if !self.endpoint.has_consumer_work(class) {
                    break;
                }
                let Ok(permit) = tx.try_reserve() else {
                    break;
                };
                match self.endpoint.consumer_pop(class) {
                    Some((serial, cemi)) => permit.send(Telegram { serial, cemi }),
                    None => break,
                }
            }
        }
    }

    /// Best-effort teardown: notify peers, flush, fail the stragglers
    async fn shutdown(mut self) {
        debug!("multiplexer shutting down");
        self.endpoint.close();
        self.flush().await;
        self.pump_events();
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(Closed.into()));
        }
        for (_, waiter) in self.relay_waiters.drain() {
            let _ = waiter.send(Err(Closed.into()));
        }
        if let Some(done) = self.shutdown_done.take() {
            let _ = done.send(());
        }
    }
}

/// Sleep until `deadline`, or forever when there is none
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
