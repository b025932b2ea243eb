//! Share one KNX bus connection between many independent clients.
//!
//! knxmux keeps a single EIBnet/IP tunneling session open towards an
//! upstream gateway and fans every bus telegram out to an arbitrary number
//! of downstream consumers: EIBnet/IP tunneling clients served on the same
//! socket, plus in-process consumer classes feeding other front ends.
//! Telegrams travelling towards the bus are funneled through the same queue
//! with acknowledgment supervision and bounded resends.
//!
//! The protocol logic is deterministic and lives in `knxmux-proto`; this
//! crate binds it to tokio: one UDP socket, one driver task, async handles.
//!
//! ```no_run
//! use knxmux::{ConsumerClass, EndpointConfig, Multiplexer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mux = Multiplexer::bind(
//!         "0.0.0.0:3671".parse()?,
//!         EndpointConfig::default(),
//!         Some(ServerConfig::default()),
//!     )
//!     .await?;
//!     mux.connect_upstream("192.168.1.10:3671".parse()?).await?;
//!
//!     let mut bus = mux.register_consumer(ConsumerClass::Socket)?;
//!     while let Some(telegram) = bus.recv().await {
//!         println!("bus: {:?}", telegram.cemi);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod consumer;
mod mux;

pub use proto::{
    auth, frame, ChannelId, ConnectError, ConnectionError, ConnectionHeader, ConnectionStats,
    ConnectionStatus, ConsumerClass, Crd, Cri, EndpointConfig, EnqueueError, ErrorCode, Event,
    Hpai, Packet, PacketDecodeError, ServerConfig, StatusSnapshot, TunnelConfig, UpstreamStatus,
    DEFAULT_PORT, STATUS_VERSION,
};

pub use crate::consumer::{Consumer, Telegram};
pub use crate::mux::{Closed, ConnectUpstreamError, Multiplexer, RelayError};
