//! Endpoint and tunnel configuration.

use std::{fmt, sync::Arc, time::Duration};

use crate::{auth::Authorize, frame::IndividualAddr};

/// Parameters governing tunneling sessions in both roles
///
/// Defaults match the timing constants of the classical gateway
/// implementations; deployments on lossy links may want a longer
/// acknowledgment timeout rather than more retransmits.
pub struct TunnelConfig {
    pub(crate) ack_timeout: Duration,
    pub(crate) max_transmits: u32,
    pub(crate) connect_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) max_missed_heartbeats: u32,
    pub(crate) peer_alive_timeout: Duration,
}

impl TunnelConfig {
    /// How long to wait for a tunneling acknowledgment before resending
    pub fn ack_timeout(&mut self, value: Duration) -> &mut Self {
        self.ack_timeout = value;
        self
    }

    /// Total transmissions of a tunneling request before the connection is
    /// declared dead
    ///
    /// The first transmission counts; `3` means one initial send and two
    /// resends, giving up after three acknowledgment timeouts.
    pub fn max_transmits(&mut self, value: u32) -> &mut Self {
        self.max_transmits = value.max(1);
        self
    }

    /// How long to wait for a connect response
    pub fn connect_timeout(&mut self, value: Duration) -> &mut Self {
        self.connect_timeout = value;
        self
    }

    /// Interval between keep-alive probes on the upstream session
    pub fn heartbeat_interval(&mut self, value: Duration) -> &mut Self {
        self.heartbeat_interval = value;
        self
    }

    /// How long to wait for a keep-alive reply before counting a miss
    pub fn heartbeat_timeout(&mut self, value: Duration) -> &mut Self {
        self.heartbeat_timeout = value;
        self
    }

    /// Consecutive missed keep-alives that close the upstream session
    pub fn max_missed_heartbeats(&mut self, value: u32) -> &mut Self {
        self.max_missed_heartbeats = value.max(1);
        self
    }

    /// How long a downstream peer may stay silent before it is dropped
    pub fn peer_alive_timeout(&mut self, value: Duration) -> &mut Self {
        self.peer_alive_timeout = value;
        self
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            max_transmits: 3,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(10),
            max_missed_heartbeats: 2,
            peer_alive_timeout: Duration::from_secs(120),
        }
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("ack_timeout", &self.ack_timeout)
            .field("max_transmits", &self.max_transmits)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("max_missed_heartbeats", &self.max_missed_heartbeats)
            .field("peer_alive_timeout", &self.peer_alive_timeout)
            .finish()
    }
}

/// Global configuration for an endpoint, shared by both roles
pub struct EndpointConfig {
    pub(crate) tunnel: Arc<TunnelConfig>,
    pub(crate) max_connections: usize,
    pub(crate) max_queue_depth: usize,
    pub(crate) individual_addr: IndividualAddr,
    pub(crate) device_name: String,
}

impl EndpointConfig {
    /// Tunnel timing parameters applied to every connection
    pub fn tunnel_config(&mut self, value: Arc<TunnelConfig>) -> &mut Self {
        self.tunnel = value;
        self
    }

    /// Maximum number of simultaneous downstream connections
    ///
    /// Values above 63 are clamped; channel ids are a single octet and the
    /// destination tracking keeps one bit per channel.
    pub fn max_connections(&mut self, value: usize) -> &mut Self {
        self.max_connections = value.clamp(1, 63);
        self
    }

    /// Maximum number of telegrams in flight through the fan-out queue
    pub fn max_queue_depth(&mut self, value: usize) -> &mut Self {
        self.max_queue_depth = value.max(1);
        self
    }

    /// Individual address advertised for this device
    pub fn individual_addr(&mut self, value: IndividualAddr) -> &mut Self {
        self.individual_addr = value;
        self
    }

    /// Friendly name advertised in discovery responses, at most 30 bytes
    pub fn device_name(&mut self, value: impl Into<String>) -> &mut Self {
        self.device_name = value.into();
        self
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            tunnel: Arc::new(TunnelConfig::default()),
            max_connections: 32,
            max_queue_depth: 256,
            individual_addr: IndividualAddr::default(),
            device_name: "knxmux".into(),
        }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("tunnel", &self.tunnel)
            .field("max_connections", &self.max_connections)
            .field("max_queue_depth", &self.max_queue_depth)
            .field("individual_addr", &self.individual_addr)
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// Configuration enabling the downstream server role
pub struct ServerConfig {
    pub(crate) authorizer: Arc<dyn Authorize>,
}

impl ServerConfig {
    /// Build a server configuration with the given authorization gate
    pub fn new(authorizer: Arc<dyn Authorize>) -> Self {
        Self { authorizer }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            authorizer: Arc::new(crate::auth::AllowAll),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig").finish_non_exhaustive()
    }
}
