//! EIBnet/IP wire codec: frame header, HPAI endpoints, connection headers and
//! the service bodies used by the core/device-management/tunneling families.
//!
//! Everything here is stateless; sequencing and validation beyond byte-level
//! structure live in [`crate::connection`] and [`crate::endpoint`].

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{BufExt, BufMutExt},
    frame::IndividualAddr,
};

/// Fixed value of the header-length octet
pub(crate) const HEADER_SIZE: u8 = 0x06;
/// EIBnet/IP protocol version 1.0
pub(crate) const PROTOCOL_VERSION: u8 = 0x10;
/// Well-known UDP port for EIBnet/IP discovery and tunneling
pub const DEFAULT_PORT: u16 = 3671;

const CONNECTION_TYPE_TUNNEL: u8 = 0x04;
const TUNNEL_LINK_LAYER: u8 = 0x02;
const HOST_PROTOCOL_UDP4: u8 = 0x01;

const DIB_DEVICE_INFO: u8 = 0x01;
const DIB_SUPPORTED_FAMILIES: u8 = 0x02;

/// 16-bit service type identifier carried in the frame header
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ServiceType(pub(crate) u16);

macro_rules! service_types {
    {$($name:ident = $val:expr,)*} => {
        impl ServiceType {
            $(pub(crate) const $name: Self = Self($val);)*

            fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    }
}

service_types! {
    SEARCH_REQUEST = 0x0201,
    SEARCH_RESPONSE = 0x0202,
    DESCRIPTION_REQUEST = 0x0203,
    DESCRIPTION_RESPONSE = 0x0204,
    CONNECT_REQUEST = 0x0205,
    CONNECT_RESPONSE = 0x0206,
    CONNECTIONSTATE_REQUEST = 0x0207,
    CONNECTIONSTATE_RESPONSE = 0x0208,
    DISCONNECT_REQUEST = 0x0209,
    DISCONNECT_RESPONSE = 0x020a,
    DEVICE_CONFIGURATION_REQUEST = 0x0310,
    DEVICE_CONFIGURATION_ACK = 0x0311,
    TUNNELING_REQUEST = 0x0420,
    TUNNELING_ACK = 0x0421,
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ServiceType({:#06x})", self.0),
        }
    }
}

/// Status octet carried in responses and acknowledgments
///
/// `0x00` signals success; everything else is a protocol-defined failure.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ErrorCode(pub(crate) u8);

macro_rules! error_codes {
    {$($(#[$doc:meta])* $name:ident = $val:expr,)*} => {
        impl ErrorCode {
            $($(#[$doc])* pub const $name: Self = Self($val);)*

            fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    }
}

error_codes! {
    /// Operation completed successfully
    NO_ERROR = 0x00,
    /// Requested host protocol is not supported
    HOST_PROTOCOL_TYPE = 0x01,
    /// Requested protocol version is not supported
    VERSION_NOT_SUPPORTED = 0x02,
    /// Received sequence number is out of order
    SEQUENCE_NUMBER = 0x04,
    /// No active connection with the given channel id
    CONNECTION_ID = 0x21,
    /// Requested connection type is not supported
    CONNECTION_TYPE = 0x22,
    /// One of the requested connection options is not supported
    CONNECTION_OPTION = 0x23,
    /// No free channel is available
    NO_MORE_CONNECTIONS = 0x24,
    /// An error concerning the data connection was detected
    DATA_CONNECTION = 0x26,
    /// An error concerning the KNX subnetwork was detected
    KNX_CONNECTION = 0x27,
}

impl ErrorCode {
    /// Whether this status octet signals success
    pub fn is_ok(self) -> bool {
        self == Self::NO_ERROR
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ErrorCode({:#04x})", self.0),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u8> for ErrorCode {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Reasons why a datagram failed to decode
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    /// The datagram ended before the structure it declared was complete
    #[error("unexpected end of packet")]
    UnexpectedEnd,
    /// A structure-length octet or mandatory constant had the wrong value
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    /// The version octet names a protocol revision we do not speak
    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),
    /// The service type is not one this implementation routes
    #[error("unsupported service type {0:#06x}")]
    UnsupportedService(u16),
    /// The total-length field disagrees with the number of bytes received
    #[error("declared length {declared} does not match received length {actual}")]
    LengthMismatch {
        /// Length declared in the frame header
        declared: u16,
        /// Number of bytes actually received
        actual: usize,
    },
}

/// Host protocol address information: transport, IPv4 address and port
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Hpai {
    /// Host protocol code; only UDP over IPv4 is routed here
    pub protocol: u8,
    /// Advertised address and port
    pub addr: SocketAddrV4,
}

impl Hpai {
    /// Construct a UDP HPAI from a socket address
    ///
    /// Non-IPv4 addresses collapse to the unspecified NAT-traversal form
    /// `0.0.0.0:0`, which instructs the peer to reply to the datagram source.
    pub fn udp(addr: SocketAddr) -> Self {
        let addr = match addr {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        Self {
            protocol: HOST_PROTOCOL_UDP4,
            addr,
        }
    }

    /// The advertised endpoint, or `fallback` for the NAT-traversal form
    ///
    /// An unspecified address or zero port instructs us to reply to the
    /// datagram's actual source instead of the advertised endpoint.
    pub fn endpoint_or(&self, fallback: SocketAddr) -> SocketAddr {
        if self.addr.ip().is_unspecified() || self.addr.port() == 0 {
            fallback
        } else {
            SocketAddr::V4(self.addr)
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, PacketDecodeError> {
        let len: u8 = buf.get()?;
        if len != 8 {
            return Err(PacketDecodeError::InvalidHeader("bad HPAI length"));
        }
        let protocol = buf.get()?;
        let ip: Ipv4Addr = buf.get()?;
        let port = buf.get()?;
        Ok(Self {
            protocol,
            addr: SocketAddrV4::new(ip, port),
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(8u8);
        buf.write(self.protocol);
        buf.write(*self.addr.ip());
        buf.write(self.addr.port());
    }
}

/// Connection request information block
///
/// Decoding is deliberately permissive about the connection type and layer:
/// the dispatcher answers unsupported values with `E_CONNECTION_TYPE` /
/// `E_CONNECTION_OPTION` rather than dropping the request.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Cri {
    /// Requested connection type
    pub conn_type: u8,
    /// Requested KNX layer
    pub layer: u8,
}

impl Cri {
    /// The only flavor this implementation serves: a link-layer tunnel
    pub fn tunnel() -> Self {
        Self {
            conn_type: CONNECTION_TYPE_TUNNEL,
            layer: TUNNEL_LINK_LAYER,
        }
    }

    /// Whether this CRI asks for a link-layer tunnel
    pub fn is_link_layer_tunnel(&self) -> bool {
        *self == Self::tunnel()
    }

    /// Whether the connection type (regardless of layer) is a tunnel
    pub fn is_tunnel(&self) -> bool {
        self.conn_type == CONNECTION_TYPE_TUNNEL
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, PacketDecodeError> {
        let len: u8 = buf.get()?;
        if len != 4 {
            return Err(PacketDecodeError::InvalidHeader("bad CRI length"));
        }
        let conn_type = buf.get()?;
        let layer = buf.get()?;
        let _reserved: u8 = buf.get()?;
        Ok(Self { conn_type, layer })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(4u8);
        buf.write(self.conn_type);
        buf.write(self.layer);
        buf.write(0u8);
    }
}

/// Connection response data block carrying the bus address assigned to the tunnel
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Crd {
    /// Individual address the gateway speaks for on behalf of this tunnel
    pub addr: IndividualAddr,
}

impl Crd {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, PacketDecodeError> {
        let len: u8 = buf.get()?;
        if len != 4 {
            return Err(PacketDecodeError::InvalidHeader("bad CRD length"));
        }
        let conn_type: u8 = buf.get()?;
        if conn_type != CONNECTION_TYPE_TUNNEL {
            return Err(PacketDecodeError::InvalidHeader("not a tunnel CRD"));
        }
        let raw: u16 = buf.get()?;
        Ok(Self {
            addr: IndividualAddr(raw),
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(4u8);
        buf.write(CONNECTION_TYPE_TUNNEL);
        buf.write(self.addr.0);
    }
}

/// Common connection header prefixed to tunneling and device-management bodies
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ConnectionHeader {
    /// Channel id of the connection this body belongs to
    pub channel: u8,
    /// Sequence counter, 0..=255 wrapping
    pub seq: u8,
    /// Status octet; reserved (zero) in requests
    pub status: ErrorCode,
}

impl ConnectionHeader {
    pub(crate) fn request(channel: u8, seq: u8) -> Self {
        Self {
            channel,
            seq,
            status: ErrorCode::NO_ERROR,
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, PacketDecodeError> {
        let len: u8 = buf.get()?;
        if len != 4 {
            return Err(PacketDecodeError::InvalidHeader(
                "bad connection header length",
            ));
        }
        let channel = buf.get()?;
        let seq = buf.get()?;
        let status: u8 = buf.get()?;
        Ok(Self {
            channel,
            seq,
            status: status.into(),
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(4u8);
        buf.write(self.channel);
        buf.write(self.seq);
        buf.write(self.status.0);
    }
}

/// Device-information description block advertised by the server role
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DeviceDib {
    /// KNX medium code (TP1 = 0x02)
    pub medium: u8,
    /// Device status octet (bit 0 = programming mode)
    pub status: u8,
    /// Individual address of the device
    pub addr: IndividualAddr,
    /// Project installation identifier
    pub project_id: u16,
    /// KNX serial number
    pub serial: [u8; 6],
    /// Routing multicast address, or unspecified when routing is not offered
    pub multicast: Ipv4Addr,
    /// MAC address
    pub mac: [u8; 6],
    /// Friendly name, at most 30 bytes
    pub name: String,
}

impl DeviceDib {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, PacketDecodeError> {
        let len: u8 = buf.get()?;
        let typ: u8 = buf.get()?;
        if len != 54 || typ != DIB_DEVICE_INFO {
            return Err(PacketDecodeError::InvalidHeader("bad device DIB"));
        }
        let medium = buf.get()?;
        let status = buf.get()?;
        let addr = IndividualAddr(buf.get()?);
        let project_id = buf.get()?;
        let mut serial = [0; 6];
        let mut mac = [0; 6];
        if buf.remaining() < 6 + 4 + 6 + 30 {
            return Err(PacketDecodeError::UnexpectedEnd);
        }
        buf.copy_to_slice(&mut serial);
        let multicast: Ipv4Addr = buf.get()?;
        buf.copy_to_slice(&mut mac);
        let mut name_raw = [0; 30];
        buf.copy_to_slice(&mut name_raw);
        let end = name_raw.iter().position(|&b| b == 0).unwrap_or(30);
        let name = String::from_utf8_lossy(&name_raw[..end]).into_owned();
        Ok(Self {
            medium,
            status,
            addr,
            project_id,
            serial,
            multicast,
            mac,
            name,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(54u8);
        buf.write(DIB_DEVICE_INFO);
        buf.write(self.medium);
        buf.write(self.status);
        buf.write(self.addr.0);
        buf.write(self.project_id);
        buf.put_slice(&self.serial);
        buf.write(self.multicast);
        buf.put_slice(&self.mac);
        let mut name_raw = [0; 30];
        let n = self.name.len().min(30);
        name_raw[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        buf.put_slice(&name_raw);
    }
}

/// Supported-service-families description block: `(family id, version)` pairs
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FamiliesDib {
    /// Advertised families
    pub families: Vec<(u8, u8)>,
}

impl FamiliesDib {
    /// The families this implementation serves: core, device management, tunneling
    pub fn ours() -> Self {
        Self {
            families: vec![(0x02, 1), (0x03, 1), (0x04, 1)],
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, PacketDecodeError> {
        let len: u8 = buf.get()?;
        let typ: u8 = buf.get()?;
        if typ != DIB_SUPPORTED_FAMILIES || len < 2 || len % 2 != 0 {
            return Err(PacketDecodeError::InvalidHeader("bad families DIB"));
        }
        let mut families = Vec::with_capacity((len as usize - 2) / 2);
        for _ in 0..(len - 2) / 2 {
            families.push((buf.get()?, buf.get()?));
        }
        Ok(Self { families })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write((2 + self.families.len() as u8 * 2) as u8);
        buf.write(DIB_SUPPORTED_FAMILIES);
        for &(family, version) in &self.families {
            buf.write(family);
            buf.write(version);
        }
    }
}

/// A decoded EIBnet/IP datagram
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// Discovery probe, answered with `SearchResponse`
    SearchRequest {
        /// Where the response should be sent
        discovery: Hpai,
    },
    /// Discovery answer
    SearchResponse {
        /// Control endpoint of the responding server
        control: Hpai,
        /// Device description
        device: DeviceDib,
        /// Service families the server speaks
        families: FamiliesDib,
    },
    /// Self-description probe, answered with `DescriptionResponse`
    DescriptionRequest {
        /// Control endpoint of the requester
        control: Hpai,
    },
    /// Self-description answer
    DescriptionResponse {
        /// Device description
        device: DeviceDib,
        /// Service families the server speaks
        families: FamiliesDib,
    },
    /// Open a tunneling connection
    ConnectRequest {
        /// Endpoint for connection-level signaling
        control: Hpai,
        /// Endpoint for tunneling traffic
        data: Hpai,
        /// Requested connection flavor
        cri: Cri,
    },
    /// Answer to `ConnectRequest`
    ConnectResponse {
        /// Assigned channel id (meaningless unless `status` is ok)
        channel: u8,
        /// Outcome of the request
        status: ErrorCode,
        /// Server data endpoint; present on success
        data: Option<Hpai>,
        /// Assigned bus address; present on success
        crd: Option<Crd>,
    },
    /// Connection keep-alive probe
    ConnectionStateRequest {
        /// Channel being probed
        channel: u8,
        /// Control endpoint of the requester
        control: Hpai,
    },
    /// Answer to `ConnectionStateRequest`
    ConnectionStateResponse {
        /// Channel that was probed
        channel: u8,
        /// Health of the connection
        status: ErrorCode,
    },
    /// Terminate a connection
    DisconnectRequest {
        /// Channel being closed
        channel: u8,
        /// Control endpoint of the requester
        control: Hpai,
    },
    /// Answer to `DisconnectRequest`
    DisconnectResponse {
        /// Channel that was closed
        channel: u8,
        /// Outcome
        status: ErrorCode,
    },
    /// Device-management request on an established channel
    DeviceConfigurationRequest {
        /// Channel and sequencing
        header: ConnectionHeader,
        /// Raw cEMI management frame
        cemi: Bytes,
    },
    /// Acknowledgment of a device-management request
    DeviceConfigurationAck {
        /// Channel, sequence and status
        header: ConnectionHeader,
    },
    /// A bus telegram carried over an established tunnel
    TunnelingRequest {
        /// Channel and sequencing
        header: ConnectionHeader,
        /// Raw cEMI bus frame
        cemi: Bytes,
    },
    /// Acknowledgment of a tunneling request
    TunnelingAck {
        /// Channel, sequence and status
        header: ConnectionHeader,
    },
}

impl Packet {
    /// Decode a datagram, validating the fixed header
    ///
    /// The declared total length must equal the number of bytes received;
    /// trailing garbage is a protocol error, not ignorable padding.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketDecodeError> {
        let mut buf = io::Cursor::new(datagram);
        let header_size: u8 = buf.get()?;
        if header_size != HEADER_SIZE {
            return Err(PacketDecodeError::InvalidHeader("bad header size"));
        }
        let version: u8 = buf.get()?;
        if version != PROTOCOL_VERSION {
            return Err(PacketDecodeError::UnsupportedVersion(version));
        }
        let service = ServiceType(buf.get()?);
        let declared: u16 = buf.get()?;
        if declared as usize != datagram.len() {
            return Err(PacketDecodeError::LengthMismatch {
                declared,
                actual: datagram.len(),
            });
        }

        let packet = match service {
            ServiceType::SEARCH_REQUEST => Self::SearchRequest {
                discovery: Hpai::decode(&mut buf)?,
            },
            ServiceType::SEARCH_RESPONSE => Self::SearchResponse {
                control: Hpai::decode(&mut buf)?,
                device: DeviceDib::decode(&mut buf)?,
                families: FamiliesDib::decode(&mut buf)?,
            },
            ServiceType::DESCRIPTION_REQUEST => Self::DescriptionRequest {
                control: Hpai::decode(&mut buf)?,
            },
            ServiceType::DESCRIPTION_RESPONSE => Self::DescriptionResponse {
                device: DeviceDib::decode(&mut buf)?,
                families: FamiliesDib::decode(&mut buf)?,
            },
            ServiceType::CONNECT_REQUEST => Self::ConnectRequest {
                control: Hpai::decode(&mut buf)?,
                data: Hpai::decode(&mut buf)?,
                cri: Cri::decode(&mut buf)?,
            },
            ServiceType::CONNECT_RESPONSE => {
                let channel = buf.get()?;
                let status = ErrorCode(buf.get()?);
                let (data, crd) = if status.is_ok() {
                    (
                        Some(Hpai::decode(&mut buf)?),
                        Some(Crd::decode(&mut buf)?),
                    )
                } else {
                    (None, None)
                };
                Self::ConnectResponse {
                    channel,
                    status,
                    data,
                    crd,
                }
            }
            ServiceType::CONNECTIONSTATE_REQUEST => {
                let channel = buf.get()?;
                let _reserved: u8 = buf.get()?;
                Self::ConnectionStateRequest {
                    channel,
                    control: Hpai::decode(&mut buf)?,
                }
            }
            ServiceType::CONNECTIONSTATE_RESPONSE => Self::ConnectionStateResponse {
                channel: buf.get()?,
                status: ErrorCode(buf.get()?),
            },
            ServiceType::DISCONNECT_REQUEST => {
                let channel = buf.get()?;
                let _reserved: u8 = buf.get()?;
                Self::DisconnectRequest {
                    channel,
                    control: Hpai::decode(&mut buf)?,
                }
            }
            ServiceType::DISCONNECT_RESPONSE => Self::DisconnectResponse {
                channel: buf.get()?,
                status: ErrorCode(buf.get()?),
            },
            ServiceType::DEVICE_CONFIGURATION_REQUEST => {
                let header = ConnectionHeader::decode(&mut buf)?;
                let cemi = buf.get_bytes(buf.remaining())?;
                Self::DeviceConfigurationRequest { header, cemi }
            }
            ServiceType::DEVICE_CONFIGURATION_ACK => Self::DeviceConfigurationAck {
                header: ConnectionHeader::decode(&mut buf)?,
            },
            ServiceType::TUNNELING_REQUEST => {
                let header = ConnectionHeader::decode(&mut buf)?;
                let cemi = buf.get_bytes(buf.remaining())?;
                Self::TunnelingRequest { header, cemi }
            }
            ServiceType::TUNNELING_ACK => Self::TunnelingAck {
                header: ConnectionHeader::decode(&mut buf)?,
            },
            other => return Err(PacketDecodeError::UnsupportedService(other.0)),
        };
        Ok(packet)
    }

    /// Encode the packet into a complete datagram, header included
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.write(HEADER_SIZE);
        buf.write(PROTOCOL_VERSION);
        buf.write(self.service_type().0);
        buf.write(0u16); // total length, patched below
        match self {
            Self::SearchRequest { discovery } => discovery.encode(&mut buf),
            Self::SearchResponse {
                control,
                device,
                families,
            } => {
                control.encode(&mut buf);
                device.encode(&mut buf);
                families.encode(&mut buf);
            }
            Self::DescriptionRequest { control } => control.encode(&mut buf),
            Self::DescriptionResponse { device, families } => {
                device.encode(&mut buf);
                families.encode(&mut buf);
            }
            Self::ConnectRequest { control, data, cri } => {
                control.encode(&mut buf);
                data.encode(&mut buf);
                cri.encode(&mut buf);
            }
            Self::ConnectResponse {
                channel,
                status,
                data,
                crd,
            } => {
                buf.write(*channel);
                buf.write(status.0);
                if let (Some(data), Some(crd)) = (data, crd) {
                    data.encode(&mut buf);
                    crd.encode(&mut buf);
                }
            }
            Self::ConnectionStateRequest { channel, control } => {
                buf.write(*channel);
                buf.write(0u8);
                control.encode(&mut buf);
            }
            Self::ConnectionStateResponse { channel, status } => {
                buf.write(*channel);
                buf.write(status.0);
            }
            Self::DisconnectRequest { channel, control } => {
                buf.write(*channel);
                buf.write(0u8);
                control.encode(&mut buf);
            }
            Self::DisconnectResponse { channel, status } => {
                buf.write(*channel);
                buf.write(status.0);
            }
            Self::DeviceConfigurationRequest { header, cemi } => {
                header.encode(&mut buf);
                buf.put_slice(cemi);
            }
            Self::DeviceConfigurationAck { header } => header.encode(&mut buf),
            Self::TunnelingRequest { header, cemi } => {
                header.encode(&mut buf);
                buf.put_slice(cemi);
            }
            Self::TunnelingAck { header } => header.encode(&mut buf),
        }
        let len = buf.len() as u16;
        buf[4..6].copy_from_slice(&len.to_be_bytes());
        buf.freeze()
    }

    fn service_type(&self) -> ServiceType {
        match self {
            Self::SearchRequest { .. } => ServiceType::SEARCH_REQUEST,
            Self::SearchResponse { .. } => ServiceType::SEARCH_RESPONSE,
            Self::DescriptionRequest { .. } => ServiceType::DESCRIPTION_REQUEST,
            Self::DescriptionResponse { .. } => ServiceType::DESCRIPTION_RESPONSE,
            Self::ConnectRequest { .. } => ServiceType::CONNECT_REQUEST,
            Self::ConnectResponse { .. } => ServiceType::CONNECT_RESPONSE,
            Self::ConnectionStateRequest { .. } => ServiceType::CONNECTIONSTATE_REQUEST,
            Self::ConnectionStateResponse { .. } => ServiceType::CONNECTIONSTATE_RESPONSE,
            Self::DisconnectRequest { .. } => ServiceType::DISCONNECT_REQUEST,
            Self::DisconnectResponse { .. } => ServiceType::DISCONNECT_RESPONSE,
            Self::DeviceConfigurationRequest { .. } => ServiceType::DEVICE_CONFIGURATION_REQUEST,
            Self::DeviceConfigurationAck { .. } => ServiceType::DEVICE_CONFIGURATION_ACK,
            Self::TunnelingRequest { .. } => ServiceType::TUNNELING_REQUEST,
            Self::TunnelingAck { .. } => ServiceType::TUNNELING_ACK,
        }
    }
}
