//! Bus telegram (cEMI L_Data) decoding and the addressing convenience layer.
//!
//! Queue payloads stay raw bytes end to end; this module exists so the
//! dispatcher can read the addressing mode and service kind the authorization
//! gate needs, and so front ends get ergonomic address types. Datapoint
//! semantics are out of scope.

use std::{fmt, str::FromStr};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Message code for a data request travelling towards the bus
const L_DATA_REQ: u8 = 0x11;
/// Message code for a local confirmation of a data request
const L_DATA_CON: u8 = 0x2e;
/// Message code for a data indication arriving from the bus
const L_DATA_IND: u8 = 0x29;

/// Longest payload a telegram may carry
pub const MAX_TELEGRAM_DATA: usize = 16;

/// Individual (physical) bus address, displayed as `area.line.device`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct IndividualAddr(pub(crate) u16);

impl IndividualAddr {
    /// Build an address from its area (4 bit), line (4 bit) and device (8 bit) parts
    pub fn new(area: u8, line: u8, device: u8) -> Self {
        Self((u16::from(area & 0x0f) << 12) | (u16::from(line & 0x0f) << 8) | u16::from(device))
    }

    /// The raw 16-bit representation used on the wire
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Area part, 0..=15
    pub fn area(self) -> u8 {
        (self.0 >> 12) as u8
    }

    /// Line part, 0..=15
    pub fn line(self) -> u8 {
        ((self.0 >> 8) & 0x0f) as u8
    }

    /// Device part, 0..=255
    pub fn device(self) -> u8 {
        self.0 as u8
    }
}

impl From<u16> for IndividualAddr {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl fmt::Display for IndividualAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl fmt::Debug for IndividualAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Group address, displayed in three-level `main/middle/sub` notation
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct GroupAddr(pub(crate) u16);

impl GroupAddr {
    /// Build an address from its main (5 bit), middle (3 bit) and sub (8 bit) parts
    pub fn new(main: u8, middle: u8, sub: u8) -> Self {
        Self((u16::from(main & 0x1f) << 11) | (u16::from(middle & 0x07) << 8) | u16::from(sub))
    }

    /// The raw 16-bit representation used on the wire
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Main group, 0..=31
    pub fn main(self) -> u8 {
        (self.0 >> 11) as u8
    }

    /// Middle group, 0..=7
    pub fn middle(self) -> u8 {
        ((self.0 >> 8) & 0x07) as u8
    }

    /// Sub group, 0..=255
    pub fn sub(self) -> u8 {
        self.0 as u8
    }
}

impl From<u16> for GroupAddr {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl fmt::Display for GroupAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl fmt::Debug for GroupAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Failure to parse an address from its textual notation
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("invalid bus address")]
pub struct InvalidAddr;

fn parse_parts(s: &str, sep: char) -> Result<(u16, u16, u16), InvalidAddr> {
    let mut it = s.split(sep);
    let a = it.next().ok_or(InvalidAddr)?;
    let b = it.next().ok_or(InvalidAddr)?;
    let c = it.next().ok_or(InvalidAddr)?;
    if it.next().is_some() {
        return Err(InvalidAddr);
    }
    Ok((
        a.parse().map_err(|_| InvalidAddr)?,
        b.parse().map_err(|_| InvalidAddr)?,
        c.parse().map_err(|_| InvalidAddr)?,
    ))
}

impl FromStr for IndividualAddr {
    type Err = InvalidAddr;
    fn from_str(s: &str) -> Result<Self, InvalidAddr> {
        let (a, l, d) = parse_parts(s, '.')?;
        if a > 15 || l > 15 || d > 255 {
            return Err(InvalidAddr);
        }
        Ok(Self::new(a as u8, l as u8, d as u8))
    }
}

impl FromStr for GroupAddr {
    type Err = InvalidAddr;
    fn from_str(s: &str) -> Result<Self, InvalidAddr> {
        let (m, mid, s_) = parse_parts(s, '/')?;
        if m > 31 || mid > 7 || s_ > 255 {
            return Err(InvalidAddr);
        }
        Ok(Self::new(m as u8, mid as u8, s_ as u8))
    }
}

/// Destination of a telegram, group or individual per the control bits
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Dest {
    /// Point-to-point destination
    Individual(IndividualAddr),
    /// Group destination
    Group(GroupAddr),
}

impl fmt::Display for Dest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Individual(a) => fmt::Display::fmt(a, f),
            Self::Group(a) => fmt::Display::fmt(a, f),
        }
    }
}

/// Direction-independent classification of a telegram
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessageCode {
    /// `L_Data.req`: application to bus
    LDataReq,
    /// `L_Data.con`: confirmation of a request
    LDataCon,
    /// `L_Data.ind`: bus to application
    LDataInd,
}

impl MessageCode {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            L_DATA_REQ => Self::LDataReq,
            L_DATA_CON => Self::LDataCon,
            L_DATA_IND => Self::LDataInd,
            _ => return None,
        })
    }

    fn raw(self) -> u8 {
        match self {
            Self::LDataReq => L_DATA_REQ,
            Self::LDataCon => L_DATA_CON,
            Self::LDataInd => L_DATA_IND,
        }
    }
}

/// The application-level service a telegram performs
///
/// This is the read/write indicator the authorization gate decides on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TelegramService {
    /// Group value read
    Read,
    /// Group value response
    Response,
    /// Group value write
    Write,
    /// Anything else (management, memory access, ...)
    Other,
}

/// Reasons why a cEMI frame failed to decode
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum FrameDecodeError {
    /// The frame ended before its declared structure was complete
    #[error("truncated cEMI frame")]
    UnexpectedEnd,
    /// The message code is not an L_Data code
    #[error("unsupported cEMI message code {0:#04x}")]
    UnsupportedMessageCode(u8),
    /// The NPDU length octet disagrees with the received bytes
    #[error("cEMI length field does not match frame size")]
    LengthMismatch,
}

/// Decoded view of a cEMI L_Data frame
///
/// Re-encoding an unmodified `LData` reproduces the source bytes except for
/// additional-information blocks, which the multiplexer strips on relay.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LData {
    /// Message code
    pub code: MessageCode,
    /// First control octet: frame type, repeat, priority
    pub ctrl1: u8,
    /// Second control octet: address type, hop count
    pub ctrl2: u8,
    /// Originating individual address
    pub source: IndividualAddr,
    dest: u16,
    /// TPCI octet followed by APCI and any non-embedded payload
    npdu: Bytes,
}

impl LData {
    /// Decode a cEMI frame, skipping additional-information blocks
    pub fn parse(frame: &[u8]) -> Result<Self, FrameDecodeError> {
        if frame.len() < 2 {
            return Err(FrameDecodeError::UnexpectedEnd);
        }
        let code =
            MessageCode::from_raw(frame[0]).ok_or(FrameDecodeError::UnsupportedMessageCode(frame[0]))?;
        let addil = frame[1] as usize;
        let rest = frame.get(2 + addil..).ok_or(FrameDecodeError::UnexpectedEnd)?;
        if rest.len() < 7 {
            return Err(FrameDecodeError::UnexpectedEnd);
        }
        let ctrl1 = rest[0];
        let ctrl2 = rest[1];
        let source = IndividualAddr(u16::from_be_bytes([rest[2], rest[3]]));
        let dest = u16::from_be_bytes([rest[4], rest[5]]);
        let npdu_len = rest[6] as usize;
        let npdu = &rest[7..];
        if npdu.len() != npdu_len + 1 {
            return Err(FrameDecodeError::LengthMismatch);
        }
        Ok(Self {
            code,
            ctrl1,
            ctrl2,
            source,
            dest,
            npdu: Bytes::copy_from_slice(npdu),
        })
    }

    /// Encode into cEMI bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.npdu.len());
        buf.put_u8(self.code.raw());
        buf.put_u8(0); // no additional info
        buf.put_u8(self.ctrl1);
        buf.put_u8(self.ctrl2);
        buf.put_u16(self.source.0);
        buf.put_u16(self.dest);
        buf.put_u8((self.npdu.len() - 1) as u8);
        buf.put_slice(&self.npdu);
        buf.freeze()
    }

    /// Destination address, interpreted per the address-type control bit
    pub fn dest(&self) -> Dest {
        if self.is_group() {
            Dest::Group(GroupAddr(self.dest))
        } else {
            Dest::Individual(IndividualAddr(self.dest))
        }
    }

    /// Whether the destination is a group address
    pub fn is_group(&self) -> bool {
        self.ctrl2 & 0x80 != 0
    }

    /// The 10-bit APCI, if the frame carries one
    pub fn apci(&self) -> Option<u16> {
        if self.npdu.len() < 2 {
            return None;
        }
        Some((u16::from(self.npdu[0] & 0x03) << 8) | u16::from(self.npdu[1]))
    }

    /// Classify the application service for authorization purposes
    pub fn service(&self) -> TelegramService {
        let Some(apci) = self.apci() else {
            return TelegramService::Other;
        };
        match apci >> 6 {
            0 if apci == 0 => TelegramService::Read,
            1 => TelegramService::Response,
            2 => TelegramService::Write,
            _ => TelegramService::Other,
        }
    }

    /// Payload bytes; a small value embedded in the APCI octet is extracted
    pub fn data(&self) -> Bytes {
        match self.npdu.len() {
            0 | 1 => Bytes::new(),
            2 => Bytes::copy_from_slice(&[self.npdu[1] & 0x3f]),
            _ => self.npdu.slice(2..),
        }
    }

    /// Copy of the frame with a different message code
    ///
    /// The gateway rewrites `.req` to `.ind` when relaying a client telegram
    /// towards other clients, and vice versa on the way to the bus.
    pub fn with_code(&self, code: MessageCode) -> Self {
        Self {
            code,
            ..self.clone()
        }
    }

    /// Build a group-value write request
    pub fn group_write(source: IndividualAddr, dest: GroupAddr, data: &[u8]) -> Self {
        assert!(data.len() <= MAX_TELEGRAM_DATA, "telegram data too long");
        let npdu = if data.len() == 1 && data[0] < 0x40 {
            Bytes::copy_from_slice(&[0x00, 0x80 | data[0]])
        } else {
            let mut buf = BytesMut::with_capacity(2 + data.len());
            buf.put_slice(&[0x00, 0x80]);
            buf.put_slice(data);
            buf.freeze()
        };
        Self {
            code: MessageCode::LDataReq,
            ctrl1: 0xbc,
            ctrl2: 0xe0,
            source,
            dest: dest.0,
            npdu,
        }
    }

    /// Build a group-value read request
    pub fn group_read(source: IndividualAddr, dest: GroupAddr) -> Self {
        Self {
            code: MessageCode::LDataReq,
            ctrl1: 0xbc,
            ctrl2: 0xe0,
            source,
            dest: dest.0,
            npdu: Bytes::from_static(&[0x00, 0x00]),
        }
    }
}
