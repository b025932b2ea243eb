//! Coding related traits.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::packet::PacketDecodeError;

/// Error indicating that the provided buffer was too small
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

impl From<UnexpectedEnd> for PacketDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Coding result type
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Infallible encoding and decoding of wire-format primitives
pub trait Codec: Sized {
    /// Decode a `Self` from the provided buffer, if the buffer is large enough
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append the encoding of `self` to the provided buffer
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

impl Codec for Ipv4Addr {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        let mut octets = [0; 4];
        buf.copy_to_slice(&mut octets);
        Ok(octets.into())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.octets());
    }
}

/// Convenience for decoding any `Codec` type out of a buffer
pub trait BufExt {
    /// Decode a `T` from the front of the buffer
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Copy `len` bytes out of the buffer, if available
    fn get_bytes(&mut self, len: usize) -> Result<bytes::Bytes>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }
    fn get_bytes(&mut self, len: usize) -> Result<bytes::Bytes> {
        if self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        Ok(self.copy_to_bytes(len))
    }
}

/// Convenience for encoding any `Codec` type into a buffer
pub trait BufMutExt {
    /// Append the encoding of `x` to the buffer
    fn write<T: Codec>(&mut self, x: T);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }
}
