//! Base Sockets-Direct header (BSDH).

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtoError;

/// Size of the base header in bytes.
pub const BSDH_SIZE: usize = 16;

/// SDP message identifiers (the `mid` byte of every header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageId {
    Hello = 0x00,
    HelloAck = 0x01,
    Disconn = 0x02,
    Abort = 0x03,
    /// Send-stop: the receiver declines a zero-copy advertisement.
    SendSm = 0x04,
    /// Remote read of an advertised region completed.
    RdmaRdCompl = 0x06,
    SrcAvailCancel = 0x08,
    /// Change-receive-buffer (resize) request.
    ChRcvBuf = 0x0B,
    /// Change-receive-buffer acknowledgment.
    ChRcvBufAck = 0x0C,
    SinkAvail = 0xFD,
    SrcAvail = 0xFE,
    Data = 0xFF,
}

impl MessageId {
    /// Whether the message may carry application payload.
    pub fn carries_payload(self) -> bool {
        matches!(self, MessageId::Data | MessageId::SrcAvail)
    }

    /// Whether the message is only valid as connection-manager private data.
    pub fn is_handshake(self) -> bool {
        matches!(self, MessageId::Hello | MessageId::HelloAck)
    }
}

/// Header flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// The last payload byte of this message is urgent data.
    pub const OOB_PRES: HeaderFlags = HeaderFlags(1 << 0);
    /// Urgent data is pending in the stream.
    pub const OOB_PEND: HeaderFlags = HeaderFlags(1 << 1);

    pub const fn empty() -> Self {
        HeaderFlags(0)
    }

    pub fn from_raw(value: u8) -> Self {
        HeaderFlags(value)
    }

    pub fn as_raw(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: HeaderFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for HeaderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        HeaderFlags(self.0 | rhs.0)
    }
}

/// Base header carried by every SDP message.
///
/// All multi-byte fields are big-endian on the wire:
///
/// ```text
/// 0      1      2             4                     8                    12                   16
/// | mid  | flags| bufs (u16)  |     len (u32)       |    mseq (u32)      |  mseq_ack (u32)    |
/// ```
///
/// `len` counts the bytes following this header (extended header plus
/// payload).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bsdh {
    pub mid: MessageId,
    pub flags: HeaderFlags,
    /// Receive buffers the sender had posted when it sent this message.
    pub bufs: u16,
    pub len: u32,
    /// Sequence number of this message.
    pub mseq: u32,
    /// Highest sequence number the sender has received.
    pub mseq_ack: u32,
}

impl Bsdh {
    pub fn new(mid: MessageId) -> Self {
        Self {
            mid,
            flags: HeaderFlags::empty(),
            bufs: 0,
            len: 0,
            mseq: 0,
            mseq_ack: 0,
        }
    }

    /// Append the encoded header to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.mid.into());
        buf.put_u8(self.flags.as_raw());
        buf.put_u16(self.bufs);
        buf.put_u32(self.len);
        buf.put_u32(self.mseq);
        buf.put_u32(self.mseq_ack);
    }

    /// Decode a header from the front of `buf`, advancing it.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        if buf.remaining() < BSDH_SIZE {
            return Err(ProtoError::Truncated {
                what: "bsdh",
                need: BSDH_SIZE,
                have: buf.remaining(),
            });
        }
        let raw_mid = buf.get_u8();
        let mid = MessageId::try_from(raw_mid).map_err(|_| ProtoError::UnknownMessageId(raw_mid))?;
        Ok(Self {
            mid,
            flags: HeaderFlags::from_raw(buf.get_u8()),
            bufs: buf.get_u16(),
            len: buf.get_u32(),
            mseq: buf.get_u32(),
            mseq_ack: buf.get_u32(),
        })
    }

    pub fn to_bytes(&self) -> [u8; BSDH_SIZE] {
        let mut out = [0u8; BSDH_SIZE];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }
}
