//! Typed SDP messages and their encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::header::{Bsdh, HeaderFlags, MessageId, BSDH_SIZE};

/// Protocol version carried in HELLO / HELLO_ACK (major 2, minor 2).
pub const SDP_PROTOCOL_VERSION: u8 = 0x22;

/// Extended header length of HELLO.
const HELLO_EXT_SIZE: usize = 12;
/// Extended header length of HELLO_ACK.
const HELLO_ACK_EXT_SIZE: usize = 8;
/// Extended header length of SRC_AVAIL.
pub const SRC_AVAIL_SIZE: usize = 16;
/// Extended header length of messages carrying a single size field.
const SIZE_EXT_SIZE: usize = 4;

/// Total encoded size of a HELLO (base header included).
pub const HELLO_SIZE: usize = BSDH_SIZE + HELLO_EXT_SIZE;
/// Total encoded size of a HELLO_ACK (base header included).
pub const HELLO_ACK_SIZE: usize = BSDH_SIZE + HELLO_ACK_EXT_SIZE;

/// Capability bits exchanged during the handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    /// The sender can serve and consume SRC_AVAIL zero-copy transfers.
    pub const ZCOPY: Capabilities = Capabilities(1 << 0);
    /// The sender honours RESIZE_REQUEST.
    pub const RESIZE: Capabilities = Capabilities(1 << 1);

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub fn from_raw(value: u8) -> Self {
        Capabilities(value)
    }

    pub fn as_raw(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Capabilities) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Capabilities(self.0 | rhs.0)
    }
}

fn check_version(version: u8) -> Result<(), ProtoError> {
    let major = version >> 4;
    if major != SDP_PROTOCOL_VERSION >> 4 {
        return Err(ProtoError::UnsupportedVersion {
            major,
            minor: version & 0x0F,
        });
    }
    Ok(())
}

fn check_remaining(buf: &impl Buf, what: &'static str, need: usize) -> Result<(), ProtoError> {
    if buf.remaining() < need {
        return Err(ProtoError::Truncated {
            what,
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

/// HELLO, sent by the active side as connect private data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    /// Receive buffers posted by the sender (its advertised depth).
    pub bufs: u16,
    pub version: u8,
    pub capabilities: Capabilities,
    /// Zero-copy advertisements the sender accepts concurrently.
    pub max_adverts: u8,
    /// Payload bytes one of the sender's receive buffers holds.
    pub local_rcv_size: u32,
    /// Payload bytes the sender would like the peer's buffers to hold.
    pub desired_remote_rcv_size: u32,
}

impl Hello {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HELLO_SIZE);
        let mut hdr = Bsdh::new(MessageId::Hello);
        hdr.bufs = self.bufs;
        hdr.len = HELLO_EXT_SIZE as u32;
        hdr.encode(&mut buf);
        buf.put_u8(self.version);
        buf.put_u8(self.capabilities.as_raw());
        buf.put_u8(self.max_adverts);
        buf.put_u8(0);
        buf.put_u32(self.local_rcv_size);
        buf.put_u32(self.desired_remote_rcv_size);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ProtoError> {
        let hdr = Bsdh::decode(&mut data)?;
        if hdr.mid != MessageId::Hello {
            return Err(ProtoError::Misplaced(hdr.mid));
        }
        check_remaining(&data, "hello", HELLO_EXT_SIZE)?;
        let version = data.get_u8();
        check_version(version)?;
        let capabilities = Capabilities::from_raw(data.get_u8());
        let max_adverts = data.get_u8();
        data.advance(1);
        Ok(Self {
            bufs: hdr.bufs,
            version,
            capabilities,
            max_adverts,
            local_rcv_size: data.get_u32(),
            desired_remote_rcv_size: data.get_u32(),
        })
    }
}

/// HELLO_ACK, sent by the passive side as accept private data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelloAck {
    pub bufs: u16,
    pub version: u8,
    pub capabilities: Capabilities,
    pub max_adverts: u8,
    /// Payload bytes one of the sender's receive buffers actually holds.
    pub actual_rcv_size: u32,
}

impl HelloAck {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HELLO_ACK_SIZE);
        let mut hdr = Bsdh::new(MessageId::HelloAck);
        hdr.bufs = self.bufs;
        hdr.len = HELLO_ACK_EXT_SIZE as u32;
        hdr.encode(&mut buf);
        buf.put_u8(self.version);
        buf.put_u8(self.capabilities.as_raw());
        buf.put_u8(self.max_adverts);
        buf.put_u8(0);
        buf.put_u32(self.actual_rcv_size);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ProtoError> {
        let hdr = Bsdh::decode(&mut data)?;
        if hdr.mid != MessageId::HelloAck {
            return Err(ProtoError::Misplaced(hdr.mid));
        }
        check_remaining(&data, "hello_ack", HELLO_ACK_EXT_SIZE)?;
        let version = data.get_u8();
        check_version(version)?;
        let capabilities = Capabilities::from_raw(data.get_u8());
        let max_adverts = data.get_u8();
        data.advance(1);
        Ok(Self {
            bufs: hdr.bufs,
            version,
            capabilities,
            max_adverts,
            actual_rcv_size: data.get_u32(),
        })
    }
}

/// Extended header of a SRC_AVAIL advertisement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SrcAvail {
    /// Length of the advertised region.
    pub len: u32,
    pub rkey: u32,
    pub vaddr: u64,
}

/// A message carried on the queue pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Data(Bytes),
    Disconn,
    Abort,
    SendSm,
    RdmaRdCompl(u32),
    SrcAvailCancel,
    ChRcvBuf(u32),
    ChRcvBufAck(u32),
    /// Sink advertisements are parsed but not acted upon.
    SinkAvail(Bytes),
    SrcAvail { advert: SrcAvail, inline: Bytes },
}

impl Message {
    pub fn mid(&self) -> MessageId {
        match self {
            Message::Data(_) => MessageId::Data,
            Message::Disconn => MessageId::Disconn,
            Message::Abort => MessageId::Abort,
            Message::SendSm => MessageId::SendSm,
            Message::RdmaRdCompl(_) => MessageId::RdmaRdCompl,
            Message::SrcAvailCancel => MessageId::SrcAvailCancel,
            Message::ChRcvBuf(_) => MessageId::ChRcvBuf,
            Message::ChRcvBufAck(_) => MessageId::ChRcvBufAck,
            Message::SinkAvail(_) => MessageId::SinkAvail,
            Message::SrcAvail { .. } => MessageId::SrcAvail,
        }
    }

    /// Application bytes carried by this message.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Data(p) => p.len(),
            Message::SrcAvail { inline, .. } => inline.len(),
            _ => 0,
        }
    }

    /// Bytes following the base header.
    pub fn body_len(&self) -> usize {
        match self {
            Message::Data(p) => p.len(),
            Message::RdmaRdCompl(_) | Message::ChRcvBuf(_) | Message::ChRcvBufAck(_) => {
                SIZE_EXT_SIZE
            }
            Message::SinkAvail(raw) => raw.len(),
            Message::SrcAvail { inline, .. } => SRC_AVAIL_SIZE + inline.len(),
            Message::Disconn | Message::Abort | Message::SendSm | Message::SrcAvailCancel => 0,
        }
    }

    /// Encode with the per-post header fields. `mid` and `len` are derived
    /// from the message itself.
    pub fn encode(
        &self,
        flags: HeaderFlags,
        bufs: u16,
        mseq: u32,
        mseq_ack: u32,
    ) -> Bytes {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(BSDH_SIZE + body_len);
        let hdr = Bsdh {
            mid: self.mid(),
            flags,
            bufs,
            len: body_len as u32,
            mseq,
            mseq_ack,
        };
        hdr.encode(&mut buf);
        match self {
            Message::Data(p) | Message::SinkAvail(p) => buf.put_slice(p),
            Message::RdmaRdCompl(n) | Message::ChRcvBuf(n) | Message::ChRcvBufAck(n) => {
                buf.put_u32(*n)
            }
            Message::SrcAvail { advert, inline } => {
                buf.put_u32(advert.len);
                buf.put_u32(advert.rkey);
                buf.put_u64(advert.vaddr);
                buf.put_slice(inline);
            }
            Message::Disconn | Message::Abort | Message::SendSm | Message::SrcAvailCancel => {}
        }
        buf.freeze()
    }

    /// Decode a message received on the queue pair.
    ///
    /// Payload bytes are sliced out of `data` without copying.
    pub fn decode(mut data: Bytes) -> Result<(Bsdh, Message), ProtoError> {
        let hdr = Bsdh::decode(&mut data)?;
        if data.len() != hdr.len as usize {
            return Err(ProtoError::LengthMismatch {
                declared: hdr.len as usize,
                actual: data.len(),
            });
        }
        let msg = match hdr.mid {
            MessageId::Hello | MessageId::HelloAck => return Err(ProtoError::Misplaced(hdr.mid)),
            MessageId::Data => Message::Data(data),
            MessageId::Disconn => Message::Disconn,
            MessageId::Abort => Message::Abort,
            MessageId::SendSm => Message::SendSm,
            MessageId::SrcAvailCancel => Message::SrcAvailCancel,
            MessageId::RdmaRdCompl => {
                check_remaining(&data, "rdma_rd_compl", SIZE_EXT_SIZE)?;
                Message::RdmaRdCompl(data.get_u32())
            }
            MessageId::ChRcvBuf => {
                check_remaining(&data, "chrcvbuf", SIZE_EXT_SIZE)?;
                Message::ChRcvBuf(data.get_u32())
            }
            MessageId::ChRcvBufAck => {
                check_remaining(&data, "chrcvbuf_ack", SIZE_EXT_SIZE)?;
                Message::ChRcvBufAck(data.get_u32())
            }
            MessageId::SinkAvail => Message::SinkAvail(data),
            MessageId::SrcAvail => {
                check_remaining(&data, "srcavail", SRC_AVAIL_SIZE)?;
                let advert = SrcAvail {
                    len: data.get_u32(),
                    rkey: data.get_u32(),
                    vaddr: data.get_u64(),
                };
                Message::SrcAvail {
                    advert,
                    inline: data,
                }
            }
        };
        Ok((hdr, msg))
    }
}
