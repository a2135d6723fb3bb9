//! Buffer descriptor rings and work-request ids.
//!
//! Every posted send or receive occupies one ring slot from post until its
//! completion is reaped. Sequence numbers increase monotonically (wrapping)
//! and map to slots by `seq & mask`; completions must be popped in exactly
//! the order they were pushed.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use sdp_proto::MessageId;
use sdp_verbs::DmaMapping;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring full ({capacity} slots)")]
    Full { capacity: u32 },

    #[error("completion for seq {seq} on an empty ring")]
    Empty { seq: u32 },

    #[error("completion out of order: expected seq {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },
}

/// Fixed-capacity FIFO of posted work, indexed by sequence number.
#[derive(Debug)]
pub struct Ring<T> {
    slots: Vec<Option<T>>,
    mask: u32,
    capacity: u32,
    /// Sequence number the next push receives.
    head: u32,
    /// Sequence number of the oldest outstanding entry.
    tail: u32,
}

impl<T> Ring<T> {
    /// A ring holding at most `capacity` entries, numbering from `start`.
    pub fn new(capacity: u32, start: u32) -> Self {
        let capacity = capacity.max(1);
        let physical = capacity.next_power_of_two();
        let mut slots = Vec::with_capacity(physical as usize);
        slots.resize_with(physical as usize, || None);
        Self {
            slots,
            mask: physical - 1,
            capacity,
            head: start,
            tail: start,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Entries posted and not yet completed.
    pub fn outstanding(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    pub fn free(&self) -> u32 {
        self.capacity - self.outstanding()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.outstanding() >= self.capacity
    }

    /// Store `item` at the head slot and return its sequence number.
    pub fn push(&mut self, item: T) -> Result<u32, RingError> {
        if self.is_full() {
            return Err(RingError::Full {
                capacity: self.capacity,
            });
        }
        let seq = self.head;
        self.slots[(seq & self.mask) as usize] = Some(item);
        self.head = self.head.wrapping_add(1);
        Ok(seq)
    }

    /// Remove the oldest entry, which must carry sequence number `seq`.
    pub fn pop(&mut self, seq: u32) -> Result<T, RingError> {
        if self.is_empty() {
            return Err(RingError::Empty { seq });
        }
        if seq != self.tail {
            return Err(RingError::OutOfOrder {
                expected: self.tail,
                got: seq,
            });
        }
        let item = self.slots[(seq & self.mask) as usize]
            .take()
            .ok_or(RingError::Empty { seq })?;
        self.tail = self.tail.wrapping_add(1);
        Ok(item)
    }

    /// Remove every outstanding entry in ring order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.outstanding() as usize);
        while !self.is_empty() {
            if let Some(item) = self.slots[(self.tail & self.mask) as usize].take() {
                out.push(item);
            }
            self.tail = self.tail.wrapping_add(1);
        }
        out
    }
}

/// A posted send.
#[derive(Debug)]
pub struct TxDesc {
    pub mseq: u32,
    pub mid: MessageId,
    /// Application bytes carried (counted against the send buffer).
    pub payload_len: usize,
    pub mappings: Vec<DmaMapping>,
}

/// A posted receive buffer.
#[derive(Debug)]
pub struct RxDesc {
    pub mappings: Vec<DmaMapping>,
    pub capacity: usize,
}

/// Kind of work a completion belongs to, stored in the top byte of the
/// work-request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpTag {
    Recv = 1,
    Send = 2,
    RdmaRead = 3,
}

/// Work-request id layout:
///
/// ```text
/// Bits 63..56: OpTag
/// Bits 55..32: reserved (zero)
/// Bits 31..0:  ring sequence number
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrId {
    pub op: OpTag,
    pub seq: u32,
}

impl WrId {
    const TAG_SHIFT: u64 = 56;
    const SEQ_MASK: u64 = 0xFFFF_FFFF;

    pub fn new(op: OpTag, seq: u32) -> Self {
        Self { op, seq }
    }

    pub fn raw(self) -> u64 {
        ((u8::from(self.op) as u64) << Self::TAG_SHIFT) | self.seq as u64
    }

    pub fn decode(raw: u64) -> Option<Self> {
        let op = OpTag::try_from((raw >> Self::TAG_SHIFT) as u8).ok()?;
        Some(Self {
            op,
            seq: (raw & Self::SEQ_MASK) as u32,
        })
    }
}

/// `a` precedes `b` in wrapping sequence space.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
