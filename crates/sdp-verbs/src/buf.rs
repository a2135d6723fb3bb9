//! Memory handles: remote buffer references, registered regions and DMA
//! mappings.

use serde::{Deserialize, Serialize};

/// Access rights requested when registering a memory region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1 << 0);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);

    pub const fn empty() -> Self {
        AccessFlags(0)
    }

    pub fn contains(&self, other: AccessFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        AccessFlags(self.0 | rhs.0)
    }
}

/// A reference to memory on the peer, as advertised by a SrcAvail.
///
/// Only `addr`, `length` and `rkey` cross the wire; the reader uses them to
/// issue remote reads chunk by chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuf {
    addr: u64,
    length: u64,
    rkey: u32,
}

impl RemoteBuf {
    pub fn new(addr: u64, length: u64, rkey: u32) -> Self {
        Self { addr, length, rkey }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.length
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Advance the buffer start by `len` bytes.
    ///
    /// Returns `false` if `len` exceeds the current size.
    pub fn advance(&mut self, len: u64) -> bool {
        if self.length < len {
            return false;
        }
        self.addr += len;
        self.length -= len;
        true
    }

    /// Return a sub-range of this buffer.
    pub fn subrange(&self, offset: u64, len: u64) -> Option<Self> {
        if offset.checked_add(len)? > self.length {
            return None;
        }
        Some(Self {
            addr: self.addr + offset,
            length: len,
            rkey: self.rkey,
        })
    }

    /// Return the first `len` bytes as a new remote buffer.
    pub fn first(&self, len: u64) -> Option<Self> {
        self.subrange(0, len)
    }
}

/// A registered memory region.
///
/// Handles are plain values; the fabric keeps the registration alive until
/// [`Fabric::release_region`](crate::Fabric::release_region) is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionHandle {
    /// Fabric-unique handle id.
    pub id: u64,
    pub lkey: u32,
    pub rkey: u32,
    /// Virtual address of the first byte, as seen by remote readers.
    pub addr: u64,
    pub len: u64,
    pub access: AccessFlags,
}

impl RegionHandle {
    /// The remote view of this region.
    pub fn remote(&self) -> RemoteBuf {
        RemoteBuf::new(self.addr, self.len, self.rkey)
    }
}

/// A device mapping of one buffer fragment.
///
/// Every mapping must be handed back to
/// [`Fabric::dma_unmap`](crate::Fabric::dma_unmap) exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaMapping {
    pub id: u64,
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
}
