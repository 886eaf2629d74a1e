//! DMA buffers and the per-device pools they are carved from.
//!
//! A [`DmaBuf`] is a move-only handle: while it exists its memory belongs to
//! exactly one owner (a batch chain, a pending block operation, or the
//! caller). Returning it to the pool is the only way to release it.

pub(crate) mod pool;

use crate::msg_id::MsgId;
use crate::topology::DevId;

/// Buffer types, each with its own fixed-size pool per (device, subdevice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    InstrList,
    ReadBlock,
    WriteBlock,
}

impl BufferType {
    pub const ALL: [BufferType; 3] = [
        BufferType::InstrList,
        BufferType::ReadBlock,
        BufferType::WriteBlock,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            BufferType::InstrList => 0,
            BufferType::ReadBlock => 1,
            BufferType::WriteBlock => 2,
        }
    }
}

/// Identifies the pool a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub dev: DevId,
    pub subdev: u8,
    pub ty: BufferType,
}

/// A DMA buffer checked out of a pool.
#[derive(Debug)]
pub struct DmaBuf {
    pub(crate) key: PoolKey,
    pub(crate) slot: u32,
    /// Device-visible address.
    pub(crate) pa: u64,
    /// Host memory. Empty once returned to the pool.
    pub(crate) mem: Box<[u8]>,
    pub(crate) used: u32,
    /// Destinations that still hold a reference to this buffer.
    pub(crate) pipe_mask: u32,
    /// Rings this buffer has been submitted to, by ring index.
    pub(crate) pushed: u32,
    pub(crate) msg_id: Option<MsgId>,
}

impl DmaBuf {
    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn device_addr(&self) -> u64 {
        self.pa
    }

    /// Fixed size of the buffer.
    pub fn capacity(&self) -> u32 {
        self.mem.len() as u32
    }

    /// Bytes written so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.capacity() - self.used
    }

    pub fn msg_id(&self) -> Option<MsgId> {
        self.msg_id
    }

    /// The written portion of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.mem[..self.used as usize]
    }

    /// Full backing memory, for transfers the device fills in.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    /// Append bytes. Returns `false` without writing if they do not fit.
    pub fn append(&mut self, data: &[u8]) -> bool {
        if data.len() > self.remaining() as usize {
            return false;
        }
        let start = self.used as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
        self.used += data.len() as u32;
        true
    }

    /// Drop everything past `len` bytes.
    pub fn truncate(&mut self, len: u32) {
        debug_assert!(len <= self.used);
        self.used = self.used.min(len);
    }

    /// Overwrite the written portion with `image`.
    pub(crate) fn restore(&mut self, image: &[u8]) {
        debug_assert!(image.len() <= self.mem.len());
        self.mem[..image.len()].copy_from_slice(image);
        self.used = image.len() as u32;
    }

    /// Mark `len` bytes as filled by the device.
    pub(crate) fn set_used(&mut self, len: u32) {
        self.used = len.min(self.capacity());
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        if !self.mem.is_empty() {
            tracing::warn!(
                dev = self.key.dev.0,
                subdev = self.key.subdev,
                ty = ?self.key.ty,
                slot = self.slot,
                "dma buffer dropped without being freed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(size: usize) -> DmaBuf {
        DmaBuf {
            key: PoolKey {
                dev: DevId(0),
                subdev: 0,
                ty: BufferType::InstrList,
            },
            slot: 0,
            pa: 0x1000,
            mem: vec![0u8; size].into_boxed_slice(),
            used: 0,
            pipe_mask: 0,
            pushed: 0,
            msg_id: None,
        }
    }

    #[test]
    fn append_respects_capacity() {
        let mut b = buf(8);
        assert!(b.append(&[1, 2, 3, 4]));
        assert!(!b.append(&[0; 5]));
        assert_eq!(b.used(), 4);
        assert!(b.append(&[5, 6, 7, 8]));
        assert_eq!(b.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(b.remaining(), 0);
        b.mem = Box::default();
    }

    #[test]
    fn restore_replaces_contents() {
        let mut b = buf(16);
        b.append(&[9; 12]);
        b.restore(&[1, 2]);
        assert_eq!(b.bytes(), &[1, 2]);
        b.truncate(1);
        assert_eq!(b.bytes(), &[1]);
        b.mem = Box::default();
    }
}
