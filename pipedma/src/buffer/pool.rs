use parking_lot::MutexGuard;

use crate::buffer::{BufferType, DmaBuf, PoolKey};
use crate::config::PoolSpec;
use crate::context::DmaContext;
use crate::error::{Error, Result};
use crate::metrics;
use crate::session::{SessionId, SessionState};
use crate::topology::DevId;

/// Fixed pool of equally sized DMA buffers for one (device, subdevice, type).
///
/// Buffers occupy a contiguous device-visible window starting at `base_pa`,
/// so the owning slot of any buffer is recovered from its address alone.
pub(crate) struct BufferPool {
    key: PoolKey,
    base_pa: u64,
    size: u32,
    /// Host memory per slot. `None` while the slot is checked out.
    slots: Vec<Option<Box<[u8]>>>,
    free_list: Vec<u32>,
}

impl BufferPool {
    /// Create a pool with `spec.count` buffers of `spec.size` bytes.
    pub fn new(key: PoolKey, spec: PoolSpec, base_pa: u64) -> Self {
        let slots = (0..spec.count)
            .map(|_| Some(vec![0u8; spec.size as usize].into_boxed_slice()))
            .collect();
        let free_list = (0..spec.count).rev().collect();
        BufferPool {
            key,
            base_pa,
            size: spec.size,
            slots,
            free_list,
        }
    }

    pub fn buf_size(&self) -> u32 {
        self.size
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.free_list.len() as u32
    }

    /// Size of the device-visible window this pool occupies.
    pub fn span(&self) -> u64 {
        self.size as u64 * self.slots.len() as u64
    }

    pub fn contains(&self, pa: u64) -> bool {
        pa >= self.base_pa && pa < self.base_pa + self.span()
    }

    /// Check out a buffer. Returns `None` if the pool is exhausted.
    pub fn take(&mut self) -> Option<DmaBuf> {
        let slot = self.free_list.pop()?;
        let mem = self.slots[slot as usize].take()?;
        Some(DmaBuf {
            key: self.key,
            slot,
            pa: self.base_pa + slot as u64 * self.size as u64,
            mem,
            used: 0,
            pipe_mask: 0,
            pushed: 0,
            msg_id: None,
        })
    }

    /// Return a buffer, locating its slot by address.
    pub fn put(&mut self, mut buf: DmaBuf) -> Result<()> {
        if !self.contains(buf.pa) {
            return Err(Error::InvalidArgument("buffer does not belong to this pool"));
        }
        let slot = ((buf.pa - self.base_pa) / self.size as u64) as usize;
        debug_assert_eq!(slot as u32, buf.slot);
        let mem = std::mem::take(&mut buf.mem);
        if self.slots[slot].is_some() || mem.len() != self.size as usize {
            // Double free. Leave the pool untouched.
            return Err(Error::Unexpected("buffer slot already free"));
        }
        self.slots[slot] = Some(mem);
        self.free_list.push(slot as u32);
        Ok(())
    }
}

// ── Session-scoped allocation ───────────────────────────────────────

impl DmaContext {
    /// Allocate a buffer of at least `size` bytes from the pool for
    /// (`dev`, `subdev`, `ty`).
    ///
    /// On exhaustion the session's composing batches are partially pushed to
    /// release buffers sooner. With `wait`, the device rings are then serviced
    /// until a buffer frees up; otherwise [`Error::TryAgain`] is returned.
    pub fn alloc_buf(
        &self,
        sess: SessionId,
        dev: DevId,
        subdev: u8,
        size: u32,
        ty: BufferType,
        wait: bool,
    ) -> Result<DmaBuf> {
        let mut st = self.sessions.lock(sess)?;
        self.alloc_locked(&mut st, dev, subdev, size, ty, wait)
    }

    /// Return a buffer to its pool.
    pub fn free_buf(&self, buf: DmaBuf) -> Result<()> {
        self.release_buf(buf)
    }

    pub(crate) fn alloc_locked(
        &self,
        st: &mut MutexGuard<'_, SessionState>,
        dev: DevId,
        subdev: u8,
        size: u32,
        ty: BufferType,
        wait: bool,
    ) -> Result<DmaBuf> {
        let device = self.device(dev)?;
        let pool = device.pool(subdev, ty)?;
        if size > pool.lock().buf_size() {
            return Err(Error::InvalidArgument("size exceeds pool buffer size"));
        }
        let mut relieved = false;
        loop {
            if let Some(buf) = pool.lock().take() {
                metrics::BUFFERS_OUTSTANDING.increment();
                return Ok(buf);
            }
            metrics::POOL_EXHAUSTED.increment();
            st.stats.pool_exhausted += 1;

            if !relieved {
                relieved = true;
                if self.push_alloc(st)? > 0 {
                    continue;
                }
            }
            if !wait {
                return Err(Error::TryAgain);
            }
            let serviced = MutexGuard::unlocked(st, || self.service_device(dev));
            if serviced == 0 && device.in_flight() == 0 && pool.lock().free_count() == 0 {
                // Nothing outstanding on the hardware can return a buffer.
                return Err(Error::NoResource("dma buffer pool"));
            }
        }
    }

    /// Return a buffer to whichever pool of its device covers its address.
    pub(crate) fn release_buf(&self, mut buf: DmaBuf) -> Result<()> {
        let Some(device) = self.device_any(buf.key.dev) else {
            // Pools already torn down; the memory goes with them.
            buf.mem = Box::default();
            return Ok(());
        };
        match device.pool_for_addr(buf.pa) {
            Some(pool) => {
                pool.lock().put(buf)?;
                metrics::BUFFERS_OUTSTANDING.decrement();
                Ok(())
            }
            None => {
                tracing::warn!(
                    dev = buf.key.dev.0,
                    pa = buf.pa,
                    "freed buffer address outside every pool"
                );
                buf.mem = Box::default();
                Err(Error::InvalidArgument("buffer address outside device pools"))
            }
        }
    }

    /// Return buffers in bulk. Failures are logged, never propagated.
    pub(crate) fn release_all(&self, bufs: impl IntoIterator<Item = DmaBuf>) {
        for buf in bufs {
            if let Err(e) = self.release_buf(buf) {
                tracing::warn!(error = %e, "failed to release dma buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    fn key() -> PoolKey {
        PoolKey {
            dev: DevId(0),
            subdev: 0,
            ty: BufferType::ReadBlock,
        }
    }

    fn discard(mut buf: DmaBuf) {
        buf.mem = Box::default();
    }

    #[test]
    fn take_and_put() {
        let mut pool = BufferPool::new(key(), PoolSpec { count: 2, size: 64 }, 0x10_000);
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert!(pool.take().is_none());
        assert_ne!(a.device_addr(), b.device_addr());
        assert!(pool.contains(a.device_addr()));
        assert!(pool.contains(b.device_addr()));
        pool.put(a).unwrap();
        assert_eq!(pool.free_count(), 1);
        pool.put(b).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn put_rejects_foreign_address() {
        let mut pool = BufferPool::new(key(), PoolSpec { count: 1, size: 64 }, 0x10_000);
        let mut other = BufferPool::new(key(), PoolSpec { count: 1, size: 64 }, 0x20_000);
        let buf = other.take().unwrap();
        match pool.put(buf) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
        // The rejected buffer was dropped with its memory; the foreign pool
        // still considers it checked out.
        assert_eq!(other.free_count(), 0);
    }

    #[test]
    fn taken_buffer_is_clean() {
        let mut pool = BufferPool::new(key(), PoolSpec { count: 1, size: 64 }, 0);
        let mut buf = pool.take().unwrap();
        buf.append(&[1, 2, 3, 4]);
        pool.put(buf).unwrap();
        let buf = pool.take().unwrap();
        assert_eq!(buf.used(), 0);
        assert_eq!(buf.capacity(), 64);
        discard(buf);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Take,
        Put(usize),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) {
                Op::Take
            } else {
                Op::Put(usize::arbitrary(g))
            }
        }
    }

    fn conservation(ops: Vec<Op>) -> bool {
        let mut pool = BufferPool::new(key(), PoolSpec { count: 8, size: 64 }, 0x4000);
        let mut held: Vec<DmaBuf> = Vec::new();
        let mut ok = true;
        for op in ops {
            match op {
                Op::Take => {
                    if let Some(buf) = pool.take() {
                        if held.iter().any(|h| h.device_addr() == buf.device_addr()) {
                            ok = false;
                        }
                        held.push(buf);
                    }
                }
                Op::Put(i) if !held.is_empty() => {
                    let buf = held.swap_remove(i % held.len());
                    ok &= pool.put(buf).is_ok();
                }
                Op::Put(_) => {}
            }
            ok &= pool.free_count() as usize + held.len() == pool.capacity() as usize;
        }
        for buf in held {
            ok &= pool.put(buf).is_ok();
        }
        ok && pool.free_count() == pool.capacity()
    }

    #[test]
    fn prop_conservation() {
        QuickCheck::new()
            .tests(200)
            .quickcheck(conservation as fn(Vec<Op>) -> bool);
    }
}
