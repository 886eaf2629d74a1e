use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::buffer::pool::BufferPool;
use crate::buffer::{BufferType, PoolKey};
use crate::config::Config;
use crate::error::{Error, Result, TransportError};
use crate::metrics;
use crate::notify::{Deferred, Notification, Notifier};
use crate::ring::{Descriptor, RingCredits, RingFamily, RingId, RingTransport};
use crate::session::{LockState, SessionId, SessionState, SessionTable};
use crate::topology::{DevId, DeviceInfo};

/// One device known to the engine.
pub(crate) struct Device {
    pub id: DevId,
    pub info: DeviceInfo,
    il_rings: u8,
    /// Indexed by `subdev * 3 + type`.
    pools: Vec<Mutex<BufferPool>>,
    locked: AtomicBool,
    active: AtomicBool,
    in_flight: AtomicU32,
    notify: Mutex<HashMap<RingFamily, Notifier<Notification>>>,
}

impl Device {
    pub fn pool(&self, subdev: u8, ty: BufferType) -> Result<&Mutex<BufferPool>> {
        if subdev >= self.info.subdevices {
            return Err(Error::InvalidArgument("subdevice out of range"));
        }
        let idx = subdev as usize * BufferType::ALL.len() + ty.index();
        self.pools
            .get(idx)
            .ok_or(Error::Unexpected("missing buffer pool"))
    }

    /// Pool whose address window covers `pa`.
    pub fn pool_for_addr(&self, pa: u64) -> Option<&Mutex<BufferPool>> {
        self.pools.iter().find(|p| p.lock().contains(pa))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn lock_state(&self) -> LockState {
        if self.is_locked() {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    /// Buffers handed to hardware and not yet completed, across all rings.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_in_flight(&self) {
        let prev = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        debug_assert!(prev > 0, "in-flight underflow on device {}", self.id.0);
    }

    /// Number of rings of `family` on each subdevice.
    pub fn ring_count(&self, family: RingFamily) -> u8 {
        match family {
            RingFamily::InstrList => self.il_rings,
            RingFamily::WriteBlock => self.info.pipes_per_subdevice,
            RingFamily::ReadBlock | RingFamily::Learn | RingFamily::Stat | RingFamily::Idle => 1,
        }
    }

    pub fn rings(&self, family: RingFamily) -> Vec<RingId> {
        let per = self.ring_count(family);
        (0..self.info.subdevices)
            .flat_map(|sd| (0..per).map(move |i| RingId::new(family, sd, i)))
            .collect()
    }

    pub fn notifier(&self, family: RingFamily) -> Option<Notifier<Notification>> {
        self.notify.lock().get(&family).cloned()
    }

    /// Physical pipe reporting on a write-block ring.
    pub fn ring_pipe(&self, ring: RingId) -> Option<u32> {
        if ring.subdevice >= self.info.subdevices || ring.index >= self.info.pipes_per_subdevice {
            return None;
        }
        Some(ring.subdevice as u32 * self.info.pipes_per_subdevice as u32 + ring.index as u32)
    }

    /// Write-block ring serving physical pipe `pipe`.
    pub fn pipe_ring(&self, pipe: u32) -> RingId {
        let (sd, idx) = self.info.locate_pipe(pipe);
        RingId::new(RingFamily::WriteBlock, sd, idx)
    }
}

/// The DMA engine: devices, sessions and the transport they share.
///
/// Several contexts may coexist; nothing is process-global except the
/// metrics.
pub struct DmaContext {
    pub(crate) config: Config,
    pub(crate) transport: Arc<dyn RingTransport>,
    devices: RwLock<Vec<Option<Arc<Device>>>>,
    pub(crate) sessions: SessionTable,
    pub(crate) credits: RingCredits,
    next_pa: Mutex<u64>,
}

impl DmaContext {
    pub fn new(config: Config, transport: Arc<dyn RingTransport>) -> Result<Self> {
        config.validate()?;
        let devices = (0..config.max_devices).map(|_| None).collect();
        Ok(DmaContext {
            sessions: SessionTable::new(config.max_sessions),
            credits: RingCredits::new(config.flow_control),
            next_pa: Mutex::new(config.dma_base),
            devices: RwLock::new(devices),
            transport,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn device(&self, dev: DevId) -> Result<Arc<Device>> {
        self.device_any(dev)
            .filter(|d| d.is_active())
            .ok_or(Error::InvalidArgument("device not active"))
    }

    /// Device lookup that also finds devices being torn down.
    pub(crate) fn device_any(&self, dev: DevId) -> Option<Arc<Device>> {
        self.devices.read().get(dev.0 as usize).cloned().flatten()
    }

    // ── Device lifecycle ────────────────────────────────────────────

    /// Register a device and create its buffer pools.
    pub fn add_device(&self, dev: DevId, info: DeviceInfo) -> Result<()> {
        info.validate()?;
        if dev.0 as u16 >= self.config.max_devices {
            return Err(Error::InvalidArgument("device id out of range"));
        }
        if self.device_any(dev).is_some() {
            return Err(Error::InvalidArgument("device already added"));
        }

        let mut pools = Vec::with_capacity(info.subdevices as usize * BufferType::ALL.len());
        {
            let mut next_pa = self.next_pa.lock();
            for subdev in 0..info.subdevices {
                for ty in BufferType::ALL {
                    let key = PoolKey { dev, subdev, ty };
                    let pool = BufferPool::new(key, self.config.pools.spec(ty), *next_pa);
                    *next_pa += pool.span();
                    pools.push(Mutex::new(pool));
                }
            }
        }

        let device = Arc::new(Device {
            id: dev,
            il_rings: self.config.il_rings,
            pools,
            locked: AtomicBool::new(false),
            active: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
            notify: Mutex::new(HashMap::new()),
            info,
        });
        {
            let mut devices = self.devices.write();
            let slot = &mut devices[dev.0 as usize];
            if slot.is_some() {
                return Err(Error::InvalidArgument("device already added"));
            }
            *slot = Some(Arc::clone(&device));
        }
        self.cache_ring_depths(dev)?;
        tracing::info!(
            dev = dev.0,
            family = ?device.info.family,
            subdevices = device.info.subdevices,
            pipes = device.info.pipe_count(),
            "device added"
        );
        Ok(())
    }

    /// Tear down a device: drain its slice of every session and destroy
    /// its buffer pools. Work queued for other devices is untouched; pushed
    /// batches and block operations that lose buffers report an error.
    pub fn remove_device(&self, dev: DevId) -> Result<()> {
        let device = self.device_any(dev).ok_or(Error::NotFound)?;
        device.active.store(false, Ordering::Release);

        for slot in self.sessions.iter() {
            let mut deferred = Deferred::default();
            let mut st = slot.lock();
            self.detach_device(&mut st, &device, &mut deferred);
            drop(st);
            deferred.run();
        }

        self.credits.forget(dev);
        self.devices.write()[dev.0 as usize] = None;
        tracing::info!(dev = dev.0, "device removed");
        Ok(())
    }

    /// Pull `dev` out of one session. Operations that lose work on `dev`
    /// report an error through `deferred`.
    fn detach_device(&self, st: &mut SessionState, device: &Device, deferred: &mut Deferred) {
        let dev = device.id;
        let mut freed = Vec::new();
        for batch in st.composing.iter_mut().flatten() {
            freed.extend(batch.detach_device(dev));
        }

        let mut drained = Vec::new();
        for (key, pushed) in st.pushed.iter_mut() {
            let lost = pushed.detach_device(dev);
            if lost.is_empty() {
                continue;
            }
            for (id, inflight) in lost {
                st.routes.remove(&id);
                freed.push(inflight);
            }
            if pushed.sealed && pushed.is_drained() {
                drained.push(key);
            }
        }
        for key in drained {
            self.finish_pushed(st, key, deferred);
        }

        let reads: Vec<_> = st
            .read_ops
            .iter()
            .filter(|(_, op)| op.dev == dev)
            .map(|(k, _)| k)
            .collect();
        for key in reads {
            let op = st.read_ops.remove(key);
            let (bufs, failed) = op.abandon(deferred);
            st.stats.read_block_errors += failed as u64;
            for (id, buf) in bufs {
                st.routes.remove(&id);
                freed.push(buf);
            }
        }

        let writes: Vec<_> = st
            .write_ops
            .iter()
            .filter(|(_, op)| op.dev == dev)
            .map(|(k, _)| k)
            .collect();
        for key in writes {
            let op = st.write_ops.remove(key);
            st.routes.remove(&op.msg_id);
            st.stats.write_block_errors += 1;
            freed.push(op.abandon(deferred));
        }

        let read_ils: Vec<_> = st
            .read_ils
            .iter()
            .filter(|(_, op)| op.buf.key().dev == dev)
            .map(|(k, _)| k)
            .collect();
        for key in read_ils {
            let op = st.read_ils.remove(key);
            if let Some(id) = op.buf.msg_id() {
                st.routes.remove(&id);
            }
            st.stats.il_errors += 1;
            freed.push(op.abandon(deferred));
        }

        if !freed.is_empty() {
            tracing::debug!(
                session = st.id.0,
                dev = dev.0,
                buffers = freed.len(),
                "dropped device slice of session"
            );
        }
        self.release_all(freed);
    }

    /// Route new instruction-list appends for `dev` into each session's
    /// locked batch.
    pub fn lock_device(&self, dev: DevId) -> Result<()> {
        self.device(dev)?.locked.store(true, Ordering::Release);
        Ok(())
    }

    /// Clear the reconfiguration lock and push `dev`'s chains out of every
    /// session's locked batch. Chains for devices still locked stay queued.
    /// The first push failure is returned after all sessions have been
    /// tried.
    pub fn unlock_device(&self, dev: DevId) -> Result<()> {
        let device = self.device(dev)?;
        device.locked.store(false, Ordering::Release);

        let idx_locked = LockState::Locked.index();
        let mut first_err = None;
        for idx in 0..self.sessions.len() {
            let Some(slot) = self.sessions.get(idx as u16) else {
                break;
            };
            let mut st = slot.lock();
            if !st.open {
                continue;
            }
            let Some(batch) = st.composing[idx_locked].as_mut() else {
                continue;
            };
            if !batch.touches(dev) {
                continue;
            }
            let res = if batch.open_bracket_on(dev) {
                Err(Error::InvalidArgument("atomic bracket still open"))
            } else {
                Ok(batch.take_device(dev))
            };
            if batch.is_empty() {
                st.composing[idx_locked] = None;
            }
            let mut deferred = Deferred::default();
            let res = res.and_then(|part| self.push_batch(&mut st, part, None, &mut deferred));
            drop(st);
            deferred.run();
            if let Err(e) = res {
                tracing::warn!(session = idx, dev = dev.0, error = %e, "locked batch push failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Register (or clear) the listener for a notification ring family.
    pub fn set_notify(
        &self,
        dev: DevId,
        family: RingFamily,
        notifier: Option<Notifier<Notification>>,
    ) -> Result<()> {
        if !family.is_notification() {
            return Err(Error::InvalidArgument("not a notification ring family"));
        }
        let device = self.device(dev)?;
        let mut notify = device.notify.lock();
        match notifier {
            Some(n) => notify.insert(family, n),
            None => notify.remove(&family),
        };
        Ok(())
    }

    /// Refresh the completion-ring depths used for flow control.
    pub fn cache_ring_depths(&self, dev: DevId) -> Result<()> {
        let device = self.device(dev)?;
        for ring in device.rings(RingFamily::InstrList) {
            let depth = self.transport.depth(dev, ring);
            self.credits.set_depth(dev, ring, depth);
        }
        Ok(())
    }

    // ── Registers ───────────────────────────────────────────────────

    /// Blocking register read outside the rings.
    pub fn reg_read(&self, sess: SessionId, dev: DevId, subdev: u8, addr: u32) -> Result<u32> {
        self.check_reg_access(sess, dev, subdev)?;
        Ok(self.transport.reg_read(dev, subdev, addr)?)
    }

    /// Blocking register write outside the rings.
    pub fn reg_write(
        &self,
        sess: SessionId,
        dev: DevId,
        subdev: u8,
        addr: u32,
        value: u32,
    ) -> Result<()> {
        self.check_reg_access(sess, dev, subdev)?;
        Ok(self.transport.reg_write(dev, subdev, addr, value)?)
    }

    fn check_reg_access(&self, sess: SessionId, dev: DevId, subdev: u8) -> Result<()> {
        drop(self.sessions.lock(sess)?);
        let device = self.device(dev)?;
        if subdev >= device.info.subdevices {
            return Err(Error::InvalidArgument("subdevice out of range"));
        }
        Ok(())
    }

    // ── Transmit ────────────────────────────────────────────────────

    /// Post one descriptor. While the ring is full, the session lock is
    /// dropped and the ring serviced before retrying.
    pub(crate) fn transmit(
        &self,
        st: &mut MutexGuard<'_, SessionState>,
        dev: DevId,
        ring: RingId,
        desc: &Descriptor<'_>,
    ) -> Result<()> {
        let mut retries = 0u32;
        loop {
            match self.transport.push(dev, ring, desc) {
                Ok(()) => return Ok(()),
                Err(TransportError::RingFull) => {
                    if self.config.ring_full_retries.is_some_and(|max| retries >= max) {
                        tracing::debug!(dev = dev.0, ?ring, retries, "ring full, giving up");
                        return Err(Error::TryAgain);
                    }
                    retries += 1;
                    metrics::RING_FULL_RETRIES.increment();
                    st.stats.ring_full_retries += 1;
                    let serviced = MutexGuard::unlocked(st, || self.service_ring(dev, ring));
                    if serviced == 0 {
                        std::thread::yield_now();
                    }
                    self.device(dev)?;
                }
                Err(e) => {
                    tracing::warn!(dev = dev.0, ?ring, error = %e, "descriptor push failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Take a flow-control credit for `ring`, servicing it while the
    /// completion side is at depth.
    pub(crate) fn acquire_credit(
        &self,
        st: &mut MutexGuard<'_, SessionState>,
        dev: DevId,
        ring: RingId,
    ) -> Result<()> {
        let mut waits = 0u32;
        while !self.credits.try_acquire(dev, ring) {
            if self.config.ring_full_retries.is_some_and(|max| waits >= max) {
                return Err(Error::TryAgain);
            }
            waits += 1;
            metrics::FLOW_CONTROL_WAITS.increment();
            st.stats.flow_control_waits += 1;
            let serviced = MutexGuard::unlocked(st, || self.service_ring(dev, ring));
            if serviced == 0 {
                std::thread::yield_now();
            }
            self.device(dev)?;
        }
        Ok(())
    }
}
