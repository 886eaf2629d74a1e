//! Read-block and write-block transfers.
//!
//! A read-block is split into sub-transfers of at most one buffer each;
//! each completes independently and the operation leaves the session once
//! all of them have. A write-block fills one buffer and broadcasts it to
//! the write-block ring of every targeted physical pipe; the buffer is
//! freed once every pipe has reported.

use bytes::Bytes;

use crate::buffer::{BufferType, DmaBuf};
use crate::context::{Device, DmaContext};
use crate::error::{Error, Result};
use crate::metrics;
use crate::msg_id::{MsgId, OpKind};
use crate::notify::{Deferred, Notifier, ReadBlockEvent, WriteBlockEvent};
use crate::ring::{Completion, DescOp, Descriptor, RingFamily, RingId};
use crate::session::{Route, SessionId, SessionState};
use crate::topology::DevId;

/// Entry widths the block engines can move.
pub const ENTRY_SIZES: [u8; 3] = [4, 8, 16];

fn check_entry_size(entry_size: u8) -> Result<()> {
    if ENTRY_SIZES.contains(&entry_size) {
        Ok(())
    } else {
        Err(Error::InvalidArgument("entry size must be 4, 8 or 16"))
    }
}

/// Every byte touched by `entries` entries of `entry_size` bytes, `step`
/// apart from `addr`, must be addressable.
fn check_span(addr: u64, entries: u32, step: u32, entry_size: u8) -> Result<()> {
    (entries as u64 - 1)
        .checked_mul(step as u64)
        .and_then(|span| span.checked_add(entry_size as u64 - 1))
        .and_then(|span| addr.checked_add(span))
        .map(|_| ())
        .ok_or(Error::InvalidArgument("block runs past the end of the address space"))
}

/// A read of `entries` entries starting at device address `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlockReq {
    pub subdev: u8,
    pub entry_size: u8,
    pub entries: u32,
    /// Address increment between entries.
    pub step: u32,
    pub addr: u64,
}

/// A broadcast write to every pipe of `pipe_mask` (logical pipes).
///
/// `payload` is either one entry, repeated `entries` times (or sent once
/// with `single`, for the device to replicate), or exactly `entries`
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBlockReq<'a> {
    pub entry_size: u8,
    pub entries: u32,
    pub step: u32,
    pub addr: u64,
    pub pipe_mask: u32,
    pub payload: &'a [u8],
    pub single: bool,
}

pub(crate) struct ReadSub {
    offset: u32,
    count: u32,
    msg_id: Option<MsgId>,
    buf: Option<DmaBuf>,
    done: bool,
}

pub(crate) struct ReadOp {
    pub dev: DevId,
    ring: RingId,
    entry_size: u8,
    subs: Vec<ReadSub>,
    remaining: u32,
    notify: Notifier<ReadBlockEvent>,
}

impl ReadOp {
    /// Sub-transfers submitted and not yet complete.
    pub fn in_flight(&self) -> usize {
        self.subs.iter().filter(|s| s.buf.is_some()).count()
    }

    pub fn into_buffers(self) -> Vec<(MsgId, DmaBuf)> {
        self.subs
            .into_iter()
            .filter_map(|s| Some((s.msg_id?, s.buf?)))
            .collect()
    }

    /// Fail every sub-transfer not yet reported. Returns the submitted
    /// buffers and the number of failures delivered.
    pub fn abandon(self, deferred: &mut Deferred) -> (Vec<(MsgId, DmaBuf)>, u32) {
        let mut failed = 0;
        for s in self.subs.iter().filter(|s| !s.done) {
            failed += 1;
            deferred.push(
                self.notify.clone(),
                ReadBlockEvent {
                    offset: s.offset,
                    count: s.count,
                    error: true,
                    data: Bytes::new(),
                },
            );
        }
        (self.into_buffers(), failed)
    }
}

pub(crate) struct WriteOp {
    pub dev: DevId,
    pub msg_id: MsgId,
    /// `pipe_mask` holds pipes yet to report, `pushed` the pipes written.
    pub buf: DmaBuf,
    /// Still being pushed to its rings; completion must not free it yet.
    submitting: bool,
    error: bool,
    notify: Option<Notifier<WriteBlockEvent>>,
}

impl WriteOp {
    /// Fail the write, handing back its buffer.
    pub fn abandon(self, deferred: &mut Deferred) -> DmaBuf {
        if let Some(n) = self.notify {
            deferred.push(
                n,
                WriteBlockEvent {
                    pipe_mask: self.buf.pushed,
                    error: true,
                },
            );
        }
        self.buf
    }
}

impl DmaContext {
    /// Read a block of entries. `notify` receives one event per
    /// sub-transfer. Returns the number of sub-transfers.
    pub fn read_block(
        &self,
        sess: SessionId,
        dev: DevId,
        req: ReadBlockReq,
        notify: Notifier<ReadBlockEvent>,
    ) -> Result<u32> {
        check_entry_size(req.entry_size)?;
        if req.entries == 0 {
            return Err(Error::InvalidArgument("read of zero entries"));
        }
        let device = self.device(dev)?;
        let size = device
            .pool(req.subdev, BufferType::ReadBlock)?
            .lock()
            .buf_size();
        let per_buf = size / req.entry_size as u32;
        let count = req.entries.div_ceil(per_buf);
        check_span(req.addr, req.entries, req.step, req.entry_size)?;

        let subs = (0..count)
            .map(|i| {
                let offset = i * per_buf;
                ReadSub {
                    offset,
                    count: per_buf.min(req.entries - offset),
                    msg_id: None,
                    buf: None,
                    done: false,
                }
            })
            .collect();

        let ring = RingId::new(RingFamily::ReadBlock, req.subdev, 0);
        let mut st = self.sessions.lock(sess)?;
        let op = st.read_ops.insert(ReadOp {
            dev,
            ring,
            entry_size: req.entry_size,
            subs,
            remaining: count,
            notify,
        });
        st.stats.read_block_ops += 1;

        for i in 0..count {
            let sub = match st.read_ops.get(op) {
                Some(o) => (o.subs[i as usize].offset, o.subs[i as usize].count),
                None => return Err(Error::Unexpected("read op vanished")),
            };
            let (offset, n) = sub;
            let len = n * req.entry_size as u32;
            let mut buf =
                match self.alloc_locked(&mut st, dev, req.subdev, len, BufferType::ReadBlock, true) {
                    Ok(b) => b,
                    Err(e) => {
                        self.unwind_read(&mut st, &device, op);
                        return Err(e);
                    }
                };
            let id = st.next_msg_id(OpKind::ReadBlock, dev);
            buf.msg_id = Some(id);
            let desc = Descriptor {
                msg_id: id,
                addr: buf.device_addr(),
                data: &buf.mem[..len as usize],
                op: DescOp::ReadBlock {
                    src: req.addr + offset as u64 * req.step as u64,
                    entry_size: req.entry_size,
                    entries: n,
                    step: req.step,
                },
            };
            if let Err(e) = self.transmit(&mut st, dev, ring, &desc) {
                self.release_all([buf]);
                self.unwind_read(&mut st, &device, op);
                return Err(e);
            }
            device.inc_in_flight();
            metrics::READ_BLOCK_SUBOPS.increment();

            let s: &mut SessionState = &mut st;
            match s.read_ops.get_mut(op) {
                Some(o) => {
                    let sub = &mut o.subs[i as usize];
                    sub.msg_id = Some(id);
                    sub.buf = Some(buf);
                    s.routes.insert(id, Route::ReadBlock { op, sub: i });
                }
                None => {
                    device.dec_in_flight();
                    self.release_all([buf]);
                    return Err(Error::Unexpected("read op vanished"));
                }
            }
        }
        Ok(count)
    }

    /// Broadcast-write a block to every targeted pipe. `notify` fires once
    /// all of them have acknowledged.
    pub fn write_block(
        &self,
        sess: SessionId,
        dev: DevId,
        req: WriteBlockReq<'_>,
        notify: Option<Notifier<WriteBlockEvent>>,
    ) -> Result<()> {
        check_entry_size(req.entry_size)?;
        if req.entries == 0 {
            return Err(Error::InvalidArgument("write of zero entries"));
        }
        let es = req.entry_size as usize;
        let image_len = if req.single {
            es
        } else {
            es * req.entries as usize
        };
        let repeat = req.payload.len() == es;
        if !repeat && (req.single || req.payload.len() != image_len) {
            return Err(Error::InvalidArgument(
                "payload must be one entry or one per entry",
            ));
        }

        check_span(req.addr, req.entries, req.step, req.entry_size)?;

        let device = self.device(dev)?;
        let phys = device.info.physical_mask(req.pipe_mask)?;
        let (subdev, _) = device.info.locate_pipe(phys.trailing_zeros());
        let size = device.pool(subdev, BufferType::WriteBlock)?.lock().buf_size();
        if image_len > size as usize {
            return Err(Error::InvalidArgument("write block larger than a buffer"));
        }

        let mut st = self.sessions.lock(sess)?;
        let mut buf = self.alloc_locked(
            &mut st,
            dev,
            subdev,
            image_len as u32,
            BufferType::WriteBlock,
            true,
        )?;
        if repeat && !req.single {
            for _ in 0..req.entries {
                buf.append(req.payload);
            }
        } else {
            buf.append(req.payload);
        }
        let id = st.next_msg_id(OpKind::WriteBlock, dev);
        buf.msg_id = Some(id);
        buf.pipe_mask = phys;
        buf.pushed = 0;
        let image = buf.bytes().to_vec();
        let addr = buf.device_addr();

        let op = st.write_ops.insert(WriteOp {
            dev,
            msg_id: id,
            buf,
            submitting: true,
            error: false,
            notify,
        });
        st.routes.insert(id, Route::WriteBlock(op));
        st.stats.write_block_ops += 1;
        metrics::WRITE_BLOCK_OPS.increment();

        for pipe in (0..32).filter(|p| phys & (1 << p) != 0) {
            let ring = device.pipe_ring(pipe);
            let desc = Descriptor {
                msg_id: id,
                addr,
                data: &image,
                op: DescOp::WriteBlock {
                    dst: req.addr,
                    entry_size: req.entry_size,
                    entries: req.entries,
                    step: req.step,
                    single: req.single,
                    pipe_mask: phys,
                },
            };
            if let Err(e) = self.transmit(&mut st, dev, ring, &desc) {
                self.unwind_write(&mut st, &device, op);
                return Err(e);
            }
            device.inc_in_flight();
            match st.write_ops.get_mut(op) {
                Some(o) => o.buf.pushed |= 1 << pipe,
                None => {
                    device.dec_in_flight();
                    return Err(Error::Unexpected("write op vanished"));
                }
            }
        }

        let done = match st.write_ops.get_mut(op) {
            Some(o) => {
                o.submitting = false;
                o.buf.pipe_mask == 0
            }
            None => return Err(Error::Unexpected("write op vanished")),
        };
        let mut deferred = Deferred::default();
        if done {
            self.finish_write(&mut st, op, &mut deferred);
        }
        drop(st);
        deferred.run();
        Ok(())
    }

    fn unwind_read(&self, st: &mut SessionState, device: &Device, op: usize) {
        let Some(o) = st.read_ops.try_remove(op) else {
            return;
        };
        let bufs = o.into_buffers();
        for (id, _) in &bufs {
            st.routes.remove(id);
            device.dec_in_flight();
        }
        self.release_all(bufs.into_iter().map(|(_, b)| b));
    }

    fn unwind_write(&self, st: &mut SessionState, device: &Device, op: usize) {
        let Some(o) = st.write_ops.try_remove(op) else {
            return;
        };
        st.routes.remove(&o.msg_id);
        for _ in 0..(o.buf.pushed & o.buf.pipe_mask).count_ones() {
            device.dec_in_flight();
        }
        self.release_all([o.buf]);
    }

    fn finish_write(&self, st: &mut SessionState, op: usize, deferred: &mut Deferred) {
        let Some(o) = st.write_ops.try_remove(op) else {
            return;
        };
        st.routes.remove(&o.msg_id);
        if o.error {
            st.stats.write_block_errors += 1;
        }
        let event = WriteBlockEvent {
            pipe_mask: o.buf.pushed,
            error: o.error,
        };
        self.release_all([o.buf]);
        if let Some(n) = o.notify {
            deferred.push(n, event);
        }
    }

    // ── Completions ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn complete_read(
        &self,
        st: &mut SessionState,
        device: &Device,
        id: MsgId,
        (op, sub): (usize, u32),
        ring: RingId,
        completion: Completion,
        deferred: &mut Deferred,
    ) -> Result<(), &'static str> {
        let o = st.read_ops.get_mut(op).ok_or("read not pending")?;
        if o.ring != ring {
            return Err("completion on unexpected ring");
        }
        let entry_size = o.entry_size as usize;
        let s = o
            .subs
            .get_mut(sub as usize)
            .ok_or("unknown sub-transfer")?;
        if s.done || s.msg_id != Some(id) {
            return Err("sub-transfer already complete");
        }
        let mut buf = s.buf.take().ok_or("sub-transfer not submitted")?;
        s.done = true;

        let len = s.count as usize * entry_size;
        if let Some(data) = &completion.data {
            let n = data.len().min(len);
            buf.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        }
        buf.set_used(len as u32);
        let event = ReadBlockEvent {
            offset: s.offset,
            count: s.count,
            error: completion.error,
            data: Bytes::copy_from_slice(buf.bytes()),
        };
        o.remaining -= 1;
        let finished = o.remaining == 0;
        let notify = o.notify.clone();

        st.routes.remove(&id);
        if completion.error {
            st.stats.read_block_errors += 1;
        }
        if finished {
            st.read_ops.remove(op);
        }
        device.dec_in_flight();
        self.release_all([buf]);
        deferred.push(notify, event);
        Ok(())
    }

    pub(crate) fn complete_write(
        &self,
        st: &mut SessionState,
        device: &Device,
        op: usize,
        ring: RingId,
        error: bool,
        deferred: &mut Deferred,
    ) -> Result<(), &'static str> {
        let pipe = device.ring_pipe(ring).ok_or("ring outside device")?;
        let bit = 1u32 << pipe;
        let o = st.write_ops.get_mut(op).ok_or("write not pending")?;
        if o.buf.pushed & bit == 0 {
            return Err("pipe was not written");
        }
        if o.buf.pipe_mask & bit == 0 {
            return Err("pipe already reported");
        }
        o.buf.pipe_mask &= !bit;
        o.error |= error;
        let done = o.buf.pipe_mask == 0 && !o.submitting;
        device.dec_in_flight();
        if done {
            self.finish_write(st, op, deferred);
        }
        Ok(())
    }
}
