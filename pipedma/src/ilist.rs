//! Instruction-list batch builder.
//!
//! A session composes one batch per device lock state. Each batch holds a
//! chain of buffers per (device, subdevice). Every buffer opens with a
//! destination select, so hardware can execute it without context from the
//! buffer before it. Rules enforced while appending:
//!
//! - a buffer never ends targeting a non-MAU stage; a closing
//!   destination-select-stage back to MAU stage 0 is appended first,
//! - a stage switch on the same destination is preceded by a run of no-ops
//!   that drains the previous station, unless the device is locked,
//! - everything between a lock (or atomic-CSR) begin and its end lands in
//!   one buffer; when a buffer fills mid-bracket, the bracket's bytes are
//!   moved into the next buffer.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::MutexGuard;

use crate::buffer::{BufferType, DmaBuf};
use crate::context::{Device, DmaContext};
use crate::error::{Error, Result};
use crate::instr::{
    self, Bracket, DEST_SELECT_LEN, DEST_SELECT_STAGE_LEN, NOP_LEN, PER_BUFFER_OVERHEAD,
    STAGE_DRAIN_NOPS,
};
use crate::metrics;
use crate::msg_id::{MsgId, OpKind};
use crate::notify::{Deferred, IlCompletion, Notifier, ReadIlEvent};
use crate::ring::{Completion, DescOp, Descriptor, RingFamily, RingId};
use crate::session::{LockState, Route, SessionId, SessionState};
use crate::topology::{DevId, Stage};

type SlotKey = (DevId, u8);

/// Space every append leaves free for the closing stage select.
const CLOSE_RESERVE: u32 = DEST_SELECT_STAGE_LEN;

fn switch_len(drain: bool) -> u32 {
    let nops = if drain { STAGE_DRAIN_NOPS * NOP_LEN } else { 0 };
    nops + DEST_SELECT_STAGE_LEN
}

// ── Composing state ─────────────────────────────────────────────────

/// Buffer chain and builder state for one (device, subdevice).
pub(crate) struct IlSlot {
    bufs: Vec<DmaBuf>,
    stage: Stage,
    mask: u32,
    /// Open lock / atomic-CSR brackets.
    lock_cnt: u32,
    /// Offset in the last buffer where the outermost open bracket starts.
    lock_off: u32,
    lock_stage: Stage,
    instr_count: u32,
}

/// Scalar state of a slot at checkpoint time, plus the image of its last
/// buffer.
#[derive(Clone)]
struct SlotMark {
    chain_len: usize,
    last_image: Vec<u8>,
    stage: Stage,
    mask: u32,
    lock_cnt: u32,
    lock_off: u32,
    lock_stage: Stage,
    instr_count: u32,
}

impl IlSlot {
    fn new() -> Self {
        IlSlot {
            bufs: Vec::new(),
            stage: Stage::Mau(0),
            mask: 0,
            lock_cnt: 0,
            lock_off: 0,
            lock_stage: Stage::Mau(0),
            instr_count: 0,
        }
    }

    fn mark(&self) -> SlotMark {
        SlotMark {
            chain_len: self.bufs.len(),
            last_image: self.bufs.last().map(|b| b.bytes().to_vec()).unwrap_or_default(),
            stage: self.stage,
            mask: self.mask,
            lock_cnt: self.lock_cnt,
            lock_off: self.lock_off,
            lock_stage: self.lock_stage,
            instr_count: self.instr_count,
        }
    }

    /// Return to `mark`, handing back every buffer opened since.
    fn restore(&mut self, mark: &SlotMark) -> Vec<DmaBuf> {
        let keep = mark.chain_len.min(self.bufs.len());
        let extra = self.bufs.split_off(keep);
        if let Some(last) = self.bufs.last_mut() {
            last.restore(&mark.last_image);
        }
        self.stage = mark.stage;
        self.mask = mark.mask;
        self.lock_cnt = mark.lock_cnt;
        self.lock_off = mark.lock_off;
        self.lock_stage = mark.lock_stage;
        self.instr_count = mark.instr_count;
        extra
    }

    fn bracket_bytes(&self) -> u32 {
        match self.bufs.last() {
            Some(last) if self.lock_cnt > 0 => last.used() - self.lock_off,
            _ => 0,
        }
    }

    fn apply(
        &mut self,
        plan: &Plan,
        fresh: Option<DmaBuf>,
        stage: Stage,
        mask: u32,
        instr: &[u8],
        bracket: Option<Bracket>,
    ) {
        if let Some(mut buf) = fresh {
            if plan.carry {
                let carried = match self.bufs.last_mut() {
                    Some(old) => {
                        let carried = old.bytes()[self.lock_off as usize..].to_vec();
                        old.truncate(self.lock_off);
                        if !self.lock_stage.is_mau() {
                            old.append(&instr::dest_select_stage(Stage::Mau(0)));
                        }
                        carried
                    }
                    None => Vec::new(),
                };
                buf.append(&instr::dest_select(mask, self.lock_stage));
                self.lock_off = buf.used();
                buf.append(&carried);
            } else {
                if let Some(old) = self.bufs.last_mut() {
                    if !self.stage.is_mau() {
                        old.append(&instr::dest_select_stage(Stage::Mau(0)));
                    }
                }
                buf.append(&instr::dest_select(mask, stage));
                self.stage = stage;
            }
            self.mask = mask;
            self.bufs.push(buf);
        }

        let Some(cur) = self.bufs.last_mut() else {
            debug_assert!(false, "append without an open buffer");
            return;
        };
        if plan.switch {
            if plan.drain {
                for _ in 0..STAGE_DRAIN_NOPS {
                    cur.append(&instr::nop());
                }
            }
            cur.append(&instr::dest_select_stage(stage));
            self.stage = stage;
        }
        let at = cur.used();
        let fitted = cur.append(instr);
        debug_assert!(fitted, "planned append overflowed");

        match bracket {
            Some(b) if b.opens() => {
                if self.lock_cnt == 0 {
                    self.lock_off = at;
                    self.lock_stage = stage;
                }
                self.lock_cnt += 1;
            }
            Some(_) => self.lock_cnt = self.lock_cnt.saturating_sub(1),
            None => {}
        }
        self.instr_count += 1;
    }
}

/// How the next instruction is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    /// A new buffer must be opened first.
    fresh: bool,
    /// The open bracket moves into the new buffer.
    carry: bool,
    /// Emit a stage switch before the instruction.
    switch: bool,
    drain: bool,
}

fn plan(
    slot: Option<&IlSlot>,
    size: u32,
    drain: bool,
    stage: Stage,
    mask: u32,
    len: u32,
    bracket: Option<Bracket>,
) -> Result<Plan> {
    let closes = matches!(bracket, Some(b) if !b.opens());
    let alone = DEST_SELECT_LEN + len + CLOSE_RESERVE;
    let fresh = Plan {
        fresh: true,
        carry: false,
        switch: false,
        drain,
    };

    let Some((slot, last)) = slot.and_then(|s| s.bufs.last().map(|b| (s, b))) else {
        if closes {
            return Err(Error::InvalidArgument("bracket end without begin"));
        }
        if alone > size {
            return Err(Error::InvalidArgument("instruction larger than a buffer"));
        }
        return Ok(fresh);
    };
    if closes && slot.lock_cnt == 0 {
        return Err(Error::InvalidArgument("bracket end without begin"));
    }
    let in_bracket = slot.lock_cnt > 0;

    if slot.mask != mask {
        if in_bracket {
            return Err(Error::InvalidArgument(
                "destination change inside atomic bracket",
            ));
        }
        if alone > size {
            return Err(Error::InvalidArgument("instruction larger than a buffer"));
        }
        return Ok(fresh);
    }

    let switch = slot.stage != stage;
    let prefix = if switch { switch_len(drain) } else { 0 };
    if CLOSE_RESERVE + last.used() + prefix + len <= size {
        return Ok(Plan {
            fresh: false,
            carry: false,
            switch,
            drain,
        });
    }

    if in_bracket {
        let carried = last.used() - slot.lock_off;
        if DEST_SELECT_LEN + carried + prefix + len + CLOSE_RESERVE > size {
            return Err(Error::InvalidArgument("atomic bracket exceeds buffer"));
        }
        return Ok(Plan {
            fresh: true,
            carry: true,
            switch,
            drain,
        });
    }
    if alone > size {
        return Err(Error::InvalidArgument("instruction larger than a buffer"));
    }
    Ok(fresh)
}

/// A batch being composed by one session.
#[derive(Default)]
pub(crate) struct IlBatch {
    slots: BTreeMap<SlotKey, IlSlot>,
    checkpoint: Option<BTreeMap<SlotKey, SlotMark>>,
    /// Pushed-batch entry holding buffers transmitted early to relieve
    /// pool pressure.
    partial: Option<usize>,
}

impl IlBatch {
    pub fn touches(&self, dev: DevId) -> bool {
        self.slots.keys().any(|(d, _)| *d == dev)
    }

    fn open_bracket(&self) -> bool {
        self.slots.values().any(|s| s.lock_cnt > 0)
    }

    pub fn buffer_count(&self, dev: DevId) -> usize {
        self.slots
            .iter()
            .filter(|((d, _), _)| *d == dev)
            .map(|(_, s)| s.bufs.len())
            .sum()
    }

    /// Drop `dev`'s slice, returning its buffers. Other slots and their
    /// checkpoints are untouched.
    pub fn detach_device(&mut self, dev: DevId) -> Vec<DmaBuf> {
        let keys: Vec<SlotKey> = self
            .slots
            .keys()
            .filter(|(d, _)| *d == dev)
            .copied()
            .collect();
        let mut freed = Vec::new();
        for key in keys {
            if let Some(slot) = self.slots.remove(&key) {
                freed.extend(slot.bufs);
            }
            if let Some(marks) = self.checkpoint.as_mut() {
                marks.remove(&key);
            }
        }
        freed
    }

    /// Split off `dev`'s chains, with their checkpoint marks, as a batch of
    /// their own.
    pub fn take_device(&mut self, dev: DevId) -> IlBatch {
        let keys: Vec<SlotKey> = self
            .slots
            .keys()
            .filter(|(d, _)| *d == dev)
            .copied()
            .collect();
        let mut out = IlBatch::default();
        for key in keys {
            if let Some(slot) = self.slots.remove(&key) {
                out.slots.insert(key, slot);
            }
            if let Some(mark) = self.checkpoint.as_mut().and_then(|m| m.remove(&key)) {
                out.checkpoint.get_or_insert_with(BTreeMap::new).insert(key, mark);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.partial.is_none()
    }

    pub fn open_bracket_on(&self, dev: DevId) -> bool {
        self.slots
            .iter()
            .any(|((d, _), s)| *d == dev && s.lock_cnt > 0)
    }

    fn take_checkpoint(&mut self) {
        self.checkpoint = Some(self.slots.iter().map(|(k, s)| (*k, s.mark())).collect());
    }

    fn rollback(&mut self, marks: BTreeMap<SlotKey, SlotMark>) -> Vec<DmaBuf> {
        let mut freed = Vec::new();
        let keys: Vec<SlotKey> = self.slots.keys().copied().collect();
        for key in keys {
            match marks.get(&key) {
                Some(mark) => {
                    if let Some(slot) = self.slots.get_mut(&key) {
                        freed.extend(slot.restore(mark));
                        if slot.bufs.is_empty() {
                            self.slots.remove(&key);
                        }
                    }
                }
                None => {
                    if let Some(slot) = self.slots.remove(&key) {
                        freed.extend(slot.bufs);
                    }
                }
            }
        }
        freed
    }

    /// Detach buffers that may go to hardware early: all but the open
    /// buffer of each chain, or with a checkpoint, only buffers strictly
    /// before the checkpointed one.
    fn split_prefix(&mut self) -> Vec<(SlotKey, DmaBuf)> {
        let mut out = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            let n = match self.checkpoint.as_mut() {
                None => slot.bufs.len().saturating_sub(1),
                Some(marks) => match marks.get_mut(key) {
                    Some(mark) => {
                        let n = mark.chain_len.saturating_sub(1).min(slot.bufs.len());
                        mark.chain_len -= n;
                        n
                    }
                    None => 0,
                },
            };
            out.extend(slot.bufs.drain(..n).map(|b| (*key, b)));
        }
        out
    }

    /// Close every chain on a MAU stage.
    fn finalize(&mut self) {
        for slot in self.slots.values_mut() {
            if slot.stage.is_mau() {
                continue;
            }
            if let Some(last) = slot.bufs.last_mut() {
                let fitted = last.append(&instr::dest_select_stage(Stage::Mau(0)));
                debug_assert!(fitted, "no room for closing stage select");
                slot.stage = Stage::Mau(0);
            }
        }
    }

    fn into_parts(self) -> (Vec<(SlotKey, Vec<DmaBuf>)>, Option<usize>) {
        let chains = self.slots.into_iter().map(|(k, s)| (k, s.bufs)).collect();
        (chains, self.partial)
    }
}

// ── Pushed state ────────────────────────────────────────────────────

pub(crate) struct InFlightIl {
    buf: DmaBuf,
    ring: RingId,
}

/// A batch handed to hardware, waiting for its buffers to complete.
#[derive(Default)]
pub(crate) struct PushedBatch {
    inflight: HashMap<MsgId, InFlightIl>,
    /// No more buffers will be added.
    pub sealed: bool,
    error: bool,
    sent: u32,
    notify: Option<Notifier<IlCompletion>>,
}

impl PushedBatch {
    pub fn is_drained(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn in_flight_on(&self, dev: DevId) -> usize {
        self.inflight
            .values()
            .filter(|f| f.buf.key().dev == dev)
            .count()
    }

    /// Drop `dev`'s buffers from the batch. A batch that loses buffers
    /// reports an error and counts only the buffers that still complete.
    pub fn detach_device(&mut self, dev: DevId) -> Vec<(MsgId, DmaBuf)> {
        let ids: Vec<MsgId> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.buf.key().dev == dev)
            .map(|(id, _)| *id)
            .collect();
        let lost: Vec<(MsgId, DmaBuf)> = ids
            .into_iter()
            .filter_map(|id| self.inflight.remove(&id).map(|f| (id, f.buf)))
            .collect();
        if !lost.is_empty() {
            self.error = true;
            self.sent = self.sent.saturating_sub(lost.len() as u32);
        }
        lost
    }
}

/// A read instruction list in flight.
pub(crate) struct ReadIlOp {
    pub buf: DmaBuf,
    ring: RingId,
    result_len: u32,
    notify: Notifier<ReadIlEvent>,
}

impl ReadIlOp {
    /// Fail the read without a result, handing back its buffer.
    pub fn abandon(self, deferred: &mut Deferred) -> DmaBuf {
        deferred.push(
            self.notify,
            ReadIlEvent {
                error: true,
                data: Bytes::new(),
            },
        );
        self.buf
    }
}

/// Snapshot of one composing chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChain {
    pub dev: DevId,
    pub subdev: u8,
    /// Composed while the device was locked for reconfiguration.
    pub locked: bool,
    /// Written bytes of each buffer, in chain order.
    pub buffers: Vec<Vec<u8>>,
    pub instr_count: u32,
    /// Open lock / atomic-CSR brackets.
    pub lock_depth: u32,
}

// ── Builder operations ──────────────────────────────────────────────

impl DmaContext {
    /// Append one instruction for `pipe_mask` (logical pipes, all on
    /// `subdev`) at `stage` to the session's pending batch.
    pub fn il_add(
        &self,
        sess: SessionId,
        dev: DevId,
        subdev: u8,
        stage: Stage,
        pipe_mask: u32,
        instr: &[u8],
    ) -> Result<()> {
        if instr.is_empty() || instr.len() % 4 != 0 {
            return Err(Error::InvalidArgument("instruction must be whole words"));
        }
        let device = self.device(dev)?;
        let size = device.pool(subdev, BufferType::InstrList)?.lock().buf_size();
        device.info.check_stage(stage)?;
        let mask = local_mask(&device, subdev, pipe_mask)?;
        let bracket = instr::bracket_marker(instr);
        let len = instr.len() as u32;
        let key = (dev, subdev);

        let plan_for = |st: &SessionState| -> Result<(LockState, Plan)> {
            if !device.is_active() {
                return Err(Error::InvalidArgument("device not active"));
            }
            let lock = device.lock_state();
            let drain = self.config.stage_drain_nops && lock == LockState::Unlocked;
            let slot = st.composing[lock.index()]
                .as_ref()
                .and_then(|b| b.slots.get(&key));
            Ok((lock, plan(slot, size, drain, stage, mask, len, bracket)?))
        };

        let mut st = self.sessions.lock(sess)?;
        let (_, first) = plan_for(&*st)?;
        let mut fresh = None;
        if first.fresh {
            fresh = Some(self.alloc_locked(&mut st, dev, subdev, 0, BufferType::InstrList, true)?);
        }
        // Allocation may have released the lock; plan again on current state.
        let (lock, plan) = match plan_for(&*st) {
            Ok(p) => p,
            Err(e) => {
                self.release_all(fresh);
                return Err(e);
            }
        };
        if !plan.fresh {
            self.release_all(fresh.take());
        } else if fresh.is_none() {
            return Err(Error::Unexpected("builder state changed during append"));
        }

        st.composing[lock.index()]
            .get_or_insert_with(IlBatch::default)
            .slots
            .entry(key)
            .or_insert_with(IlSlot::new)
            .apply(&plan, fresh, stage, mask, instr, bracket);
        Ok(())
    }

    /// Bytes that may still be appended under the open bracket (or a bracket
    /// opened next) without overflowing a fresh buffer.
    pub fn locked_size_remaining(&self, sess: SessionId, dev: DevId, subdev: u8) -> Result<u32> {
        let device = self.device(dev)?;
        let size = device.pool(subdev, BufferType::InstrList)?.lock().buf_size();
        let st = self.sessions.lock(sess)?;
        let held = st.composing[device.lock_state().index()]
            .as_ref()
            .and_then(|b| b.slots.get(&(dev, subdev)))
            .map_or(0, IlSlot::bracket_bytes);
        Ok(size.saturating_sub(PER_BUFFER_OVERHEAD + CLOSE_RESERVE + held))
    }

    /// Snapshot the pending batches so a later [`il_rollback`] can restore
    /// them. Replaces any earlier checkpoint.
    ///
    /// [`il_rollback`]: DmaContext::il_rollback
    pub fn il_checkpoint(&self, sess: SessionId) -> Result<()> {
        let mut st = self.sessions.lock(sess)?;
        for lock in LockState::ALL {
            st.composing[lock.index()]
                .get_or_insert_with(IlBatch::default)
                .take_checkpoint();
        }
        Ok(())
    }

    /// Restore the pending batches to the last checkpoint, freeing every
    /// buffer opened since. Without a checkpoint this is [`il_abort`].
    ///
    /// [`il_abort`]: DmaContext::il_abort
    pub fn il_rollback(&self, sess: SessionId) -> Result<()> {
        let mut st = self.sessions.lock(sess)?;
        let mut deferred = Deferred::default();
        let mut freed = Vec::new();
        for lock in LockState::ALL {
            let idx = lock.index();
            let marks = match st.composing[idx].as_mut() {
                Some(batch) => batch.checkpoint.take(),
                None => continue,
            };
            match marks {
                Some(marks) => {
                    if let Some(batch) = st.composing[idx].as_mut() {
                        freed.extend(batch.rollback(marks));
                    }
                }
                None => {
                    if let Some(batch) = st.composing[idx].take() {
                        self.discard_batch(&mut st, batch, &mut deferred);
                    }
                }
            }
        }
        self.release_all(freed);
        drop(st);
        deferred.run();
        Ok(())
    }

    /// Free the pending batches unsent.
    pub fn il_abort(&self, sess: SessionId) -> Result<()> {
        let mut st = self.sessions.lock(sess)?;
        let mut deferred = Deferred::default();
        for lock in LockState::ALL {
            if let Some(batch) = st.composing[lock.index()].take() {
                self.discard_batch(&mut st, batch, &mut deferred);
            }
        }
        drop(st);
        deferred.run();
        Ok(())
    }

    /// Transmit the pending batch. `notify` fires once every buffer of the
    /// batch has completed, or right away when the batch is empty.
    pub fn il_push(&self, sess: SessionId, notify: Option<Notifier<IlCompletion>>) -> Result<()> {
        let mut st = self.sessions.lock(sess)?;
        let mut deferred = Deferred::default();
        let res = self.push_composing(&mut st, LockState::Unlocked, notify, &mut deferred);
        drop(st);
        deferred.run();
        res
    }

    /// Current composing chains of a session.
    pub fn il_pending(&self, sess: SessionId) -> Result<Vec<PendingChain>> {
        let st = self.sessions.lock(sess)?;
        let mut out = Vec::new();
        for lock in LockState::ALL {
            let Some(batch) = st.composing[lock.index()].as_ref() else {
                continue;
            };
            for ((dev, subdev), slot) in &batch.slots {
                out.push(PendingChain {
                    dev: *dev,
                    subdev: *subdev,
                    locked: lock == LockState::Locked,
                    buffers: slot.bufs.iter().map(|b| b.bytes().to_vec()).collect(),
                    instr_count: slot.instr_count,
                    lock_depth: slot.lock_cnt,
                });
            }
        }
        Ok(out)
    }

    /// Compose and transmit a single-buffer instruction list whose
    /// completion returns `result_len` bytes of read data.
    #[allow(clippy::too_many_arguments)]
    pub fn il_read(
        &self,
        sess: SessionId,
        dev: DevId,
        subdev: u8,
        stage: Stage,
        pipe_mask: u32,
        instrs: &[u8],
        result_len: u32,
        notify: Notifier<ReadIlEvent>,
    ) -> Result<()> {
        if instrs.is_empty() || instrs.len() % 4 != 0 {
            return Err(Error::InvalidArgument("instruction must be whole words"));
        }
        let device = self.device(dev)?;
        let size = device.pool(subdev, BufferType::InstrList)?.lock().buf_size();
        device.info.check_stage(stage)?;
        let mask = local_mask(&device, subdev, pipe_mask)?;
        let close = if stage.is_mau() { 0 } else { DEST_SELECT_STAGE_LEN };
        if DEST_SELECT_LEN + instrs.len() as u32 + close > size || result_len > size {
            return Err(Error::InvalidArgument("read list larger than a buffer"));
        }

        let mut st = self.sessions.lock(sess)?;
        let mut buf = self.alloc_locked(&mut st, dev, subdev, 0, BufferType::InstrList, true)?;
        buf.append(&instr::dest_select(mask, stage));
        buf.append(instrs);
        if close != 0 {
            buf.append(&instr::dest_select_stage(Stage::Mau(0)));
        }

        let ring = self.il_ring(st.id, subdev);
        if let Err(e) = self.acquire_credit(&mut st, dev, ring) {
            self.release_all([buf]);
            return Err(e);
        }
        let id = st.next_msg_id(OpKind::ReadInstrList, dev);
        buf.msg_id = Some(id);
        let desc = Descriptor {
            msg_id: id,
            addr: buf.device_addr(),
            data: buf.bytes(),
            op: DescOp::ReadInstrList { result_len },
        };
        if let Err(e) = self.transmit(&mut st, dev, ring, &desc) {
            self.credits.release(dev, ring);
            self.release_all([buf]);
            return Err(e);
        }
        device.inc_in_flight();
        let op = st.read_ils.insert(ReadIlOp {
            buf,
            ring,
            result_len,
            notify,
        });
        st.routes.insert(id, Route::ReadIl(op));
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn il_ring(&self, sess: SessionId, subdev: u8) -> RingId {
        let index = (sess.0 as u32 % self.config.il_rings as u32) as u8;
        RingId::new(RingFamily::InstrList, subdev, index)
    }

    /// Push the composing batch for `lock`. An open bracket leaves the batch
    /// in place.
    pub(crate) fn push_composing(
        &self,
        st: &mut MutexGuard<'_, SessionState>,
        lock: LockState,
        notify: Option<Notifier<IlCompletion>>,
        deferred: &mut Deferred,
    ) -> Result<()> {
        let idx = lock.index();
        let Some(batch) = st.composing[idx].take() else {
            if let Some(n) = notify {
                let event = IlCompletion {
                    session: st.id,
                    buffers: 0,
                    error: false,
                };
                deferred.push(n, event);
            }
            return Ok(());
        };
        if batch.open_bracket() {
            st.composing[idx] = Some(batch);
            return Err(Error::InvalidArgument("atomic bracket still open"));
        }
        self.push_batch(st, batch, notify, deferred)
    }

    pub(crate) fn push_batch(
        &self,
        st: &mut MutexGuard<'_, SessionState>,
        mut batch: IlBatch,
        notify: Option<Notifier<IlCompletion>>,
        deferred: &mut Deferred,
    ) -> Result<()> {
        batch.finalize();
        let (chains, partial) = batch.into_parts();
        let entry = match partial {
            Some(e) => e,
            None => st.pushed.insert(PushedBatch::default()),
        };
        if chains.iter().any(|(_, bufs)| !bufs.is_empty()) {
            st.stats.il_batches_pushed += 1;
        }

        let mut sent = Vec::new();
        let mut pending = chains
            .into_iter()
            .flat_map(|(key, bufs)| bufs.into_iter().map(move |b| (key, b)));
        while let Some(((dev, subdev), buf)) = pending.next() {
            match self.transmit_il(st, entry, dev, subdev, buf) {
                Ok(id) => sent.push(id),
                Err(e) => {
                    self.release_all(pending.map(|(_, b)| b));
                    self.unwind_il(st, entry, &sent);
                    self.seal(st, entry, None, deferred);
                    return Err(e);
                }
            }
        }
        self.seal(st, entry, notify, deferred);
        Ok(())
    }

    /// Relief valve for pool exhaustion: transmit the prefix of the pending
    /// unlocked batch, keeping the open buffers. Returns buffers transmitted.
    pub(crate) fn push_alloc(&self, st: &mut MutexGuard<'_, SessionState>) -> Result<usize> {
        let (entry, early) = {
            let s: &mut SessionState = &mut **st;
            let Some(batch) = s.composing[LockState::Unlocked.index()].as_mut() else {
                return Ok(0);
            };
            let early = batch.split_prefix();
            if early.is_empty() {
                return Ok(0);
            }
            let entry = match batch.partial {
                Some(e) => e,
                None => {
                    let e = s.pushed.insert(PushedBatch::default());
                    batch.partial = Some(e);
                    e
                }
            };
            (entry, early)
        };

        let count = early.len();
        let mut sent = Vec::new();
        let mut pending = early.into_iter();
        while let Some(((dev, subdev), buf)) = pending.next() {
            match self.transmit_il(st, entry, dev, subdev, buf) {
                Ok(id) => sent.push(id),
                Err(e) => {
                    self.release_all(pending.map(|(_, b)| b));
                    self.unwind_il(st, entry, &sent);
                    return Err(e);
                }
            }
        }
        tracing::debug!(session = st.id.0, buffers = count, "pushed batch prefix early");
        Ok(count)
    }

    fn transmit_il(
        &self,
        st: &mut MutexGuard<'_, SessionState>,
        entry: usize,
        dev: DevId,
        subdev: u8,
        mut buf: DmaBuf,
    ) -> Result<MsgId> {
        let device = match self.device(dev) {
            Ok(d) => d,
            Err(e) => {
                self.release_all([buf]);
                return Err(e);
            }
        };
        let ring = self.il_ring(st.id, subdev);
        if let Err(e) = self.acquire_credit(st, dev, ring) {
            self.release_all([buf]);
            return Err(e);
        }
        let id = st.next_msg_id(OpKind::InstrList, dev);
        buf.msg_id = Some(id);
        let desc = Descriptor {
            msg_id: id,
            addr: buf.device_addr(),
            data: buf.bytes(),
            op: DescOp::InstrList { notify: false },
        };
        if let Err(e) = self.transmit(st, dev, ring, &desc) {
            self.credits.release(dev, ring);
            self.release_all([buf]);
            return Err(e);
        }
        device.inc_in_flight();
        metrics::IL_BUFFERS_PUSHED.increment();
        st.stats.il_buffers_pushed += 1;

        let s: &mut SessionState = &mut **st;
        match s.pushed.get_mut(entry) {
            Some(p) => {
                p.sent += 1;
                p.inflight.insert(id, InFlightIl { buf, ring });
                s.routes.insert(id, Route::Il(entry));
                Ok(id)
            }
            None => {
                debug_assert!(false, "unsealed batch {entry} vanished");
                self.credits.release(dev, ring);
                device.dec_in_flight();
                self.release_all([buf]);
                Err(Error::Unexpected("pushed batch vanished"))
            }
        }
    }

    /// Take back buffers transmitted by a push that later failed.
    fn unwind_il(&self, st: &mut SessionState, entry: usize, sent: &[MsgId]) {
        let Some(p) = st.pushed.get_mut(entry) else {
            return;
        };
        let mut bufs = Vec::with_capacity(sent.len());
        for id in sent {
            if let Some(f) = p.inflight.remove(id) {
                p.sent -= 1;
                self.credits.release(f.buf.key().dev, f.ring);
                bufs.push(f.buf);
            }
        }
        for id in sent {
            st.routes.remove(id);
        }
        for buf in &bufs {
            if let Some(device) = self.device_any(buf.key().dev) {
                device.dec_in_flight();
            }
        }
        if !bufs.is_empty() {
            tracing::warn!(
                session = st.id.0,
                buffers = bufs.len(),
                "unwound partially transmitted batch"
            );
        }
        self.release_all(bufs);
    }

    /// Mark a pushed entry complete for submission; finishes it if nothing
    /// is left in flight.
    fn seal(
        &self,
        st: &mut SessionState,
        entry: usize,
        notify: Option<Notifier<IlCompletion>>,
        deferred: &mut Deferred,
    ) {
        let Some(p) = st.pushed.get_mut(entry) else {
            return;
        };
        p.sealed = true;
        p.notify = notify;
        if p.is_drained() {
            self.finish_pushed(st, entry, deferred);
        }
    }

    pub(crate) fn finish_pushed(&self, st: &mut SessionState, entry: usize, deferred: &mut Deferred) {
        let Some(p) = st.pushed.try_remove(entry) else {
            return;
        };
        if p.sent > 0 {
            st.stats.il_completions += 1;
        }
        if let Some(n) = p.notify {
            let event = IlCompletion {
                session: st.id,
                buffers: p.sent,
                error: p.error,
            };
            deferred.push(n, event);
        }
    }

    pub(crate) fn discard_batch(
        &self,
        st: &mut SessionState,
        batch: IlBatch,
        deferred: &mut Deferred,
    ) {
        let (chains, partial) = batch.into_parts();
        self.release_all(chains.into_iter().flat_map(|(_, bufs)| bufs));
        if let Some(entry) = partial {
            self.seal(st, entry, None, deferred);
        }
    }

    // ── Completions ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn complete_il(
        &self,
        st: &mut SessionState,
        device: &Device,
        id: MsgId,
        entry: usize,
        ring: RingId,
        error: bool,
        deferred: &mut Deferred,
    ) -> Result<(), &'static str> {
        let p = st.pushed.get_mut(entry).ok_or("batch not pending")?;
        match p.inflight.get(&id) {
            None => return Err("buffer not in flight"),
            Some(f) if f.ring != ring => return Err("completion on unexpected ring"),
            Some(_) => {}
        }
        let f = p.inflight.remove(&id).ok_or("buffer not in flight")?;
        p.error |= error;
        let done = p.sealed && p.is_drained();

        st.routes.remove(&id);
        if error {
            st.stats.il_errors += 1;
        }
        self.credits.release(device.id, ring);
        device.dec_in_flight();
        self.release_all([f.buf]);
        if done {
            self.finish_pushed(st, entry, deferred);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn complete_read_il(
        &self,
        st: &mut SessionState,
        device: &Device,
        id: MsgId,
        op: usize,
        ring: RingId,
        completion: Completion,
        deferred: &mut Deferred,
    ) -> Result<(), &'static str> {
        match st.read_ils.get(op) {
            None => return Err("read list not pending"),
            Some(o) if o.ring != ring => return Err("completion on unexpected ring"),
            Some(_) => {}
        }
        let mut o = st.read_ils.remove(op);
        st.routes.remove(&id);

        let len = o.result_len as usize;
        if let Some(data) = &completion.data {
            let n = data.len().min(len);
            o.buf.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        }
        o.buf.set_used(o.result_len);
        let data = Bytes::copy_from_slice(o.buf.bytes());
        if completion.error {
            st.stats.il_errors += 1;
        }
        self.credits.release(device.id, ring);
        device.dec_in_flight();
        self.release_all([o.buf]);
        deferred.push(
            o.notify,
            ReadIlEvent {
                error: completion.error,
                data,
            },
        );
        Ok(())
    }
}

/// Translate a logical pipe mask into the pipe bits local to `subdev`.
fn local_mask(device: &Device, subdev: u8, logical: u32) -> Result<u32> {
    let phys = device.info.physical_mask(logical)? as u64;
    let pps = device.info.pipes_per_subdevice as u64;
    let shift = subdev as u64 * pps;
    let own = ((1u64 << pps) - 1) << shift;
    if phys & !own != 0 {
        return Err(Error::InvalidArgument("pipe mask spans subdevices"));
    }
    Ok((phys >> shift) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::Decoded;
    use crate::loopback::Loopback;
    use crate::topology::{DeviceInfo, Family};
    use std::sync::Arc;

    const WORD: [u8; 4] = [0x01, 0x00, 0x00, 0x60];

    fn setup(il_size: u32) -> (DmaContext, SessionId) {
        let config = crate::ConfigBuilder::new()
            .il_pool(8, il_size)
            .build()
            .unwrap();
        let ctx = DmaContext::new(config, Arc::new(Loopback::new(16))).unwrap();
        ctx.add_device(DevId(0), DeviceInfo::simple(Family::Gen2, 4, 12))
            .unwrap();
        let sess = ctx.open_session().unwrap();
        (ctx, sess)
    }

    fn chain(ctx: &DmaContext, sess: SessionId) -> Vec<Vec<u8>> {
        ctx.il_pending(sess)
            .unwrap()
            .into_iter()
            .next()
            .map(|c| c.buffers)
            .unwrap_or_default()
    }

    #[test]
    fn first_append_opens_with_dest_select() {
        let (ctx, sess) = setup(512);
        ctx.il_add(sess, DevId(0), 0, Stage::Mau(2), 0b11, &WORD)
            .unwrap();
        let bufs = chain(&ctx, sess);
        assert_eq!(bufs.len(), 1);
        assert_eq!(
            instr::decode(&bufs[0])[0],
            Decoded::DestSelect {
                pipe_mask: 0b11,
                stage: Stage::Mau(2)
            }
        );
        ctx.il_abort(sess).unwrap();
    }

    #[test]
    fn stage_switch_drains_then_selects() {
        let (ctx, sess) = setup(512);
        ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0b1, &WORD)
            .unwrap();
        ctx.il_add(sess, DevId(0), 0, Stage::Mau(1), 0b1, &WORD)
            .unwrap();
        let ops = instr::decode(&chain(&ctx, sess)[0]);
        let nops = ops.iter().filter(|d| **d == Decoded::Nop).count();
        assert_eq!(nops, STAGE_DRAIN_NOPS as usize);
        assert_eq!(ops[ops.len() - 2], Decoded::DestSelectStage(Stage::Mau(1)));
        ctx.il_abort(sess).unwrap();
    }

    #[test]
    fn locked_device_skips_drain() {
        let (ctx, sess) = setup(512);
        ctx.lock_device(DevId(0)).unwrap();
        ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0b1, &WORD)
            .unwrap();
        ctx.il_add(sess, DevId(0), 0, Stage::Mau(1), 0b1, &WORD)
            .unwrap();
        let pending = ctx.il_pending(sess).unwrap();
        assert!(pending[0].locked);
        assert!(!instr::decode(&pending[0].buffers[0]).contains(&Decoded::Nop));
        ctx.il_abort(sess).unwrap();
    }

    #[test]
    fn mask_change_opens_new_buffer() {
        let (ctx, sess) = setup(512);
        ctx.il_add(sess, DevId(0), 0, Stage::Parde, 0b1, &WORD)
            .unwrap();
        ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0b10, &WORD)
            .unwrap();
        let bufs = chain(&ctx, sess);
        assert_eq!(bufs.len(), 2);
        // The first buffer ended on a parde stage and was closed.
        assert_eq!(
            *instr::decode(&bufs[0]).last().unwrap(),
            Decoded::DestSelectStage(Stage::Mau(0))
        );
        ctx.il_abort(sess).unwrap();
    }

    #[test]
    fn mask_change_inside_bracket_rejected() {
        let (ctx, sess) = setup(512);
        ctx.il_add(
            sess,
            DevId(0),
            0,
            Stage::Mau(0),
            0b1,
            &instr::marker(Bracket::LockBegin),
        )
        .unwrap();
        let before = ctx.il_pending(sess).unwrap();
        assert!(matches!(
            ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0b10, &WORD),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(ctx.il_pending(sess).unwrap(), before);
        assert!(matches!(
            ctx.il_push(sess, None),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(ctx.il_pending(sess).unwrap(), before);
        ctx.il_abort(sess).unwrap();
    }

    #[test]
    fn unbalanced_end_rejected() {
        let (ctx, sess) = setup(512);
        assert!(
            ctx.il_add(
                sess,
                DevId(0),
                0,
                Stage::Mau(0),
                0b1,
                &instr::marker(Bracket::LockEnd)
            )
            .is_err()
        );
        assert!(ctx.il_pending(sess).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_arguments() {
        let (ctx, sess) = setup(512);
        assert!(ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0b1, &[1, 2]).is_err());
        assert!(ctx.il_add(sess, DevId(0), 0, Stage::Mau(12), 0b1, &WORD).is_err());
        assert!(ctx.il_add(sess, DevId(0), 1, Stage::Mau(0), 0b1, &WORD).is_err());
        assert!(ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0, &WORD).is_err());
        assert!(ctx.il_add(sess, DevId(1), 0, Stage::Mau(0), 0b1, &WORD).is_err());
        assert!(
            ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0b1, &[0u8; 512])
                .is_err()
        );
    }

    #[test]
    fn remaining_shrinks_inside_bracket() {
        let (ctx, sess) = setup(512);
        let free = ctx.locked_size_remaining(sess, DevId(0), 0).unwrap();
        assert_eq!(free, 512 - PER_BUFFER_OVERHEAD - CLOSE_RESERVE);
        ctx.il_add(
            sess,
            DevId(0),
            0,
            Stage::Mau(0),
            0b1,
            &instr::marker(Bracket::AtomicCsrBegin),
        )
        .unwrap();
        ctx.il_add(sess, DevId(0), 0, Stage::Mau(0), 0b1, &WORD)
            .unwrap();
        assert_eq!(
            ctx.locked_size_remaining(sess, DevId(0), 0).unwrap(),
            free - 8
        );
        ctx.il_abort(sess).unwrap();
    }

    #[test]
    fn local_mask_per_subdevice() {
        let info = DeviceInfo {
            family: Family::Gen3,
            subdevices: 2,
            pipes_per_subdevice: 4,
            stages: 20,
            logical_to_physical: (0..8).collect(),
        };
        let config = crate::ConfigBuilder::new().build().unwrap();
        let ctx = DmaContext::new(config, Arc::new(Loopback::new(4))).unwrap();
        ctx.add_device(DevId(0), info).unwrap();
        let d = ctx.device(DevId(0)).unwrap();
        assert_eq!(local_mask(&d, 1, 0b0011_0000).unwrap(), 0b0011);
        assert_eq!(local_mask(&d, 0, 0b0000_0101).unwrap(), 0b0101);
        assert!(local_mask(&d, 0, 0b0001_0001).is_err());
    }
}
