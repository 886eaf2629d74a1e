//! Per-caller session state.
//!
//! A session owns everything a caller has in progress: composing
//! instruction-list batches, pushed batches awaiting completion and pending
//! block transfers. One mutex per session serializes the caller against
//! the completion path, so no chain is ever observed half built.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use slab::Slab;

use crate::block::{ReadOp, WriteOp};
use crate::context::DmaContext;
use crate::error::{Error, Result};
use crate::ilist::{IlBatch, PushedBatch, ReadIlOp};
use crate::msg_id::{MsgId, OpKind};
use crate::notify::Deferred;
use crate::topology::DevId;

/// Index into the fixed session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u16);

/// Which composing batch an instruction lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    Unlocked,
    /// The target device is locked for reconfiguration. These batches are
    /// pushed by `unlock_device`.
    Locked,
}

impl LockState {
    pub const ALL: [LockState; 2] = [LockState::Unlocked, LockState::Locked];

    pub fn index(self) -> usize {
        match self {
            LockState::Unlocked => 0,
            LockState::Locked => 1,
        }
    }
}

/// Debug counters kept per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub il_batches_pushed: u64,
    pub il_buffers_pushed: u64,
    pub il_completions: u64,
    pub il_errors: u64,
    pub read_block_ops: u64,
    pub read_block_errors: u64,
    pub write_block_ops: u64,
    pub write_block_errors: u64,
    pub pool_exhausted: u64,
    pub ring_full_retries: u64,
    pub flow_control_waits: u64,
    /// Completions whose message id no longer matched a pending operation.
    pub stale_completions: u64,
}

/// Where a completion for a given message id goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Il(usize),
    ReadIl(usize),
    ReadBlock { op: usize, sub: u32 },
    WriteBlock(usize),
}

pub(crate) struct SessionState {
    pub id: SessionId,
    pub open: bool,
    seq: u32,
    /// Indexed by [`LockState::index`].
    pub composing: [Option<IlBatch>; 2],
    pub pushed: Slab<PushedBatch>,
    pub read_ops: Slab<ReadOp>,
    pub write_ops: Slab<WriteOp>,
    pub read_ils: Slab<ReadIlOp>,
    pub routes: HashMap<MsgId, Route>,
    pub stats: SessionStats,
}

impl SessionState {
    fn new(id: SessionId) -> Self {
        SessionState {
            id,
            open: false,
            seq: 0,
            composing: [None, None],
            pushed: Slab::new(),
            read_ops: Slab::new(),
            write_ops: Slab::new(),
            read_ils: Slab::new(),
            routes: HashMap::new(),
            stats: SessionStats::default(),
        }
    }

    /// Next message id of this session. Skips ids still awaiting completion
    /// after the sequence counter wraps.
    pub fn next_msg_id(&mut self, kind: OpKind, dev: DevId) -> MsgId {
        loop {
            self.seq = self.seq.wrapping_add(1);
            let id = MsgId::encode(kind, self.id.0, dev, self.seq);
            if !self.routes.contains_key(&id) {
                return id;
            }
        }
    }

    /// Operations submitted to hardware and not yet completed.
    pub fn busy(&self) -> bool {
        !self.pushed.is_empty()
            || !self.read_ops.is_empty()
            || !self.write_ops.is_empty()
            || !self.read_ils.is_empty()
    }
}

/// Fixed table of sessions, one mutex each.
pub(crate) struct SessionTable {
    slots: Box<[Mutex<SessionState>]>,
}

impl SessionTable {
    pub fn new(max_sessions: u32) -> Self {
        let slots = (0..max_sessions)
            .map(|i| Mutex::new(SessionState::new(SessionId(i as u16))))
            .collect();
        SessionTable { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Lock an open session.
    pub fn lock(&self, sess: SessionId) -> Result<MutexGuard<'_, SessionState>> {
        let slot = self
            .get(sess.0)
            .ok_or(Error::InvalidArgument("session id out of range"))?;
        let st = slot.lock();
        if !st.open {
            return Err(Error::InvalidArgument("session not open"));
        }
        Ok(st)
    }

    /// Raw slot access, open or not.
    pub fn get(&self, idx: u16) -> Option<&Mutex<SessionState>> {
        self.slots.get(idx as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutex<SessionState>> {
        self.slots.iter()
    }
}

// ── Session lifecycle ───────────────────────────────────────────────

impl DmaContext {
    /// Claim a free slot of the session table.
    pub fn open_session(&self) -> Result<SessionId> {
        for slot in self.sessions.iter() {
            let mut st = slot.lock();
            if !st.open {
                st.open = true;
                st.stats = SessionStats::default();
                tracing::debug!(session = st.id.0, "session opened");
                return Ok(st.id);
            }
        }
        Err(Error::NoResource("session table"))
    }

    /// Release a session. Composing batches are discarded. Fails with
    /// [`Error::TryAgain`] while operations are still in flight.
    pub fn close_session(&self, sess: SessionId) -> Result<()> {
        let mut st = self.sessions.lock(sess)?;
        if st.busy() {
            return Err(Error::TryAgain);
        }
        let mut deferred = Deferred::default();
        for lock in LockState::ALL {
            if let Some(batch) = st.composing[lock.index()].take() {
                self.discard_batch(&mut st, batch, &mut deferred);
            }
        }
        st.routes.clear();
        st.open = false;
        tracing::debug!(session = sess.0, "session closed");
        drop(st);
        deferred.run();
        Ok(())
    }

    /// Snapshot of a session's debug counters.
    pub fn session_stats(&self, sess: SessionId) -> Result<SessionStats> {
        Ok(self.sessions.lock(sess)?.stats)
    }
}
