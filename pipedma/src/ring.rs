use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::msg_id::{MsgId, OpKind};
use crate::topology::DevId;

/// Logical descriptor streams. Each maps to a transmit/completion ring pair
/// per subdevice (and per index for families with several rings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RingFamily {
    InstrList,
    ReadBlock,
    WriteBlock,
    Learn,
    Stat,
    Idle,
}

impl RingFamily {
    /// Whether completions on this family carry message ids of `kind`.
    pub fn accepts(self, kind: OpKind) -> bool {
        matches!(
            (self, kind),
            (RingFamily::InstrList, OpKind::InstrList)
                | (RingFamily::InstrList, OpKind::ReadInstrList)
                | (RingFamily::ReadBlock, OpKind::ReadBlock)
                | (RingFamily::WriteBlock, OpKind::WriteBlock)
        )
    }

    /// Families whose completions are unsolicited notifications rather than
    /// responses to a message id.
    pub fn is_notification(self) -> bool {
        matches!(self, RingFamily::Learn | RingFamily::Stat | RingFamily::Idle)
    }
}

/// A ring pair on one subdevice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RingId {
    pub family: RingFamily,
    pub subdevice: u8,
    pub index: u8,
}

impl RingId {
    pub fn new(family: RingFamily, subdevice: u8, index: u8) -> Self {
        RingId {
            family,
            subdevice,
            index,
        }
    }
}

/// Operation-specific descriptor fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescOp {
    /// Execute the instruction list in the buffer. `notify` asks for a
    /// completion interrupt in addition to the polled completion entry.
    InstrList { notify: bool },
    /// Execute the instruction list and return `result_len` bytes of read data.
    ReadInstrList { result_len: u32 },
    /// Read `entries` entries of `entry_size` bytes starting at device
    /// address `src`, stepping by `step` per entry, into the buffer.
    ReadBlock {
        src: u64,
        entry_size: u8,
        entries: u32,
        step: u32,
    },
    /// Write the buffer to `entries` addresses starting at `dst` on every
    /// physical pipe of `pipe_mask`. With `single`, the buffer holds one entry
    /// the device replicates.
    WriteBlock {
        dst: u64,
        entry_size: u8,
        entries: u32,
        step: u32,
        single: bool,
        pipe_mask: u32,
    },
}

/// One transfer descriptor handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor<'a> {
    pub msg_id: MsgId,
    /// Device-visible buffer address.
    pub addr: u64,
    /// Written portion of the buffer (for device-to-host transfers, the
    /// space the device may fill).
    pub data: &'a [u8],
    pub op: DescOp,
}

/// One entry taken off a completion ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Message id echoed by the device. Zero for notification rings.
    pub msg_id: u64,
    pub error: bool,
    /// Data the device transferred to the host, if any.
    pub data: Option<Bytes>,
}

/// Low-level descriptor-ring transport for one or more devices.
///
/// Implementations must be safe to call concurrently from submitting
/// sessions and the completion dispatcher.
pub trait RingTransport: Send + Sync {
    /// Post a descriptor to the transmit side of `ring` and start its DMA.
    fn push(&self, dev: DevId, ring: RingId, desc: &Descriptor<'_>) -> Result<(), TransportError>;

    /// Drain the completion side of `ring` into `out`.
    fn service(
        &self,
        dev: DevId,
        ring: RingId,
        out: &mut Vec<Completion>,
    ) -> Result<(), TransportError>;

    /// Number of entries the completion side of `ring` can hold.
    fn depth(&self, dev: DevId, ring: RingId) -> u32;

    /// Direct register read, bypassing the rings.
    fn reg_read(&self, dev: DevId, subdev: u8, addr: u32) -> Result<u32, TransportError>;

    /// Direct register write, bypassing the rings.
    fn reg_write(&self, dev: DevId, subdev: u8, addr: u32, value: u32)
    -> Result<(), TransportError>;
}

/// In-flight buffer accounting per completion ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCredit {
    pub in_flight: u32,
    pub depth: u32,
}

/// Process-wide back-pressure counters, one lock for all rings.
pub(crate) struct RingCredits {
    enabled: bool,
    rings: Mutex<HashMap<(DevId, RingId), RingCredit>>,
}

impl RingCredits {
    pub fn new(enabled: bool) -> Self {
        RingCredits {
            enabled,
            rings: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_depth(&self, dev: DevId, ring: RingId, depth: u32) {
        self.rings.lock().entry((dev, ring)).or_default().depth = depth;
    }

    /// Reserve room for one more in-flight buffer. Fails when the
    /// completion ring could overflow.
    pub fn try_acquire(&self, dev: DevId, ring: RingId) -> bool {
        let mut rings = self.rings.lock();
        let credit = rings.entry((dev, ring)).or_default();
        if self.enabled && credit.depth != 0 && credit.in_flight >= credit.depth {
            return false;
        }
        credit.in_flight += 1;
        true
    }

    pub fn release(&self, dev: DevId, ring: RingId) {
        if let Some(credit) = self.rings.lock().get_mut(&(dev, ring)) {
            debug_assert!(credit.in_flight > 0, "credit underflow on {ring:?}");
            credit.in_flight = credit.in_flight.saturating_sub(1);
        }
    }

    pub fn get(&self, dev: DevId, ring: RingId) -> RingCredit {
        self.rings
            .lock()
            .get(&(dev, ring))
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of every ring of `dev`, sorted by ring id.
    pub fn snapshot(&self, dev: DevId) -> Vec<(RingId, RingCredit)> {
        let mut out: Vec<_> = self
            .rings
            .lock()
            .iter()
            .filter(|((d, _), _)| *d == dev)
            .map(|((_, r), c)| (*r, *c))
            .collect();
        out.sort_by_key(|(r, _)| *r);
        out
    }

    pub fn forget(&self, dev: DevId) {
        self.rings.lock().retain(|(d, _), _| *d != dev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn il0() -> RingId {
        RingId::new(RingFamily::InstrList, 0, 0)
    }

    #[test]
    fn family_accepts_matching_kinds() {
        assert!(RingFamily::InstrList.accepts(OpKind::InstrList));
        assert!(RingFamily::InstrList.accepts(OpKind::ReadInstrList));
        assert!(!RingFamily::InstrList.accepts(OpKind::ReadBlock));
        assert!(RingFamily::WriteBlock.accepts(OpKind::WriteBlock));
        assert!(!RingFamily::Learn.accepts(OpKind::WriteBlock));
        assert!(RingFamily::Idle.is_notification());
    }

    #[test]
    fn credits_bound_in_flight() {
        let credits = RingCredits::new(true);
        credits.set_depth(DevId(0), il0(), 2);
        assert!(credits.try_acquire(DevId(0), il0()));
        assert!(credits.try_acquire(DevId(0), il0()));
        assert!(!credits.try_acquire(DevId(0), il0()));
        credits.release(DevId(0), il0());
        assert!(credits.try_acquire(DevId(0), il0()));
        assert_eq!(credits.get(DevId(0), il0()).in_flight, 2);
    }

    #[test]
    fn disabled_credits_only_count() {
        let credits = RingCredits::new(false);
        credits.set_depth(DevId(1), il0(), 1);
        assert!(credits.try_acquire(DevId(1), il0()));
        assert!(credits.try_acquire(DevId(1), il0()));
        assert_eq!(credits.snapshot(DevId(1)).len(), 1);
        credits.forget(DevId(1));
        assert!(credits.snapshot(DevId(1)).is_empty());
    }
}
