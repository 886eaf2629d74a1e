//! Completion servicing and routing.
//!
//! Completions are validated before anything is touched: the device must be
//! active, the message id must parse, name the device whose ring it arrived
//! on and a session in range, and its kind must match the ring family.
//! Anything else is logged and dropped.

use bytes::Bytes;

use crate::context::{Device, DmaContext};
use crate::metrics;
use crate::msg_id::MsgId;
use crate::notify::{Deferred, Notification};
use crate::ring::{Completion, RingFamily, RingId};
use crate::session::Route;
use crate::topology::DevId;

const ALL_FAMILIES: [RingFamily; 6] = [
    RingFamily::InstrList,
    RingFamily::ReadBlock,
    RingFamily::WriteBlock,
    RingFamily::Learn,
    RingFamily::Stat,
    RingFamily::Idle,
];

fn drop_completion(reason: &'static str, dev: DevId, ring: RingId, msg_id: u64) {
    metrics::COMPLETIONS_DROPPED.increment();
    tracing::warn!(dev = dev.0, ?ring, msg_id, reason, "dropping completion");
}

impl DmaContext {
    /// Drain one completion ring and route what it held. Returns the number
    /// of completions taken off the ring.
    pub fn service_ring(&self, dev: DevId, ring: RingId) -> usize {
        let Some(device) = self.device_any(dev) else {
            return 0;
        };
        let mut out = Vec::new();
        if let Err(e) = self.transport.service(dev, ring, &mut out) {
            tracing::warn!(dev = dev.0, ?ring, error = %e, "ring service failed");
            return 0;
        }
        let n = out.len();
        for completion in out {
            metrics::COMPLETIONS_PROCESSED.increment();
            if ring.family.is_notification() {
                self.forward_notification(&device, ring, completion);
            } else {
                self.dispatch(&device, ring, completion);
            }
        }
        n
    }

    /// Service every ring of one family on every subdevice.
    pub fn service_family(&self, dev: DevId, family: RingFamily) -> usize {
        let Some(device) = self.device_any(dev) else {
            return 0;
        };
        device
            .rings(family)
            .into_iter()
            .map(|ring| self.service_ring(dev, ring))
            .sum()
    }

    /// Service every ring of a device.
    pub fn service_device(&self, dev: DevId) -> usize {
        ALL_FAMILIES
            .iter()
            .map(|family| self.service_family(dev, *family))
            .sum()
    }

    fn forward_notification(&self, device: &Device, ring: RingId, completion: Completion) {
        if !device.is_active() {
            drop_completion("device not active", device.id, ring, completion.msg_id);
            return;
        }
        match device.notifier(ring.family) {
            Some(n) => {
                metrics::NOTIFICATIONS_FORWARDED.increment();
                n.deliver(Notification {
                    dev: device.id,
                    ring,
                    error: completion.error,
                    data: completion.data.unwrap_or_else(Bytes::new),
                });
            }
            None => {
                tracing::debug!(dev = device.id.0, ?ring, "no listener for notification");
            }
        }
    }

    fn dispatch(&self, device: &Device, ring: RingId, completion: Completion) {
        let raw = completion.msg_id;
        if !device.is_active() {
            return drop_completion("device not active", device.id, ring, raw);
        }
        let id = MsgId(raw);
        let Some((sess, dev, kind)) = id.parse() else {
            return drop_completion("malformed message id", device.id, ring, raw);
        };
        if dev != device.id {
            return drop_completion("device mismatch", device.id, ring, raw);
        }
        if !ring.family.accepts(kind) {
            return drop_completion("ring does not carry this kind", device.id, ring, raw);
        }
        let Some(slot) = self.sessions.get(sess) else {
            return drop_completion("session out of range", device.id, ring, raw);
        };

        let mut deferred = Deferred::default();
        let mut st = slot.lock();
        if !st.open {
            drop(st);
            return drop_completion("session not open", device.id, ring, raw);
        }
        let Some(route) = st.routes.get(&id).copied() else {
            st.stats.stale_completions += 1;
            drop(st);
            return drop_completion("no pending operation", device.id, ring, raw);
        };

        let error = completion.error;
        let res = match route {
            Route::Il(entry) => {
                self.complete_il(&mut st, device, id, entry, ring, error, &mut deferred)
            }
            Route::ReadIl(op) => {
                self.complete_read_il(&mut st, device, id, op, ring, completion, &mut deferred)
            }
            Route::ReadBlock { op, sub } => self.complete_read(
                &mut st,
                device,
                id,
                (op, sub),
                ring,
                completion,
                &mut deferred,
            ),
            Route::WriteBlock(op) => {
                self.complete_write(&mut st, device, op, ring, error, &mut deferred)
            }
        };
        drop(st);
        deferred.run();
        if let Err(reason) = res {
            drop_completion(reason, device.id, ring, raw);
        }
    }
}
