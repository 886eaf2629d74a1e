use std::fmt;

use crate::buffer::BufferType;
use crate::context::DmaContext;
use crate::error::Result;
use crate::ring::{RingCredit, RingId};
use crate::session::{LockState, SessionId};
use crate::topology::{DevId, Family};

/// Occupancy of one buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDump {
    pub subdev: u8,
    pub ty: BufferType,
    pub buf_size: u32,
    pub capacity: u32,
    pub free: u32,
}

/// Work a session has queued against one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDump {
    pub session: u16,
    pub composing: usize,
    pub composing_locked: usize,
    pub il_in_flight: usize,
    pub read_in_flight: usize,
    pub write_ops: usize,
    pub read_lists: usize,
}

/// Diagnostic snapshot of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDump {
    pub dev: DevId,
    pub family: Family,
    pub locked: bool,
    pub in_flight: u32,
    pub pools: Vec<PoolDump>,
    pub rings: Vec<(RingId, RingCredit)>,
    /// Only sessions with something pending on this device.
    pub sessions: Vec<SessionDump>,
}

impl DeviceDump {
    pub fn pool(&self, subdev: u8, ty: BufferType) -> Option<&PoolDump> {
        self.pools.iter().find(|p| p.subdev == subdev && p.ty == ty)
    }

    pub fn session(&self, sess: SessionId) -> Option<&SessionDump> {
        self.sessions.iter().find(|s| s.session == sess.0)
    }
}

impl fmt::Display for DeviceDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "device {} ({:?}){} in-flight {}",
            self.dev.0,
            self.family,
            if self.locked { " locked" } else { "" },
            self.in_flight
        )?;
        writeln!(f, "  pools:")?;
        for p in &self.pools {
            writeln!(
                f,
                "    subdev {} {:<10} {:>4}/{:<4} free  ({} bytes each)",
                p.subdev,
                format!("{:?}", p.ty),
                p.free,
                p.capacity,
                p.buf_size
            )?;
        }
        if !self.rings.is_empty() {
            writeln!(f, "  rings:")?;
            for (ring, credit) in &self.rings {
                writeln!(
                    f,
                    "    {:?}[{}.{}] {}/{}",
                    ring.family, ring.subdevice, ring.index, credit.in_flight, credit.depth
                )?;
            }
        }
        for s in &self.sessions {
            writeln!(
                f,
                "  session {}: composing {} (+{} locked), il {}, read {}, write {}, read-list {}",
                s.session,
                s.composing,
                s.composing_locked,
                s.il_in_flight,
                s.read_in_flight,
                s.write_ops,
                s.read_lists
            )?;
        }
        Ok(())
    }
}

impl DmaContext {
    /// Flow-control accounting of one completion ring.
    pub fn ring_credit(&self, dev: DevId, ring: RingId) -> RingCredit {
        self.credits.get(dev, ring)
    }

    /// Snapshot pool occupancy, ring credits and per-session work for `dev`.
    pub fn dump(&self, dev: DevId) -> Result<DeviceDump> {
        let device = self.device(dev)?;
        let mut pools = Vec::new();
        for subdev in 0..device.info.subdevices {
            for ty in BufferType::ALL {
                let pool = device.pool(subdev, ty)?.lock();
                pools.push(PoolDump {
                    subdev,
                    ty,
                    buf_size: pool.buf_size(),
                    capacity: pool.capacity(),
                    free: pool.free_count(),
                });
            }
        }

        let mut sessions = Vec::new();
        for slot in self.sessions.iter() {
            let st = slot.lock();
            if !st.open {
                continue;
            }
            let composing = |lock: LockState| {
                st.composing[lock.index()]
                    .as_ref()
                    .map_or(0, |b| b.buffer_count(dev))
            };
            let s = SessionDump {
                session: st.id.0,
                composing: composing(LockState::Unlocked),
                composing_locked: composing(LockState::Locked),
                il_in_flight: st.pushed.iter().map(|(_, p)| p.in_flight_on(dev)).sum(),
                read_in_flight: st
                    .read_ops
                    .iter()
                    .filter(|(_, o)| o.dev == dev)
                    .map(|(_, o)| o.in_flight())
                    .sum(),
                write_ops: st.write_ops.iter().filter(|(_, o)| o.dev == dev).count(),
                read_lists: st
                    .read_ils
                    .iter()
                    .filter(|(_, o)| o.buf.key().dev == dev)
                    .count(),
            };
            if s != (SessionDump {
                session: s.session,
                ..SessionDump::default()
            }) {
                sessions.push(s);
            }
        }

        Ok(DeviceDump {
            dev,
            family: device.info.family,
            locked: device.is_locked(),
            in_flight: device.in_flight(),
            pools,
            rings: self.credits.snapshot(dev),
            sessions,
        })
    }
}
