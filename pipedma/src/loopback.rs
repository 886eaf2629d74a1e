//! Software device model implementing [`RingTransport`].
//!
//! Descriptors execute when pushed: instruction lists apply their register
//! writes, read-blocks copy out of a sparse device memory and write-blocks
//! store into it. The resulting completion is queued on the ring and handed
//! out by the next `service` call, so nothing completes without the engine
//! polling for it.
//!
//! Test hooks: per-ring depth, holding completions back, injected push
//! failures and error completions, unsolicited completions, and a log of
//! every accepted descriptor.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::instr::{self, Decoded};
use crate::ring::{Completion, DescOp, Descriptor, RingId, RingTransport};
use crate::topology::DevId;

/// A descriptor accepted by the loopback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posted {
    pub dev: DevId,
    pub ring: RingId,
    pub msg_id: u64,
    pub op: DescOp,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct RingQueue {
    ready: VecDeque<Completion>,
    held: VecDeque<Completion>,
}

impl RingQueue {
    fn len(&self) -> usize {
        self.ready.len() + self.held.len()
    }
}

#[derive(Default)]
struct Model {
    depths: HashMap<(DevId, RingId), u32>,
    rings: HashMap<(DevId, RingId), RingQueue>,
    hold: bool,
    fail_pushes: u32,
    error_completions: u32,
    posted: Vec<Posted>,
    mem: HashMap<(DevId, u64), u8>,
    regs: HashMap<(DevId, u8, u32), u32>,
}

impl Model {
    fn read_mem(&self, dev: DevId, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.mem.get(&(dev, addr + i)).copied().unwrap_or(0))
            .collect()
    }

    fn write_mem(&mut self, dev: DevId, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.mem.insert((dev, addr + i as u64), *b);
        }
    }

    /// Run an instruction list, returning the values of its register reads.
    fn execute(&mut self, dev: DevId, subdev: u8, list: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for op in instr::decode(list) {
            match op {
                Decoded::WriteReg { addr, data } => {
                    self.regs.insert((dev, subdev, addr), data);
                }
                Decoded::ReadReg { addr } => {
                    let v = self.regs.get(&(dev, subdev, addr)).copied().unwrap_or(0);
                    out.extend_from_slice(&v.to_le_bytes());
                }
                _ => {}
            }
        }
        out
    }

    fn run(&mut self, dev: DevId, ring: RingId, desc: &Descriptor<'_>) -> Option<Bytes> {
        match desc.op {
            DescOp::InstrList { .. } => {
                self.execute(dev, ring.subdevice, desc.data);
                None
            }
            DescOp::ReadInstrList { result_len } => {
                let mut out = self.execute(dev, ring.subdevice, desc.data);
                out.resize(result_len as usize, 0);
                Some(Bytes::from(out))
            }
            DescOp::ReadBlock {
                src,
                entry_size,
                entries,
                step,
            } => {
                let mut out = Vec::with_capacity(entries as usize * entry_size as usize);
                for i in 0..entries as u64 {
                    let addr = src + i * step as u64;
                    out.extend(self.read_mem(dev, addr, entry_size as usize));
                }
                Some(Bytes::from(out))
            }
            DescOp::WriteBlock {
                dst,
                entry_size,
                entries,
                step,
                single,
                ..
            } => {
                let es = entry_size as usize;
                for i in 0..entries as usize {
                    let start = if single { 0 } else { i * es };
                    if let Some(entry) = desc.data.get(start..start + es) {
                        self.write_mem(dev, dst + (i as u64) * step as u64, entry);
                    }
                }
                None
            }
        }
    }
}

/// In-process device model. Cheap to share behind an `Arc`.
pub struct Loopback {
    default_depth: u32,
    model: Mutex<Model>,
}

impl Loopback {
    /// Every ring holds `default_depth` entries unless overridden.
    pub fn new(default_depth: u32) -> Self {
        Loopback {
            default_depth,
            model: Mutex::new(Model::default()),
        }
    }

    pub fn set_depth(&self, dev: DevId, ring: RingId, depth: u32) {
        self.model.lock().depths.insert((dev, ring), depth);
    }

    /// While set, completions are queued but not returned by `service`.
    pub fn set_hold(&self, hold: bool) {
        self.model.lock().hold = hold;
    }

    /// Make held completions visible to `service`. Returns how many.
    pub fn release_held(&self) -> usize {
        let mut model = self.model.lock();
        model.hold = false;
        let mut n = 0;
        for q in model.rings.values_mut() {
            n += q.held.len();
            let held = std::mem::take(&mut q.held);
            q.ready.extend(held);
        }
        n
    }

    /// Reject the next `n` pushes with a hard failure.
    pub fn fail_next_pushes(&self, n: u32) {
        self.model.lock().fail_pushes = n;
    }

    /// Report an error on the next `n` completions.
    pub fn error_next_completions(&self, n: u32) {
        self.model.lock().error_completions = n;
    }

    /// Queue an arbitrary completion on a ring, bypassing its depth.
    pub fn inject(&self, dev: DevId, ring: RingId, completion: Completion) {
        self.model
            .lock()
            .rings
            .entry((dev, ring))
            .or_default()
            .ready
            .push_back(completion);
    }

    /// Completions waiting on a ring, held or not.
    pub fn queued(&self, dev: DevId, ring: RingId) -> usize {
        self.model
            .lock()
            .rings
            .get(&(dev, ring))
            .map_or(0, RingQueue::len)
    }

    pub fn posted(&self) -> Vec<Posted> {
        self.model.lock().posted.clone()
    }

    pub fn clear_log(&self) {
        self.model.lock().posted.clear();
    }

    pub fn write_mem(&self, dev: DevId, addr: u64, data: &[u8]) {
        self.model.lock().write_mem(dev, addr, data);
    }

    pub fn read_mem(&self, dev: DevId, addr: u64, len: usize) -> Vec<u8> {
        self.model.lock().read_mem(dev, addr, len)
    }
}

impl RingTransport for Loopback {
    fn push(&self, dev: DevId, ring: RingId, desc: &Descriptor<'_>) -> Result<(), TransportError> {
        let mut model = self.model.lock();
        if model.fail_pushes > 0 {
            model.fail_pushes -= 1;
            return Err(TransportError::Failed("injected push failure".into()));
        }
        let depth = model
            .depths
            .get(&(dev, ring))
            .copied()
            .unwrap_or(self.default_depth);
        let queued = model.rings.get(&(dev, ring)).map_or(0, RingQueue::len);
        if queued >= depth as usize {
            return Err(TransportError::RingFull);
        }

        let data = model.run(dev, ring, desc);
        let error = model.error_completions > 0;
        if error {
            model.error_completions -= 1;
        }
        model.posted.push(Posted {
            dev,
            ring,
            msg_id: desc.msg_id.raw(),
            op: desc.op,
            data: desc.data.to_vec(),
        });
        let completion = Completion {
            msg_id: desc.msg_id.raw(),
            error,
            data,
        };
        let hold = model.hold;
        let q = model.rings.entry((dev, ring)).or_default();
        if hold {
            q.held.push_back(completion);
        } else {
            q.ready.push_back(completion);
        }
        Ok(())
    }

    fn service(
        &self,
        dev: DevId,
        ring: RingId,
        out: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        if let Some(q) = self.model.lock().rings.get_mut(&(dev, ring)) {
            out.extend(q.ready.drain(..));
        }
        Ok(())
    }

    fn depth(&self, dev: DevId, ring: RingId) -> u32 {
        self.model
            .lock()
            .depths
            .get(&(dev, ring))
            .copied()
            .unwrap_or(self.default_depth)
    }

    fn reg_read(&self, dev: DevId, subdev: u8, addr: u32) -> Result<u32, TransportError> {
        Ok(self
            .model
            .lock()
            .regs
            .get(&(dev, subdev, addr))
            .copied()
            .unwrap_or(0))
    }

    fn reg_write(
        &self,
        dev: DevId,
        subdev: u8,
        addr: u32,
        value: u32,
    ) -> Result<(), TransportError> {
        self.model.lock().regs.insert((dev, subdev, addr), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg_id::{MsgId, OpKind};
    use crate::ring::RingFamily;

    fn rb() -> RingId {
        RingId::new(RingFamily::ReadBlock, 0, 0)
    }

    fn read_desc(seq: u32, src: u64) -> (MsgId, DescOp) {
        let id = MsgId::encode(OpKind::ReadBlock, 0, DevId(0), seq);
        let op = DescOp::ReadBlock {
            src,
            entry_size: 4,
            entries: 2,
            step: 8,
        };
        (id, op)
    }

    #[test]
    fn read_block_gathers_by_step() {
        let lb = Loopback::new(4);
        lb.write_mem(DevId(0), 0x100, &[1, 2, 3, 4]);
        lb.write_mem(DevId(0), 0x108, &[5, 6, 7, 8]);
        let (msg_id, op) = read_desc(1, 0x100);
        let desc = Descriptor {
            msg_id,
            addr: 0,
            data: &[],
            op,
        };
        lb.push(DevId(0), rb(), &desc).unwrap();
        let mut out = Vec::new();
        lb.service(DevId(0), rb(), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_id, msg_id.raw());
        assert_eq!(out[0].data.as_deref(), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
    }

    #[test]
    fn depth_and_hold() {
        let lb = Loopback::new(1);
        lb.set_hold(true);
        let (msg_id, op) = read_desc(1, 0);
        let desc = Descriptor {
            msg_id,
            addr: 0,
            data: &[],
            op,
        };
        lb.push(DevId(0), rb(), &desc).unwrap();
        assert_eq!(
            lb.push(DevId(0), rb(), &desc),
            Err(TransportError::RingFull)
        );
        let mut out = Vec::new();
        lb.service(DevId(0), rb(), &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(lb.release_held(), 1);
        lb.service(DevId(0), rb(), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(lb.queued(DevId(0), rb()), 0);
    }

    #[test]
    fn instruction_lists_touch_registers() {
        let lb = Loopback::new(4);
        let il = RingId::new(RingFamily::InstrList, 0, 0);
        let mut list = Vec::new();
        list.extend_from_slice(&instr::write_reg(0x40, 0xDEAD));
        list.extend_from_slice(&instr::read_reg(0x40));
        let desc = Descriptor {
            msg_id: MsgId::encode(OpKind::ReadInstrList, 0, DevId(0), 1),
            addr: 0,
            data: &list,
            op: DescOp::ReadInstrList { result_len: 8 },
        };
        lb.push(DevId(0), il, &desc).unwrap();
        let mut out = Vec::new();
        lb.service(DevId(0), il, &mut out).unwrap();
        assert_eq!(
            out[0].data.as_deref(),
            Some(&[0xAD, 0xDE, 0, 0, 0, 0, 0, 0][..])
        );
        assert_eq!(lb.reg_read(DevId(0), 0, 0x40), Ok(0xDEAD));
        assert_eq!(lb.reg_read(DevId(0), 1, 0x40), Ok(0));
        assert_eq!(lb.posted().len(), 1);
    }

    #[test]
    fn injected_failures() {
        let lb = Loopback::new(4);
        lb.fail_next_pushes(1);
        lb.error_next_completions(1);
        let (msg_id, op) = read_desc(1, 0);
        let desc = Descriptor {
            msg_id,
            addr: 0,
            data: &[],
            op,
        };
        assert!(matches!(
            lb.push(DevId(0), rb(), &desc),
            Err(TransportError::Failed(_))
        ));
        lb.push(DevId(0), rb(), &desc).unwrap();
        let mut out = Vec::new();
        lb.service(DevId(0), rb(), &mut out).unwrap();
        assert!(out[0].error);
        assert!(lb.posted().len() == 1);
    }
}
