//! Device model consumed by the engine.
//!
//! The engine never probes hardware itself. The platform layer describes
//! each device once, at [`DmaContext::add_device`](crate::DmaContext::add_device),
//! and the engine derives ring layout, pipe routing and stage validation
//! from that description.

use crate::error::{Error, Result};

/// Device identifier, as assigned by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevId(pub u8);

/// Silicon generation. Only reported in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Gen1,
    Gen2,
    Gen3,
}

/// Pipeline stage targeted by a destination-select instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Match-action stage `n`.
    Mau(u8),
    /// Parser/deparser block. Not a MAU stage, so a buffer may never end
    /// while targeting it.
    Parde,
}

impl Stage {
    /// Wire value used in destination-select instructions.
    pub(crate) const PARDE_RAW: u8 = 0xFF;

    pub fn is_mau(self) -> bool {
        matches!(self, Stage::Mau(_))
    }

    pub(crate) fn raw(self) -> u8 {
        match self {
            Stage::Mau(n) => n,
            Stage::Parde => Self::PARDE_RAW,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        if raw == Self::PARDE_RAW {
            Stage::Parde
        } else {
            Stage::Mau(raw)
        }
    }
}

/// Static description of one device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub family: Family,
    /// Number of subdevices (dies). Each has its own set of rings and pools.
    pub subdevices: u8,
    /// Physical pipes owned by each subdevice.
    pub pipes_per_subdevice: u8,
    /// Number of MAU stages per pipe.
    pub stages: u8,
    /// `logical_to_physical[l]` is the physical pipe backing logical pipe `l`.
    pub logical_to_physical: Vec<u8>,
}

impl DeviceInfo {
    /// Single-subdevice device with an identity pipe map.
    pub fn simple(family: Family, pipes: u8, stages: u8) -> Self {
        DeviceInfo {
            family,
            subdevices: 1,
            pipes_per_subdevice: pipes,
            stages,
            logical_to_physical: (0..pipes).collect(),
        }
    }

    pub fn pipe_count(&self) -> u32 {
        self.subdevices as u32 * self.pipes_per_subdevice as u32
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.subdevices == 0 || self.pipes_per_subdevice == 0 {
            return Err(Error::InvalidArgument("device must have pipes"));
        }
        if self.pipe_count() > 32 {
            return Err(Error::InvalidArgument("more than 32 pipes per device"));
        }
        if self.logical_to_physical.len() != self.pipe_count() as usize {
            return Err(Error::InvalidArgument("pipe map length mismatch"));
        }
        let mut seen = 0u32;
        for &phys in &self.logical_to_physical {
            if phys as u32 >= self.pipe_count() || seen & (1 << phys) != 0 {
                return Err(Error::InvalidArgument("pipe map is not a permutation"));
            }
            seen |= 1 << phys;
        }
        Ok(())
    }

    pub(crate) fn check_stage(&self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Mau(n) if n >= self.stages => Err(Error::InvalidArgument("stage out of range")),
            _ => Ok(()),
        }
    }

    /// Translate a logical pipe mask into the physical pipes it covers.
    pub fn physical_mask(&self, logical_mask: u32) -> Result<u32> {
        let pipes = self.pipe_count();
        if logical_mask == 0 || (pipes < 32 && logical_mask >> pipes != 0) {
            return Err(Error::InvalidArgument("logical pipe mask out of range"));
        }
        let mut phys = 0u32;
        for (logical, &p) in self.logical_to_physical.iter().enumerate() {
            if logical_mask & (1 << logical) != 0 {
                phys |= 1 << p;
            }
        }
        Ok(phys)
    }

    /// Subdevice and pipe-within-subdevice owning physical pipe `pipe`.
    pub fn locate_pipe(&self, pipe: u32) -> (u8, u8) {
        let pps = self.pipes_per_subdevice as u32;
        ((pipe / pps) as u8, (pipe % pps) as u8)
    }
}
