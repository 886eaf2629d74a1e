use crate::buffer::BufferType;
use crate::error::Error;

/// Configuration for a [`DmaContext`](crate::DmaContext).
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the fixed session table. Session ids occupy 16 bits of a message id.
    pub max_sessions: u32,
    /// Number of device slots. Device ids occupy 8 bits of a message id.
    pub max_devices: u16,
    /// Instruction-list ring pairs per subdevice. Session `s` uses ring `s % il_rings`.
    pub il_rings: u8,
    /// Per-type buffer pool layout, replicated for every (device, subdevice).
    pub pools: PoolLayout,
    /// Emit 32 no-ops before a stage switch so the previous station drains.
    /// Never emitted while the device is locked for reconfiguration.
    pub stage_drain_nops: bool,
    /// Bound in-flight instruction-list buffers by the completion ring depth.
    pub flow_control: bool,
    /// Maximum ring-full retries per descriptor. `None` retries until success.
    pub ring_full_retries: Option<u32>,
    /// First device-visible address handed out to buffer pools.
    pub dma_base: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            max_devices: 8,
            il_rings: 2,
            pools: PoolLayout::default(),
            stage_drain_nops: true,
            flow_control: true,
            ring_full_retries: None,
            dma_base: 0x1_0000_0000,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_sessions == 0 || self.max_sessions > (1 << 16) {
            return Err(Error::InvalidArgument(
                "max_sessions must be > 0 and <= 65536",
            ));
        }
        if self.max_devices == 0 || self.max_devices > 256 {
            return Err(Error::InvalidArgument("max_devices must be > 0 and <= 256"));
        }
        if self.il_rings == 0 {
            return Err(Error::InvalidArgument("il_rings must be > 0"));
        }
        for ty in BufferType::ALL {
            let spec = self.pools.spec(ty);
            if spec.count == 0 {
                return Err(Error::InvalidArgument("pool count must be > 0"));
            }
            if spec.size == 0 || spec.size % 64 != 0 {
                return Err(Error::InvalidArgument(
                    "pool buffer size must be a non-zero multiple of 64",
                ));
            }
        }
        if self.pools.instr_list.size < crate::instr::PER_BUFFER_OVERHEAD * 2 {
            return Err(Error::InvalidArgument(
                "instruction-list buffers too small for stage overhead",
            ));
        }
        Ok(())
    }
}

/// Number and size of buffers in one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSpec {
    pub count: u32,
    pub size: u32,
}

/// Platform DMA layout: one [`PoolSpec`] per buffer type.
#[derive(Clone, Debug)]
pub struct PoolLayout {
    pub instr_list: PoolSpec,
    pub read_block: PoolSpec,
    pub write_block: PoolSpec,
}

impl PoolLayout {
    pub fn spec(&self, ty: BufferType) -> PoolSpec {
        match ty {
            BufferType::InstrList => self.instr_list,
            BufferType::ReadBlock => self.read_block,
            BufferType::WriteBlock => self.write_block,
        }
    }
}

impl Default for PoolLayout {
    fn default() -> Self {
        Self {
            instr_list: PoolSpec {
                count: 64,
                size: 2048,
            },
            read_block: PoolSpec {
                count: 32,
                size: 16384,
            },
            write_block: PoolSpec {
                count: 32,
                size: 16384,
            },
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use pipedma::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .max_sessions(8)
///     .il_pool(32, 1024)
///     .flow_control(true)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Tables ──────────────────────────────────────────────────────

    /// Set the size of the session table.
    pub fn max_sessions(mut self, n: u32) -> Self {
        self.config.max_sessions = n;
        self
    }

    /// Set the number of device slots.
    pub fn max_devices(mut self, n: u16) -> Self {
        self.config.max_devices = n;
        self
    }

    /// Set the number of instruction-list rings per subdevice.
    pub fn il_rings(mut self, n: u8) -> Self {
        self.config.il_rings = n;
        self
    }

    // ── Pools ───────────────────────────────────────────────────────

    /// Set the instruction-list pool layout.
    pub fn il_pool(mut self, count: u32, size: u32) -> Self {
        self.config.pools.instr_list = PoolSpec { count, size };
        self
    }

    /// Set the read-block pool layout.
    pub fn read_block_pool(mut self, count: u32, size: u32) -> Self {
        self.config.pools.read_block = PoolSpec { count, size };
        self
    }

    /// Set the write-block pool layout.
    pub fn write_block_pool(mut self, count: u32, size: u32) -> Self {
        self.config.pools.write_block = PoolSpec { count, size };
        self
    }

    /// Set the first device-visible address used by the DMA layout.
    pub fn dma_base(mut self, base: u64) -> Self {
        self.config.dma_base = base;
        self
    }

    // ── Submission policy ───────────────────────────────────────────

    /// Enable or disable the 32 no-op drain on stage switches.
    pub fn stage_drain_nops(mut self, enable: bool) -> Self {
        self.config.stage_drain_nops = enable;
        self
    }

    /// Enable or disable completion-ring flow control.
    pub fn flow_control(mut self, enable: bool) -> Self {
        self.config.flow_control = enable;
        self
    }

    /// Bound the number of ring-full retries per descriptor.
    pub fn ring_full_retries(mut self, n: u32) -> Self {
        self.config.ring_full_retries = Some(n);
        self
    }

    // ── Escape hatch ────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_oversized_session_table() {
        let err = ConfigBuilder::new().max_sessions(1 << 17).build();
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_tiny_il_buffers() {
        let err = ConfigBuilder::new().il_pool(4, 128).build();
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn builder_sets_pools() {
        let config = ConfigBuilder::new()
            .il_pool(8, 512)
            .read_block_pool(2, 256)
            .write_block_pool(2, 1024)
            .ring_full_retries(3)
            .build()
            .unwrap();
        assert_eq!(config.pools.spec(BufferType::InstrList).size, 512);
        assert_eq!(config.pools.spec(BufferType::ReadBlock).count, 2);
        assert_eq!(config.ring_full_retries, Some(3));
    }
}
