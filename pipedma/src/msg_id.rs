use crate::topology::DevId;

/// Operation kinds encoded in the upper 8 bits of a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    /// Scatter read of a memory block.
    ReadBlock = 1,
    /// Broadcast write of a memory block.
    WriteBlock = 2,
    /// One buffer of an instruction-list batch.
    InstrList = 3,
    /// Single-buffer instruction list returning read data.
    ReadInstrList = 4,
}

impl OpKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(OpKind::ReadBlock),
            2 => Some(OpKind::WriteBlock),
            3 => Some(OpKind::InstrList),
            4 => Some(OpKind::ReadInstrList),
            _ => None,
        }
    }
}

/// Correlation handle attached to every descriptor and echoed back on completion.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: OpKind (8 bits)
/// Bits 55..40: Session id (16 bits)
/// Bits 39..32: Device id (8 bits)
/// Bits 31..0:  Per-session sequence number (32 bits)
/// ```
///
/// The sequence counter lives in the session, so ids are unique across
/// sessions, devices and kinds without a shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub u64);

impl MsgId {
    const KIND_SHIFT: u64 = 56;
    const SESSION_SHIFT: u64 = 40;
    const DEVICE_SHIFT: u64 = 32;
    const KIND_MASK: u64 = 0xFF << Self::KIND_SHIFT;
    const SESSION_MASK: u64 = 0xFFFF << Self::SESSION_SHIFT;
    const DEVICE_MASK: u64 = 0xFF << Self::DEVICE_SHIFT;
    const SEQ_MASK: u64 = 0xFFFF_FFFF;

    /// Encode a kind, session, device and sequence number.
    #[inline]
    pub fn encode(kind: OpKind, session: u16, dev: DevId, seq: u32) -> Self {
        let v = ((kind as u64) << Self::KIND_SHIFT)
            | ((session as u64) << Self::SESSION_SHIFT)
            | ((dev.0 as u64) << Self::DEVICE_SHIFT)
            | seq as u64;
        MsgId(v)
    }

    /// Decode the operation kind.
    #[inline]
    pub fn kind(self) -> Option<OpKind> {
        OpKind::from_u8(((self.0 & Self::KIND_MASK) >> Self::KIND_SHIFT) as u8)
    }

    /// Decode the session id.
    #[inline]
    pub fn session(self) -> u16 {
        ((self.0 & Self::SESSION_MASK) >> Self::SESSION_SHIFT) as u16
    }

    /// Decode the device id.
    #[inline]
    pub fn device(self) -> DevId {
        DevId(((self.0 & Self::DEVICE_MASK) >> Self::DEVICE_SHIFT) as u8)
    }

    /// Decode the sequence number.
    #[inline]
    pub fn seq(self) -> u32 {
        (self.0 & Self::SEQ_MASK) as u32
    }

    /// Decode `(session, device, kind)`. `None` if the kind byte is invalid.
    pub fn parse(self) -> Option<(u16, DevId, OpKind)> {
        Some((self.session(), self.device(), self.kind()?))
    }

    /// Get the raw u64 value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}
