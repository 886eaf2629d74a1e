//! Instruction encoding helpers.
//!
//! Instructions are opaque little-endian word sequences. The batch builder
//! only generates the destination-select and no-op instructions it needs
//! for stage bookkeeping, and only inspects the bracket marker of caller
//! instructions. The opcode sits in the top nibble of the first word.
//!
//! ```text
//! NOP               0x0 | 0                          (4 bytes)
//! DEST_SELECT       0x1 | stage[7:0]       , pipe_mask (8 bytes)
//! DEST_SELECT_STAGE 0x2 | stage[7:0]                 (4 bytes)
//! WRITE_REG         0x3 | addr[27:0]       , data    (8 bytes)
//! MARKER            0x4 | kind[3:0]                  (4 bytes)
//! READ_REG          0x5 | addr[27:0]                 (4 bytes)
//! ```

use crate::topology::Stage;

pub const NOP_LEN: u32 = 4;
pub const DEST_SELECT_LEN: u32 = 8;
pub const DEST_SELECT_STAGE_LEN: u32 = 4;

/// No-ops emitted before a stage switch. Hardware keeps at most this many
/// instructions outstanding per station.
pub const STAGE_DRAIN_NOPS: u32 = 32;

/// Space every buffer may spend on stage bookkeeping: one drain sequence,
/// the leading destination select and the closing stage select.
pub const PER_BUFFER_OVERHEAD: u32 =
    STAGE_DRAIN_NOPS * NOP_LEN + DEST_SELECT_LEN + DEST_SELECT_STAGE_LEN;

const OP_NOP: u32 = 0x0;
const OP_DEST_SELECT: u32 = 0x1;
const OP_DEST_SELECT_STAGE: u32 = 0x2;
const OP_WRITE_REG: u32 = 0x3;
const OP_MARKER: u32 = 0x4;
const OP_READ_REG: u32 = 0x5;

const MARKER_LOCK_BEGIN: u32 = 1;
const MARKER_LOCK_END: u32 = 2;
const MARKER_ATOMIC_CSR_BEGIN: u32 = 3;
const MARKER_ATOMIC_CSR_END: u32 = 4;

/// Atomicity bracket boundary carried by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bracket {
    LockBegin,
    LockEnd,
    AtomicCsrBegin,
    AtomicCsrEnd,
}

impl Bracket {
    pub fn opens(self) -> bool {
        matches!(self, Bracket::LockBegin | Bracket::AtomicCsrBegin)
    }
}

#[inline]
fn word(op: u32, low: u32) -> [u8; 4] {
    ((op << 28) | (low & 0x0FFF_FFFF)).to_le_bytes()
}

fn opcode(instr: &[u8]) -> Option<(u32, u32)> {
    let first: [u8; 4] = instr.get(..4)?.try_into().ok()?;
    let w = u32::from_le_bytes(first);
    Some((w >> 28, w & 0x0FFF_FFFF))
}

pub fn nop() -> [u8; 4] {
    word(OP_NOP, 0)
}

/// Select the pipes (by mask) and stage subsequent instructions apply to.
pub fn dest_select(pipe_mask: u32, stage: Stage) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&word(OP_DEST_SELECT, stage.raw() as u32));
    out[4..].copy_from_slice(&pipe_mask.to_le_bytes());
    out
}

/// Re-target the stage while keeping the pipe selection.
pub fn dest_select_stage(stage: Stage) -> [u8; 4] {
    word(OP_DEST_SELECT_STAGE, stage.raw() as u32)
}

pub fn write_reg(addr: u32, data: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&word(OP_WRITE_REG, addr));
    out[4..].copy_from_slice(&data.to_le_bytes());
    out
}

/// Read a register. Only meaningful in a read instruction list, where the
/// value is appended to the returned result.
pub fn read_reg(addr: u32) -> [u8; 4] {
    word(OP_READ_REG, addr)
}

pub fn marker(bracket: Bracket) -> [u8; 4] {
    let kind = match bracket {
        Bracket::LockBegin => MARKER_LOCK_BEGIN,
        Bracket::LockEnd => MARKER_LOCK_END,
        Bracket::AtomicCsrBegin => MARKER_ATOMIC_CSR_BEGIN,
        Bracket::AtomicCsrEnd => MARKER_ATOMIC_CSR_END,
    };
    word(OP_MARKER, kind)
}

/// Classify the bracket marker of an instruction, if it carries one.
pub fn bracket_marker(instr: &[u8]) -> Option<Bracket> {
    match opcode(instr)? {
        (OP_MARKER, MARKER_LOCK_BEGIN) => Some(Bracket::LockBegin),
        (OP_MARKER, MARKER_LOCK_END) => Some(Bracket::LockEnd),
        (OP_MARKER, MARKER_ATOMIC_CSR_BEGIN) => Some(Bracket::AtomicCsrBegin),
        (OP_MARKER, MARKER_ATOMIC_CSR_END) => Some(Bracket::AtomicCsrEnd),
        _ => None,
    }
}

/// Decoded view of the builder-generated instructions, used by diagnostics
/// and tests to walk a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Nop,
    DestSelect { pipe_mask: u32, stage: Stage },
    DestSelectStage(Stage),
    WriteReg { addr: u32, data: u32 },
    ReadReg { addr: u32 },
    Marker(Bracket),
    Other(u32),
}

/// Walk a buffer of instructions. Unknown opcodes are treated as one word.
pub fn decode(mut bytes: &[u8]) -> Vec<Decoded> {
    let mut out = Vec::new();
    while let Some((op, low)) = opcode(bytes) {
        let (item, len) = match op {
            OP_NOP => (Decoded::Nop, 4),
            OP_DEST_SELECT if bytes.len() >= 8 => {
                let pipe_mask = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                (
                    Decoded::DestSelect {
                        pipe_mask,
                        stage: Stage::from_raw(low as u8),
                    },
                    8,
                )
            }
            OP_DEST_SELECT_STAGE => (Decoded::DestSelectStage(Stage::from_raw(low as u8)), 4),
            OP_WRITE_REG if bytes.len() >= 8 => {
                let data = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                (Decoded::WriteReg { addr: low, data }, 8)
            }
            OP_READ_REG => (Decoded::ReadReg { addr: low }, 4),
            OP_MARKER => match bracket_marker(bytes) {
                Some(b) => (Decoded::Marker(b), 4),
                None => (Decoded::Other(op), 4),
            },
            _ => (Decoded::Other(op), 4),
        };
        out.push(item);
        bytes = &bytes[len..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_matches_components() {
        assert_eq!(PER_BUFFER_OVERHEAD, 32 * 4 + 8 + 4);
    }

    #[test]
    fn markers_classify() {
        assert_eq!(bracket_marker(&marker(Bracket::LockBegin)), Some(Bracket::LockBegin));
        assert_eq!(
            bracket_marker(&marker(Bracket::AtomicCsrEnd)),
            Some(Bracket::AtomicCsrEnd)
        );
        assert_eq!(bracket_marker(&write_reg(0x40, 1)), None);
        assert_eq!(bracket_marker(&nop()), None);
        assert_eq!(bracket_marker(&[0x01]), None);
        assert!(Bracket::AtomicCsrBegin.opens());
        assert!(!Bracket::LockEnd.opens());
    }

    #[test]
    fn decode_walks_sequence() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&dest_select(0b11, Stage::Mau(3)));
        buf.extend_from_slice(&write_reg(0x123, 0xAABB));
        buf.extend_from_slice(&dest_select_stage(Stage::Parde));
        buf.extend_from_slice(&nop());
        buf.extend_from_slice(&read_reg(0x77));
        assert_eq!(
            decode(&buf),
            vec![
                Decoded::DestSelect {
                    pipe_mask: 0b11,
                    stage: Stage::Mau(3)
                },
                Decoded::WriteReg {
                    addr: 0x123,
                    data: 0xAABB
                },
                Decoded::DestSelectStage(Stage::Parde),
                Decoded::Nop,
                Decoded::ReadReg { addr: 0x77 },
            ]
        );
    }

    #[test]
    fn dest_select_keeps_high_pipes() {
        let ops = decode(&dest_select(1 << 31 | 1 << 20, Stage::Parde));
        assert_eq!(
            ops,
            vec![Decoded::DestSelect {
                pipe_mask: 1 << 31 | 1 << 20,
                stage: Stage::Parde
            }]
        );
    }
}
