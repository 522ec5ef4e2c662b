//! Fetch: turns a byte stream at CS:IP into a [`DecodedInstruction`].
//! Grounded on the addressing grammar in the reference CPU's
//! `operands.c`/`instructions.c` dispatch, generalized into a flat
//! 256-entry opcode table the way the teacher's `parser.rs` lays out its
//! opcode constant tables by specificity.

use crate::cpu::width::Width;
use crate::static_vec::StaticVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    SegEs,
    SegCs,
    SegSs,
    SegDs,
    Lock,
    Repne,
    Rep,
}

impl Prefix {
    pub fn from_byte(byte: u8) -> Option<Prefix> {
        match byte {
            0x26 => Some(Prefix::SegEs),
            0x2E => Some(Prefix::SegCs),
            0x36 => Some(Prefix::SegSs),
            0x3E => Some(Prefix::SegDs),
            0xF0 => Some(Prefix::Lock),
            0xF2 => Some(Prefix::Repne),
            0xF3 => Some(Prefix::Rep),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn decode(byte: u8) -> ModRm {
        ModRm {
            md: (byte >> 6) & 0x3,
            reg: (byte >> 3) & 0x7,
            rm: byte & 0x7,
        }
    }
}

/// Number of displacement bytes the ModR/M's `mod`/`rm` combination implies,
/// per the 8086 addressing grammar (spec.md 4.1).
pub fn displacement_size(modrm: ModRm) -> u8 {
    match modrm.md {
        0 if modrm.rm == 6 => 2,
        0 => 0,
        1 => 1,
        2 => 2,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmSize {
    None,
    Byte,
    Word,
    /// Far JMP/CALL: a 16-bit offset followed by a 16-bit segment.
    Far,
}

impl ImmSize {
    pub fn byte_len(self) -> u8 {
        match self {
            ImmSize::None => 0,
            ImmSize::Byte => 1,
            ImmSize::Word => 2,
            ImmSize::Far => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub has_modrm: bool,
    pub immediate_size: ImmSize,
    pub default_width: Width,
}

impl Default for OpcodeInfo {
    fn default() -> Self {
        OpcodeInfo {
            has_modrm: false,
            immediate_size: ImmSize::None,
            default_width: Width::Byte,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedInstruction {
    pub prefixes: StaticVec<Prefix, 4>,
    pub opcode: u8,
    pub modrm: Option<ModRm>,
    pub displacement: i32,
    pub immediate: u32,
    pub immediate_size: u8,
    pub length: u16,
}

impl DecodedInstruction {
    pub fn segment_override(&self) -> Option<crate::cpu::registers::RegisterIndex> {
        use crate::cpu::registers::RegisterIndex;
        self.prefixes.iter().find_map(|p| match p {
            Prefix::SegEs => Some(RegisterIndex::Es),
            Prefix::SegCs => Some(RegisterIndex::Cs),
            Prefix::SegSs => Some(RegisterIndex::Ss),
            Prefix::SegDs => Some(RegisterIndex::Ds),
            _ => None,
        })
    }

    pub fn has_prefix(&self, prefix: Prefix) -> bool {
        self.prefixes.iter().any(|p| *p == prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailure {
    TooManyPrefixes,
}

/// Fetches and decodes one instruction starting at physical address `start`.
/// `read_byte` is any callback giving bus-semantics byte reads (unmapped
/// addresses read as `0xFF`, never an error — only exceeding prefix
/// capacity is a decode failure).
pub fn fetch(
    start: u32,
    table: &[OpcodeInfo; 256],
    mut read_byte: impl FnMut(u32) -> u8,
) -> Result<DecodedInstruction, DecodeFailure> {
    let mut cursor = start;
    let mut next_byte = || {
        let b = read_byte(cursor & 0xF_FFFF);
        cursor = cursor.wrapping_add(1);
        b
    };

    let mut decoded = DecodedInstruction::default();
    loop {
        let byte = next_byte();
        match Prefix::from_byte(byte) {
            Some(prefix) => {
                decoded
                    .prefixes
                    .push(prefix)
                    .map_err(|_| DecodeFailure::TooManyPrefixes)?;
            }
            None => {
                decoded.opcode = byte;
                break;
            }
        }
    }

    let info = table[decoded.opcode as usize];
    if info.has_modrm {
        let modrm = ModRm::decode(next_byte());
        let disp_len = displacement_size(modrm);
        decoded.displacement = match disp_len {
            0 => 0,
            1 => (next_byte() as i8) as i32,
            2 => {
                let lo = next_byte() as u16;
                let hi = next_byte() as u16;
                (lo | (hi << 8)) as i16 as i32
            }
            _ => unreachable!(),
        };
        decoded.modrm = Some(modrm);
    }

    // F6/F7 (Group 3) only carry an immediate for the TEST sub-opcode
    // (modrm.reg 0 or 1); NOT/NEG/MUL/IMUL/DIV/IDIV take none. The flat
    // per-opcode table can't express a reg-dependent immediate, so it's
    // special-cased here instead of carrying ImmSize::None for the opcode.
    let effective_imm_size = if matches!(decoded.opcode, 0xF6 | 0xF7) {
        match decoded.modrm {
            Some(modrm) if modrm.reg == 0 || modrm.reg == 1 => {
                if decoded.opcode == 0xF6 { ImmSize::Byte } else { ImmSize::Word }
            }
            _ => ImmSize::None,
        }
    } else {
        info.immediate_size
    };

    let imm_len = effective_imm_size.byte_len();
    decoded.immediate_size = imm_len;
    decoded.immediate = match effective_imm_size {
        ImmSize::None => 0,
        ImmSize::Byte => next_byte() as u32,
        ImmSize::Word => {
            let lo = next_byte() as u32;
            let hi = next_byte() as u32;
            lo | (hi << 8)
        }
        ImmSize::Far => {
            let lo = next_byte() as u32;
            let hi = next_byte() as u32;
            let seg_lo = next_byte() as u32;
            let seg_hi = next_byte() as u32;
            (lo | (hi << 8)) | ((seg_lo | (seg_hi << 8)) << 16)
        }
    };

    decoded.length = (cursor - start) as u16;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_immediate_to_ax() {
        // B8 34 12 -> MOV AX, 0x1234
        let code = [0xB8u8, 0x34, 0x12];
        let mut table = [OpcodeInfo::default(); 256];
        table[0xB8] = OpcodeInfo {
            has_modrm: false,
            immediate_size: ImmSize::Word,
            default_width: Width::Word,
        };
        let decoded = fetch(0, &table, |addr| code[addr as usize]).unwrap();
        assert_eq!(decoded.opcode, 0xB8);
        assert_eq!(decoded.immediate, 0x1234);
        assert_eq!(decoded.length, 3);
    }

    #[test]
    fn too_many_prefixes_fails() {
        let code = [0x26u8, 0x26, 0x26, 0x26, 0x26, 0x90];
        let table = [OpcodeInfo::default(); 256];
        let result = fetch(0, &table, |addr| code[addr as usize]);
        assert_eq!(result, Err(DecodeFailure::TooManyPrefixes));
    }

    #[test]
    fn group3_test_reads_immediate_but_not_reads() {
        // F6 /0 ib -> TEST AL's r/m8 against an immediate.
        let test_code = [0xF6u8, 0xC0, 0x0F];
        let mut table = [OpcodeInfo::default(); 256];
        table[0xF6] = OpcodeInfo { has_modrm: true, immediate_size: ImmSize::None, default_width: Width::Byte };
        let decoded = fetch(0, &table, |addr| test_code[addr as usize]).unwrap();
        assert_eq!(decoded.immediate, 0x0F);
        assert_eq!(decoded.length, 3);

        // F6 /2 -> NOT r/m8, no immediate at all.
        let not_code = [0xF6u8, 0xD0];
        let decoded = fetch(0, &table, |addr| not_code[addr as usize]).unwrap();
        assert_eq!(decoded.immediate, 0);
        assert_eq!(decoded.length, 2);
    }
}
