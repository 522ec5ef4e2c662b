//! Opcode dispatch. One flat 256-entry metadata table (built once, consulted
//! by `decode::fetch`) plus this module's `execute`, which matches on the
//! opcode byte and groups the regular ALU/group encodings the way the real
//! 8086 opcode map lays them out, rather than writing each of the ~250
//! encoded forms out by hand.

use crate::cpu::alu::{self, ShiftOp};
use crate::cpu::bcd;
use crate::cpu::decode::{DecodedInstruction, ImmSize, OpcodeInfo, Prefix};
use crate::cpu::flags::Flags;
use crate::cpu::operand::{self, MemoryAddress, OperandAddress};
use crate::cpu::registers::{RegisterAddress, RegisterIndex};
use crate::cpu::width::{OperandValue, Width};
use crate::cpu::Cpu;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Normal,
    Halt,
    SoftwareInterrupt(u8),
    InvalidOpcode,
    DivideByZero,
    Into,
}

fn width_of(opcode: u8) -> Width {
    if opcode & 1 == 0 { Width::Byte } else { Width::Word }
}

/// Builds the flat opcode metadata table `decode::fetch` consults. Opcodes
/// this core does not implement are left at their all-zero default; `execute`
/// maps any opcode it doesn't recognize to `InvalidOpcode` regardless, so an
/// unimplemented entry here only affects how many (if any) extra bytes were
/// consumed before the CPU notices — harmless, since #UD discards the
/// instruction's effects entirely.
pub fn build_opcode_table() -> [OpcodeInfo; 256] {
    let mut t = [OpcodeInfo::default(); 256];
    let set = |t: &mut [OpcodeInfo; 256], op: u8, has_modrm: bool, imm: ImmSize, width: Width| {
        t[op as usize] = OpcodeInfo { has_modrm, immediate_size: imm, default_width: width };
    };

    // ALU groups 0x00-0x3F (rem 6/7 slots patched below per group).
    for g in 0u8..8 {
        let base = g * 8;
        set(&mut t, base, true, ImmSize::None, Width::Byte);
        set(&mut t, base + 1, true, ImmSize::None, Width::Word);
        set(&mut t, base + 2, true, ImmSize::None, Width::Byte);
        set(&mut t, base + 3, true, ImmSize::None, Width::Word);
        set(&mut t, base + 4, false, ImmSize::Byte, Width::Byte);
        set(&mut t, base + 5, false, ImmSize::Word, Width::Word);
    }
    for op in [0x06, 0x07, 0x0E, 0x16, 0x17, 0x1E, 0x1F] {
        set(&mut t, op, false, ImmSize::None, Width::Word);
    }
    for op in [0x27, 0x2F, 0x37, 0x3F] {
        set(&mut t, op, false, ImmSize::None, Width::Byte);
    }

    for op in 0x40u8..=0x5F {
        set(&mut t, op, false, ImmSize::None, Width::Word);
    }
    for op in 0x70u8..=0x7F {
        set(&mut t, op, false, ImmSize::Byte, Width::Byte);
    }
    set(&mut t, 0x80, true, ImmSize::Byte, Width::Byte);
    set(&mut t, 0x81, true, ImmSize::Word, Width::Word);
    set(&mut t, 0x83, true, ImmSize::Byte, Width::Word);
    set(&mut t, 0x84, true, ImmSize::None, Width::Byte);
    set(&mut t, 0x85, true, ImmSize::None, Width::Word);
    set(&mut t, 0x86, true, ImmSize::None, Width::Byte);
    set(&mut t, 0x87, true, ImmSize::None, Width::Word);
    set(&mut t, 0x88, true, ImmSize::None, Width::Byte);
    set(&mut t, 0x89, true, ImmSize::None, Width::Word);
    set(&mut t, 0x8A, true, ImmSize::None, Width::Byte);
    set(&mut t, 0x8B, true, ImmSize::None, Width::Word);
    set(&mut t, 0x8C, true, ImmSize::None, Width::Word);
    set(&mut t, 0x8D, true, ImmSize::None, Width::Word);
    set(&mut t, 0x8E, true, ImmSize::None, Width::Word);
    set(&mut t, 0x8F, true, ImmSize::None, Width::Word);
    for op in 0x90u8..=0x97 {
        set(&mut t, op, false, ImmSize::None, Width::Word);
    }
    set(&mut t, 0x98, false, ImmSize::None, Width::Word);
    set(&mut t, 0x99, false, ImmSize::None, Width::Word);
    set(&mut t, 0x9A, false, ImmSize::Far, Width::Word);
    set(&mut t, 0x9B, false, ImmSize::None, Width::Byte);
    set(&mut t, 0x9C, false, ImmSize::None, Width::Word);
    set(&mut t, 0x9D, false, ImmSize::None, Width::Word);
    set(&mut t, 0x9E, false, ImmSize::None, Width::Byte);
    set(&mut t, 0x9F, false, ImmSize::None, Width::Byte);
    set(&mut t, 0xA0, false, ImmSize::Word, Width::Byte);
    set(&mut t, 0xA1, false, ImmSize::Word, Width::Word);
    set(&mut t, 0xA2, false, ImmSize::Word, Width::Byte);
    set(&mut t, 0xA3, false, ImmSize::Word, Width::Word);
    for op in 0xA4u8..=0xAF {
        let width = width_of(op);
        set(&mut t, op, false, ImmSize::None, width);
    }
    t[0xA8].immediate_size = ImmSize::Byte;
    t[0xA9].immediate_size = ImmSize::Word;
    for op in 0xB0u8..=0xB7 {
        set(&mut t, op, false, ImmSize::Byte, Width::Byte);
    }
    for op in 0xB8u8..=0xBF {
        set(&mut t, op, false, ImmSize::Word, Width::Word);
    }
    set(&mut t, 0xC2, false, ImmSize::Word, Width::Word);
    set(&mut t, 0xC3, false, ImmSize::None, Width::Word);
    set(&mut t, 0xC4, true, ImmSize::None, Width::Word);
    set(&mut t, 0xC5, true, ImmSize::None, Width::Word);
    set(&mut t, 0xC6, true, ImmSize::Byte, Width::Byte);
    set(&mut t, 0xC7, true, ImmSize::Word, Width::Word);
    set(&mut t, 0xCA, false, ImmSize::Word, Width::Word);
    set(&mut t, 0xCB, false, ImmSize::None, Width::Word);
    set(&mut t, 0xCC, false, ImmSize::None, Width::Byte);
    set(&mut t, 0xCD, false, ImmSize::Byte, Width::Byte);
    set(&mut t, 0xCE, false, ImmSize::None, Width::Byte);
    set(&mut t, 0xCF, false, ImmSize::None, Width::Word);
    set(&mut t, 0xD0, true, ImmSize::None, Width::Byte);
    set(&mut t, 0xD1, true, ImmSize::None, Width::Word);
    set(&mut t, 0xD2, true, ImmSize::None, Width::Byte);
    set(&mut t, 0xD3, true, ImmSize::None, Width::Word);
    set(&mut t, 0xD4, false, ImmSize::Byte, Width::Byte);
    set(&mut t, 0xD5, false, ImmSize::Byte, Width::Byte);
    for op in 0xE0u8..=0xE3 {
        set(&mut t, op, false, ImmSize::Byte, Width::Byte);
    }
    set(&mut t, 0xE4, false, ImmSize::Byte, Width::Byte);
    set(&mut t, 0xE5, false, ImmSize::Byte, Width::Word);
    set(&mut t, 0xE6, false, ImmSize::Byte, Width::Byte);
    set(&mut t, 0xE7, false, ImmSize::Byte, Width::Word);
    set(&mut t, 0xE8, false, ImmSize::Word, Width::Word);
    set(&mut t, 0xE9, false, ImmSize::Word, Width::Word);
    set(&mut t, 0xEA, false, ImmSize::Far, Width::Word);
    set(&mut t, 0xEB, false, ImmSize::Byte, Width::Byte);
    for op in 0xECu8..=0xEF {
        let width = width_of(op);
        set(&mut t, op, false, ImmSize::None, width);
    }
    set(&mut t, 0xF4, false, ImmSize::None, Width::Byte);
    set(&mut t, 0xF5, false, ImmSize::None, Width::Byte);
    set(&mut t, 0xF6, true, ImmSize::None, Width::Byte);
    set(&mut t, 0xF7, true, ImmSize::None, Width::Word);
    for op in 0xF8u8..=0xFD {
        set(&mut t, op, false, ImmSize::None, Width::Byte);
    }
    set(&mut t, 0xFE, true, ImmSize::None, Width::Byte);
    set(&mut t, 0xFF, true, ImmSize::None, Width::Word);
    t
}

/// Condition codes for Jcc / LOOPcc, evaluated against the current flags.
fn evaluate_condition(opcode_low_nibble: u8, flags: Flags) -> bool {
    let cf = flags.get(Flags::CF);
    let zf = flags.get(Flags::ZF);
    let sf = flags.get(Flags::SF);
    let of = flags.get(Flags::OF);
    let pf = flags.get(Flags::PF);
    match opcode_low_nibble {
        0x0 => of,
        0x1 => !of,
        0x2 => cf,
        0x3 => !cf,
        0x4 => zf,
        0x5 => !zf,
        0x6 => cf || zf,
        0x7 => !cf && !zf,
        0x8 => sf,
        0x9 => !sf,
        0xA => pf,
        0xB => !pf,
        0xC => sf != of,
        0xD => sf == of,
        0xE => zf || (sf != of),
        0xF => !zf && (sf == of),
        _ => unreachable!(),
    }
}

struct AluGroup;
impl AluGroup {
    const ADD: u8 = 0;
    const OR: u8 = 1;
    const ADC: u8 = 2;
    const SBB: u8 = 3;
    const AND: u8 = 4;
    const SUB: u8 = 5;
    const XOR: u8 = 6;
    const CMP: u8 = 7;
}

/// Applies one of the 8 ALU-group operations, returning `(result, flags)`.
/// `CMP`/`TEST`-style comparisons use this too; the caller decides whether
/// to write the result back.
fn apply_alu(op: u8, a: u32, b: u32, flags_in: Flags, width: Width) -> (u32, Flags) {
    match op {
        AluGroup::ADD => alu::add(a, b, false, width),
        AluGroup::OR => alu::or(a, b, width),
        AluGroup::ADC => alu::add(a, b, flags_in.get(Flags::CF), width),
        AluGroup::SBB => alu::sub(a, b, flags_in.get(Flags::CF), width),
        AluGroup::AND => alu::and(a, b, width),
        AluGroup::SUB | AluGroup::CMP => alu::sub(a, b, false, width),
        AluGroup::XOR => alu::xor(a, b, width),
        _ => unreachable!(),
    }
}

fn sign_extend_byte_to_width(byte: u8, width: Width) -> u32 {
    match width {
        Width::Byte => byte as u32,
        Width::Word => ((byte as i8) as i16 as u16) as u32,
    }
}

pub fn execute(cpu: &mut Cpu, platform: &mut Platform, decoded: &DecodedInstruction) -> StepOutcome {
    let opcode = decoded.opcode;
    let seg_override = decoded.segment_override();
    let modrm = decoded.modrm;

    // ALU groups 0x00-0x3D (register/memory forms and accumulator-immediate
    // forms), with the irregular rem-6/7 slots (PUSH/POP segreg, DAA/DAS/
    // AAA/AAS) handled right after.
    if opcode < 0x40 {
        let group = opcode / 8;
        let rem = opcode % 8;
        if rem <= 3 {
            let width = if rem % 2 == 0 { Width::Byte } else { Width::Word };
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, seg_override, &cpu.regs);
            let reg_addr = operand::reg_field_address(modrm, width);
            let reg_val = cpu.regs.get(reg_addr, width).as_u32();
            let rm_val = rm_addr.read(width, &cpu.regs, platform).as_u32();
            // rem 0/1: r/m is destination, reg is source. rem 2/3: reverse.
            let (dest_is_rm, a, b) = if rem < 2 { (true, rm_val, reg_val) } else { (false, reg_val, rm_val) };
            let (result, new_flags) = apply_alu(group, a, b, cpu.flags, width);
            apply_arith_flags(cpu, group, new_flags);
            if group != AluGroup::CMP {
                let value = OperandValue::from_u32(width, result);
                if dest_is_rm {
                    rm_addr.write(value, &mut cpu.regs, platform);
                } else {
                    cpu.regs.set(reg_addr, value);
                }
            }
            return StepOutcome::Normal;
        } else if rem == 4 || rem == 5 {
            let width = if rem == 4 { Width::Byte } else { Width::Word };
            let a = cpu.regs.get_word(RegisterIndex::Ax) as u32;
            let a = width.mask(a);
            let (result, new_flags) = apply_alu(group, a, decoded.immediate, cpu.flags, width);
            apply_arith_flags(cpu, group, new_flags);
            if group != AluGroup::CMP {
                match width {
                    Width::Byte => cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, result as u8),
                    Width::Word => cpu.regs.set_word(RegisterIndex::Ax, result as u16),
                }
            }
            return StepOutcome::Normal;
        } else {
            return execute_alu_special(cpu, platform, group, opcode);
        }
    }

    match opcode {
        0x40..=0x47 => {
            let reg = RegisterIndex::from_word_field(opcode & 7);
            let (result, new_flags) = alu::inc(cpu.regs.get_word(reg) as u32, Width::Word);
            apply_inc_dec_flags(cpu, new_flags);
            cpu.regs.set_word(reg, result as u16);
            StepOutcome::Normal
        }
        0x48..=0x4F => {
            let reg = RegisterIndex::from_word_field(opcode & 7);
            let (result, new_flags) = alu::dec(cpu.regs.get_word(reg) as u32, Width::Word);
            apply_inc_dec_flags(cpu, new_flags);
            cpu.regs.set_word(reg, result as u16);
            StepOutcome::Normal
        }
        0x50..=0x57 => {
            let reg = RegisterIndex::from_word_field(opcode & 7);
            let value = cpu.regs.get_word(reg);
            cpu.push_word(platform, value);
            StepOutcome::Normal
        }
        0x58..=0x5F => {
            let reg = RegisterIndex::from_word_field(opcode & 7);
            let value = cpu.pop_word(platform);
            cpu.regs.set_word(reg, value);
            StepOutcome::Normal
        }
        0x70..=0x7F => {
            if evaluate_condition(opcode & 0xF, cpu.flags) {
                jump_relative8(cpu, decoded.immediate as u8);
            }
            StepOutcome::Normal
        }
        0x80 | 0x81 | 0x83 => {
            let width = if opcode == 0x80 { Width::Byte } else { Width::Word };
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, seg_override, &cpu.regs);
            let a = rm_addr.read(width, &cpu.regs, platform).as_u32();
            let b = if opcode == 0x83 {
                sign_extend_byte_to_width(decoded.immediate as u8, width)
            } else {
                decoded.immediate
            };
            let group = modrm.reg;
            let (result, new_flags) = apply_alu(group, a, b, cpu.flags, width);
            apply_arith_flags(cpu, group, new_flags);
            if group != AluGroup::CMP {
                rm_addr.write(OperandValue::from_u32(width, result), &mut cpu.regs, platform);
            }
            StepOutcome::Normal
        }
        0x84 | 0x85 => {
            let width = width_of(opcode);
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, seg_override, &cpu.regs);
            let reg_addr = operand::reg_field_address(modrm, width);
            let a = rm_addr.read(width, &cpu.regs, platform).as_u32();
            let b = cpu.regs.get(reg_addr, width).as_u32();
            let (_, new_flags) = alu::and(a, b, width);
            apply_arith_flags(cpu, AluGroup::AND, new_flags);
            StepOutcome::Normal
        }
        0x86 | 0x87 => {
            let width = width_of(opcode);
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, seg_override, &cpu.regs);
            let reg_addr = operand::reg_field_address(modrm, width);
            let a = rm_addr.read(width, &cpu.regs, platform);
            let b = cpu.regs.get(reg_addr, width);
            rm_addr.write(b, &mut cpu.regs, platform);
            cpu.regs.set(reg_addr, a);
            StepOutcome::Normal
        }
        0x88..=0x8B => {
            let width = width_of(opcode);
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, seg_override, &cpu.regs);
            let reg_addr = operand::reg_field_address(modrm, width);
            if opcode < 0x8A {
                let value = cpu.regs.get(reg_addr, width);
                rm_addr.write(value, &mut cpu.regs, platform);
            } else {
                let value = rm_addr.read(width, &cpu.regs, platform);
                cpu.regs.set(reg_addr, value);
            }
            StepOutcome::Normal
        }
        0x8C => {
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, Width::Word, decoded.displacement, seg_override, &cpu.regs);
            let seg = operand::segment_field(modrm);
            let value = OperandValue::Word(cpu.regs.get_word(seg));
            rm_addr.write(value, &mut cpu.regs, platform);
            StepOutcome::Normal
        }
        0x8D => {
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, Width::Word, decoded.displacement, seg_override, &cpu.regs);
            let reg_addr = operand::reg_field_address(modrm, Width::Word);
            match rm_addr {
                OperandAddress::Memory(mem) => cpu.regs.set_word(reg_addr.index, mem.offset),
                OperandAddress::Register(_) => {}
            }
            StepOutcome::Normal
        }
        0x8E => {
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, Width::Word, decoded.displacement, seg_override, &cpu.regs);
            let seg = operand::segment_field(modrm);
            let value = rm_addr.read(Width::Word, &cpu.regs, platform);
            cpu.regs.set(RegisterAddress::word(seg), value);
            StepOutcome::Normal
        }
        0x8F => {
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, Width::Word, decoded.displacement, seg_override, &cpu.regs);
            let value = cpu.pop_word(platform);
            rm_addr.write(OperandValue::Word(value), &mut cpu.regs, platform);
            StepOutcome::Normal
        }
        0x90 => StepOutcome::Normal,
        0x91..=0x97 => {
            let reg = RegisterIndex::from_word_field(opcode & 7);
            let ax = cpu.regs.get_word(RegisterIndex::Ax);
            let other = cpu.regs.get_word(reg);
            cpu.regs.set_word(RegisterIndex::Ax, other);
            cpu.regs.set_word(reg, ax);
            StepOutcome::Normal
        }
        0x98 => {
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            cpu.regs.set_word(RegisterIndex::Ax, (al as i8) as i16 as u16);
            StepOutcome::Normal
        }
        0x99 => {
            let ax = cpu.regs.get_word(RegisterIndex::Ax);
            let dx = if (ax as i16) < 0 { 0xFFFF } else { 0 };
            cpu.regs.set_word(RegisterIndex::Dx, dx);
            StepOutcome::Normal
        }
        0x9A => {
            let new_cs = (decoded.immediate >> 16) as u16;
            let new_ip = (decoded.immediate & 0xFFFF) as u16;
            let ret_cs = cpu.regs.get_word(RegisterIndex::Cs);
            cpu.push_word(platform, ret_cs);
            cpu.push_word(platform, cpu.regs.ip);
            cpu.regs.set_word(RegisterIndex::Cs, new_cs);
            cpu.regs.ip = new_ip;
            StepOutcome::Normal
        }
        0x9B => StepOutcome::Normal,
        0x9C => {
            let word = cpu.flags.to_word();
            cpu.push_word(platform, word);
            StepOutcome::Normal
        }
        0x9D => {
            let word = cpu.pop_word(platform);
            cpu.flags = Flags::from_word(word);
            StepOutcome::Normal
        }
        0x9E => {
            let ah = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: true });
            cpu.flags = Flags::from_word((cpu.flags.to_word() & 0xFF00) | ah as u16);
            StepOutcome::Normal
        }
        0x9F => {
            let ah = (cpu.flags.to_word() & 0xFF) as u8;
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, ah);
            StepOutcome::Normal
        }
        0xA0..=0xA3 => {
            let width = if opcode == 0xA0 || opcode == 0xA2 { Width::Byte } else { Width::Word };
            let segment = seg_override.unwrap_or(RegisterIndex::Ds);
            let mem = MemoryAddress { segment, offset: decoded.immediate as u16 };
            let addr = OperandAddress::Memory(mem);
            if opcode < 0xA2 {
                let value = addr.read(width, &cpu.regs, platform);
                match width {
                    Width::Byte => cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, match value { OperandValue::Byte(b) => b, _ => 0 }),
                    Width::Word => cpu.regs.set_word(RegisterIndex::Ax, match value { OperandValue::Word(w) => w, _ => 0 }),
                }
            } else {
                let value = match width {
                    Width::Byte => OperandValue::Byte(cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false })),
                    Width::Word => OperandValue::Word(cpu.regs.get_word(RegisterIndex::Ax)),
                };
                addr.write(value, &mut cpu.regs, platform);
            }
            StepOutcome::Normal
        }
        0xA4 | 0xA5 => string_op(cpu, platform, decoded, StringOp::Movs),
        0xA6 | 0xA7 => string_op(cpu, platform, decoded, StringOp::Cmps),
        0xA8 | 0xA9 => {
            let width = width_of(opcode);
            let a = match width {
                Width::Byte => cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }) as u32,
                Width::Word => cpu.regs.get_word(RegisterIndex::Ax) as u32,
            };
            let (_, new_flags) = alu::and(a, decoded.immediate, width);
            apply_arith_flags(cpu, AluGroup::AND, new_flags);
            StepOutcome::Normal
        }
        0xAA | 0xAB => string_op(cpu, platform, decoded, StringOp::Stos),
        0xAC | 0xAD => string_op(cpu, platform, decoded, StringOp::Lods),
        0xAE | 0xAF => string_op(cpu, platform, decoded, StringOp::Scas),
        0xB0..=0xB7 => {
            let addr = RegisterIndex::from_byte_field(opcode & 7);
            cpu.regs.set_byte(addr, decoded.immediate as u8);
            StepOutcome::Normal
        }
        0xB8..=0xBF => {
            let reg = RegisterIndex::from_word_field(opcode & 7);
            cpu.regs.set_word(reg, decoded.immediate as u16);
            StepOutcome::Normal
        }
        0xC2 | 0xC3 => {
            let ip = cpu.pop_word(platform);
            cpu.regs.ip = ip;
            if opcode == 0xC2 {
                let sp = cpu.regs.get_word(RegisterIndex::Sp).wrapping_add(decoded.immediate as u16);
                cpu.regs.set_word(RegisterIndex::Sp, sp);
            }
            StepOutcome::Normal
        }
        0xC4 | 0xC5 => {
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, Width::Word, decoded.displacement, seg_override, &cpu.regs);
            if let OperandAddress::Memory(mem) = rm_addr {
                let phys = mem.physical(&cpu.regs);
                let offset = platform.memory.read_word(phys);
                let segment = platform.memory.read_word(phys.wrapping_add(2) & 0xF_FFFF);
                let reg_addr = operand::reg_field_address(modrm, Width::Word);
                cpu.regs.set_word(reg_addr.index, offset);
                let seg_reg = if opcode == 0xC4 { RegisterIndex::Es } else { RegisterIndex::Ds };
                cpu.regs.set_word(seg_reg, segment);
            }
            StepOutcome::Normal
        }
        0xC6 | 0xC7 => {
            let width = width_of(opcode);
            let modrm = modrm.unwrap();
            let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, seg_override, &cpu.regs);
            rm_addr.write(OperandValue::from_u32(width, decoded.immediate), &mut cpu.regs, platform);
            StepOutcome::Normal
        }
        0xCA | 0xCB => {
            let ip = cpu.pop_word(platform);
            let cs = cpu.pop_word(platform);
            cpu.regs.ip = ip;
            cpu.regs.set_word(RegisterIndex::Cs, cs);
            if opcode == 0xCA {
                let sp = cpu.regs.get_word(RegisterIndex::Sp).wrapping_add(decoded.immediate as u16);
                cpu.regs.set_word(RegisterIndex::Sp, sp);
            }
            StepOutcome::Normal
        }
        0xCC => StepOutcome::SoftwareInterrupt(3),
        0xCD => StepOutcome::SoftwareInterrupt(decoded.immediate as u8),
        0xCE => {
            if cpu.flags.get(Flags::OF) {
                StepOutcome::Into
            } else {
                StepOutcome::Normal
            }
        }
        0xCF => {
            cpu.iret(platform);
            StepOutcome::Normal
        }
        0xD0..=0xD3 => execute_shift_group(cpu, platform, decoded, opcode),
        0xD4 => {
            let imm = decoded.immediate as u8;
            if imm == 0 {
                return StepOutcome::DivideByZero;
            }
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            let (new_al, new_ah, flags) = bcd::aam(al, imm);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, new_al);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, new_ah);
            apply_arith_flags(cpu, AluGroup::AND, flags);
            StepOutcome::Normal
        }
        0xD5 => {
            let imm = decoded.immediate as u8;
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            let ah = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: true });
            let (new_al, flags) = bcd::aad(al, ah, imm);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, new_al);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, 0);
            apply_arith_flags(cpu, AluGroup::AND, flags);
            StepOutcome::Normal
        }
        0xE0..=0xE3 => {
            let cx = cpu.regs.get_word(RegisterIndex::Cx);
            let take = match opcode {
                0xE0 => {
                    let new_cx = cx.wrapping_sub(1);
                    cpu.regs.set_word(RegisterIndex::Cx, new_cx);
                    new_cx != 0 && !cpu.flags.get(Flags::ZF)
                }
                0xE1 => {
                    let new_cx = cx.wrapping_sub(1);
                    cpu.regs.set_word(RegisterIndex::Cx, new_cx);
                    new_cx != 0 && cpu.flags.get(Flags::ZF)
                }
                0xE2 => {
                    let new_cx = cx.wrapping_sub(1);
                    cpu.regs.set_word(RegisterIndex::Cx, new_cx);
                    new_cx != 0
                }
                0xE3 => cx == 0,
                _ => unreachable!(),
            };
            if take {
                jump_relative8(cpu, decoded.immediate as u8);
            }
            StepOutcome::Normal
        }
        0xE4 => {
            let value = platform.ports.read_byte(decoded.immediate as u16);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, value);
            StepOutcome::Normal
        }
        0xE5 => {
            let port = decoded.immediate as u16;
            let lo = platform.ports.read_byte(port) as u16;
            let hi = platform.ports.read_byte(port.wrapping_add(1)) as u16;
            cpu.regs.set_word(RegisterIndex::Ax, lo | (hi << 8));
            StepOutcome::Normal
        }
        0xE6 => {
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            platform.ports.write_byte(decoded.immediate as u16, al);
            StepOutcome::Normal
        }
        0xE7 => {
            let port = decoded.immediate as u16;
            let ax = cpu.regs.get_word(RegisterIndex::Ax);
            platform.ports.write_byte(port, (ax & 0xFF) as u8);
            platform.ports.write_byte(port.wrapping_add(1), (ax >> 8) as u8);
            StepOutcome::Normal
        }
        0xE8 => {
            cpu.push_word(platform, cpu.regs.ip);
            jump_relative16(cpu, decoded.immediate as u16);
            StepOutcome::Normal
        }
        0xE9 => {
            jump_relative16(cpu, decoded.immediate as u16);
            StepOutcome::Normal
        }
        0xEA => {
            let new_cs = (decoded.immediate >> 16) as u16;
            let new_ip = (decoded.immediate & 0xFFFF) as u16;
            cpu.regs.set_word(RegisterIndex::Cs, new_cs);
            cpu.regs.ip = new_ip;
            StepOutcome::Normal
        }
        0xEB => {
            jump_relative8(cpu, decoded.immediate as u8);
            StepOutcome::Normal
        }
        0xEC => {
            let port = cpu.regs.get_word(RegisterIndex::Dx);
            let value = platform.ports.read_byte(port);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, value);
            StepOutcome::Normal
        }
        0xED => {
            let port = cpu.regs.get_word(RegisterIndex::Dx);
            let lo = platform.ports.read_byte(port) as u16;
            let hi = platform.ports.read_byte(port.wrapping_add(1)) as u16;
            cpu.regs.set_word(RegisterIndex::Ax, lo | (hi << 8));
            StepOutcome::Normal
        }
        0xEE => {
            let port = cpu.regs.get_word(RegisterIndex::Dx);
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            platform.ports.write_byte(port, al);
            StepOutcome::Normal
        }
        0xEF => {
            let port = cpu.regs.get_word(RegisterIndex::Dx);
            let ax = cpu.regs.get_word(RegisterIndex::Ax);
            platform.ports.write_byte(port, (ax & 0xFF) as u8);
            platform.ports.write_byte(port.wrapping_add(1), (ax >> 8) as u8);
            StepOutcome::Normal
        }
        0xF4 => StepOutcome::Halt,
        0xF5 => {
            let cf = cpu.flags.get(Flags::CF);
            cpu.flags.set_flag(Flags::CF, !cf);
            StepOutcome::Normal
        }
        0xF6 | 0xF7 => execute_group3(cpu, platform, decoded, opcode),
        0xF8 => {
            cpu.flags.set_flag(Flags::CF, false);
            StepOutcome::Normal
        }
        0xF9 => {
            cpu.flags.set_flag(Flags::CF, true);
            StepOutcome::Normal
        }
        0xFA => {
            cpu.flags.set_flag(Flags::IF, false);
            StepOutcome::Normal
        }
        0xFB => {
            cpu.flags.set_flag(Flags::IF, true);
            StepOutcome::Normal
        }
        0xFC => {
            cpu.flags.set_flag(Flags::DF, false);
            StepOutcome::Normal
        }
        0xFD => {
            cpu.flags.set_flag(Flags::DF, true);
            StepOutcome::Normal
        }
        0xFE => execute_group4(cpu, platform, decoded),
        0xFF => execute_group5(cpu, platform, decoded),
        _ => StepOutcome::InvalidOpcode,
    }
}

fn jump_relative8(cpu: &mut Cpu, rel: u8) {
    cpu.regs.ip = cpu.regs.ip.wrapping_add((rel as i8) as i16 as u16);
}

fn jump_relative16(cpu: &mut Cpu, rel: u16) {
    cpu.regs.ip = cpu.regs.ip.wrapping_add(rel);
}

fn apply_arith_flags(cpu: &mut Cpu, group: u8, new_flags: Flags) {
    match group {
        AluGroup::OR | AluGroup::AND | AluGroup::XOR => {
            cpu.flags.set_flag(Flags::CF, new_flags.get(Flags::CF));
            cpu.flags.set_flag(Flags::OF, new_flags.get(Flags::OF));
            cpu.flags.set_flag(Flags::ZF, new_flags.get(Flags::ZF));
            cpu.flags.set_flag(Flags::SF, new_flags.get(Flags::SF));
            cpu.flags.set_flag(Flags::PF, new_flags.get(Flags::PF));
        }
        _ => {
            cpu.flags.set_flag(Flags::CF, new_flags.get(Flags::CF));
            cpu.flags.set_flag(Flags::OF, new_flags.get(Flags::OF));
            cpu.flags.set_flag(Flags::AF, new_flags.get(Flags::AF));
            cpu.flags.set_flag(Flags::ZF, new_flags.get(Flags::ZF));
            cpu.flags.set_flag(Flags::SF, new_flags.get(Flags::SF));
            cpu.flags.set_flag(Flags::PF, new_flags.get(Flags::PF));
        }
    }
}

fn apply_inc_dec_flags(cpu: &mut Cpu, new_flags: Flags) {
    // INC/DEC leave CF untouched.
    cpu.flags.set_flag(Flags::OF, new_flags.get(Flags::OF));
    cpu.flags.set_flag(Flags::AF, new_flags.get(Flags::AF));
    cpu.flags.set_flag(Flags::ZF, new_flags.get(Flags::ZF));
    cpu.flags.set_flag(Flags::SF, new_flags.get(Flags::SF));
    cpu.flags.set_flag(Flags::PF, new_flags.get(Flags::PF));
}

fn execute_alu_special(cpu: &mut Cpu, platform: &mut Platform, group: u8, opcode: u8) -> StepOutcome {
    match group {
        AluGroup::ADD | AluGroup::ADC | AluGroup::SBB => {
            let seg = match group {
                AluGroup::ADD => RegisterIndex::Es,
                AluGroup::ADC => RegisterIndex::Ss,
                AluGroup::SBB => RegisterIndex::Ds,
                _ => unreachable!(),
            };
            if opcode % 8 == 6 {
                let value = cpu.regs.get_word(seg);
                cpu.push_word(platform, value);
            } else {
                let value = cpu.pop_word(platform);
                cpu.regs.set_word(seg, value);
            }
            StepOutcome::Normal
        }
        AluGroup::OR => {
            if opcode == 0x0E {
                let value = cpu.regs.get_word(RegisterIndex::Cs);
                cpu.push_word(platform, value);
            } else {
                let value = cpu.pop_word(platform);
                cpu.regs.set_word(RegisterIndex::Cs, value);
            }
            StepOutcome::Normal
        }
        AluGroup::AND => {
            // 0x27 DAA (0x26 is the ES prefix, filtered during fetch).
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            let (result, flags) = bcd::daa(al, cpu.flags.get(Flags::AF), cpu.flags.get(Flags::CF));
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, result);
            apply_arith_flags(cpu, AluGroup::ADD, flags);
            StepOutcome::Normal
        }
        AluGroup::SUB => {
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            let (result, flags) = bcd::das(al, cpu.flags.get(Flags::AF), cpu.flags.get(Flags::CF));
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, result);
            apply_arith_flags(cpu, AluGroup::ADD, flags);
            StepOutcome::Normal
        }
        AluGroup::XOR => {
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            let ah = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: true });
            let (new_al, new_ah, flags) = bcd::aaa(al, ah, cpu.flags.get(Flags::AF));
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, new_al);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, new_ah);
            apply_arith_flags(cpu, AluGroup::ADD, flags);
            StepOutcome::Normal
        }
        AluGroup::CMP => {
            let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false });
            let ah = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: true });
            let (new_al, new_ah, flags) = bcd::aas(al, ah, cpu.flags.get(Flags::AF));
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, new_al);
            cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, new_ah);
            apply_arith_flags(cpu, AluGroup::ADD, flags);
            StepOutcome::Normal
        }
        _ => StepOutcome::InvalidOpcode,
    }
}

fn execute_shift_group(cpu: &mut Cpu, platform: &mut Platform, decoded: &DecodedInstruction, opcode: u8) -> StepOutcome {
    let width = if opcode % 2 == 0 { Width::Byte } else { Width::Word };
    let modrm = decoded.modrm.unwrap();
    let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, decoded.segment_override(), &cpu.regs);
    let count = if opcode < 0xD2 {
        1
    } else {
        cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Cx, high: false })
    };
    let op = match modrm.reg {
        0 => ShiftOp::Rol,
        1 => ShiftOp::Ror,
        2 => ShiftOp::Rcl,
        3 => ShiftOp::Rcr,
        4 | 6 => ShiftOp::Shl,
        5 => ShiftOp::Shr,
        7 => ShiftOp::Sar,
        _ => unreachable!(),
    };
    let a = rm_addr.read(width, &cpu.regs, platform).as_u32();
    let carry_in = cpu.flags.get(Flags::CF);
    let (result, new_flags, of_defined) = alu::shift(op, a, count, carry_in, width);
    if count != 0 {
        match op {
            ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr => {
                cpu.flags.set_flag(Flags::CF, new_flags.get(Flags::CF));
            }
            _ => apply_arith_flags(cpu, AluGroup::ADD, new_flags),
        }
        if of_defined {
            cpu.flags.set_flag(Flags::OF, new_flags.get(Flags::OF));
        }
        rm_addr.write(OperandValue::from_u32(width, result), &mut cpu.regs, platform);
    }
    StepOutcome::Normal
}

fn execute_group3(cpu: &mut Cpu, platform: &mut Platform, decoded: &DecodedInstruction, opcode: u8) -> StepOutcome {
    let width = width_of(opcode);
    let modrm = decoded.modrm.unwrap();
    let rm_addr = operand::resolve_rm(modrm, width, decoded.displacement, decoded.segment_override(), &cpu.regs);
    let a = rm_addr.read(width, &cpu.regs, platform).as_u32();
    match modrm.reg {
        0 | 1 => {
            // TEST r/m, imm. decode::fetch special-cases F6/F7 reg 0/1 to
            // read this immediate even though the flat opcode table can't
            // express a reg-dependent size.
            let (_, new_flags) = alu::and(a, decoded.immediate, width);
            apply_arith_flags(cpu, AluGroup::AND, new_flags);
            StepOutcome::Normal
        }
        2 => {
            rm_addr.write(OperandValue::from_u32(width, alu::not(a, width)), &mut cpu.regs, platform);
            StepOutcome::Normal
        }
        3 => {
            let (result, flags) = alu::neg(a, width);
            apply_arith_flags(cpu, AluGroup::SUB, flags);
            rm_addr.write(OperandValue::from_u32(width, result), &mut cpu.regs, platform);
            StepOutcome::Normal
        }
        4 => {
            // MUL: unsigned AL*r/m8 -> AX, or AX*r/m16 -> DX:AX.
            match width {
                Width::Byte => {
                    let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }) as u32;
                    let product = al * a;
                    cpu.regs.set_word(RegisterIndex::Ax, product as u16);
                    let overflow = product > 0xFF;
                    cpu.flags.set_flag(Flags::CF, overflow);
                    cpu.flags.set_flag(Flags::OF, overflow);
                }
                Width::Word => {
                    let ax = cpu.regs.get_word(RegisterIndex::Ax) as u32;
                    let product = ax * a;
                    cpu.regs.set_word(RegisterIndex::Ax, product as u16);
                    cpu.regs.set_word(RegisterIndex::Dx, (product >> 16) as u16);
                    let overflow = product > 0xFFFF;
                    cpu.flags.set_flag(Flags::CF, overflow);
                    cpu.flags.set_flag(Flags::OF, overflow);
                }
            }
            StepOutcome::Normal
        }
        5 => {
            match width {
                Width::Byte => {
                    let al = cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }) as i8 as i32;
                    let rhs = a as i8 as i32;
                    let product = al * rhs;
                    cpu.regs.set_word(RegisterIndex::Ax, (product as u16 as u32 & 0xFFFF) as u16);
                    let overflow = product < i8::MIN as i32 || product > i8::MAX as i32;
                    cpu.flags.set_flag(Flags::CF, overflow);
                    cpu.flags.set_flag(Flags::OF, overflow);
                }
                Width::Word => {
                    let ax = cpu.regs.get_word(RegisterIndex::Ax) as i16 as i32;
                    let rhs = a as i16 as i32;
                    let product = ax * rhs;
                    cpu.regs.set_word(RegisterIndex::Ax, product as u16);
                    cpu.regs.set_word(RegisterIndex::Dx, (product >> 16) as u16);
                    let overflow = product < i16::MIN as i32 || product > i16::MAX as i32;
                    cpu.flags.set_flag(Flags::CF, overflow);
                    cpu.flags.set_flag(Flags::OF, overflow);
                }
            }
            StepOutcome::Normal
        }
        6 => {
            if a == 0 {
                return StepOutcome::DivideByZero;
            }
            match width {
                Width::Byte => {
                    let ax = cpu.regs.get_word(RegisterIndex::Ax) as u32;
                    let quotient = ax / a;
                    if quotient > 0xFF {
                        return StepOutcome::DivideByZero;
                    }
                    let remainder = ax % a;
                    cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, quotient as u8);
                    cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, remainder as u8);
                }
                Width::Word => {
                    let dx = cpu.regs.get_word(RegisterIndex::Dx) as u32;
                    let ax = cpu.regs.get_word(RegisterIndex::Ax) as u32;
                    let dividend = (dx << 16) | ax;
                    let quotient = dividend / a;
                    if quotient > 0xFFFF {
                        return StepOutcome::DivideByZero;
                    }
                    let remainder = dividend % a;
                    cpu.regs.set_word(RegisterIndex::Ax, quotient as u16);
                    cpu.regs.set_word(RegisterIndex::Dx, remainder as u16);
                }
            }
            StepOutcome::Normal
        }
        7 => {
            if a == 0 {
                return StepOutcome::DivideByZero;
            }
            match width {
                Width::Byte => {
                    let ax = cpu.regs.get_word(RegisterIndex::Ax) as i16 as i32;
                    let divisor = a as i8 as i32;
                    let quotient = ax / divisor;
                    if quotient < i8::MIN as i32 || quotient > i8::MAX as i32 {
                        return StepOutcome::DivideByZero;
                    }
                    let remainder = ax % divisor;
                    cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, quotient as u8);
                    cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, remainder as u8);
                }
                Width::Word => {
                    let dx = cpu.regs.get_word(RegisterIndex::Dx) as u32;
                    let ax = cpu.regs.get_word(RegisterIndex::Ax) as u32;
                    let dividend = ((dx << 16) | ax) as i32;
                    let divisor = a as i16 as i32;
                    let quotient = dividend / divisor;
                    if quotient < i16::MIN as i32 || quotient > i16::MAX as i32 {
                        return StepOutcome::DivideByZero;
                    }
                    let remainder = dividend % divisor;
                    cpu.regs.set_word(RegisterIndex::Ax, quotient as u16);
                    cpu.regs.set_word(RegisterIndex::Dx, remainder as u16);
                }
            }
            StepOutcome::Normal
        }
        _ => StepOutcome::InvalidOpcode,
    }
}

fn execute_group4(cpu: &mut Cpu, platform: &mut Platform, decoded: &DecodedInstruction) -> StepOutcome {
    let modrm = decoded.modrm.unwrap();
    let rm_addr = operand::resolve_rm(modrm, Width::Byte, decoded.displacement, decoded.segment_override(), &cpu.regs);
    let a = rm_addr.read(Width::Byte, &cpu.regs, platform).as_u32();
    match modrm.reg {
        0 => {
            let (result, flags) = alu::inc(a, Width::Byte);
            apply_inc_dec_flags(cpu, flags);
            rm_addr.write(OperandValue::Byte(result as u8), &mut cpu.regs, platform);
        }
        1 => {
            let (result, flags) = alu::dec(a, Width::Byte);
            apply_inc_dec_flags(cpu, flags);
            rm_addr.write(OperandValue::Byte(result as u8), &mut cpu.regs, platform);
        }
        _ => return StepOutcome::InvalidOpcode,
    }
    StepOutcome::Normal
}

fn execute_group5(cpu: &mut Cpu, platform: &mut Platform, decoded: &DecodedInstruction) -> StepOutcome {
    let modrm = decoded.modrm.unwrap();
    let rm_addr = operand::resolve_rm(modrm, Width::Word, decoded.displacement, decoded.segment_override(), &cpu.regs);
    match modrm.reg {
        0 => {
            let a = rm_addr.read(Width::Word, &cpu.regs, platform).as_u32();
            let (result, flags) = alu::inc(a, Width::Word);
            apply_inc_dec_flags(cpu, flags);
            rm_addr.write(OperandValue::Word(result as u16), &mut cpu.regs, platform);
        }
        1 => {
            let a = rm_addr.read(Width::Word, &cpu.regs, platform).as_u32();
            let (result, flags) = alu::dec(a, Width::Word);
            apply_inc_dec_flags(cpu, flags);
            rm_addr.write(OperandValue::Word(result as u16), &mut cpu.regs, platform);
        }
        2 => {
            // CALL r/m16 (near, indirect).
            let target = rm_addr.read(Width::Word, &cpu.regs, platform);
            if let OperandValue::Word(target) = target {
                cpu.push_word(platform, cpu.regs.ip);
                cpu.regs.ip = target;
            }
        }
        3 => {
            // CALL FAR [m16:16], indirect through memory only.
            if let OperandAddress::Memory(mem) = rm_addr {
                let phys = mem.physical(&cpu.regs);
                let offset = platform.memory.read_word(phys);
                let segment = platform.memory.read_word(phys.wrapping_add(2) & 0xF_FFFF);
                let ret_cs = cpu.regs.get_word(RegisterIndex::Cs);
                cpu.push_word(platform, ret_cs);
                cpu.push_word(platform, cpu.regs.ip);
                cpu.regs.set_word(RegisterIndex::Cs, segment);
                cpu.regs.ip = offset;
            }
        }
        4 => {
            let target = rm_addr.read(Width::Word, &cpu.regs, platform);
            if let OperandValue::Word(target) = target {
                cpu.regs.ip = target;
            }
        }
        5 => {
            // JMP FAR [m16:16], indirect through memory only.
            if let OperandAddress::Memory(mem) = rm_addr {
                let phys = mem.physical(&cpu.regs);
                let offset = platform.memory.read_word(phys);
                let segment = platform.memory.read_word(phys.wrapping_add(2) & 0xF_FFFF);
                cpu.regs.set_word(RegisterIndex::Cs, segment);
                cpu.regs.ip = offset;
            }
        }
        6 => {
            let value = rm_addr.read(Width::Word, &cpu.regs, platform);
            cpu.push_word(platform, value.as_u32() as u16);
        }
        _ => return StepOutcome::InvalidOpcode,
    }
    StepOutcome::Normal
}

enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

fn string_op(cpu: &mut Cpu, platform: &mut Platform, decoded: &DecodedInstruction, op: StringOp) -> StepOutcome {
    let width = width_of(decoded.opcode);
    let step: i16 = if cpu.flags.get(Flags::DF) { -(width.num_bytes() as i16) } else { width.num_bytes() as i16 };
    let repeated = decoded.has_prefix(Prefix::Rep) || decoded.has_prefix(Prefix::Repne);
    let repeat_while_zf = decoded.has_prefix(Prefix::Rep);
    let is_compare = matches!(op, StringOp::Cmps | StringOp::Scas);

    loop {
        if repeated {
            let cx = cpu.regs.get_word(RegisterIndex::Cx);
            if cx == 0 {
                break;
            }
        }

        let src_seg = decoded.segment_override().unwrap_or(RegisterIndex::Ds);
        let si = cpu.regs.get_word(RegisterIndex::Si);
        let di = cpu.regs.get_word(RegisterIndex::Di);

        match op {
            StringOp::Movs => {
                let value = OperandAddress::Memory(MemoryAddress { segment: src_seg, offset: si })
                    .read(width, &cpu.regs, platform);
                OperandAddress::Memory(MemoryAddress { segment: RegisterIndex::Es, offset: di })
                    .write(value, &mut cpu.regs, platform);
                cpu.regs.set_word(RegisterIndex::Si, si.wrapping_add(step as u16));
                cpu.regs.set_word(RegisterIndex::Di, di.wrapping_add(step as u16));
            }
            StringOp::Cmps => {
                let a = OperandAddress::Memory(MemoryAddress { segment: src_seg, offset: si })
                    .read(width, &cpu.regs, platform)
                    .as_u32();
                let b = OperandAddress::Memory(MemoryAddress { segment: RegisterIndex::Es, offset: di })
                    .read(width, &cpu.regs, platform)
                    .as_u32();
                let (_, flags) = alu::sub(a, b, false, width);
                apply_arith_flags(cpu, AluGroup::SUB, flags);
                cpu.regs.set_word(RegisterIndex::Si, si.wrapping_add(step as u16));
                cpu.regs.set_word(RegisterIndex::Di, di.wrapping_add(step as u16));
            }
            StringOp::Stos => {
                let value = match width {
                    Width::Byte => OperandValue::Byte(cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false })),
                    Width::Word => OperandValue::Word(cpu.regs.get_word(RegisterIndex::Ax)),
                };
                OperandAddress::Memory(MemoryAddress { segment: RegisterIndex::Es, offset: di })
                    .write(value, &mut cpu.regs, platform);
                cpu.regs.set_word(RegisterIndex::Di, di.wrapping_add(step as u16));
            }
            StringOp::Lods => {
                let value = OperandAddress::Memory(MemoryAddress { segment: src_seg, offset: si })
                    .read(width, &cpu.regs, platform);
                match value {
                    OperandValue::Byte(b) => cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, b),
                    OperandValue::Word(w) => cpu.regs.set_word(RegisterIndex::Ax, w),
                }
                cpu.regs.set_word(RegisterIndex::Si, si.wrapping_add(step as u16));
            }
            StringOp::Scas => {
                let al = match width {
                    Width::Byte => cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }) as u32,
                    Width::Word => cpu.regs.get_word(RegisterIndex::Ax) as u32,
                };
                let mem = OperandAddress::Memory(MemoryAddress { segment: RegisterIndex::Es, offset: di })
                    .read(width, &cpu.regs, platform)
                    .as_u32();
                let (_, flags) = alu::sub(al, mem, false, width);
                apply_arith_flags(cpu, AluGroup::SUB, flags);
                cpu.regs.set_word(RegisterIndex::Di, di.wrapping_add(step as u16));
            }
        }

        if repeated {
            let cx = cpu.regs.get_word(RegisterIndex::Cx).wrapping_sub(1);
            cpu.regs.set_word(RegisterIndex::Cx, cx);
            if cx == 0 {
                break;
            }
            if is_compare {
                let zf = cpu.flags.get(Flags::ZF);
                if repeat_while_zf && !zf {
                    break;
                }
                if !repeat_while_zf && zf {
                    break;
                }
            }
        } else {
            break;
        }
    }
    StepOutcome::Normal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{DeviceKind, MemoryDevice};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Default)]
    struct RamStub {
        mem: HashMap<u32, u8>,
    }
    impl MemoryDevice for RamStub {
        fn read_byte(&mut self, address: u32) -> u8 {
            *self.mem.get(&address).unwrap_or(&0)
        }
        fn write_byte(&mut self, address: u32, value: u8) {
            self.mem.insert(address, value);
        }
    }

    fn platform_with_ram() -> Platform {
        let mut platform = Platform::new();
        let ram: Rc<RefCell<dyn MemoryDevice>> = Rc::new(RefCell::new(RamStub::default()));
        platform.memory.register(DeviceKind::Ram, 0, 0xF_FFFF, ram).unwrap();
        platform
    }

    fn load(platform: &Platform, addr: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            platform.memory.write_byte(addr + i as u32, *b);
        }
    }

    #[test]
    fn mov_ax_immediate() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        load(&platform, 0, &[0xB8, 0x34, 0x12]); // MOV AX, 0x1234
        cpu.step_instruction(&mut platform);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Ax), 0x1234);
        assert_eq!(cpu.regs.ip, 3);
    }

    #[test]
    fn add_mem_reg_sets_carry_and_adjust() {
        // mirrors the documented ADD [BX],CX overflow case: 0x1234 + 0xEFFF
        // wraps to 0x0233 with CF and AF set.
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        cpu.regs.set_word(RegisterIndex::Bx, 0x0100);
        cpu.regs.set_word(RegisterIndex::Cx, 0xEFFF);
        platform.memory.write_word(0x0100, 0x1234);
        load(&platform, 0, &[0x01, 0x0F]); // ADD [BX], CX
        cpu.step_instruction(&mut platform);
        assert_eq!(platform.memory.read_word(0x0100), 0x0233);
        assert!(cpu.flags.get(Flags::CF));
        assert!(cpu.flags.get(Flags::AF));
    }

    #[test]
    fn conditional_jump_taken_on_zero() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        cpu.flags.set_flag(Flags::ZF, true);
        load(&platform, 0, &[0x74, 0x05]); // JZ +5
        cpu.step_instruction(&mut platform);
        assert_eq!(cpu.regs.ip, 7);
    }

    #[test]
    fn div_by_zero_is_reported() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        cpu.regs.set_word(RegisterIndex::Ax, 0x0010);
        cpu.regs.set_word(RegisterIndex::Dx, 0x0000);
        // DIV CL with CL = 0 -> F6 /6, modrm = 11 110 001 (mod=3,reg=6,rm=1)
        load(&platform, 0, &[0xF6, 0xF1]);
        let outcome = cpu.step_instruction(&mut platform);
        assert_eq!(outcome, StepOutcome::DivideByZero);
    }

    #[test]
    fn aam_splits_al_into_tens_and_units() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, 30);
        load(&platform, 0, &[0xD4, 0x0A]); // AAM
        let outcome = cpu.step_instruction(&mut platform);
        assert_eq!(outcome, StepOutcome::Normal);
        assert_eq!(cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }), 3);
        assert_eq!(cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }), 0);
    }

    #[test]
    fn aam_by_zero_is_reported_as_divide_by_zero() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        load(&platform, 0, &[0xD4, 0x00]); // AAM with imm=0
        let outcome = cpu.step_instruction(&mut platform);
        assert_eq!(outcome, StepOutcome::DivideByZero);
    }

    #[test]
    fn aad_combines_ah_and_al_into_al() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }, 3);
        cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Ax, high: false }, 0);
        load(&platform, 0, &[0xD5, 0x0A]); // AAD
        let outcome = cpu.step_instruction(&mut platform);
        assert_eq!(outcome, StepOutcome::Normal);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Ax), 30);
        assert_eq!(cpu.regs.get_byte(RegisterAddress { index: RegisterIndex::Ax, high: true }), 0);
    }

    #[test]
    fn shl_ax_cl_with_count_past_width_does_not_panic() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        cpu.regs.set_word(RegisterIndex::Ax, 0x00FF);
        cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Cx, high: false }, 200);
        // SHL AX, CL -> D3 /4, modrm = 11 100 000
        load(&platform, 0, &[0xD3, 0xE0]);
        let outcome = cpu.step_instruction(&mut platform);
        assert_eq!(outcome, StepOutcome::Normal);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Ax), 0);
    }

    #[test]
    fn sar_ax_cl_with_count_past_width_does_not_panic() {
        let mut cpu = Cpu::new();
        let mut platform = platform_with_ram();
        cpu.regs.set_word(RegisterIndex::Ax, 0x8000);
        cpu.regs.set_byte(RegisterAddress { index: RegisterIndex::Cx, high: false }, 200);
        // SAR AX, CL -> D3 /7, modrm = 11 111 000
        load(&platform, 0, &[0xD3, 0xF8]);
        let outcome = cpu.step_instruction(&mut platform);
        assert_eq!(outcome, StepOutcome::Normal);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Ax), 0xFFFF);
    }
}
