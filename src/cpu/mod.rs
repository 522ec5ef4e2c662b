//! The 8086/8088 CPU core: fetch, decode, execute, and interrupt entry/exit.
//! Generalizes the teacher's `processor.rs` (register file, `clock_cycle`
//! main step, interrupt servicing) from the 68k's 32-bit register/supervisor
//! model to the 8086's segmented 16-bit one.

pub mod alu;
pub mod bcd;
pub mod decode;
pub mod flags;
pub mod operand;
pub mod registers;
pub mod width;

use crate::cpu::decode::{fetch, DecodeFailure, DecodedInstruction, OpcodeInfo};
use crate::cpu::flags::Flags;
use crate::cpu::operand::MemoryAddress;
use crate::cpu::registers::{RegisterIndex, Registers};
use crate::platform::Platform;
use log::trace;

mod execute;
pub use execute::StepOutcome;

pub struct Cpu {
    pub regs: Registers,
    pub flags: Flags,
    pub halted: bool,
    table: [OpcodeInfo; 256],
    pub last_instruction: Option<DecodedInstruction>,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            flags: Flags::default(),
            halted: false,
            table: execute::build_opcode_table(),
            last_instruction: None,
        }
    }

    pub fn reset(&mut self, cs: u16, ip: u16) {
        self.regs = Registers::new();
        self.regs.set_word(RegisterIndex::Cs, cs);
        self.regs.ip = ip;
        self.flags = Flags::default();
        self.halted = false;
    }

    fn stack_address(&self, offset: u16) -> MemoryAddress {
        MemoryAddress { segment: RegisterIndex::Ss, offset }
    }

    pub fn push_word(&mut self, platform: &mut Platform, value: u16) {
        let sp = self.regs.get_word(RegisterIndex::Sp).wrapping_sub(2);
        self.regs.set_word(RegisterIndex::Sp, sp);
        let phys = self.stack_address(sp).physical(&self.regs);
        platform.memory.write_word(phys, value);
    }

    pub fn pop_word(&mut self, platform: &Platform) -> u16 {
        let sp = self.regs.get_word(RegisterIndex::Sp);
        let phys = self.stack_address(sp).physical(&self.regs);
        let value = platform.memory.read_word(phys);
        self.regs.set_word(RegisterIndex::Sp, sp.wrapping_add(2));
        value
    }

    /// `INT n` / hardware-vectored entry: push FLAGS, CS, IP; clear IF and
    /// TF; load CS:IP from the interrupt vector table at physical `n*4`.
    pub fn enter_interrupt(&mut self, vector: u8, platform: &mut Platform) {
        trace!("entering interrupt {:#04x}", vector);
        let flags_word = self.flags.to_word();
        self.push_word(platform, flags_word);
        let cs = self.regs.get_word(RegisterIndex::Cs);
        self.push_word(platform, cs);
        self.push_word(platform, self.regs.ip);
        self.flags.set_flag(Flags::IF, false);
        self.flags.set_flag(Flags::TF, false);

        let table_addr = (vector as u32) * 4;
        let new_ip = platform.memory.read_word(table_addr);
        let new_cs = platform.memory.read_word(table_addr + 2);
        self.regs.ip = new_ip;
        self.regs.set_word(RegisterIndex::Cs, new_cs);
    }

    pub fn iret(&mut self, platform: &Platform) {
        let ip = self.pop_word(platform);
        let cs = self.pop_word(platform);
        let flags_word = self.pop_word(platform);
        self.regs.ip = ip;
        self.regs.set_word(RegisterIndex::Cs, cs);
        self.flags = Flags::from_word(flags_word);
    }

    /// Fetches and executes one instruction. IP is advanced past the
    /// instruction before the handler runs, so relative branches compute
    /// their target from the post-fetch IP (spec.md 4.3).
    pub fn step_instruction(&mut self, platform: &mut Platform) -> StepOutcome {
        let cs = self.regs.get_word(RegisterIndex::Cs);
        let start = ((cs as u32) << 4) & 0xF_FFFF;
        let ip = self.regs.ip;
        let fetch_start = (start + ip as u32) & 0xF_FFFF;

        let decoded = match fetch(fetch_start, &self.table, |addr| platform.memory.read_byte(addr)) {
            Ok(d) => d,
            Err(DecodeFailure::TooManyPrefixes) => return StepOutcome::InvalidOpcode,
        };

        self.regs.ip = ip.wrapping_add(decoded.length);
        let outcome = execute::execute(self, platform, &decoded);
        self.last_instruction = Some(decoded);
        outcome
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
