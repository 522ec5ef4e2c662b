//! INT 16h keyboard services, backed by the BDA's 16-entry keyboard ring
//! (word-sized ASCII/scancode pairs at [`bda::KEYBOARD_BUFFER`]).
//!
//! `AH=00h` is documented as a blocking read, but this core's concurrency
//! model has no suspension points (every CPU step is a function call that
//! returns) — so, like a caller polling a non-blocking socket, it returns
//! immediately with `AX=0` when the ring is empty instead of spinning the
//! CPU core itself. Software wanting a real wait loop should poll `AH=01h`
//! first, the way well-behaved BIOS callers already do.

use crate::bios::bda;
use crate::cpu::flags::Flags;
use crate::cpu::registers::RegisterIndex;
use crate::cpu::Cpu;
use crate::platform::Platform;

/// Set-1 scancode to ASCII, unshifted. Only the keys a PC/XT text console
/// needs are mapped; unmapped make-codes enqueue with ASCII 0.
fn scancode_to_ascii(scancode: u8, shift: bool) -> u8 {
    let lower: &[(u8, u8)] = &[
        (0x02, b'1'), (0x03, b'2'), (0x04, b'3'), (0x05, b'4'), (0x06, b'5'),
        (0x07, b'6'), (0x08, b'7'), (0x09, b'8'), (0x0A, b'9'), (0x0B, b'0'),
        (0x10, b'q'), (0x11, b'w'), (0x12, b'e'), (0x13, b'r'), (0x14, b't'),
        (0x15, b'y'), (0x16, b'u'), (0x17, b'i'), (0x18, b'o'), (0x19, b'p'),
        (0x1E, b'a'), (0x1F, b's'), (0x20, b'd'), (0x21, b'f'), (0x22, b'g'),
        (0x23, b'h'), (0x24, b'j'), (0x25, b'k'), (0x26, b'l'),
        (0x2C, b'z'), (0x2D, b'x'), (0x2E, b'c'), (0x2F, b'v'), (0x30, b'b'),
        (0x31, b'n'), (0x32, b'm'),
        (0x39, b' '), (0x1C, b'\r'), (0x0E, 0x08), (0x0F, b'\t'),
    ];
    let upper: &[(u8, u8)] = &[
        (0x02, b'!'), (0x03, b'@'), (0x04, b'#'), (0x05, b'$'), (0x06, b'%'),
    ];
    let table = if shift { upper } else { lower };
    table
        .iter()
        .find(|(code, _)| *code == scancode)
        .map(|(_, ascii)| *ascii)
        .or_else(|| {
            if !shift {
                None
            } else {
                lower.iter().find(|(code, _)| *code == scancode).map(|(_, ascii)| ascii.to_ascii_uppercase())
            }
        })
        .unwrap_or(0)
}

const SHIFT_MAKE: u8 = 0x2A;
const SHIFT_BREAK: u8 = 0xAA;
const BREAK_BIT: u8 = 0x80;

/// Called from the IRQ1 path with a raw make/break scancode: tracks the
/// shift-state bit in BDA offset 0x17 and, for make codes, pushes an
/// ASCII/scancode pair into the keyboard ring.
pub fn enqueue_scancode(platform: &Platform, scancode: u8) {
    if scancode == SHIFT_MAKE {
        set_shift(platform, true);
        return;
    }
    if scancode == SHIFT_BREAK {
        set_shift(platform, false);
        return;
    }
    if scancode & BREAK_BIT != 0 {
        return; // other break codes aren't tracked
    }
    let shift = shift_pressed(platform);
    let ascii = scancode_to_ascii(scancode, shift);
    push_entry(platform, ascii, scancode);
}

fn set_shift(platform: &Platform, pressed: bool) {
    let mut status = bda::read_u8(platform, bda::KEYBOARD_STATUS_1);
    if pressed {
        status |= 0x01;
    } else {
        status &= !0x01;
    }
    bda::write_u8(platform, bda::KEYBOARD_STATUS_1, status);
}

fn shift_pressed(platform: &Platform) -> bool {
    bda::read_u8(platform, bda::KEYBOARD_STATUS_1) & 0x01 != 0
}

fn push_entry(platform: &Platform, ascii: u8, scancode: u8) {
    let head = bda::read_u16(platform, bda::KEYBOARD_BUFFER_HEAD);
    let tail = bda::read_u16(platform, bda::KEYBOARD_BUFFER_TAIL);
    let start = bda::read_u16(platform, bda::KEYBOARD_BUFFER_START);
    let end = bda::read_u16(platform, bda::KEYBOARD_BUFFER_END);

    let next_tail = if tail + 2 >= end { start } else { tail + 2 };
    if next_tail == head {
        return; // ring full, drop the key
    }
    bda::write_u16(platform, tail as u32, ((scancode as u16) << 8) | ascii as u16);
    bda::write_u16(platform, bda::KEYBOARD_BUFFER_TAIL, next_tail);
}

fn peek_entry(platform: &Platform) -> Option<(u8, u8)> {
    let head = bda::read_u16(platform, bda::KEYBOARD_BUFFER_HEAD);
    let tail = bda::read_u16(platform, bda::KEYBOARD_BUFFER_TAIL);
    if head == tail {
        return None;
    }
    let packed = bda::read_u16(platform, head as u32);
    Some(((packed & 0xFF) as u8, (packed >> 8) as u8))
}

fn pop_entry(platform: &Platform) -> Option<(u8, u8)> {
    let entry = peek_entry(platform)?;
    let head = bda::read_u16(platform, bda::KEYBOARD_BUFFER_HEAD);
    let start = bda::read_u16(platform, bda::KEYBOARD_BUFFER_START);
    let end = bda::read_u16(platform, bda::KEYBOARD_BUFFER_END);
    let next_head = if head + 2 >= end { start } else { head + 2 };
    bda::write_u16(platform, bda::KEYBOARD_BUFFER_HEAD, next_head);
    Some(entry)
}

pub fn handle(cpu: &mut Cpu, platform: &Platform) {
    let ah = cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true });
    match ah {
        0x00 => read_char(cpu, platform),
        0x01 => check_char(cpu, platform),
        0x02 => shift_status(cpu, platform),
        other => log::warn!("INT 16h: unimplemented AH={:#04x}", other),
    }
}

fn read_char(cpu: &mut Cpu, platform: &Platform) {
    match pop_entry(platform) {
        Some((ascii, scancode)) => {
            cpu.regs.set_word(RegisterIndex::Ax, ((scancode as u16) << 8) | ascii as u16);
        }
        None => cpu.regs.set_word(RegisterIndex::Ax, 0),
    }
}

fn check_char(cpu: &mut Cpu, platform: &Platform) {
    match peek_entry(platform) {
        Some((ascii, scancode)) => {
            cpu.regs.set_word(RegisterIndex::Ax, ((scancode as u16) << 8) | ascii as u16);
            cpu.flags.set_flag(Flags::ZF, false);
        }
        None => {
            cpu.flags.set_flag(Flags::ZF, true);
        }
    }
}

fn shift_status(cpu: &mut Cpu, platform: &Platform) {
    let status = bda::read_u8(platform, bda::KEYBOARD_STATUS_1);
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false }, status);
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

    fn setup() -> (Cpu, Platform) {
        let cpu = Cpu::new();
        let mut platform = Platform::new();
        let ram: Rc<RefCell<dyn MemoryDevice>> = Rc::new(RefCell::new(RamStub::default()));
        platform.memory.register(DeviceKind::Ram, 0, 0xF_FFFF, ram).unwrap();
        bda::init(&platform);
        (cpu, platform)
    }

    #[test]
    fn enqueue_then_read_round_trips_ascii() {
        let (mut cpu, platform) = setup();
        enqueue_scancode(&platform, 0x1E); // 'a' make code
        cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true }, 0x00);
        handle(&mut cpu, &platform);
        assert_eq!(cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false }), b'a');
    }

    #[test]
    fn read_on_empty_ring_returns_zero_without_blocking() {
        let (mut cpu, platform) = setup();
        cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true }, 0x00);
        handle(&mut cpu, &platform);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Ax), 0);
    }

    #[test]
    fn check_char_sets_zf_when_empty() {
        let (mut cpu, platform) = setup();
        cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true }, 0x01);
        handle(&mut cpu, &platform);
        assert!(cpu.flags.get(Flags::ZF));
    }

    #[test]
    fn shift_make_then_break_tracks_status_bit() {
        let (_, platform) = setup();
        enqueue_scancode(&platform, SHIFT_MAKE);
        assert!(shift_pressed(&platform));
        enqueue_scancode(&platform, SHIFT_BREAK);
        assert!(!shift_pressed(&platform));
    }

    #[test]
    fn shifted_key_produces_uppercase() {
        let (_, platform) = setup();
        enqueue_scancode(&platform, SHIFT_MAKE);
        enqueue_scancode(&platform, 0x1E); // 'a' -> 'A' while shifted
        let (ascii, _) = pop_entry(&platform).unwrap();
        assert_eq!(ascii, b'A');
    }

    #[test]
    fn ring_drops_keys_once_full() {
        let (_, platform) = setup();
        for _ in 0..20 {
            enqueue_scancode(&platform, 0x39); // space, never collides with shift codes
        }
        let mut count = 0;
        while pop_entry(&platform).is_some() {
            count += 1;
        }
        assert!(count <= 16);
    }
}
