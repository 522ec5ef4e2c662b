//! INT 10h video services, operating on the machine's single [`Mda`] page
//! and the video-related BDA fields. Only page 0 exists on this platform,
//! but the `BH`/page arguments are still accepted and ignored the way real
//! single-page adapters' BIOSes do, so software that plays it safe and
//! always passes page 0 needs no special-casing.

use crate::bios::bda;
use crate::cpu::registers::RegisterIndex;
use crate::cpu::Cpu;
use crate::devices::mda::{Mda, COLS, ROWS};
use crate::platform::{MemoryDevice, Platform};

const DEFAULT_ATTRIBUTE: u8 = 0x07;

fn ah(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true })
}

fn al(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false })
}

fn set_al(cpu: &mut Cpu, value: u8) {
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false }, value);
}

fn set_ah(cpu: &mut Cpu, value: u8) {
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true }, value);
}

fn bh(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Bx, high: true })
}

fn bl(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Bx, high: false })
}

fn ch(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Cx, high: true })
}

fn cl(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Cx, high: false })
}

fn set_ch(cpu: &mut Cpu, value: u8) {
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Cx, high: true }, value);
}

fn set_cl(cpu: &mut Cpu, value: u8) {
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Cx, high: false }, value);
}

fn dh(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Dx, high: true })
}

fn dl(cpu: &Cpu) -> u8 {
    cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Dx, high: false })
}

fn set_dh(cpu: &mut Cpu, value: u8) {
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Dx, high: true }, value);
}

fn set_dl(cpu: &mut Cpu, value: u8) {
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Dx, high: false }, value);
}

fn cx(cpu: &Cpu) -> u16 {
    cpu.regs.get_word(RegisterIndex::Cx)
}

/// Dispatches on `AH`. Unrecognized functions are logged and ignored, the
/// way a real BIOS silently no-ops an `AH` it doesn't implement.
pub fn handle(cpu: &mut Cpu, platform: &Platform, mda: &mut Mda) {
    match ah(cpu) {
        0x00 => set_mode(platform, al(cpu)),
        0x01 => set_cursor_type(cpu, platform),
        0x02 => set_cursor_position(cpu, platform),
        0x03 => read_cursor_position(cpu, platform),
        0x06 => scroll(cpu, mda, true),
        0x07 => scroll(cpu, mda, false),
        0x08 => read_char_attr(cpu, platform, mda),
        0x09 => write_char_attr(cpu, platform, mda, true),
        0x0A => write_char_attr(cpu, platform, mda, false),
        0x0E => teletype_output(cpu, platform, mda, al(cpu)),
        0x0F => get_mode(cpu, platform),
        0x13 => write_string(cpu, platform, mda),
        other => log::warn!("INT 10h: unimplemented AH={:#04x}", other),
    }
}

fn set_mode(platform: &Platform, mode: u8) {
    bda::write_u8(platform, bda::VIDEO_MODE, mode);
    bda::write_u16(platform, bda::VIDEO_CURSOR_POS, 0);
}

fn get_mode(cpu: &mut Cpu, platform: &Platform) {
    set_al(cpu, bda::read_u8(platform, bda::VIDEO_MODE));
    set_ah(cpu, 80); // columns
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Bx, high: true }, 0);
}

fn set_cursor_type(cpu: &Cpu, platform: &Platform) {
    bda::write_u16(platform, bda::VIDEO_CURSOR_TYPE, ((ch(cpu) as u16) << 8) | cl(cpu) as u16);
}

fn cursor_pos_offset(page: u8) -> u32 {
    bda::VIDEO_CURSOR_POS + (page as u32) * 2
}

fn set_cursor_position(cpu: &mut Cpu, platform: &Platform) {
    let page = bh(cpu);
    let row = dh(cpu);
    let col = dl(cpu);
    bda::write_u16(platform, cursor_pos_offset(page), ((row as u16) << 8) | col as u16);
}

fn read_cursor_position(cpu: &mut Cpu, platform: &Platform) {
    let page = bh(cpu);
    let packed = bda::read_u16(platform, cursor_pos_offset(page));
    set_dh(cpu, (packed >> 8) as u8);
    set_dl(cpu, (packed & 0xFF) as u8);
    let cursor_type = bda::read_u16(platform, bda::VIDEO_CURSOR_TYPE);
    set_ch(cpu, (cursor_type >> 8) as u8);
    set_cl(cpu, (cursor_type & 0xFF) as u8);
}

fn cell_offset(row: u8, col: u8) -> u32 {
    ((row as u32) * COLS as u32 + col as u32) * 2
}

/// Shared by scroll-up (`AH=06h`) and scroll-down (`AH=07h`): `lines == 0`
/// means "blank the whole window" rather than scroll by zero.
fn scroll(cpu: &Cpu, mda: &mut Mda, up: bool) {
    let lines = al(cpu);
    let attr = bh(cpu);
    let top = ch(cpu).min(ROWS as u8 - 1);
    let left = cl(cpu).min(COLS as u8 - 1);
    let bottom = dh(cpu).min(ROWS as u8 - 1);
    let right = dl(cpu).min(COLS as u8 - 1);
    if top > bottom || left > right {
        return;
    }

    let window_height = bottom - top + 1;
    let blank_all = lines == 0 || lines >= window_height;

    if !blank_all {
        if up {
            for row in top..=(bottom - lines) {
                for col in left..=right {
                    let src_offset = cell_offset(row + lines, col);
                    let glyph = mda.read_byte(src_offset);
                    let raw_attr = mda.read_byte(src_offset + 1);
                    let dst_offset = cell_offset(row, col);
                    mda.write_byte(dst_offset, glyph);
                    mda.write_byte(dst_offset + 1, raw_attr);
                }
            }
        } else {
            for row in (top..=(bottom - lines)).rev() {
                for col in left..=right {
                    let src_offset = cell_offset(row, col);
                    let glyph = mda.read_byte(src_offset);
                    let raw_attr = mda.read_byte(src_offset + 1);
                    let dst_offset = cell_offset(row + lines, col);
                    mda.write_byte(dst_offset, glyph);
                    mda.write_byte(dst_offset + 1, raw_attr);
                }
            }
        }
    }

    let blank_top = if blank_all {
        top
    } else if up {
        bottom - lines + 1
    } else {
        top
    };
    let blank_bottom = if blank_all { bottom } else if up { bottom } else { top + lines - 1 };

    for row in blank_top..=blank_bottom {
        for col in left..=right {
            let offset = cell_offset(row, col);
            mda.write_byte(offset, b' ');
            mda.write_byte(offset + 1, attr);
        }
    }
}

fn read_char_attr(cpu: &mut Cpu, platform: &Platform, mda: &mut Mda) {
    let page = bh(cpu);
    let packed = bda::read_u16(platform, cursor_pos_offset(page));
    let row = (packed >> 8) as u8;
    let col = (packed & 0xFF) as u8;
    let offset = cell_offset(row, col);
    set_al(cpu, mda.read_byte(offset));
    set_ah(cpu, mda.read_byte(offset + 1));
}

/// Shared by `AH=09h` (char + attribute) and `AH=0Ah` (char only, leaving
/// the attribute byte already on screen untouched).
fn write_char_attr(cpu: &Cpu, platform: &Platform, mda: &mut Mda, with_attribute: bool) {
    let page = bh(cpu);
    let packed = bda::read_u16(platform, cursor_pos_offset(page));
    let row = (packed >> 8) as u8;
    let col = (packed & 0xFF) as u8;
    let character = al(cpu);
    let attribute = bl(cpu);
    let count = cx(cpu).max(1);

    let mut col = col as u32;
    let mut row = row as u32;
    for _ in 0..count {
        if row >= ROWS as u32 {
            break;
        }
        let offset = ((row * COLS as u32) + col) * 2;
        mda.write_byte(offset, character);
        if with_attribute {
            mda.write_byte(offset + 1, attribute);
        }
        col += 1;
        if col >= COLS as u32 {
            col = 0;
            row += 1;
        }
    }
}

fn advance_cursor_with_scroll(platform: &Platform, mda: &mut Mda, page: u8, mut row: u8, mut col: u8) {
    if col >= COLS as u8 {
        col = 0;
        row += 1;
    }
    if row >= ROWS as u8 {
        scroll_one_line(mda);
        row = ROWS as u8 - 1;
    }
    bda::write_u16(platform, cursor_pos_offset(page), ((row as u16) << 8) | col as u16);
}

fn scroll_one_line(mda: &mut Mda) {
    for row in 1..ROWS as u8 {
        for col in 0..COLS as u8 {
            let src = cell_offset(row, col);
            let glyph = mda.read_byte(src);
            let attr = mda.read_byte(src + 1);
            let dst = cell_offset(row - 1, col);
            mda.write_byte(dst, glyph);
            mda.write_byte(dst + 1, attr);
        }
    }
    for col in 0..COLS as u8 {
        let offset = cell_offset(ROWS as u8 - 1, col);
        mda.write_byte(offset, b' ');
        mda.write_byte(offset + 1, DEFAULT_ATTRIBUTE);
    }
}

/// `AH=0Eh`: teletype output. Honors CR, LF, BS and BEL; everything else is
/// written at the cursor and advances it, scrolling the page when needed.
fn teletype_output(cpu: &Cpu, platform: &Platform, mda: &mut Mda, character: u8) {
    let page = bh(cpu);
    let packed = bda::read_u16(platform, cursor_pos_offset(page));
    let row = (packed >> 8) as u8;
    let col = (packed & 0xFF) as u8;

    match character {
        b'\r' => {
            bda::write_u16(platform, cursor_pos_offset(page), (row as u16) << 8);
        }
        b'\n' => {
            advance_cursor_with_scroll(platform, mda, page, row, COLS as u8);
        }
        0x08 => {
            let new_col = col.saturating_sub(1);
            bda::write_u16(platform, cursor_pos_offset(page), ((row as u16) << 8) | new_col as u16);
        }
        0x07 => {} // BEL: no speaker wiring here, host may watch for it separately
        _ => {
            let offset = cell_offset(row, col);
            mda.write_byte(offset, character);
            mda.write_byte(offset + 1, DEFAULT_ATTRIBUTE);
            advance_cursor_with_scroll(platform, mda, page, row, col + 1);
        }
    }
}

/// `AH=13h`: write string. `AL` selects among the four classic sub-modes —
/// whether the cursor is left moved, and whether attribute bytes are read
/// from `BL` (uniform) or interleaved in the string itself.
fn write_string(cpu: &mut Cpu, platform: &Platform, mda: &mut Mda) {
    let mode = al(cpu);
    let page = bh(cpu);
    let attribute = bl(cpu);
    let count = cx(cpu);
    let start_row = dh(cpu);
    let start_col = dl(cpu);
    let move_cursor = mode & 0x01 != 0;
    let attr_in_string = mode & 0x02 != 0;

    let es = cpu.regs.get_word(RegisterIndex::Es);
    let bp = cpu.regs.get_word(RegisterIndex::Bp);
    let base = ((es as u32) << 4).wrapping_add(bp as u32) & 0xF_FFFF;

    bda::write_u16(platform, cursor_pos_offset(page), ((start_row as u16) << 8) | start_col as u16);

    let mut src = base;
    for _ in 0..count {
        let character = platform.memory.read_byte(src);
        src = src.wrapping_add(1);
        let cell_attribute = if attr_in_string {
            let a = platform.memory.read_byte(src);
            src = src.wrapping_add(1);
            a
        } else {
            attribute
        };

        let packed = bda::read_u16(platform, cursor_pos_offset(page));
        let row = (packed >> 8) as u8;
        let col = (packed & 0xFF) as u8;
        let offset = cell_offset(row, col);
        mda.write_byte(offset, character);
        mda.write_byte(offset + 1, cell_attribute);
        advance_cursor_with_scroll(platform, mda, page, row, col + 1);
    }

    if !move_cursor {
        bda::write_u16(platform, cursor_pos_offset(page), ((start_row as u16) << 8) | start_col as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{DeviceKind, MemoryDevice, Platform};
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

    fn setup() -> (Cpu, Platform, Mda) {
        let cpu = Cpu::new();
        let mut platform = Platform::new();
        let ram: Rc<RefCell<dyn MemoryDevice>> = Rc::new(RefCell::new(RamStub::default()));
        platform.memory.register(DeviceKind::Ram, 0, 0xF_FFFF, ram).unwrap();
        bda::init(&platform);
        let mda = Mda::new();
        (cpu, platform, mda)
    }

    #[test]
    fn set_mode_updates_bda() {
        let (mut cpu, platform, mut mda) = setup();
        set_ah(&mut cpu, 0x00);
        set_al(&mut cpu, 0x07);
        handle(&mut cpu, &platform, &mut mda);
        assert_eq!(bda::read_u8(&platform, bda::VIDEO_MODE), 0x07);
    }

    #[test]
    fn teletype_writes_char_and_advances_cursor() {
        let (mut cpu, platform, mut mda) = setup();
        set_ah(&mut cpu, 0x0E);
        set_al(&mut cpu, b'A');
        handle(&mut cpu, &platform, &mut mda);
        let (glyph, _) = mda.render_cell(0, 0);
        assert_eq!(glyph, b'A');
        let packed = bda::read_u16(&platform, bda::VIDEO_CURSOR_POS);
        assert_eq!(packed, 1);
    }

    #[test]
    fn teletype_newline_moves_to_next_row_column_zero() {
        let (mut cpu, platform, mut mda) = setup();
        set_ah(&mut cpu, 0x0E);
        set_al(&mut cpu, b'\n');
        handle(&mut cpu, &platform, &mut mda);
        let packed = bda::read_u16(&platform, bda::VIDEO_CURSOR_POS);
        assert_eq!(packed >> 8, 1);
        assert_eq!(packed & 0xFF, 0);
    }

    #[test]
    fn teletype_scrolls_when_last_row_overflows() {
        let (mut cpu, platform, mut mda) = setup();
        mda.write_byte(cell_offset(0, 0) as u32, b'X');
        bda::write_u16(&platform, bda::VIDEO_CURSOR_POS, ((ROWS as u16 - 1) << 8) | (COLS as u16 - 1));
        set_ah(&mut cpu, 0x0E);
        set_al(&mut cpu, b'Y');
        handle(&mut cpu, &platform, &mut mda);
        // row 0's original content scrolled off, row 0 is now blank (was row 1)
        let (glyph, _) = mda.render_cell(0, 0);
        assert_eq!(glyph, b' ');
    }

    #[test]
    fn scroll_up_blanks_whole_window_when_lines_is_zero() {
        let (mut cpu, _platform, mut mda) = setup();
        mda.write_byte(cell_offset(0, 0) as u32, b'Z');
        set_ah(&mut cpu, 0x06);
        set_al(&mut cpu, 0);
        cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Bx, high: true }, DEFAULT_ATTRIBUTE);
        set_ch(&mut cpu, 0);
        set_cl(&mut cpu, 0);
        set_dh(&mut cpu, ROWS as u8 - 1);
        set_dl(&mut cpu, COLS as u8 - 1);
        scroll(&cpu, &mut mda, true);
        let (glyph, _) = mda.render_cell(0, 0);
        assert_eq!(glyph, b' ');
    }

    #[test]
    fn write_char_attr_writes_count_copies() {
        let (mut cpu, platform, mut mda) = setup();
        set_ah(&mut cpu, 0x09);
        set_al(&mut cpu, b'Q');
        cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Bx, high: false }, 0x07);
        cpu.regs.set_word(RegisterIndex::Cx, 3);
        handle(&mut cpu, &platform, &mut mda);
        for col in 0..3 {
            let (glyph, attr) = mda.render_cell(0, col);
            assert_eq!(glyph, b'Q');
            assert_eq!(attr.foreground, 7);
        }
    }
}
