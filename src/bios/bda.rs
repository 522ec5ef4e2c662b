//! BIOS Data Area field offsets, reproduced byte-for-byte from
//! `original_source/src/bios/bda.c`'s `BDAFieldMetadataTable` for every
//! field the implemented INT 05h/10h/13h/16h/1Ah services touch. The BDA
//! lives in conventional memory at physical `0x400` (segment `0x0040`), so
//! these are plain offsets read and written through the platform's memory
//! map like any other RAM access — a DOS program peeking `[0040:xx]` sees
//! the same bytes the BIOS functions do.

use crate::platform::Platform;

pub const SEGMENT_BASE: u32 = 0x0400;

pub const EQUIPMENT_WORD: u32 = 0x10;
pub const MEMORY_SIZE_KB: u32 = 0x13;
pub const KEYBOARD_STATUS_1: u32 = 0x17;
pub const KEYBOARD_BUFFER_HEAD: u32 = 0x1A;
pub const KEYBOARD_BUFFER_TAIL: u32 = 0x1C;
pub const KEYBOARD_BUFFER: u32 = 0x1E;
pub const KEYBOARD_BUFFER_LEN: u32 = 32; // 16 words
pub const DISKETTE_LAST_STATUS: u32 = 0x41;
pub const VIDEO_MODE: u32 = 0x49;
pub const VIDEO_COLUMNS: u32 = 0x4A;
pub const VIDEO_PAGE_SIZE: u32 = 0x4C;
pub const VIDEO_PAGE_OFFSET: u32 = 0x4E;
pub const VIDEO_CURSOR_POS: u32 = 0x50; // 8 pages x (col, row)
pub const VIDEO_CURSOR_TYPE: u32 = 0x60;
pub const VIDEO_CURRENT_PAGE: u32 = 0x62;
pub const TIMER_TICKS: u32 = 0x6C;
pub const TIMER_OVERFLOW: u32 = 0x70;
pub const KEYBOARD_BUFFER_START: u32 = 0x80;
pub const KEYBOARD_BUFFER_END: u32 = 0x82;

fn addr(offset: u32) -> u32 {
    SEGMENT_BASE + offset
}

pub fn read_u8(platform: &Platform, offset: u32) -> u8 {
    platform.memory.read_byte(addr(offset))
}

pub fn write_u8(platform: &Platform, offset: u32, value: u8) {
    platform.memory.write_byte(addr(offset), value);
}

pub fn read_u16(platform: &Platform, offset: u32) -> u16 {
    platform.memory.read_word(addr(offset))
}

pub fn write_u16(platform: &Platform, offset: u32, value: u16) {
    platform.memory.write_word(addr(offset), value);
}

/// Initializes the handful of BDA fields the implemented services rely on
/// to a sane power-on state (80x25 MDA text, empty keyboard ring, zeroed
/// tick counter).
pub fn init(platform: &Platform) {
    write_u16(platform, EQUIPMENT_WORD, 0x0030); // MDA adapter, no floppy reported yet
    write_u16(platform, MEMORY_SIZE_KB, 640);
    write_u8(platform, VIDEO_MODE, 0x07); // MDA 80x25 text
    write_u16(platform, VIDEO_COLUMNS, 80);
    write_u16(platform, VIDEO_PAGE_SIZE, 4096);
    write_u16(platform, VIDEO_PAGE_OFFSET, 0);
    write_u8(platform, VIDEO_CURRENT_PAGE, 0);
    write_u16(platform, VIDEO_CURSOR_TYPE, 0x0C0D); // start/end scanline, common text cursor
    for page in 0..8u32 {
        write_u16(platform, VIDEO_CURSOR_POS + page * 2, 0);
    }
    write_u16(platform, KEYBOARD_BUFFER_START, KEYBOARD_BUFFER);
    write_u16(platform, KEYBOARD_BUFFER_END, KEYBOARD_BUFFER + KEYBOARD_BUFFER_LEN);
    write_u16(platform, KEYBOARD_BUFFER_HEAD, KEYBOARD_BUFFER);
    write_u16(platform, KEYBOARD_BUFFER_TAIL, KEYBOARD_BUFFER);
    write_u8(platform, KEYBOARD_STATUS_1, 0);
    write_u32(platform, TIMER_TICKS, 0);
    write_u8(platform, TIMER_OVERFLOW, 0);
}

fn write_u32(platform: &Platform, offset: u32, value: u32) {
    write_u16(platform, offset, (value & 0xFFFF) as u16);
    write_u16(platform, offset + 2, (value >> 16) as u16);
}

fn read_u32(platform: &Platform, offset: u32) -> u32 {
    let lo = read_u16(platform, offset) as u32;
    let hi = read_u16(platform, offset + 2) as u32;
    lo | (hi << 16)
}

pub fn increment_timer_ticks(platform: &Platform) {
    let ticks = read_u32(platform, TIMER_TICKS).wrapping_add(1);
    write_u32(platform, TIMER_TICKS, ticks);
    if ticks >= 0x00180000 {
        // Midnight rollover at the classic ~18.2Hz tick rate (1,573,040 ticks/day).
        write_u32(platform, TIMER_TICKS, 0);
        write_u8(platform, TIMER_OVERFLOW, 1);
    }
}

pub fn read_timer_ticks(platform: &Platform) -> u32 {
    read_u32(platform, TIMER_TICKS)
}

pub fn take_timer_overflow(platform: &Platform) -> u8 {
    let overflow = read_u8(platform, TIMER_OVERFLOW);
    write_u8(platform, TIMER_OVERFLOW, 0);
    overflow
}

pub fn set_timer_ticks(platform: &Platform, ticks: u32) {
    write_u32(platform, TIMER_TICKS, ticks);
}
