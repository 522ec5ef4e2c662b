//! µPD765 Floppy Disk Controller. Command/result buffer shapes and drive
//! state are grounded on `original_source/core/src/fdc/public.h`'s
//! `FDCDriveState`/`FDCConfig` (disk image access stays behind a callback
//! there; here it's a trait object, matching how this crate wires every
//! other peripheral through `platform.rs`'s `dyn` device pattern).
//! DMA handshake (DREQ, one byte per cycle, TC ends the transfer) is
//! grounded on
//! `original_source/libyax86/tests/platform/platform_fdc_integration_test.cpp`'s
//! Read Data walkthrough.

use log::{debug, trace};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::devices::pic::Pic;
use crate::platform::{MemoryDevice, PortDevice};
use crate::static_vec::StaticVec;

pub const NUM_DRIVES: usize = 4;
const COMMAND_BUFFER_SIZE: usize = 9;
const RESULT_BUFFER_SIZE: usize = 7;
const FDC_IRQ: u8 = 6;

pub const PORT_DOR: u16 = 0x3F2;
pub const PORT_MSR: u16 = 0x3F4;
pub const PORT_DATA: u16 = 0x3F5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskFormat {
    pub num_heads: u8,
    pub num_tracks: u8,
    pub num_sectors_per_track: u8,
    pub sector_size: u16,
}

pub const FORMAT_360KB: DiskFormat = DiskFormat { num_heads: 2, num_tracks: 40, num_sectors_per_track: 9, sector_size: 512 };

/// Host-provided backing store for one floppy image. A plain in-memory
/// `Vec<u8>` implementation is provided below for tests and simple hosts;
/// a real frontend can back this with a file instead.
pub trait FloppyImage {
    fn read_byte(&mut self, offset: u32) -> u8;
    fn write_byte(&mut self, offset: u32, value: u8);
}

pub struct MemoryImage {
    data: Vec<u8>,
}

impl MemoryImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl FloppyImage for MemoryImage {
    fn read_byte(&mut self, offset: u32) -> u8 {
        *self.data.get(offset as usize).unwrap_or(&0xFF)
    }
    fn write_byte(&mut self, offset: u32, value: u8) {
        if let Some(slot) = self.data.get_mut(offset as usize) {
            *slot = value;
        }
    }
}

struct DriveState {
    present: bool,
    format: DiskFormat,
    image: Option<Rc<RefCell<dyn FloppyImage>>>,
    track: u8,
    busy: bool,
    st0: u8,
    has_pending_interrupt: bool,
}

impl DriveState {
    fn new() -> Self {
        Self {
            present: false,
            format: FORMAT_360KB,
            image: None,
            track: 0,
            busy: false,
            st0: 0,
            has_pending_interrupt: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Command,
    Execution,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    ReadData,
    WriteData,
    ReadDeletedData,
    FormatTrack,
    Recalibrate,
    SenseInterruptStatus,
    Seek,
    SenseDriveStatus,
    Specify,
    ReadId,
}

impl CommandKind {
    fn from_opcode(opcode: u8) -> Option<CommandKind> {
        match opcode & 0x1F {
            0x06 => Some(CommandKind::ReadData),
            0x05 => Some(CommandKind::WriteData),
            0x0C => Some(CommandKind::ReadDeletedData),
            0x0D => Some(CommandKind::FormatTrack),
            0x07 => Some(CommandKind::Recalibrate),
            0x08 => Some(CommandKind::SenseInterruptStatus),
            0x0F => Some(CommandKind::Seek),
            0x04 => Some(CommandKind::SenseDriveStatus),
            0x03 => Some(CommandKind::Specify),
            0x0A => Some(CommandKind::ReadId),
            _ => None,
        }
    }

    /// Parameter bytes expected after the command byte.
    fn param_len(self) -> usize {
        match self {
            CommandKind::ReadData | CommandKind::WriteData | CommandKind::ReadDeletedData => 7,
            CommandKind::FormatTrack => 4,
            CommandKind::Recalibrate => 1,
            CommandKind::SenseInterruptStatus => 0,
            CommandKind::Seek => 2,
            CommandKind::SenseDriveStatus => 1,
            CommandKind::Specify => 2,
            CommandKind::ReadId => 1,
        }
    }

    fn is_data_transfer(self) -> bool {
        matches!(self, CommandKind::ReadData | CommandKind::WriteData | CommandKind::ReadDeletedData | CommandKind::FormatTrack)
    }
}

struct TransferState {
    drive: usize,
    cylinder: u8,
    head: u8,
    sector: u8,
    sector_size_code: u8,
    eot: u8,
    multi_track: bool,
    current_offset: u32,
    sector_byte_index: u16,
    pending_byte: Option<u8>,
    write_direction: bool,
}

impl TransferState {
    fn new() -> Self {
        Self {
            drive: 0,
            cylinder: 0,
            head: 0,
            sector: 1,
            sector_size_code: 2,
            eot: 0,
            multi_track: false,
            current_offset: 0,
            sector_byte_index: 0,
            pending_byte: None,
            write_direction: false,
        }
    }

    fn sector_size(&self) -> u32 {
        128u32 << self.sector_size_code
    }
}

pub struct Fdc {
    dor: u8,
    drives: [DriveState; NUM_DRIVES],
    phase: Phase,
    command_buffer: StaticVec<u8, COMMAND_BUFFER_SIZE>,
    current_command: Option<CommandKind>,
    result_buffer: StaticVec<u8, RESULT_BUFFER_SIZE>,
    next_result_byte: usize,
    transfer: TransferState,
    dma_request_active: bool,
    reset_interrupt_pending: bool,
    pic: Option<Weak<RefCell<Pic>>>,
}

impl Fdc {
    pub fn new() -> Self {
        Self {
            dor: 0,
            drives: [DriveState::new(), DriveState::new(), DriveState::new(), DriveState::new()],
            phase: Phase::Idle,
            command_buffer: StaticVec::new(),
            current_command: None,
            result_buffer: StaticVec::new(),
            next_result_byte: 0,
            transfer: TransferState::new(),
            dma_request_active: false,
            reset_interrupt_pending: false,
            pic: None,
        }
    }

    pub fn set_pic(&mut self, pic: &Rc<RefCell<Pic>>) {
        self.pic = Some(Rc::downgrade(pic));
    }

    pub fn insert_disk(&mut self, drive: usize, format: DiskFormat, image: Rc<RefCell<dyn FloppyImage>>) {
        self.drives[drive].present = true;
        self.drives[drive].format = format;
        self.drives[drive].image = Some(image);
    }

    pub fn eject_disk(&mut self, drive: usize) {
        self.drives[drive].present = false;
        self.drives[drive].image = None;
    }

    pub fn drive_present(&self, drive: usize) -> bool {
        self.drives.get(drive).is_some_and(|d| d.present)
    }

    pub fn drive_format(&self, drive: usize) -> Option<DiskFormat> {
        self.drives.get(drive).filter(|d| d.present).map(|d| d.format)
    }

    fn raise_irq6(&mut self) {
        if let Some(pic) = self.pic.as_ref().and_then(Weak::upgrade) {
            pic.borrow_mut().raise_irq(FDC_IRQ);
        }
    }

    fn reset_command_state(&mut self) {
        self.phase = Phase::Idle;
        self.command_buffer.clear();
        self.current_command = None;
        self.result_buffer.clear();
        self.next_result_byte = 0;
        self.dma_request_active = false;
    }

    fn write_dor(&mut self, value: u8) {
        let old_reset = self.dor & 0x04 != 0;
        let new_reset = value & 0x04 != 0;
        self.dor = value;
        if value == 0 {
            debug!("FDC DOR write 0: controller reset");
            self.reset_command_state();
        }
        if !old_reset && new_reset {
            trace!("FDC reset-bit rising edge, queuing post-reset polling interrupt");
            self.reset_interrupt_pending = true;
        }
    }

    fn read_msr(&self) -> u8 {
        let mut msr = 0u8;
        for (i, drive) in self.drives.iter().enumerate() {
            if drive.busy {
                msr |= 1 << i;
            }
        }
        if self.phase != Phase::Idle {
            msr |= 1 << 4;
        }
        if self.phase == Phase::Result {
            msr |= 1 << 6; // DIO: FDC -> CPU
        }
        if self.phase != Phase::Execution {
            msr |= 1 << 7; // RQM: data register ready
        }
        msr
    }

    fn write_data(&mut self, value: u8) {
        match self.phase {
            Phase::Idle => {
                let _ = self.command_buffer.push(value);
                match CommandKind::from_opcode(value) {
                    Some(kind) => {
                        self.current_command = Some(kind);
                        if kind.param_len() == 0 {
                            self.begin_execution();
                        } else {
                            self.phase = Phase::Command;
                        }
                    }
                    None => {
                        // Invalid command: report via Sense Interrupt-style result.
                        let _ = self.result_buffer.push(0x80);
                        self.phase = Phase::Result;
                    }
                }
            }
            Phase::Command => {
                let _ = self.command_buffer.push(value);
                let kind = self.current_command.expect("command phase without a command");
                if self.command_buffer.len() == 1 + kind.param_len() {
                    self.begin_execution();
                }
            }
            Phase::Execution | Phase::Result => {}
        }
    }

    fn param(&self, index: usize) -> u8 {
        *self.command_buffer.get(1 + index).unwrap_or(&0)
    }

    fn begin_execution(&mut self) {
        let kind = self.current_command.expect("begin_execution without a command");
        trace!("FDC begin execution {:?}", kind);
        match kind {
            CommandKind::SenseInterruptStatus => {
                let pending = self.drives.iter().position(|d| d.has_pending_interrupt);
                let (st0, pcn) = match pending {
                    Some(drive) => {
                        self.drives[drive].has_pending_interrupt = false;
                        (self.drives[drive].st0, self.drives[drive].track)
                    }
                    None => (0x80, 0),
                };
                let _ = self.result_buffer.push(st0);
                let _ = self.result_buffer.push(pcn);
                self.phase = Phase::Result;
            }
            CommandKind::Recalibrate => {
                let drive = (self.param(0) & 0x3) as usize;
                self.drives[drive].track = 0;
                self.drives[drive].busy = false;
                self.drives[drive].st0 = 0x20 | drive as u8; // seek end
                self.drives[drive].has_pending_interrupt = true;
                self.raise_irq6();
                self.reset_command_state();
            }
            CommandKind::Seek => {
                let drive = (self.param(0) & 0x3) as usize;
                let ncn = self.param(1);
                self.drives[drive].track = ncn;
                self.drives[drive].busy = false;
                self.drives[drive].st0 = 0x20 | drive as u8;
                self.drives[drive].has_pending_interrupt = true;
                self.raise_irq6();
                self.reset_command_state();
            }
            CommandKind::SenseDriveStatus => {
                let drive = (self.param(0) & 0x3) as usize;
                let mut st3 = drive as u8;
                if self.drives[drive].track == 0 {
                    st3 |= 1 << 4; // track 0
                }
                st3 |= 1 << 5; // ready
                let _ = self.result_buffer.push(st3);
                self.phase = Phase::Result;
            }
            CommandKind::Specify => {
                self.reset_command_state();
            }
            CommandKind::ReadId => {
                let drive = (self.param(0) & 0x3) as usize;
                self.push_chrn_result(drive, 0, 0, 0);
                self.raise_irq6();
                self.phase = Phase::Result;
            }
            CommandKind::ReadData | CommandKind::WriteData | CommandKind::ReadDeletedData | CommandKind::FormatTrack => {
                let drive = (self.param(0) & 0x3) as usize;
                let head = (self.param(0) >> 2) & 0x1;
                self.transfer = TransferState {
                    drive,
                    cylinder: self.param(1),
                    head,
                    sector: self.param(2).max(1),
                    sector_size_code: self.param(3),
                    eot: self.param(4),
                    multi_track: self.param(0) & 0x80 != 0,
                    current_offset: 0,
                    sector_byte_index: 0,
                    pending_byte: None,
                    write_direction: matches!(kind, CommandKind::WriteData),
                };
                self.transfer.current_offset = self.logical_offset(drive);
                self.drives[drive].busy = true;
                self.dma_request_active = true;
                self.phase = Phase::Execution;
            }
        }
    }

    fn push_chrn_result(&mut self, drive: usize, c: u8, h: u8, r: u8) {
        let _ = self.result_buffer.push(0); // ST0
        let _ = self.result_buffer.push(0); // ST1
        let _ = self.result_buffer.push(0); // ST2
        let _ = self.result_buffer.push(c);
        let _ = self.result_buffer.push(h);
        let _ = self.result_buffer.push(r);
        let _ = self.result_buffer.push(self.transfer_n(drive));
    }

    fn transfer_n(&self, _drive: usize) -> u8 {
        self.transfer.sector_size_code
    }

    fn logical_offset(&self, drive: usize) -> u32 {
        let format = self.drives[drive].format;
        let t = &self.transfer;
        let lba = (t.cylinder as u32 * format.num_heads as u32 + t.head as u32) * format.num_sectors_per_track as u32
            + (t.sector.saturating_sub(1)) as u32;
        lba * format.sector_size as u32
    }

    fn read_result(&mut self) -> u8 {
        let byte = *self.result_buffer.get(self.next_result_byte).unwrap_or(&0xFF);
        self.next_result_byte += 1;
        if self.next_result_byte >= self.result_buffer.len() {
            self.reset_command_state();
        }
        byte
    }

    fn read_data(&mut self) -> u8 {
        match self.phase {
            Phase::Result => self.read_result(),
            _ => 0xFF,
        }
    }

    /// Called once per simulated FDC tick; only handles timing that isn't
    /// gated on a DMA cycle (the post-reset polling interrupt).
    pub fn tick(&mut self) {
        if self.reset_interrupt_pending {
            self.reset_interrupt_pending = false;
            self.drives[0].st0 = 0xC0; // abnormal termination due to polling
            self.drives[0].has_pending_interrupt = true;
            self.raise_irq6();
        }
    }

    pub fn dma_request_active(&self) -> bool {
        self.dma_request_active
    }

    /// Supplies the next byte from the mounted image for a Write-transfer
    /// DMA cycle (disk -> memory, used by Read Data / Read Deleted Data).
    pub fn produce_byte(&mut self) -> u8 {
        let drive = self.transfer.drive;
        let offset = self.transfer.current_offset;
        let byte = match self.drives[drive].image.as_ref() {
            Some(image) => image.borrow_mut().read_byte(offset),
            None => 0xFF,
        };
        self.transfer.pending_byte = Some(byte);
        byte
    }

    /// Accepts a byte from a Read-transfer DMA cycle (memory -> disk, used
    /// by Write Data) and writes it into the mounted image.
    pub fn consume_byte(&mut self, byte: u8) {
        let drive = self.transfer.drive;
        let offset = self.transfer.current_offset;
        if let Some(image) = self.drives[drive].image.clone() {
            image.borrow_mut().write_byte(offset, byte);
        }
    }

    /// Call after each DMA cycle servicing this controller's channel.
    /// `terminal_count` is the DMA engine's TC signal for that cycle.
    pub fn complete_dma_cycle(&mut self, terminal_count: bool) {
        self.transfer.current_offset = self.transfer.current_offset.wrapping_add(1);
        self.transfer.sector_byte_index += 1;

        let sector_size = self.transfer.sector_size();
        if self.transfer.sector_byte_index as u32 >= sector_size {
            self.transfer.sector_byte_index = 0;
            self.advance_chs();
        }

        if terminal_count {
            let drive = self.transfer.drive;
            self.push_chrn_result(drive, self.transfer.cylinder, self.transfer.head, self.transfer.sector);
            self.drives[drive].busy = false;
            self.dma_request_active = false;
            self.phase = Phase::Result;
            self.raise_irq6();
        }
    }

    fn advance_chs(&mut self) {
        let drive = self.transfer.drive;
        let format = self.drives[drive].format;
        self.transfer.sector += 1;
        if self.transfer.sector as u8 > self.transfer.eot.max(format.num_sectors_per_track) {
            self.transfer.sector = 1;
            if self.transfer.multi_track && self.transfer.head == 0 && format.num_heads > 1 {
                self.transfer.head = 1;
            } else {
                self.transfer.head = 0;
                self.transfer.cylinder = self.transfer.cylinder.wrapping_add(1);
            }
        }
    }
}

impl Default for Fdc {
    fn default() -> Self {
        Self::new()
    }
}

impl PortDevice for Fdc {
    fn read_byte(&mut self, port: u16) -> u8 {
        match port {
            PORT_MSR => self.read_msr(),
            PORT_DATA => self.read_data(),
            _ => 0xFF,
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        match port {
            PORT_DOR => self.write_dor(value),
            PORT_DATA => self.write_data(value),
            _ => {}
        }
    }
}

/// Lets the platform's VRAM-style map reach the FDC's data port as a plain
/// byte device too, for hosts that prefer a memory-mapped front-end; unused
/// by the port-mapped wiring above.
impl MemoryDevice for Fdc {
    fn read_byte(&mut self, _address: u32) -> u8 {
        self.read_data()
    }
    fn write_byte(&mut self, _address: u32, value: u8) {
        self.write_data(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_of(len: usize) -> Rc<RefCell<dyn FloppyImage>> {
        let data: Vec<u8> = (0..len).map(|i| (i & 0xFF) as u8).collect();
        Rc::new(RefCell::new(MemoryImage::new(data)))
    }

    #[test]
    fn read_data_command_walks_to_execution_phase() {
        let mut fdc = Fdc::new();
        fdc.insert_disk(0, FORMAT_360KB, image_of(512 * 18));
        for byte in [0x06u8, 0x00, 0x00, 0x00, 0x01, 0x02, 0x09, 0x2A, 0xFF] {
            fdc.write_byte(PORT_DATA, byte);
        }
        assert!(fdc.dma_request_active());
        assert_eq!(fdc.read_msr() & 0x10, 0x10); // busy
    }

    #[test]
    fn full_sector_transfer_reaches_result_phase_with_irq() {
        let master = Rc::new(RefCell::new(Pic::new(Default::default())));
        master.borrow_mut().write_byte(0x20, 0b0001_0010);
        master.borrow_mut().write_byte(0x21, 0x08);
        master.borrow_mut().write_byte(0x21, 0x00); // unmask all IRQs

        let mut fdc = Fdc::new();
        fdc.set_pic(&master);
        fdc.insert_disk(0, FORMAT_360KB, image_of(512 * 18));
        for byte in [0x06u8, 0x00, 0x00, 0x00, 0x01, 0x02, 0x09, 0x2A, 0xFF] {
            fdc.write_byte(PORT_DATA, byte);
        }
        for i in 0..512u32 {
            let expected = (i & 0xFF) as u8;
            assert_eq!(fdc.produce_byte(), expected);
            let tc = i == 511;
            fdc.complete_dma_cycle(tc);
        }
        assert_eq!(master.borrow_mut().pending_interrupt(), Some(0x08 + FDC_IRQ));
    }

    #[test]
    fn sense_interrupt_status_reports_seek_end() {
        let mut fdc = Fdc::new();
        fdc.write_byte(PORT_DATA, 0x0F); // Seek
        fdc.write_byte(PORT_DATA, 0x00); // drive 0, head 0
        fdc.write_byte(PORT_DATA, 5); // NCN = 5
        assert_eq!(fdc.drives[0].track, 5);

        fdc.write_byte(PORT_DATA, 0x08); // Sense Interrupt Status
        assert_eq!(fdc.read_byte(PORT_DATA), 0x20); // ST0: seek end, drive 0
        assert_eq!(fdc.read_byte(PORT_DATA), 5); // PCN
    }
}
