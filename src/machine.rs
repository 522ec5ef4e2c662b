//! Wires a [`Cpu`] to the platform fabric and every peripheral, and owns the
//! BIOS interrupt-dispatch policy: `StepOutcome::SoftwareInterrupt` and the
//! PIC's acknowledged hardware vectors are routed either to a Rust function
//! standing in for ROM (BIOS-owned vectors, and the three hardware IRQs this
//! platform's BIOS services, since there is no ROM to run an ISR) or to a
//! real vectored entry through [`Cpu::enter_interrupt`] for everything else.
//! Generalizes the teacher's `Emulator::run` main loop (`lib.rs`) from a
//! 68k `clock_cycle`/`serve_interrupt_requests` pair to the 8086's
//! PIC-mediated interrupt model.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bios::{bda, disk, keyboard, misc, time, video};
use crate::cpu::flags::Flags;
use crate::cpu::registers::RegisterIndex;
use crate::cpu::{Cpu, StepOutcome};
use crate::devices::dma::Dma;
use crate::devices::fdc::Fdc;
use crate::devices::mda::Mda;
use crate::devices::pic::{Pic, PicConfig};
use crate::devices::pit::Pit;
use crate::devices::ppi::Ppi;
use crate::error::{ExecutionStatus, PlatformError};
use crate::platform::{DeviceKind, MemoryDevice, Platform, PortDevice};

const MEMORY_SIZE: usize = 640 * 1024;
const MDA_VRAM_BASE: u32 = 0xB0000;
const MDA_VRAM_END: u32 = 0xB0FFF;

const PIC_MASTER_BASE: u8 = 0x08;
const PIC_SLAVE_BASE: u8 = 0x70;
const IRQ_TIMER: u8 = 0;
const IRQ_KEYBOARD: u8 = 1;
const PORT_KEYBOARD_DATA: u16 = 0x60;

struct Ram {
    data: Vec<u8>,
}

impl Ram {
    fn new(size: usize) -> Self {
        Self { data: vec![0; size] }
    }
}

impl MemoryDevice for Ram {
    fn read_byte(&mut self, address: u32) -> u8 {
        *self.data.get(address as usize).unwrap_or(&0xFF)
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        if let Some(slot) = self.data.get_mut(address as usize) {
            *slot = value;
        }
    }
}

/// The assembled machine: CPU, platform fabric, and every peripheral this
/// platform wires up, each reachable both through the platform's bus (for
/// the CPU's own accesses) and directly (for the BIOS layer and tick-driven
/// time sources, which need more than byte-at-a-time port access).
pub struct Machine {
    pub cpu: Cpu,
    pub platform: Platform,
    pub pic_master: Rc<RefCell<Pic>>,
    pub pic_slave: Rc<RefCell<Pic>>,
    pub pit: Rc<RefCell<Pit>>,
    pub ppi: Rc<RefCell<Ppi>>,
    pub fdc: Rc<RefCell<Fdc>>,
    pub dma: Rc<RefCell<Dma>>,
    pub mda: Rc<RefCell<Mda>>,
    timer_output_high: bool,
}

impl Machine {
    pub fn new() -> Result<Self, PlatformError> {
        let mut platform = Platform::new();

        let ram: Rc<RefCell<dyn MemoryDevice>> = Rc::new(RefCell::new(Ram::new(MEMORY_SIZE)));
        platform.memory.register(DeviceKind::Ram, 0, (MEMORY_SIZE - 1) as u32, ram)?;

        let mda = Rc::new(RefCell::new(Mda::new()));
        platform.memory.register(DeviceKind::Mda, MDA_VRAM_BASE, MDA_VRAM_END, mda.clone())?;
        platform.ports.register(DeviceKind::Mda, 0x3B0, 0x3BF, mda.clone())?;

        let pic_master = Rc::new(RefCell::new(Pic::new(PicConfig { is_slave: false })));
        let pic_slave = Rc::new(RefCell::new(Pic::new(PicConfig { is_slave: true })));
        pic_master.borrow_mut().set_cascade(&pic_slave);
        pic_slave.borrow_mut().set_cascade(&pic_master);
        platform.ports.register(DeviceKind::PicMaster, 0x20, 0x21, pic_master.clone())?;
        platform.ports.register(DeviceKind::PicSlave, 0xA0, 0xA1, pic_slave.clone())?;

        let pit = Rc::new(RefCell::new(Pit::new()));
        platform.ports.register(DeviceKind::Pit, 0x40, 0x43, pit.clone())?;

        let ppi = Rc::new(RefCell::new(Ppi::new()));
        ppi.borrow_mut().set_pic(&pic_master);
        platform.ports.register(DeviceKind::Ppi, 0x60, 0x63, ppi.clone())?;

        let fdc = Rc::new(RefCell::new(Fdc::new()));
        fdc.borrow_mut().set_pic(&pic_master);
        platform.ports.register(DeviceKind::Fdc, 0x3F2, 0x3F5, fdc.clone())?;

        let dma = Rc::new(RefCell::new(Dma::new()));
        platform.ports.register(DeviceKind::Dma, 0x00, 0x0F, dma.clone())?;
        platform.ports.register(DeviceKind::DmaPage, 0x80, 0x8F, dma.clone())?;

        bda::init(&platform);
        init_pic(&pic_master, 0x20, 0x21, PIC_MASTER_BASE, Some(1 << 2)); // slave cascades on IRQ2
        init_pic(&pic_slave, 0xA0, 0xA1, PIC_SLAVE_BASE, Some(2));
        // This PC/XT build wires both the keyboard (IRQ1) and the FDC
        // (IRQ6) straight onto the master; the slave is cascaded for
        // completeness but nothing ever raises through it, so it stays
        // fully masked.
        let master_mask: u8 = !((1u8 << IRQ_TIMER) | (1u8 << IRQ_KEYBOARD) | (1u8 << 6));
        pic_master.borrow_mut().write_byte(0x21, master_mask);
        pic_slave.borrow_mut().write_byte(0xA1, 0xFF);

        Ok(Self {
            cpu: Cpu::new(),
            platform,
            pic_master,
            pic_slave,
            pit,
            ppi,
            fdc,
            dma,
            mda,
            timer_output_high: false,
        })
    }

    pub fn reset(&mut self, cs: u16, ip: u16) {
        self.cpu.reset(cs, ip);
    }

    /// Feeds a keyboard make/break scancode in from the host (real key
    /// capture is out of scope; the host owns that).
    pub fn key_press(&mut self, scancode: u8) {
        self.ppi.borrow_mut().key_press(scancode);
    }

    /// Advances the keyboard's millisecond-resolution reset/ack timer. The
    /// host drives this at real wall-clock millisecond granularity.
    pub fn tick_keyboard_ms(&mut self) {
        self.ppi.borrow_mut().tick_ms();
    }

    /// Advances the PIT by one input clock cycle and raises IRQ0 on
    /// channel 0's output rising edge, the way the timer line is physically
    /// wired on real hardware.
    pub fn tick_pit(&mut self) {
        self.pit.borrow_mut().tick();
        let output = self.pit.borrow().channels[0].output();
        if output && !self.timer_output_high {
            self.pic_master.borrow_mut().raise_irq(IRQ_TIMER);
        }
        self.timer_output_high = output;
    }

    /// Executes one CPU step: services a pending PIC interrupt if `IF` is
    /// set, then fetches and executes one instruction.
    pub fn step(&mut self) -> ExecutionStatus {
        if self.cpu.flags.get(Flags::IF) {
            if let Some(vector) = self.pic_master.borrow_mut().pending_interrupt() {
                self.dispatch_hardware_vector(vector);
            }
        }

        if self.cpu.halted {
            return ExecutionStatus::Halt;
        }

        let trap_pending = self.cpu.flags.get(Flags::TF);

        match self.cpu.step_instruction(&mut self.platform) {
            StepOutcome::Normal => {
                if trap_pending {
                    self.cpu.enter_interrupt(0x01, &mut self.platform);
                }
                ExecutionStatus::Success
            }
            StepOutcome::Halt => {
                self.cpu.halted = true;
                ExecutionStatus::Halt
            }
            StepOutcome::SoftwareInterrupt(vector) => {
                self.dispatch_software_vector(vector);
                ExecutionStatus::Success
            }
            StepOutcome::InvalidOpcode => ExecutionStatus::InvalidOpcode,
            StepOutcome::DivideByZero => {
                self.cpu.enter_interrupt(0x00, &mut self.platform);
                ExecutionStatus::DivideByZero
            }
            StepOutcome::Into => {
                self.cpu.enter_interrupt(0x04, &mut self.platform);
                ExecutionStatus::Success
            }
        }
    }

    fn dispatch_software_vector(&mut self, vector: u8) {
        match vector {
            0x05 => misc::print_screen(&mut self.cpu, &self.platform),
            0x10 => video::handle(&mut self.cpu, &self.platform, &mut self.mda.borrow_mut()),
            0x11 => misc::equipment_determination(&mut self.cpu, &self.platform),
            0x12 => misc::memory_size_determination(&mut self.cpu, &self.platform),
            0x13 => {
                disk::handle(&mut self.cpu, &self.platform, &mut self.fdc.borrow_mut(), &mut self.dma.borrow_mut());
                // The transfer above already ran to completion synchronously;
                // clear the IRQ6 line it raised so it isn't re-delivered.
                self.pic_master.borrow_mut().lower_irq(6);
            }
            0x16 => keyboard::handle(&mut self.cpu, &self.platform),
            0x1A => time::handle(&mut self.cpu, &self.platform),
            other => self.cpu.enter_interrupt(other, &mut self.platform),
        }
    }

    fn dispatch_hardware_vector(&mut self, vector: u8) {
        let irq = vector.wrapping_sub(PIC_MASTER_BASE);
        match irq {
            IRQ_TIMER => {
                bda::increment_timer_ticks(&self.platform);
                self.pic_master.borrow_mut().write_byte(0x20, 0x20);
            }
            IRQ_KEYBOARD => {
                let scancode = self.platform.ports.read_byte(PORT_KEYBOARD_DATA);
                keyboard::enqueue_scancode(&self.platform, scancode);
                self.pic_master.borrow_mut().write_byte(0x20, 0x20);
            }
            _ => self.cpu.enter_interrupt(vector, &mut self.platform),
        }
    }

    /// Loads a flat binary image at a physical address (used by the demo
    /// harness to boot a `.COM`-style blob without a real BIOS loader).
    pub fn load_image(&mut self, base: u32, image: &[u8]) {
        for (i, byte) in image.iter().enumerate() {
            self.platform.memory.write_byte(base + i as u32, *byte);
        }
    }

    pub fn ax(&self) -> u16 {
        self.cpu.regs.get_word(RegisterIndex::Ax)
    }
}

fn init_pic(pic: &Rc<RefCell<Pic>>, command_port: u16, data_port: u16, base: u8, icw3: Option<u8>) {
    let mut p = pic.borrow_mut();
    let icw1 = if icw3.is_some() { 0b0001_0001 } else { 0b0001_0011 };
    p.write_byte(command_port, icw1); // ICW1: edge-triggered, needs ICW4
    p.write_byte(data_port, base); // ICW2: vector base
    if let Some(icw3) = icw3 {
        p.write_byte(data_port, icw3); // ICW3: cascade wiring
    }
    p.write_byte(data_port, 0x01); // ICW4: 8086 mode
    p.write_byte(data_port, 0xFF); // mask everything until the caller unmasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_machine_registers_every_peripheral_without_conflict() {
        let machine = Machine::new().unwrap();
        assert_eq!(machine.ax(), 0);
    }

    #[test]
    fn timer_tick_eventually_raises_irq0() {
        let mut machine = Machine::new().unwrap();
        machine.pit.borrow_mut().write_byte(0x43, 0b00_11_010_0); // channel 0, LSB/MSB, mode 2
        machine.pit.borrow_mut().write_byte(0x40, 0x04);
        machine.pit.borrow_mut().write_byte(0x40, 0x00);
        let mut raised = false;
        for _ in 0..16 {
            machine.tick_pit();
            if machine.pic_master.borrow_mut().pending_interrupt() == Some(PIC_MASTER_BASE + IRQ_TIMER) {
                raised = true;
                break;
            }
        }
        assert!(raised);
    }

    #[test]
    fn int10h_teletype_writes_into_mda_vram() {
        let mut machine = Machine::new().unwrap();
        machine.cpu.regs.set_byte(
            crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true },
            0x0E,
        );
        machine.cpu.regs.set_byte(
            crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false },
            b'A',
        );
        machine.dispatch_software_vector(0x10);
        let (glyph, _) = machine.mda.borrow().render_cell(0, 0);
        assert_eq!(glyph, b'A');
    }

    #[test]
    fn trap_flag_vectors_into_int1_after_one_instruction() {
        let mut machine = Machine::new().unwrap();
        // INT 1 handler lives at 0x0050:0x0000
        machine.platform.memory.write_word(0x04, 0x0000);
        machine.platform.memory.write_word(0x06, 0x0050);
        machine.load_image(0, &[0x90]); // NOP
        machine.cpu.flags.set_flag(Flags::TF, true);
        machine.step();
        assert_eq!(machine.cpu.regs.get_word(RegisterIndex::Cs), 0x0050);
        assert_eq!(machine.cpu.regs.ip, 0x0000);
        assert!(!machine.cpu.flags.get(Flags::TF));
    }

    #[test]
    fn keyboard_irq_path_enqueues_translated_ascii() {
        let mut machine = Machine::new().unwrap();
        machine.key_press(0x1E); // 'a' make code
        machine.tick_keyboard_ms();
        machine.dispatch_hardware_vector(PIC_MASTER_BASE + IRQ_KEYBOARD);
        machine.cpu.regs.set_byte(
            crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true },
            0x00,
        );
        keyboard::handle(&mut machine.cpu, &machine.platform);
        assert_eq!(
            machine.cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false }),
            b'a'
        );
    }
}
