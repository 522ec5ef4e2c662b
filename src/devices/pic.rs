//! 8259 Programmable Interrupt Controller. Two instances are wired up per
//! machine (master, slave); each holds a non-owning `Weak` handle to its
//! cascade sibling rather than an owning pointer, since master and slave are
//! peers, not a parent/child pair.

use log::{debug, trace};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::platform::PortDevice;

/// The master always wires the slave onto IRQ 2 on real PC/XT and AT
/// hardware; this emulator does not model any other cascade line.
const CASCADE_IRQ: u8 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct PicConfig {
    pub is_slave: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    ExpectIcw1,
    ExpectIcw2,
    ExpectIcw3,
    ExpectIcw4,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadSelect {
    Irr,
    Isr,
}

pub struct Pic {
    config: PicConfig,
    init_state: InitState,
    icw1: u8,
    icw2: u8,
    icw3: u8,
    icw4: u8,
    imr: u8,
    irr: u8,
    isr: u8,
    pending_read: Option<ReadSelect>,
    cascade: Option<Weak<RefCell<Pic>>>,
}

impl Pic {
    pub fn new(config: PicConfig) -> Self {
        Self {
            config,
            init_state: InitState::ExpectIcw1,
            icw1: 0,
            icw2: 0,
            icw3: 0,
            icw4: 0,
            imr: 0xFF,
            irr: 0,
            isr: 0,
            pending_read: None,
            cascade: None,
        }
    }

    /// Links this PIC to its cascade sibling. Called on both the master and
    /// the slave when the platform is wired up.
    pub fn set_cascade(&mut self, sibling: &Rc<RefCell<Pic>>) {
        self.cascade = Some(Rc::downgrade(sibling));
    }

    fn is_cascaded_mode(&self) -> bool {
        self.icw1 & 0b10 == 0 // SNGL bit clear => cascaded
    }

    fn needs_icw4(&self) -> bool {
        self.icw1 & 0b1 != 0 // IC4 bit set
    }

    pub fn raise_irq(&mut self, irq: u8) {
        if irq > 7 {
            return;
        }
        trace!("PIC{} raise irq {}", if self.config.is_slave { "2" } else { "1" }, irq);
        self.irr |= 1 << irq;
        if self.config.is_slave {
            if let Some(cascade) = self.cascade.as_ref().and_then(Weak::upgrade) {
                cascade.borrow_mut().raise_irq(CASCADE_IRQ);
            }
        }
    }

    pub fn lower_irq(&mut self, irq: u8) {
        if irq > 7 {
            return;
        }
        self.irr &= !(1 << irq);
        if self.config.is_slave && self.irr == 0 {
            if let Some(cascade) = self.cascade.as_ref().and_then(Weak::upgrade) {
                cascade.borrow_mut().lower_irq(CASCADE_IRQ);
            }
        }
    }

    /// Fully-nested priority arbitration: the lowest-numbered pending,
    /// unmasked IRQ is serviced, but only if no equal-or-higher-priority IRQ
    /// (lower or equal bit index) is already in service. Acknowledging moves
    /// the bit from IRR to ISR and returns the vector `icw2 + irq`.
    pub fn pending_interrupt(&mut self) -> Option<u8> {
        let candidates = self.irr & !self.imr;
        if candidates == 0 {
            return None;
        }
        let irq = candidates.trailing_zeros() as u8;
        let highest_in_service = if self.isr == 0 { 8 } else { self.isr.trailing_zeros() as u8 };
        if irq >= highest_in_service {
            return None;
        }

        if irq == CASCADE_IRQ && !self.config.is_slave {
            if let Some(cascade) = self.cascade.as_ref().and_then(Weak::upgrade) {
                let vector = cascade.borrow_mut().pending_interrupt();
                if vector.is_some() {
                    self.irr &= !(1 << irq);
                    self.isr |= 1 << irq;
                }
                return vector;
            }
        }

        self.irr &= !(1 << irq);
        self.isr |= 1 << irq;
        Some(self.icw2.wrapping_add(irq))
    }

    fn write_command(&mut self, value: u8) {
        const INIT_BIT: u8 = 1 << 4;
        const SELECT_OCW3: u8 = 1 << 3;
        const EOI_BIT: u8 = 1 << 5;
        const SPECIFIC_BIT: u8 = 1 << 6;
        const READ_REGISTER: u8 = 1 << 1;
        const READ_ISR: u8 = 1 << 0;

        if value & INIT_BIT != 0 {
            debug!("PIC ICW1 = {:#04x}", value);
            self.icw1 = value;
            self.irr = 0;
            self.isr = 0;
            self.init_state = InitState::ExpectIcw2;
            return;
        }

        if value & SELECT_OCW3 != 0 {
            if value & READ_REGISTER != 0 {
                self.pending_read = Some(if value & READ_ISR != 0 { ReadSelect::Isr } else { ReadSelect::Irr });
            }
            return;
        }

        if value & EOI_BIT != 0 {
            if value & SPECIFIC_BIT != 0 {
                let irq = value & 0x7;
                self.isr &= !(1 << irq);
            } else if self.isr != 0 {
                let irq = self.isr.trailing_zeros() as u8;
                self.isr &= !(1 << irq);
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.init_state {
            InitState::ExpectIcw2 => {
                self.icw2 = value;
                self.init_state = if self.is_cascaded_mode() {
                    InitState::ExpectIcw3
                } else if self.needs_icw4() {
                    InitState::ExpectIcw4
                } else {
                    InitState::Ready
                };
                debug!("PIC ICW2 = {:#04x}", value);
            }
            InitState::ExpectIcw3 => {
                self.icw3 = value;
                self.init_state = if self.needs_icw4() { InitState::ExpectIcw4 } else { InitState::Ready };
            }
            InitState::ExpectIcw4 => {
                self.icw4 = value;
                self.init_state = InitState::Ready;
            }
            InitState::Ready => self.imr = value,
            InitState::ExpectIcw1 => {}
        }
    }

    fn read_data(&mut self) -> u8 {
        match self.pending_read.take() {
            Some(ReadSelect::Irr) => self.irr,
            Some(ReadSelect::Isr) => self.isr,
            None => self.imr,
        }
    }
}

impl PortDevice for Pic {
    fn read_byte(&mut self, port: u16) -> u8 {
        if port & 1 == 0 {
            0
        } else {
            self.read_data()
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        if port & 1 == 0 {
            self.write_command(value);
        } else {
            self.write_data(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_single(pic: &mut Pic) {
        pic.write_byte(0x20, 0b0001_0010); // ICW1: single, no ICW4
        pic.write_byte(0x21, 0x08); // ICW2: base 0x08
        assert_eq!(pic.init_state, InitState::Ready);
        pic.imr = 0;
    }

    #[test]
    fn single_pic_basic_irq() {
        let mut pic = Pic::new(PicConfig::default());
        init_single(&mut pic);
        pic.raise_irq(3);
        assert_eq!(pic.irr, 1 << 3);
        assert_eq!(pic.pending_interrupt(), Some(0x08 + 3));
        assert_eq!(pic.irr, 0);
        assert_eq!(pic.isr, 1 << 3);
    }

    #[test]
    fn single_pic_priority_and_in_service_blocking() {
        let mut pic = Pic::new(PicConfig::default());
        init_single(&mut pic);
        pic.raise_irq(5);
        assert_eq!(pic.pending_interrupt(), Some(0x08 + 5));
        assert_eq!(pic.isr, 1 << 5);

        pic.raise_irq(7);
        assert_eq!(pic.pending_interrupt(), None);

        pic.raise_irq(3);
        assert_eq!(pic.pending_interrupt(), Some(0x08 + 3));
        assert_eq!(pic.isr, (1 << 5) | (1 << 3));
    }

    #[test]
    fn ocw2_eoi_clears_lowest_in_service_bit() {
        let mut pic = Pic::new(PicConfig::default());
        init_single(&mut pic);
        pic.isr = (1 << 2) | (1 << 5) | (1 << 7);
        pic.write_byte(0x20, 1 << 5); // non-specific EOI
        assert_eq!(pic.isr, (1 << 5) | (1 << 7));
    }

    #[test]
    fn ocw3_read_select_is_one_shot() {
        let mut pic = Pic::new(PicConfig::default());
        init_single(&mut pic);
        pic.irr = 0xAB;
        pic.imr = 0xCD;
        pic.write_byte(0x20, (1 << 3) | (1 << 1)); // OCW3: select read IRR
        assert_eq!(pic.read_byte(0x21), 0xAB);
        assert_eq!(pic.read_byte(0x21), 0xCD);
    }

    #[test]
    fn cascade_slave_raises_master_line_and_priority_follows_it() {
        let master = Rc::new(RefCell::new(Pic::new(PicConfig { is_slave: false })));
        let slave = Rc::new(RefCell::new(Pic::new(PicConfig { is_slave: true })));
        {
            let mut m = master.borrow_mut();
            m.write_byte(0x20, 0b0001_0000); // ICW1: cascaded
            m.write_byte(0x21, 0x08);
            m.write_byte(0x21, 1 << 2); // ICW3: slave on IRQ2
            m.imr = 0;
        }
        {
            let mut s = slave.borrow_mut();
            s.write_byte(0xA0, 0b0001_0000);
            s.write_byte(0xA1, 0x70);
            s.write_byte(0xA1, 2);
            s.imr = 0;
        }
        master.borrow_mut().set_cascade(&slave);
        slave.borrow_mut().set_cascade(&master);

        slave.borrow_mut().raise_irq(3);
        assert_eq!(master.borrow().irr, 1 << 2);
        assert_eq!(master.borrow_mut().pending_interrupt(), Some(0x70 + 3));
        assert_eq!(master.borrow().isr, 1 << 2);
        assert_eq!(slave.borrow().isr, 1 << 3);

        slave.borrow_mut().lower_irq(3);
        // irr already cleared by the ack above, so nothing left to lower.
        assert_eq!(slave.borrow().irr, 0);
    }
}
