//! 8255 PPI plus its PC/XT keyboard interface. Grounded byte-for-byte on
//! the reset/ack protocol in the reference keyboard module: falling edge of
//! `enable_clear` while `clock_low` is held triggers an ack, falling edge of
//! `clock_low` restarts the reset timer, and 20ms of `clock_low == false`
//! triggers a self-test scancode. The PPI here folds in the keyboard rather
//! than calling out to it through function-pointer callbacks, since in this
//! crate the two are wired directly rather than through an opaque context.

use log::{debug, trace};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::devices::pic::Pic;
use crate::platform::PortDevice;
use crate::static_vec::StaticVec;

const KEYBOARD_IRQ: u8 = 1;
const KEYBOARD_BUFFER_SIZE: usize = 16;
const RESET_THRESHOLD_MS: u8 = 20;
const RESET_TRIGGERED: u8 = 0xFF;
const SELF_TEST_OK: u8 = 0xAA;

struct Keyboard {
    enable_clear: bool,
    clock_low: bool,
    clock_low_ms: u8,
    waiting_for_ack: bool,
    buffer: StaticVec<u8, KEYBOARD_BUFFER_SIZE>,
}

impl Keyboard {
    fn new() -> Self {
        Self {
            enable_clear: false,
            clock_low: true,
            clock_low_ms: 0,
            waiting_for_ack: false,
            buffer: StaticVec::new(),
        }
    }

    fn key_press(&mut self, scancode: u8) {
        let _ = self.buffer.push(scancode);
    }
}

const DIP_SELECT_BIT: u8 = 1 << 3;

pub struct Ppi {
    keyboard: Keyboard,
    port_a: u8,
    port_b: u8,
    control_word: u8,
    dip_low: u8,
    dip_high: u8,
    pic: Option<Weak<RefCell<Pic>>>,
}

impl Ppi {
    pub fn new() -> Self {
        Self {
            keyboard: Keyboard::new(),
            port_a: 0,
            port_b: 0,
            control_word: 0,
            dip_low: 0,
            dip_high: 0,
            pic: None,
        }
    }

    pub fn set_pic(&mut self, pic: &Rc<RefCell<Pic>>) {
        self.pic = Some(Rc::downgrade(pic));
    }

    /// Sets the two 4-bit DIP banks Port C exposes: low reports FDD
    /// presence/FPU presence/base RAM size, high reports video mode/FDD
    /// count. Which bank Port C shows is selected by Port B bit 3.
    pub fn set_dip_switches(&mut self, low: u8, high: u8) {
        self.dip_low = low & 0x0F;
        self.dip_high = high & 0x0F;
    }

    pub fn key_press(&mut self, scancode: u8) {
        self.keyboard.key_press(scancode);
    }

    /// Timer-2 gate, Port B bit 0 — read by the PIT to drive channel 2.
    pub fn timer2_gate(&self) -> bool {
        self.port_b & 0x01 != 0
    }

    /// PC-speaker-enable bit, Port B bit 1 — combined with the PIT channel
    /// 2 square wave by the host to produce an audible tone.
    pub fn speaker_enable(&self) -> bool {
        self.port_b & 0x02 != 0
    }

    fn send_scancode(&mut self, scancode: u8) {
        self.port_a = scancode;
        if let Some(pic) = self.pic.as_ref().and_then(Weak::upgrade) {
            pic.borrow_mut().raise_irq(KEYBOARD_IRQ);
        }
        self.keyboard.waiting_for_ack = true;
    }

    fn send_next_scancode(&mut self) {
        if self.keyboard.enable_clear || !self.keyboard.clock_low {
            return;
        }
        if self.keyboard.waiting_for_ack {
            return;
        }
        if self.keyboard.buffer.is_empty() {
            return;
        }
        let scancode = *self.keyboard.buffer.get(0).unwrap();
        self.keyboard.buffer.remove(0).unwrap();
        self.send_scancode(scancode);
    }

    fn handle_control(&mut self, enable_clear: bool, clock_low: bool) {
        let old_clock_low = self.keyboard.clock_low;
        let old_enable_clear = self.keyboard.enable_clear;
        self.keyboard.enable_clear = enable_clear;
        self.keyboard.clock_low = clock_low;

        if old_enable_clear && !enable_clear && clock_low {
            trace!("keyboard ack received");
            self.keyboard.waiting_for_ack = false;
        }

        if old_clock_low && !clock_low {
            self.keyboard.clock_low_ms = 0;
        }
    }

    /// Advances the keyboard's reset timer and scancode pump by one
    /// simulated millisecond. Driven by the machine's tick loop, not by the
    /// PIT (the reset threshold is measured in wall-clock milliseconds).
    pub fn tick_ms(&mut self) {
        if !self.keyboard.clock_low {
            if self.keyboard.clock_low_ms == RESET_TRIGGERED {
                return;
            }
            self.keyboard.clock_low_ms += 1;
            if self.keyboard.clock_low_ms < RESET_THRESHOLD_MS {
                return;
            }
            debug!("keyboard reset threshold reached, queuing self-test OK");
            self.keyboard.buffer.clear();
            self.keyboard.waiting_for_ack = false;
            self.keyboard.clock_low_ms = RESET_TRIGGERED;
            self.keyboard.key_press(SELF_TEST_OK);
            return;
        }
        self.send_next_scancode();
    }
}

impl Default for Ppi {
    fn default() -> Self {
        Self::new()
    }
}

impl PortDevice for Ppi {
    fn read_byte(&mut self, port: u16) -> u8 {
        match port & 0x3 {
            0 => self.port_a,
            1 => self.port_b,
            2 => {
                if self.port_b & DIP_SELECT_BIT != 0 {
                    self.dip_high
                } else {
                    self.dip_low
                }
            }
            _ => self.control_word,
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        match port & 0x3 {
            0 => self.port_a = value,
            1 => {
                self.port_b = value;
                let enable_clear = value & 0x80 != 0;
                let clock_low = value & 0x40 != 0;
                self.handle_control(enable_clear, clock_low);
            }
            2 => {} // Port C is read-only in this configuration
            _ => self.control_word = value,
        }
    }
}
