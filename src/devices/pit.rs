//! 8253 Programmable Interval Timer: three independent channels behind a
//! shared control port. Channel 0 drives IRQ0 through the PIC; channel 2's
//! square wave, gated by PPI Port B bit 0, feeds the PC speaker.

use log::{debug, trace};

use crate::platform::PortDevice;

const BASE_FREQUENCY: u32 = 1_193_182;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LatchCommand,
    LowByte,
    HighByte,
    LowThenHigh,
}

impl AccessMode {
    fn from_bits(bits: u8) -> AccessMode {
        match bits & 0x3 {
            0 => AccessMode::LatchCommand,
            1 => AccessMode::LowByte,
            2 => AccessMode::HighByte,
            _ => AccessMode::LowThenHigh,
        }
    }
}

/// One of the PIT's three independent counters.
pub struct PitChannel {
    mode: u8,
    access_mode: AccessMode,
    reload: u16,
    counter: u16,
    output: bool,
    /// Tracks which half of a `LowThenHigh` write/read is next.
    awaiting_high_byte: bool,
    latched: Option<u16>,
    write_low: u8,
}

impl PitChannel {
    fn new() -> Self {
        Self {
            mode: 0,
            access_mode: AccessMode::LowThenHigh,
            reload: 0,
            counter: 0,
            output: true,
            awaiting_high_byte: false,
            latched: None,
            write_low: 0,
        }
    }

    fn set_control(&mut self, access_bits: u8, mode: u8) {
        let access_mode = AccessMode::from_bits(access_bits);
        if access_mode == AccessMode::LatchCommand {
            self.latched = Some(self.counter);
            return;
        }
        self.access_mode = access_mode;
        self.mode = mode & 0x7;
        self.awaiting_high_byte = false;
        debug!("PIT channel: mode {} access {:?}", self.mode, self.access_mode);
    }

    fn write_data(&mut self, value: u8) {
        match self.access_mode {
            AccessMode::LatchCommand => {}
            AccessMode::LowByte => {
                self.reload = value as u16;
                self.reload_counter();
            }
            AccessMode::HighByte => {
                self.reload = (value as u16) << 8;
                self.reload_counter();
            }
            AccessMode::LowThenHigh => {
                if !self.awaiting_high_byte {
                    self.write_low = value;
                    self.awaiting_high_byte = true;
                } else {
                    self.reload = (self.write_low as u16) | ((value as u16) << 8);
                    self.awaiting_high_byte = false;
                    self.reload_counter();
                }
            }
        }
    }

    fn reload_counter(&mut self) {
        self.counter = self.effective_reload();
        trace!("PIT reload {} (mode {})", self.counter, self.mode);
    }

    fn effective_reload(&self) -> u16 {
        if self.reload == 0 { 0xFFFF } else { self.reload.wrapping_sub(1) }
    }

    fn read_data(&mut self) -> u8 {
        let value = self.latched.take().unwrap_or(self.counter);
        match self.access_mode {
            AccessMode::LowByte => value as u8,
            AccessMode::HighByte => (value >> 8) as u8,
            AccessMode::LowThenHigh => {
                if !self.awaiting_high_byte {
                    self.awaiting_high_byte = true;
                    value as u8
                } else {
                    self.awaiting_high_byte = false;
                    (value >> 8) as u8
                }
            }
            AccessMode::LatchCommand => value as u8,
        }
    }

    /// Advances this channel by one PIT clock. Only modes 2 (rate generator)
    /// and 3 (square wave) change `output` observably; the others are
    /// decoded and counted but their output transitions are not modeled.
    pub fn tick(&mut self) {
        if self.reload == 0 && self.counter == 0 {
            return;
        }
        if self.counter == 0 {
            self.counter = self.effective_reload();
        } else {
            self.counter -= 1;
        }

        match self.mode {
            2 => {
                self.output = self.counter != 0;
                if self.counter == 0 {
                    self.counter = self.effective_reload();
                }
            }
            3 => {
                if self.counter == 0 {
                    self.output = !self.output;
                    self.counter = self.effective_reload();
                }
            }
            _ => {}
        }
    }

    pub fn output(&self) -> bool {
        self.output
    }

    /// The frequency this channel's reload value produces, per spec:
    /// `1_193_182 / reload`, with `reload == 0` treated as 65536.
    pub fn frequency_hz(&self) -> f64 {
        let divisor = if self.reload == 0 { 65536 } else { self.reload as u32 };
        BASE_FREQUENCY as f64 / divisor as f64
    }
}

impl Default for PitChannel {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Pit {
    pub channels: [PitChannel; 3],
}

impl Pit {
    pub fn new() -> Self {
        Self {
            channels: [PitChannel::new(), PitChannel::new(), PitChannel::new()],
        }
    }

    /// Advances all three channels by one PIT clock tick.
    pub fn tick(&mut self) {
        for channel in &mut self.channels {
            channel.tick();
        }
    }
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

impl PortDevice for Pit {
    fn read_byte(&mut self, port: u16) -> u8 {
        match port & 0x3 {
            0..=2 => self.channels[(port & 0x3) as usize].read_data(),
            _ => 0, // the control port is write-only
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        match port & 0x3 {
            0..=2 => self.channels[(port & 0x3) as usize].write_data(value),
            _ => {
                let select = (value >> 6) & 0x3;
                if select == 3 {
                    return; // read-back command, not modeled
                }
                let access_bits = (value >> 4) & 0x3;
                let mode = (value >> 1) & 0x7;
                self.channels[select as usize].set_control(access_bits, mode);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_then_high_write_loads_reload_and_reports_frequency() {
        let mut pit = Pit::new();
        pit.write_byte(0x43, 0b00_11_011_0); // channel 0, LSB/MSB, mode 3
        pit.write_byte(0x40, 0x00);
        pit.write_byte(0x40, 0x04); // reload = 0x0400 = 1024
        assert_eq!(pit.channels[0].reload, 1024);
        assert!((pit.channels[0].frequency_hz() - 1_193_182.0 / 1024.0).abs() < 0.01);
    }

    #[test]
    fn reload_zero_means_65536() {
        let mut pit = Pit::new();
        pit.write_byte(0x43, 0b00_11_011_0);
        pit.write_byte(0x40, 0x00);
        pit.write_byte(0x40, 0x00);
        assert!((pit.channels[0].frequency_hz() - 1_193_182.0 / 65536.0).abs() < 0.01);
    }

    #[test]
    fn mode3_square_wave_toggles_output() {
        let mut pit = Pit::new();
        pit.write_byte(0x43, 0b00_11_011_0); // channel 0, mode 3
        pit.write_byte(0x40, 0x02); // reload = 2
        pit.write_byte(0x40, 0x00);
        let initial = pit.channels[0].output();
        for _ in 0..4 {
            pit.channels[0].tick();
        }
        assert_ne!(pit.channels[0].output(), initial);
    }

    #[test]
    fn latch_command_freezes_counter_for_one_read() {
        let mut pit = Pit::new();
        pit.write_byte(0x43, 0b00_11_011_0);
        pit.write_byte(0x40, 0x10);
        pit.write_byte(0x40, 0x00);
        pit.write_byte(0x43, 0b00_00_000_0); // latch channel 0
        let before = pit.channels[0].read_data();
        pit.channels[0].tick();
        pit.channels[0].tick();
        // A fresh latch picks up the post-tick value; the first read above
        // already consumed the earlier latch.
        assert_eq!(before, 0x10);
    }
}
