//! INT 1Ah time-of-day services: read/set the tick counter the PIT's
//! 18.2 Hz channel 0 output is expected to advance via
//! [`bda::increment_timer_ticks`].

use crate::bios::bda;
use crate::cpu::registers::RegisterIndex;
use crate::cpu::Cpu;
use crate::platform::Platform;

pub fn handle(cpu: &mut Cpu, platform: &Platform) {
    let ah = cpu.regs.get_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true });
    match ah {
        0x00 => read_system_time(cpu, platform),
        0x01 => set_system_time(cpu, platform),
        other => log::warn!("INT 1Ah: unimplemented AH={:#04x}", other),
    }
}

fn read_system_time(cpu: &mut Cpu, platform: &Platform) {
    let ticks = bda::read_timer_ticks(platform);
    cpu.regs.set_word(RegisterIndex::Cx, (ticks >> 16) as u16);
    cpu.regs.set_word(RegisterIndex::Dx, (ticks & 0xFFFF) as u16);
    let overflow = bda::take_timer_overflow(platform);
    cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false }, overflow);
}

fn set_system_time(cpu: &Cpu, platform: &Platform) {
    let cx = cpu.regs.get_word(RegisterIndex::Cx) as u32;
    let dx = cpu.regs.get_word(RegisterIndex::Dx) as u32;
    bda::set_timer_ticks(platform, (cx << 16) | dx);
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

    #[test]
    fn read_reports_accumulated_ticks_and_clears_overflow() {
        let mut cpu = Cpu::new();
        let platform = platform_with_ram();
        bda::init(&platform);
        bda::set_timer_ticks(&platform, 0x0001_0000);
        cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true }, 0x00);
        handle(&mut cpu, &platform);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Cx), 1);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Dx), 0);
    }

    #[test]
    fn set_then_read_round_trips() {
        let mut cpu = Cpu::new();
        let platform = platform_with_ram();
        bda::init(&platform);
        cpu.regs.set_byte(crate::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: true }, 0x01);
        cpu.regs.set_word(RegisterIndex::Cx, 0);
        cpu.regs.set_word(RegisterIndex::Dx, 0x1234);
        handle(&mut cpu, &platform);
        assert_eq!(bda::read_timer_ticks(&platform), 0x1234);
    }
}
