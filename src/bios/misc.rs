//! Small single-purpose BIOS services: print-screen (INT 05h, a no-op
//! here — there is no printer), equipment determination (INT 11h) and
//! memory-size determination (INT 12h), both single-register reads out of
//! already-modeled BDA fields.

use crate::bios::bda;
use crate::cpu::registers::RegisterIndex;
use crate::cpu::Cpu;
use crate::platform::Platform;

pub fn print_screen(_cpu: &mut Cpu, _platform: &Platform) {
    log::trace!("INT 05h: print-screen requested, no printer attached");
}

pub fn equipment_determination(cpu: &mut Cpu, platform: &Platform) {
    cpu.regs.set_word(RegisterIndex::Ax, bda::read_u16(platform, bda::EQUIPMENT_WORD));
}

pub fn memory_size_determination(cpu: &mut Cpu, platform: &Platform) {
    cpu.regs.set_word(RegisterIndex::Ax, bda::read_u16(platform, bda::MEMORY_SIZE_KB));
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
    fn equipment_word_reads_back_power_on_value() {
        let mut cpu = Cpu::new();
        let platform = platform_with_ram();
        bda::init(&platform);
        equipment_determination(&mut cpu, &platform);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Ax), 0x0030);
    }

    #[test]
    fn memory_size_reads_640k() {
        let mut cpu = Cpu::new();
        let platform = platform_with_ram();
        bda::init(&platform);
        memory_size_determination(&mut cpu, &platform);
        assert_eq!(cpu.regs.get_word(RegisterIndex::Ax), 640);
    }
}
