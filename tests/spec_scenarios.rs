//! End-to-end scenarios assembled from a fully wired [`Machine`] rather than
//! a bare `Cpu`/`Platform` pair, exercising the CPU core, the PIC, the
//! keyboard/PPI protocol and the FDC+DMA transfer path the way a caller
//! actually drives them.

use std::cell::RefCell;
use std::rc::Rc;

use pcxt86::cpu::registers::RegisterIndex;
use pcxt86::devices::fdc::{MemoryImage, FORMAT_360KB};
use pcxt86::machine::Machine;
use pcxt86::platform::PortDevice;

fn load_bytes(machine: &mut Machine, base: u32, bytes: &[u8]) {
    machine.load_image(base, bytes);
}

#[test]
fn mov_immediate_loads_register_and_advances_ip() {
    let mut machine = Machine::new().unwrap();
    machine.reset(0x0000, 0x0100);
    load_bytes(&mut machine, 0x0100, &[0xB8, 0x34, 0x12]); // MOV AX, 0x1234
    machine.step();
    assert_eq!(machine.ax(), 0x1234);
    assert_eq!(machine.cpu.regs.ip, 0x0103);
}

#[test]
fn add_with_carry_matches_documented_overflow_case() {
    let mut machine = Machine::new().unwrap();
    machine.reset(0x0000, 0x0000);
    machine.cpu.regs.set_word(RegisterIndex::Bx, 0x0400);
    machine.platform.memory.write_word(0x0400, 0x1234);
    load_bytes(&mut machine, 0x0000, &[0x03, 0x07]); // ADD AX, [BX]
    machine.step();
    assert_eq!(machine.ax(), 0x1236);
    assert!(!machine.cpu.flags.get(pcxt86::cpu::flags::Flags::CF));
    assert!(!machine.cpu.flags.get(pcxt86::cpu::flags::Flags::ZF));

    machine.cpu.regs.set_word(RegisterIndex::Cx, 0xEFFF);
    machine.platform.memory.write_word(0x0400, 0x1234);
    load_bytes(&mut machine, machine.cpu.regs.ip as u32, &[0x01, 0x0F]); // ADD [BX], CX
    machine.step();
    assert_eq!(machine.platform.memory.read_word(0x0400), 0x0233);
    assert!(machine.cpu.flags.get(pcxt86::cpu::flags::Flags::CF));
    assert!(machine.cpu.flags.get(pcxt86::cpu::flags::Flags::AF));
}

#[test]
fn scasb_repe_exhausts_count_on_an_all_match_run() {
    let mut machine = Machine::new().unwrap();
    machine.reset(0x0000, 0x0000);
    machine.cpu.regs.set_word(RegisterIndex::Es, 0x0080);
    machine.cpu.regs.set_word(RegisterIndex::Di, 0x0000);
    machine.cpu.regs.set_word(RegisterIndex::Cx, 3);
    machine.cpu.regs.set_byte(
        pcxt86::cpu::registers::RegisterAddress { index: RegisterIndex::Ax, high: false },
        0xCC,
    );
    for offset in 0..3u32 {
        machine.platform.memory.write_byte(0x0800 + offset, 0xCC);
    }
    load_bytes(&mut machine, 0x0000, &[0xF3, 0xAE]); // REPE SCASB
    machine.step();
    assert_eq!(machine.cpu.regs.get_word(RegisterIndex::Di), 3);
    assert_eq!(machine.cpu.regs.get_word(RegisterIndex::Cx), 0);
    assert!(machine.cpu.flags.get(pcxt86::cpu::flags::Flags::ZF));
}

#[test]
fn pic_priority_favors_lower_irq_number_over_already_raised_higher_one() {
    let machine = Machine::new().unwrap();
    // Unmask everything so priority arbitration, not masking, is what's
    // under test.
    machine.pic_master.borrow_mut().write_byte(0x21, 0x00);
    machine.pic_master.borrow_mut().raise_irq(5);
    machine.pic_master.borrow_mut().raise_irq(2);
    let vector = machine.pic_master.borrow_mut().pending_interrupt();
    assert_eq!(vector, Some(0x08 + 2));
}

#[test]
fn keyboard_reset_sequence_queues_self_test_ok_after_threshold() {
    let mut machine = Machine::new().unwrap();
    machine.ppi.borrow_mut().write_byte(0x61, 0x00); // clock_low held low
    for _ in 0..20 {
        machine.tick_keyboard_ms();
    }
    machine.ppi.borrow_mut().write_byte(0x61, 0x40); // clock_low back high
    machine.tick_keyboard_ms();
    assert_eq!(machine.ppi.borrow().read_byte(0x60), 0xAA);
}

#[test]
fn fdc_read_data_transfers_sector_bytes_through_dma() {
    let mut machine = Machine::new().unwrap();
    let mut bytes = vec![0u8; FORMAT_360KB.num_sectors_per_track as usize * FORMAT_360KB.sector_size as usize * 2];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    let image = Rc::new(RefCell::new(MemoryImage::new(bytes)));
    machine.fdc.borrow_mut().insert_disk(0, FORMAT_360KB, image);

    // Program DMA channel 2, write-to-memory (peripheral->memory), 512
    // bytes to physical 0x1000, page 0.
    machine.dma.borrow_mut().write_byte(0x0B, 0x46);
    machine.dma.borrow_mut().write_byte(0x0C, 0x00);
    machine.dma.borrow_mut().write_byte(0x04, 0x00);
    machine.dma.borrow_mut().write_byte(0x04, 0x10);
    machine.dma.borrow_mut().write_byte(0x81, 0x00);
    machine.dma.borrow_mut().write_byte(0x0C, 0x00);
    machine.dma.borrow_mut().write_byte(0x05, 0xFF);
    machine.dma.borrow_mut().write_byte(0x05, 0x01);
    machine.dma.borrow_mut().write_byte(0x0A, 0x02);

    // Issue FDC Read Data: drive 0, head 0, cylinder 0, sector 1, N=2, EOT=9.
    let read_data_opcode = 0x06;
    machine.fdc.borrow_mut().write_byte(0x3F5, read_data_opcode);
    machine.fdc.borrow_mut().write_byte(0x3F5, 0x00); // drive/head
    machine.fdc.borrow_mut().write_byte(0x3F5, 0x00); // cylinder
    machine.fdc.borrow_mut().write_byte(0x3F5, 0x01); // sector
    machine.fdc.borrow_mut().write_byte(0x3F5, 0x02); // N
    machine.fdc.borrow_mut().write_byte(0x3F5, 0x09); // EOT
    machine.fdc.borrow_mut().write_byte(0x3F5, 0x2A); // GPL
    machine.fdc.borrow_mut().write_byte(0x3F5, 0xFF); // DTL

    for _ in 0..512 {
        let address = machine.dma.borrow().physical_address(2);
        let byte = machine.fdc.borrow_mut().produce_byte();
        machine.platform.memory.write_byte(address, byte);
        let tc = machine.dma.borrow_mut().advance(2);
        machine.fdc.borrow_mut().complete_dma_cycle(tc);
    }

    for k in 0..512u32 {
        assert_eq!(machine.platform.memory.read_byte(0x1000 + k), (k % 256) as u8);
    }
    assert!(machine.pic_master.borrow_mut().pending_interrupt().is_some());
}
