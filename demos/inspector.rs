//! A minimal single-step inspector: loads a flat binary at a base address
//! into a [`Machine`], then drives it one CPU step at a time from the
//! keyboard, printing register state between steps.
//!
//! This is illustration, not a DOS host: unlike a real PC/XT boot target it
//! does not implement INT 21h or any other loader/OS service, staying on
//! the near side of that boundary. It is not wired into the crate's build;
//! copy it into a `[[bin]]` if you want to run it against a flat `.bin`.

use std::io::{self, Write};

use pcxt86::machine::Machine;

const LOAD_BASE: u32 = 0x0000;
const RESET_CS: u16 = 0x0000;
const RESET_IP: u16 = 0x0000;

fn draw_registers(machine: &Machine) {
    print!("{}{}", termion::clear::All, termion::cursor::Goto(1, 1));
    println!(
        "AX={:04x} BX={:04x} CX={:04x} DX={:04x}",
        machine.cpu.regs.get_word(pcxt86::cpu::registers::RegisterIndex::Ax),
        machine.cpu.regs.get_word(pcxt86::cpu::registers::RegisterIndex::Bx),
        machine.cpu.regs.get_word(pcxt86::cpu::registers::RegisterIndex::Cx),
        machine.cpu.regs.get_word(pcxt86::cpu::registers::RegisterIndex::Dx),
    );
    println!(
        "CS={:04x} IP={:04x} SP={:04x} halted={}",
        machine.cpu.regs.get_word(pcxt86::cpu::registers::RegisterIndex::Cs),
        machine.cpu.regs.ip,
        machine.cpu.regs.get_word(pcxt86::cpu::registers::RegisterIndex::Sp),
        machine.cpu.halted,
    );
    println!("{}", termion::cursor::Goto(1, 4));
    print!("n to step, q to quit > ");
    io::stdout().flush().expect("flush stdout");
}

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).expect("usage: inspector <flat-binary>");
    let image = std::fs::read(&path).expect("program does not exist");

    let mut machine = Machine::new().expect("machine wiring conflict");
    machine.load_image(LOAD_BASE, &image);
    machine.reset(RESET_CS, RESET_IP);

    loop {
        draw_registers(&machine);
        let mut input = String::new();
        io::stdin().read_line(&mut input).expect("read command");
        match input.trim() {
            "q" => break,
            _ => {
                let status = machine.step();
                println!("{}", status);
                if status == pcxt86::ExecutionStatus::Halt {
                    break;
                }
            }
        }
    }
}
