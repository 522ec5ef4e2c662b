//! BIOS services: the fixed set of `INT` vectors a PC/XT ROM exposes to
//! software, implemented directly in Rust rather than as fetched/executed
//! machine code. [`crate::machine::Machine`] recognizes these vectors in
//! `StepOutcome::SoftwareInterrupt` and dispatches here instead of letting
//! the CPU core vector through a (nonexistent) ROM interrupt table.

pub mod bda;
pub mod disk;
pub mod keyboard;
pub mod misc;
pub mod time;
pub mod video;
