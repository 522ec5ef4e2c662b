//! An IBM PC/XT-class machine: an 8086/8088 CPU core, the platform fabric
//! that wires it to memory and I/O ports, the peripheral set a PC/XT
//! shipped with (PIC, PIT, PPI/keyboard, FDC, DMA, MDA), and a BIOS layer
//! implementing the handful of `INT` services software expects ROM to
//! provide. [`Machine`] assembles all of it; everything else is reachable
//! for finer-grained testing and tooling.

pub mod bios;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod machine;
pub mod platform;
pub mod static_vec;

pub use error::{ExecutionStatus, PlatformError};
pub use machine::Machine;
