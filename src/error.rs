//! Typed errors for the pieces of the core that need to surface a failure
//! across a function boundary rather than encode it as a status byte.
//!
//! Peripheral-internal failures (an FDC read past the end of an image, an
//! invalid opcode) are not represented here: those are reported through the
//! channel the hardware itself uses (result bytes, CPU execution status).
//! This module only covers programmer-visible setup mistakes: platform
//! registration conflicts.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum PlatformError {
    #[error("a device of this kind is already registered")]
    DuplicateEntryType,
    #[error("address range overlaps an existing entry")]
    OverlappingRange,
    #[error("the memory or port map is full")]
    MapFull,
}

/// Outcome of a single CPU step, returned to the host's main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Halt,
    UnhandledInterrupt(u8),
    InvalidOpcode,
    DivideByZero,
    BusError,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Halt => write!(f, "halted"),
            ExecutionStatus::UnhandledInterrupt(n) => write!(f, "unhandled interrupt {:#04x}", n),
            ExecutionStatus::InvalidOpcode => write!(f, "invalid opcode"),
            ExecutionStatus::DivideByZero => write!(f, "divide by zero"),
            ExecutionStatus::BusError => write!(f, "bus error"),
        }
    }
}
