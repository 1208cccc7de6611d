//! Emulated legacy devices for guests.
//!
//! Device models are passive: the I/O-port exit handler calls into them
//! with the decoded port, data and the current guest TSC, and drains
//! the interrupt events they raise.

pub mod pit;

pub use pit::Pit;

use core::fmt;

/// Device-model errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdevError {
    /// Port not owned by this device.
    BadPort,
}

impl fmt::Display for VdevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPort => write!(f, "port not owned by device"),
        }
    }
}

/// An interrupt raised by a device model: line and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqAssert {
    pub irq: u8,
    pub level: u8,
}
