//! ---
//! psu_section: "02-hardware-transport"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "PMBus register access for power-supply units."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Register-level transport for PSU management.
//!
//! The redundancy engine only ever touches a single PMBus register per device,
//! so the transport contract is a one-byte read and a one-byte write. Every
//! call must complete (or fail) within a bounded time; a transport never
//! leaves an operation pending.

mod simulated;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use simulated::{JournalEntry, SimulatedPmbus, WriteOutcome, DEFAULT_JOURNAL_CAPACITY};

/// Bus number and 7-bit device address of a PSU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl DeviceAddress {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/0x{:02x}", self.bus, self.address)
    }
}

/// Failure modes of a single register operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No device answered at the address.
    #[error("no device at {0}")]
    NoDevice(DeviceAddress),
    /// The device rejected the transfer.
    #[error("device {address} nacked command 0x{command:02x}")]
    Nack { address: DeviceAddress, command: u8 },
    /// The transfer did not complete within the transport budget.
    #[error("transfer to {address} timed out after {timeout_ms}ms")]
    Timeout { address: DeviceAddress, timeout_ms: u64 },
    /// Underlying bus I/O failure.
    #[error("bus i/o error: {0}")]
    Io(String),
}

/// Single-register PMBus access.
pub trait PmbusTransport: Send + Sync {
    /// Read one byte from `command` on the device.
    fn read_byte(&self, device: DeviceAddress, command: u8) -> Result<u8, TransportError>;

    /// Write one byte to `command` on the device.
    fn write_byte(&self, device: DeviceAddress, command: u8, value: u8)
        -> Result<(), TransportError>;
}

impl<T: PmbusTransport + ?Sized> PmbusTransport for Arc<T> {
    fn read_byte(&self, device: DeviceAddress, command: u8) -> Result<u8, TransportError> {
        (**self).read_byte(device, command)
    }

    fn write_byte(
        &self,
        device: DeviceAddress,
        command: u8,
        value: u8,
    ) -> Result<(), TransportError> {
        (**self).write_byte(device, command, value)
    }
}
