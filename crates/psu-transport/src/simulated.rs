//! ---
//! psu_section: "02-hardware-transport"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "PMBus register access for power-supply units."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::{DeviceAddress, PmbusTransport, TransportError};

/// Entries kept in each of the write journal and the read log.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

/// Result recorded for a journaled write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Failed(TransportError),
}

/// One attempted register write, in the order the bus saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence: u64,
    pub device: DeviceAddress,
    pub command: u8,
    pub value: u8,
    pub outcome: WriteOutcome,
}

impl JournalEntry {
    pub fn applied(&self) -> bool {
        matches!(self.outcome, WriteOutcome::Applied)
    }
}

#[derive(Debug, Default)]
struct BusState {
    registers: HashMap<(DeviceAddress, u8), u8>,
    detached: HashSet<DeviceAddress>,
    failing_reads: HashSet<DeviceAddress>,
    failing_writes: HashSet<DeviceAddress>,
    latency: HashMap<DeviceAddress, Duration>,
    journal: VecDeque<JournalEntry>,
    reads: VecDeque<(DeviceAddress, u8)>,
    next_sequence: u64,
}

fn push_bounded<T>(log: &mut VecDeque<T>, capacity: usize, entry: T) {
    if capacity == 0 {
        return;
    }
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(entry);
}

/// In-memory PMBus register bank.
///
/// Every address answers unless detached. Registers start at zero. Injected
/// latency above the timeout budget surfaces as [`TransportError::Timeout`]
/// immediately instead of blocking the caller. The write journal and read log
/// keep only the most recent `journal_capacity` entries each.
#[derive(Debug)]
pub struct SimulatedPmbus {
    timeout: Duration,
    journal_capacity: usize,
    state: Mutex<BusState>,
}

impl Default for SimulatedPmbus {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl SimulatedPmbus {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            state: Mutex::new(BusState::default()),
        }
    }

    /// Bound both logs to `capacity` entries; 0 turns journalling off.
    pub fn with_journal_capacity(mut self, capacity: usize) -> Self {
        self.journal_capacity = capacity;
        self
    }

    pub fn register(&self, device: DeviceAddress, command: u8) -> u8 {
        self.state
            .lock()
            .registers
            .get(&(device, command))
            .copied()
            .unwrap_or(0)
    }

    /// Overwrite a register behind the engine's back, as a PSU reset would.
    pub fn set_register(&self, device: DeviceAddress, command: u8, value: u8) {
        self.state.lock().registers.insert((device, command), value);
    }

    pub fn detach(&self, device: DeviceAddress) {
        self.state.lock().detached.insert(device);
    }

    pub fn attach(&self, device: DeviceAddress) {
        self.state.lock().detached.remove(&device);
    }

    pub fn fail_reads(&self, device: DeviceAddress, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_reads.insert(device);
        } else {
            state.failing_reads.remove(&device);
        }
    }

    pub fn fail_writes(&self, device: DeviceAddress, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_writes.insert(device);
        } else {
            state.failing_writes.remove(&device);
        }
    }

    pub fn set_latency(&self, device: DeviceAddress, latency: Duration) {
        self.state.lock().latency.insert(device, latency);
    }

    /// Most recent writes attempted, oldest first.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.iter().cloned().collect()
    }

    pub fn clear_journal(&self) {
        let mut state = self.state.lock();
        state.journal.clear();
        state.reads.clear();
    }

    /// Most recent devices and commands read, oldest first. Failed reads
    /// included.
    pub fn reads(&self) -> Vec<(DeviceAddress, u8)> {
        self.state.lock().reads.iter().copied().collect()
    }

    fn precheck(&self, state: &BusState, device: DeviceAddress) -> Result<(), TransportError> {
        if state.detached.contains(&device) {
            return Err(TransportError::NoDevice(device));
        }
        if let Some(latency) = state.latency.get(&device) {
            if *latency > self.timeout {
                return Err(TransportError::Timeout {
                    address: device,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}

impl PmbusTransport for SimulatedPmbus {
    fn read_byte(&self, device: DeviceAddress, command: u8) -> Result<u8, TransportError> {
        let mut state = self.state.lock();
        push_bounded(&mut state.reads, self.journal_capacity, (device, command));
        self.precheck(&state, device)?;
        if state.failing_reads.contains(&device) {
            return Err(TransportError::Nack {
                address: device,
                command,
            });
        }
        let value = state
            .registers
            .get(&(device, command))
            .copied()
            .unwrap_or(0);
        trace!(%device, command, value, "simulated read");
        Ok(value)
    }

    fn write_byte(
        &self,
        device: DeviceAddress,
        command: u8,
        value: u8,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let result = self.precheck(&state, device).and_then(|_| {
            if state.failing_writes.contains(&device) {
                Err(TransportError::Nack {
                    address: device,
                    command,
                })
            } else {
                Ok(())
            }
        });
        if result.is_ok() {
            state.registers.insert((device, command), value);
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let entry = JournalEntry {
            sequence,
            device,
            command,
            value,
            outcome: match &result {
                Ok(()) => WriteOutcome::Applied,
                Err(err) => WriteOutcome::Failed(err.clone()),
            },
        };
        push_bounded(&mut state.journal, self.journal_capacity, entry);
        trace!(%device, command, value, sequence, ok = result.is_ok(), "simulated write");
        result
    }
}
