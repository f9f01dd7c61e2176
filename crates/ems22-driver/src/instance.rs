use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};

use ems22_transport::{InstanceHandle, SensorBus};
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{DriverError, Result};
use crate::frame::Angle;
use crate::registry::MAX_DAISY_CHAIN;

pub(crate) type BoxedBus = Box<dyn SensorBus + Send>;

/// One interface and the chain of sensors behind it.
///
/// The transport lives inside `gate`: holding the lock is what it means for an
/// update cycle to be in progress. Readings are atomics so lookups never wait
/// on a cycle; they are only written while the gate is held.
pub(crate) struct Instance {
    pub(crate) label: String,
    pub(crate) chain_length: usize,
    pub(crate) parity_checks: bool,
    pub(crate) gate: Mutex<BoxedBus>,
    readings: Box<[AtomicI16]>,
    zeroes: Box<[Angle]>,
    retired: AtomicBool,
    last_cycle: Mutex<Option<OffsetDateTime>>,
}

impl Instance {
    pub(crate) fn new(
        bus: BoxedBus,
        chain_length: usize,
        label: String,
        parity_checks: bool,
    ) -> Self {
        Self {
            label,
            chain_length,
            parity_checks,
            gate: Mutex::new(bus),
            readings: (0..chain_length).map(|_| AtomicI16::new(0)).collect(),
            zeroes: vec![0; chain_length].into_boxed_slice(),
            retired: AtomicBool::new(false),
            last_cycle: Mutex::new(None),
        }
    }

    /// Chain length is in range and both buffers match it.
    pub(crate) fn is_consistent(&self) -> bool {
        (1..MAX_DAISY_CHAIN).contains(&self.chain_length)
            && self.readings.len() == self.chain_length
            && self.zeroes.len() == self.chain_length
    }

    pub(crate) fn check_chain_index(&self, index: usize) -> Result<()> {
        if index >= MAX_DAISY_CHAIN || index >= self.chain_length {
            return Err(DriverError::InvalidChainIndex {
                index,
                chain_length: self.chain_length,
                label: self.label.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn reading(&self, index: usize) -> Angle {
        self.readings[index].load(Ordering::Acquire)
    }

    // Caller must hold the gate.
    pub(crate) fn store_reading(&self, index: usize, angle: Angle) {
        self.readings[index].store(angle, Ordering::Release);
    }

    pub(crate) fn readings(&self) -> Vec<Angle> {
        self.readings
            .iter()
            .map(|r| r.load(Ordering::Acquire))
            .collect()
    }

    // Caller must hold the gate.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cycle(&self, at: OffsetDateTime) {
        *self.last_cycle.lock() = Some(at);
    }

    pub(crate) fn info(&self, handle: InstanceHandle) -> InstanceInfo {
        let last_cycle = *self.last_cycle.lock();
        InstanceInfo {
            handle: handle.index(),
            label: self.label.clone(),
            chain_length: self.chain_length,
            parity_checks: self.parity_checks,
            readings: self.readings(),
            zeroes: self.zeroes.to_vec(),
            last_cycle: last_cycle.and_then(|t| {
                t.format(&time::format_description::well_known::Rfc3339)
                    .ok()
            }),
        }
    }
}

/// Point-in-time view of one live instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub handle: usize,
    pub label: String,
    pub chain_length: usize,
    pub parity_checks: bool,
    pub readings: Vec<Angle>,
    /// Per-position calibration offsets. Reserved; always zero for now.
    pub zeroes: Vec<Angle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<String>,
}
