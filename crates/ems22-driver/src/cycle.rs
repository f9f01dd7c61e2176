use ems22_transport::InstanceHandle;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::error::{DriverError, Result};
use crate::frame::{decode_frame, Frame};
use crate::instance::Instance;
use crate::metrics::DriverMetrics;

/// Overall outcome of polling, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Ok,
    /// Some sensors failed this cycle; the others were updated.
    PartialFailure,
    /// An instance invariant was broken and nothing was read from it.
    Fatal,
}

impl UpdateStatus {
    /// The more severe of the two.
    pub fn worst(self, other: UpdateStatus) -> UpdateStatus {
        self.max(other)
    }
}

/// Result of one update cycle on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub failed: usize,
    pub total: usize,
}

impl CycleReport {
    pub fn status(&self) -> UpdateStatus {
        if self.failed == 0 {
            UpdateStatus::Ok
        } else {
            UpdateStatus::PartialFailure
        }
    }
}

/// Poll every sensor in the chain once.
///
/// Blocks while another cycle holds the instance's gate. A failed read or a
/// rejected frame leaves that position's previous reading in place and the
/// cycle moves on to the next sensor.
pub(crate) fn run(
    handle: InstanceHandle,
    inst: &Instance,
    metrics: Option<&DriverMetrics>,
) -> Result<CycleReport> {
    let mut bus = inst.gate.lock();

    // Ended while we were waiting for the gate.
    if inst.is_retired() {
        return Err(DriverError::InvalidHandle(handle));
    }

    if !inst.is_consistent() {
        error!(%handle, label = %inst.label, chain_length = inst.chain_length, "wrong daisy chain length");
        return Err(DriverError::Fatal {
            handle,
            label: inst.label.clone(),
            chain_length: inst.chain_length,
        });
    }

    let mut failed = 0;
    for position in 0..inst.chain_length {
        let raw = match bus.read(handle) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%handle, position, error = %e, "failed reading sensor in chain");
                if let Some(m) = metrics {
                    m.read_failures.inc();
                }
                failed += 1;
                continue;
            }
        };

        match decode_frame(raw, inst.parity_checks) {
            Ok(angle) => {
                debug!(%handle, position, frame = %Frame::new(raw), angle, "decoded");
                if let Some(m) = metrics {
                    m.frames_decoded.inc();
                }
                inst.store_reading(position, angle);
            }
            Err(fault) => {
                warn!(%handle, label = %inst.label, position, "{fault}");
                if let Some(m) = metrics {
                    m.decode_faults.inc();
                }
                failed += 1;
            }
        }
    }
    inst.mark_cycle(OffsetDateTime::now_utc());
    drop(bus);

    let report = CycleReport {
        failed,
        total: inst.chain_length,
    };
    if failed > 0 {
        warn!(
            %handle,
            label = %inst.label,
            "polling {} out of {} sensors failed",
            failed,
            inst.chain_length
        );
    }
    Ok(report)
}
