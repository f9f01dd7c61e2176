use std::sync::Arc;

use ems22_transport::{InstanceHandle, SensorBus};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::cycle::{self, CycleReport, UpdateStatus};
use crate::error::{DriverError, Result};
use crate::frame::Angle;
use crate::instance::{Instance, InstanceInfo};
use crate::metrics::DriverMetrics;

/// Number of independent interfaces a driver can serve.
pub const MAX_INSTANCES: usize = 3;
/// Exclusive upper bound on sensors per daisy chain.
pub const MAX_DAISY_CHAIN: usize = 5;
/// Label used when an instance is started without one.
pub const DEFAULT_LABEL: &str = "ems22a instance";

enum Slot {
    Free,
    /// Claimed by a `start_instance` that has not finished yet.
    Reserved,
    Live(Arc<Instance>),
}

struct Slots {
    entries: [Slot; MAX_INSTANCES],
    // Reserved and live slots.
    occupied: usize,
}

/// Registry of EMS22A sensor chains and the entry point for polling them.
///
/// All methods take `&self`; share the driver across threads with an `Arc`.
/// Update cycles on one instance are serialised, cycles on different
/// instances may run in parallel, and angle lookups never wait for a cycle.
pub struct Ems22Driver {
    slots: RwLock<Slots>,
    metrics: Option<DriverMetrics>,
}

impl Default for Ems22Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Ems22Driver {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: std::array::from_fn(|_| Slot::Free),
                occupied: 0,
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DriverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start a new instance on the first free slot.
    ///
    /// The chain length is validated before the transport is touched. If the
    /// transport's `init` fails, its `deinit` is still called so that it can
    /// release whatever it acquired, and the slot is given back.
    pub fn start_instance<B>(
        &self,
        bus: B,
        chain_length: usize,
        label: Option<&str>,
        disable_parity: bool,
    ) -> Result<InstanceHandle>
    where
        B: SensorBus + Send + 'static,
    {
        if !(1..MAX_DAISY_CHAIN).contains(&chain_length) {
            return Err(DriverError::BadChainLength(chain_length));
        }

        let reservation = self.reserve()?;
        let handle = reservation.handle;
        let label = label.unwrap_or(DEFAULT_LABEL).to_string();
        let inst = Instance::new(Box::new(bus), chain_length, label, !disable_parity);

        {
            let mut bus = inst.gate.lock();
            if let Err(source) = bus.init(handle) {
                error!(%handle, label = %inst.label, code = source.code(), "transport init failed");
                if let Err(e) = bus.deinit(handle) {
                    warn!(%handle, code = e.code(), "transport deinit after failed init also failed");
                }
                return Err(DriverError::InitFailed { handle, source });
            }
        }

        info!(%handle, label = %inst.label, chain_length, parity_checks = !disable_parity, "instance started");
        reservation.publish(Arc::new(inst));
        if let Some(m) = &self.metrics {
            m.instances_started.inc();
            m.live_instances.inc();
        }
        Ok(handle)
    }

    /// End an instance: wait for any cycle in progress, call the transport's
    /// `deinit` and free the slot.
    pub fn end_instance(&self, handle: InstanceHandle) -> Result<()> {
        let inst = {
            let mut slots = self.slots.write();
            let slot = slots
                .entries
                .get_mut(handle.index())
                .ok_or(DriverError::InvalidHandle(handle))?;
            let inst = match std::mem::replace(slot, Slot::Free) {
                Slot::Live(inst) => inst,
                other => {
                    *slot = other;
                    return Err(DriverError::InvalidHandle(handle));
                }
            };
            slots.occupied = slots.occupied.saturating_sub(1);
            inst
        };

        let mut bus = inst.gate.lock();
        inst.retire();
        if let Err(e) = bus.deinit(handle) {
            warn!(%handle, label = %inst.label, code = e.code(), "transport deinit failed");
        }
        drop(bus);

        if let Some(m) = &self.metrics {
            m.live_instances.dec();
        }
        info!(%handle, label = %inst.label, "instance ended");
        Ok(())
    }

    /// Run one update cycle on a single instance.
    pub fn update_instance(&self, handle: InstanceHandle) -> Result<CycleReport> {
        let inst = self.live(handle)?;
        cycle::run(handle, &inst, self.metrics.as_ref())
    }

    /// Run an update cycle on every live instance and return the most severe
    /// outcome.
    pub fn update_all(&self) -> UpdateStatus {
        let mut overall = UpdateStatus::Ok;
        for (handle, inst) in self.snapshot() {
            let status = match cycle::run(handle, &inst, self.metrics.as_ref()) {
                Ok(report) => report.status(),
                Err(DriverError::InvalidHandle(_)) => continue,
                Err(e) => {
                    error!(%handle, "update failed: {e}");
                    UpdateStatus::Fatal
                }
            };
            overall = overall.worst(status);
        }
        overall
    }

    /// Last decoded angle for one sensor. Does not read from the transport.
    pub fn read_angle(&self, handle: InstanceHandle, chain_index: usize) -> Result<Angle> {
        let inst = self.live(handle)?;
        inst.check_chain_index(chain_index)?;
        Ok(inst.reading(chain_index))
    }

    pub fn instance_info(&self, handle: InstanceHandle) -> Result<InstanceInfo> {
        Ok(self.live(handle)?.info(handle))
    }

    pub fn live_handles(&self) -> Vec<InstanceHandle> {
        self.snapshot().into_iter().map(|(h, _)| h).collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .entries
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    fn live(&self, handle: InstanceHandle) -> Result<Arc<Instance>> {
        match self.slots.read().entries.get(handle.index()) {
            Some(Slot::Live(inst)) => Ok(Arc::clone(inst)),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn snapshot(&self) -> Vec<(InstanceHandle, Arc<Instance>)> {
        self.slots
            .read()
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Live(inst) => Some((InstanceHandle::new(i), Arc::clone(inst))),
                _ => None,
            })
            .collect()
    }

    fn reserve(&self) -> Result<Reservation<'_>> {
        let mut slots = self.slots.write();
        let free = slots
            .entries
            .iter()
            .position(|s| matches!(s, Slot::Free))
            .ok_or(DriverError::Exhausted)?;
        if slots.occupied >= MAX_INSTANCES {
            return Err(DriverError::Exhausted);
        }
        slots.entries[free] = Slot::Reserved;
        slots.occupied += 1;
        Ok(Reservation {
            slots: &self.slots,
            handle: InstanceHandle::new(free),
            published: false,
        })
    }
}

impl Drop for Ems22Driver {
    fn drop(&mut self) {
        for handle in self.live_handles() {
            let _ = self.end_instance(handle);
        }
    }
}

/// A claimed slot. Released again on drop unless an instance was published
/// into it, so a failed or panicking `init` cannot leak the slot.
struct Reservation<'a> {
    slots: &'a RwLock<Slots>,
    handle: InstanceHandle,
    published: bool,
}

impl Reservation<'_> {
    fn publish(mut self, inst: Arc<Instance>) {
        self.slots.write().entries[self.handle.index()] = Slot::Live(inst);
        self.published = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        let mut slots = self.slots.write();
        slots.entries[self.handle.index()] = Slot::Free;
        slots.occupied = slots.occupied.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeFault;
    use crate::metrics::MetricsHub;
    use ems22_transport::{CallbackBus, MockBus, RawFrame, TransportError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    const COF: u16 = 1 << 4;

    fn h(i: usize) -> InstanceHandle {
        InstanceHandle::new(i)
    }

    fn counts_for(angle: u16) -> u16 {
        // Smallest reading that decodes to `angle`.
        ((u32::from(angle) * 1024).div_ceil(360)) as u16
    }

    #[test]
    fn test_bad_chain_length_touches_nothing() {
        let driver = Ems22Driver::new();
        for len in [0, MAX_DAISY_CHAIN, MAX_DAISY_CHAIN + 10] {
            let bus = MockBus::open("mock0");
            let probe = bus.probe();
            let err = driver.start_instance(bus, len, None, false).unwrap_err();
            assert!(matches!(err, DriverError::BadChainLength(l) if l == len));
            assert_eq!(probe.inits(), 0);
            assert_eq!(probe.deinits(), 0);
        }
        assert_eq!(driver.live_count(), 0);
    }

    #[test]
    fn test_init_failure_unwinds() {
        let driver = Ems22Driver::new();
        let bus = MockBus::open("mock0").fail_init(-3);
        let probe = bus.probe();

        let err = driver.start_instance(bus, 2, Some("broken"), false).unwrap_err();
        assert!(matches!(
            err,
            DriverError::InitFailed { handle, source: TransportError::Status(-3) } if handle == h(0)
        ));
        assert_eq!(err.init_status(), Some(-3));
        assert_eq!(probe.inits(), 1);
        assert_eq!(probe.deinits(), 1);

        assert_eq!(driver.live_count(), 0);
        assert_eq!(driver.update_all(), UpdateStatus::Ok);
        assert_eq!(probe.reads(), 0);
        assert!(matches!(driver.read_angle(h(0), 0), Err(DriverError::InvalidHandle(_))));

        // The slot was given back.
        let handle = driver.start_instance(MockBus::open("mock1"), 1, None, false).unwrap();
        assert_eq!(handle, h(0));
    }

    #[test]
    fn test_init_failure_with_callbacks() {
        let deinit_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&deinit_calls);
        let bus = CallbackBus::new(
            |_h: InstanceHandle| 5,
            |_h: InstanceHandle, _out: &mut RawFrame| 0,
            move |_h: InstanceHandle| {
                calls.fetch_add(1, Ordering::SeqCst);
                0
            },
        );
        let driver = Ems22Driver::new();
        let err = driver.start_instance(bus, 1, None, false).unwrap_err();
        assert_eq!(err.init_status(), Some(5));
        assert_eq!(deinit_calls.load(Ordering::SeqCst), 1);
        assert!(driver.live_handles().is_empty());
    }

    #[test]
    fn test_exhausts_after_max_instances() {
        let driver = Ems22Driver::new();
        for i in 0..MAX_INSTANCES {
            let handle = driver.start_instance(MockBus::open("mock"), 1, None, false).unwrap();
            assert_eq!(handle, h(i));
        }
        let extra = MockBus::open("extra");
        let probe = extra.probe();
        assert!(matches!(
            driver.start_instance(extra, 1, None, false),
            Err(DriverError::Exhausted)
        ));
        assert_eq!(probe.inits(), 0);
        assert_eq!(driver.live_count(), MAX_INSTANCES);
    }

    #[test]
    fn test_first_free_slot_is_reused() {
        let driver = Ems22Driver::new();
        for _ in 0..MAX_INSTANCES {
            driver.start_instance(MockBus::open("mock"), 1, None, false).unwrap();
        }
        driver.end_instance(h(1)).unwrap();
        assert_eq!(driver.live_handles(), vec![h(0), h(2)]);

        let handle = driver.start_instance(MockBus::open("again"), 2, None, false).unwrap();
        assert_eq!(handle, h(1));
    }

    #[test]
    fn test_fresh_instance_reads_zero() {
        let driver = Ems22Driver::new();
        let handle = driver.start_instance(MockBus::open("mock"), 4, None, false).unwrap();
        for i in 0..4 {
            assert_eq!(driver.read_angle(handle, i).unwrap(), 0);
        }
        let info = driver.instance_info(handle).unwrap();
        assert_eq!(info.label, DEFAULT_LABEL);
        assert_eq!(info.zeroes, vec![0; 4]);
        assert!(info.last_cycle.is_none());
    }

    #[test]
    fn test_full_cycle_updates_every_position() {
        let driver = Ems22Driver::new();
        let bus = MockBus::open("mock").with_frames(
            [10u16, 90, 180, 270].map(|a| MockBus::frame_for_reading(counts_for(a))),
        );
        let handle = driver.start_instance(bus, 4, Some("arm"), false).unwrap();

        let report = driver.update_instance(handle).unwrap();
        assert_eq!(report, CycleReport { failed: 0, total: 4 });
        assert_eq!(report.status(), UpdateStatus::Ok);

        let angles: Vec<_> = (0..4).map(|i| driver.read_angle(handle, i).unwrap()).collect();
        assert_eq!(angles, vec![10, 90, 180, 270]);
        assert!(driver.instance_info(handle).unwrap().last_cycle.is_some());
    }

    #[test]
    fn test_partial_failure_keeps_stale_readings() {
        let driver = Ems22Driver::new();
        let mut bus = MockBus::open("mock");
        for angle in [10u16, 20, 30, 40] {
            bus.push_reading(counts_for(angle));
        }
        bus.push_reading(counts_for(110))
            .push_error(TransportError::Timeout)
            .push_reading(counts_for(130))
            .push_frame(MockBus::frame_for_reading(counts_for(140)) ^ COF ^ 1);
        let probe = bus.probe();
        let handle = driver.start_instance(bus, 4, Some("head"), false).unwrap();

        assert_eq!(driver.update_all(), UpdateStatus::Ok);
        assert_eq!(driver.update_all(), UpdateStatus::PartialFailure);
        assert_eq!(probe.reads(), 8);

        let angles: Vec<_> = (0..4).map(|i| driver.read_angle(handle, i).unwrap()).collect();
        assert_eq!(angles, vec![110, 20, 130, 40]);
        assert_eq!(
            driver.update_instance(handle).unwrap(),
            CycleReport { failed: 0, total: 4 }
        );
    }

    #[test]
    fn test_all_positions_failing_is_still_partial() {
        let driver = Ems22Driver::new();
        let mut bus = MockBus::open("mock");
        bus.push_error(TransportError::Status(1))
            .push_error(TransportError::Status(1));
        let handle = driver.start_instance(bus, 2, None, false).unwrap();

        let report = driver.update_instance(handle).unwrap();
        assert_eq!(report, CycleReport { failed: 2, total: 2 });
        assert_eq!(report.status(), UpdateStatus::PartialFailure);
    }

    #[test]
    fn test_parity_flag_is_per_instance() {
        let bad_parity = MockBus::frame_for_reading(512) ^ 1;
        let driver = Ems22Driver::new();
        let strict = driver
            .start_instance(MockBus::open("a").with_frames([bad_parity]), 1, None, false)
            .unwrap();
        let lax = driver
            .start_instance(MockBus::open("b").with_frames([bad_parity]), 1, None, true)
            .unwrap();

        assert_eq!(driver.update_all(), UpdateStatus::PartialFailure);
        assert_eq!(driver.read_angle(strict, 0).unwrap(), 0);
        assert_eq!(driver.read_angle(lax, 0).unwrap(), 180);
        assert!(!driver.instance_info(lax).unwrap().parity_checks);
        assert!(matches!(
            crate::decode_frame(bad_parity, true),
            Err(DecodeFault::WrongParity(_))
        ));
    }

    #[test]
    fn test_end_validates_handle() {
        let driver = Ems22Driver::new();
        assert!(matches!(driver.end_instance(h(0)), Err(DriverError::InvalidHandle(_))));
        assert!(matches!(
            driver.end_instance(h(MAX_INSTANCES)),
            Err(DriverError::InvalidHandle(_))
        ));

        let bus = MockBus::open("mock");
        let probe = bus.probe();
        let handle = driver.start_instance(bus, 1, None, false).unwrap();
        driver.end_instance(handle).unwrap();
        assert_eq!(probe.deinits(), 1);
        assert!(matches!(driver.end_instance(handle), Err(DriverError::InvalidHandle(_))));
        assert_eq!(probe.deinits(), 1);
    }

    #[test]
    fn test_deinit_failure_is_not_an_error() {
        let driver = Ems22Driver::new();
        let handle = driver
            .start_instance(MockBus::open("mock").fail_deinit(4), 1, None, false)
            .unwrap();
        assert!(driver.end_instance(handle).is_ok());
        assert_eq!(driver.live_count(), 0);
    }

    #[test]
    fn test_ended_instance_is_not_polled() {
        let driver = Ems22Driver::new();
        let bus = MockBus::open("mock");
        let probe = bus.probe();
        let handle = driver.start_instance(bus, 3, None, false).unwrap();
        assert_eq!(driver.update_all(), UpdateStatus::Ok);
        driver.end_instance(handle).unwrap();
        assert_eq!(driver.update_all(), UpdateStatus::Ok);
        assert_eq!(probe.reads(), 3);
        assert!(matches!(driver.update_instance(handle), Err(DriverError::InvalidHandle(_))));
    }

    #[test]
    fn test_chain_index_validation() {
        let driver = Ems22Driver::new();
        let handle = driver.start_instance(MockBus::open("mock"), 2, Some("wrist"), false).unwrap();

        assert!(driver.read_angle(handle, 1).is_ok());
        for index in [2, MAX_DAISY_CHAIN, usize::MAX] {
            let err = driver.read_angle(handle, index).unwrap_err();
            assert!(matches!(
                &err,
                DriverError::InvalidChainIndex { index: i, chain_length: 2, label } if *i == index && label == "wrist"
            ));
            assert!(err.to_string().contains("wrist"));
        }
        assert!(matches!(driver.read_angle(h(2), 0), Err(DriverError::InvalidHandle(_))));
        assert!(matches!(driver.read_angle(h(99), 0), Err(DriverError::InvalidHandle(_))));
    }

    #[test]
    fn test_inconsistent_instance_is_fatal() {
        let driver = Ems22Driver::new();
        let ok = driver.start_instance(MockBus::open("ok"), 1, None, false).unwrap();

        let broken_bus = MockBus::open("broken");
        let probe = broken_bus.probe();
        {
            let mut slots = driver.slots.write();
            slots.entries[1] = Slot::Live(Arc::new(Instance::new(
                Box::new(broken_bus),
                0,
                "broken".into(),
                true,
            )));
            slots.occupied += 1;
        }

        assert!(matches!(
            driver.update_instance(h(1)),
            Err(DriverError::Fatal { chain_length: 0, .. })
        ));
        assert_eq!(driver.update_all(), UpdateStatus::Fatal);
        assert_eq!(probe.reads(), 0);
        // The gate was released on the fatal path.
        assert!(driver.slots.read().entries.iter().all(|s| match s {
            Slot::Live(inst) => inst.gate.try_lock().is_some(),
            _ => true,
        }));
        assert!(driver.update_instance(ok).is_ok());
    }

    #[test]
    fn test_update_all_reports_worst_status() {
        assert_eq!(UpdateStatus::Ok.worst(UpdateStatus::PartialFailure), UpdateStatus::PartialFailure);
        assert_eq!(UpdateStatus::Fatal.worst(UpdateStatus::Ok), UpdateStatus::Fatal);

        let driver = Ems22Driver::new();
        let mut failing = MockBus::open("failing");
        failing.push_error(TransportError::Timeout);
        driver.start_instance(failing, 1, None, false).unwrap();
        driver.start_instance(MockBus::open("fine"), 2, None, false).unwrap();

        assert_eq!(driver.update_all(), UpdateStatus::PartialFailure);
        assert_eq!(driver.update_all(), UpdateStatus::Ok);
    }

    #[test]
    fn test_concurrent_cycles_on_one_instance_are_serialised() {
        const DELAY: Duration = Duration::from_millis(20);
        let driver = Arc::new(Ems22Driver::new());
        let bus = MockBus::rotating("slow", 0, 64).with_read_delay(DELAY);
        let probe = bus.probe();
        let handle = driver.start_instance(bus, 3, None, false).unwrap();

        let started = Instant::now();
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let driver = Arc::clone(&driver);
                thread::spawn(move || driver.update_instance(handle))
            })
            .collect();
        for worker in workers {
            let report = worker.join().unwrap().unwrap();
            assert_eq!(report.failed, 0);
        }

        assert_eq!(probe.reads(), 6);
        assert_eq!(probe.max_in_flight(), 1);
        assert!(started.elapsed() >= DELAY * 6);
        // Second cycle saw readings 192, 256, 320 counts.
        assert_eq!(driver.read_angle(handle, 2).unwrap(), 112);
    }

    #[test]
    fn test_read_angle_does_not_wait_for_cycle() {
        let driver = Arc::new(Ems22Driver::new());
        let bus = MockBus::open("slow").with_read_delay(Duration::from_millis(200));
        let handle = driver.start_instance(bus, 1, None, false).unwrap();

        let worker = {
            let driver = Arc::clone(&driver);
            thread::spawn(move || driver.update_instance(handle))
        };
        // Wait until the cycle holds the gate.
        let wait_start = Instant::now();
        while driver.live(handle).unwrap().gate.try_lock().is_some() {
            assert!(wait_start.elapsed() < Duration::from_secs(5));
            thread::yield_now();
        }
        let before = Instant::now();
        assert_eq!(driver.read_angle(handle, 0).unwrap(), 0);
        assert!(before.elapsed() < Duration::from_millis(150));
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_drop_ends_live_instances() {
        let bus = MockBus::open("mock");
        let probe = bus.probe();
        {
            let driver = Ems22Driver::new();
            driver.start_instance(bus, 1, None, false).unwrap();
        }
        assert_eq!(probe.deinits(), 1);
    }

    #[test]
    fn test_metrics_track_cycles() {
        let hub = MetricsHub::new().unwrap();
        let driver = Ems22Driver::new().with_metrics(hub.driver.clone());
        let mut bus = MockBus::open("mock");
        bus.push_reading(1)
            .push_error(TransportError::Timeout)
            .push_frame(MockBus::frame_for_reading(3) ^ 1);
        let handle = driver.start_instance(bus, 3, None, false).unwrap();
        driver.update_all();

        assert_eq!(hub.driver.instances_started.get(), 1);
        assert_eq!(hub.driver.live_instances.get(), 1);
        assert_eq!(hub.driver.frames_decoded.get(), 1);
        assert_eq!(hub.driver.read_failures.get(), 1);
        assert_eq!(hub.driver.decode_faults.get(), 1);

        driver.end_instance(handle).unwrap();
        assert_eq!(hub.driver.live_instances.get(), 0);
        assert!(hub.encode_text().contains("ems22_frames_decoded 1"));
    }
}
