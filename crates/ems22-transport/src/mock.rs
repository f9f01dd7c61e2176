use crate::{InstanceHandle, RawFrame, Result, SensorBus, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const READING_SHIFT: u16 = 6;
const END_OFFSET_COMP: u16 = 1 << 5;

/// A simple in-process mock bus. Each bus instance is independent.
///
/// Reads are served from a script of frames and errors. Once the script runs
/// dry the bus either keeps answering with a valid zero-angle frame or, for a
/// [`MockBus::rotating`] bus, with a sensor that turns by a fixed step per read.
pub struct MockBus {
    name: String,
    script: VecDeque<Result<RawFrame>>,
    rotation: Option<Rotation>,
    init_status: Result<()>,
    deinit_status: Result<()>,
    read_delay: Option<Duration>,
    probe: MockProbe,
}

struct Rotation {
    reading: u16,
    step: u16,
}

impl MockBus {
    pub fn open(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: VecDeque::new(),
            rotation: None,
            init_status: Ok(()),
            deinit_status: Ok(()),
            read_delay: None,
            probe: MockProbe::default(),
        }
    }

    /// A bus whose sensor advances `step` counts (out of 1024) on every read.
    pub fn rotating(name: &str, start: u16, step: u16) -> Self {
        let mut bus = Self::open(name);
        bus.rotation = Some(Rotation {
            reading: start & 0x3FF,
            step,
        });
        bus
    }

    /// Build a fault-free frame with correct parity for a 10-bit reading.
    pub fn frame_for_reading(reading: u16) -> RawFrame {
        let raw = ((reading & 0x3FF) << READING_SHIFT) | END_OFFSET_COMP;
        raw | (raw.count_ones() as u16 & 1)
    }

    pub fn push_frame(&mut self, frame: RawFrame) -> &mut Self {
        self.script.push_back(Ok(frame));
        self
    }

    pub fn push_reading(&mut self, reading: u16) -> &mut Self {
        self.push_frame(Self::frame_for_reading(reading))
    }

    pub fn push_error(&mut self, err: TransportError) -> &mut Self {
        self.script.push_back(Err(err));
        self
    }

    pub fn with_frames(mut self, frames: impl IntoIterator<Item = RawFrame>) -> Self {
        self.script.extend(frames.into_iter().map(Ok));
        self
    }

    pub fn fail_init(mut self, code: i32) -> Self {
        self.init_status = Err(TransportError::Status(code));
        self
    }

    pub fn fail_deinit(mut self, code: i32) -> Self {
        self.deinit_status = Err(TransportError::Status(code));
        self
    }

    /// Hold every read for `delay` before answering.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Shared counters that stay readable after the bus is handed over.
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    fn next_frame(&mut self) -> Result<RawFrame> {
        if let Some(next) = self.script.pop_front() {
            return next;
        }
        match self.rotation.as_mut() {
            Some(rot) => {
                let frame = Self::frame_for_reading(rot.reading);
                rot.reading = rot.reading.wrapping_add(rot.step) & 0x3FF;
                Ok(frame)
            }
            None => Ok(Self::frame_for_reading(0)),
        }
    }
}

impl SensorBus for MockBus {
    fn init(&mut self, handle: InstanceHandle) -> Result<()> {
        self.probe.counters.inits.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(bus = %self.name, %handle, "mock init");
        self.init_status.clone()
    }

    fn read(&mut self, handle: InstanceHandle) -> Result<RawFrame> {
        let counters = &self.probe.counters;
        counters.reads.fetch_add(1, Ordering::SeqCst);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.read_delay {
            thread::sleep(delay);
        }
        let out = self.next_frame();

        self.probe.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(bus = %self.name, %handle, ?out, "mock read");
        out
    }

    fn deinit(&mut self, handle: InstanceHandle) -> Result<()> {
        self.probe.counters.deinits.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(bus = %self.name, %handle, "mock deinit");
        self.deinit_status.clone()
    }
}

/// Call counters shared between a [`MockBus`] and the test that owns it.
#[derive(Clone, Default)]
pub struct MockProbe {
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    inits: AtomicUsize,
    reads: AtomicUsize,
    deinits: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockProbe {
    pub fn inits(&self) -> usize {
        self.counters.inits.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    pub fn deinits(&self) -> usize {
        self.counters.deinits.load(Ordering::SeqCst)
    }

    /// Highest number of reads that were ever in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }
}
