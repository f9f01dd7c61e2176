use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct DriverMetrics {
    pub frames_decoded: IntCounter,
    pub decode_faults: IntCounter,
    pub read_failures: IntCounter,
    pub instances_started: IntCounter,
    pub live_instances: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub driver: DriverMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
        };
        let frames_decoded = counter("ems22_frames_decoded", "Frames decoded into an angle")?;
        let decode_faults = counter(
            "ems22_decode_faults",
            "Frames rejected for parity or sensor fault flags",
        )?;
        let read_failures = counter("ems22_read_failures", "Transport reads that failed")?;
        let instances_started =
            counter("ems22_instances_started", "Instances successfully started")?;
        let live_instances = IntGauge::new("ems22_live_instances", "Instances currently live")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let driver = DriverMetrics {
            frames_decoded,
            decode_faults,
            read_failures,
            instances_started,
            live_instances,
        };
        let _ = registry.register(Box::new(driver.frames_decoded.clone()));
        let _ = registry.register(Box::new(driver.decode_faults.clone()));
        let _ = registry.register(Box::new(driver.read_failures.clone()));
        let _ = registry.register(Box::new(driver.instances_started.clone()));
        let _ = registry.register(Box::new(driver.live_instances.clone()));
        Ok(Self { registry, driver })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
