//! ems22-driver: polling driver for daisy-chained Bourns EMS22A absolute encoders
//!
//! An [`Ems22Driver`] owns up to [`MAX_INSTANCES`] instances. Each instance is
//! one bit-serial interface (anything implementing [`SensorBus`]) with a chain
//! of up to `MAX_DAISY_CHAIN - 1` sensors behind it. Call
//! [`Ems22Driver::update_all`] periodically to read every sensor, then look up
//! cached angles with [`Ems22Driver::read_angle`].
//!
//! ```
//! use ems22_driver::{Ems22Driver, UpdateStatus};
//! use ems22_transport::MockBus;
//!
//! let driver = Ems22Driver::new();
//! let bus = MockBus::open("mock0").with_frames([MockBus::frame_for_reading(256)]);
//! let handle = driver.start_instance(bus, 1, Some("turntable"), false)?;
//! assert_eq!(driver.update_all(), UpdateStatus::Ok);
//! assert_eq!(driver.read_angle(handle, 0)?, 90);
//! # Ok::<(), ems22_driver::DriverError>(())
//! ```

mod frame;
pub use frame::{decode_frame, Angle, Frame, COUNTS_PER_TURN, DEGREES_PER_TURN};

mod error;
pub use error::{DecodeFault, DriverError, Result};

mod instance;
pub use instance::InstanceInfo;

mod cycle;
pub use cycle::{CycleReport, UpdateStatus};

mod registry;
pub use registry::{Ems22Driver, DEFAULT_LABEL, MAX_DAISY_CHAIN, MAX_INSTANCES};

mod config;
pub use config::{load_config_file, parse_config, DriverConfig, InstanceConfig};

mod metrics;
pub use metrics::{DriverMetrics, MetricsHub};

pub use ems22_transport::{InstanceHandle, RawFrame, SensorBus, TransportError};
