//! ems22-transport: bit-serial transport abstractions for EMS22A encoders
//!
//! The driver core never talks to hardware directly. Hosts hand it something
//! implementing [`SensorBus`]: either their own type, or a [`CallbackBus`]
//! built from three closures that return C-style status codes. The default
//! build enables a `mock` backend so that binaries and tests run on any host.

mod types;
pub use types::{InstanceHandle, RawFrame};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::SensorBus;

mod callbacks;
pub use callbacks::{status_to_result, CallbackBus};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, MockProbe};
