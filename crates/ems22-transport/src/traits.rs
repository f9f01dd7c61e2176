use crate::{InstanceHandle, RawFrame, Result};

/// A minimal blocking bit-serial interface to one chain of EMS22A sensors.
///
/// Every call runs to completion synchronously. The driver never calls two
/// methods on the same bus at once.
pub trait SensorBus {
    /// Prepare the interface that serves `handle`.
    fn init(&mut self, handle: InstanceHandle) -> Result<()>;

    /// Clock out exactly one 16-bit frame.
    ///
    /// EMS22A parts emit a spurious leading bit before the frame; it must be
    /// stripped here so that bit 0 of the returned value is the parity bit.
    fn read(&mut self, handle: InstanceHandle) -> Result<RawFrame>;

    /// Release the interface. The result is only ever logged.
    fn deinit(&mut self, handle: InstanceHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }
}

impl<B: SensorBus + ?Sized> SensorBus for Box<B> {
    fn init(&mut self, handle: InstanceHandle) -> Result<()> {
        (**self).init(handle)
    }

    fn read(&mut self, handle: InstanceHandle) -> Result<RawFrame> {
        (**self).read(handle)
    }

    fn deinit(&mut self, handle: InstanceHandle) -> Result<()> {
        (**self).deinit(handle)
    }
}
