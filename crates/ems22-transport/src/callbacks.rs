use crate::{InstanceHandle, RawFrame, Result, SensorBus, TransportError};

/// Map a C-style status code (`0` = success) onto a transport result.
pub fn status_to_result(code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(TransportError::Status(code))
    }
}

/// Adapts an `init`/`read`/`deinit` closure triple to [`SensorBus`].
///
/// Each closure receives the instance handle and returns `0` on success and
/// any other value on failure. `read` fills the frame through its second
/// argument.
pub struct CallbackBus<I, R, D> {
    init: I,
    read: R,
    deinit: D,
}

impl<I, R, D> CallbackBus<I, R, D>
where
    I: FnMut(InstanceHandle) -> i32,
    R: FnMut(InstanceHandle, &mut RawFrame) -> i32,
    D: FnMut(InstanceHandle) -> i32,
{
    pub fn new(init: I, read: R, deinit: D) -> Self {
        Self { init, read, deinit }
    }
}

impl<I, R, D> SensorBus for CallbackBus<I, R, D>
where
    I: FnMut(InstanceHandle) -> i32,
    R: FnMut(InstanceHandle, &mut RawFrame) -> i32,
    D: FnMut(InstanceHandle) -> i32,
{
    fn init(&mut self, handle: InstanceHandle) -> Result<()> {
        status_to_result((self.init)(handle))
    }

    fn read(&mut self, handle: InstanceHandle) -> Result<RawFrame> {
        let mut frame: RawFrame = 0;
        status_to_result((self.read)(handle, &mut frame))?;
        Ok(frame)
    }

    fn deinit(&mut self, handle: InstanceHandle) -> Result<()> {
        status_to_result((self.deinit)(handle))
    }
}
