use core::fmt;

/// One 16-bit EMS22A frame as clocked out of the sensor, with the leading
/// fake bit already stripped by the transport.
pub type RawFrame = u16;

/// Opaque index of a driver instance.
///
/// Handles are plain registry indices; they are never addresses and are only
/// meaningful to the driver that issued them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(usize);

impl InstanceHandle {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<usize> for InstanceHandle {
    fn from(index: usize) -> Self {
        Self(index)
    }
}
