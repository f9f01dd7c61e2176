//! EMS22A wire frame layout and decoding.
//!
//! A frame is 16 bits, most significant bit first on the wire:
//!
//! | bit(s) | field              | meaning                                       |
//! |--------|--------------------|-----------------------------------------------|
//! | 15..6  | reading            | absolute position, 0..=1023 counts per turn   |
//! | 5      | end_offset_comp    | offset compensation algorithm has finished    |
//! | 4      | cordic_overflow    | CORDIC overflow, position data is invalid     |
//! | 3      | linearity_alarm    | magnet out of range, linearity is critical    |
//! | 2      | mag_increase       | magnet moved towards the sensor               |
//! | 1      | mag_decrease       | magnet moved away from the sensor             |
//! | 0      | parity             | even parity over the whole frame              |

use core::fmt;

use crate::error::DecodeFault;

/// Absolute angle in whole degrees, `0..=359`.
pub type Angle = i16;

pub const COUNTS_PER_TURN: u32 = 1024;
pub const DEGREES_PER_TURN: u32 = 360;

const PARITY: u16 = 1 << 0;
const MAG_DECREASE: u16 = 1 << 1;
const MAG_INCREASE: u16 = 1 << 2;
const LINEARITY_ALARM: u16 = 1 << 3;
const CORDIC_OVERFLOW: u16 = 1 << 4;
const END_OFFSET_COMP: u16 = 1 << 5;
const READING_SHIFT: u32 = 6;
const READING_MASK: u16 = 0x03FF;

/// One raw frame with typed accessors for each field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Frame(u16);

impl Frame {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn parity(self) -> bool {
        self.0 & PARITY != 0
    }

    pub const fn mag_decrease(self) -> bool {
        self.0 & MAG_DECREASE != 0
    }

    pub const fn mag_increase(self) -> bool {
        self.0 & MAG_INCREASE != 0
    }

    pub const fn linearity_alarm(self) -> bool {
        self.0 & LINEARITY_ALARM != 0
    }

    pub const fn cordic_overflow(self) -> bool {
        self.0 & CORDIC_OVERFLOW != 0
    }

    pub const fn end_offset_comp(self) -> bool {
        self.0 & END_OFFSET_COMP != 0
    }

    /// The 10-bit position field.
    pub const fn reading(self) -> u16 {
        (self.0 >> READING_SHIFT) & READING_MASK
    }

    /// True when the number of set bits, parity bit included, is even.
    pub const fn has_even_parity(self) -> bool {
        self.0.count_ones() % 2 == 0
    }

    /// Either flag that makes the position data unusable is set.
    pub const fn is_faulted(self) -> bool {
        self.cordic_overflow() || self.linearity_alarm()
    }

    /// Position converted to whole degrees, ignoring all flags.
    pub fn angle(self) -> Angle {
        // 360 * 1023 / 1024 < 360, so the cast cannot truncate.
        (DEGREES_PER_TURN * u32::from(self.reading()) / COUNTS_PER_TURN) as Angle
    }
}

impl From<u16> for Frame {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} (reading={}", self.0, self.reading())?;
        let flags = [
            (self.end_offset_comp(), "OCF"),
            (self.cordic_overflow(), "COF"),
            (self.linearity_alarm(), "LIN"),
            (self.mag_increase(), "INC"),
            (self.mag_decrease(), "DEC"),
            (self.parity(), "PAR"),
        ];
        for (set, name) in flags {
            if set {
                write!(f, " {name}")?;
            }
        }
        write!(f, ")")
    }
}

/// Decode one frame into an angle.
///
/// Parity is verified first (when enabled), then the CORDIC overflow and
/// linearity alarm flags. Magnet movement and offset compensation flags are
/// informational and never reject a frame.
pub fn decode_frame(bits: u16, parity_checks: bool) -> Result<Angle, DecodeFault> {
    let frame = Frame::new(bits);
    if parity_checks && !frame.has_even_parity() {
        return Err(DecodeFault::WrongParity(frame));
    }
    if frame.is_faulted() {
        return Err(DecodeFault::SensorFault(frame));
    }
    Ok(frame.angle())
}
