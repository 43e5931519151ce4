//! Gamma / white-balance lookup tables.
//!
//! Each channel gets a 257-entry table mapping an 8-bit index (plus an
//! 8-bit sub-step fraction) to a 16-bit corrected intensity. The extra
//! entry lets [`LookupTable::interpolate`] read `index + 1` at the top of
//! the domain without a bounds check.

use serde::{Deserialize, Serialize};

/// Number of entries per channel table.
pub const LUT_ENTRIES: usize = 257;

/// Per-channel white-point scalars, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WhitePoint {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

impl Default for WhitePoint {
    fn default() -> Self {
        WhitePoint {
            red: 0.9,
            green: 1.0,
            blue: 1.0,
        }
    }
}

/// Correction table for a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTable {
    entries: [u16; LUT_ENTRIES],
}

impl LookupTable {
    /// Build `round(65535 · white · (i/256)^power)` for every `i` in `0..=256`.
    pub fn new(white: f32, power: f32) -> Self {
        let white = f64::from(white);
        let power = f64::from(power);
        let mut entries = [0u16; LUT_ENTRIES];
        for (i, entry) in entries.iter_mut().enumerate() {
            let x = i as f64 / 256.0;
            let value = (65535.0 * white * x.powf(power)).round();
            *entry = value.clamp(0.0, 65535.0) as u16;
        }
        LookupTable { entries }
    }

    /// Table that maps the 16-bit domain onto itself.
    pub fn identity() -> Self {
        Self::new(1.0, 1.0)
    }

    pub fn entries(&self) -> &[u16; LUT_ENTRIES] {
        &self.entries
    }

    /// Piecewise-linear lookup of a 16-bit input value.
    ///
    /// The high byte selects the table entry, the low byte blends toward the
    /// next entry. Inputs above `0xFFFF` are clamped.
    #[inline]
    pub fn interpolate(&self, value: u32) -> u32 {
        let value = value.min(0xFFFF);
        let index = (value >> 8) as usize; // [0, 0xFF]
        let alpha = value & 0xFF; // [0, 0xFF]
        let inv_alpha = 0x100 - alpha; // [1, 0x100]

        (u32::from(self.entries[index]) * inv_alpha + u32::from(self.entries[index + 1]) * alpha)
            >> 8
    }
}

/// The three per-channel tables, built from one white point and exponent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLuts {
    pub red: LookupTable,
    pub green: LookupTable,
    pub blue: LookupTable,
}

impl ChannelLuts {
    pub fn new(white_point: WhitePoint, power: f32) -> Self {
        ChannelLuts {
            red: LookupTable::new(white_point.red, power),
            green: LookupTable::new(white_point.green, power),
            blue: LookupTable::new(white_point.blue, power),
        }
    }

    #[inline]
    pub fn apply(&self, value: [u32; 3]) -> [u32; 3] {
        [
            self.red.interpolate(value[0]),
            self.green.interpolate(value[1]),
            self.blue.interpolate(value[2]),
        ]
    }
}

impl Default for ChannelLuts {
    fn default() -> Self {
        ChannelLuts::new(WhitePoint::default(), 2.0)
    }
}
