//! Pixel type, output channel ordering and procedural color helpers.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use smart_leds::hsv::{hsv2rgb, Hsv};

pub use smart_leds::RGB8 as Pixel;

/// Number of color channels carried per pixel.
pub const CHANNELS: usize = 3;

/// Order in which the R, G and B channels are emitted to the strip.
///
/// Most WS281x strips are wired GRB or BRG; the numeric pipeline always
/// works in RGB and the permutation is applied only at the final write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Rbg,
    Grb,
    Gbr,
    Bgr,
    #[default]
    Brg,
}

impl ChannelOrder {
    /// Parse a channel order name (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rgb" => Some(Self::Rgb),
            "rbg" => Some(Self::Rbg),
            "grb" => Some(Self::Grb),
            "gbr" => Some(Self::Gbr),
            "bgr" => Some(Self::Bgr),
            "brg" => Some(Self::Brg),
            _ => None,
        }
    }

    /// Reorder an RGB triple into wire order.
    #[inline]
    pub fn permute(self, r: u8, g: u8, b: u8) -> [u8; CHANNELS] {
        match self {
            Self::Rgb => [r, g, b],
            Self::Rbg => [r, b, g],
            Self::Grb => [g, r, b],
            Self::Gbr => [g, b, r],
            Self::Bgr => [b, g, r],
            Self::Brg => [b, r, g],
        }
    }
}

impl std::fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rgb => "rgb",
            Self::Rbg => "rbg",
            Self::Grb => "grb",
            Self::Gbr => "gbr",
            Self::Bgr => "bgr",
            Self::Brg => "brg",
        };
        write!(f, "{}", name)
    }
}

/// Convert a hue in degrees (0-359) plus 8-bit saturation and brightness
/// to an RGB pixel.
pub fn hsb_to_rgb(hue_degrees: u32, saturation: u8, brightness: u8) -> Pixel {
    let hue = ((hue_degrees % 360) * 256 / 360) as u8;
    hsv2rgb(Hsv {
        hue,
        sat: saturation,
        val: brightness,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_order_default_is_brg() {
        assert_eq!(ChannelOrder::default(), ChannelOrder::Brg);
    }

    #[test]
    fn test_permute_every_order() {
        assert_eq!(ChannelOrder::Rgb.permute(1, 2, 3), [1, 2, 3]);
        assert_eq!(ChannelOrder::Rbg.permute(1, 2, 3), [1, 3, 2]);
        assert_eq!(ChannelOrder::Grb.permute(1, 2, 3), [2, 1, 3]);
        assert_eq!(ChannelOrder::Gbr.permute(1, 2, 3), [2, 3, 1]);
        assert_eq!(ChannelOrder::Bgr.permute(1, 2, 3), [3, 2, 1]);
        assert_eq!(ChannelOrder::Brg.permute(1, 2, 3), [3, 1, 2]);
    }

    #[test]
    fn test_channel_order_from_str_case_insensitive() {
        assert_eq!(ChannelOrder::from_str("GRB"), Some(ChannelOrder::Grb));
        assert_eq!(ChannelOrder::from_str("bgr"), Some(ChannelOrder::Bgr));
        assert_eq!(ChannelOrder::from_str("rgbw"), None);
    }

    #[test]
    fn test_channel_order_display_roundtrips() {
        for order in ChannelOrder::value_variants() {
            assert_eq!(ChannelOrder::from_str(&order.to_string()), Some(*order));
        }
    }

    #[test]
    fn test_hsb_zero_brightness_is_black() {
        let p = hsb_to_rgb(120, 255, 0);
        assert_eq!((p.r, p.g, p.b), (0, 0, 0));
    }

    #[test]
    fn test_hsb_zero_saturation_is_grey() {
        let p = hsb_to_rgb(200, 0, 180);
        assert_eq!(p.r, p.g);
        assert_eq!(p.g, p.b);
    }
}
