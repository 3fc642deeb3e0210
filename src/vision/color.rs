//! Colour-band pixel counting for presence markers.

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Inclusive colour band: red at least `r_min`, green and blue at most
/// `g_max` / `b_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorBand {
    /// Minimum red channel value.
    pub r_min: u8,
    /// Maximum green channel value.
    pub g_max: u8,
    /// Maximum blue channel value.
    pub b_max: u8,
}

impl ColorBand {
    /// `r >= 200, g <= 50, b <= 50`.
    pub const RED: Self = Self {
        r_min: 200,
        g_max: 50,
        b_max: 50,
    };

    /// Exactly `(255, 0, 0)`.
    pub const STRICT_RED: Self = Self {
        r_min: 255,
        g_max: 0,
        b_max: 0,
    };

    /// Returns `true` if the pixel falls inside the band.
    #[must_use]
    pub const fn contains(&self, r: u8, g: u8, b: u8) -> bool {
        r >= self.r_min && g <= self.g_max && b <= self.b_max
    }

    /// Counts pixels of `image` inside the band. Alpha is ignored.
    #[must_use]
    pub fn count(&self, image: &RgbaImage) -> u32 {
        let n = image
            .pixels()
            .filter(|p| self.contains(p[0], p[1], p[2]))
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

impl Default for ColorBand {
    fn default() -> Self {
        Self::RED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn band_edges_are_inclusive() {
        assert!(ColorBand::RED.contains(200, 50, 50));
        assert!(!ColorBand::RED.contains(199, 0, 0));
        assert!(!ColorBand::RED.contains(255, 51, 0));
        assert!(!ColorBand::RED.contains(255, 0, 51));
    }

    #[test]
    fn strict_band_only_pure_red() {
        assert!(ColorBand::STRICT_RED.contains(255, 0, 0));
        assert!(!ColorBand::STRICT_RED.contains(254, 0, 0));
        assert!(!ColorBand::STRICT_RED.contains(255, 1, 0));
    }

    #[test]
    fn counts_matching_pixels() {
        let mut img = RgbaImage::from_pixel(10, 10, Rgba([30, 30, 30, 255]));
        img.put_pixel(1, 1, Rgba([255, 0, 0, 255]));
        img.put_pixel(2, 1, Rgba([220, 40, 10, 0]));
        img.put_pixel(3, 1, Rgba([180, 0, 0, 255]));
        assert_eq!(ColorBand::RED.count(&img), 2);
        assert_eq!(ColorBand::STRICT_RED.count(&img), 1);
    }
}
