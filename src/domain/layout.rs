//! Frame layouts and raw-value scaling
//!
//! Where each field sits in an inbound notification, and how the raw
//! readings map onto the values block code sees.

use crate::domain::models::SensorProfile;
use crate::domain::settings::DeviceVariant;
use serde::{Deserialize, Serialize};

/// Byte positions of every field in an inbound notification
///
/// ```text
/// [0]     : bit 7 green flag, bits 0-5 brightness high bits
/// [1]     : bits 4-7 brightness low bits
/// [2]     : flags (tilt sign bits, button bit)
/// [tilt]  : tilt magnitudes, one byte per axis
/// [accel] : acceleration magnitude, i32 big-endian / 10^7
/// [gyro]  : gyroscope magnitude, i32 big-endian / 10^7
/// [spin]  : optional spin, 16-bit big-endian sign-folded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    /// Bytes a complete frame carries
    pub frame_len: usize,
    pub flags_byte: usize,
    pub tilt_x_byte: usize,
    pub tilt_x_sign_bit: u8,
    pub tilt_y_byte: usize,
    pub tilt_y_sign_bit: u8,
    pub button_bit: Option<u8>,
    pub accel_offset: usize,
    pub gyro_offset: usize,
    pub spin_offset: Option<usize>,
    /// Derive speed from acceleration magnitude
    pub report_speed: bool,
    pub brightness_min: u16,
    pub brightness_max: u16,
    pub gyro_drives_motion: bool,
}

impl FrameLayout {
    pub const GEN1: FrameLayout = FrameLayout {
        frame_len: 13,
        flags_byte: 2,
        tilt_x_byte: 3,
        tilt_x_sign_bit: 3,
        tilt_y_byte: 4,
        tilt_y_sign_bit: 2,
        button_bit: None,
        accel_offset: 5,
        gyro_offset: 9,
        spin_offset: None,
        report_speed: false,
        brightness_min: 0,
        brightness_max: 1023,
        gyro_drives_motion: false,
    };

    pub const GEN2: FrameLayout = FrameLayout {
        frame_len: 15,
        flags_byte: 2,
        tilt_x_byte: 4,
        tilt_x_sign_bit: 2,
        tilt_y_byte: 3,
        tilt_y_sign_bit: 3,
        button_bit: Some(1),
        accel_offset: 5,
        gyro_offset: 9,
        spin_offset: Some(13),
        report_speed: true,
        brightness_min: 80,
        brightness_max: 600,
        gyro_drives_motion: true,
    };

    pub fn for_variant(variant: DeviceVariant) -> Self {
        match variant {
            DeviceVariant::Gen1 => Self::GEN1,
            DeviceVariant::Gen2 => Self::GEN2,
        }
    }

    pub fn sensor_profile(&self) -> SensorProfile {
        SensorProfile {
            brightness_min: self.brightness_min,
            brightness_max: self.brightness_max,
            gyro_drives_motion: self.gyro_drives_motion,
        }
    }
}

/// Linear map of a raw brightness onto 0-100, clamping the input range first
pub fn scale_brightness(raw: u16, min: u16, max: u16) -> u8 {
    if max <= min {
        return if raw > min { 100 } else { 0 };
    }
    let clamped = raw.clamp(min, max);
    let scaled = 100.0 * (clamped - min) as f64 / (max - min) as f64;
    round_half_up(scaled) as u8
}

/// Round to nearest with ties towards positive infinity
pub fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brightness_scaling_clamps_and_is_monotonic() {
        assert_eq!(scale_brightness(0, 0, 1023), 0);
        assert_eq!(scale_brightness(1023, 0, 1023), 100);
        assert_eq!(scale_brightness(0, 80, 600), 0);
        assert_eq!(scale_brightness(700, 80, 600), 100);
        assert_eq!(scale_brightness(1023, 80, 600), 100);
        assert_eq!(scale_brightness(340, 80, 600), 50);

        for (min, max) in [(0, 1023), (80, 600)] {
            let mut last = 0;
            for raw in 0..=1023u16 {
                let scaled = scale_brightness(raw, min, max);
                assert!(scaled >= last);
                last = scaled;
            }
        }
    }
}
