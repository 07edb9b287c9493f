//! Peripheral Protocol
//!
//! GATT identifiers, inbound frame decoding and outbound command encodings
//! for both device variants.

use crate::domain::layout::{round_half_up, FrameLayout};
use crate::domain::models::SensorFrame;
use crate::domain::settings::{DeviceSettings, DeviceVariant, FrameValidation};
use crate::error::{CommandError, FrameError};
use anyhow::Result;
use tracing::trace;
use uuid::Uuid;

/// Gen1 sensor service
pub const GEN1_SERVICE_UUID: Uuid = Uuid::from_u128(0x4cdbbd87_d6e6_46c2_9d0b_df87551e159a);
/// Gen1 notify characteristic carrying sensor frames
pub const GEN1_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x4cdb8702_d6e6_46c2_9d0b_df87551e159a);

/// Gen2 uses the Nordic UART service
pub const GEN2_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const GEN2_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e); // Notify from device
pub const GEN2_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e); // Write to device

/// Command opcodes (first byte of a command payload)
pub mod opcode {
    pub const PIN_CONFIG: u8 = 0xF8;
    pub const ERASE_FLASH: u8 = 0xFB;
    pub const READ_MEMORY: u8 = 0xFE;
    pub const DISPLAY_TEXT: u8 = 0x81;
    pub const DISPLAY_LED: u8 = 0x82;

    pub const LED_ON: u8 = 0x44;
    pub const LED_OFF: u8 = 0x45;
}

/// Acceleration and gyroscope magnitudes are sent as fixed-point * 10^7
const MAGNITUDE_SCALE: f64 = 10_000_000.0;

/// GATT identifiers and frame layout of one connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub variant: DeviceVariant,
    pub name: String,
    pub service: Uuid,
    pub notify_char: Uuid,
    /// `None` when the device has no command channel
    pub write_char: Option<Uuid>,
    pub layout: FrameLayout,
}

impl DeviceProfile {
    pub fn for_variant(variant: DeviceVariant) -> Self {
        let (service, notify_char, write_char) = match variant {
            DeviceVariant::Gen1 => (GEN1_SERVICE_UUID, GEN1_NOTIFY_CHAR_UUID, None),
            DeviceVariant::Gen2 => (
                GEN2_SERVICE_UUID,
                GEN2_NOTIFY_CHAR_UUID,
                Some(GEN2_WRITE_CHAR_UUID),
            ),
        };

        Self {
            variant,
            name: String::new(),
            service,
            notify_char,
            write_char,
            layout: FrameLayout::for_variant(variant),
        }
    }

    /// Build a profile from configuration, applying any overrides
    pub fn from_settings(settings: &DeviceSettings) -> Result<Self> {
        let mut profile = Self::for_variant(settings.variant);
        profile.name = settings.name.clone();

        if let Some(uuid) = &settings.service_uuid {
            profile.service = parse_uuid(uuid)?;
        }
        if let Some(uuid) = &settings.notify_char_uuid {
            profile.notify_char = parse_uuid(uuid)?;
        }
        if let Some(uuid) = &settings.write_char_uuid {
            profile.write_char = Some(parse_uuid(uuid)?);
        }
        if let Some(layout) = settings.layout {
            profile.layout = layout;
        }

        Ok(profile)
    }
}

/// Parse a UUID string, with or without dashes
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format {:?}: {}", uuid_str, e))
}

/// Bounds-tolerant byte access; reads past the end yield zero
struct FrameReader<'a> {
    bytes: &'a [u8],
}

impl FrameReader<'_> {
    fn byte(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    fn bit(&self, index: usize, bit: u8) -> bool {
        (self.byte(index) >> bit) & 1 != 0
    }

    fn be_i32(&self, offset: usize) -> i32 {
        i32::from_be_bytes([
            self.byte(offset),
            self.byte(offset + 1),
            self.byte(offset + 2),
            self.byte(offset + 3),
        ])
    }

    fn be_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.byte(offset), self.byte(offset + 1)])
    }
}

/// Decode one notification payload into a [`SensorFrame`].
///
/// With [`FrameValidation::Lenient`] a short buffer never fails; absent
/// bytes read as zero. [`FrameValidation::Strict`] rejects it instead.
pub fn decode_frame(
    bytes: &[u8],
    layout: &FrameLayout,
    validation: FrameValidation,
) -> Result<SensorFrame, FrameError> {
    if validation == FrameValidation::Strict && bytes.len() < layout.frame_len {
        return Err(FrameError::Truncated {
            expected: layout.frame_len,
            actual: bytes.len(),
        });
    }

    trace!("Raw frame: {:02X?}", bytes);

    let reader = FrameReader { bytes };

    let green_flag = reader.bit(0, 7);
    let brightness = ((reader.byte(0) & 0x3F) as u16) << 4 | (reader.byte(1) >> 4) as u16;

    let tilt_x = signed_tilt(
        reader.byte(layout.tilt_x_byte),
        reader.bit(layout.flags_byte, layout.tilt_x_sign_bit),
    );
    let tilt_y = signed_tilt(
        reader.byte(layout.tilt_y_byte),
        reader.bit(layout.flags_byte, layout.tilt_y_sign_bit),
    );

    let button_pressed = layout
        .button_bit
        .map(|bit| reader.bit(layout.flags_byte, bit));

    let accel_magnitude = reader.be_i32(layout.accel_offset) as f64 / MAGNITUDE_SCALE;
    let gyro_magnitude = reader.be_i32(layout.gyro_offset) as f64 / MAGNITUDE_SCALE;

    let spin = layout
        .spin_offset
        .map(|offset| scale_spin(reader.be_u16(offset)));
    let speed = layout.report_speed.then(|| speed_from_accel(accel_magnitude));

    Ok(SensorFrame {
        green_flag,
        button_pressed,
        brightness,
        tilt_x,
        tilt_y,
        accel_magnitude,
        gyro_magnitude,
        spin,
        speed,
    })
}

fn signed_tilt(magnitude: u8, negative: bool) -> i16 {
    let value = magnitude as i16;
    if negative {
        -value
    } else {
        value
    }
}

/// Fold the 16-bit spin field into a signed value and scale it.
///
/// The top bit marks a negative reading, folded as `(v & 0x7FFF) - 0x7FFF`.
pub fn scale_spin(raw: u16) -> i32 {
    let raw = raw as i32;
    let signed = if raw & 0x8000 != 0 {
        (raw & 0x7FFF) - 0x7FFF
    } else {
        raw
    };
    round_half_up(signed as f64 / 16384.0 * 10.0) as i32
}

/// Speed above the 1g rest baseline, never negative
pub fn speed_from_accel(accel_magnitude: f64) -> i32 {
    (round_half_up((accel_magnitude - 1.0) * 100.0) as i32).max(0)
}

/// A block-level operation, encoded into an opaque payload for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Switch one LED pin on or off
    SetLed { index: u8, on: bool },
    /// Erase the flash page containing `address`
    EraseFlash { address: u32 },
    /// Read `size` bytes (at most one stride) starting at `address`
    ReadMemory { address: u32, size: u8 },
    /// Raw bytes, no header
    WriteFlash(Vec<u8>),
    DisplayText(String),
    /// One byte per display row
    DisplayLed([u8; 5]),
}

impl OutboundCommand {
    /// Get the raw bytes for this command
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SetLed { index, on } => vec![
                opcode::PIN_CONFIG,
                0x04,
                0x01,
                *index,
                if *on { opcode::LED_ON } else { opcode::LED_OFF },
            ],
            Self::EraseFlash { address } => {
                let mut out = vec![opcode::ERASE_FLASH];
                out.extend_from_slice(&address.to_le_bytes());
                out
            }
            Self::ReadMemory { address, size } => {
                let mut out = vec![opcode::READ_MEMORY];
                out.extend_from_slice(&address.to_le_bytes());
                out.push(*size);
                out
            }
            Self::WriteFlash(bytes) => bytes.clone(),
            Self::DisplayText(text) => {
                let mut out = vec![opcode::DISPLAY_TEXT];
                out.extend(text.bytes());
                out
            }
            Self::DisplayLed(rows) => {
                let mut out = vec![opcode::DISPLAY_LED];
                out.extend_from_slice(rows);
                out
            }
        }
    }
}

/// Split a memory read into stride-sized read commands.
///
/// Stride `n` reads `min(stride, remaining)` bytes at `address + n * stride`.
pub fn read_memory_strides(address: u32, length: u32, stride: u8) -> Vec<OutboundCommand> {
    let stride = stride.max(1) as u32;
    (0..length)
        .step_by(stride as usize)
        .map(|offset| OutboundCommand::ReadMemory {
            address: address.wrapping_add(offset),
            size: (length - offset).min(stride) as u8,
        })
        .collect()
}

/// Parse an integer literal, `0x`-prefixed hex or decimal
fn parse_int(token: &str) -> Option<u64> {
    let token = token.trim();
    match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

/// Parse a comma-separated byte list such as `"0xFC, 0x00, 12"`
pub fn parse_byte_list(text: &str) -> Result<Vec<u8>, CommandError> {
    if text.trim().is_empty() {
        return Err(CommandError::EmptyPayload);
    }

    text.split(',')
        .map(|token| {
            parse_int(token)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| CommandError::InvalidByte(token.trim().to_string()))
        })
        .collect()
}

/// Parse a flash/memory address, `0x`-prefixed hex or decimal
pub fn parse_address(text: &str) -> Result<u32, CommandError> {
    parse_int(text)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| CommandError::InvalidAddress(text.trim().to_string()))
}

/// Address the bundled program is usually flashed to
pub const DEFAULT_PROGRAM_ADDRESS: u32 = 0x30000;

/// Bytecode of the bundled blink program: a header page followed by code
pub fn default_program() -> Vec<u8> {
    let mut program = vec![0xFC, 0x00, 0x00, 0x03, 0x00, 0x6C, 0x80, 0x40, 0x00, 0x00, 0x81, 0x4E];
    program.resize(71, 0x00);
    program.extend_from_slice(&[
        0x01, 0x00, 0x44, 0x01, 0x01, 0x26, 0x01, 0x00, 0x45, 0x01, 0x01, 0x26, 0x09, 0x00, 0x01,
        0x0A, 0x03, 0x13, 0x00, 0x01, 0x01, 0x44, 0x02, 0x14, 0x00, 0x00, 0x00, 0x26, 0x01, 0x01,
        0x45, 0x02, 0x14, 0x00, 0x00, 0x00, 0x26, 0x04, 0x0D, 0x09, 0xFF, 0xFF, 0xFF,
    ]);
    program
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen1_frame(flags: u8, tilt_x: u8, tilt_y: u8, accel: i32, gyro: i32) -> Vec<u8> {
        let mut bytes = vec![0x80 | 0x12, 0x30, flags, tilt_x, tilt_y];
        bytes.extend_from_slice(&accel.to_be_bytes());
        bytes.extend_from_slice(&gyro.to_be_bytes());
        bytes
    }

    #[test]
    fn test_decode_gen1_frame() {
        let bytes = gen1_frame(0b0000_1000, 20, 7, 10_000_000, 25_000_000);
        let frame = decode_frame(&bytes, &FrameLayout::GEN1, FrameValidation::Strict).unwrap();

        assert!(frame.green_flag);
        assert_eq!(frame.brightness, (0x12 << 4) | 0x3);
        assert_eq!(frame.tilt_x, -20);
        assert_eq!(frame.tilt_y, 7);
        assert!((frame.accel_magnitude - 1.0).abs() < 1e-9);
        assert!((frame.gyro_magnitude - 2.5).abs() < 1e-9);
        assert_eq!(frame.button_pressed, None);
        assert_eq!(frame.spin, None);
        assert_eq!(frame.speed, None);
    }

    #[test]
    fn test_decode_gen2_frame() {
        // flags: sign for Y (bit 3) and button (bit 1)
        let mut bytes = vec![0x00, 0x00, 0b0000_1010, 9, 33];
        bytes.extend_from_slice(&12_500_000i32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&0x2000u16.to_be_bytes());

        let frame = decode_frame(&bytes, &FrameLayout::GEN2, FrameValidation::Strict).unwrap();

        assert!(!frame.green_flag);
        assert_eq!(frame.button_pressed, Some(true));
        assert_eq!(frame.tilt_x, 33);
        assert_eq!(frame.tilt_y, -9);
        assert_eq!(frame.spin, Some(5));
        assert_eq!(frame.speed, Some(25));
    }

    #[test]
    fn test_tilt_magnitude_and_sign_reproduce_signed_value() {
        for layout in [FrameLayout::GEN1, FrameLayout::GEN2] {
            for expected in -255i16..=255 {
                let mut bytes = vec![0u8; layout.frame_len];
                bytes[layout.tilt_x_byte] = expected.unsigned_abs() as u8;
                bytes[layout.tilt_y_byte] = expected.unsigned_abs() as u8;
                if expected < 0 {
                    bytes[layout.flags_byte] |= 1 << layout.tilt_x_sign_bit;
                    bytes[layout.flags_byte] |= 1 << layout.tilt_y_sign_bit;
                }

                let frame = decode_frame(&bytes, &layout, FrameValidation::Strict).unwrap();
                assert_eq!(frame.tilt_x, expected);
                assert_eq!(frame.tilt_y, expected);
            }
        }
    }

    #[test]
    fn test_spin_sign_folding() {
        assert_eq!(scale_spin(0x0000), 0);
        assert_eq!(scale_spin(0x4000), 10);
        // 0x8000 folds to -0x7FFF, about -2.0 * 10
        assert_eq!(scale_spin(0x8000), -20);
        assert_eq!(scale_spin(0xFFFF), 0);
    }

    #[test]
    fn test_speed_clamped_at_rest_baseline() {
        assert_eq!(speed_from_accel(1.0), 0);
        assert_eq!(speed_from_accel(0.4), 0);
        assert_eq!(speed_from_accel(1.5), 50);
    }

    #[test]
    fn test_short_frame_validation() {
        let bytes = [0x80, 0x10, 0x00];

        let err = decode_frame(&bytes, &FrameLayout::GEN1, FrameValidation::Strict).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                expected: 13,
                actual: 3
            }
        );

        let frame = decode_frame(&bytes, &FrameLayout::GEN1, FrameValidation::Lenient).unwrap();
        assert!(frame.green_flag);
        assert_eq!(frame.brightness, 1);
        assert_eq!(frame.tilt_x, 0);
        assert_eq!(frame.accel_magnitude, 0.0);
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(
            OutboundCommand::SetLed { index: 3, on: true }.encode(),
            vec![0xF8, 0x04, 0x01, 0x03, 0x44]
        );
        assert_eq!(
            OutboundCommand::SetLed { index: 0, on: false }.encode(),
            vec![0xF8, 0x04, 0x01, 0x00, 0x45]
        );
        assert_eq!(
            OutboundCommand::EraseFlash { address: 0x0003_0000 }.encode(),
            vec![0xFB, 0x00, 0x00, 0x03, 0x00]
        );
        assert_eq!(
            OutboundCommand::ReadMemory {
                address: 0x1234_5678,
                size: 16
            }
            .encode(),
            vec![0xFE, 0x78, 0x56, 0x34, 0x12, 16]
        );
        assert_eq!(
            OutboundCommand::WriteFlash(vec![1, 2, 3]).encode(),
            vec![1, 2, 3]
        );
        assert_eq!(
            OutboundCommand::DisplayText("ok".to_string()).encode(),
            vec![0x81, b'o', b'k']
        );
        assert_eq!(
            OutboundCommand::DisplayLed([0x1F, 0, 0x04, 0, 0x1F]).encode(),
            vec![0x82, 0x1F, 0x00, 0x04, 0x00, 0x1F]
        );
    }

    #[test]
    fn test_read_memory_strides_cover_length() {
        let strides = read_memory_strides(0x100, 40, 16);
        assert_eq!(
            strides,
            vec![
                OutboundCommand::ReadMemory { address: 0x100, size: 16 },
                OutboundCommand::ReadMemory { address: 0x110, size: 16 },
                OutboundCommand::ReadMemory { address: 0x120, size: 8 },
            ]
        );
        assert!(read_memory_strides(0x100, 0, 16).is_empty());
    }

    #[test]
    fn test_parse_byte_list() {
        assert_eq!(parse_byte_list("0xFC, 0x00, 12").unwrap(), vec![0xFC, 0x00, 12]);
        assert_eq!(
            parse_byte_list("0x1FF"),
            Err(CommandError::InvalidByte("0x1FF".to_string()))
        );
        assert_eq!(parse_byte_list("  "), Err(CommandError::EmptyPayload));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x30000"), Ok(0x30000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("flash").is_err());
    }

    #[test]
    fn test_default_program_layout() {
        let program = default_program();
        assert_eq!(program.len(), 114);
        assert_eq!(program[0], 0xFC);
        assert_eq!(&program[program.len() - 3..], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_profile_overrides() {
        let settings = DeviceSettings {
            variant: DeviceVariant::Gen1,
            write_char_uuid: Some("6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()),
            ..Default::default()
        };
        let profile = DeviceProfile::from_settings(&settings).unwrap();

        assert_eq!(profile.service, GEN1_SERVICE_UUID);
        assert_eq!(profile.write_char, Some(GEN2_WRITE_CHAR_UUID));
        assert_eq!(profile.layout, FrameLayout::GEN1);
        assert!(parse_uuid("not-a-uuid").is_err());
    }
}
