use serde::{Deserialize, Serialize};

/// One decoded sensor notification.
///
/// Fields that a device variant does not report are `None` and leave the
/// corresponding [`SensorState`] value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorFrame {
    pub green_flag: bool,
    pub button_pressed: Option<bool>,

    // 10-bit raw brightness (0-1023)
    pub brightness: u16,

    // Signed tilt in raw device units
    pub tilt_x: i16,
    pub tilt_y: i16,

    // Magnitudes in physical units (g, deg/s)
    pub accel_magnitude: f64,
    pub gyro_magnitude: f64,

    pub spin: Option<i32>,
    pub speed: Option<i32>,
}

/// Latest value of every frame field plus the deltas driving gesture detection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorState {
    pub green_flag: bool,
    pub button_pressed: bool,
    pub brightness: u16,
    pub tilt_x: i16,
    pub tilt_y: i16,
    pub accel_magnitude: f64,
    pub accel_delta: f64,
    pub gyro_magnitude: f64,
    pub gyro_delta: f64,
    pub spin: Option<i32>,
    pub speed: Option<i32>,
    /// Number of frames ingested; the first frame yields zero deltas
    pub frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GestureKind {
    Move,
    Shake,
    Jump,
}

impl GestureKind {
    pub const ALL: [GestureKind; 3] = [GestureKind::Move, GestureKind::Shake, GestureKind::Jump];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Shake => "shake",
            Self::Jump => "jump",
        }
    }
}

/// Debounce state for one gesture kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GestureTimer {
    /// Externally observable firing state
    pub active: bool,
    /// Set while a timeout is pending; blocks re-arming
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiltDirection {
    Front,
    Back,
    Left,
    Right,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightLevel {
    Dark,
    Light,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Scanning,
    Connected,
    Error,
}

/// Events pushed to the host runtime
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Green flag button released on the device
    GreenFlag,
    /// A gesture became observable
    Gesture(GestureKind),
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
    /// Raw inbound payload, before decoding (memory-read replies arrive here)
    Notification(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Variant-specific interpretation of decoded values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorProfile {
    /// Raw brightness range mapped onto 0-100
    pub brightness_min: u16,
    pub brightness_max: u16,
    /// Gyroscope delta also counts towards "moving"
    pub gyro_drives_motion: bool,
}

impl Default for SensorProfile {
    fn default() -> Self {
        Self {
            brightness_min: 0,
            brightness_max: 1023,
            gyro_drives_motion: false,
        }
    }
}

/// Point-in-time copy of the sensor view, published to async consumers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSnapshot {
    pub connected: bool,
    pub green_flag: bool,
    pub button_pressed: bool,
    /// Scaled 0-100
    pub brightness: u8,
    pub tilt_x: i16,
    pub tilt_y: i16,
    pub accel_magnitude: f64,
    pub moving: bool,
    pub moved: bool,
    pub shaken: bool,
    pub jumping: bool,
    pub spin: Option<i32>,
    pub speed: Option<i32>,
    pub frames: u64,
}
