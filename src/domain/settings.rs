use crate::domain::layout::FrameLayout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bitlink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Which of the two supported peripheral families we talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceVariant {
    /// Sensor board: tilt, brightness, motion magnitudes
    #[default]
    Gen1,
    /// Sensor board with button, spin and a UART-style command channel
    Gen2,
}

/// What to do with a notification shorter than the frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameValidation {
    /// Missing bytes decode as zero
    #[default]
    Lenient,
    /// Short frames are rejected and dropped
    Strict,
}

/// When the outbound busy gate reopens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRelease {
    /// Any chunk acknowledgment clears the gate
    #[default]
    FirstAck,
    /// Only the final chunk's acknowledgment clears the gate
    LastChunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub variant: DeviceVariant,
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Overrides for the variant's GATT identifiers
    #[serde(default)]
    pub service_uuid: Option<String>,
    #[serde(default)]
    pub notify_char_uuid: Option<String>,
    #[serde(default)]
    pub write_char_uuid: Option<String>,
    /// Replaces the variant's built-in frame layout
    #[serde(default)]
    pub layout: Option<FrameLayout>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            variant: DeviceVariant::default(),
            name: default_device_name(),
            service_uuid: None,
            notify_char_uuid: None,
            write_char_uuid: None,
            layout: None,
        }
    }
}

fn default_device_name() -> String {
    "BitLink".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GestureSettings {
    /// |Δaccel| above this enters "moving" and arms the move gesture
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f64,
    /// |Δaccel| below this leaves "moving"
    #[serde(default = "default_settle_threshold")]
    pub settle_threshold: f64,
    #[serde(default = "default_shake_threshold")]
    pub shake_threshold: f64,
    /// Free-fall: accel magnitude below this activates jump
    #[serde(default = "default_jump_enter")]
    pub jump_enter_threshold: f64,
    /// Landing: accel magnitude above this clears an active jump
    #[serde(default = "default_jump_exit")]
    pub jump_exit_threshold: f64,
    #[serde(default = "default_move_window_ms")]
    pub move_window_ms: u64,
    #[serde(default = "default_shake_window_ms")]
    pub shake_window_ms: u64,
    #[serde(default = "default_tilt_threshold")]
    pub tilt_threshold: i16,
    #[serde(default = "default_dark_threshold")]
    pub dark_threshold: u8,
}

impl Default for GestureSettings {
    fn default() -> Self {
        Self {
            motion_threshold: default_motion_threshold(),
            settle_threshold: default_settle_threshold(),
            shake_threshold: default_shake_threshold(),
            jump_enter_threshold: default_jump_enter(),
            jump_exit_threshold: default_jump_exit(),
            move_window_ms: default_move_window_ms(),
            shake_window_ms: default_shake_window_ms(),
            tilt_threshold: default_tilt_threshold(),
            dark_threshold: default_dark_threshold(),
        }
    }
}

fn default_motion_threshold() -> f64 {
    0.1
}
fn default_settle_threshold() -> f64 {
    0.006
}
fn default_shake_threshold() -> f64 {
    0.8
}
fn default_jump_enter() -> f64 {
    0.2
}
fn default_jump_exit() -> f64 {
    0.5
}
fn default_move_window_ms() -> u64 {
    250
}
fn default_shake_window_ms() -> u64 {
    300
}
fn default_tilt_threshold() -> i16 {
    15
}
fn default_dark_threshold() -> u8 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_chunk_interval_ms")]
    pub chunk_interval_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_data_stall_ms")]
    pub data_stall_timeout_ms: u64,
    #[serde(default = "default_read_stride")]
    pub read_memory_stride: u8,
    #[serde(default = "default_true")]
    pub write_with_response: bool,
    #[serde(default)]
    pub gate_release: GateRelease,
    /// Give up on a connection attempt after this long
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            packet_size: default_packet_size(),
            chunk_interval_ms: default_chunk_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            data_stall_timeout_ms: default_data_stall_ms(),
            read_memory_stride: default_read_stride(),
            write_with_response: default_true(),
            gate_release: GateRelease::default(),
            scan_timeout_ms: default_scan_timeout_ms(),
        }
    }
}

fn default_packet_size() -> usize {
    20
}
fn default_chunk_interval_ms() -> u64 {
    50
}
fn default_settle_delay_ms() -> u64 {
    100
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_data_stall_ms() -> u64 {
    4500
}
fn default_read_stride() -> u8 {
    16
}
fn default_scan_timeout_ms() -> u64 {
    10000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub gestures: GestureSettings,
    #[serde(default)]
    pub link: LinkSettings,
    #[serde(default)]
    pub frame_validation: FrameValidation,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BitLink");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
