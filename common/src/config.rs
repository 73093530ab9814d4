use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub button: ButtonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_photos_dir")]
    pub photos_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraSourceKind {
    /// `rpicam-vid` subprocess emitting MJPEG on stdout.
    Rpicam,
    /// Synthetic frames, for running the booth without a camera attached.
    TestPattern,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_source")]
    pub source: CameraSourceKind,
    #[serde(default = "default_camera_command")]
    pub command: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,
    #[serde(default = "default_open_retry_delay_ms")]
    pub open_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Brightness factor applied to the saved photo. 1.0 keeps the raw frame.
    #[serde(default = "default_brightness")]
    pub brightness: f32,
    /// How long the preview shows the captured frame. 0 disables the freeze.
    #[serde(default = "default_freeze_secs")]
    pub freeze_secs: f64,
    #[serde(default = "default_true")]
    pub print_on_capture: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrinterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_printer_device")]
    pub device: String,
    /// Printable width in dots.
    #[serde(default = "default_printer_width")]
    pub width: u32,
    #[serde(default = "default_true")]
    pub cut: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ButtonConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gpio")]
    pub gpio: u32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Used by the standalone listener only.
    #[serde(default = "default_capture_url")]
    pub capture_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            photos_dir: default_photos_dir(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_camera_source(),
            command: default_camera_command(),
            width: default_width(),
            height: default_height(),
            frame_interval_ms: default_frame_interval_ms(),
            jpeg_quality: default_jpeg_quality(),
            open_attempts: default_open_attempts(),
            open_retry_delay_ms: default_open_retry_delay_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            brightness: default_brightness(),
            freeze_secs: default_freeze_secs(),
            print_on_capture: true,
        }
    }
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: default_printer_device(),
            width: default_printer_width(),
            cut: true,
        }
    }
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gpio: default_gpio(),
            debounce_ms: default_debounce_ms(),
            poll_ms: default_poll_ms(),
            capture_url: default_capture_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CaptureConfig {
    /// How long a capture stays on the preview; `None` when the freeze is off.
    pub fn freeze_hold(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.freeze_secs)
            .ok()
            .filter(|hold| !hold.is_zero())
    }
}

impl Config {
    /// Printing after a capture needs both the capture switch and a printer.
    pub fn prints_on_capture(&self) -> bool {
        self.capture.print_on_capture && self.printer.enabled
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "camera.jpeg_quality must be 1..=100, got {}",
                self.camera.jpeg_quality
            )));
        }
        if self.camera.open_attempts == 0 {
            return Err(ConfigError::Invalid("camera.open_attempts must be at least 1".into()));
        }
        if Duration::try_from_secs_f64(self.capture.freeze_secs).is_err() {
            return Err(ConfigError::Invalid(format!(
                "capture.freeze_secs must be a non-negative number of seconds, got {}",
                self.capture.freeze_secs
            )));
        }
        if !(self.capture.brightness > 0.0 && self.capture.brightness.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "capture.brightness must be positive, got {}",
                self.capture.brightness
            )));
        }
        if self.printer.width == 0 {
            return Err(ConfigError::Invalid("printer.width must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_photos_dir() -> String {
    "photos".into()
}
fn default_camera_source() -> CameraSourceKind {
    CameraSourceKind::Rpicam
}
fn default_camera_command() -> String {
    "rpicam-vid".into()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_frame_interval_ms() -> u64 {
    30
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_open_attempts() -> u32 {
    5
}
fn default_open_retry_delay_ms() -> u64 {
    1500
}
fn default_brightness() -> f32 {
    1.3
}
fn default_freeze_secs() -> f64 {
    5.0
}
fn default_printer_device() -> String {
    "/dev/usb/lp0".into()
}
fn default_printer_width() -> u32 {
    384
}
fn default_gpio() -> u32 {
    16
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_poll_ms() -> u64 {
    10
}
fn default_capture_url() -> String {
    "http://localhost:5000/capture".into()
}
fn default_log_level() -> String {
    "info".into()
}
