//! Push-button input over the Linux sysfs GPIO interface.
//!
//! The button is wired active-low: the line idles high through a pull-up and
//! reads low while pressed. Presses are reported on the falling edge.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SYSFS_GPIO: &str = "/sys/class/gpio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    High,
    Low,
}

/// Turns sampled line levels into debounced press events.
#[derive(Debug)]
pub struct EdgeDetector {
    debounce: Duration,
    last_level: Level,
    last_press: Option<Instant>,
}

impl EdgeDetector {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            last_level: Level::High,
            last_press: None,
        }
    }

    /// Feed one sample. Returns `true` when it completes a press.
    pub fn update(&mut self, level: Level, now: Instant) -> bool {
        let falling = self.last_level == Level::High && level == Level::Low;
        self.last_level = level;
        if !falling {
            return false;
        }
        match self.last_press {
            Some(prev) if now.duration_since(prev) < self.debounce => false,
            _ => {
                self.last_press = Some(now);
                true
            }
        }
    }
}

/// Anything that can report the current level of the button line.
pub trait InputPin: Send {
    fn read(&mut self) -> Result<Level, GpioError>;
}

/// A GPIO line read through `/sys/class/gpio/gpioN/value`.
pub struct SysfsPin {
    gpio: u32,
    value_path: PathBuf,
}

impl SysfsPin {
    /// Export the line if needed and configure it as an input.
    pub fn open(gpio: u32) -> Result<Self, GpioError> {
        let base = PathBuf::from(SYSFS_GPIO);
        let pin_dir = base.join(format!("gpio{gpio}"));
        if !pin_dir.exists() {
            std::fs::write(base.join("export"), gpio.to_string())
                .map_err(|e| GpioError::Export(gpio, e))?;
            debug!(gpio, "exported GPIO line");
        }
        std::fs::write(pin_dir.join("direction"), "in")
            .map_err(|e| GpioError::Configure(gpio, e))?;
        info!(gpio, "GPIO line configured as input");
        Ok(Self {
            gpio,
            value_path: pin_dir.join("value"),
        })
    }

    pub fn gpio(&self) -> u32 {
        self.gpio
    }
}

impl InputPin for SysfsPin {
    fn read(&mut self) -> Result<Level, GpioError> {
        let raw = std::fs::read_to_string(&self.value_path)
            .map_err(|e| GpioError::Read(self.gpio, e))?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(GpioError::BadValue(self.gpio, other.to_string())),
        }
    }
}

/// Poll `pin` every `poll` until `stop` is set, calling `on_press` per press.
///
/// Read errors are logged and the loop keeps polling.
pub fn watch_button<P, F>(
    mut pin: P,
    mut detector: EdgeDetector,
    poll: Duration,
    stop: &AtomicBool,
    mut on_press: F,
) where
    P: InputPin,
    F: FnMut(),
{
    let mut read_failures: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        match pin.read() {
            Ok(level) => {
                if detector.update(level, Instant::now()) {
                    debug!("button pressed");
                    on_press();
                }
            }
            Err(e) => {
                read_failures += 1;
                // Avoid flooding the log at 100 Hz when the line is gone.
                if read_failures == 1 || read_failures % 1000 == 0 {
                    warn!(error = %e, read_failures, "failed to read button line");
                }
            }
        }
        std::thread::sleep(poll);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("failed to export GPIO {0}: {1}")]
    Export(u32, std::io::Error),
    #[error("failed to configure GPIO {0} as input: {1}")]
    Configure(u32, std::io::Error),
    #[error("failed to read GPIO {0}: {1}")]
    Read(u32, std::io::Error),
    #[error("unexpected value {1:?} on GPIO {0}")]
    BadValue(u32, String),
}
