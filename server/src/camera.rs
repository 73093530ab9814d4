use std::io::{BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use image::{Rgb, RgbImage};
use photobooth_common::config::{CameraConfig, CameraSourceKind};
use tracing::{debug, info, warn};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
/// A JPEG larger than this means the stream lost sync.
const MAX_JPEG_BYTES: usize = 16 * 1024 * 1024;

/// One sample as delivered by the camera.
#[derive(Debug, Clone)]
pub enum CameraFrame {
    /// Uncompressed RGB pixels that still need encoding.
    Raw(RgbImage),
    /// Already JPEG-encoded by the camera pipeline.
    Jpeg(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera busy: {0}")]
    Busy(String),
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("camera closed")]
    Closed,
}

/// A camera the grabber can pull frames from.
pub trait CameraSource: Send + 'static {
    /// Block until the next frame is available.
    fn capture(&mut self) -> Result<CameraFrame, CameraError>;

    /// Stop streaming. Further captures fail with [`CameraError::Closed`].
    fn stop(&mut self);

    /// Release the device.
    fn close(&mut self);

    fn name(&self) -> &str {
        "camera"
    }

    /// Handle that unblocks a pending [`capture`](CameraSource::capture) from
    /// another thread. `None` when captures never block for long.
    fn interrupt_handle(&self) -> Option<Interrupt> {
        None
    }

    /// Whether `capture` waits for the device's own frame clock. Such sources
    /// are read back to back instead of on the grabber's interval.
    fn is_self_paced(&self) -> bool {
        false
    }
}

pub type Interrupt = Box<dyn Fn() + Send + Sync>;

/// Try `open` up to `attempts` times, waiting `delay` between busy failures.
///
/// Only [`CameraError::Busy`] is retried; anything else is returned at once.
pub async fn open_with_retry<C, F>(
    mut open: F,
    attempts: u32,
    delay: Duration,
) -> Result<C, CameraError>
where
    F: FnMut(u32) -> Result<C, CameraError>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match open(attempt) {
            Ok(camera) => {
                info!(attempt, "camera opened");
                return Ok(camera);
            }
            Err(CameraError::Busy(msg)) => {
                warn!(attempt, max_attempts = attempts, error = %msg, "camera busy");
                if attempt >= attempts {
                    return Err(CameraError::Busy(msg));
                }
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Open the camera named by the config, retrying while it is busy.
pub async fn open_configured(config: &CameraConfig) -> Result<Box<dyn CameraSource>, CameraError> {
    let delay = Duration::from_millis(config.open_retry_delay_ms);
    open_with_retry(
        |_attempt| -> Result<Box<dyn CameraSource>, CameraError> {
            match config.source {
                CameraSourceKind::Rpicam => Ok(Box::new(RpicamSource::open(config)?)),
                CameraSourceKind::TestPattern => {
                    Ok(Box::new(TestPatternSource::new(config.width, config.height)))
                }
            }
        },
        config.open_attempts,
        delay,
    )
    .await
}

// ---------------------------------------------------------------------------
// rpicam-vid subprocess
// ---------------------------------------------------------------------------

/// Streams MJPEG from an `rpicam-vid` child process.
pub struct RpicamSource {
    child: Arc<Mutex<Option<Child>>>,
    stdout: Option<BufReader<ChildStdout>>,
    /// First frame read while probing the device during `open`.
    pending: Option<Vec<u8>>,
}

impl RpicamSource {
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let width = config.width.to_string();
        let height = config.height.to_string();
        let fps = (1000 / config.frame_interval_ms.max(1)).max(1).to_string();

        let mut child = Command::new(&config.command)
            .args([
                "-t", "0",
                "-n",
                "--codec", "mjpeg",
                "--width", &width,
                "--height", &height,
                "--framerate", &fps,
                "-o", "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CameraError::Unavailable(format!("failed to spawn {}: {e}", config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CameraError::Unavailable("could not get stdout handle".into()))?;
        let mut stdout = BufReader::with_capacity(256 * 1024, stdout);

        debug!(command = config.command, width, height, fps, "camera process started");

        // The process only fails to claim the sensor after it starts, so read
        // one frame to find out whether the device is actually ours.
        match read_jpeg(&mut stdout) {
            Ok(first) => Ok(Self {
                child: Arc::new(Mutex::new(Some(child))),
                stdout: Some(stdout),
                pending: Some(first),
            }),
            Err(e) => {
                let _ = child.kill();
                let mut stderr = String::new();
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_string(&mut stderr);
                }
                let _ = child.wait();
                Err(classify_startup_failure(&stderr, e))
            }
        }
    }
}

impl CameraSource for RpicamSource {
    fn capture(&mut self) -> Result<CameraFrame, CameraError> {
        if let Some(first) = self.pending.take() {
            return Ok(CameraFrame::Jpeg(first));
        }
        let stdout = self.stdout.as_mut().ok_or(CameraError::Closed)?;
        read_jpeg(stdout).map(CameraFrame::Jpeg)
    }

    fn stop(&mut self) {
        self.stdout = None;
        kill_child(&self.child);
    }

    fn close(&mut self) {
        let child = lock_child(&self.child).take();
        if let Some(mut child) = child {
            match child.wait() {
                Ok(status) => debug!(%status, "camera process reaped"),
                Err(e) => warn!(error = %e, "failed to reap camera process"),
            }
        }
    }

    fn name(&self) -> &str {
        "rpicam"
    }

    /// Killing the process closes its stdout, so a blocked read sees EOF.
    fn interrupt_handle(&self) -> Option<Interrupt> {
        let child = Arc::clone(&self.child);
        Some(Box::new(move || kill_child(&child)))
    }

    fn is_self_paced(&self) -> bool {
        true
    }
}

fn lock_child(child: &Mutex<Option<Child>>) -> MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn kill_child(child: &Mutex<Option<Child>>) {
    if let Some(child) = lock_child(child).as_mut() {
        if let Err(e) = child.kill() {
            debug!(error = %e, "camera process already exited");
        }
    }
}

fn classify_startup_failure(stderr: &str, err: CameraError) -> CameraError {
    let lower = stderr.to_lowercase();
    if lower.contains("busy") || lower.contains("in use") {
        CameraError::Busy(stderr.trim().to_string())
    } else if stderr.trim().is_empty() {
        CameraError::Unavailable(err.to_string())
    } else {
        CameraError::Unavailable(stderr.trim().to_string())
    }
}

/// Read the next complete JPEG (SOI through EOI) from an MJPEG byte stream.
fn read_jpeg<R: Read>(reader: &mut R) -> Result<Vec<u8>, CameraError> {
    let mut byte = [0u8; 1];
    let mut prev = 0u8;

    // Skip to the start-of-image marker.
    loop {
        read_byte(reader, &mut byte)?;
        if prev == SOI[0] && byte[0] == SOI[1] {
            break;
        }
        prev = byte[0];
    }

    let mut jpeg = Vec::with_capacity(64 * 1024);
    jpeg.extend_from_slice(&SOI);
    prev = 0;
    loop {
        read_byte(reader, &mut byte)?;
        jpeg.push(byte[0]);
        if prev == EOI[0] && byte[0] == EOI[1] {
            return Ok(jpeg);
        }
        if jpeg.len() > MAX_JPEG_BYTES {
            return Err(CameraError::Capture("JPEG exceeded size limit".into()));
        }
        prev = byte[0];
    }
}

fn read_byte<R: Read>(reader: &mut R, byte: &mut [u8; 1]) -> Result<(), CameraError> {
    match reader.read_exact(byte) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CameraError::Closed),
        Err(e) => Err(CameraError::Capture(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Synthetic source
// ---------------------------------------------------------------------------

/// Produces a moving colour gradient.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    tick: u32,
    stopped: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            tick: 0,
            stopped: false,
        }
    }
}

impl CameraSource for TestPatternSource {
    fn capture(&mut self) -> Result<CameraFrame, CameraError> {
        if self.stopped {
            return Err(CameraError::Closed);
        }
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(4);
        let (w, h) = (self.width, self.height);
        let img = RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                ((x * 255 / w + tick) % 256) as u8,
                ((y * 255 / h) % 256) as u8,
                (tick % 256) as u8,
            ])
        });
        Ok(CameraFrame::Raw(img))
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn close(&mut self) {
        self.stopped = true;
    }

    fn name(&self) -> &str {
        "test-pattern"
    }
}
