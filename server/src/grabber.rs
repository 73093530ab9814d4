use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use photobooth_common::frame::FrameBuffer;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraError, CameraFrame, CameraSource, Interrupt};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("camera returned bytes that are not a JPEG ({0} bytes)")]
    NotJpeg(usize),
}

/// Turn a camera sample into the JPEG bytes kept in the frame buffer.
pub fn encode_frame(frame: CameraFrame, quality: u8) -> Result<Bytes, EncodeError> {
    match frame {
        CameraFrame::Raw(img) => {
            let mut out = Cursor::new(Vec::with_capacity(64 * 1024));
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            encoder.encode_image(&img)?;
            Ok(Bytes::from(out.into_inner()))
        }
        CameraFrame::Jpeg(data) => {
            if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
                return Err(EncodeError::NotJpeg(data.len()));
            }
            Ok(Bytes::from(data))
        }
    }
}

#[derive(Debug, Default)]
pub struct GrabberStats {
    pub frames: AtomicU64,
    pub capture_failures: AtomicU64,
    pub encode_failures: AtomicU64,
}

/// Background thread that keeps the frame buffer fresh.
pub struct Grabber {
    stop: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
    handle: JoinHandle<Box<dyn CameraSource>>,
    stats: Arc<GrabberStats>,
}

impl Grabber {
    pub fn spawn(
        camera: Box<dyn CameraSource>,
        buffer: Arc<FrameBuffer>,
        interval: Duration,
        jpeg_quality: u8,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(GrabberStats::default());
        let interrupt = camera.interrupt_handle();
        let handle = {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name("frame-grabber".into())
                .spawn(move || run(camera, &buffer, interval, jpeg_quality, &stop, &stats))?
        };
        Ok(Self {
            stop,
            interrupt,
            handle,
            stats,
        })
    }

    pub fn stats(&self) -> &GrabberStats {
        &self.stats
    }

    /// Ask the loop to finish, wait for it, and take the camera back.
    /// A capture blocked on the device is interrupted first.
    pub fn stop(self) -> Box<dyn CameraSource> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(interrupt) = &self.interrupt {
            interrupt();
        }
        match self.handle.join() {
            Ok(camera) => camera,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn run(
    mut camera: Box<dyn CameraSource>,
    buffer: &FrameBuffer,
    interval: Duration,
    jpeg_quality: u8,
    stop: &AtomicBool,
    stats: &GrabberStats,
) -> Box<dyn CameraSource> {
    let self_paced = camera.is_self_paced();
    info!(
        camera = camera.name(),
        interval_ms = interval.as_millis() as u64,
        self_paced,
        "frame grabber started"
    );

    while !stop.load(Ordering::Relaxed) {
        let mut failed = false;
        match camera.capture() {
            Ok(frame) => match encode_frame(frame, jpeg_quality) {
                Ok(jpeg) => {
                    let bytes = jpeg.len();
                    let seq = buffer.write(jpeg);
                    let total = stats.frames.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % 300 == 0 {
                        debug!(seq, bytes, total, "frames grabbed");
                    }
                }
                Err(e) => {
                    failed = true;
                    stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "failed to encode frame, skipping");
                }
            },
            Err(CameraError::Closed) => {
                if !stop.load(Ordering::Relaxed) {
                    error!("camera closed unexpectedly, frame grabber exiting");
                }
                break;
            }
            Err(e) => {
                failed = true;
                stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "failed to capture frame, skipping");
            }
        }
        // Self-paced cameras already block until their next frame.
        if failed || !self_paced {
            std::thread::sleep(interval);
        }
    }

    info!(
        frames = stats.frames.load(Ordering::Relaxed),
        capture_failures = stats.capture_failures.load(Ordering::Relaxed),
        encode_failures = stats.encode_failures.load(Ordering::Relaxed),
        "frame grabber stopped"
    );
    camera
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::TestPatternSource;
    use std::collections::VecDeque;

    /// Replays a script of results, then returns `fallback` forever.
    struct ScriptedCamera {
        script: VecDeque<Result<CameraFrame, CameraError>>,
        fallback: Vec<u8>,
    }

    impl CameraSource for ScriptedCamera {
        fn capture(&mut self) -> Result<CameraFrame, CameraError> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Ok(CameraFrame::Jpeg(self.fallback.clone())))
        }
        fn stop(&mut self) {}
        fn close(&mut self) {}
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not met in time");
    }

    #[test]
    fn raw_frames_are_encoded_as_jpeg() {
        let mut cam = TestPatternSource::new(32, 24);
        let jpeg = encode_frame(cam.capture().unwrap(), 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn jpeg_frames_pass_through_untouched() {
        let data = vec![0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9];
        let out = encode_frame(CameraFrame::Jpeg(data.clone()), 80).unwrap();
        assert_eq!(out.as_ref(), data.as_slice());
        assert!(matches!(
            encode_frame(CameraFrame::Jpeg(vec![1, 2, 3, 4]), 80),
            Err(EncodeError::NotJpeg(4))
        ));
    }

    #[test]
    fn bad_frames_do_not_stop_the_loop() {
        let good = vec![0xFF, 0xD8, 0x42, 0xFF, 0xD9];
        let camera = ScriptedCamera {
            script: VecDeque::from(vec![
                Err(CameraError::Capture("timeout".into())),
                Ok(CameraFrame::Jpeg(vec![0, 0, 0, 0])),
                Err(CameraError::Capture("timeout".into())),
            ]),
            fallback: good.clone(),
        };
        let buffer = Arc::new(FrameBuffer::new());
        let grabber =
            Grabber::spawn(Box::new(camera), Arc::clone(&buffer), Duration::from_millis(1), 80)
                .unwrap();

        wait_for(|| buffer.read().is_some());
        assert_eq!(buffer.read().unwrap().data.as_ref(), good.as_slice());
        assert_eq!(grabber.stats().capture_failures.load(Ordering::Relaxed), 2);
        assert_eq!(grabber.stats().encode_failures.load(Ordering::Relaxed), 1);
        grabber.stop();
    }

    #[test]
    fn stop_returns_the_camera_and_halts_writes() {
        let buffer = Arc::new(FrameBuffer::new());
        let grabber = Grabber::spawn(
            Box::new(TestPatternSource::new(8, 8)),
            Arc::clone(&buffer),
            Duration::from_millis(1),
            50,
        )
        .unwrap();
        wait_for(|| buffer.frames_written() >= 3);

        let camera = grabber.stop();
        assert_eq!(camera.name(), "test-pattern");
        let written = buffer.frames_written();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.frames_written(), written);
    }

    #[test]
    fn closed_camera_ends_the_loop() {
        let camera = ScriptedCamera {
            script: VecDeque::from(vec![Err(CameraError::Closed)]),
            fallback: vec![],
        };
        let buffer = Arc::new(FrameBuffer::new());
        let grabber =
            Grabber::spawn(Box::new(camera), Arc::clone(&buffer), Duration::from_millis(1), 80)
                .unwrap();
        // The thread exits on its own; stop() just joins it.
        grabber.stop();
        assert!(buffer.read().is_none());
    }

    /// Blocks in `capture` until interrupted, like a stalled camera process.
    struct StalledCamera {
        entered: Arc<AtomicBool>,
        released: Arc<AtomicBool>,
    }

    impl CameraSource for StalledCamera {
        fn capture(&mut self) -> Result<CameraFrame, CameraError> {
            self.entered.store(true, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(CameraError::Closed)
        }
        fn stop(&mut self) {}
        fn close(&mut self) {}
        fn interrupt_handle(&self) -> Option<Interrupt> {
            let released = Arc::clone(&self.released);
            Some(Box::new(move || released.store(true, Ordering::SeqCst)))
        }
    }

    #[test]
    fn stop_interrupts_a_blocked_capture() {
        let entered = Arc::new(AtomicBool::new(false));
        let camera = StalledCamera {
            entered: Arc::clone(&entered),
            released: Arc::new(AtomicBool::new(false)),
        };
        let grabber = Grabber::spawn(
            Box::new(camera),
            Arc::new(FrameBuffer::new()),
            Duration::from_millis(1),
            80,
        )
        .unwrap();
        wait_for(|| entered.load(Ordering::SeqCst));

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            grabber.stop();
            let _ = tx.send(());
        });
        assert!(
            rx.recv_timeout(Duration::from_secs(2)).is_ok(),
            "stop stayed blocked on the camera"
        );
    }

    /// Hands out a frame per call and reports its own pacing.
    struct PacedCamera;

    impl CameraSource for PacedCamera {
        fn capture(&mut self) -> Result<CameraFrame, CameraError> {
            Ok(CameraFrame::Jpeg(vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]))
        }
        fn stop(&mut self) {}
        fn close(&mut self) {}
        fn is_self_paced(&self) -> bool {
            true
        }
    }

    #[test]
    fn self_paced_camera_is_read_without_extra_sleep() {
        let buffer = Arc::new(FrameBuffer::new());
        // With the interval applied this would take an hour per frame.
        let grabber = Grabber::spawn(
            Box::new(PacedCamera),
            Arc::clone(&buffer),
            Duration::from_secs(3600),
            80,
        )
        .unwrap();
        wait_for(|| buffer.frames_written() >= 5);
        assert!(grabber.stats().frames.load(Ordering::Relaxed) >= 5);
        // Stopping checks the flag between back-to-back reads.
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            grabber.stop();
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
