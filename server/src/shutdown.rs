use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::info;

use crate::grabber::Grabber;

/// Process-wide cleanup: ends preview streams, stops the grabber and releases
/// the camera. Only the first call does anything.
pub struct Shutdown {
    done: AtomicBool,
    grabber: Mutex<Option<Grabber>>,
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new(grabber: Grabber) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            done: AtomicBool::new(false),
            grabber: Mutex::new(Some(grabber)),
            tx,
        }
    }

    /// Receiver that flips to `true` once shutdown starts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Returns `true` if this call performed the shutdown.
    pub fn shutdown(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("shutting down");
        self.tx.send_replace(true);

        let grabber = self
            .grabber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(grabber) = grabber {
            let frames = grabber.stats().frames.load(Ordering::Relaxed);
            let mut camera = grabber.stop();
            camera.stop();
            camera.close();
            info!(camera = camera.name(), frames, "camera released");
        }
        true
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.shutdown();
    }
}
