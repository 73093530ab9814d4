use std::sync::Arc;
use std::time::Duration;

use photobooth_common::config::CaptureConfig;
use photobooth_common::frame::{FrameBuffer, FreezeSlot};
use tracing::{info, warn};

use crate::enhance::{brighten_jpeg, Adjust};
use crate::printer::{print_file, PrintError, Printer};
use crate::storage::{CaptureRecord, PhotoStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no frame available yet")]
    NoFrameAvailable,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a capture that was followed by a print attempt.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub record: CaptureRecord,
    pub print: Result<(), PrintError>,
}

/// Turns the current preview frame into a stored photo.
pub struct CaptureCoordinator {
    buffer: Arc<FrameBuffer>,
    freeze: Arc<FreezeSlot>,
    store: PhotoStore,
    brightness: f32,
    freeze_for: Option<Duration>,
}

impl CaptureCoordinator {
    pub fn new(
        buffer: Arc<FrameBuffer>,
        freeze: Arc<FreezeSlot>,
        store: PhotoStore,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            buffer,
            freeze,
            store,
            brightness: config.brightness,
            freeze_for: config.freeze_hold(),
        }
    }

    pub fn store(&self) -> &PhotoStore {
        &self.store
    }

    /// Snapshot the live frame and write it to the photo store.
    ///
    /// Blocks on disk I/O; async callers should run it on a blocking thread.
    pub fn capture(&self) -> Result<CaptureRecord, CaptureError> {
        let frame = self.buffer.read().ok_or(CaptureError::NoFrameAvailable)?;

        let brightened = if (self.brightness - 1.0).abs() > f32::EPSILON {
            match brighten_jpeg(&frame.data, self.brightness) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(error = %e, seq = frame.seq, "brightness adjustment failed, keeping raw frame");
                    None
                }
            }
        } else {
            None
        };
        // The photo is written once, with its final contents.
        let record = self
            .store
            .save_new(brightened.as_deref().unwrap_or(frame.data.as_ref()))?;

        if let Some(hold) = self.freeze_for {
            self.freeze.freeze(frame.clone(), hold);
        }

        info!(
            name = record.name,
            seq = frame.seq,
            bytes = record.bytes,
            "captured photo"
        );
        Ok(record)
    }

    /// Capture, then print the stored photo. A failed print keeps the photo.
    pub fn capture_and_print(
        &self,
        printer: &dyn Printer,
        print_width: u32,
    ) -> Result<CaptureOutcome, CaptureError> {
        let record = self.capture()?;
        let print = print_file(printer, &record.path, Adjust::Auto, print_width);
        if let Err(e) = &print {
            warn!(error = %e, name = record.name, "print failed after capture");
        }
        Ok(CaptureOutcome { record, print })
    }
}
