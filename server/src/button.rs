use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use photobooth_common::config::ButtonConfig;
use photobooth_common::gpio::{watch_button, EdgeDetector, InputPin, SysfsPin};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::web::AppState;

/// Spawn the GPIO polling thread and the task that turns presses into captures.
pub fn spawn(
    config: &ButtonConfig,
    state: Arc<AppState>,
    stop: Arc<AtomicBool>,
) -> Result<(), photobooth_common::gpio::GpioError> {
    let pin = SysfsPin::open(config.gpio)?;
    info!(gpio = pin.gpio(), debounce_ms = config.debounce_ms, "button listener active");
    spawn_with_pin(pin, config, state, stop);
    Ok(())
}

pub fn spawn_with_pin<P: InputPin + 'static>(
    pin: P,
    config: &ButtonConfig,
    state: Arc<AppState>,
    stop: Arc<AtomicBool>,
) {
    // A press that arrives while a capture is still running waits here, so
    // quick double presses are not dropped.
    let (tx, rx) = mpsc::channel::<()>(8);
    let detector = EdgeDetector::new(Duration::from_millis(config.debounce_ms));
    let poll = Duration::from_millis(config.poll_ms);

    let spawned = std::thread::Builder::new()
        .name("button".into())
        .spawn(move || {
            watch_button(pin, detector, poll, &stop, || {
                if tx.try_send(()).is_err() {
                    warn!("button press dropped, capture queue full");
                }
            })
        });
    if let Err(e) = spawned {
        error!(error = %e, "failed to start button thread");
        return;
    }

    tokio::spawn(handle_presses(rx, state));
}

async fn handle_presses(mut rx: mpsc::Receiver<()>, state: Arc<AppState>) {
    while rx.recv().await.is_some() {
        let state = Arc::clone(&state);
        let result = tokio::task::spawn_blocking(move || state.capture_blocking()).await;
        match result {
            Ok(reply) => info!(status = reply.status.as_u16(), message = reply.message, "button capture"),
            Err(e) => error!(error = %e, "button capture task failed"),
        }
    }
}
