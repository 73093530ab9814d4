mod button;
mod camera;
mod capture;
mod enhance;
mod grabber;
mod printer;
mod shutdown;
mod storage;
mod stream;
mod web;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use photobooth_common::config::Config;
use photobooth_common::frame::{FrameBuffer, FreezeSlot};
use photobooth_common::signal;
use tracing::{error, info, warn};

use capture::CaptureCoordinator;
use grabber::Grabber;
use printer::{DisabledPrinter, EscPosPrinter, Printer};
use shutdown::Shutdown;
use storage::PhotoStore;
use stream::FrameSource;
use web::AppState;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = ?config.camera.source,
        photos_dir = config.server.photos_dir,
        freeze_secs = config.capture.freeze_secs,
        print_on_capture = config.prints_on_capture(),
        printer = config.printer.enabled,
        button = config.button.enabled,
        "starting photo booth"
    );

    let store = match PhotoStore::open(&config.server.photos_dir) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to prepare photo directory");
            std::process::exit(1);
        }
    };

    let camera = match camera::open_configured(&config.camera).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to open camera");
            std::process::exit(1);
        }
    };

    let buffer = Arc::new(FrameBuffer::new());
    let freeze = Arc::new(FreezeSlot::new());
    let frame_interval = Duration::from_millis(config.camera.frame_interval_ms);

    let grabber = match Grabber::spawn(
        camera,
        Arc::clone(&buffer),
        frame_interval,
        config.camera.jpeg_quality,
    ) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "failed to start frame grabber");
            std::process::exit(1);
        }
    };
    let shutdown = Arc::new(Shutdown::new(grabber));

    let printer: Arc<dyn Printer> = if config.printer.enabled {
        Arc::new(EscPosPrinter::new(&config.printer.device, config.printer.cut))
    } else {
        Arc::new(DisabledPrinter)
    };

    let coordinator = CaptureCoordinator::new(
        Arc::clone(&buffer),
        Arc::clone(&freeze),
        store,
        &config.capture,
    );
    if config.capture.print_on_capture && !config.printer.enabled {
        info!("printer disabled, captures will not be printed");
    }
    let state = Arc::new(AppState::new(
        &config,
        coordinator,
        FrameSource { buffer, freeze },
        printer,
        shutdown.subscribe(),
    ));

    let button_stop = Arc::new(AtomicBool::new(false));
    if config.button.enabled {
        if let Err(e) = button::spawn(&config.button, Arc::clone(&state), Arc::clone(&button_stop)) {
            warn!(error = %e, "button input unavailable, continuing without it");
        }
    }

    let app = web::router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(addr, "photo booth server starting");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr, "failed to bind");
            shutdown.shutdown();
            std::process::exit(1);
        }
    };

    let on_signal = Arc::clone(&shutdown);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal::wait_for_signal().await;
            // Open preview streams end once the flag flips, letting the
            // server drain. Camera release happens off the runtime threads.
            let _ = tokio::task::spawn_blocking(move || on_signal.shutdown()).await;
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
    }

    button_stop.store(true, Ordering::Relaxed);
    shutdown.shutdown();
    info!("photo booth stopped");
}
