use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use photobooth_common::config::Config;
use photobooth_common::gpio::{watch_button, EdgeDetector, SysfsPin};
use photobooth_common::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ButtonError {
    #[error("HTTP client setup failed: {0}")]
    Client(reqwest::Error),
    #[error("capture request failed: {0}")]
    Request(reqwest::Error),
    #[error("capture returned HTTP {0}: {1}")]
    Status(u16, String),
}

/// POST to the booth's capture endpoint and return the reply text.
async fn trigger_capture(client: &reqwest::Client, url: &str) -> Result<String, ButtonError> {
    let response = client.post(url).send().await.map_err(ButtonError::Request)?;
    let status = response.status();
    let body = response.text().await.map_err(ButtonError::Request)?;
    if !status.is_success() {
        return Err(ButtonError::Status(status.as_u16(), body));
    }
    Ok(body)
}

/// Turn each press into a capture request until `shutdown` resolves or the
/// button thread goes away. A shutdown also cuts short an in-flight request.
async fn forward_presses<S>(
    mut presses: mpsc::Receiver<()>,
    client: &reqwest::Client,
    url: &str,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            press = presses.recv() => {
                if press.is_none() {
                    break;
                }
                tokio::select! {
                    result = trigger_capture(client, url) => match result {
                        Ok(reply) => info!(reply, "capture triggered"),
                        Err(e) => error!(error = %e, "capture trigger failed"),
                    },
                    _ = &mut shutdown => break,
                }
            }
            _ = &mut shutdown => break,
        }
    }
}

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

    let button = config.button;
    let pin = match SysfsPin::open(button.gpio) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, gpio = button.gpio, "failed to open button line");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(ButtonError::Client)
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    info!(
        gpio = button.gpio,
        debounce_ms = button.debounce_ms,
        url = button.capture_url,
        "listening for button presses"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<()>(8);
    let detector = EdgeDetector::new(Duration::from_millis(button.debounce_ms));
    let poll = Duration::from_millis(button.poll_ms);

    let watcher_stop = Arc::clone(&stop);
    let watcher = std::thread::Builder::new()
        .name("button".into())
        .spawn(move || {
            watch_button(pin, detector, poll, &watcher_stop, || {
                if tx.try_send(()).is_err() {
                    warn!("button press dropped, request queue full");
                }
            })
        });
    let watcher = match watcher {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "failed to start button thread");
            std::process::exit(1);
        }
    };

    forward_presses(rx, &client, &button.capture_url, signal::wait_for_signal()).await;

    stop.store(true, Ordering::Relaxed);
    if watcher.join().is_err() {
        error!("button thread panicked");
    }
    info!("button listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one request with `status` and `body`, returning the URL.
    async fn one_shot(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/capture")
    }

    #[tokio::test]
    async fn successful_capture_returns_reply() {
        let url = one_shot("200 OK", "Captured photo_20240101_120000.jpg").await;
        let client = reqwest::Client::new();
        let reply = trigger_capture(&client, &url).await.unwrap();
        assert_eq!(reply, "Captured photo_20240101_120000.jpg");
    }

    #[tokio::test]
    async fn server_error_is_reported_with_body() {
        let url = one_shot("500 Internal Server Error", "No frame yet").await;
        let client = reqwest::Client::new();
        match trigger_capture(&client, &url).await {
            Err(ButtonError::Status(500, body)) => assert_eq!(body, "No frame yet"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = reqwest::Client::new();
        let result = trigger_capture(&client, &format!("http://{addr}/capture")).await;
        assert!(matches!(result, Err(ButtonError::Request(_))));
    }

    #[tokio::test]
    async fn shutdown_cuts_short_a_pending_request() {
        // Accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            let _ = accepted_tx.send(());
            std::future::pending::<()>().await;
        });

        let (presses, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let url = format!("http://{addr}/capture");
        let task = tokio::spawn(async move {
            let client = reqwest::Client::new();
            forward_presses(rx, &client, &url, async {
                let _ = stop_rx.await;
            })
            .await;
        });

        presses.send(()).await.unwrap();
        accepted_rx.await.unwrap();
        stop_tx.send(()).unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(finished.is_ok(), "press loop ignored shutdown during a request");
    }

    #[tokio::test]
    async fn closed_button_channel_ends_the_loop() {
        let (presses, rx) = mpsc::channel::<()>(8);
        drop(presses);
        let client = reqwest::Client::new();
        let done = tokio::time::timeout(
            Duration::from_secs(5),
            forward_presses(rx, &client, "http://127.0.0.1:9/capture", std::future::pending()),
        )
        .await;
        assert!(done.is_ok());
    }
}
