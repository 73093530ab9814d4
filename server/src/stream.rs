use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use photobooth_common::frame::{Frame, FrameBuffer, FreezeSlot};
use tokio::sync::watch;
use tracing::debug;

pub const BOUNDARY: &str = "frame";

/// Where the preview stream gets its frames from.
#[derive(Clone)]
pub struct FrameSource {
    pub buffer: Arc<FrameBuffer>,
    pub freeze: Arc<FreezeSlot>,
}

impl FrameSource {
    /// The frozen capture while a freeze is active, otherwise the live frame.
    pub fn current(&self) -> Option<Frame> {
        self.freeze.current().or_else(|| self.buffer.read())
    }
}

/// One multipart part: boundary, headers, JPEG bytes, trailing CRLF.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

struct StreamState {
    source: FrameSource,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    first: bool,
}

/// Endless sequence of multipart parts, one per `interval`.
///
/// Ticks with no frame yet are skipped. The stream ends when the shutdown
/// flag flips or its sender goes away; a client disconnect drops it.
pub fn frame_stream(
    source: FrameSource,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let state = StreamState {
        source,
        interval,
        shutdown,
        first: true,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if *state.shutdown.borrow() {
                debug!("preview stream closed for shutdown");
                return None;
            }
            if !state.first {
                tokio::select! {
                    _ = tokio::time::sleep(state.interval) => {}
                    changed = state.shutdown.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                        continue;
                    }
                }
            }
            state.first = false;
            if let Some(frame) = state.source.current() {
                return Some((Ok(encode_part(&frame.data)), state));
            }
        }
    })
}

/// `multipart/x-mixed-replace` response around [`frame_stream`].
pub fn mjpeg_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".into()),
            (header::PRAGMA, "no-cache".into()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
