//! SSE event emitter for generation sessions.
//!
//! The handler returns the response stream immediately; a background task
//! keeps writing into the channel while axum drains it to the network.
//! Every write (and the close itself) is guarded by a closed flag, so
//! emitting after a client disconnect is a silent no-op, never an error.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::response::sse::{Event, Sse};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::stream::StreamEvent;

/// Terminal frame payload. Emitted exactly once per session.
pub const DONE_SENTINEL: &str = "[DONE]";

const CHANNEL_CAPACITY: usize = 256;

/// Create a writer/receiver pair for one session. The receiver side is
/// turned into the HTTP response with [`into_response_stream`].
pub fn channel() -> (SseSender, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        SseSender {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            done_sent: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

/// Wrap the receiver into an axum SSE response stream. Each payload becomes
/// one `data: <payload>\n\n` frame, in exact channel order.
pub fn into_response_stream(
    rx: mpsc::Receiver<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(ReceiverStream::new(rx).map(|payload| Ok(Event::default().data(payload))))
}

/// Order-preserving, close-safe writer for one session's SSE stream.
#[derive(Clone)]
pub struct SseSender {
    tx: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
    done_sent: Arc<AtomicBool>,
}

impl SseSender {
    /// Emit one event frame. No-op once the stream is closed.
    pub async fn send(&self, event: &StreamEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, "Failed to serialize stream event");
                return;
            }
        };
        self.send_raw(payload).await;
    }

    /// Emit the terminal `[DONE]` frame. Exactly once: later calls no-op,
    /// and a closed stream swallows it like any other write.
    pub async fn done(&self) {
        if self.done_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send_raw(DONE_SENTINEL.to_string()).await;
        self.close();
    }

    /// Mark the stream closed. Guarded by the same flag as every write, so
    /// closing twice is harmless.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True once the stream was closed locally or the client disconnected.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send_raw(&self, payload: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.send(payload).await.is_err() {
            // Receiver dropped: the client went away. Flip the flag so
            // every later write short-circuits.
            debug!("SSE receiver dropped, marking stream closed");
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn frames_preserve_order() {
        let (tx, rx) = channel();
        tx.send(&StreamEvent::progress("one")).await;
        tx.send(&StreamEvent::progress("two")).await;
        tx.send(&StreamEvent::progress("three")).await;
        tx.done().await;
        drop(tx);

        let frames = drain(rx).await;
        assert_eq!(frames.len(), 4);
        assert!(frames[0].contains("one"));
        assert!(frames[1].contains("two"));
        assert!(frames[2].contains("three"));
        assert_eq!(frames[3], DONE_SENTINEL);
    }

    #[tokio::test]
    async fn done_is_emitted_exactly_once() {
        let (tx, rx) = channel();
        tx.done().await;
        tx.done().await;
        tx.done().await;
        drop(tx);

        let frames = drain(rx).await;
        assert_eq!(frames, vec![DONE_SENTINEL.to_string()]);
    }

    #[tokio::test]
    async fn writes_after_close_are_noops() {
        let (tx, rx) = channel();
        tx.send(&StreamEvent::progress("before")).await;
        tx.close();
        tx.send(&StreamEvent::progress("after")).await;
        tx.done().await;
        drop(tx);

        let frames = drain(rx).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("before"));
    }

    #[tokio::test]
    async fn receiver_drop_flips_closed_flag_without_error() {
        let (tx, rx) = channel();
        drop(rx);
        tx.send(&StreamEvent::progress("into the void")).await;
        assert!(tx.is_closed());
        // And everything after stays silent
        tx.done().await;
    }

    #[tokio::test]
    async fn event_payload_is_wire_json() {
        let (tx, mut rx) = channel();
        tx.send(&StreamEvent::progress("hello")).await;
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["message"], "hello");
    }
}
