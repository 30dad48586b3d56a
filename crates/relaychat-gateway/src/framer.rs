//! Event writer for one chat stream.
//!
//! The framer hands events to the HTTP body through a channel with a single
//! slot and returns only once the body has pulled the event, so chunks are
//! never batched and a slow client throttles the producer. After `Done` or
//! `Error` nothing more is accepted.

use axum::response::sse::Event;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

use relaychat_core::protocol::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramerError {
    #[error("stream already terminated")]
    Terminated,

    #[error("client disconnected")]
    Disconnected,
}

/// Create a framer and the receiving end the transport drains.
pub fn channel() -> (StreamFramer, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(1);
    (
        StreamFramer {
            tx,
            terminated: false,
            emitted: 0,
        },
        rx,
    )
}

/// Encode drained events as server-sent events: one `data: <json>` line per
/// event followed by a blank line.
pub fn sse_stream(
    rx: mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Event, axum::Error>> + Send + 'static {
    ReceiverStream::new(rx).map(|event| Event::default().json_data(&event))
}

pub struct StreamFramer {
    tx: mpsc::Sender<StreamEvent>,
    terminated: bool,
    emitted: usize,
}

impl StreamFramer {
    /// Write one event and wait until the transport has taken it.
    ///
    /// Fails with [`FramerError::Disconnected`] once the receiving side is
    /// gone, and with [`FramerError::Terminated`] after a terminal event.
    pub async fn emit(&mut self, event: StreamEvent) -> Result<(), FramerError> {
        if self.terminated {
            return Err(FramerError::Terminated);
        }
        let terminal = event.is_terminal();
        trace!(event = event.kind(), seq = self.emitted, "Emitting stream event");

        if self.tx.send(event).await.is_err() {
            self.terminated = true;
            return Err(FramerError::Disconnected);
        }
        self.emitted += 1;
        if terminal {
            self.terminated = true;
            return Ok(());
        }

        // The slot frees up only when the body has pulled the event.
        match self.tx.reserve().await {
            Ok(permit) => {
                drop(permit);
                Ok(())
            }
            Err(_) => {
                self.terminated = true;
                Err(FramerError::Disconnected)
            }
        }
    }

    /// Resolves when the receiving side has been dropped.
    pub async fn disconnected(&self) {
        self.tx.closed().await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Number of events accepted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}
