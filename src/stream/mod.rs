//! Ordered, cancellable output stream for one streamed chat request.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::agent_loop::RunStatus;

/// One item of a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Answer text, in arrival order.
    Text { text: String },
    /// Terminal failure marker. Nothing follows it.
    Error { message: String },
    /// Terminal success marker.
    Done { session_id: String, status: RunStatus },
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::Text { .. })
    }
}

/// Caller side of a streamed run.
///
/// Dropping it cancels the run.
pub struct ResponseStream {
    rx: UnboundedReceiverStream<StreamChunk>,
    session_id: String,
    _cancel_on_drop: DropGuard,
}

impl ResponseStream {
    /// Session the run belongs to, known before any chunk arrives.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Stream for ResponseStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Producer side. Text may be sent from synchronous callbacks; a terminal
/// chunk consumes the emitter so nothing can follow it.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    tx: mpsc::UnboundedSender<StreamChunk>,
}

impl StreamEmitter {
    /// Forward a text fragment. Returns false once the caller is gone.
    pub fn text(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(StreamChunk::Text { text }).is_ok()
    }

    pub fn error(self, message: impl Into<String>) {
        let _ = self.tx.send(StreamChunk::Error {
            message: message.into(),
        });
    }

    pub fn done(self, session_id: impl Into<String>, status: RunStatus) {
        let _ = self.tx.send(StreamChunk::Done {
            session_id: session_id.into(),
            status,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a connected emitter/stream pair. Dropping the stream cancels `cancel`.
pub fn response_channel(
    session_id: impl Into<String>,
    cancel: CancellationToken,
) -> (StreamEmitter, ResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = ResponseStream {
        rx: UnboundedReceiverStream::new(rx),
        session_id: session_id.into(),
        _cancel_on_drop: cancel.drop_guard(),
    };
    (StreamEmitter { tx }, stream)
}
