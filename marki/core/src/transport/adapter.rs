//! Stream Transport Adapter
//!
//! Owns at most one open exchange at a time and turns the transport's raw
//! events into a well-ordered sequence of typed [`Frame`]s.
//!
//! # Frame grammar
//!
//! ```text
//! start (chunk)* (end | error)
//! ```
//!
//! [`FrameHandle::next_frame`] enforces the grammar regardless of what the
//! wire delivers: a missing `start` is synthesised, duplicate `start`s are
//! dropped, a stream that closes early ends with a synthesised `error`, and
//! nothing is delivered after a terminal frame or after cancellation.
//! Undecodable events are logged and skipped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{ExchangeRequest, Frame};
use super::traits::{StreamTransport, TransportError, TransportItem};

/// Identifier of one opened handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle_{}", self.0)
    }
}

/// The currently open handle
struct ActiveHandle {
    id: HandleId,
    cancel: CancellationToken,
}

/// Adapter enforcing the at-most-one-open-handle invariant
pub struct StreamAdapter {
    transport: Arc<dyn StreamTransport>,
    active: Mutex<Option<ActiveHandle>>,
    next_id: AtomicU64,
}

impl StreamAdapter {
    /// Create an adapter over a transport
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a new exchange, cancelling any previous one first
    ///
    /// `cancel` is the caller's token; cancelling it silences the handle.
    ///
    /// # Errors
    ///
    /// Returns the transport's connection error, [`TransportError::Cancelled`]
    /// if `cancel` fired while connecting, or [`TransportError::Superseded`]
    /// if another `open` started meanwhile.
    pub async fn open(
        &self,
        request: &ExchangeRequest,
        cancel: CancellationToken,
    ) -> Result<FrameHandle, TransportError> {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::SeqCst));

        {
            let mut active = self.active.lock();
            if let Some(previous) = active.take() {
                tracing::debug!(previous = %previous.id, next = %id, "Cancelling previous stream");
                previous.cancel.cancel();
            }
            *active = Some(ActiveHandle {
                id,
                cancel: cancel.clone(),
            });
        }

        tracing::debug!(handle = %id, transport = self.transport.name(), "Opening stream");
        let result = self.transport.open(request, cancel.clone()).await;

        let still_current = self
            .active
            .lock()
            .as_ref()
            .is_some_and(|active| active.id == id);

        if cancel.is_cancelled() {
            self.release(id);
            return Err(if still_current {
                TransportError::Cancelled
            } else {
                TransportError::Superseded
            });
        }
        if !still_current {
            cancel.cancel();
            return Err(TransportError::Superseded);
        }

        match result {
            Ok(rx) => Ok(FrameHandle::new(id, rx, cancel)),
            Err(e) => {
                self.release(id);
                Err(e)
            }
        }
    }

    /// Cancel the open handle, if any
    pub fn cancel(&self) {
        if let Some(active) = self.active.lock().take() {
            tracing::debug!(handle = %active.id, "Cancelling stream");
            active.cancel.cancel();
        }
    }

    /// Id of the open handle, if any
    #[must_use]
    pub fn active_handle(&self) -> Option<HandleId> {
        self.active.lock().as_ref().map(|active| active.id)
    }

    /// Forget `id` if it is still the open handle
    pub fn release(&self, id: HandleId) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
        }
    }
}

/// A lazy, finite, non-restartable sequence of frames
pub struct FrameHandle {
    id: HandleId,
    rx: mpsc::Receiver<TransportItem>,
    cancel: CancellationToken,
    started: bool,
    finished: bool,
    /// Frame held back while a synthesised `start` is delivered
    pending: Option<Frame>,
}

impl FrameHandle {
    fn new(id: HandleId, rx: mpsc::Receiver<TransportItem>, cancel: CancellationToken) -> Self {
        Self {
            id,
            rx,
            cancel,
            started: false,
            finished: false,
            pending: None,
        }
    }

    /// Handle id
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Cancel this handle; no frame is delivered afterwards
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the handle was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next frame, or `None` once finished or cancelled
    pub async fn next_frame(&mut self) -> Option<Frame> {
        if self.finished || self.cancel.is_cancelled() {
            return None;
        }

        if let Some(frame) = self.pending.take() {
            return Some(self.deliver(frame));
        }

        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                item = self.rx.recv() => item,
            };

            // A frame that raced with cancel is dropped
            if self.cancel.is_cancelled() {
                return None;
            }

            let frame = match item {
                Some(TransportItem::Event(raw)) => match Frame::decode(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(handle = %self.id, error = %e, "Skipping undecodable frame");
                        continue;
                    }
                },
                Some(TransportItem::Failed(e)) => Frame::Error {
                    message: e.to_string(),
                },
                None => Frame::Error {
                    message: TransportError::ConnectionClosed.to_string(),
                },
            };

            let is_start = matches!(frame, Frame::Start { .. });
            match (is_start, self.started) {
                (true, true) => {
                    tracing::warn!(handle = %self.id, "Dropping duplicate start frame");
                }
                (true, false) => return Some(self.deliver(frame)),
                (_, false) => {
                    tracing::warn!(handle = %self.id, frame = frame.name(), "Frame before start, synthesising start");
                    self.pending = Some(frame);
                    return Some(self.deliver(Frame::Start {
                        conversation_id: None,
                        user_message_id: None,
                    }));
                }
                (_, true) => return Some(self.deliver(frame)),
            }
        }
    }

    fn deliver(&mut self, frame: Frame) -> Frame {
        if matches!(frame, Frame::Start { .. }) {
            self.started = true;
        } else if frame.is_terminal() {
            self.finished = true;
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::frame::RawEvent;

    /// Transport that hands out pre-built receivers
    struct QueueTransport {
        queued: Mutex<Vec<mpsc::Receiver<TransportItem>>>,
    }

    #[async_trait]
    impl StreamTransport for QueueTransport {
        fn name(&self) -> &str {
            "Queue"
        }

        async fn open(
            &self,
            _request: &ExchangeRequest,
            _cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<TransportItem>, TransportError> {
            self.queued
                .lock()
                .pop()
                .ok_or_else(|| TransportError::ConnectionFailed("no stream queued".to_string()))
        }
    }

    fn event(name: &str, data: &str) -> TransportItem {
        TransportItem::Event(RawEvent::new(name, data))
    }

    fn adapter_with(items: Vec<TransportItem>) -> StreamAdapter {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }
        drop(tx);
        StreamAdapter::new(Arc::new(QueueTransport {
            queued: Mutex::new(vec![rx]),
        }))
    }

    async fn collect(handle: &mut FrameHandle) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = handle.next_frame().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_well_formed_sequence() {
        let adapter = adapter_with(vec![
            event("start", r#"{"user_message_id":"u1"}"#),
            event("chunk", r#"{"content":"a"}"#),
            event("end", r#"{"content":"a"}"#),
            event("chunk", r#"{"content":"late"}"#),
        ]);
        let mut handle = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = collect(&mut handle).await.iter().map(Frame::name).collect();
        assert_eq!(names, vec!["start", "chunk", "end"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped() {
        let adapter = adapter_with(vec![
            event("start", "{}"),
            event("chunk", "{broken"),
            event("chunk", r#"{"content":"ok"}"#),
            event("end", r#"{"content":"ok"}"#),
        ]);
        let mut handle = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        let frames = collect(&mut handle).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[1],
            Frame::Chunk {
                conversation_id: None,
                text: "ok".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_start_is_synthesised() {
        let adapter = adapter_with(vec![event("chunk", r#"{"content":"x"}"#)]);
        let mut handle = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = collect(&mut handle).await.iter().map(Frame::name).collect();
        // Closed without end: synthesised error
        assert_eq!(names, vec!["start", "chunk", "error"]);
    }

    #[tokio::test]
    async fn test_duplicate_start_dropped() {
        let adapter = adapter_with(vec![
            event("start", "{}"),
            event("start", "{}"),
            event("error", r#"{"message":"bad"}"#),
        ]);
        let mut handle = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = collect(&mut handle).await.iter().map(Frame::name).collect();
        assert_eq!(names, vec!["start", "error"]);
    }

    #[tokio::test]
    async fn test_cancel_silences_queued_frames() {
        let adapter = adapter_with(vec![
            event("start", "{}"),
            event("chunk", r#"{"content":"a"}"#),
            event("end", r#"{"content":"a"}"#),
        ]);
        let mut handle = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(handle.next_frame().await.is_some());
        adapter.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.next_frame().await.is_none());
        assert!(adapter.active_handle().is_none());
    }

    #[tokio::test]
    async fn test_open_cancels_previous_handle() {
        let (_tx1, rx1) = mpsc::channel(4);
        let (_tx2, rx2) = mpsc::channel(4);
        let adapter = StreamAdapter::new(Arc::new(QueueTransport {
            queued: Mutex::new(vec![rx2, rx1]),
        }));

        let first = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        let second = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(adapter.active_handle(), Some(second.id()));
    }

    #[tokio::test]
    async fn test_failed_open_releases_slot() {
        let adapter = StreamAdapter::new(Arc::new(QueueTransport {
            queued: Mutex::new(Vec::new()),
        }));

        let result = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(adapter.active_handle().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_is_terminal_error() {
        let adapter = adapter_with(vec![
            event("start", "{}"),
            TransportItem::Failed(TransportError::ReceiveFailed("reset".to_string())),
        ]);
        let mut handle = adapter
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        let frames = collect(&mut handle).await;
        assert_eq!(
            frames.last(),
            Some(&Frame::Error {
                message: "receive failed: reset".to_string()
            })
        );
    }
}
