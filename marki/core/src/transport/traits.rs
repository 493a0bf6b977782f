//! Transport Traits
//!
//! The seam between the Stream Transport Adapter and a concrete network
//! exchange. A transport only moves bytes and splits them into raw events;
//! typed decoding and frame-order enforcement live in the adapter.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{ExchangeRequest, RawEvent};

/// Errors that can occur during a streaming exchange
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to the backend failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Backend answered with a non-success status
    #[error("HTTP error! status: {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, if any
        body: String,
    },
    /// Reading the response body failed mid-stream
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
    /// Connection closed before a terminal frame arrived
    #[error("connection closed before the response completed")]
    ConnectionClosed,
    /// A newer exchange was opened while this one was connecting
    #[error("exchange superseded by a newer one")]
    Superseded,
    /// Exchange was cancelled while connecting
    #[error("exchange cancelled")]
    Cancelled,
}

/// One item delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportItem {
    /// A complete, undecoded event
    Event(RawEvent),
    /// The transport failed; nothing follows
    Failed(TransportError),
}

/// A network exchange that produces raw events
///
/// Implementations must stop producing as soon as `cancel` is cancelled and
/// close the receiver when the underlying stream ends.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &str;

    /// Open one exchange
    ///
    /// Resolves once the backend accepted the request; events then arrive
    /// on the returned channel.
    async fn open(
        &self,
        request: &ExchangeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportItem>, TransportError>;
}
