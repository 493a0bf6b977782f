//! Stream Transport Layer
//!
//! Moves one streaming exchange from the network into typed frames:
//! - [`SseTransport`]: HTTP server-sent events via `reqwest`
//! - [`StreamAdapter`]: at-most-one open handle, frame grammar, cancellation
//! - [`frame`]: request body, raw events, typed frames and the SSE decoder
//!
//! # Design Philosophy
//!
//! The transport knows bytes, the adapter knows frames, and neither knows
//! about conversations. A cancelled handle is silent: the consumer may
//! assume nothing is delivered after `cancel`, even if frames were queued.

pub mod adapter;
pub mod frame;
pub mod sse;
pub mod traits;

// Re-exports for convenience
pub use adapter::{FrameHandle, HandleId, StreamAdapter};
pub use frame::{DecodeError, ExchangeRequest, Frame, HistoryEntry, RawEvent, SseDecoder};
pub use sse::{SseTransport, DEFAULT_STREAM_PATH};
pub use traits::{StreamTransport, TransportError, TransportItem};
