//! Exchange Coordination
//!
//! Turns one user message into one streaming exchange and dispatches its
//! frames as callbacks:
//!
//! ```text
//!   text + ExchangeOptions
//!          │ prepare() (validation, history cap)
//!          ▼
//!    ExchangeRequest ── start_exchange() ──► Exchange
//!                                              │ next_event() / drive()
//!                                              ▼
//!                 on_start → on_chunk* → (on_end | on_error)
//! ```
//!
//! # Design Philosophy
//!
//! The coordinator knows nothing about conversations or the Store's data
//! model. It guarantees ordering and terminal-exactly-once; the Store decides
//! what the callbacks mean. After cancellation nothing is dispatched, not
//! even a terminal callback.

pub mod coordinator;

// Re-exports for convenience
pub use coordinator::{
    history_payload, Exchange, ExchangeCallbacks, ExchangeCanceller, ExchangeCoordinator,
    ExchangeEvent, ExchangeId, ExchangeOptions, ExchangeOutcome, ValidationError,
    DEFAULT_HISTORY_LIMIT,
};
