//! Store Errors
//!
//! Every failure a Store operation can return. None of them leave the Store
//! unusable: the worst case is one of these plus an idle Store.

use thiserror::Error;

use crate::backend::ApiError;
use crate::exchange::ValidationError;
use crate::history::HistoryError;
use crate::transport::TransportError;

/// Error returned by [`ChatStore`](crate::store::ChatStore) operations
#[derive(Debug, Error)]
pub enum ChatError {
    /// Input rejected before any network call
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A persistence call failed
    #[error("persistence error: {0}")]
    Persistence(#[from] ApiError),
    /// The streaming exchange failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Guest history could not be loaded or saved
    #[error("guest history error: {0}")]
    History(#[from] HistoryError),
    /// Operation needs a mode the Store is not in
    #[error("operation requires {0} mode")]
    WrongMode(crate::messages::Mode),
    /// Operation needs a selected conversation
    #[error("no conversation selected")]
    NoConversation,
}

/// Result type for Store operations
pub type Result<T> = std::result::Result<T, ChatError>;
