//! Backend Integration
//!
//! Request/response access to the chat backend's persistence and identity
//! services through a pair of traits.
//!
//! # Available Backends
//!
//! - **HTTP**: the REST API behind the web client (default)
//!
//! # Usage
//!
//! ```ignore
//! use marki_core::backend::{ConversationService, HttpBackend};
//!
//! let backend = HttpBackend::new("http://localhost:8000", DEFAULT_REQUEST_TIMEOUT)?;
//! let page = backend.list_conversations(0, 20).await?;
//! ```

mod http;
mod traits;

pub use http::{HttpBackend, DEFAULT_REQUEST_TIMEOUT};
pub use traits::{ApiError, ConversationService, IdentityService, SessionUser, UserRole};
