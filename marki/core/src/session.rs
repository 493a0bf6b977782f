//! Session Management
//!
//! Tracks who is logged in. The [`SessionTracker`] talks to the identity
//! service and publishes a [`SessionStatus`] over a `watch` channel that the
//! [`SessionModeGate`](crate::gate::SessionModeGate) follows.
//!
//! # Design Philosophy
//!
//! The tracker knows nothing about conversations. It only turns identity
//! calls into status transitions; what a transition means for the chat is
//! decided by the gate.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::backend::{ApiError, IdentityService};

pub use crate::backend::{SessionUser, UserRole};

/// Identity status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionStatus {
    /// Nothing checked yet
    #[default]
    Idle,
    /// A session check or login is running
    Loading,
    /// Logged in
    Authenticated(SessionUser),
    /// Not logged in
    Unauthenticated,
}

impl SessionStatus {
    /// The logged-in user, if any
    #[must_use]
    pub fn user(&self) -> Option<&SessionUser> {
        match self {
            Self::Authenticated(user) => Some(user),
            _ => None,
        }
    }
}

/// Session operation failed
#[derive(Debug, Error)]
pub enum SessionError {
    /// Display name is blank
    #[error("display name must not be empty")]
    InvalidDisplayName,
    /// Identity service call failed
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Follows the identity service and publishes status changes
pub struct SessionTracker {
    identity: Arc<dyn IdentityService>,
    status: watch::Sender<SessionStatus>,
    last_error: Mutex<Option<String>>,
}

impl SessionTracker {
    /// Create a tracker in the `Idle` state
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            identity,
            status,
            last_error: Mutex::new(None),
        }
    }

    /// Receive status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Message of the last failed check or login
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn publish(&self, status: SessionStatus, error: Option<String>) {
        *self.last_error.lock() = error;
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Ask the identity service who is logged in
    ///
    /// A 401 means "not logged in" and is not recorded as an error.
    pub async fn refresh(&self) {
        if *self.status.borrow() == SessionStatus::Idle {
            self.publish(SessionStatus::Loading, None);
        }

        match self.identity.current_user().await {
            Ok(user) => self.publish(SessionStatus::Authenticated(user), None),
            Err(e) if e.is_unauthorized() => self.publish(SessionStatus::Unauthenticated, None),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to verify session");
                self.publish(
                    SessionStatus::Unauthenticated,
                    Some("could not verify the session".to_string()),
                );
            }
        }
    }

    /// Log in
    ///
    /// # Errors
    ///
    /// Returns the identity service error; the status is `Unauthenticated`
    /// afterwards and [`last_error`](Self::last_error) holds a message.
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionUser, SessionError> {
        self.publish(SessionStatus::Loading, None);

        match self.identity.login(email, password).await {
            Ok(user) => {
                tracing::info!(user = %user.id, "Logged in");
                self.publish(SessionStatus::Authenticated(user.clone()), None);
                Ok(user)
            }
            Err(e) => {
                let message = match &e {
                    ApiError::Status { body, .. } if !body.is_empty() => body.clone(),
                    ApiError::Status { .. } => "login failed".to_string(),
                    _ => "could not log in, please try again".to_string(),
                };
                self.publish(SessionStatus::Unauthenticated, Some(message));
                Err(e.into())
            }
        }
    }

    /// Log out
    ///
    /// The status ends `Unauthenticated` even if the call fails.
    ///
    /// # Errors
    ///
    /// Returns the identity service error, after the status changed.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let result = self.identity.logout().await;
        self.publish(SessionStatus::Unauthenticated, None);
        if let Err(ref e) = result {
            tracing::warn!(error = %e, "Logout call failed");
        }
        result.map_err(SessionError::from)
    }

    /// Change the logged-in user's display name
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidDisplayName`] for a blank name without
    /// calling the service, or the service error.
    pub async fn update_display_name(&self, display_name: &str) -> Result<SessionUser, SessionError> {
        let trimmed = display_name.trim();
        if trimmed.is_empty() {
            return Err(SessionError::InvalidDisplayName);
        }

        let user = self.identity.update_display_name(trimmed).await?;
        self.publish(SessionStatus::Authenticated(user.clone()), None);
        Ok(user)
    }
}
