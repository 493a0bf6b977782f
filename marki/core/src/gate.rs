//! Session Mode Gate
//!
//! Follows the session status and keeps the Store's mode in line with it:
//!
//! | status            | store mode     | action                               |
//! |-------------------|----------------|--------------------------------------|
//! | `Authenticated`   | guest          | switch to authenticated, new convo,  |
//! |                   |                | forget guest history                 |
//! | `Unauthenticated` | authenticated  | switch to guest, new convo           |
//! | `Idle`, `Loading` | any            | nothing                              |
//! | anything else     | already there  | nothing                              |
//!
//! Switching mode cancels the in-flight exchange before the state is
//! cleared, so no exchange outlives the mode it started in.

use tokio::sync::watch;

use crate::messages::Mode;
use crate::session::SessionStatus;
use crate::store::ChatStore;

/// Applies session transitions to a [`ChatStore`]
#[derive(Clone)]
pub struct SessionModeGate {
    store: ChatStore,
}

impl SessionModeGate {
    /// Gate for `store`
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    /// The mode a status calls for, if it calls for one
    #[must_use]
    pub fn target_mode(status: &SessionStatus) -> Option<Mode> {
        match status {
            SessionStatus::Authenticated(_) => Some(Mode::Authenticated),
            SessionStatus::Unauthenticated => Some(Mode::Guest),
            SessionStatus::Idle | SessionStatus::Loading => None,
        }
    }

    /// Apply one status; returns the mode switched to, if any
    ///
    /// Repeating a status is a no-op.
    pub async fn observe(&self, status: &SessionStatus) -> Option<Mode> {
        let target = Self::target_mode(status)?;
        if !self.store.switch_mode(target) {
            return None;
        }

        tracing::info!(mode = %target, "Session changed, starting a new conversation");
        if let Err(e) = self.store.select_conversation(None).await {
            tracing::warn!(error = %e, "Failed to reset conversation after mode switch");
        }
        if target == Mode::Authenticated {
            if let Err(e) = self.store.clear_guest_history().await {
                tracing::warn!(error = %e, "Failed to clear guest history after login");
            }
        }
        Some(target)
    }

    /// Follow `status` until its sender is dropped
    pub async fn run(self, mut status: watch::Receiver<SessionStatus>) {
        let current = status.borrow_and_update().clone();
        self.observe(&current).await;

        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            self.observe(&current).await;
        }
        tracing::debug!("Session status closed, gate stopped");
    }
}
