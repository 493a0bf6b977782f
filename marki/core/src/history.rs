//! Guest History Persistence
//!
//! Guest conversations live only on the client. A [`GuestHistory`] strategy
//! decides whether they survive a restart: [`NoHistory`] forgets everything,
//! [`FileHistory`] keeps the message list in a JSON file.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::Message;

/// File name used under the data directory
const HISTORY_FILE_NAME: &str = "guest_history.json";

/// Guest history could not be read or written
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Filesystem error
    #[error("guest history I/O error at {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// File content is not a message list
    #[error("guest history is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Where guest messages are kept between sessions
#[async_trait]
pub trait GuestHistory: Send + Sync {
    /// Stored messages, oldest first
    async fn load(&self) -> Result<Vec<Message>, HistoryError>;

    /// Replace the stored messages
    async fn save(&self, messages: &[Message]) -> Result<(), HistoryError>;

    /// Forget everything
    async fn clear(&self) -> Result<(), HistoryError>;
}

/// Keeps nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHistory;

#[async_trait]
impl GuestHistory for NoHistory {
    async fn load(&self) -> Result<Vec<Message>, HistoryError> {
        Ok(Vec::new())
    }

    async fn save(&self, _messages: &[Message]) -> Result<(), HistoryError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Keeps the guest conversation in a JSON file
#[derive(Clone, Debug)]
pub struct FileHistory {
    path: PathBuf,
}

impl FileHistory {
    /// Store history at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location under the user's data directory
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("marki").join(HISTORY_FILE_NAME))
    }

    /// File this history writes to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl GuestHistory for FileHistory {
    async fn load(&self) -> Result<Vec<Message>, HistoryError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        let messages: Vec<Message> = serde_json::from_slice(&content)?;
        tracing::debug!(path = %self.path.display(), count = messages.len(), "Loaded guest history");
        Ok(messages)
    }

    async fn save(&self, messages: &[Message]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let content = serde_json::to_vec_pretty(messages)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        tracing::debug!(path = %self.path.display(), count = messages.len(), "Saved guest history");
        Ok(())
    }

    async fn clear(&self) -> Result<(), HistoryError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
