//! Storage traits consumed by the runtime.
//!
//! The runtime uses two storage abstractions:
//!
//! - [`Storage`] - Keyed JSON documents with per-key transactional update
//!   (persisted permission approvals live here)
//! - [`MessageStore`] - Message and part records per session
//!
//! # Built-in Implementation
//!
//! [`InMemoryStore`] implements both traits and is suitable for testing and
//! single-process deployments. For durability, implement the traits over
//! your storage engine.

use crate::message::Message;
use crate::types::SessionId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Transform applied inside [`Storage::update`].
pub type UpdateFn = Box<dyn FnOnce(Option<Value>) -> Value + Send>;

/// Keyed document storage.
///
/// Keys are paths such as `["permission_approval", "<project_id>"]`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the document at `key`, if any.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn read(&self, key: &[&str]) -> Result<Option<Value>>;

    /// Write (create or replace) the document at `key`.
    ///
    /// # Errors
    /// Returns an error if the document cannot be stored.
    async fn write(&self, key: &[&str], value: Value) -> Result<()>;

    /// Atomically read-modify-write the document at `key`, returning the
    /// stored value.
    ///
    /// # Errors
    /// Returns an error if the transaction cannot be completed.
    async fn update(&self, key: &[&str], update: UpdateFn) -> Result<Value>;

    /// Remove the document at `key`.
    ///
    /// # Errors
    /// Returns an error if the document cannot be removed.
    async fn delete(&self, key: &[&str]) -> Result<()>;
}

/// Trait for storing and retrieving session messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert the message, or replace the stored copy with the same id.
    ///
    /// # Errors
    /// Returns an error if the message cannot be stored.
    async fn save_message(&self, message: &Message) -> Result<()>;

    /// All messages of a session in creation order.
    ///
    /// # Errors
    /// Returns an error if the history cannot be retrieved.
    async fn history(&self, session_id: &SessionId) -> Result<Vec<Message>>;

    /// Replace the entire history of a session (used by compaction).
    ///
    /// # Errors
    /// Returns an error if the history cannot be replaced.
    async fn replace_history(&self, session_id: &SessionId, messages: Vec<Message>) -> Result<()>;

    /// Get the message count for a session
    ///
    /// # Errors
    /// Returns an error if the count cannot be retrieved.
    async fn count(&self, session_id: &SessionId) -> Result<usize> {
        Ok(self.history(session_id).await?.len())
    }
}

/// In-memory implementation of [`Storage`] and [`MessageStore`].
#[derive(Default)]
pub struct InMemoryStore {
    documents: RwLock<HashMap<String, Value>>,
    messages: RwLock<HashMap<SessionId, Vec<Message>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn path(key: &[&str]) -> String {
        key.join("/")
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn read(&self, key: &[&str]) -> Result<Option<Value>> {
        let documents = self.documents.read().ok().context("lock poisoned")?;
        Ok(documents.get(&Self::path(key)).cloned())
    }

    async fn write(&self, key: &[&str], value: Value) -> Result<()> {
        self.documents
            .write()
            .ok()
            .context("lock poisoned")?
            .insert(Self::path(key), value);
        Ok(())
    }

    async fn update(&self, key: &[&str], update: UpdateFn) -> Result<Value> {
        let mut documents = self.documents.write().ok().context("lock poisoned")?;
        let path = Self::path(key);
        let next = update(documents.remove(&path));
        documents.insert(path, next.clone());
        Ok(next)
    }

    async fn delete(&self, key: &[&str]) -> Result<()> {
        self.documents
            .write()
            .ok()
            .context("lock poisoned")?
            .remove(&Self::path(key));
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn save_message(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write().ok().context("lock poisoned")?;
        let history = messages.entry(message.session_id.clone()).or_default();
        match history.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => history.push(message.clone()),
        }
        Ok(())
    }

    async fn history(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let messages = self.messages.read().ok().context("lock poisoned")?;
        Ok(messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn replace_history(&self, session_id: &SessionId, messages: Vec<Message>) -> Result<()> {
        self.messages
            .write()
            .ok()
            .context("lock poisoned")?
            .insert(session_id.clone(), messages);
        Ok(())
    }
}
