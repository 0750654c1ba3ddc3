//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the manager with mock implementations.

use crate::db::{Database, DbError, Message, MessageRole};
use crate::state_machine::ConversationState;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Storage backend failure, flattened to text at the trait seam
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct StoreError(pub String);

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        Self(e.to_string())
    }
}

/// Storage for chat messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Messages ordered by creation
    async fn list_messages(&self, conv_id: &str) -> Result<Vec<Message>, StoreError>;
}

/// Storage for orchestration state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state; a conversation never seen before is initial
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError>;

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError>;

    async fn clear(&self, conv_id: &str) -> Result<(), StoreError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn append_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        (**self).append_message(conv_id, role, content).await
    }

    async fn list_messages(&self, conv_id: &str) -> Result<Vec<Message>, StoreError> {
        (**self).list_messages(conv_id).await
    }
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError> {
        (**self).load(conv_id).await
    }

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError> {
        (**self).save(conv_id, state).await
    }

    async fn clear(&self, conv_id: &str) -> Result<(), StoreError> {
        (**self).clear(conv_id).await
    }
}

// ============================================================================
// Production implementations
// ============================================================================

/// Database-backed storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for DatabaseStorage {
    async fn append_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        Ok(self.db.add_message(&msg_id, conv_id, role, content)?)
    }

    async fn list_messages(&self, conv_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self.db.get_messages(conv_id)?)
    }
}

#[async_trait]
impl StateStore for DatabaseStorage {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError> {
        Ok(self.db.load_state(conv_id)?.unwrap_or_default())
    }

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError> {
        Ok(self.db.save_state(conv_id, state)?)
    }

    async fn clear(&self, conv_id: &str) -> Result<(), StoreError> {
        Ok(self.db.clear_state(conv_id)?)
    }
}
