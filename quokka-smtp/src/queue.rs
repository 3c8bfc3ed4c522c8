//! Accepted-message queue.

use crate::error::SmtpResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Provider name of [`InMemoryQueue`] in configuration.
pub const INMEMORY_PROVIDER: &str = "inmemory";

/// A message accepted at the end of DATA, with its envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Time-ordered queue identifier.
    pub id: Uuid,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    /// Message content with dot-stuffing removed, lines CRLF-terminated.
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub peer: Option<SocketAddr>,
    /// Username of the authenticated client, if any.
    pub authenticated_as: Option<String>,
}

impl Envelope {
    pub fn new(mail_from: impl Into<String>, rcpt_to: Vec<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::now_v7(),
            mail_from: mail_from.into(),
            rcpt_to,
            data,
            received_at: Utc::now(),
            peer: None,
            authenticated_as: None,
        }
    }
}

/// Destination for accepted messages.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Takes ownership of an accepted message. An error makes the session
    /// answer 451 and the client keeps responsibility for the message.
    async fn enqueue(&self, envelope: Envelope) -> SmtpResult<()>;
}

/// FIFO queue held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    messages: Mutex<VecDeque<Envelope>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }

    /// Removes and returns the oldest message.
    pub async fn pop(&self) -> Option<Envelope> {
        self.messages.lock().await.pop_front()
    }

    /// Removes and returns all messages, oldest first.
    pub async fn drain(&self) -> Vec<Envelope> {
        self.messages.lock().await.drain(..).collect()
    }

    /// Copies all messages without removing them.
    pub async fn snapshot(&self) -> Vec<Envelope> {
        self.messages.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn enqueue(&self, envelope: Envelope) -> SmtpResult<()> {
        self.messages.lock().await.push_back(envelope);
        Ok(())
    }
}
