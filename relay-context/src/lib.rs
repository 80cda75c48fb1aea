//! Conversation threads that feed tool calls with context.
//!
//! Threads live in an arena. Messages are append-only and shared by `Arc`, and a
//! fork stores `(ancestor, prefix_len)` instead of copying, so forks share the
//! ancestor's prefix without ever seeing its later appends.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use relay_types::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type ThreadId = String;
pub type MessageId = String;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThreadError {
    #[error("thread {0} not found")]
    NotFound(ThreadId),
    #[error("message {message} not found in thread {thread}")]
    MessageNotFound { thread: ThreadId, message: MessageId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds.
    pub ts: u64,
    #[serde(default)]
    pub meta: Value,
}

/// Snapshot of a thread with its full, resolved message list.
#[derive(Clone, Debug, Serialize)]
pub struct ThreadView {
    pub id: ThreadId,
    pub parent_id: Option<ThreadId>,
    pub tags: Vec<String>,
    pub created_at: u64,
    pub messages: Vec<Arc<Message>>,
}

struct Node {
    parent_id: Option<ThreadId>,
    /// Ancestor thread and how many of its messages this thread inherits.
    base: Option<(ThreadId, usize)>,
    own: Vec<Arc<Message>>,
    tags: BTreeSet<String>,
    created_at: u64,
}

pub struct ThreadArena {
    nodes: HashMap<ThreadId, Node>,
    clock: Arc<dyn Clock>,
}

impl Default for ThreadArena {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ThreadArena {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes: HashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn create<I, S>(&mut self, tags: I) -> ThreadId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.nodes.insert(
            id.clone(),
            Node {
                parent_id: None,
                base: None,
                own: Vec::new(),
                tags: tags.into_iter().map(Into::into).collect(),
                created_at: self.clock.now_ms(),
            },
        );
        id
    }

    pub fn append(
        &mut self,
        thread: &str,
        role: Role,
        content: impl Into<String>,
        meta: Value,
    ) -> Result<MessageId, ThreadError> {
        let ts = self.clock.now_ms();
        let node = self.node_mut(thread)?;
        let id = uuid::Uuid::new_v4().to_string();
        node.own.push(Arc::new(Message {
            id: id.clone(),
            role,
            content: content.into(),
            ts,
            meta,
        }));
        Ok(id)
    }

    /// Resolved message list, oldest first.
    pub fn messages(&self, thread: &str) -> Result<Vec<Arc<Message>>, ThreadError> {
        self.collect(thread, usize::MAX)
    }

    /// New thread holding `thread`'s messages up to and including `message_id`.
    pub fn fork_from_message(&mut self, thread: &str, message_id: &str) -> Result<ThreadId, ThreadError> {
        let messages = self.messages(thread)?;
        let pos = messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| ThreadError::MessageNotFound {
                thread: thread.to_string(),
                message: message_id.to_string(),
            })?;
        let tags = self.node(thread)?.tags.clone();

        let id = uuid::Uuid::new_v4().to_string();
        self.nodes.insert(
            id.clone(),
            Node {
                parent_id: Some(thread.to_string()),
                base: Some((thread.to_string(), pos + 1)),
                own: Vec::new(),
                tags,
                created_at: self.clock.now_ms(),
            },
        );
        Ok(id)
    }

    pub fn get(&self, thread: &str) -> Result<ThreadView, ThreadError> {
        let node = self.node(thread)?;
        Ok(ThreadView {
            id: thread.to_string(),
            parent_id: node.parent_id.clone(),
            tags: node.tags.iter().cloned().collect(),
            created_at: node.created_at,
            messages: self.messages(thread)?,
        })
    }

    pub fn tag(&mut self, thread: &str, tag: impl Into<String>) -> Result<(), ThreadError> {
        self.node_mut(thread)?.tags.insert(tag.into());
        Ok(())
    }

    fn collect(&self, thread: &str, limit: usize) -> Result<Vec<Arc<Message>>, ThreadError> {
        let node = self.node(thread)?;
        let mut out = match &node.base {
            Some((ancestor, prefix)) => self.collect(ancestor, (*prefix).min(limit))?,
            None => Vec::new(),
        };
        let room = limit.saturating_sub(out.len());
        out.extend(node.own.iter().take(room).cloned());
        Ok(out)
    }

    fn node(&self, thread: &str) -> Result<&Node, ThreadError> {
        self.nodes
            .get(thread)
            .ok_or_else(|| ThreadError::NotFound(thread.to_string()))
    }

    fn node_mut(&mut self, thread: &str) -> Result<&mut Node, ThreadError> {
        self.nodes
            .get_mut(thread)
            .ok_or_else(|| ThreadError::NotFound(thread.to_string()))
    }
}
