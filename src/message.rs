//! Decoded chat messages and their delivery queue.

use crate::error::{ChatError, Result};
use std::fmt;

/// Initial slot count once the queue first grows.
const MIN_SLOTS: usize = 16;

/// A decoded chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    author: String,
    body: String,
}

impl Message {
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            body: body.into(),
        }
    }

    /// Display name of the sender.
    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_parts(self) -> (String, String) {
        (self.author, self.body)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.author, self.body)
    }
}

/// FIFO of messages awaiting the hosting application.
///
/// Slots form a ring addressed by the monotonically increasing counters
/// `start` and `end` modulo the slot count. A push into a full ring moves the
/// contents into a larger ring, oldest first.
#[derive(Debug, Default)]
pub struct MessageQueue {
    slots: Vec<Option<Message>>,
    start: usize,
    end: usize,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, message: Message) -> Result<()> {
        if self.len() == self.slots.len() {
            self.grow()?;
        }
        let capacity = self.slots.len();
        self.slots[self.end % capacity] = Some(message);
        self.end += 1;
        Ok(())
    }

    /// Take the oldest message, or `None` when empty.
    pub fn pop(&mut self) -> Option<Message> {
        if self.is_empty() {
            return None;
        }
        let capacity = self.slots.len();
        let message = self.slots[self.start % capacity].take();
        self.start += 1;
        if self.is_empty() {
            self.start = 0;
            self.end = 0;
        }
        message
    }

    fn grow(&mut self) -> Result<()> {
        let old_capacity = self.slots.len();
        let new_capacity = (old_capacity * 2).max(MIN_SLOTS);

        let mut slots: Vec<Option<Message>> = Vec::new();
        slots
            .try_reserve_exact(new_capacity)
            .map_err(|_| ChatError::Resource(new_capacity * std::mem::size_of::<Option<Message>>()))?;

        for i in self.start..self.end {
            slots.push(self.slots[i % old_capacity].take());
        }
        slots.resize_with(new_capacity, || None);

        self.end = self.len();
        self.start = 0;
        self.slots = slots;
        Ok(())
    }
}
