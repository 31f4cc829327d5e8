//! Upstream messages held until a prerequisite is acknowledged.

use std::collections::VecDeque;
use std::fmt;

/// What a pending message waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    /// Upstream confirmed the initial session configuration
    SessionConfigured,
    /// Upstream acknowledged the conversation item with this id
    ItemAcknowledged(String),
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prerequisite::SessionConfigured => write!(f, "session configured"),
            Prerequisite::ItemAcknowledged(id) => write!(f, "item {id} acknowledged"),
        }
    }
}

/// Whether a prerequisite currently allows release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Send,
    Wait,
    /// Prerequisite can never be met (e.g. the item was rejected)
    Discard,
}

/// A translated upstream message waiting on a prerequisite.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOutboundItem {
    pub payload: String,
    pub depends_on: Prerequisite,
    /// Upstream event type, for logs
    pub kind: &'static str,
}

/// FIFO of pending messages.
///
/// Only the front is ever released, so a message never overtakes one queued
/// before it even when its own prerequisite is already met.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<PendingOutboundItem>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: PendingOutboundItem) {
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn front(&self) -> Option<&PendingOutboundItem> {
        self.items.front()
    }

    /// Item ids that queued messages are still waiting on.
    pub fn awaited_items(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(|item| match &item.depends_on {
            Prerequisite::ItemAcknowledged(id) => Some(id.as_str()),
            Prerequisite::SessionConfigured => None,
        })
    }

    /// Pop every message from the front whose prerequisite allows release.
    ///
    /// Discarded messages are dropped and logged; release stops at the first
    /// message that has to wait.
    pub fn release(&mut self, check: impl Fn(&Prerequisite) -> Release) -> Vec<String> {
        let mut released = Vec::new();
        while let Some(front) = self.items.front() {
            match check(&front.depends_on) {
                Release::Wait => break,
                Release::Send => {
                    if let Some(item) = self.items.pop_front() {
                        released.push(item.payload);
                    }
                }
                Release::Discard => {
                    if let Some(item) = self.items.pop_front() {
                        tracing::warn!(
                            kind = item.kind,
                            prerequisite = %item.depends_on,
                            "Dropping pending upstream message, prerequisite failed"
                        );
                    }
                }
            }
        }
        released
    }

    /// Drop everything. Returns how many messages were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
