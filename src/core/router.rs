//! Outbound message routing with a single writer per socket.
//!
//! Every socket gets exactly one writer task draining an unbounded channel, so
//! control messages and audio frames never interleave mid-frame. The router also
//! tracks whether the transport is actually writable, which can lag behind (or
//! run ahead of) the cached [`ConnectionState`](super::connection::ConnectionState).

use bytes::Bytes;
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::AgentResult;

/// A frame queued for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    /// Close the socket with an optional code and reason. Always the last frame written.
    Close(Option<(u16, String)>),
}

/// Result of handing a message to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for the writer on an open transport
    Sent,
    /// Held in the backlog until the transport opens
    Buffered,
    /// Transport not writable; the caller decides whether to queue or drop
    NotSent,
}

impl SendOutcome {
    pub fn is_sent(self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

struct RouterInner {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    open: AtomicBool,
    torn_down: AtomicBool,
    buffer_until_open: bool,
    backlog: Mutex<VecDeque<OutboundFrame>>,
}

/// Cloneable handle feeding one socket's writer task.
#[derive(Clone)]
pub struct OutboundRouter {
    inner: Arc<RouterInner>,
}

impl OutboundRouter {
    /// Create a router for a transport that is not open yet.
    ///
    /// With `buffer_until_open`, messages sent before [`mark_open`](Self::mark_open)
    /// are kept in arrival order and flushed on open; otherwise they return
    /// [`SendOutcome::NotSent`].
    pub fn new(buffer_until_open: bool) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Self {
            inner: Arc::new(RouterInner {
                tx,
                open: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                buffer_until_open,
                backlog: Mutex::new(VecDeque::new()),
            }),
        };
        (router, rx)
    }

    /// Whether the transport is currently writable.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Whether both handles feed the same writer.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().len()
    }

    pub fn send_text(&self, text: impl Into<String>) -> SendOutcome {
        self.route(OutboundFrame::Text(text.into()))
    }

    pub fn send_binary(&self, data: Bytes) -> SendOutcome {
        self.route(OutboundFrame::Binary(data))
    }

    /// Serialize and send a control message.
    pub fn send_control<T: Serialize>(&self, message: &T) -> AgentResult<SendOutcome> {
        let json = serde_json::to_string(message)?;
        Ok(self.send_text(json))
    }

    /// Mark the transport writable and flush the backlog in arrival order.
    pub fn mark_open(&self) {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return;
        }
        // Held across the flush so a concurrent send cannot overtake the backlog.
        let mut backlog = self.inner.backlog.lock();
        let flushed = backlog.len();
        while let Some(frame) = backlog.pop_front() {
            if self.inner.tx.send(frame).is_err() {
                backlog.clear();
                return;
            }
        }
        self.inner.open.store(true, Ordering::Release);
        if flushed > 0 {
            debug!(flushed, "Flushed buffered outbound messages");
        }
    }

    /// Mark the transport as no longer writable.
    pub fn mark_closed(&self) {
        self.inner.open.store(false, Ordering::Release);
    }

    /// Stop routing for good and drop anything still buffered.
    ///
    /// Returns how many buffered messages were discarded.
    pub fn teardown(&self) -> usize {
        self.inner.torn_down.store(true, Ordering::Release);
        self.mark_closed();
        let mut backlog = self.inner.backlog.lock();
        let dropped = backlog.len();
        backlog.clear();
        if dropped > 0 {
            debug!(dropped, "Discarded buffered outbound messages on teardown");
        }
        dropped
    }

    /// Queue a close frame behind everything already handed to the writer.
    pub fn close(&self, code: Option<(u16, String)>) {
        let _ = self.inner.tx.send(OutboundFrame::Close(code));
        self.teardown();
    }

    fn route(&self, frame: OutboundFrame) -> SendOutcome {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return SendOutcome::NotSent;
        }
        let mut backlog = self.inner.backlog.lock();
        if self.is_open() {
            drop(backlog);
            return match self.inner.tx.send(frame) {
                Ok(()) => SendOutcome::Sent,
                Err(_) => {
                    self.mark_closed();
                    SendOutcome::NotSent
                }
            };
        }
        if self.inner.buffer_until_open {
            backlog.push_back(frame);
            SendOutcome::Buffered
        } else {
            SendOutcome::NotSent
        }
    }
}

/// Drain `rx` into `sink`, converting frames with `convert`.
///
/// Data frames are only written while the router reports the transport open;
/// frames dequeued after close are discarded. A close frame is always attempted
/// and ends the writer.
pub async fn drive_writer<S, M>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    router: OutboundRouter,
    convert: fn(OutboundFrame) -> M,
) where
    S: Sink<M> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = rx.recv().await {
        let is_close = matches!(frame, OutboundFrame::Close(_));
        if !is_close && !router.is_open() {
            continue;
        }
        if let Err(e) = sink.send(convert(frame)).await {
            warn!("Failed to write outbound frame: {}", e);
            router.mark_closed();
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}
