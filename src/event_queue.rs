//! Per-circuit queue for messages delivered over the structured fallback channel. The transport
//!  only fills the queue; the side channel (an HTTP long poll in practice) drains it.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::structured::{StructuredMessage, StructuredValue};

#[derive(Clone, Debug, PartialEq)]
pub struct QueuedEvent {
    pub message: &'static str,
    pub body: StructuredValue,
}

/// Events handed out by a single drain call, numbered so that the side channel can tell its
///  peer which batch it is looking at
#[derive(Clone, Debug, PartialEq)]
pub struct EventBatch {
    pub id: u32,
    pub events: Vec<QueuedEvent>,
}

impl EventBatch {
    pub fn to_structured(&self) -> StructuredValue {
        let events = self.events.iter()
            .map(|e| StructuredValue::map()
                .with("message", e.message.into())
                .with("body", e.body.clone())
                .build())
            .collect();

        StructuredValue::map()
            .with("events", StructuredValue::Array(events))
            .with("id", StructuredValue::Integer(self.id as i32))
            .build()
    }
}

struct EventQueueInner {
    events: VecDeque<QueuedEvent>,
    next_batch_id: u32,
}

pub struct EventQueue {
    max_len: usize,
    inner: Mutex<EventQueueInner>,
    notify: Notify,
}

impl EventQueue {
    pub fn new(max_len: usize) -> EventQueue {
        EventQueue {
            max_len,
            inner: Mutex::new(EventQueueInner {
                events: VecDeque::new(),
                next_batch_id: 1,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue<M: StructuredMessage>(&self, msg: &M) {
        self.push(QueuedEvent {
            message: msg.event_name(),
            body: msg.to_structured(),
        });
    }

    /// If the queue is full, the oldest event is dropped to make room
    pub fn push(&self, event: QueuedEvent) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.events.len() >= self.max_len {
                if let Some(dropped) = inner.events.pop_front() {
                    warn!("event queue overflow: dropping {} event", dropped.message);
                }
            }
            trace!("queueing {} event", event.message);
            inner.events.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes all queued events, returning `None` if there are none
    pub fn drain(&self) -> Option<EventBatch> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.events.is_empty() {
            return None;
        }

        let id = inner.next_batch_id;
        inner.next_batch_id = inner.next_batch_id.wrapping_add(1);
        Some(EventBatch {
            id,
            events: inner.events.drain(..).collect(),
        })
    }

    /// Waits until at least one event is queued and takes all queued events
    pub async fn next_batch(&self) -> EventBatch {
        loop {
            if let Some(batch) = self.drain() {
                return batch;
            }
            self.notify.notified().await;
        }
    }
}
