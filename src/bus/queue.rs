// 双优先级请求队列
// Priority lane: writes and verification reads. Normal lane: periodic polls.

use crate::types::{PendingRequest, RegisterRef, RequestKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Default)]
struct Lanes {
    priority: VecDeque<PendingRequest>,
    normal: VecDeque<PendingRequest>,
}

/// Request queue shared by every producer and drained by the dispatcher.
///
/// The lock covers only the container mutation, never a wire call.
#[derive(Default)]
pub struct RequestQueue {
    lanes: Mutex<Lanes>,
    available: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a normal-priority read (polling)
    pub fn enqueue_read(&self, register: RegisterRef, tag: impl Into<String>) {
        self.push(PendingRequest {
            kind: RequestKind::Read,
            register,
            value: 0,
            tag: tag.into(),
        });
    }

    /// Queue a read ahead of all polling traffic
    pub fn enqueue_priority_read(&self, register: RegisterRef, tag: impl Into<String>) {
        self.push(PendingRequest {
            kind: RequestKind::PriorityRead,
            register,
            value: 0,
            tag: tag.into(),
        });
    }

    pub fn enqueue_write(&self, register: RegisterRef, value: u16) {
        self.enqueue_tagged_write(register, value, String::new());
    }

    /// Queue a write whose completion event carries `tag`
    pub fn enqueue_tagged_write(&self, register: RegisterRef, value: u16, tag: impl Into<String>) {
        self.push(PendingRequest {
            kind: RequestKind::Write,
            register,
            value,
            tag: tag.into(),
        });
    }

    /// Queue a poll unless the same read is still waiting in the normal lane
    ///
    /// # Returns
    /// `false` if the read was coalesced with a pending one
    pub fn enqueue_poll(&self, register: RegisterRef, tag: &str) -> bool {
        {
            let mut lanes = self.lanes.lock();
            if lanes.normal.iter().any(|r| r.register == register && r.tag == tag) {
                return false;
            }
            lanes.normal.push_back(PendingRequest {
                kind: RequestKind::Read,
                register,
                value: 0,
                tag: tag.to_string(),
            });
        }
        self.available.notify_one();
        true
    }

    fn push(&self, request: PendingRequest) {
        {
            let mut lanes = self.lanes.lock();
            if request.is_priority() {
                lanes.priority.push_back(request);
            } else {
                lanes.normal.push_back(request);
            }
        }
        self.available.notify_one();
    }

    /// Next request, priority lane first
    pub fn dequeue(&self) -> Option<PendingRequest> {
        let mut lanes = self.lanes.lock();
        lanes.priority.pop_front().or_else(|| lanes.normal.pop_front())
    }

    pub fn has_requests(&self) -> bool {
        let lanes = self.lanes.lock();
        !lanes.priority.is_empty() || !lanes.normal.is_empty()
    }

    /// Drop both lanes at once, returning how many requests were discarded
    pub fn clear(&self) -> usize {
        let mut lanes = self.lanes.lock();
        let dropped = lanes.priority.len() + lanes.normal.len();
        lanes.priority.clear();
        lanes.normal.clear();
        dropped
    }

    pub fn size(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.priority.len() + lanes.normal.len()
    }

    /// Resolves once a request has been enqueued since the last wake-up
    pub async fn wait_available(&self) {
        self.available.notified().await;
    }
}
