//! FIFO request queue feeding the connection worker

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

use super::cancel::CancelContext;
use crate::error::{ModbusError, ModbusResult};

/// Frame completeness predicate, evaluated on everything received so far
pub type Completeness = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// One queued request; resolved exactly once through `reply`
pub(crate) struct QueueItem {
    pub id: u64,
    pub request: Vec<u8>,
    pub is_complete: Completeness,
    pub cancel: CancelContext,
    pub reply: oneshot::Sender<ModbusResult<Vec<u8>>>,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<QueueItem>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct RequestQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    next_id: AtomicU64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request; fails once the queue is closed
    pub fn push(
        &self,
        request: Vec<u8>,
        is_complete: Completeness,
        cancel: CancelContext,
        reply: oneshot::Sender<ModbusResult<Vec<u8>>>,
    ) -> ModbusResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(ModbusError::Disposed);
            }
            inner.items.push_back(QueueItem {
                id,
                request,
                is_complete,
                cancel,
                reply,
            });
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Next request in enqueue order; suspends while the queue is empty
    pub async fn pop(&self) -> QueueItem {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.inner.lock().items.pop_front() {
                return item;
            }
            notified.await;
        }
    }

    /// Take a request out before the worker reaches it
    pub fn remove(&self, id: u64) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        let pos = inner.items.iter().position(|item| item.id == id)?;
        inner.items.remove(pos)
    }

    /// Refuse further pushes and hand back everything still queued
    pub fn close(&self) -> Vec<QueueItem> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }
}
