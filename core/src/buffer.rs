//! Receive-side byte accumulator shared between the BLE delivery context and
//! the blocking stream adapter.
//!
//! Notifications arrive as small unframed chunks. The buffer only
//! concatenates them; framing and escaping belong to the protocol engine.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Inner {
    bytes: VecDeque<u8>,
    link_lost: bool,
}

/// FIFO of received bytes behind a single lock.
#[derive(Debug, Default)]
pub struct NotificationBuffer {
    inner: Mutex<Inner>,
}

impl NotificationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notification payload in arrival order.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.inner.lock().bytes.extend(data.iter().copied());
    }

    /// Remove up to `max` bytes from the front. Never blocks beyond the
    /// critical section; returns an empty vector when nothing is buffered.
    pub fn take_up_to(&self, max: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let n = max.min(inner.bytes.len());
        inner.bytes.drain(..n).collect()
    }

    /// Copy up to `out.len()` bytes into `out`, returning the count.
    pub fn take_into(&self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let n = out.len().min(inner.bytes.len());
        for (slot, byte) in out.iter_mut().zip(inner.bytes.drain(..n)) {
            *slot = byte;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all buffered bytes and reset the link-lost flag.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.bytes.clear();
        inner.link_lost = false;
    }

    pub fn mark_link_lost(&self) {
        self.inner.lock().link_lost = true;
    }

    pub fn link_lost(&self) -> bool {
        self.inner.lock().link_lost
    }
}

/// Write end of a [`NotificationBuffer`] handed to BLE backends.
///
/// Backends call [`deliver`](Self::deliver) from their notification handler
/// and [`link_lost`](Self::link_lost) from their disconnect handler.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    buffer: Arc<NotificationBuffer>,
}

impl NotificationSink {
    pub fn new(buffer: Arc<NotificationBuffer>) -> Self {
        Self { buffer }
    }

    pub fn deliver(&self, data: &[u8]) {
        self.buffer.append(data);
    }

    pub fn link_lost(&self) {
        self.buffer.mark_link_lost();
    }
}
