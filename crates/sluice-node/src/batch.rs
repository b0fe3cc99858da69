use std::collections::VecDeque;

use crate::config::{DEFAULT_ADD_BATCH_BYTES, DEFAULT_ADD_BATCH_SIZE};
use crate::sink::PoolItem;
use crate::state::DeliveryId;

/// Size limits of one admission sink call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_ADD_BATCH_SIZE,
            max_bytes: DEFAULT_ADD_BATCH_BYTES,
        }
    }
}

/// Item waiting for validation, tagged with the delivery it answers.
#[derive(Debug)]
pub struct PendingItem<I> {
    pub delivery: DeliveryId,
    pub index: usize,
    pub item: I,
}

/// Per-peer FIFO of items awaiting the admission sink.
#[derive(Debug)]
pub struct ValidationQueue<I> {
    queue: VecDeque<PendingItem<I>>,
}

impl<I> Default for ValidationQueue<I> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<I: PoolItem> ValidationQueue<I> {
    /// Appends an item behind everything already queued.
    pub fn enqueue(&mut self, pending: PendingItem<I>) {
        self.queue.push_back(pending);
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains the next sub-batch within `limits`.
    pub fn drain_next_batch(&mut self, limits: BatchLimits) -> Vec<PendingItem<I>> {
        next_sub_batch(&mut self.queue, limits)
    }

    /// Empties the queue, e.g. when its peer disconnects.
    pub fn drain_all(&mut self) -> Vec<PendingItem<I>> {
        self.queue.drain(..).collect()
    }
}

/// Pops a sub-batch off the front of `queue`.
///
/// The first item is always taken, so an item larger than `max_bytes` still
/// makes progress as a batch of one.
pub fn next_sub_batch<I: PoolItem>(
    queue: &mut VecDeque<PendingItem<I>>,
    limits: BatchLimits,
) -> Vec<PendingItem<I>> {
    let mut buf = Vec::new();
    let mut size = 0usize;

    while let Some(next) = queue.front() {
        let item_size = next.item.size();
        if !buf.is_empty()
            && (buf.len() >= limits.max_items || size + item_size > limits.max_bytes)
        {
            break;
        }
        if let Some(pending) = queue.pop_front() {
            size += item_size;
            buf.push(pending);
        }
    }
    buf
}
