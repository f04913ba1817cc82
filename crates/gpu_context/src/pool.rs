use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use batch::{Batch, BatchAllocHints};
use crossbeam_queue::SegQueue;

/// Lock-free free list of cleared batches.
///
/// Growth is unbounded: a batch that is never returned is simply not reused.
pub struct BatchPool {
    batches: SegQueue<Batch>,
    hints: Arc<BatchAllocHints>,
}

impl BatchPool {
    pub fn new(hints: Arc<BatchAllocHints>) -> Self {
        Self {
            batches: SegQueue::new(),
            hints,
        }
    }

    /// Pre-fills the pool with `count` batches sized from the hints.
    pub fn with_pooled(hints: Arc<BatchAllocHints>, count: usize) -> Self {
        let pool = Self::new(hints);
        for _ in 0..count {
            pool.batches
                .push(Batch::with_hints("", Arc::clone(&pool.hints)));
        }
        pool
    }

    pub fn hints(&self) -> &Arc<BatchAllocHints> {
        &self.hints
    }

    pub fn acquire(self: &Arc<Self>, name: &str) -> PooledBatch {
        let mut batch = match self.batches.pop() {
            Some(batch) => batch,
            None => {
                log::trace!("batch pool empty, allocating {name:?}");
                Batch::with_hints("", Arc::clone(&self.hints))
            }
        };
        batch.set_name(name);
        PooledBatch {
            batch: Some(batch),
            pool: Arc::clone(self),
        }
    }

    pub fn release(&self, mut batch: Batch) {
        batch.clear();
        self.batches.push(batch);
    }

    /// Number of idle batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Drops every idle batch.
    pub fn clear(&self) {
        while self.batches.pop().is_some() {}
    }
}

impl fmt::Debug for BatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchPool")
            .field("idle", &self.batches.len())
            .field("hints", &self.hints.capacities())
            .finish()
    }
}

/// A batch on loan from a [`BatchPool`]; goes back to the pool when dropped.
pub struct PooledBatch {
    batch: Option<Batch>,
    pool: Arc<BatchPool>,
}

impl PooledBatch {
    /// Detaches the batch from the pool for good.
    pub fn into_inner(mut self) -> Batch {
        self.batch
            .take()
            .expect("pooled batch already returned to its pool")
    }
}

impl Deref for PooledBatch {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        self.batch
            .as_ref()
            .expect("pooled batch already returned to its pool")
    }
}

impl DerefMut for PooledBatch {
    fn deref_mut(&mut self) -> &mut Batch {
        self.batch
            .as_mut()
            .expect("pooled batch already returned to its pool")
    }
}

impl Drop for PooledBatch {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            self.pool.release(batch);
        }
    }
}

impl fmt::Debug for PooledBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledBatch").field(&self.batch).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_types::Primitive;

    #[test]
    fn dropped_batches_come_back_cleared() {
        let pool = Arc::new(BatchPool::new(Arc::new(BatchAllocHints::default())));
        {
            let mut batch = pool.acquire("opaque");
            assert_eq!(batch.name(), "opaque");
            batch.draw(Primitive::Triangles, 3, 0);
        }
        assert_eq!(pool.len(), 1);

        let batch = pool.acquire("transparent");
        assert!(pool.is_empty());
        assert!(batch.is_empty());
        assert_eq!(batch.name(), "transparent");
    }

    #[test]
    fn detached_batches_bypass_the_pool() {
        let pool = Arc::new(BatchPool::with_pooled(
            Arc::new(BatchAllocHints::default()),
            2,
        ));
        let batch = pool.acquire("kept").into_inner();
        assert_eq!(batch.name(), "kept");
        assert_eq!(pool.len(), 1);
        pool.clear();
        assert!(pool.is_empty());
    }
}
