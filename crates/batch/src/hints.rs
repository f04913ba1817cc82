use std::sync::atomic::{AtomicUsize, Ordering};

pub const BATCH_PREALLOCATE_MIN: usize = 128;

/// High-water marks of batch vector lengths, shared by every batch that is
/// handed the same hints. New batches reserve this much up front.
#[derive(Debug)]
pub struct BatchAllocHints {
    commands: AtomicUsize,
    params: AtomicUsize,
    data: AtomicUsize,
    objects: AtomicUsize,
    draw_call_infos: AtomicUsize,
}

/// Snapshot of [`BatchAllocHints`] used when reserving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCapacities {
    pub commands: usize,
    pub params: usize,
    pub data: usize,
    pub objects: usize,
    pub draw_call_infos: usize,
}

impl BatchAllocHints {
    pub fn new() -> Self {
        Self::with_minimum(BATCH_PREALLOCATE_MIN)
    }

    pub fn with_minimum(minimum: usize) -> Self {
        Self {
            commands: AtomicUsize::new(minimum),
            params: AtomicUsize::new(minimum),
            data: AtomicUsize::new(minimum),
            objects: AtomicUsize::new(minimum),
            draw_call_infos: AtomicUsize::new(minimum),
        }
    }

    pub fn capacities(&self) -> BatchCapacities {
        BatchCapacities {
            commands: self.commands.load(Ordering::Relaxed),
            params: self.params.load(Ordering::Relaxed),
            data: self.data.load(Ordering::Relaxed),
            objects: self.objects.load(Ordering::Relaxed),
            draw_call_infos: self.draw_call_infos.load(Ordering::Relaxed),
        }
    }

    pub fn record(&self, used: BatchCapacities) {
        self.commands.fetch_max(used.commands, Ordering::Relaxed);
        self.params.fetch_max(used.params, Ordering::Relaxed);
        self.data.fetch_max(used.data, Ordering::Relaxed);
        self.objects.fetch_max(used.objects, Ordering::Relaxed);
        self.draw_call_infos
            .fetch_max(used.draw_call_infos, Ordering::Relaxed);
    }
}

impl Default for BatchAllocHints {
    fn default() -> Self {
        Self::new()
    }
}
