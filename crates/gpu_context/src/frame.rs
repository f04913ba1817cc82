use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use batch::{Batch, BufferUpdates};
use gpu_types::{Framebuffer, MAT4_IDENTITY, Mat4, StereoState};
use paging::Update;

use crate::PooledBatch;

pub type FramebufferRecycler = Box<dyn Fn(Arc<Framebuffer>) + Send + Sync>;

/// Updates of frames dropped before they were consumed, keyed by frame index.
///
/// A dropped frame may be newer than frames still in flight, so its updates
/// wait here until a later frame is consumed.
#[derive(Default)]
pub(crate) struct UpdateBacklog {
    frames: Mutex<BTreeMap<u64, Vec<Update>>>,
}

impl UpdateBacklog {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Vec<Update>>> {
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn defer(&self, frame_index: u64, updates: Vec<Update>) {
        self.lock().insert(frame_index, updates);
    }

    /// Applies the updates of every dropped frame older than `frame_index`.
    pub(crate) fn apply_before(&self, frame_index: u64) {
        let ready = {
            let mut frames = self.lock();
            let newer = frames.split_off(&frame_index);
            std::mem::replace(&mut *frames, newer)
        };
        apply_in_order(ready);
    }

    pub(crate) fn apply_all(&self) {
        let ready = std::mem::take(&mut *self.lock());
        apply_in_order(ready);
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.lock().len()
    }
}

fn apply_in_order(frames: BTreeMap<u64, Vec<Update>>) {
    for (frame_index, updates) in frames {
        log::trace!(
            "applying {} updates of dropped frame #{frame_index}",
            updates.len()
        );
        for update in &updates {
            // a flush on the render thread may already have covered it
            if update.sequence() <= update.buffer().apply_update_count() {
                log::debug!(
                    "skipping superseded update #{} of dropped frame #{frame_index}",
                    update.sequence()
                );
                continue;
            }
            update.apply();
        }
    }
}

/// One render cycle's worth of recorded batches, frozen at `end_frame`.
///
/// The buffer updates gathered at freeze time must reach the render shadows
/// exactly once and in frame order, whether or not the frame is executed.
/// [`Frame::consume_updates`] does that. Dropping a frame that was never
/// consumed parks its updates in the owning context, and the next consumed
/// frame (or [`crate::Context::consume_dropped_frame_updates`]) applies them
/// first.
pub struct Frame {
    pub view: Mat4,
    pub pose: Mat4,
    pub frame_index: u64,
    pub stereo_state: StereoState,
    pub framebuffer: Option<Arc<Framebuffer>>,
    pub framebuffer_recycler: Option<FramebufferRecycler>,
    batches: Vec<PooledBatch>,
    buffer_updates: Mutex<Vec<Update>>,
    backlog: Option<Arc<UpdateBacklog>>,
}

impl Frame {
    pub(crate) fn new(
        view: Mat4,
        pose: Mat4,
        frame_index: u64,
        backlog: Option<Arc<UpdateBacklog>>,
    ) -> Self {
        Self {
            view,
            pose,
            frame_index,
            stereo_state: StereoState::default(),
            framebuffer: None,
            framebuffer_recycler: None,
            batches: Vec::new(),
            buffer_updates: Mutex::new(Vec::new()),
            backlog,
        }
    }

    pub(crate) fn push_batch(&mut self, batch: PooledBatch) {
        self.batches.push(batch);
    }

    /// Runs every batch's named calls and snapshots the buffers they touch,
    /// one update per buffer across the whole frame.
    pub(crate) fn finish(&mut self) {
        let mut updates = BufferUpdates::new();
        for batch in &mut self.batches {
            batch.finish_frame(&mut updates);
        }
        log::trace!(
            "frame #{} finished with {} batches and {} buffer updates",
            self.frame_index,
            self.batches.len(),
            updates.len()
        );
        *self
            .buffer_updates
            .get_mut()
            .expect("frame update list poisoned") = updates.into_updates();
    }

    pub fn batches(&self) -> impl ExactSizeIterator<Item = &Batch> {
        self.batches.iter().map(|batch| &**batch)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn pending_update_count(&self) -> usize {
        self.buffer_updates
            .lock()
            .expect("frame update list poisoned")
            .len()
    }

    /// Applies the frame's buffer updates to their render shadows, after those
    /// of any older frame that was dropped unconsumed. Later calls are no-ops.
    pub fn consume_updates(&self) {
        let updates =
            std::mem::take(&mut *self.buffer_updates.lock().expect("frame update list poisoned"));
        if let Some(backlog) = &self.backlog {
            backlog.apply_before(self.frame_index);
        }
        for update in &updates {
            update.apply();
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new(MAT4_IDENTITY, MAT4_IDENTITY, 0, None)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let pending = match self.buffer_updates.get_mut() {
            Ok(updates) => std::mem::take(updates),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        if !pending.is_empty() {
            match &self.backlog {
                Some(backlog) => {
                    log::debug!(
                        "frame #{} dropped with {} unconsumed buffer updates, deferring them",
                        self.frame_index,
                        pending.len()
                    );
                    backlog.defer(self.frame_index, pending);
                }
                None => log::warn!(
                    "frame #{} dropped with {} unconsumed buffer updates and no context to defer them to",
                    self.frame_index,
                    pending.len()
                ),
            }
        }
        if let (Some(recycler), Some(framebuffer)) =
            (self.framebuffer_recycler.take(), self.framebuffer.take())
        {
            recycler(framebuffer);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_index", &self.frame_index)
            .field("stereo_state", &self.stereo_state)
            .field("framebuffer", &self.framebuffer)
            .field("batches", &self.batches.len())
            .field("has_recycler", &self.framebuffer_recycler.is_some())
            .finish()
    }
}
