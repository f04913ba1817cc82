use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use batch::{Batch, BatchAllocHints};
use gpu_types::{Framebuffer, Mat4, Query, Shader, StereoState, TextureFormat, Vec4i};
use image::RgbaImage;

use crate::frame::UpdateBacklog;
use crate::{Backend, BackendError, BatchPool, ContextStats, Frame, PooledBatch};

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Capacity high-water marks shared by every batch the context hands out.
    pub alloc_hints: Arc<BatchAllocHints>,
    /// Batches allocated up front into the pool.
    pub pooled_batches: usize,
    /// Slots in a frame hand-off ring built by [`Context::frame_channel`].
    pub frame_channel_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            alloc_hints: Arc::new(BatchAllocHints::default()),
            pooled_batches: 0,
            frame_channel_capacity: 3,
        }
    }
}

type SyncCallback = Box<dyn FnOnce() + Send>;

struct ProgramsToSync {
    programs: Vec<Arc<Shader>>,
    callback: SyncCallback,
    rate: usize,
}

#[derive(Default)]
struct ProgramSyncQueue {
    pending: VecDeque<ProgramsToSync>,
    next_index: usize,
    synced: Vec<Arc<Shader>>,
}

/// Owns the backend and sequences frames.
///
/// Recording (`begin_frame` .. `end_frame`) and execution (`execute_frame`)
/// are meant to run on different threads; every method takes `&self`.
///
/// While a frame or immediate batch executes, the backend is checked out of
/// the context. Code it runs (batch lambdas) may call back into the context,
/// but sees no backend until execution returns.
pub struct Context {
    config: ContextConfig,
    backend: Mutex<Option<Box<dyn Backend>>>,
    backend_generation: AtomicU64,
    recording: Mutex<Option<Frame>>,
    frame_counter: AtomicU64,
    stereo: Mutex<StereoState>,
    pool: Arc<BatchPool>,
    programs: Mutex<ProgramSyncQueue>,
    frame_stats: Mutex<ContextStats>,
    frame_timer: Arc<Query>,
    dropped_frames: Arc<UpdateBacklog>,
}

impl Context {
    pub fn new(backend: Box<dyn Backend>, config: ContextConfig) -> Self {
        log::debug!("gpu context created with backend {:?}", backend.version());
        Self::build(Some(backend), config)
    }

    /// A context with no backend; execution calls warn and do nothing until
    /// [`Context::replace_backend`] installs one.
    pub fn headless(config: ContextConfig) -> Self {
        Self::build(None, config)
    }

    fn build(backend: Option<Box<dyn Backend>>, config: ContextConfig) -> Self {
        let pool = Arc::new(BatchPool::with_pooled(
            Arc::clone(&config.alloc_hints),
            config.pooled_batches,
        ));
        Self {
            config,
            backend: Mutex::new(backend),
            backend_generation: AtomicU64::new(0),
            recording: Mutex::new(None),
            frame_counter: AtomicU64::new(0),
            stereo: Mutex::new(StereoState::default()),
            pool,
            programs: Mutex::new(ProgramSyncQueue::default()),
            frame_stats: Mutex::new(ContextStats::default()),
            frame_timer: Arc::new(Query::new("gpu::Context::Frame")),
            dropped_frames: Arc::new(UpdateBacklog::default()),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BatchPool> {
        &self.pool
    }

    fn backend(&self) -> MutexGuard<'_, Option<Box<dyn Backend>>> {
        self.backend.lock().expect("gpu context backend lock poisoned")
    }

    /// Takes the backend out of its slot for the duration of `f`.
    ///
    /// A backend installed or shut down while `f` runs wins; the checked-out
    /// one is then shut down instead of being put back.
    fn with_backend<R>(&self, f: impl FnOnce(&mut dyn Backend) -> R) -> Option<R> {
        let (mut backend, generation) = {
            let mut slot = self.backend();
            let backend = slot.take()?;
            (backend, self.backend_generation.load(Ordering::Acquire))
        };
        let result = f(backend.as_mut());

        let mut slot = self.backend();
        if slot.is_none() && self.backend_generation.load(Ordering::Acquire) == generation {
            *slot = Some(backend);
        } else {
            drop(slot);
            log::debug!(
                "backend {:?} was replaced during execution, shutting it down",
                backend.version()
            );
            backend.shutdown();
        }
        Some(result)
    }

    fn recording(&self) -> MutexGuard<'_, Option<Frame>> {
        self.recording
            .lock()
            .expect("gpu context frame lock poisoned")
    }

    fn stereo(&self) -> MutexGuard<'_, StereoState> {
        self.stereo.lock().expect("gpu context stereo lock poisoned")
    }

    // Frame recording

    pub fn begin_frame(&self, view: Mat4, pose: Mat4) {
        let mut recording = self.recording();
        if recording.is_some() {
            panic!("begin_frame called while a frame is already being recorded");
        }
        let frame_index = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        log::trace!("begin frame #{frame_index}");
        *recording = Some(Frame::new(
            view,
            pose,
            frame_index,
            Some(Arc::clone(&self.dropped_frames)),
        ));
    }

    pub fn is_frame_active(&self) -> bool {
        self.recording().is_some()
    }

    /// Adds a batch to the frame being recorded. Outside a frame the batch
    /// is dropped back into its pool.
    pub fn append_frame_batch(&self, batch: PooledBatch) {
        match self.recording().as_mut() {
            Some(frame) => frame.push_batch(batch),
            None => log::warn!(
                "batch {:?} appended outside of frame boundaries, dropping it",
                batch.name()
            ),
        }
    }

    /// Freezes the frame: captures the stereo state, runs named calls and
    /// collects the buffer updates of every appended batch.
    pub fn end_frame(&self) -> Frame {
        let mut frame = self
            .recording()
            .take()
            .unwrap_or_else(|| panic!("end_frame called without a matching begin_frame"));
        frame.stereo_state = *self.stereo();
        frame.finish();
        log::trace!("end frame #{}", frame.frame_index);
        frame
    }

    pub fn acquire_batch(&self, name: &str) -> PooledBatch {
        self.pool.acquire(name)
    }

    /// Acquires a batch, lets `f` record into it, and appends it to the
    /// current frame.
    pub fn record_batch(&self, name: &str, f: impl FnOnce(&mut Batch)) {
        let mut batch = self.acquire_batch(name);
        f(&mut *batch);
        self.append_frame_batch(batch);
    }

    // Frame execution

    pub fn consume_frame_updates(&self, frame: &Frame) {
        frame.consume_updates();
    }

    /// Applies the updates of every frame dropped without being consumed.
    /// Frames consumed later do this on their own; call it when no further
    /// frame will be executed.
    pub fn consume_dropped_frame_updates(&self) {
        self.dropped_frames.apply_all();
    }

    /// Dropped frames whose updates have not been applied yet.
    pub fn dropped_frame_count(&self) -> usize {
        self.dropped_frames.frame_count()
    }

    /// The query bracketing every executed frame.
    pub fn frame_timer(&self) -> &Arc<Query> {
        &self.frame_timer
    }

    pub fn execute_frame(&self, frame: &Frame) {
        self.consume_frame_updates(frame);

        let executed = self.with_backend(|backend| {
            let begin_stats = backend.stats();
            backend.set_stereo_state(&frame.stereo_state);

            self.render_immediate(backend, "Context::execute_frame::begin", |batch| {
                batch.push_profile_range("Frame");
                batch.begin_query(Arc::clone(&self.frame_timer));
            });
            backend.execute_frame(frame);
            self.render_immediate(backend, "Context::execute_frame::end", |batch| {
                batch.end_query(Arc::clone(&self.frame_timer));
                batch.get_query(Arc::clone(&self.frame_timer));
                batch.pop_profile_range();
            });

            ContextStats::eval_delta(&begin_stats, &backend.stats())
        });

        match executed {
            Some(delta) => {
                *self
                    .frame_stats
                    .lock()
                    .expect("gpu context stats lock poisoned") = delta;
            }
            None => log::warn!(
                "no backend installed, frame #{} not executed",
                frame.frame_index
            ),
        }
    }

    fn render_immediate(&self, backend: &mut dyn Backend, name: &str, f: impl FnOnce(&mut Batch)) {
        let mut batch = self.acquire_batch(name);
        f(&mut *batch);
        batch.flush();
        backend.render(&batch);
    }

    /// Runs a batch immediately, outside any frame. Buffers it references are
    /// flushed straight to their render shadows first. Render thread only.
    pub fn execute_batch(&self, batch: &mut Batch) {
        batch.flush();
        if self.with_backend(|backend| backend.render(batch)).is_none() {
            log::warn!("no backend installed, batch {:?} not executed", batch.name());
        }
    }

    pub fn execute_batch_with(&self, name: &str, f: impl FnOnce(&mut Batch)) {
        let mut batch = self.acquire_batch(name);
        f(&mut *batch);
        self.execute_batch(&mut *batch);
    }

    // Backend passthroughs

    pub fn backend_version(&self) -> Option<String> {
        self.backend()
            .as_deref()
            .map(|backend| backend.version().to_owned())
    }

    pub fn has_backend(&self) -> bool {
        self.backend().is_some()
    }

    /// Swaps the backend between frames and returns the previous one.
    /// Buffer render shadows live in the buffers and survive the swap.
    pub fn replace_backend(&self, backend: Box<dyn Backend>) -> Option<Box<dyn Backend>> {
        log::debug!("gpu context backend replaced with {:?}", backend.version());
        let mut slot = self.backend();
        self.backend_generation.fetch_add(1, Ordering::AcqRel);
        slot.replace(backend)
    }

    pub fn shutdown(&self) {
        let taken = {
            let mut slot = self.backend();
            self.backend_generation.fetch_add(1, Ordering::AcqRel);
            slot.take()
        };
        if let Some(mut backend) = taken {
            log::debug!("shutting down backend {:?}", backend.version());
            backend.shutdown();
        }
        self.pool.clear();
    }

    pub fn recycle(&self) {
        if let Some(backend) = self.backend().as_deref_mut() {
            backend.recycle();
        }
    }

    pub fn sync_cache(&self) {
        if let Some(backend) = self.backend().as_deref_mut() {
            backend.sync_cache();
        }
    }

    pub fn download_framebuffer(
        &self,
        framebuffer: &Arc<Framebuffer>,
        region: Vec4i,
    ) -> Result<RgbaImage, BackendError> {
        self.backend()
            .as_deref_mut()
            .ok_or(BackendError::NoBackend)?
            .download_framebuffer(framebuffer, region)
    }

    pub fn update_present_frame(&self, correction: &Mat4, primary: bool) {
        if let Some(backend) = self.backend().as_deref_mut() {
            backend.update_present_frame(correction, primary);
        }
    }

    pub fn supported_texture_format(&self, format: TextureFormat) -> bool {
        self.backend()
            .as_deref()
            .is_some_and(|backend| backend.supported_texture_format(format))
    }

    pub fn is_texture_management_sparse_enabled(&self) -> bool {
        self.backend()
            .as_deref()
            .is_some_and(|backend| backend.is_texture_management_sparse_enabled())
    }

    pub fn stats(&self) -> ContextStats {
        self.backend()
            .as_deref()
            .map(|backend| backend.stats())
            .unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        if let Some(backend) = self.backend().as_deref_mut() {
            backend.reset_stats();
        }
    }

    /// Stats delta of the last executed frame.
    pub fn frame_stats(&self) -> ContextStats {
        *self
            .frame_stats
            .lock()
            .expect("gpu context stats lock poisoned")
    }

    // Stereo

    pub fn enable_stereo(&self, enable: bool) {
        self.stereo().enable = enable;
    }

    pub fn is_stereo(&self) -> bool {
        self.stereo().is_stereo()
    }

    pub fn set_stereo_projections(&self, projections: [Mat4; 2]) {
        self.stereo().eye_projections = projections;
    }

    pub fn set_stereo_views(&self, views: [Mat4; 2]) {
        self.stereo().eye_views = views;
    }

    pub fn stereo_projections(&self) -> [Mat4; 2] {
        self.stereo().eye_projections
    }

    pub fn stereo_views(&self) -> [Mat4; 2] {
        self.stereo().eye_views
    }

    pub fn stereo_state(&self) -> StereoState {
        *self.stereo()
    }

    // Program sync

    /// Queues `programs` for backend compilation, `rate` per
    /// [`Context::process_programs_to_sync`] call (0 means all at once).
    /// `callback` runs once the whole list has been synced.
    pub fn push_programs_to_sync(
        &self,
        programs: Vec<Arc<Shader>>,
        callback: impl FnOnce() + Send + 'static,
        rate: usize,
    ) {
        let rate = if rate == 0 { programs.len() } else { rate };
        self.programs
            .lock()
            .expect("program sync queue lock poisoned")
            .pending
            .push_back(ProgramsToSync {
                programs,
                callback: Box::new(callback),
                rate,
            });
    }

    /// Syncs the next slice of the oldest queued program list.
    pub fn process_programs_to_sync(&self) {
        let finished = {
            let mut guard = self
                .programs
                .lock()
                .expect("program sync queue lock poisoned");
            let queue = &mut *guard;
            let Some(entry) = queue.pending.front() else {
                return;
            };

            let end = (queue.next_index + entry.rate).min(entry.programs.len());
            let slice = &entry.programs[queue.next_index..end];
            match self.backend().as_deref_mut() {
                Some(backend) => {
                    for program in slice {
                        backend.sync_program(program);
                    }
                }
                None => log::warn!("no backend installed, syncing {} programs skipped", slice.len()),
            }
            queue.synced.extend(slice.iter().cloned());
            queue.next_index = end;

            if queue.next_index >= entry.programs.len() {
                queue.next_index = 0;
                queue.pending.pop_front()
            } else {
                None
            }
        };

        if let Some(entry) = finished {
            log::debug!("synced {} programs", entry.programs.len());
            (entry.callback)();
        }
    }

    pub fn pending_program_lists(&self) -> usize {
        self.programs
            .lock()
            .expect("program sync queue lock poisoned")
            .pending
            .len()
    }

    pub fn synced_program_count(&self) -> usize {
        self.programs
            .lock()
            .expect("program sync queue lock poisoned")
            .synced
            .len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.pool.clear();
        if let Ok(queue) = self.programs.get_mut() {
            queue.synced.clear();
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("frames", &self.frame_counter.load(Ordering::Relaxed))
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
