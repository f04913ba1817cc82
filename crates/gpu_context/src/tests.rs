use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use batch::{Batch, BatchCommand, Command, NamedBatchData};
use gpu_types::{
    Framebuffer, FramebufferMask, MAT4_IDENTITY, Primitive, Shader, StereoState, Vec4i,
};
use image::RgbaImage;
use paging::{Buffer, BufferUsage};
use proptest::prelude::*;

use crate::{
    Backend, BackendError, Context, ContextConfig, ContextStats, Frame, FrameChannelError,
    NullBackend, NullBackendCounters, create_frame_channel,
};

fn null_context() -> (Context, Arc<NullBackendCounters>) {
    let backend = NullBackend::new();
    let counters = backend.counters();
    (
        Context::new(Box::new(backend), ContextConfig::default()),
        counters,
    )
}

/// Keeps the command list of every batch it renders.
#[derive(Default)]
struct RecordingBackend {
    rendered: Arc<Mutex<Vec<Vec<Command>>>>,
}

impl Backend for RecordingBackend {
    fn version(&self) -> &str {
        "recording"
    }

    fn render(&mut self, batch: &Batch) {
        self.rendered
            .lock()
            .expect("rendered list")
            .push(batch.commands().to_vec());
    }

    fn download_framebuffer(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
        _region: Vec4i,
    ) -> Result<RgbaImage, BackendError> {
        Err(BackendError::FramebufferNotReadable(framebuffer.name.clone()))
    }

    fn set_stereo_state(&mut self, _stereo: &StereoState) {}

    fn stats(&self) -> ContextStats {
        ContextStats::default()
    }

    fn reset_stats(&mut self) {}
}

fn bind_and_draw(batch: &mut Batch, buffer: &Arc<Buffer>) {
    batch.set_input_buffer(0, Arc::clone(buffer), 0, 4);
    batch.draw(Primitive::Triangles, 3, 0);
}

fn emit_instanced(batch: &mut Batch, data: &mut NamedBatchData) {
    let instances = data.buffer(0);
    batch.set_input_buffer(1, instances, 0, 16);
    batch.draw_instanced(data.count() as u32, Primitive::Triangles, 36, 0, 0);
}

#[test]
fn buffers_shared_by_batches_produce_one_update_per_frame() {
    let (context, counters) = null_context();
    let buffer = Arc::new(Buffer::new(BufferUsage::VERTEX));

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    buffer.append_slice(&[1.0f32, 2.0, 3.0, 4.0]);
    context.record_batch("first", |batch| bind_and_draw(batch, &buffer));
    context.record_batch("second", |batch| bind_and_draw(batch, &buffer));
    let frame = context.end_frame();

    assert_eq!(frame.batch_count(), 2);
    assert_eq!(frame.pending_update_count(), 1);
    assert_eq!(buffer.render_size(), 0);

    context.execute_frame(&frame);
    assert_eq!(frame.pending_update_count(), 0);
    assert_eq!(buffer.render_size(), 16);
    assert_eq!(buffer.apply_update_count(), buffer.get_update_count());
    buffer.with_render_data(|data| {
        let floats: Vec<f32> = data
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(floats, [1.0, 2.0, 3.0, 4.0]);
    });

    assert_eq!(counters.frames(), 1);
    // begin and end immediate batches plus the two recorded ones
    assert_eq!(counters.batches(), 4);
    assert_eq!(counters.uploaded_pages(), 1);
    assert_eq!(context.frame_stats().drawcalls, 2);
    assert_eq!(context.frame_stats().input_buffer_changes, 2);
}

#[test]
fn frame_indices_increase_and_stereo_is_captured() {
    let (context, _) = null_context();
    context.enable_stereo(true);
    let mut projections = [MAT4_IDENTITY; 2];
    projections[1][0] = 2.0;
    context.set_stereo_projections(projections);

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    assert!(context.is_frame_active());
    let first = context.end_frame();
    assert!(!context.is_frame_active());
    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    let second = context.end_frame();

    assert_eq!(second.frame_index, first.frame_index + 1);
    assert!(first.stereo_state.is_stereo());
    assert_eq!(first.stereo_state.eye_projections[1][0], 2.0);
    assert_eq!(context.stereo_projections(), projections);
}

#[test]
#[should_panic(expected = "already being recorded")]
fn nested_begin_frame_panics() {
    let (context, _) = null_context();
    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
}

#[test]
#[should_panic(expected = "without a matching begin_frame")]
fn end_frame_without_begin_panics() {
    let (context, _) = null_context();
    let _ = context.end_frame();
}

#[test]
fn batch_appended_outside_a_frame_returns_to_the_pool() {
    let (context, _) = null_context();
    let mut batch = context.acquire_batch("stray");
    batch.draw(Primitive::Points, 1, 0);
    assert!(context.pool().is_empty());

    context.append_frame_batch(batch);
    assert_eq!(context.pool().len(), 1);
    assert!(context.acquire_batch("reused").is_empty());
}

#[test]
fn frame_batches_return_to_the_pool_when_the_frame_drops() {
    let (context, _) = null_context();
    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    context.record_batch("a", |batch| batch.draw(Primitive::Lines, 2, 0));
    context.record_batch("b", |batch| batch.draw(Primitive::Lines, 2, 0));
    let frame = context.end_frame();
    assert!(context.pool().is_empty());

    drop(frame);
    assert_eq!(context.pool().len(), 2);
}

#[test]
fn consuming_updates_twice_applies_them_once() {
    let (context, _) = null_context();
    let buffer = Arc::new(Buffer::new(BufferUsage::UNIFORM));

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    buffer.append(&[7u8; 8]);
    context.record_batch("uniforms", |batch| {
        batch.set_uniform_buffer(0, Arc::clone(&buffer), 0, 8);
    });
    let frame = context.end_frame();

    context.consume_frame_updates(&frame);
    context.consume_frame_updates(&frame);
    context.execute_frame(&frame);
    assert_eq!(buffer.apply_update_count(), 1);
    assert_eq!(buffer.render_size(), 8);
}

#[test]
fn dropping_an_unexecuted_frame_still_drains_its_updates() {
    let (context, _) = null_context();
    let buffer = Arc::new(Buffer::new(BufferUsage::VERTEX));

    for value in 1..=3u8 {
        context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
        buffer.append(&[value; 4]);
        context.record_batch("frame", |batch| bind_and_draw(batch, &buffer));
        let frame = context.end_frame();
        if value == 3 {
            context.execute_frame(&frame);
        }
    }

    assert_eq!(buffer.apply_update_count(), 3);
    assert_eq!(buffer.with_render_data(|data| data.to_vec()), buffer.get_data());
}

#[test]
fn a_frame_rejected_by_a_full_ring_defers_its_updates() {
    let (context, counters) = null_context();
    let buffer = Arc::new(Buffer::new(BufferUsage::VERTEX));
    let (mut submitter, mut receiver) = create_frame_channel(1);
    let record = |value: u8| {
        context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
        buffer.append(&[value; 4]);
        context.record_batch("frame", |batch| bind_and_draw(batch, &buffer));
        Arc::new(context.end_frame())
    };

    submitter.submit(record(1)).expect("ring has room");
    match submitter.submit(record(2)) {
        Err(FrameChannelError::Full(rejected)) => drop(rejected),
        other => panic!("expected a full ring, got {other:?}"),
    }
    assert_eq!(buffer.apply_update_count(), 0);
    assert_eq!(buffer.render_size(), 0);
    assert_eq!(context.dropped_frame_count(), 1);

    let first = receiver.take_latest(&context).expect("queued frame");
    context.execute_frame(&first);
    assert_eq!(buffer.apply_update_count(), 1);
    assert_eq!(buffer.render_size(), 4);
    assert_eq!(context.dropped_frame_count(), 1);

    submitter.submit(record(3)).expect("ring drained");
    let third = receiver.take_latest(&context).expect("queued frame");
    context.execute_frame(&third);
    assert_eq!(buffer.apply_update_count(), 3);
    assert_eq!(context.dropped_frame_count(), 0);
    assert_eq!(buffer.with_render_data(|data| data.to_vec()), buffer.get_data());
    assert_eq!(counters.frames(), 2);
}

#[test]
fn trailing_dropped_frames_apply_on_request() {
    let (context, _) = null_context();
    let buffer = Arc::new(Buffer::new(BufferUsage::VERTEX));
    for value in 1..=2u8 {
        context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
        buffer.append(&[value; 4]);
        context.record_batch("frame", |batch| bind_and_draw(batch, &buffer));
        drop(context.end_frame());
    }
    assert_eq!(context.dropped_frame_count(), 2);
    assert_eq!(buffer.apply_update_count(), 0);

    context.consume_dropped_frame_updates();
    assert_eq!(context.dropped_frame_count(), 0);
    assert_eq!(buffer.apply_update_count(), 2);
    assert_eq!(buffer.with_render_data(|data| data.to_vec()), [1, 1, 1, 1, 2, 2, 2, 2]);
}

#[test]
fn lambdas_can_call_back_into_the_context_while_it_executes() {
    let (context, counters) = null_context();
    let context = Arc::new(context);
    let calls = Arc::new(AtomicUsize::new(0));
    let saw_backend = Arc::new(AtomicBool::new(true));

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    {
        let inner = Arc::clone(&context);
        let calls = Arc::clone(&calls);
        let saw_backend = Arc::clone(&saw_backend);
        context.record_batch("callback", move |batch| {
            batch.run_lambda(move || {
                saw_backend.store(inner.has_backend(), Ordering::SeqCst);
                let _ = inner.stats();
                inner.recycle();
                inner.execute_batch_with("nested", |nested| nested.draw(Primitive::Points, 1, 0));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        });
    }
    let frame = context.end_frame();

    let (done_sender, done_receiver) = crossbeam_channel::bounded(1);
    let render = Arc::clone(&context);
    let worker = thread::spawn(move || {
        render.execute_frame(&frame);
        let _ = done_sender.send(());
    });
    done_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("execute_frame did not return");
    worker.join().expect("render thread panicked");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!saw_backend.load(Ordering::SeqCst));
    assert!(context.has_backend());
    assert_eq!(counters.frames(), 1);
    assert_eq!(counters.recycles(), 0);
}

#[test]
fn backend_replaced_during_execution_takes_over_afterwards() {
    let (context, old_counters) = null_context();
    let context = Arc::new(context);
    let replacement = NullBackend::new();
    let new_counters = replacement.counters();
    let pending: Arc<Mutex<Option<Box<dyn Backend>>>> =
        Arc::new(Mutex::new(Some(Box::new(replacement))));

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    {
        let inner = Arc::clone(&context);
        let pending = Arc::clone(&pending);
        context.record_batch("swap", move |batch| {
            batch.run_lambda(move || {
                if let Some(backend) = pending.lock().expect("pending backend").take() {
                    assert!(inner.replace_backend(backend).is_none());
                }
            });
        });
    }
    let frame = context.end_frame();
    context.execute_frame(&frame);
    assert_eq!(old_counters.frames(), 1);

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    let next = context.end_frame();
    context.execute_frame(&next);
    assert_eq!(old_counters.frames(), 1);
    assert_eq!(new_counters.frames(), 1);
}

#[test]
fn executed_frames_are_bracketed_by_the_frame_timer() {
    let backend = RecordingBackend::default();
    let rendered = Arc::clone(&backend.rendered);
    let context = Context::new(Box::new(backend), ContextConfig::default());

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    context.record_batch("scene", |batch| batch.draw(Primitive::Triangles, 3, 0));
    let frame = context.end_frame();
    context.execute_frame(&frame);

    let rendered = rendered.lock().expect("rendered list");
    assert_eq!(rendered.len(), 3);
    assert_eq!(rendered[0], [Command::PushProfileRange, Command::BeginQuery]);
    assert_eq!(rendered[1], [Command::Draw]);
    assert_eq!(
        rendered[2],
        [Command::EndQuery, Command::GetQuery, Command::PopProfileRange]
    );
    assert_eq!(context.frame_timer().name, "gpu::Context::Frame");
}

#[test]
fn named_calls_become_one_instanced_draw_at_end_frame() {
    let (context, _) = null_context();
    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    context.record_batch("instances", |batch| {
        for instance in 0..5u32 {
            let instances = batch.named_buffer("cubes", 0);
            instances.append_slice(&[instance as f32; 4]);
            batch.setup_named_calls("cubes", emit_instanced);
        }
    });
    let frame = context.end_frame();

    let batch = frame.batches().next().expect("one batch");
    let draws: Vec<u32> = batch
        .decoded_commands()
        .filter_map(|command| match command {
            BatchCommand::DrawInstanced { num_instances, .. } => Some(num_instances),
            _ => None,
        })
        .collect();
    assert_eq!(draws, [5]);
    assert_eq!(frame.pending_update_count(), 1);

    context.execute_frame(&frame);
    assert_eq!(context.frame_stats().drawcalls, 5);
}

#[test]
fn recycler_receives_the_framebuffer_on_drop() {
    let (context, _) = null_context();
    let recycled: Arc<Mutex<Vec<Arc<Framebuffer>>>> = Arc::new(Mutex::new(Vec::new()));
    let framebuffer = Arc::new(Framebuffer::new("swap", 8, 8, FramebufferMask::COLOR0));

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    let mut frame = context.end_frame();
    frame.framebuffer = Some(Arc::clone(&framebuffer));
    let sink = Arc::clone(&recycled);
    frame.framebuffer_recycler = Some(Box::new(move |framebuffer: Arc<Framebuffer>| {
        sink.lock().expect("recycled list").push(framebuffer);
    }));
    drop(frame);

    let recycled = recycled.lock().expect("recycled list");
    assert_eq!(recycled.len(), 1);
    assert!(Arc::ptr_eq(&recycled[0], &framebuffer));
}

#[test]
fn immediate_batches_flush_buffers_directly() {
    let (context, counters) = null_context();
    let buffer = Arc::new(Buffer::new(BufferUsage::INDEX));
    buffer.append_slice(&[0u16, 1, 2]);

    context.execute_batch_with("immediate", |batch| {
        batch.set_index_buffer(gpu_types::IndexType::Uint16, Arc::clone(&buffer), 0);
        batch.draw_indexed(Primitive::Triangles, 3, 0);
    });

    assert!(!buffer.is_dirty());
    assert_eq!(buffer.render_size(), 6);
    assert_eq!(counters.batches(), 1);
    assert_eq!(counters.frames(), 0);
}

#[test]
fn program_lists_sync_at_their_rate_then_call_back() {
    let (context, counters) = null_context();
    let programs: Vec<Arc<Shader>> = (0..5)
        .map(|id| Arc::new(Shader::new(id, format!("program {id}"))))
        .collect();
    let done = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&done);
    context.push_programs_to_sync(
        programs,
        move || {
            flag.fetch_add(1, Ordering::SeqCst);
        },
        2,
    );
    let second = Arc::clone(&done);
    context.push_programs_to_sync(
        vec![Arc::new(Shader::new(9, "late"))],
        move || {
            second.fetch_add(10, Ordering::SeqCst);
        },
        0,
    );

    context.process_programs_to_sync();
    context.process_programs_to_sync();
    assert_eq!(counters.synced_programs(), 4);
    assert_eq!(done.load(Ordering::SeqCst), 0);

    context.process_programs_to_sync();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(context.pending_program_lists(), 1);

    context.process_programs_to_sync();
    assert_eq!(done.load(Ordering::SeqCst), 11);
    assert_eq!(context.synced_program_count(), 6);

    context.process_programs_to_sync();
    assert_eq!(counters.synced_programs(), 6);
}

#[test]
fn headless_context_warns_until_a_backend_is_installed() {
    let context = Context::headless(ContextConfig::default());
    assert!(!context.has_backend());
    assert_eq!(context.backend_version(), None);

    context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
    let frame = context.end_frame();
    context.execute_frame(&frame);

    let framebuffer = Arc::new(Framebuffer::new("main", 4, 4, FramebufferMask::COLOR0));
    assert!(matches!(
        context.download_framebuffer(&framebuffer, [0, 0, 4, 4]),
        Err(BackendError::NoBackend)
    ));

    let backend = NullBackend::new();
    let counters = backend.counters();
    assert!(context.replace_backend(Box::new(backend)).is_none());
    assert_eq!(context.backend_version().as_deref(), Some("null"));
    context.execute_frame(&frame);
    assert_eq!(counters.frames(), 1);

    context.shutdown();
    assert!(!context.has_backend());
}

#[test]
fn frames_cross_threads_through_the_hand_off_ring() {
    const FRAMES: usize = 24;
    let (context, counters) = null_context();
    let context = Arc::new(context);
    let buffer = Arc::new(Buffer::new(BufferUsage::RESOURCE));
    let (mut submitter, mut receiver) = create_frame_channel(2);

    let producer = {
        let context = Arc::clone(&context);
        let buffer = Arc::clone(&buffer);
        thread::spawn(move || {
            for value in 0..FRAMES {
                context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
                buffer.append(&(value as u32).to_le_bytes());
                context.record_batch("resources", |batch| {
                    batch.set_resource_buffer(0, Arc::clone(&buffer));
                    batch.draw(Primitive::Points, 1, 0);
                });
                let mut frame = Arc::new(context.end_frame());
                loop {
                    match submitter.submit(frame) {
                        Ok(()) => break,
                        Err(FrameChannelError::Full(rejected)) => {
                            frame = rejected;
                            thread::yield_now();
                        }
                        Err(FrameChannelError::Disconnected) => panic!("render thread gone"),
                    }
                }
            }
        })
    };

    let mut executed = 0;
    loop {
        match receiver.wait_latest(&context, Duration::from_millis(20)) {
            Some(frame) => {
                context.execute_frame(&frame);
                executed += 1;
            }
            None if receiver.is_abandoned() && receiver.pending() == 0 => break,
            None => {}
        }
    }
    producer.join().expect("producer thread panicked");

    assert!(executed >= 1);
    assert_eq!(counters.frames(), executed as u64);
    assert_eq!(buffer.apply_update_count(), FRAMES as u64);
    assert_eq!(buffer.size(), FRAMES * 4);
    assert_eq!(buffer.with_render_data(|data| data.to_vec()), buffer.get_data());
}

#[derive(Debug, Clone)]
enum FrameOp {
    Write { offset: usize, bytes: Vec<u8> },
    Append(Vec<u8>),
    Resize(usize),
}

fn frame_op() -> impl Strategy<Value = FrameOp> {
    prop_oneof![
        3 => (0usize..9000, prop::collection::vec(any::<u8>(), 1..64))
            .prop_map(|(offset, bytes)| FrameOp::Write { offset, bytes }),
        2 => prop::collection::vec(any::<u8>(), 1..512).prop_map(FrameOp::Append),
        1 => (0usize..12_000).prop_map(FrameOp::Resize),
    ]
}

proptest! {
    #[test]
    fn skipped_and_executed_frames_converge(
        frames in prop::collection::vec(
            (prop::collection::vec(frame_op(), 0..6), any::<bool>()),
            1..12,
        )
    ) {
        let (context, _) = null_context();
        let buffer = Arc::new(Buffer::new(BufferUsage::VERTEX));

        for (ops, execute) in frames {
            context.begin_frame(MAT4_IDENTITY, MAT4_IDENTITY);
            for op in ops {
                match op {
                    FrameOp::Write { offset, bytes } => {
                        let _ = buffer.set_sub_data(offset, &bytes);
                    }
                    FrameOp::Append(bytes) => {
                        buffer.append(&bytes);
                    }
                    FrameOp::Resize(size) => {
                        buffer.resize(size);
                    }
                }
            }
            context.record_batch("ops", |batch| bind_and_draw(batch, &buffer));
            let frame: Frame = context.end_frame();
            if execute {
                context.execute_frame(&frame);
            }
        }

        context.consume_dropped_frame_updates();
        prop_assert!(!buffer.is_dirty());
        prop_assert_eq!(buffer.render_size(), buffer.size());
        prop_assert_eq!(buffer.with_render_data(|data| data.to_vec()), buffer.get_data());
    }
}
