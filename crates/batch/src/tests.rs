use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gpu_types::{Framebuffer, FramebufferMask, Pipeline, Primitive, Shader, Transform};
use paging::{Buffer, BufferStream, BufferUsage, BufferView};
use proptest::prelude::*;

use crate::{
    Batch, BatchAllocHints, BatchCommand, BufferUpdates, Command, DrawCallInfo,
    MAX_ADDRESSABLE_OBJECTS, NamedBatchData, Param,
};

fn emit_instanced(batch: &mut Batch, data: &mut NamedBatchData) {
    let instances = data.buffer(0);
    batch.set_input_buffer(1, instances, 0, 16);
    batch.draw_instanced(data.count() as u32, Primitive::Triangles, 36, 0, 0);
}

fn instanced_counts(batch: &Batch) -> Vec<u32> {
    batch
        .decoded_commands()
        .filter_map(|command| match command {
            BatchCommand::DrawInstanced { num_instances, .. } => Some(num_instances),
            _ => None,
        })
        .collect()
}

#[test]
fn draws_sharing_a_model_share_one_transform_object() {
    let mut batch = Batch::new("shared");
    batch.set_model_transform(&Transform::from_translation([1.0, 0.0, 0.0]));
    batch.draw(Primitive::Triangles, 3, 0);
    batch.draw(Primitive::Triangles, 6, 3);

    assert_eq!(batch.objects().len(), 1);
    assert_eq!(
        batch.draw_call_infos(),
        &[DrawCallInfo::new(0, 0), DrawCallInfo::new(0, 0)]
    );
}

#[test]
fn model_changes_between_draws_snapshot_new_objects() {
    let mut batch = Batch::new("two models");
    let first = Transform::from_translation([1.0, 2.0, 3.0]);
    let second = Transform::from_scale([2.0, 2.0, 2.0]);
    batch.set_model_transform(&first);
    batch.draw(Primitive::Triangles, 3, 0);
    batch.set_model_transform(&second);
    batch.draw(Primitive::Triangles, 3, 0);

    assert_eq!(
        batch.commands(),
        &[
            Command::SetModelTransform,
            Command::Draw,
            Command::SetModelTransform,
            Command::Draw
        ]
    );
    assert_eq!(batch.objects().len(), 2);
    assert_eq!(&batch.objects()[0].model, first.matrix());
    assert_eq!(batch.objects()[1].model_inverse[0], 0.5);
    assert_eq!(batch.draw_call_infos()[1].index, 1);
}

#[test]
fn first_draw_without_model_uses_identity() {
    let mut batch = Batch::new("identity");
    batch.draw_indexed(Primitive::Lines, 2, 0);
    assert_eq!(batch.objects().len(), 1);
    assert_eq!(batch.objects()[0].model, *Transform::IDENTITY.matrix());
}

#[test]
fn drawcall_uniform_applies_to_one_draw() {
    let mut batch = Batch::new("uniform");
    batch.set_drawcall_uniform_reset(7);
    batch.set_drawcall_uniform(42);
    batch.draw(Primitive::Points, 1, 0);
    batch.draw(Primitive::Points, 1, 0);
    let users: Vec<u16> = batch.draw_call_infos().iter().map(|info| info.user).collect();
    assert_eq!(users, vec![42, 7]);
}

#[test]
fn object_indices_wrap_past_the_addressable_range() {
    let mut batch = Batch::new("crowd");
    for index in 0..=MAX_ADDRESSABLE_OBJECTS {
        batch.set_model_transform(&Transform::from_translation([index as f32, 0.0, 0.0]));
        batch.draw(Primitive::Points, 1, 0);
    }
    assert_eq!(batch.objects().len(), MAX_ADDRESSABLE_OBJECTS + 1);

    let infos = batch.draw_call_infos();
    assert_eq!(infos.len(), MAX_ADDRESSABLE_OBJECTS + 1);
    assert_eq!(infos[MAX_ADDRESSABLE_OBJECTS - 1].index, u16::MAX);
    assert_eq!(infos[MAX_ADDRESSABLE_OBJECTS].index, 0);
}

#[test]
fn named_call_emits_one_instanced_draw_for_all_instances() {
    let mut batch = Batch::new("instancing");
    for index in 0..5u32 {
        batch.set_model_transform(&Transform::from_translation([index as f32, 0.0, 0.0]));
        let instances = batch.named_buffer("cubes", 0);
        instances.append_slice(&[index as f32; 4]);
        batch.setup_named_calls("cubes", emit_instanced);
    }
    assert!(batch.draw_call_infos().is_empty());
    assert_eq!(batch.named_data()["cubes"].count(), 5);

    let mut updates = BufferUpdates::new();
    batch.finish_frame(&mut updates);

    assert_eq!(instanced_counts(&batch), vec![5]);
    assert!(batch.draw_call_infos().is_empty());
    assert_eq!(batch.named_data()["cubes"].count(), 5);
    // named buffer is referenced twice (group slot and input binding)
    assert_eq!(updates.len(), 1);

    let tail: Vec<Command> = batch.commands().iter().rev().take(4).rev().copied().collect();
    assert_eq!(
        tail,
        vec![
            Command::StartNamedCall,
            Command::SetInputBuffer,
            Command::DrawInstanced,
            Command::StopNamedCall
        ]
    );
}

#[test]
fn groups_replay_in_name_order() {
    let mut batch = Batch::new("ordered");
    batch.setup_named_calls("spheres", emit_instanced);
    batch.setup_named_calls("boxes", emit_instanced);
    batch.setup_named_calls("boxes", emit_instanced);
    batch.finish_frame(&mut BufferUpdates::new());

    let names: Vec<String> = batch
        .decoded_commands()
        .filter_map(|command| match command {
            BatchCommand::StartNamedCall(name) => Some(name.to_owned()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["boxes", "spheres"]);
    assert_eq!(instanced_counts(&batch), vec![2, 1]);
}

#[test]
fn only_first_registered_group_function_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut batch = Batch::new("first wins");
    let counted = Arc::clone(&calls);
    batch.setup_named_calls("group", move |batch, data| {
        counted.fetch_add(1, Ordering::Relaxed);
        emit_instanced(batch, data);
    });
    batch.setup_named_calls("group", |_, _| panic!("second function must not run"));
    batch.finish_frame(&mut BufferUpdates::new());
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn captures_inside_open_named_call_go_to_the_group() {
    let mut batch = Batch::new("bracketed");
    batch.start_named_call("decals");
    batch.draw(Primitive::Triangles, 3, 0);
    batch.draw(Primitive::Triangles, 3, 0);
    batch.stop_named_call();
    batch.draw(Primitive::Triangles, 3, 0);

    assert_eq!(batch.named_data()["decals"].count(), 2);
    assert_eq!(batch.draw_call_infos().len(), 1);
    assert_eq!(batch.current_named_call(), None);
}

#[test]
fn caching_the_same_buffer_gives_distinct_handles() {
    let buffer = Arc::new(Buffer::new(BufferUsage::RESOURCE));
    let mut batch = Batch::new("handles");
    batch.set_resource_buffer(0, Arc::clone(&buffer));
    batch.set_resource_buffer(1, Arc::clone(&buffer));

    let mut handles = Vec::new();
    batch.for_each_command(|_, params| handles.push(params[1].as_size()));
    assert_eq!(handles, vec![0, 1]);
    for handle in handles {
        assert!(Arc::ptr_eq(batch.buffers().get(handle), &buffer));
    }
}

#[test]
fn clear_resets_content_and_keeps_capacity() {
    let hints = Arc::new(BatchAllocHints::with_minimum(0));
    let mut batch = Batch::with_hints("reused", Arc::clone(&hints));
    batch.set_name("frame 1");
    batch.enable_stereo(false);
    batch.enable_skybox(true);
    batch.set_projection_jitter(0.25, -0.25);
    for _ in 0..300 {
        batch.set_projection_transform(&[1.0; 16]);
        batch.draw(Primitive::Triangles, 3, 0);
    }
    batch.setup_named_calls("group", emit_instanced);
    let before = batch.capacities();

    batch.clear();

    let fresh = Batch::new("");
    assert!(batch.is_empty());
    assert!(batch.params().is_empty());
    assert!(batch.data().is_empty());
    assert!(batch.objects().is_empty());
    assert!(batch.draw_call_infos().is_empty());
    assert!(batch.named_data().is_empty());
    assert!(batch.buffers().is_empty());
    assert_eq!(batch.name(), fresh.name());
    assert_eq!(batch.is_stereo_enabled(), fresh.is_stereo_enabled());
    assert_eq!(batch.is_skybox_enabled(), fresh.is_skybox_enabled());
    assert_eq!(batch.projection_jitter(), fresh.projection_jitter());
    assert_eq!(batch.capacities(), before);

    let capacities = hints.capacities();
    assert_eq!(capacities.commands, 601);
    assert_eq!(capacities.data, 300 * 64);
    let next = Batch::with_hints("next", hints);
    assert!(next.capacities().commands >= 601);
}

#[test]
fn matrices_and_rects_travel_in_side_data() {
    let mut batch = Batch::new("side data");
    let projection: [f32; 16] = std::array::from_fn(|index| index as f32);
    batch.set_projection_transform(&projection);
    batch.set_viewport_transform([0, 0, 1920, 1080]);
    batch.set_state_scissor_rect([10, 20, 30, 40]);

    assert_eq!(batch.data().len(), 64 + 16 + 16);
    let decoded: Vec<BatchCommand<'_>> = batch.decoded_commands().collect();
    assert!(matches!(decoded[0], BatchCommand::SetProjectionTransform(m) if m == projection));
    assert!(matches!(decoded[1], BatchCommand::SetViewportTransform([0, 0, 1920, 1080])));
    assert!(matches!(decoded[2], BatchCommand::SetStateScissorRect([10, 20, 30, 40])));
}

#[test]
fn parameter_slices_match_command_layouts() {
    let framebuffer = Arc::new(Framebuffer::new("main", 64, 64, FramebufferMask::COLOR0));
    let mut batch = Batch::new("layouts");
    batch.set_framebuffer(Arc::clone(&framebuffer));
    batch.clear_color_framebuffer(
        FramebufferMask::COLOR0 | FramebufferMask::DEPTH,
        [0.1, 0.2, 0.3, 1.0],
        true,
    );
    batch.reset_stages();
    batch.blit(framebuffer.clone(), [0, 0, 64, 64], framebuffer, [0, 0, 32, 32]);

    let mut lengths = Vec::new();
    batch.for_each_command(|command, params| lengths.push((command, params.len())));
    assert_eq!(
        lengths,
        vec![
            (Command::SetFramebuffer, 1),
            (Command::ClearFramebuffer, 8),
            (Command::ResetStages, 0),
            (Command::Blit, 4),
        ]
    );

    match batch.decoded_commands().nth(1) {
        Some(BatchCommand::ClearFramebuffer {
            targets,
            color,
            depth,
            stencil,
            enable_scissor,
        }) => {
            assert_eq!(targets, FramebufferMask::COLOR0);
            assert_eq!(color, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(depth, 1.0);
            assert_eq!(stencil, 0);
            assert!(enable_scissor);
        }
        _ => panic!("expected a clear command"),
    }
}

#[test]
fn jitter_push_and_pop_restore_batch_jitter() {
    let mut batch = Batch::new("jitter");
    batch.set_projection_jitter(0.5, 0.25);
    batch.push_projection_jitter(0.0, 0.0);
    batch.pop_projection_jitter();

    let jitters: Vec<[f32; 2]> = batch
        .decoded_commands()
        .filter_map(|command| match command {
            BatchCommand::SetProjectionJitter(jitter) => Some(jitter),
            _ => None,
        })
        .collect();
    assert_eq!(jitters, vec![[0.5, 0.25], [0.0, 0.0], [0.5, 0.25]]);
    assert_eq!(batch.projection_jitter(), [0.5, 0.25]);
}

#[test]
fn out_of_range_slots_still_record() {
    let mut batch = Batch::new("slots");
    batch.set_uniform_buffer(20, Arc::new(Buffer::new(BufferUsage::UNIFORM)), 0, 64);
    batch.set_resource_texture(
        31,
        Arc::new(gpu_types::Texture::new_2d(
            "noise",
            8,
            8,
            gpu_types::TextureFormat::R8Unorm,
        )),
    );
    assert_eq!(
        batch.commands(),
        &[Command::SetUniformBuffer, Command::SetResourceTexture]
    );
}

#[test]
fn view_and_stream_shortcuts_unroll_into_commands() {
    let vertices = Arc::new(Buffer::from_slice(BufferUsage::VERTEX, &[0.0f32; 12]));
    let indices = Arc::new(Buffer::from_slice(BufferUsage::INDEX, &[0u16, 1, 2]));
    let mut stream = BufferStream::new();
    stream.add_buffer(Arc::clone(&vertices), 0, 12);
    stream.add_buffer(Arc::clone(&vertices), 24, 4);

    let mut batch = Batch::new("shortcuts");
    batch.set_input_stream(2, &stream);
    batch.set_index_buffer_view(&BufferView::new(indices, 2));
    batch.set_uniform_buffer_view(0, &BufferView::with_range(vertices, 16, 32, 16));

    let decoded: Vec<BatchCommand<'_>> = batch.decoded_commands().collect();
    assert!(matches!(
        decoded[0],
        BatchCommand::SetInputBuffer { channel: 2, offset: 0, stride: 12, .. }
    ));
    assert!(matches!(
        decoded[1],
        BatchCommand::SetInputBuffer { channel: 3, offset: 24, stride: 4, .. }
    ));
    assert!(matches!(
        decoded[2],
        BatchCommand::SetIndexBuffer { index_type: gpu_types::IndexType::Uint16, offset: 0, .. }
    ));
    assert!(matches!(
        decoded[3],
        BatchCommand::SetUniformBuffer { slot: 0, offset: 16, size: 32, .. }
    ));
}

#[test]
fn lambdas_and_pipelines_resolve_through_caches() {
    let hits = Arc::new(AtomicUsize::new(0));
    let pipeline = Arc::new(Pipeline::new("opaque", Arc::new(Shader::new(3, "simple"))));
    let mut batch = Batch::new("lambda");
    batch.set_pipeline(Arc::clone(&pipeline));
    let counter = Arc::clone(&hits);
    batch.run_lambda(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    batch.push_profile_range("opaque pass");
    batch.pop_profile_range();

    for command in batch.decoded_commands() {
        match command {
            BatchCommand::SetPipeline(resolved) => assert!(Arc::ptr_eq(resolved, &pipeline)),
            BatchCommand::RunLambda(lambda) => lambda(),
            BatchCommand::PushProfileRange(name) => assert_eq!(name, "opaque pass"),
            _ => {}
        }
    }
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn finish_frame_collects_each_dirty_buffer_once() {
    let shared = Arc::new(Buffer::from_slice(BufferUsage::UNIFORM, &[1u32; 4]));
    let clean = Arc::new(Buffer::from_slice(BufferUsage::RESOURCE, &[2u32; 4]));
    clean.flush();

    let mut first = Batch::new("first");
    first.set_uniform_buffer(0, Arc::clone(&shared), 0, 16);
    first.set_resource_buffer(0, Arc::clone(&clean));
    let mut second = Batch::new("second");
    second.set_uniform_buffer(1, Arc::clone(&shared), 0, 16);

    let mut updates = BufferUpdates::new();
    first.finish_frame(&mut updates);
    second.finish_frame(&mut updates);
    let updates = updates.into_updates();
    assert_eq!(updates.len(), 1);
    assert!(Arc::ptr_eq(updates[0].buffer(), &shared));
}

#[test]
fn flush_runs_named_calls_and_fills_shadows() {
    let mut batch = Batch::new("immediate");
    let instances = batch.named_buffer("quads", 0);
    instances.append_slice(&[1.0f32, 2.0]);
    batch.setup_named_calls("quads", emit_instanced);
    batch.flush();

    assert_eq!(instanced_counts(&batch), vec![1]);
    assert!(!instances.is_dirty());
    assert_eq!(instances.render_size(), 8);
}

#[test]
#[should_panic(expected = "out of range")]
fn decoding_a_foreign_handle_panics() {
    let mut batch = Batch::new("foreign");
    batch.set_pipeline(Arc::new(Pipeline::new("p", Arc::new(Shader::new(0, "s")))));
    let params = [Param::Size(9)];
    batch.decode(Command::SetPipeline, &params);
}

proptest! {
    #[test]
    fn every_cache_call_gets_its_own_handle(repeats in 1usize..64) {
        let buffer = Arc::new(Buffer::new(BufferUsage::VERTEX));
        let mut batch = Batch::new("repeats");
        for channel in 0..repeats {
            batch.set_input_buffer(channel as u32, Arc::clone(&buffer), 0, 4);
        }
        let mut handles = Vec::new();
        batch.for_each_command(|_, params| handles.push(params[1].as_size()));
        prop_assert_eq!(handles, (0..repeats).collect::<Vec<_>>());
        prop_assert_eq!(batch.buffers().len(), repeats);
        prop_assert!(batch.buffers().iter().all(|cached| Arc::ptr_eq(cached, &buffer)));
    }

    #[test]
    fn named_instances_collapse_into_one_draw(counts in prop::collection::vec(1usize..20, 1..5)) {
        let mut batch = Batch::new("groups");
        for (group, &count) in counts.iter().enumerate() {
            let name = format!("group{group:02}");
            for _ in 0..count {
                batch.setup_named_calls(&name, emit_instanced);
            }
        }
        batch.finish_frame(&mut BufferUpdates::new());
        let expected: Vec<u32> = counts.iter().map(|&count| count as u32).collect();
        prop_assert_eq!(instanced_counts(&batch), expected);
    }
}
