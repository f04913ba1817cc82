use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use gpu_types::{
    Framebuffer, FramebufferMask, IndexType, Mat4, Pipeline, Primitive, Query, StreamFormat,
    SwapChain, Texture, TextureTable, Transform, Vec2, Vec4, Vec4i,
};
use paging::{Buffer, BufferStream, BufferView, Update};

use crate::{
    BatchAllocHints, BatchCapacities, BatchCommand, CacheVector, Command, DrawCallInfo,
    NamedBatchData, Param, TransformObject,
};

pub const MAX_NUM_UNIFORM_BUFFERS: u32 = 14;
pub const MAX_NUM_RESOURCE_BUFFERS: u32 = 16;
pub const MAX_NUM_RESOURCE_TEXTURES: u32 = 16;
/// Transform objects a draw call can index before its index wraps.
pub const MAX_ADDRESSABLE_OBJECTS: usize = u16::MAX as usize + 1;

pub type Lambda = dyn Fn() + Send + Sync;

/// Buffer updates gathered for one frame, at most one per buffer.
#[derive(Default)]
pub struct BufferUpdates {
    updates: Vec<Update>,
    seen: HashSet<*const Buffer>,
}

impl BufferUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `buffer`'s pending update unless this frame already visited it.
    pub fn collect(&mut self, buffer: &Arc<Buffer>) {
        if !self.seen.insert(Arc::as_ptr(buffer)) {
            return;
        }
        if let Some(update) = buffer.get_update() {
            self.updates.push(update);
        }
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn into_updates(self) -> Vec<Update> {
        self.updates
    }
}

/// Recorded command list plus everything its commands reference.
///
/// Each recording call appends one [`Command`] and a fixed set of
/// [`Param`]s. Objects are interned into per-type caches and addressed by
/// handle; matrices and rects live in the side `data` bytes.
pub struct Batch {
    name: String,
    hints: Arc<BatchAllocHints>,

    commands: Vec<Command>,
    command_offsets: Vec<usize>,
    params: Vec<Param>,
    data: Vec<u8>,

    objects: Vec<TransformObject>,
    draw_call_infos: Vec<DrawCallInfo>,
    invalid_model: bool,
    current_model: Transform,

    buffers: CacheVector<Buffer>,
    textures: CacheVector<Texture>,
    texture_tables: CacheVector<TextureTable>,
    stream_formats: CacheVector<StreamFormat>,
    transforms: CacheVector<Transform>,
    pipelines: CacheVector<Pipeline>,
    framebuffers: CacheVector<Framebuffer>,
    swap_chains: CacheVector<SwapChain>,
    queries: CacheVector<Query>,
    lambdas: CacheVector<Lambda>,
    profile_ranges: CacheVector<str>,
    names: CacheVector<str>,

    named_data: BTreeMap<String, NamedBatchData>,
    current_named_call: Option<String>,
    replaying_named_calls: bool,

    drawcall_uniform: u16,
    drawcall_uniform_reset: u16,
    projection_jitter: Vec2,
    enable_stereo: bool,
    enable_skybox: bool,
}

impl Batch {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_hints(name, Arc::new(BatchAllocHints::default()))
    }

    pub fn with_hints(name: impl Into<String>, hints: Arc<BatchAllocHints>) -> Self {
        let capacities = hints.capacities();
        Self {
            name: name.into(),
            hints,
            commands: Vec::with_capacity(capacities.commands),
            command_offsets: Vec::with_capacity(capacities.commands),
            params: Vec::with_capacity(capacities.params),
            data: Vec::with_capacity(capacities.data),
            objects: Vec::with_capacity(capacities.objects),
            draw_call_infos: Vec::with_capacity(capacities.draw_call_infos),
            invalid_model: true,
            current_model: Transform::IDENTITY,
            buffers: CacheVector::new(),
            textures: CacheVector::new(),
            texture_tables: CacheVector::new(),
            stream_formats: CacheVector::new(),
            transforms: CacheVector::new(),
            pipelines: CacheVector::new(),
            framebuffers: CacheVector::new(),
            swap_chains: CacheVector::new(),
            queries: CacheVector::new(),
            lambdas: CacheVector::new(),
            profile_ranges: CacheVector::new(),
            names: CacheVector::new(),
            named_data: BTreeMap::new(),
            current_named_call: None,
            replaying_named_calls: false,
            drawcall_uniform: 0,
            drawcall_uniform_reset: 0,
            projection_jitter: [0.0; 2],
            enable_stereo: true,
            enable_skybox: false,
        }
    }

    fn used_capacities(&self) -> BatchCapacities {
        BatchCapacities {
            commands: self.commands.len(),
            params: self.params.len(),
            data: self.data.len(),
            objects: self.objects.len(),
            draw_call_infos: self.draw_call_infos.len(),
        }
    }

    /// Empties the batch for reuse. Vector capacities are kept.
    pub fn clear(&mut self) {
        self.hints.record(self.used_capacities());

        self.commands.clear();
        self.command_offsets.clear();
        self.params.clear();
        self.data.clear();
        self.objects.clear();
        self.draw_call_infos.clear();
        self.buffers.clear();
        self.textures.clear();
        self.texture_tables.clear();
        self.stream_formats.clear();
        self.transforms.clear();
        self.pipelines.clear();
        self.framebuffers.clear();
        self.swap_chains.clear();
        self.queries.clear();
        self.lambdas.clear();
        self.profile_ranges.clear();
        self.names.clear();
        self.named_data.clear();

        self.name.clear();
        self.current_named_call = None;
        self.replaying_named_calls = false;
        self.invalid_model = true;
        self.current_model = Transform::IDENTITY;
        self.drawcall_uniform = 0;
        self.drawcall_uniform_reset = 0;
        self.projection_jitter = [0.0; 2];
        self.enable_stereo = true;
        self.enable_skybox = false;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn hints(&self) -> &Arc<BatchAllocHints> {
        &self.hints
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn command_offsets(&self) -> &[usize] {
        &self.command_offsets
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn objects(&self) -> &[TransformObject] {
        &self.objects
    }

    pub fn draw_call_infos(&self) -> &[DrawCallInfo] {
        &self.draw_call_infos
    }

    pub fn buffers(&self) -> &CacheVector<Buffer> {
        &self.buffers
    }

    pub fn named_data(&self) -> &BTreeMap<String, NamedBatchData> {
        &self.named_data
    }

    pub fn current_named_call(&self) -> Option<&str> {
        self.current_named_call.as_deref()
    }

    pub fn capacities(&self) -> BatchCapacities {
        BatchCapacities {
            commands: self.commands.capacity(),
            params: self.params.capacity(),
            data: self.data.capacity(),
            objects: self.objects.capacity(),
            draw_call_infos: self.draw_call_infos.capacity(),
        }
    }

    /// Stereo batches pre-translate the view per eye.
    pub fn enable_stereo(&mut self, enable: bool) {
        self.enable_stereo = enable;
    }

    pub fn is_stereo_enabled(&self) -> bool {
        self.enable_stereo
    }

    /// Skybox batches render in stereo without the per-eye view translation.
    pub fn enable_skybox(&mut self, enable: bool) {
        self.enable_skybox = enable;
    }

    pub fn is_skybox_enabled(&self) -> bool {
        self.enable_skybox
    }

    /// User word attached to the next draw only.
    pub fn set_drawcall_uniform(&mut self, uniform: u16) {
        self.drawcall_uniform = uniform;
    }

    pub fn set_drawcall_uniform_reset(&mut self, reset: u16) {
        self.drawcall_uniform_reset = reset;
    }

    pub fn projection_jitter(&self) -> Vec2 {
        self.projection_jitter
    }

    fn record<const N: usize>(&mut self, command: Command, params: [Param; N]) {
        self.commands.push(command);
        self.command_offsets.push(self.params.len());
        self.params.extend(params);
    }

    /// Copies `bytes` into the side data and returns their offset.
    pub fn cache_data(&mut self, bytes: &[u8]) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        offset
    }

    pub fn read_data<T: Pod>(&self, offset: usize) -> T {
        match self.data.get(offset..offset + size_of::<T>()) {
            Some(bytes) => bytemuck::pod_read_unaligned(bytes),
            None => panic!(
                "side data read of {} bytes at {offset} past end {}",
                size_of::<T>(),
                self.data.len()
            ),
        }
    }

    fn cache_pod<T: Pod>(&mut self, value: &T) -> Param {
        Param::Size(self.cache_data(bytemuck::bytes_of(value)))
    }

    // Drawcalls

    pub fn draw(&mut self, primitive: Primitive, num_vertices: u32, start_vertex: u32) {
        self.record(
            Command::Draw,
            [primitive.into(), num_vertices.into(), start_vertex.into()],
        );
        self.capture_draw_call_info();
    }

    pub fn draw_indexed(&mut self, primitive: Primitive, num_indices: u32, start_index: u32) {
        self.record(
            Command::DrawIndexed,
            [primitive.into(), num_indices.into(), start_index.into()],
        );
        self.capture_draw_call_info();
    }

    pub fn draw_instanced(
        &mut self,
        num_instances: u32,
        primitive: Primitive,
        num_vertices: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.record(
            Command::DrawInstanced,
            [
                num_instances.into(),
                primitive.into(),
                num_vertices.into(),
                start_vertex.into(),
                start_instance.into(),
            ],
        );
        self.capture_draw_call_info();
    }

    pub fn draw_indexed_instanced(
        &mut self,
        num_instances: u32,
        primitive: Primitive,
        num_indices: u32,
        start_index: u32,
        start_instance: u32,
    ) {
        self.record(
            Command::DrawIndexedInstanced,
            [
                num_instances.into(),
                primitive.into(),
                num_indices.into(),
                start_index.into(),
                start_instance.into(),
            ],
        );
        self.capture_draw_call_info();
    }

    pub fn multi_draw_indirect(&mut self, num_commands: u32, primitive: Primitive) {
        self.record(
            Command::MultiDrawIndirect,
            [num_commands.into(), primitive.into()],
        );
        self.capture_draw_call_info();
    }

    pub fn multi_draw_indexed_indirect(&mut self, num_commands: u32, primitive: Primitive) {
        self.record(
            Command::MultiDrawIndexedIndirect,
            [num_commands.into(), primitive.into()],
        );
        self.capture_draw_call_info();
    }

    // Input stage

    pub fn set_input_format(&mut self, format: Arc<StreamFormat>) {
        let format = self.stream_formats.cache(format);
        self.record(Command::SetInputFormat, [format.into()]);
    }

    pub fn set_input_buffer(
        &mut self,
        channel: u32,
        buffer: Arc<Buffer>,
        offset: usize,
        stride: usize,
    ) {
        let buffer = self.buffers.cache(buffer);
        self.record(
            Command::SetInputBuffer,
            [channel.into(), buffer.into(), offset.into(), stride.into()],
        );
    }

    pub fn set_input_buffer_view(&mut self, channel: u32, view: &BufferView) {
        self.set_input_buffer(
            channel,
            Arc::clone(&view.buffer),
            view.offset,
            view.stride as usize,
        );
    }

    /// Binds each stream buffer to consecutive channels from `start_channel`.
    pub fn set_input_stream(&mut self, start_channel: u32, stream: &BufferStream) {
        let channels = stream
            .buffers()
            .iter()
            .zip(stream.offsets())
            .zip(stream.strides());
        for (channel, ((buffer, &offset), &stride)) in (start_channel..).zip(channels) {
            self.set_input_buffer(channel, Arc::clone(buffer), offset, stride as usize);
        }
    }

    pub fn set_index_buffer(&mut self, index_type: IndexType, buffer: Arc<Buffer>, offset: usize) {
        let buffer = self.buffers.cache(buffer);
        self.record(
            Command::SetIndexBuffer,
            [index_type.into(), buffer.into(), offset.into()],
        );
    }

    pub fn set_index_buffer_view(&mut self, view: &BufferView) {
        self.set_index_buffer(view.index_type(), Arc::clone(&view.buffer), view.offset);
    }

    pub fn set_indirect_buffer(&mut self, buffer: Arc<Buffer>, offset: usize, stride: usize) {
        let buffer = self.buffers.cache(buffer);
        self.record(
            Command::SetIndirectBuffer,
            [buffer.into(), offset.into(), stride.into()],
        );
    }

    // Transform stage

    /// Records the model transform and invalidates the current transform
    /// object, so the next draw snapshots a new one.
    pub fn set_model_transform(&mut self, model: &Transform) {
        let transform = self.transforms.cache(Arc::new(*model));
        self.record(Command::SetModelTransform, [transform.into()]);
        self.current_model = *model;
        self.invalid_model = true;
    }

    pub fn set_view_transform(&mut self, view: &Transform, camera: bool) {
        let transform = self.transforms.cache(Arc::new(*view));
        self.record(Command::SetViewTransform, [transform.into(), camera.into()]);
    }

    pub fn reset_view_transform(&mut self) {
        self.set_view_transform(&Transform::IDENTITY, false);
    }

    pub fn set_projection_transform(&mut self, projection: &Mat4) {
        let offset = self.cache_pod(projection);
        self.record(Command::SetProjectionTransform, [offset]);
    }

    /// Sets the batch jitter and records it.
    pub fn set_projection_jitter(&mut self, jx: f32, jy: f32) {
        self.projection_jitter = [jx, jy];
        self.push_projection_jitter(jx, jy);
    }

    /// Records a temporary jitter without changing the batch jitter.
    pub fn push_projection_jitter(&mut self, jx: f32, jy: f32) {
        self.record(Command::SetProjectionJitter, [jx.into(), jy.into()]);
    }

    /// Restores the batch jitter after a `push_projection_jitter`.
    pub fn pop_projection_jitter(&mut self) {
        let [jx, jy] = self.projection_jitter;
        self.push_projection_jitter(jx, jy);
    }

    pub fn set_viewport_transform(&mut self, viewport: Vec4i) {
        let offset = self.cache_pod(&viewport);
        self.record(Command::SetViewportTransform, [offset]);
    }

    pub fn set_depth_range_transform(&mut self, near_depth: f32, far_depth: f32) {
        self.record(
            Command::SetDepthRangeTransform,
            [near_depth.into(), far_depth.into()],
        );
    }

    // Pipeline stage

    pub fn set_pipeline(&mut self, pipeline: Arc<Pipeline>) {
        let pipeline = self.pipelines.cache(pipeline);
        self.record(Command::SetPipeline, [pipeline.into()]);
    }

    pub fn set_state_blend_factor(&mut self, factor: Vec4) {
        self.record(
            Command::SetStateBlendFactor,
            factor.map(Param::Float),
        );
    }

    pub fn set_state_scissor_rect(&mut self, rect: Vec4i) {
        let offset = self.cache_pod(&rect);
        self.record(Command::SetStateScissorRect, [offset]);
    }

    pub fn set_uniform_buffer(&mut self, slot: u32, buffer: Arc<Buffer>, offset: usize, size: usize) {
        if slot >= MAX_NUM_UNIFORM_BUFFERS {
            log::warn!(
                "slot {slot} exceeds max uniform buffer count of {MAX_NUM_UNIFORM_BUFFERS}"
            );
        }
        let buffer = self.buffers.cache(buffer);
        self.record(
            Command::SetUniformBuffer,
            [slot.into(), buffer.into(), offset.into(), size.into()],
        );
    }

    pub fn set_uniform_buffer_view(&mut self, slot: u32, view: &BufferView) {
        self.set_uniform_buffer(slot, Arc::clone(&view.buffer), view.offset, view.size);
    }

    pub fn set_resource_buffer(&mut self, slot: u32, buffer: Arc<Buffer>) {
        if slot >= MAX_NUM_RESOURCE_BUFFERS {
            log::warn!(
                "slot {slot} exceeds max resource buffer count of {MAX_NUM_RESOURCE_BUFFERS}"
            );
        }
        let buffer = self.buffers.cache(buffer);
        self.record(Command::SetResourceBuffer, [slot.into(), buffer.into()]);
    }

    pub fn set_resource_texture(&mut self, slot: u32, texture: Arc<Texture>) {
        if slot >= MAX_NUM_RESOURCE_TEXTURES {
            log::warn!("slot {slot} exceeds max texture count of {MAX_NUM_RESOURCE_TEXTURES}");
        }
        let texture = self.textures.cache(texture);
        self.record(Command::SetResourceTexture, [slot.into(), texture.into()]);
    }

    pub fn set_resource_texture_table(&mut self, table: Arc<TextureTable>, slot: u32) {
        let table = self.texture_tables.cache(table);
        self.record(Command::SetResourceTextureTable, [slot.into(), table.into()]);
    }

    pub fn set_resource_framebuffer_swap_chain_texture(
        &mut self,
        slot: u32,
        swap_chain: Arc<SwapChain>,
        swap_chain_index: u32,
        render_buffer_slot: u32,
    ) {
        let swap_chain = self.swap_chains.cache(swap_chain);
        self.record(
            Command::SetResourceFramebufferSwapChainTexture,
            [
                slot.into(),
                swap_chain.into(),
                swap_chain_index.into(),
                render_buffer_slot.into(),
            ],
        );
    }

    // Output stage

    pub fn set_framebuffer(&mut self, framebuffer: Arc<Framebuffer>) {
        let framebuffer = self.framebuffers.cache(framebuffer);
        self.record(Command::SetFramebuffer, [framebuffer.into()]);
    }

    pub fn set_framebuffer_swap_chain(&mut self, swap_chain: Arc<SwapChain>, swap_chain_index: u32) {
        let swap_chain = self.swap_chains.cache(swap_chain);
        self.record(
            Command::SetFramebufferSwapChain,
            [swap_chain.into(), swap_chain_index.into()],
        );
    }

    pub fn advance(&mut self, swap_chain: Arc<SwapChain>) {
        let swap_chain = self.swap_chains.cache(swap_chain);
        self.record(Command::Advance, [swap_chain.into()]);
    }

    pub fn clear_framebuffer(
        &mut self,
        targets: FramebufferMask,
        color: Vec4,
        depth: f32,
        stencil: i32,
        enable_scissor: bool,
    ) {
        let [r, g, b, a] = color;
        self.record(
            Command::ClearFramebuffer,
            [
                targets.bits().into(),
                r.into(),
                g.into(),
                b.into(),
                a.into(),
                depth.into(),
                stencil.into(),
                enable_scissor.into(),
            ],
        );
    }

    /// Clears only the color targets in `targets`.
    pub fn clear_color_framebuffer(
        &mut self,
        targets: FramebufferMask,
        color: Vec4,
        enable_scissor: bool,
    ) {
        self.clear_framebuffer(targets & FramebufferMask::COLORS, color, 1.0, 0, enable_scissor);
    }

    pub fn clear_depth_framebuffer(&mut self, depth: f32, enable_scissor: bool) {
        self.clear_framebuffer(FramebufferMask::DEPTH, [0.0; 4], depth, 0, enable_scissor);
    }

    pub fn clear_stencil_framebuffer(&mut self, stencil: i32, enable_scissor: bool) {
        self.clear_framebuffer(FramebufferMask::STENCIL, [0.0; 4], 1.0, stencil, enable_scissor);
    }

    pub fn clear_depth_stencil_framebuffer(&mut self, depth: f32, stencil: i32, enable_scissor: bool) {
        self.clear_framebuffer(
            FramebufferMask::DEPTH_STENCIL,
            [0.0; 4],
            depth,
            stencil,
            enable_scissor,
        );
    }

    pub fn blit(
        &mut self,
        src: Arc<Framebuffer>,
        src_rect: Vec4i,
        dst: Arc<Framebuffer>,
        dst_rect: Vec4i,
    ) {
        let src = self.framebuffers.cache(src);
        let src_rect = self.cache_pod(&src_rect);
        let dst = self.framebuffers.cache(dst);
        let dst_rect = self.cache_pod(&dst_rect);
        self.record(Command::Blit, [src.into(), src_rect, dst.into(), dst_rect]);
    }

    pub fn generate_texture_mips(&mut self, texture: Arc<Texture>) {
        let texture = self.textures.cache(texture);
        self.record(Command::GenerateTextureMips, [texture.into()]);
    }

    /// `num_mips < 0` generates the full chain.
    pub fn generate_texture_mips_with_pipeline(&mut self, texture: Arc<Texture>, num_mips: i32) {
        let texture = self.textures.cache(texture);
        self.record(
            Command::GenerateTextureMipsWithPipeline,
            [texture.into(), num_mips.into()],
        );
    }

    // Queries

    pub fn begin_query(&mut self, query: Arc<Query>) {
        let query = self.queries.cache(query);
        self.record(Command::BeginQuery, [query.into()]);
    }

    pub fn end_query(&mut self, query: Arc<Query>) {
        let query = self.queries.cache(query);
        self.record(Command::EndQuery, [query.into()]);
    }

    pub fn get_query(&mut self, query: Arc<Query>) {
        let query = self.queries.cache(query);
        self.record(Command::GetQuery, [query.into()]);
    }

    // Context state

    pub fn reset_stages(&mut self) {
        self.record(Command::ResetStages, []);
    }

    pub fn disable_context_view_correction(&mut self) {
        self.record(Command::DisableContextViewCorrection, []);
    }

    pub fn restore_context_view_correction(&mut self) {
        self.record(Command::RestoreContextViewCorrection, []);
    }

    pub fn disable_context_stereo(&mut self) {
        self.record(Command::DisableContextStereo, []);
    }

    pub fn restore_context_stereo(&mut self) {
        self.record(Command::RestoreContextStereo, []);
    }

    /// Runs `f` on the render thread when the backend reaches this command.
    pub fn run_lambda(&mut self, f: impl Fn() + Send + Sync + 'static) {
        let lambda = self.lambdas.cache(Arc::new(f));
        self.record(Command::RunLambda, [lambda.into()]);
    }

    pub fn push_profile_range(&mut self, name: &str) {
        let name = self.profile_ranges.cache(Arc::from(name));
        self.record(Command::PushProfileRange, [name.into()]);
    }

    pub fn pop_profile_range(&mut self) {
        self.record(Command::PopProfileRange, []);
    }

    // Named calls

    /// Attributes every draw capture until `stop_named_call` to group `name`.
    pub fn start_named_call(&mut self, name: &str) {
        let handle = self.names.cache(Arc::from(name));
        self.record(Command::StartNamedCall, [handle.into()]);
        self.current_named_call = Some(name.to_owned());
    }

    pub fn stop_named_call(&mut self) {
        self.record(Command::StopNamedCall, []);
        self.current_named_call = None;
    }

    /// Adds one instance to group `name`. The first function registered for a
    /// group is the one run at frame finish.
    pub fn setup_named_calls(
        &mut self,
        name: &str,
        function: impl FnMut(&mut Batch, &mut NamedBatchData) + Send + Sync + 'static,
    ) {
        let group = self.named_data.entry(name.to_owned()).or_default();
        if group.function.is_none() {
            group.function = Some(Box::new(function));
        }
        let previous = self.current_named_call.replace(name.to_owned());
        self.capture_draw_call_info_impl();
        self.current_named_call = previous;
    }

    pub fn named_buffer(&mut self, name: &str, index: usize) -> Arc<Buffer> {
        self.named_data
            .entry(name.to_owned())
            .or_default()
            .buffer(index)
    }

    fn capture_draw_call_info(&mut self) {
        // group functions draw with the list they were handed
        if self.replaying_named_calls {
            return;
        }
        self.capture_draw_call_info_impl();
    }

    fn capture_draw_call_info_impl(&mut self) {
        if self.invalid_model {
            self.objects.push(TransformObject {
                model: *self.current_model.matrix(),
                model_inverse: self.current_model.inverse_matrix(),
            });
            self.invalid_model = false;
            if self.objects.len() == MAX_ADDRESSABLE_OBJECTS + 1 {
                log::warn!(
                    "batch {:?} exceeds {MAX_ADDRESSABLE_OBJECTS} transform objects, draw call object indices wrap",
                    self.name
                );
            }
        }

        // shaders address objects with 16 bits
        let info = DrawCallInfo::new((self.objects.len() - 1) as u16, self.drawcall_uniform);
        match &self.current_named_call {
            Some(name) => self
                .named_data
                .entry(name.clone())
                .or_default()
                .draw_call_infos
                .push(info),
            None => self.draw_call_infos.push(info),
        }
        self.drawcall_uniform = self.drawcall_uniform_reset;
    }

    fn run_named_calls(&mut self) {
        if self.named_data.is_empty() {
            return;
        }
        let mut named_data = std::mem::take(&mut self.named_data);
        self.replaying_named_calls = true;
        for (name, group) in named_data.iter_mut() {
            self.start_named_call(name);
            group.process(self);
            self.stop_named_call();
        }
        self.replaying_named_calls = false;

        let stray = std::mem::replace(&mut self.named_data, named_data);
        if !stray.is_empty() {
            log::warn!(
                "batch {:?}: dropped {} named groups opened while replaying named calls",
                self.name,
                stray.len()
            );
        }
    }

    /// Appends each named group's instanced draw and collects the updates of
    /// every buffer the batch references.
    pub fn finish_frame(&mut self, updates: &mut BufferUpdates) {
        self.run_named_calls();
        for group in self.named_data.values() {
            for buffer in group.live_buffers() {
                updates.collect(buffer);
            }
        }
        for buffer in self.buffers.iter() {
            updates.collect(buffer);
        }
    }

    /// Immediate path: runs named calls and copies every referenced buffer
    /// straight into its render shadow. Render thread only.
    pub fn flush(&mut self) {
        self.run_named_calls();
        for group in self.named_data.values() {
            for buffer in group.live_buffers() {
                buffer.flush();
            }
        }
        for buffer in self.buffers.iter() {
            buffer.flush();
        }
    }

    // Decoding

    /// Visits every command with its own parameter slice.
    pub fn for_each_command(&self, mut handler: impl FnMut(Command, &[Param])) {
        for (index, (&command, &offset)) in self.commands.iter().zip(&self.command_offsets).enumerate() {
            let end = self
                .command_offsets
                .get(index + 1)
                .copied()
                .unwrap_or(self.params.len());
            handler(command, &self.params[offset..end]);
        }
    }

    pub fn decoded_commands(&self) -> impl Iterator<Item = BatchCommand<'_>> {
        self.commands.iter().enumerate().map(move |(index, &command)| {
            let offset = self.command_offsets[index];
            let end = self
                .command_offsets
                .get(index + 1)
                .copied()
                .unwrap_or(self.params.len());
            self.decode(command, &self.params[offset..end])
        })
    }

    /// Resolves handles and side data of one recorded command.
    pub fn decode(&self, command: Command, params: &[Param]) -> BatchCommand<'_> {
        let p = |index: usize| params[index];
        match command {
            Command::Draw => BatchCommand::Draw {
                primitive: primitive(p(0)),
                num_vertices: p(1).as_uint(),
                start_vertex: p(2).as_uint(),
            },
            Command::DrawIndexed => BatchCommand::DrawIndexed {
                primitive: primitive(p(0)),
                num_indices: p(1).as_uint(),
                start_index: p(2).as_uint(),
            },
            Command::DrawInstanced => BatchCommand::DrawInstanced {
                num_instances: p(0).as_uint(),
                primitive: primitive(p(1)),
                num_vertices: p(2).as_uint(),
                start_vertex: p(3).as_uint(),
                start_instance: p(4).as_uint(),
            },
            Command::DrawIndexedInstanced => BatchCommand::DrawIndexedInstanced {
                num_instances: p(0).as_uint(),
                primitive: primitive(p(1)),
                num_indices: p(2).as_uint(),
                start_index: p(3).as_uint(),
                start_instance: p(4).as_uint(),
            },
            Command::MultiDrawIndirect => BatchCommand::MultiDrawIndirect {
                num_commands: p(0).as_uint(),
                primitive: primitive(p(1)),
            },
            Command::MultiDrawIndexedIndirect => BatchCommand::MultiDrawIndexedIndirect {
                num_commands: p(0).as_uint(),
                primitive: primitive(p(1)),
            },
            Command::SetInputFormat => {
                BatchCommand::SetInputFormat(self.stream_formats.get(p(0).as_size()))
            }
            Command::SetInputBuffer => BatchCommand::SetInputBuffer {
                channel: p(0).as_uint(),
                buffer: self.buffers.get(p(1).as_size()),
                offset: p(2).as_size(),
                stride: p(3).as_size(),
            },
            Command::SetIndexBuffer => BatchCommand::SetIndexBuffer {
                index_type: IndexType::from_u32(p(0).as_uint())
                    .unwrap_or_else(|| panic!("invalid index type {:?}", p(0))),
                buffer: self.buffers.get(p(1).as_size()),
                offset: p(2).as_size(),
            },
            Command::SetIndirectBuffer => BatchCommand::SetIndirectBuffer {
                buffer: self.buffers.get(p(0).as_size()),
                offset: p(1).as_size(),
                stride: p(2).as_size(),
            },
            Command::SetModelTransform => {
                BatchCommand::SetModelTransform(self.transforms.get(p(0).as_size()))
            }
            Command::SetViewTransform => BatchCommand::SetViewTransform {
                view: self.transforms.get(p(0).as_size()),
                camera: p(1).as_bool(),
            },
            Command::SetProjectionTransform => {
                BatchCommand::SetProjectionTransform(self.read_data(p(0).as_size()))
            }
            Command::SetProjectionJitter => {
                BatchCommand::SetProjectionJitter([p(0).as_float(), p(1).as_float()])
            }
            Command::SetViewportTransform => {
                BatchCommand::SetViewportTransform(self.read_data(p(0).as_size()))
            }
            Command::SetDepthRangeTransform => BatchCommand::SetDepthRangeTransform {
                near: p(0).as_float(),
                far: p(1).as_float(),
            },
            Command::SetPipeline => BatchCommand::SetPipeline(self.pipelines.get(p(0).as_size())),
            Command::SetStateBlendFactor => BatchCommand::SetStateBlendFactor([
                p(0).as_float(),
                p(1).as_float(),
                p(2).as_float(),
                p(3).as_float(),
            ]),
            Command::SetStateScissorRect => {
                BatchCommand::SetStateScissorRect(self.read_data(p(0).as_size()))
            }
            Command::SetUniformBuffer => BatchCommand::SetUniformBuffer {
                slot: p(0).as_uint(),
                buffer: self.buffers.get(p(1).as_size()),
                offset: p(2).as_size(),
                size: p(3).as_size(),
            },
            Command::SetResourceBuffer => BatchCommand::SetResourceBuffer {
                slot: p(0).as_uint(),
                buffer: self.buffers.get(p(1).as_size()),
            },
            Command::SetResourceTexture => BatchCommand::SetResourceTexture {
                slot: p(0).as_uint(),
                texture: self.textures.get(p(1).as_size()),
            },
            Command::SetResourceTextureTable => BatchCommand::SetResourceTextureTable {
                slot: p(0).as_uint(),
                table: self.texture_tables.get(p(1).as_size()),
            },
            Command::SetResourceFramebufferSwapChainTexture => {
                BatchCommand::SetResourceFramebufferSwapChainTexture {
                    slot: p(0).as_uint(),
                    swap_chain: self.swap_chains.get(p(1).as_size()),
                    swap_chain_index: p(2).as_uint(),
                    render_buffer_slot: p(3).as_uint(),
                }
            }
            Command::SetFramebuffer => {
                BatchCommand::SetFramebuffer(self.framebuffers.get(p(0).as_size()))
            }
            Command::SetFramebufferSwapChain => BatchCommand::SetFramebufferSwapChain {
                swap_chain: self.swap_chains.get(p(0).as_size()),
                swap_chain_index: p(1).as_uint(),
            },
            Command::ClearFramebuffer => BatchCommand::ClearFramebuffer {
                targets: FramebufferMask::from_bits_retain(p(0).as_uint()),
                color: [
                    p(1).as_float(),
                    p(2).as_float(),
                    p(3).as_float(),
                    p(4).as_float(),
                ],
                depth: p(5).as_float(),
                stencil: p(6).as_int(),
                enable_scissor: p(7).as_bool(),
            },
            Command::Blit => BatchCommand::Blit {
                src: self.framebuffers.get(p(0).as_size()),
                src_rect: self.read_data(p(1).as_size()),
                dst: self.framebuffers.get(p(2).as_size()),
                dst_rect: self.read_data(p(3).as_size()),
            },
            Command::GenerateTextureMips => {
                BatchCommand::GenerateTextureMips(self.textures.get(p(0).as_size()))
            }
            Command::GenerateTextureMipsWithPipeline => {
                BatchCommand::GenerateTextureMipsWithPipeline {
                    texture: self.textures.get(p(0).as_size()),
                    num_mips: p(1).as_int(),
                }
            }
            Command::Advance => BatchCommand::Advance(self.swap_chains.get(p(0).as_size())),
            Command::BeginQuery => BatchCommand::BeginQuery(self.queries.get(p(0).as_size())),
            Command::EndQuery => BatchCommand::EndQuery(self.queries.get(p(0).as_size())),
            Command::GetQuery => BatchCommand::GetQuery(self.queries.get(p(0).as_size())),
            Command::ResetStages => BatchCommand::ResetStages,
            Command::DisableContextViewCorrection => BatchCommand::DisableContextViewCorrection,
            Command::RestoreContextViewCorrection => BatchCommand::RestoreContextViewCorrection,
            Command::DisableContextStereo => BatchCommand::DisableContextStereo,
            Command::RestoreContextStereo => BatchCommand::RestoreContextStereo,
            Command::RunLambda => BatchCommand::RunLambda(self.lambdas.get(p(0).as_size()).as_ref()),
            Command::StartNamedCall => {
                BatchCommand::StartNamedCall(self.names.get(p(0).as_size()))
            }
            Command::StopNamedCall => BatchCommand::StopNamedCall,
            Command::PushProfileRange => {
                BatchCommand::PushProfileRange(self.profile_ranges.get(p(0).as_size()))
            }
            Command::PopProfileRange => BatchCommand::PopProfileRange,
        }
    }
}

fn primitive(param: Param) -> Primitive {
    Primitive::from_u32(param.as_uint())
        .unwrap_or_else(|| panic!("invalid primitive parameter {param:?}"))
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.hints.record(self.used_capacities());
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("name", &self.name)
            .field("commands", &self.commands.len())
            .field("params", &self.params.len())
            .field("data", &self.data.len())
            .field("objects", &self.objects.len())
            .field("draw_call_infos", &self.draw_call_infos.len())
            .field("named_data", &self.named_data)
            .finish()
    }
}
