use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use batch::{Batch, BatchCommand};
use gpu_types::{Framebuffer, Mat4, Shader, StereoState, TextureFormat, Vec4i};
use image::RgbaImage;
use thiserror::Error;

use crate::Frame;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("no backend is installed")]
    NoBackend,
    #[error("region {region:?} is outside framebuffer {name:?} ({width}x{height})")]
    RegionOutOfBounds {
        name: String,
        region: Vec4i,
        width: u32,
        height: u32,
    },
    #[error("framebuffer {0:?} has no readable color buffer")]
    FramebufferNotReadable(String),
}

/// Counters a backend accumulates while executing commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub format_changes: u32,
    pub input_buffer_changes: u32,
    pub index_buffer_changes: u32,
    pub resource_buffers_bound: u32,
    pub textures_bound: u32,
    pub texture_memory: u64,
    pub api_drawcalls: u32,
    pub drawcalls: u32,
    pub triangles: u32,
    pub set_pipelines: u32,
}

impl ContextStats {
    /// Difference `end - begin`, wrapping so a counter reset mid-frame does
    /// not panic.
    pub fn eval_delta(begin: &Self, end: &Self) -> Self {
        Self {
            format_changes: end.format_changes.wrapping_sub(begin.format_changes),
            input_buffer_changes: end
                .input_buffer_changes
                .wrapping_sub(begin.input_buffer_changes),
            index_buffer_changes: end
                .index_buffer_changes
                .wrapping_sub(begin.index_buffer_changes),
            resource_buffers_bound: end
                .resource_buffers_bound
                .wrapping_sub(begin.resource_buffers_bound),
            textures_bound: end.textures_bound.wrapping_sub(begin.textures_bound),
            texture_memory: end.texture_memory.wrapping_sub(begin.texture_memory),
            api_drawcalls: end.api_drawcalls.wrapping_sub(begin.api_drawcalls),
            drawcalls: end.drawcalls.wrapping_sub(begin.drawcalls),
            triangles: end.triangles.wrapping_sub(begin.triangles),
            set_pipelines: end.set_pipelines.wrapping_sub(begin.set_pipelines),
        }
    }
}

/// Render-thread sink for recorded work.
///
/// A backend owns every API object; it only ever sees batches, frames, and
/// the render shadows of buffers.
pub trait Backend: Send {
    fn version(&self) -> &str;

    fn render(&mut self, batch: &Batch);

    fn download_framebuffer(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
        region: Vec4i,
    ) -> Result<RgbaImage, BackendError>;

    fn set_stereo_state(&mut self, stereo: &StereoState);

    fn stats(&self) -> ContextStats;

    fn reset_stats(&mut self);

    fn execute_frame(&mut self, frame: &Frame) {
        for batch in frame.batches() {
            self.render(batch);
        }
    }

    fn sync_cache(&mut self) {}

    fn sync_program(&mut self, _program: &Arc<Shader>) {}

    /// Releases API objects whose owners were dropped since the last call.
    fn recycle(&mut self) {}

    fn update_present_frame(&mut self, _correction: &Mat4, _primary: bool) {}

    fn supported_texture_format(&self, format: TextureFormat) -> bool {
        !format.is_compressed()
    }

    fn is_texture_management_sparse_enabled(&self) -> bool {
        false
    }

    fn shutdown(&mut self) {}
}

/// Totals a [`NullBackend`] shares with whoever created it.
#[derive(Debug, Default)]
pub struct NullBackendCounters {
    pub frames: AtomicU64,
    pub batches: AtomicU64,
    pub synced_programs: AtomicU64,
    pub uploaded_pages: AtomicU64,
    pub recycles: AtomicU64,
}

impl NullBackendCounters {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn synced_programs(&self) -> u64 {
        self.synced_programs.load(Ordering::Relaxed)
    }

    pub fn uploaded_pages(&self) -> u64 {
        self.uploaded_pages.load(Ordering::Relaxed)
    }

    pub fn recycles(&self) -> u64 {
        self.recycles.load(Ordering::Relaxed)
    }
}

/// Headless backend: walks every command for its statistics and drains the
/// render shadows of bound buffers, but issues nothing.
#[derive(Debug, Default)]
pub struct NullBackend {
    counters: Arc<NullBackendCounters>,
    stats: ContextStats,
    stereo: StereoState,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Arc<NullBackendCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stereo(&self) -> &StereoState {
        &self.stereo
    }

    fn upload(&self, buffer: &paging::Buffer) {
        let pages = buffer.take_render_dirty_pages();
        self.counters
            .uploaded_pages
            .fetch_add(pages.len() as u64, Ordering::Relaxed);
    }
}

impl Backend for NullBackend {
    fn version(&self) -> &str {
        "null"
    }

    fn render(&mut self, batch: &Batch) {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        for command in batch.decoded_commands() {
            let stats = &mut self.stats;
            match command {
                BatchCommand::Draw { num_vertices, .. } => {
                    count_draw(stats, 1, num_vertices / 3);
                }
                BatchCommand::DrawIndexed { num_indices, .. } => {
                    count_draw(stats, 1, num_indices / 3);
                }
                BatchCommand::DrawInstanced {
                    num_instances,
                    num_vertices,
                    ..
                } => {
                    count_draw(stats, num_instances, num_instances.wrapping_mul(num_vertices / 3));
                }
                BatchCommand::DrawIndexedInstanced {
                    num_instances,
                    num_indices,
                    ..
                } => {
                    count_draw(stats, num_instances, num_instances.wrapping_mul(num_indices / 3));
                }
                BatchCommand::MultiDrawIndirect { num_commands, .. }
                | BatchCommand::MultiDrawIndexedIndirect { num_commands, .. } => {
                    count_draw(stats, num_commands, 0);
                }
                BatchCommand::SetInputFormat(_) => bump(&mut stats.format_changes, 1),
                BatchCommand::SetInputBuffer { buffer, .. } => {
                    bump(&mut stats.input_buffer_changes, 1);
                    self.upload(buffer);
                }
                BatchCommand::SetIndexBuffer { buffer, .. } => {
                    bump(&mut stats.index_buffer_changes, 1);
                    self.upload(buffer);
                }
                BatchCommand::SetIndirectBuffer { buffer, .. }
                | BatchCommand::SetUniformBuffer { buffer, .. } => self.upload(buffer),
                BatchCommand::SetResourceBuffer { buffer, .. } => {
                    bump(&mut stats.resource_buffers_bound, 1);
                    self.upload(buffer);
                }
                BatchCommand::SetResourceTexture { texture, .. } => {
                    bump(&mut stats.textures_bound, 1);
                    stats.texture_memory = stats.texture_memory.wrapping_add(texture_bytes(
                        texture.width,
                        texture.height,
                        texture.depth,
                        texture.format,
                    ));
                }
                BatchCommand::SetResourceTextureTable { table, .. } => {
                    let bound = table.slots.iter().flatten().count() as u32;
                    bump(&mut stats.textures_bound, bound);
                }
                BatchCommand::SetPipeline(_) => bump(&mut stats.set_pipelines, 1),
                BatchCommand::RunLambda(lambda) => lambda(),
                _ => {}
            }
        }
    }

    fn execute_frame(&mut self, frame: &Frame) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        for batch in frame.batches() {
            self.render(batch);
        }
    }

    fn download_framebuffer(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
        region: Vec4i,
    ) -> Result<RgbaImage, BackendError> {
        if !framebuffer
            .buffer_mask
            .intersects(gpu_types::FramebufferMask::COLORS)
        {
            return Err(BackendError::FramebufferNotReadable(framebuffer.name.clone()));
        }
        let [x, y, width, height] = region;
        let inside = x >= 0
            && y >= 0
            && width >= 0
            && height >= 0
            && (x as u64 + width as u64) <= framebuffer.width as u64
            && (y as u64 + height as u64) <= framebuffer.height as u64;
        if !inside {
            return Err(BackendError::RegionOutOfBounds {
                name: framebuffer.name.clone(),
                region,
                width: framebuffer.width,
                height: framebuffer.height,
            });
        }
        Ok(RgbaImage::new(width as u32, height as u32))
    }

    fn set_stereo_state(&mut self, stereo: &StereoState) {
        self.stereo = *stereo;
    }

    fn stats(&self) -> ContextStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = ContextStats::default();
    }

    fn sync_program(&mut self, _program: &Arc<Shader>) {
        self.counters.synced_programs.fetch_add(1, Ordering::Relaxed);
    }

    fn recycle(&mut self) {
        self.counters.recycles.fetch_add(1, Ordering::Relaxed);
    }
}

// Counters are cumulative and wrap; readers take wrapping deltas.
fn bump(counter: &mut u32, by: u32) {
    *counter = counter.wrapping_add(by);
}

fn count_draw(stats: &mut ContextStats, drawcalls: u32, triangles: u32) {
    bump(&mut stats.drawcalls, drawcalls);
    bump(&mut stats.api_drawcalls, 1);
    bump(&mut stats.triangles, triangles);
}

fn texture_bytes(width: u32, height: u32, depth: u32, format: TextureFormat) -> u64 {
    let texels = (width as u64 * height as u64).saturating_mul(depth.max(1) as u64);
    let bits_per_texel: u64 = match format {
        TextureFormat::R8Unorm => 8,
        TextureFormat::Rg8Unorm => 16,
        TextureFormat::Rgba8Unorm
        | TextureFormat::Rgba8Srgb
        | TextureFormat::Bgra8Unorm
        | TextureFormat::Bgra8Srgb
        | TextureFormat::R11G11B10Float
        | TextureFormat::R32Float
        | TextureFormat::Depth32Float
        | TextureFormat::Depth24Stencil8 => 32,
        TextureFormat::Rgba16Float => 64,
        TextureFormat::Rgba32Float => 128,
        TextureFormat::Bc1RgbaUnorm => 4,
        TextureFormat::Bc3RgbaUnorm | TextureFormat::Bc7RgbaUnorm => 8,
    };
    texels.saturating_mul(bits_per_texel) / 8
}
