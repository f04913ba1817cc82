//! Frame sequencing on top of [`batch`] recording.
//!
//! A recording thread brackets pooled batches between
//! [`Context::begin_frame`] and [`Context::end_frame`], producing a [`Frame`]
//! that carries the buffer updates its batches generated. The frame crosses
//! to the render thread (optionally through [`create_frame_channel`]), where
//! [`Context::execute_frame`] applies the updates and hands the batches to a
//! [`Backend`].

mod backend;
mod context;
mod frame;
mod frame_channel;
pub mod logging;
mod pool;

#[cfg(test)]
mod tests;

pub use backend::{Backend, BackendError, ContextStats, NullBackend, NullBackendCounters};
pub use context::{Context, ContextConfig};
pub use frame::{Frame, FramebufferRecycler};
pub use frame_channel::{FrameChannelError, FrameReceiver, FrameSubmitter, create_frame_channel};
pub use logging::{LoggingConfig, init_logging};
pub use pool::{BatchPool, PooledBatch};
