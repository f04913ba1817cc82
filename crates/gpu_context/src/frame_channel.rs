use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use thiserror::Error;

use crate::{Context, Frame};

#[derive(Debug, Error)]
pub enum FrameChannelError {
    /// The ring is full; the frame is handed back untouched.
    #[error("frame channel is full")]
    Full(Arc<Frame>),
    #[error("frame receiver was dropped")]
    Disconnected,
}

/// Recording-thread end of the frame hand-off ring. Single producer: the
/// ring endpoint is neither `Clone` nor `Sync`.
pub struct FrameSubmitter {
    producer: Producer<Arc<Frame>>,
    notify_sender: Sender<()>,
}

/// Render-thread end of the frame hand-off ring.
pub struct FrameReceiver {
    consumer: Consumer<Arc<Frame>>,
    notify_receiver: Receiver<()>,
}

pub fn create_frame_channel(capacity: usize) -> (FrameSubmitter, FrameReceiver) {
    assert!(capacity > 0, "frame channel capacity must be greater than zero");
    let (producer, consumer) = RingBuffer::new(capacity);
    let (notify_sender, notify_receiver) = bounded(1);
    (
        FrameSubmitter {
            producer,
            notify_sender,
        },
        FrameReceiver {
            consumer,
            notify_receiver,
        },
    )
}

impl FrameSubmitter {
    pub fn submit(&mut self, frame: Arc<Frame>) -> Result<(), FrameChannelError> {
        if self.producer.is_abandoned() {
            return Err(FrameChannelError::Disconnected);
        }
        match self.producer.push(frame) {
            Ok(()) => {}
            Err(PushError::Full(frame)) => return Err(FrameChannelError::Full(frame)),
        }
        match self.notify_sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Disconnected(())) => Err(FrameChannelError::Disconnected),
        }
    }

    pub fn free_slots(&self) -> usize {
        self.producer.slots()
    }
}

impl FrameReceiver {
    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }

    /// Pops every queued frame and returns the newest. Skipped frames still
    /// have their buffer updates consumed, oldest first, so the render
    /// shadows stay in sequence.
    pub fn take_latest(&mut self, context: &Context) -> Option<Arc<Frame>> {
        let mut latest: Option<Arc<Frame>> = None;
        while let Ok(frame) = self.consumer.pop() {
            if let Some(skipped) = latest.replace(frame) {
                log::debug!("skipping frame #{}", skipped.frame_index);
                context.consume_frame_updates(&skipped);
            }
        }
        latest
    }

    /// Like [`FrameReceiver::take_latest`], but waits up to `timeout` for a
    /// frame when the ring is empty.
    pub fn wait_latest(&mut self, context: &Context, timeout: Duration) -> Option<Arc<Frame>> {
        if let Some(frame) = self.take_latest(context) {
            return Some(frame);
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.notify_receiver.recv_timeout(remaining) {
                Ok(()) => {
                    if let Some(frame) = self.take_latest(context) {
                        return Some(frame);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    return self.take_latest(context);
                }
            }
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

impl Context {
    /// Builds a frame hand-off ring sized from the context configuration.
    pub fn frame_channel(&self) -> (FrameSubmitter, FrameReceiver) {
        create_frame_channel(self.config().frame_channel_capacity)
    }
}
