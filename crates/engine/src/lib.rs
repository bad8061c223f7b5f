use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use protocol::{OcclusionFrame, OcclusionHistory};
use rtrb::{Consumer, PopError, Producer, PushError, RingBuffer};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultChannelConfig {
    /// Frames that may be in flight between render and owner thread.
    pub frame_capacity: usize,
    /// Storage blocks the owner thread may hand back before the producer
    /// picks them up.
    pub recycle_capacity: usize,
}

impl Default for ResultChannelConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 2,
            recycle_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// The ring was full; the frame is parked on the producer and merged with
    /// whatever is pushed next.
    Coalesced,
}

#[derive(Debug, Default)]
struct ChannelStats {
    allocations: AtomicU64,
    frames_pushed: AtomicU64,
    frames_coalesced: AtomicU64,
    storage_recycled: AtomicU64,
    storage_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultChannelStats {
    pub allocations: u64,
    pub frames_pushed: u64,
    pub frames_coalesced: u64,
    pub storage_recycled: u64,
    pub storage_dropped: u64,
}

impl ChannelStats {
    fn snapshot(&self) -> ResultChannelStats {
        ResultChannelStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_coalesced: self.frames_coalesced.load(Ordering::Relaxed),
            storage_recycled: self.storage_recycled.load(Ordering::Relaxed),
            storage_dropped: self.storage_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Render-thread end of the result channel.
///
/// Never blocks: when the owner thread has not drained the ring the frame is
/// parked here and coalesced with the next one.
pub struct OcclusionResultProducer {
    frames: Producer<OcclusionFrame>,
    recycled: Consumer<OcclusionHistory>,
    free_storage: Vec<OcclusionHistory>,
    parked: Option<OcclusionFrame>,
    stats: Arc<ChannelStats>,
    // One producer only; the handle moves to the render thread but is never shared.
    _not_sync: PhantomData<Cell<()>>,
}

impl OcclusionResultProducer {
    /// Storage for the next view, reused from the owner thread when possible.
    pub fn acquire_storage(&mut self) -> OcclusionHistory {
        while let Ok(storage) = self.recycled.pop() {
            self.free_storage.push(storage);
        }
        match self.free_storage.pop() {
            Some(mut storage) => {
                storage.clear();
                storage
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                trace!("occlusion channel allocating storage block");
                OcclusionHistory::new()
            }
        }
    }

    /// Return storage the render thread filled but will not send.
    pub fn release_storage(&mut self, storage: OcclusionHistory) {
        self.free_storage.push(storage);
    }

    pub fn push(&mut self, frame: OcclusionFrame) -> PushOutcome {
        let frame = match self.parked.take() {
            None => frame,
            Some(parked) => {
                let mut displaced = Vec::new();
                let merged = OcclusionFrame::merge_mailbox(parked, frame, &mut displaced);
                self.free_storage.extend(displaced);
                merged
            }
        };
        match self.frames.push(frame) {
            Ok(()) => {
                self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Sent
            }
            Err(PushError::Full(frame)) => {
                self.stats.frames_coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(
                    frame_number = frame.frame_number.0,
                    "occlusion channel full, coalescing frame"
                );
                self.parked = Some(frame);
                PushOutcome::Coalesced
            }
        }
    }

    /// Retry a parked frame without supplying a new one.
    pub fn flush_parked(&mut self) -> Option<PushOutcome> {
        let parked = self.parked.take()?;
        match self.frames.push(parked) {
            Ok(()) => {
                self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                Some(PushOutcome::Sent)
            }
            Err(PushError::Full(parked)) => {
                self.parked = Some(parked);
                Some(PushOutcome::Coalesced)
            }
        }
    }

    pub fn has_parked_frame(&self) -> bool {
        self.parked.is_some()
    }

    pub fn stats(&self) -> ResultChannelStats {
        self.stats.snapshot()
    }
}

/// Owner-thread end of the result channel.
pub struct OcclusionResultConsumer {
    frames: Consumer<OcclusionFrame>,
    recycle: Producer<OcclusionHistory>,
    stats: Arc<ChannelStats>,
    _not_sync: PhantomData<Cell<()>>,
}

impl OcclusionResultConsumer {
    /// Pop the oldest frame in the ring.
    pub fn pop(&mut self) -> Option<OcclusionFrame> {
        match self.frames.pop() {
            Ok(frame) => Some(frame),
            Err(PopError::Empty) => None,
        }
    }

    /// Drain the ring and keep only the newest frame; superseded frames are
    /// recycled immediately.
    pub fn pop_latest(&mut self) -> Option<OcclusionFrame> {
        let mut latest = self.pop()?;
        while let Some(newer) = self.pop() {
            let superseded = std::mem::replace(&mut latest, newer);
            self.recycle(superseded);
        }
        Some(latest)
    }

    /// Hand the storage of a fully processed frame back to the producer.
    /// Blocks that do not fit in the recycle ring are freed.
    pub fn recycle(&mut self, frame: OcclusionFrame) {
        for storage in frame.into_storage() {
            self.recycle_storage(storage);
        }
    }

    pub fn recycle_storage(&mut self, storage: OcclusionHistory) {
        match self.recycle.push(storage) {
            Ok(()) => {
                self.stats.storage_recycled.fetch_add(1, Ordering::Relaxed);
            }
            Err(PushError::Full(_storage)) => {
                self.stats.storage_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("occlusion recycle ring full, freeing storage block");
            }
        }
    }

    pub fn pending_frames(&self) -> usize {
        self.frames.slots()
    }

    pub fn stats(&self) -> ResultChannelStats {
        self.stats.snapshot()
    }
}

pub fn create_result_channel(
    config: ResultChannelConfig,
) -> (OcclusionResultProducer, OcclusionResultConsumer) {
    assert!(
        config.frame_capacity > 0,
        "occlusion frame capacity must be greater than zero"
    );
    assert!(
        config.recycle_capacity > 0,
        "occlusion recycle capacity must be greater than zero"
    );

    let stats = Arc::new(ChannelStats::default());
    let (frame_producer, frame_consumer) = RingBuffer::new(config.frame_capacity);
    let (recycle_producer, recycle_consumer) = RingBuffer::new(config.recycle_capacity);

    let producer = OcclusionResultProducer {
        frames: frame_producer,
        recycled: recycle_consumer,
        free_storage: Vec::new(),
        parked: None,
        stats: stats.clone(),
        _not_sync: PhantomData,
    };
    let consumer = OcclusionResultConsumer {
        frames: frame_consumer,
        recycle: recycle_producer,
        stats,
        _not_sync: PhantomData,
    };
    (producer, consumer)
}
