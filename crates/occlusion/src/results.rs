use engine::OcclusionResultConsumer;
use protocol::{
    OcclusionFrame, OcclusionRecord, PrimitiveId, RenderFrameNumber, TileOcclusionState,
    ViewOcclusionResults,
};
use smallvec::SmallVec;
use tracing::trace;

/// Pixel fraction a previously occluded primitive must exceed before it is
/// reported visible again.
pub const DEFAULT_VISIBLE_PIXEL_THRESHOLD: f32 = 0.01;

/// Combine every buffered view's record for `primitive`.
///
/// Unavailable when any view lacks a fresh record or any record is not
/// definite. Otherwise occluded only if every view agrees; a primitive that
/// was occluded before needs more than `visible_pixel_threshold` of the view
/// to count as visible again.
pub fn evaluate_occlusion(
    views: &[ViewOcclusionResults],
    primitive: PrimitiveId,
    previously_occluded: bool,
    recency_cutoff: f64,
    visible_pixel_threshold: f32,
) -> TileOcclusionState {
    if views.is_empty() {
        return TileOcclusionState::Unavailable;
    }

    let mut records: SmallVec<[&OcclusionRecord; 4]> = SmallVec::with_capacity(views.len());
    for view in views {
        match view.history.get(&primitive) {
            Some(record) if !record.is_stale(recency_cutoff) => records.push(record),
            _ => return TileOcclusionState::Unavailable,
        }
    }
    if records
        .iter()
        .any(|record| !record.occlusion_state_was_definite)
    {
        return TileOcclusionState::Unavailable;
    }

    let visible_in_some_view = records.iter().any(|record| {
        if previously_occluded {
            record.last_pixels_percentage > visible_pixel_threshold
        } else {
            !record.was_occluded
        }
    });
    if visible_in_some_view {
        TileOcclusionState::NotOccluded
    } else {
        TileOcclusionState::Occluded
    }
}

/// Owner-thread view of the most recent occlusion frame.
pub struct OcclusionResults {
    consumer: OcclusionResultConsumer,
    current: Option<OcclusionFrame>,
    visible_pixel_threshold: f32,
    frames_received: u64,
}

impl OcclusionResults {
    pub fn new(consumer: OcclusionResultConsumer, visible_pixel_threshold: f32) -> Self {
        Self {
            consumer,
            current: None,
            visible_pixel_threshold,
            frames_received: 0,
        }
    }

    /// Swap in the newest published frame, recycling the one it replaces.
    /// Returns `false` when nothing new arrived.
    pub fn update(&mut self) -> bool {
        let Some(latest) = self.consumer.pop_latest() else {
            return false;
        };
        trace!(
            frame = latest.frame_number.0,
            views = latest.views.len(),
            records = latest.record_count(),
            "occlusion results received"
        );
        if let Some(previous) = self.current.replace(latest) {
            self.consumer.recycle(previous);
        }
        self.frames_received += 1;
        true
    }

    pub fn query_occlusion(
        &self,
        primitive: PrimitiveId,
        previously_occluded: bool,
        recency_cutoff: f64,
    ) -> TileOcclusionState {
        let Some(frame) = self.current.as_ref() else {
            return TileOcclusionState::Unavailable;
        };
        evaluate_occlusion(
            &frame.views,
            primitive,
            previously_occluded,
            recency_cutoff,
            self.visible_pixel_threshold,
        )
    }

    pub fn current_frame_number(&self) -> Option<RenderFrameNumber> {
        self.current.as_ref().map(|frame| frame.frame_number)
    }

    pub fn view_count(&self) -> usize {
        self.current.as_ref().map_or(0, |frame| frame.views.len())
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn consumer(&self) -> &OcclusionResultConsumer {
        &self.consumer
    }
}
