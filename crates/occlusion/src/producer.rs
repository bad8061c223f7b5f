use engine::{OcclusionResultProducer, PushOutcome};
use protocol::{
    OcclusionFrame, OcclusionRecord, PrimitiveId, RenderFrameNumber, ViewId, ViewOcclusionResults,
};
use tracing::trace;

/// What the renderer exposes about one view after rendering it.
#[derive(Debug, Clone, Copy)]
pub struct RenderedView<'a> {
    pub view_id: ViewId,
    /// Views without persistent renderer state keep no occlusion history.
    pub has_view_state: bool,
    pub render_time: f64,
    pub history: &'a [OcclusionRecord],
    /// Primitives rejected by the view frustum this frame.
    pub primitives_outside_frustum: &'a [PrimitiveId],
}

/// Render-thread side: turns per-view renderer history into frames and
/// publishes them through the result channel.
pub struct OcclusionFeedbackProducer {
    channel: OcclusionResultProducer,
    aggregate: Option<OcclusionFrame>,
}

impl OcclusionFeedbackProducer {
    pub fn new(channel: OcclusionResultProducer) -> Self {
        Self {
            channel,
            aggregate: None,
        }
    }

    /// Copy each rendered view's history into channel storage.
    ///
    /// Frustum-culled primitives are recorded as definitely occluded at the
    /// view's render time. A primitive with no record at all stays absent,
    /// which the consumer reads as unavailable.
    pub fn collect(
        &mut self,
        frame_number: RenderFrameNumber,
        views: &[RenderedView<'_>],
    ) -> OcclusionFrame {
        let mut frame = OcclusionFrame::new(frame_number);
        for view in views {
            if !view.has_view_state {
                continue;
            }
            let mut history = self.channel.acquire_storage();
            history.reserve(view.history.len() + view.primitives_outside_frustum.len());
            for record in view.history {
                history.insert(record.primitive_id, *record);
            }
            for primitive in view.primitives_outside_frustum {
                history.insert(
                    *primitive,
                    OcclusionRecord::outside_frustum(*primitive, view.render_time),
                );
            }
            frame.views.push(ViewOcclusionResults {
                view_id: view.view_id,
                history,
            });
        }
        frame
    }

    /// Fold one rendered view family into the current frame's aggregate.
    /// The first family of a new frame publishes the previous aggregate.
    pub fn post_render_view_family(
        &mut self,
        frame_number: RenderFrameNumber,
        views: &[RenderedView<'_>],
    ) -> Option<PushOutcome> {
        let mut outcome = None;
        if self
            .aggregate
            .as_ref()
            .is_some_and(|aggregate| aggregate.frame_number != frame_number)
        {
            outcome = self.publish_aggregate();
        }

        let collected = self.collect(frame_number, views);
        match self.aggregate.as_mut() {
            None => self.aggregate = Some(collected),
            Some(aggregate) => {
                for view in collected.views {
                    match aggregate
                        .views
                        .iter_mut()
                        .find(|existing| existing.view_id == view.view_id)
                    {
                        Some(existing) => {
                            let previous = std::mem::replace(existing, view);
                            self.channel.release_storage(previous.history);
                        }
                        None => aggregate.views.push(view),
                    }
                }
            }
        }
        outcome
    }

    /// Publish the current aggregate, or retry a frame the channel parked.
    pub fn flush(&mut self) -> Option<PushOutcome> {
        match self.publish_aggregate() {
            Some(outcome) => Some(outcome),
            None => self.channel.flush_parked(),
        }
    }

    fn publish_aggregate(&mut self) -> Option<PushOutcome> {
        let frame = self.aggregate.take()?;
        if frame.is_empty() {
            trace!(frame = frame.frame_number.0, "no view kept occlusion state");
            return None;
        }
        Some(self.channel.push(frame))
    }

    pub fn channel(&self) -> &OcclusionResultProducer {
        &self.channel
    }
}
