use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use smallvec::SmallVec;

pub trait DedupKey {
    type Key: Eq + Hash;

    fn dedup_key(&self) -> Self::Key;
}

/// Renderer-side identity of one primitive (a tile mesh or an occlusion proxy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RenderFrameNumber(pub u64);

/// What the renderer remembered about one primitive in one view.
///
/// Times are render-thread seconds. A record is immutable once it has been
/// placed into an [`OcclusionFrame`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcclusionRecord {
    pub primitive_id: PrimitiveId,
    pub last_considered_time: f64,
    pub last_pixels_percentage: f32,
    pub occlusion_state_was_definite: bool,
    pub was_occluded: bool,
}

impl OcclusionRecord {
    /// Record for a primitive the view rejected by frustum test. The renderer
    /// issues no occlusion query for it, so it is reported as definitely
    /// occluded at the time the view was rendered.
    pub fn outside_frustum(primitive_id: PrimitiveId, considered_at: f64) -> Self {
        Self {
            primitive_id,
            last_considered_time: considered_at,
            last_pixels_percentage: 0.0,
            occlusion_state_was_definite: true,
            was_occluded: true,
        }
    }

    pub fn is_stale(&self, recency_cutoff: f64) -> bool {
        self.last_considered_time < recency_cutoff
    }
}

/// Reusable storage block for one view's records.
pub type OcclusionHistory = HashMap<PrimitiveId, OcclusionRecord>;

#[derive(Debug, Clone, PartialEq)]
pub struct ViewOcclusionResults {
    pub view_id: ViewId,
    pub history: OcclusionHistory,
}

impl DedupKey for ViewOcclusionResults {
    type Key = ViewId;

    fn dedup_key(&self) -> Self::Key {
        self.view_id
    }
}

/// All views rendered during one render-thread frame, in arrival order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OcclusionFrame {
    pub frame_number: RenderFrameNumber,
    pub views: SmallVec<[ViewOcclusionResults; 4]>,
}

impl OcclusionFrame {
    pub fn new(frame_number: RenderFrameNumber) -> Self {
        Self {
            frame_number,
            views: SmallVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.views.iter().map(|view| view.history.len()).sum()
    }

    /// Give the backing storage of every view back for reuse.
    pub fn into_storage(self) -> impl Iterator<Item = OcclusionHistory> {
        self.views.into_iter().map(|view| view.history)
    }

    /// Coalesce a newer frame over one that was never consumed.
    ///
    /// Views present in `newer` replace the same view in `current`; views only
    /// rendered in `current` are kept, their records age out through the
    /// recency cutoff. Storage of replaced views is appended to `displaced`.
    pub fn merge_mailbox(
        mut current: Self,
        newer: Self,
        displaced: &mut Vec<OcclusionHistory>,
    ) -> Self {
        current.frame_number = current.frame_number.max(newer.frame_number);
        merge_replacing_by_key(&mut current.views, newer.views, displaced);
        current
    }
}

fn merge_replacing_by_key(
    current: &mut SmallVec<[ViewOcclusionResults; 4]>,
    incoming: SmallVec<[ViewOcclusionResults; 4]>,
    displaced: &mut Vec<OcclusionHistory>,
) {
    let mut seen = HashSet::with_capacity(incoming.len());
    for item in incoming {
        let key = item.dedup_key();
        if !seen.insert(key) {
            // Duplicate view inside one frame: first arrival wins.
            displaced.push(item.history);
            continue;
        }
        match current.iter_mut().find(|existing| existing.dedup_key() == key) {
            Some(existing) => {
                let previous = std::mem::replace(existing, item);
                displaced.push(previous.history);
            }
            None => current.push(item),
        }
    }
}

/// Answer to "is this primitive occluded as of a recency cutoff".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TileOcclusionState {
    #[default]
    Unavailable,
    Occluded,
    NotOccluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadFailureKind {
    TilesetJson,
    TileContent,
    RasterOverlay,
    Unknown,
}

impl fmt::Display for LoadFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoadFailureKind::TilesetJson => "tileset json",
            LoadFailureKind::TileContent => "tile content",
            LoadFailureKind::RasterOverlay => "raster overlay",
            LoadFailureKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Side-channel notification for failures surfaced by the streaming engine.
/// Retrying is the engine's business; consumers only observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub kind: LoadFailureKind,
    pub status_code: u16,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(view_id: u32, primitives: &[(u64, f64)]) -> ViewOcclusionResults {
        let mut history = OcclusionHistory::new();
        for (primitive, time) in primitives {
            let id = PrimitiveId(*primitive);
            history.insert(id, OcclusionRecord::outside_frustum(id, *time));
        }
        ViewOcclusionResults {
            view_id: ViewId(view_id),
            history,
        }
    }

    fn frame(number: u64, views: Vec<ViewOcclusionResults>) -> OcclusionFrame {
        OcclusionFrame {
            frame_number: RenderFrameNumber(number),
            views: views.into_iter().collect(),
        }
    }

    #[test]
    fn mailbox_merge_replaces_same_view_and_keeps_others() {
        let current = frame(3, vec![view(0, &[(1, 1.0)]), view(1, &[(2, 1.0)])]);
        let newer = frame(4, vec![view(1, &[(2, 2.0), (3, 2.0)])]);
        let mut displaced = Vec::new();

        let merged = OcclusionFrame::merge_mailbox(current, newer, &mut displaced);

        assert_eq!(merged.frame_number, RenderFrameNumber(4));
        assert_eq!(merged.views.len(), 2);
        assert_eq!(merged.views[0].view_id, ViewId(0));
        assert_eq!(merged.views[1].history.len(), 2);
        assert_eq!(displaced.len(), 1);
    }

    #[test]
    fn mailbox_merge_never_regresses_frame_number() {
        let current = frame(9, vec![view(0, &[(1, 1.0)])]);
        let older = frame(2, vec![]);
        let mut displaced = Vec::new();

        let merged = OcclusionFrame::merge_mailbox(current, older, &mut displaced);

        assert_eq!(merged.frame_number, RenderFrameNumber(9));
        assert!(displaced.is_empty());
    }

    #[test]
    fn duplicate_view_within_incoming_frame_is_displaced() {
        let current = frame(1, vec![]);
        let newer = frame(2, vec![view(5, &[(1, 1.0)]), view(5, &[(2, 1.0)])]);
        let mut displaced = Vec::new();

        let merged = OcclusionFrame::merge_mailbox(current, newer, &mut displaced);

        assert_eq!(merged.views.len(), 1);
        assert!(merged.views[0].history.contains_key(&PrimitiveId(1)));
        assert_eq!(displaced.len(), 1);
    }

    #[test]
    fn staleness_is_strictly_older_than_cutoff() {
        let record = OcclusionRecord::outside_frustum(PrimitiveId(1), 10.0);
        assert!(record.is_stale(12.0));
        assert!(!record.is_stale(10.0));
        assert!(!record.is_stale(9.5));
    }
}
