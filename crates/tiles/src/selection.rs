use std::collections::HashSet;

use crate::TileId;

/// Counters reported by the selection engine with every view update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectionStats {
    pub worker_thread_queue_length: u32,
    pub main_thread_queue_length: u32,
    pub tiles_visited: u32,
    pub culled_tiles_visited: u32,
    pub tiles_culled: u32,
    pub tiles_occluded: u32,
    pub tiles_waiting_for_occlusion: u32,
    pub max_depth_visited: u32,
}

/// The selection engine's decision for one tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewUpdateResult {
    pub tiles_to_render_this_frame: Vec<TileId>,
    pub tiles_fading_out: HashSet<TileId>,
    pub stats: SelectionStats,
    pub frame_number: u64,
}

impl ViewUpdateResult {
    pub fn rendered_count(&self) -> usize {
        self.tiles_to_render_this_frame.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TileSelectionState {
    #[default]
    None,
    Culled,
    Rendered,
    Refined,
}

/// Lifecycle callbacks the selection engine raises while traversing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileSelectionEvent {
    Visible {
        tile: TileId,
        previous: TileSelectionState,
        current: TileSelectionState,
    },
    Culled {
        tile: TileId,
        previous: TileSelectionState,
        current: TileSelectionState,
    },
    Refined {
        tile: TileId,
        previous: TileSelectionState,
        current: TileSelectionState,
        newly_rendered: Vec<TileId>,
    },
    Coarsened {
        tile: TileId,
        previous: TileSelectionState,
        current: TileSelectionState,
        newly_rendered: Vec<TileId>,
    },
}

impl TileSelectionEvent {
    pub fn tile(&self) -> TileId {
        match self {
            TileSelectionEvent::Visible { tile, .. }
            | TileSelectionEvent::Culled { tile, .. }
            | TileSelectionEvent::Refined { tile, .. }
            | TileSelectionEvent::Coarsened { tile, .. } => *tile,
        }
    }

    pub fn transition(&self) -> (TileSelectionState, TileSelectionState) {
        match self {
            TileSelectionEvent::Visible {
                previous, current, ..
            }
            | TileSelectionEvent::Culled {
                previous, current, ..
            }
            | TileSelectionEvent::Refined {
                previous, current, ..
            }
            | TileSelectionEvent::Coarsened {
                previous, current, ..
            } => (*previous, *current),
        }
    }

    /// Tiles that start rendering because of this event. `Visible` reports
    /// the tile itself.
    pub fn newly_rendered(&self) -> &[TileId] {
        match self {
            TileSelectionEvent::Visible { tile, .. } => std::slice::from_ref(tile),
            TileSelectionEvent::Culled { .. } => &[],
            TileSelectionEvent::Refined { newly_rendered, .. }
            | TileSelectionEvent::Coarsened { newly_rendered, .. } => newly_rendered,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TileSelectionEvent::Visible { .. } => "visible",
            TileSelectionEvent::Culled { .. } => "culled",
            TileSelectionEvent::Refined { .. } => "refined",
            TileSelectionEvent::Coarsened { .. } => "coarsened",
        }
    }
}
