mod content;
mod lifecycle;
mod selection;

pub use content::{
    ContentKind, MeshContent, MeshPrimitive, PointCloudContent, TileContent, TileLoadResult,
};
pub use lifecycle::{
    DeferredDestructionQueue, DestructionPumpReport, DestructionReadiness, DestructionStage,
};
pub use selection::{SelectionStats, TileSelectionEvent, TileSelectionState, ViewUpdateResult};

use slotmap::SlotMap;
use thiserror::Error;

slotmap::new_key_type! {
    /// Generation-checked handle to a tile. A handle outlives nothing: once the
    /// tile is removed every copy of the handle stops resolving.
    pub struct TileId;
}

pub type TransformMatrix4x4 = [f64; 16];

pub const IDENTITY_TRANSFORM: TransformMatrix4x4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileLoadState {
    Unloaded,
    ContentLoading,
    ContentLoaded,
    Done,
    Unloading,
    Failed,
}

impl TileLoadState {
    pub fn can_advance_to(self, next: TileLoadState) -> bool {
        use TileLoadState::*;
        matches!(
            (self, next),
            (Unloaded, ContentLoading)
                | (ContentLoading, ContentLoaded)
                | (ContentLoading, Failed)
                | (ContentLoaded, Done)
                | (ContentLoaded, Unloading)
                | (Done, Unloading)
                | (Failed, Unloading)
                | (Unloading, Unloaded)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TileStateError {
    #[error("tile is no longer present in the arena")]
    Stale,
    #[error("illegal tile state transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: TileLoadState,
        to: TileLoadState,
    },
}

/// One streamable unit as seen by this crate. `R` is the owner-thread render
/// resource that the preparation bridge stores once a tile is finalized.
#[derive(Debug)]
pub struct Tile<R> {
    label: String,
    state: TileLoadState,
    content_kind: ContentKind,
    transform: TransformMatrix4x4,
    fade_percentage: f32,
    render_resources: Option<R>,
}

impl<R> Tile<R> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> TileLoadState {
        self.state
    }

    pub fn content_kind(&self) -> ContentKind {
        self.content_kind
    }

    pub fn set_content_kind(&mut self, kind: ContentKind) {
        self.content_kind = kind;
    }

    pub fn transform(&self) -> &TransformMatrix4x4 {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: TransformMatrix4x4) {
        self.transform = transform;
    }

    /// LOD transition progress reported by the selection engine, in [0, 1].
    pub fn fade_percentage(&self) -> f32 {
        self.fade_percentage
    }

    pub fn set_fade_percentage(&mut self, percentage: f32) {
        self.fade_percentage = if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 1.0)
        };
    }

    /// Render resources, only while the tile is `Done`.
    pub fn render_resources(&self) -> Option<&R> {
        if self.state != TileLoadState::Done {
            return None;
        }
        self.render_resources.as_ref()
    }

    pub fn render_resources_mut(&mut self) -> Option<&mut R> {
        if self.state != TileLoadState::Done {
            return None;
        }
        self.render_resources.as_mut()
    }

    pub fn set_render_resources(&mut self, resources: Option<R>) -> Option<R> {
        std::mem::replace(&mut self.render_resources, resources)
    }

    pub fn take_render_resources(&mut self) -> Option<R> {
        self.render_resources.take()
    }

    pub fn advance_to(&mut self, next: TileLoadState) -> Result<(), TileStateError> {
        if !self.state.can_advance_to(next) {
            return Err(TileStateError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug)]
pub struct TileArena<R> {
    tiles: SlotMap<TileId, Tile<R>>,
}

impl<R> Default for TileArena<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> TileArena<R> {
    pub fn new() -> Self {
        Self {
            tiles: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, label: impl Into<String>) -> TileId {
        self.tiles.insert(Tile {
            label: label.into(),
            state: TileLoadState::Unloaded,
            content_kind: ContentKind::Empty,
            transform: IDENTITY_TRANSFORM,
            fade_percentage: 0.0,
            render_resources: None,
        })
    }

    pub fn remove(&mut self, tile: TileId) -> Option<Tile<R>> {
        self.tiles.remove(tile)
    }

    pub fn contains(&self, tile: TileId) -> bool {
        self.tiles.contains_key(tile)
    }

    pub fn get(&self, tile: TileId) -> Option<&Tile<R>> {
        self.tiles.get(tile)
    }

    pub fn get_mut(&mut self, tile: TileId) -> Option<&mut Tile<R>> {
        self.tiles.get_mut(tile)
    }

    pub fn advance(&mut self, tile: TileId, next: TileLoadState) -> Result<(), TileStateError> {
        self.tiles
            .get_mut(tile)
            .ok_or(TileStateError::Stale)?
            .advance_to(next)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TileId, &Tile<R>)> {
        self.tiles.iter()
    }

    pub fn label(&self, tile: TileId) -> &str {
        self.tiles
            .get(tile)
            .map(|tile| tile.label.as_str())
            .unwrap_or("<stale tile>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_tile_handles_stop_resolving() {
        let mut arena = TileArena::<u32>::new();
        let first = arena.insert("L0-X0-Y0");
        arena.remove(first);
        let second = arena.insert("L0-X0-Y1");

        assert!(!arena.contains(first));
        assert!(arena.contains(second));
        assert_ne!(first, second);
        assert_eq!(arena.label(first), "<stale tile>");
    }

    #[test]
    fn lifecycle_follows_load_order() {
        let mut arena = TileArena::<u32>::new();
        let tile = arena.insert("root");

        for next in [
            TileLoadState::ContentLoading,
            TileLoadState::ContentLoaded,
            TileLoadState::Done,
            TileLoadState::Unloading,
            TileLoadState::Unloaded,
        ] {
            arena.advance(tile, next).expect("legal transition");
        }
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut arena = TileArena::<u32>::new();
        let tile = arena.insert("root");

        let error = arena
            .advance(tile, TileLoadState::Done)
            .expect_err("unloaded tile cannot become done");

        assert_eq!(
            error,
            TileStateError::IllegalTransition {
                from: TileLoadState::Unloaded,
                to: TileLoadState::Done,
            }
        );
    }

    #[test]
    fn render_resources_are_hidden_unless_done() {
        let mut arena = TileArena::<u32>::new();
        let id = arena.insert("root");
        let tile = arena.get_mut(id).expect("tile");
        tile.set_render_resources(Some(7));
        assert_eq!(tile.render_resources(), None);

        tile.advance_to(TileLoadState::ContentLoading).expect("load");
        tile.advance_to(TileLoadState::ContentLoaded).expect("loaded");
        tile.advance_to(TileLoadState::Done).expect("done");
        assert_eq!(tile.render_resources(), Some(&7));
    }

    #[test]
    fn fade_percentage_is_clamped() {
        let mut arena = TileArena::<u32>::new();
        let id = arena.insert("root");
        let tile = arena.get_mut(id).expect("tile");

        tile.set_fade_percentage(1.5);
        assert_eq!(tile.fade_percentage(), 1.0);
        tile.set_fade_percentage(f32::NAN);
        assert_eq!(tile.fade_percentage(), 0.0);
    }
}
