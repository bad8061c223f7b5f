//! Turns the selection engine's per-frame decision into scene visibility,
//! collision and fade changes.

mod fade;

use std::collections::{BTreeSet, HashMap, HashSet};

pub use fade::{FadePhase, FadeState};

use render_protocol::{CollisionMode, InteractionPolicy, NodeId, SceneGraph};
use tiles::{TileId, ViewUpdateResult};
use tracing::{debug, trace, warn};

/// Owner-thread lookup from tile to its finalized scene node.
pub trait TileSceneLookup {
    /// Node of a tile that is `Done` and has render resources.
    fn rendered_node(&self, tile: TileId) -> Option<NodeId>;

    fn fade_percentage(&self, tile: TileId) -> f32;

    fn describe(&self, tile: TileId) -> String {
        format!("{tile:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub use_lod_transitions: bool,
    pub interaction: InteractionPolicy,
    pub shown_collision: CollisionMode,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            use_lod_transitions: false,
            interaction: InteractionPolicy::default(),
            shown_collision: CollisionMode::QueryAndPhysics,
        }
    }
}

/// Tiles scheduled to be hidden at the start of the next tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredHideList {
    tiles: BTreeSet<TileId>,
}

impl DeferredHideList {
    pub fn contains(&self, tile: TileId) -> bool {
        self.tiles.contains(&tile)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TileId> + '_ {
        self.tiles.iter().copied()
    }

    fn insert(&mut self, tile: TileId) {
        self.tiles.insert(tile);
    }

    fn remove(&mut self, tile: TileId) -> bool {
        self.tiles.remove(&tile)
    }

    fn take(&mut self) -> BTreeSet<TileId> {
        std::mem::take(&mut self.tiles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    /// Reselected before their deferred hide ran.
    pub rescued: usize,
    pub hidden: usize,
    pub shown: usize,
    pub newly_shown: usize,
    pub not_ready: usize,
    pub attach_failures: usize,
    pub deferred_for_next_tick: usize,
    pub fading_in: usize,
    pub fading_out: usize,
}

#[derive(Debug)]
pub struct VisibilityReconciler {
    config: ReconcilerConfig,
    deferred_hide: DeferredHideList,
    shown: HashSet<TileId>,
    fades: HashMap<TileId, FadeState>,
}

impl VisibilityReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            deferred_hide: DeferredHideList::default(),
            shown: HashSet::new(),
            fades: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn deferred_hide_list(&self) -> &DeferredHideList {
        &self.deferred_hide
    }

    pub fn is_shown(&self, tile: TileId) -> bool {
        self.shown.contains(&tile)
    }

    pub fn shown_count(&self) -> usize {
        self.shown.len()
    }

    pub fn fade_state(&self, tile: TileId) -> Option<FadeState> {
        if !self.shown.contains(&tile) {
            return None;
        }
        Some(self.fades.get(&tile).copied().unwrap_or(FadeState::STEADY))
    }

    /// Drop everything known about a tile that is being unloaded.
    pub fn forget(&mut self, tile: TileId) {
        self.deferred_hide.remove(tile);
        self.shown.remove(&tile);
        self.fades.remove(&tile);
    }

    pub fn tick<L, S>(&mut self, update: &ViewUpdateResult, tiles: &L, scene: &mut S) -> ReconcileReport
    where
        L: TileSceneLookup + ?Sized,
        S: SceneGraph + ?Sized,
    {
        let mut report = ReconcileReport::default();
        let render_set: HashSet<TileId> = update.tiles_to_render_this_frame.iter().copied().collect();

        for tile in &update.tiles_fading_out {
            if render_set.contains(tile) {
                continue;
            }
            if let Some(node) = tiles.rendered_node(*tile) {
                scene.set_collision(node, CollisionMode::NoCollision);
            }
        }

        for tile in &update.tiles_to_render_this_frame {
            if self.deferred_hide.remove(*tile) {
                report.rescued += 1;
            }
        }

        for tile in self.deferred_hide.take() {
            self.hide(tile, tiles, scene, &mut report);
        }

        if self.config.use_lod_transitions {
            self.advance_exit_fades(update, &render_set, tiles, scene, &mut report);
        }
        self.schedule_hides(update, &render_set, tiles);
        report.deferred_for_next_tick = self.deferred_hide.len();

        for tile in &update.tiles_to_render_this_frame {
            self.show(*tile, tiles, scene, &mut report);
        }

        if self.config.use_lod_transitions {
            self.update_entry_fades(update, tiles, scene, &mut report);
        }

        trace!(
            frame = update.frame_number,
            shown = report.shown,
            hidden = report.hidden,
            deferred = report.deferred_for_next_tick,
            "visibility reconciled"
        );
        report
    }

    fn hide<L, S>(&mut self, tile: TileId, tiles: &L, scene: &mut S, report: &mut ReconcileReport)
    where
        L: TileSceneLookup + ?Sized,
        S: SceneGraph + ?Sized,
    {
        self.shown.remove(&tile);
        self.fades.remove(&tile);
        let Some(node) = tiles.rendered_node(tile) else {
            return;
        };
        if !scene.is_visible(node) {
            debug!(tile = %tiles.describe(tile), "deferred hide of a tile that is not visible");
        }
        scene.set_visibility(node, false, true);
        scene.set_collision(node, CollisionMode::NoCollision);
        report.hidden += 1;
    }

    fn schedule_hides<L>(&mut self, update: &ViewUpdateResult, render_set: &HashSet<TileId>, tiles: &L)
    where
        L: TileSceneLookup + ?Sized,
    {
        for tile in &update.tiles_fading_out {
            if render_set.contains(tile) {
                continue;
            }
            let faded = !self.config.use_lod_transitions
                || self.fades.get(tile).is_some_and(FadeState::is_complete);
            if faded {
                self.deferred_hide.insert(*tile);
            }
        }

        // Shown tiles the engine dropped without a fade-out still leave the
        // scene the same way.
        let orphaned: Vec<TileId> = self
            .shown
            .iter()
            .copied()
            .filter(|tile| !render_set.contains(tile) && !update.tiles_fading_out.contains(tile))
            .collect();
        for tile in orphaned {
            trace!(tile = %tiles.describe(tile), "shown tile left selection without fading out");
            self.deferred_hide.insert(tile);
        }
    }

    fn show<L, S>(&mut self, tile: TileId, tiles: &L, scene: &mut S, report: &mut ReconcileReport)
    where
        L: TileSceneLookup + ?Sized,
        S: SceneGraph + ?Sized,
    {
        let Some(node) = tiles.rendered_node(tile) else {
            report.not_ready += 1;
            return;
        };

        if scene.parent(node).is_none() && !scene.attach(node, scene.root()) {
            warn!(tile = %tiles.describe(tile), "tile could not be attached to the scene root");
            report.attach_failures += 1;
        }

        if scene.interaction_policy(node) != Some(self.config.interaction) {
            scene.set_interaction_policy(node, self.config.interaction);
        }
        if !scene.is_visible(node) {
            report.newly_shown += 1;
        }
        scene.set_visibility(node, true, true);
        scene.set_collision(node, self.config.shown_collision);
        self.shown.insert(tile);
        report.shown += 1;
    }

    /// Exit progress is tracked here so a fade fraction that moves
    /// backwards cannot postpone a hide.
    fn advance_exit_fades<L, S>(
        &mut self,
        update: &ViewUpdateResult,
        render_set: &HashSet<TileId>,
        tiles: &L,
        scene: &mut S,
        report: &mut ReconcileReport,
    ) where
        L: TileSceneLookup + ?Sized,
        S: SceneGraph + ?Sized,
    {
        for tile in &update.tiles_fading_out {
            if render_set.contains(tile) || !self.shown.contains(tile) {
                continue;
            }
            let Some(node) = tiles.rendered_node(*tile) else {
                continue;
            };
            let state = FadeState::exiting(self.fades.get(tile).copied(), tiles.fade_percentage(*tile));
            scene.set_fade(node, state.progress, false);
            self.fades.insert(*tile, state);
            report.fading_out += 1;
        }
    }

    fn update_entry_fades<L, S>(
        &mut self,
        update: &ViewUpdateResult,
        tiles: &L,
        scene: &mut S,
        report: &mut ReconcileReport,
    ) where
        L: TileSceneLookup + ?Sized,
        S: SceneGraph + ?Sized,
    {
        for tile in &update.tiles_to_render_this_frame {
            let Some(node) = tiles.rendered_node(*tile) else {
                continue;
            };
            let state = FadeState::entering(tiles.fade_percentage(*tile));
            if state.phase == FadePhase::Entering {
                report.fading_in += 1;
            }
            scene.set_fade(node, state.progress, true);
            self.fades.insert(*tile, state);
        }
    }
}
