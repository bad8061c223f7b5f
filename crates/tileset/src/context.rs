use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use engine::create_result_channel;
use frame_scheduler::{FinalizeScheduler, FinalizeSchedulerDecision, FinalizeSchedulerInput};
use occlusion::{
    OcclusionFeedbackProducer, OcclusionProxyFactory, OcclusionProxyPool, OcclusionResults,
    ProxyHandle,
};
use protocol::{LoadFailure, LoadFailureKind, PrimitiveId, TileOcclusionState};
use render_protocol::{NodeId, OverlayPlacement, OverlaySlot, RetiredResource, SceneGraph};
use renderer::{
    OverlayTexture, PrepareError, ReleaseOutcome, ResourcePreparationBridge,
    StagedOverlayTexture, TileLifecycleObserver, TileNode, WorkerStagedResult,
};
use tiles::{
    DestructionPumpReport, DestructionReadiness, SelectionStats, TileArena, TileId,
    TileLoadState, TileSelectionEvent, TileStateError, TransformMatrix4x4, ViewUpdateResult,
};
use tracing::{debug, error, info, trace, warn};
use visibility::{ReconcileReport, TileSceneLookup, VisibilityReconciler};

use crate::staging::{StagedTile, StagingQueue, StagingSender};
use crate::{TilesetConfig, TilesetError};

/// Consumers that track where newly rendered tiles sit (height queries,
/// object placement).
pub trait PlacementObserver {
    fn on_tiles_rendered(&mut self, tiles: &[TileId]);
}

/// What one owner-thread tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub occlusion_frame_received: bool,
    pub finalize: FinalizeSchedulerDecision,
    pub finalized: usize,
    pub finalized_empty: usize,
    pub discarded_stale: usize,
    pub failed: usize,
    /// Staged results still waiting after this tick's budget ran out.
    pub main_thread_queue_length: usize,
    pub stats_logged: bool,
    pub reconcile: ReconcileReport,
    pub destruction: DestructionPumpReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoggedSelection {
    rendered: usize,
    stats: SelectionStats,
}

struct OcclusionFeature {
    results: OcclusionResults,
    proxies: OcclusionProxyPool<Box<dyn OcclusionProxyFactory>>,
}

struct ArenaLookup<'a>(&'a TileArena<TileNode>);

impl TileSceneLookup for ArenaLookup<'_> {
    fn rendered_node(&self, tile: TileId) -> Option<NodeId> {
        self.0.get(tile)?.render_resources().map(TileNode::node)
    }

    fn fade_percentage(&self, tile: TileId) -> f32 {
        self.0.get(tile).map_or(1.0, |tile| tile.fade_percentage())
    }

    fn describe(&self, tile: TileId) -> String {
        self.0.label(tile).to_owned()
    }
}

/// Everything one tileset needs on the owner thread. Constructed by whoever
/// drives the per-frame update and torn down with [`TilesetContext::shutdown`].
pub struct TilesetContext<S: SceneGraph> {
    config: TilesetConfig,
    tiles: TileArena<TileNode>,
    scene: S,
    bridge: ResourcePreparationBridge,
    reconciler: VisibilityReconciler,
    scheduler: FinalizeScheduler,
    staging: StagingQueue,
    occlusion: Option<OcclusionFeature>,
    placement_observers: Vec<Box<dyn PlacementObserver>>,
    failure_sender: Sender<LoadFailure>,
    failure_receiver: Receiver<LoadFailure>,
    dropped_failures: u64,
    last_logged_selection: Option<LoggedSelection>,
    last_finalize_micros: Option<u64>,
    tick: u64,
}

impl<S: SceneGraph> TilesetContext<S> {
    /// The calling thread becomes the owner thread.
    pub fn new(config: TilesetConfig, scene: S) -> Result<Self, TilesetError> {
        config.validate()?;
        let (failure_sender, failure_receiver) =
            crossbeam_channel::bounded(config.failure_channel_capacity);
        debug!(?config, "tileset context created");
        Ok(Self {
            tiles: TileArena::new(),
            scene,
            bridge: ResourcePreparationBridge::new(),
            reconciler: VisibilityReconciler::new(config.reconciler_config()),
            scheduler: FinalizeScheduler::new(config.finalize_scheduler_config()),
            staging: StagingQueue::new(config.prepare_options()),
            occlusion: None,
            placement_observers: Vec::new(),
            failure_sender,
            failure_receiver,
            dropped_failures: 0,
            last_logged_selection: None,
            last_finalize_micros: None,
            tick: 0,
            config,
        })
    }

    pub fn config(&self) -> &TilesetConfig {
        &self.config
    }

    pub fn tiles(&self) -> &TileArena<TileNode> {
        &self.tiles
    }

    pub fn tiles_mut(&mut self) -> &mut TileArena<TileNode> {
        &mut self.tiles
    }

    pub fn scene(&self) -> &S {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut S {
        &mut self.scene
    }

    pub fn bridge(&self) -> &ResourcePreparationBridge {
        &self.bridge
    }

    pub fn reconciler(&self) -> &VisibilityReconciler {
        &self.reconciler
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn add_lifecycle_observer(&mut self, observer: Box<dyn TileLifecycleObserver>) {
        self.bridge.add_observer(observer);
    }

    pub fn add_placement_observer(&mut self, observer: Box<dyn PlacementObserver>) {
        self.placement_observers.push(observer);
    }

    /// Handle for worker threads running the preparation phase.
    pub fn staging_sender(&self) -> StagingSender {
        self.staging.sender()
    }

    pub fn pending_finalizations(&self) -> usize {
        self.staging.len()
    }

    pub fn insert_tile(&mut self, label: impl Into<String>, transform: TransformMatrix4x4) -> TileId {
        let tile = self.tiles.insert(label);
        if let Some(entry) = self.tiles.get_mut(tile) {
            entry.set_transform(transform);
        }
        tile
    }

    /// Mark a tile as handed to the worker phase.
    pub fn begin_loading(&mut self, tile: TileId) -> Result<(), TilesetError> {
        self.tiles.advance(tile, TileLoadState::ContentLoading)?;
        trace!(tile = ?tile, label = self.tiles.label(tile), "tile content loading");
        Ok(())
    }

    /// LOD transition progress reported by the selection engine, `0.0` to
    /// `1.0`. Fading-out tiles are hidden once their exit fade completes.
    pub fn set_fade_percentage(&mut self, tile: TileId, percentage: f32) -> Result<(), TilesetError> {
        let entry = self.tiles.get_mut(tile).ok_or(TileStateError::Stale)?;
        entry.set_fade_percentage(percentage);
        Ok(())
    }

    /// Set up occlusion feedback. Returns the render-thread producer, or
    /// `None` when occlusion is disabled in the config.
    pub fn enable_occlusion(
        &mut self,
        factory: Box<dyn OcclusionProxyFactory>,
    ) -> Option<OcclusionFeedbackProducer> {
        if !self.config.occlusion.enabled {
            debug!("occlusion feedback disabled by config");
            return None;
        }
        if let Some(mut previous) = self.occlusion.take() {
            previous.proxies.destroy_all();
        }
        let (producer, consumer) = create_result_channel(self.config.result_channel_config());
        self.occlusion = Some(OcclusionFeature {
            results: OcclusionResults::new(consumer, self.config.occlusion.visible_pixel_threshold),
            proxies: OcclusionProxyPool::new(factory, self.config.occlusion.proxy_pool_size),
        });
        Some(OcclusionFeedbackProducer::new(producer))
    }

    pub fn query_occlusion(
        &self,
        primitive: PrimitiveId,
        previously_occluded: bool,
        recency_cutoff: f64,
    ) -> TileOcclusionState {
        self.occlusion
            .as_ref()
            .map_or(TileOcclusionState::Unavailable, |occlusion| {
                occlusion
                    .results
                    .query_occlusion(primitive, previously_occluded, recency_cutoff)
            })
    }

    /// Bind an occlusion proxy to `tile`. `None` when occlusion is off or
    /// the pool is exhausted.
    pub fn create_proxy(&mut self, tile: TileId, now: f64) -> Option<ProxyHandle> {
        self.occlusion.as_mut()?.proxies.acquire(tile, now)
    }

    pub fn destroy_proxy(&mut self, proxy: ProxyHandle) -> Result<(), TilesetError> {
        match self.occlusion.as_mut() {
            Some(occlusion) => Ok(occlusion.proxies.release(proxy)?),
            None => Ok(()),
        }
    }

    pub fn proxy_primitive(&self, proxy: ProxyHandle) -> Option<PrimitiveId> {
        self.occlusion.as_ref()?.proxies.primitive(proxy).ok()
    }

    pub fn occlusion_state(&self, tile: TileId) -> TileOcclusionState {
        self.occlusion
            .as_ref()
            .map_or(TileOcclusionState::Unavailable, |occlusion| {
                occlusion.proxies.state_for_tile(tile)
            })
    }

    pub fn handle_selection_event(&mut self, event: &TileSelectionEvent) {
        let (previous, current) = event.transition();
        let rendered = event.newly_rendered();
        debug!(
            event = event.name(),
            tile = ?event.tile(),
            ?previous,
            ?current,
            newly_rendered = rendered.len(),
            "tile selection changed"
        );
        if rendered.is_empty() {
            return;
        }
        for observer in &mut self.placement_observers {
            observer.on_tiles_rendered(rendered);
        }
    }

    /// Forward a failure surfaced by the streaming engine. Never blocks: when
    /// nobody drains the channel the newest notification is dropped.
    pub fn report_load_failure(&mut self, failure: LoadFailure) {
        error!(
            kind = %failure.kind,
            status = failure.status_code,
            message = %failure.message,
            "tileset load failure"
        );
        match self.failure_sender.try_send(failure) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_failures += 1;
                warn!(
                    dropped = self.dropped_failures,
                    "failure channel full, notification dropped"
                );
            }
        }
    }

    pub fn failure_receiver(&self) -> Receiver<LoadFailure> {
        self.failure_receiver.clone()
    }

    pub fn dropped_failures(&self) -> u64 {
        self.dropped_failures
    }

    /// Run one owner-thread tick: occlusion, finalization, stats, visibility,
    /// deferred destruction, in that order.
    pub fn tick(
        &mut self,
        update: &ViewUpdateResult,
        readiness: &mut impl DestructionReadiness<RetiredResource>,
    ) -> Result<TickReport, TilesetError> {
        self.tick += 1;

        let occlusion_frame_received = match self.occlusion.as_mut() {
            Some(occlusion) => {
                let received = occlusion.results.update();
                occlusion.proxies.update_occlusion(&occlusion.results);
                received
            }
            None => false,
        };

        let pending = u32::try_from(self.staging.len()).unwrap_or(u32::MAX);
        let finalize = self.scheduler.schedule_tick(FinalizeSchedulerInput {
            tick: self.tick,
            pending_finalizations: pending,
            previous_finalize_micros: self.last_finalize_micros.take(),
        });
        let mut counts = FinalizeCounts::default();
        let started = Instant::now();
        for _ in 0..finalize.finalizations_to_run {
            let Some(staged) = self.staging.pop() else {
                break;
            };
            self.finalize_one(staged, &mut counts)?;
        }
        if finalize.finalizations_to_run > 0 {
            let spent = started.elapsed().as_micros();
            self.last_finalize_micros = Some(u64::try_from(spent).unwrap_or(u64::MAX));
        }
        let main_thread_queue_length = self.staging.len();

        let stats_logged = self.log_selection_stats(update, main_thread_queue_length);

        let lookup = ArenaLookup(&self.tiles);
        let reconcile = self.reconciler.tick(update, &lookup, &mut self.scene);

        let destruction = self.bridge.pump_destruction(readiness);

        Ok(TickReport {
            tick: self.tick,
            occlusion_frame_received,
            finalize,
            finalized: counts.finalized,
            finalized_empty: counts.finalized_empty,
            discarded_stale: counts.discarded_stale,
            failed: counts.failed,
            main_thread_queue_length,
            stats_logged,
            reconcile,
            destruction,
        })
    }

    fn finalize_one(
        &mut self,
        StagedTile { tile, result }: StagedTile,
        counts: &mut FinalizeCounts,
    ) -> Result<(), TilesetError> {
        let state = self.tiles.get(tile).map(|entry| entry.state());
        if state != Some(TileLoadState::ContentLoading) {
            debug!(tile = ?tile, ?state, "staged result no longer wanted, discarding");
            let staged = result.ok().and_then(|result| result.staged);
            self.bridge.release(&mut self.scene, tile, staged, None);
            counts.discarded_stale += 1;
            return Ok(());
        }

        let WorkerStagedResult {
            load_result,
            staged,
        } = match result {
            Ok(result) => result,
            Err(source) => {
                self.fail_tile(tile, source)?;
                counts.failed += 1;
                return Ok(());
            }
        };

        let entry = self.tiles.get_mut(tile).ok_or(TileStateError::Stale)?;
        entry.set_content_kind(load_result.content.kind());
        entry.advance_to(TileLoadState::ContentLoaded)?;
        let node = self
            .bridge
            .finalize_on_owner_thread(&mut self.scene, tile, staged);
        if node.is_some() {
            counts.finalized += 1;
        } else {
            counts.finalized_empty += 1;
        }
        entry.set_render_resources(node);
        entry.advance_to(TileLoadState::Done)?;
        Ok(())
    }

    fn fail_tile(&mut self, tile: TileId, source: PrepareError) -> Result<(), TilesetError> {
        self.tiles.advance(tile, TileLoadState::Failed)?;
        let error = TilesetError::Prepare { tile, source };
        warn!(tile = ?tile, label = self.tiles.label(tile), %error, "tile staging failed");
        self.report_load_failure(LoadFailure {
            kind: LoadFailureKind::TileContent,
            status_code: 0,
            message: error.to_string(),
        });
        Ok(())
    }

    fn log_selection_stats(&mut self, update: &ViewUpdateResult, main_queue: usize) -> bool {
        if !self.config.log_selection_stats {
            return false;
        }
        let mut stats = update.stats;
        stats.main_thread_queue_length = stats
            .main_thread_queue_length
            .saturating_add(u32::try_from(main_queue).unwrap_or(u32::MAX));
        let snapshot = LoggedSelection {
            rendered: update.rendered_count(),
            stats,
        };
        if self.last_logged_selection == Some(snapshot) {
            return false;
        }
        self.last_logged_selection = Some(snapshot);
        info!(
            frame = update.frame_number,
            rendered = snapshot.rendered,
            visited = stats.tiles_visited,
            culled_visited = stats.culled_tiles_visited,
            culled = stats.tiles_culled,
            occluded = stats.tiles_occluded,
            waiting_for_occlusion = stats.tiles_waiting_for_occlusion,
            max_depth = stats.max_depth_visited,
            worker_queue = stats.worker_thread_queue_length,
            main_queue = stats.main_thread_queue_length,
            "tile selection"
        );
        true
    }

    /// Release a tile's finalized resources and return it to `Unloaded`.
    pub fn unload_tile(&mut self, tile: TileId) -> Result<ReleaseOutcome, TilesetError> {
        self.tiles.advance(tile, TileLoadState::Unloading)?;
        let owner = self
            .tiles
            .get_mut(tile)
            .and_then(|entry| entry.take_render_resources());
        let outcome = self.bridge.release(&mut self.scene, tile, None, owner);
        self.forget_tile(tile);
        self.tiles.advance(tile, TileLoadState::Unloaded)?;
        if let Some(entry) = self.tiles.get_mut(tile) {
            entry.set_fade_percentage(0.0);
        }
        debug!(tile = ?tile, ?outcome, "tile unloaded");
        Ok(outcome)
    }

    /// Drop a tile from the arena. A result still being staged for it is
    /// discarded when it arrives.
    pub fn remove_tile(&mut self, tile: TileId) -> Result<ReleaseOutcome, TilesetError> {
        let state = self
            .tiles
            .get(tile)
            .map(|entry| entry.state())
            .ok_or(TileStateError::Stale)?;
        let outcome = match state {
            TileLoadState::ContentLoaded | TileLoadState::Done | TileLoadState::Failed => {
                self.unload_tile(tile)?
            }
            TileLoadState::Unloaded | TileLoadState::ContentLoading | TileLoadState::Unloading => {
                ReleaseOutcome::Nothing
            }
        };
        self.forget_tile(tile);
        self.tiles.remove(tile);
        Ok(outcome)
    }

    fn forget_tile(&mut self, tile: TileId) {
        self.reconciler.forget(tile);
        if let Some(occlusion) = self.occlusion.as_mut()
            && let Some(proxy) = occlusion.proxies.proxy_for_tile(tile)
            && let Err(err) = occlusion.proxies.release(proxy)
        {
            warn!(tile = ?tile, %err, "occlusion proxy release failed");
        }
    }

    pub fn finalize_overlay(&mut self, staged: Option<StagedOverlayTexture>) -> Option<OverlayTexture> {
        self.bridge
            .finalize_overlay_on_owner_thread(&mut self.scene, staged)
    }

    pub fn release_overlay(
        &mut self,
        staged: Option<StagedOverlayTexture>,
        owner: Option<OverlayTexture>,
    ) {
        self.bridge.release_overlay(&mut self.scene, staged, owner);
    }

    pub fn attach_overlay(
        &mut self,
        tile: TileId,
        slot: OverlaySlot,
        texture: &OverlayTexture,
        placement: OverlayPlacement,
    ) -> bool {
        let owner = self
            .tiles
            .get_mut(tile)
            .and_then(|entry| entry.render_resources_mut());
        self.bridge
            .attach_overlay(&mut self.scene, owner, slot, texture, placement)
    }

    pub fn detach_overlay(&mut self, tile: TileId, slot: OverlaySlot, texture: &OverlayTexture) -> bool {
        let owner = self
            .tiles
            .get_mut(tile)
            .and_then(|entry| entry.render_resources_mut());
        self.bridge
            .detach_overlay(&mut self.scene, owner, slot, texture)
    }

    pub fn pending_destruction_count(&self) -> usize {
        self.bridge.pending_destruction_count()
    }

    /// Release everything and pump deferred destruction until it drains or
    /// `max_pumps` is reached.
    pub fn shutdown(
        &mut self,
        readiness: &mut impl DestructionReadiness<RetiredResource>,
        max_pumps: u32,
    ) -> Result<(), TilesetError> {
        while let Some(StagedTile { tile, result }) = self.staging.pop() {
            let staged = result.ok().and_then(|result| result.staged);
            self.bridge.release(&mut self.scene, tile, staged, None);
        }

        let loaded: Vec<TileId> = self
            .tiles
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.state(),
                    TileLoadState::ContentLoaded | TileLoadState::Done | TileLoadState::Failed
                )
            })
            .map(|(tile, _)| tile)
            .collect();
        for tile in loaded {
            self.unload_tile(tile)?;
        }
        if let Some(occlusion) = self.occlusion.as_mut() {
            occlusion.proxies.destroy_all();
        }

        let mut pumps = 0;
        while self.bridge.pending_destruction_count() > 0 {
            if pumps == max_pumps {
                let pending = self.bridge.pending_destruction_count();
                warn!(pending, pumps, "deferred destruction did not drain");
                return Err(TilesetError::DestructionStalled { pending, pumps });
            }
            self.bridge.pump_destruction(readiness);
            pumps += 1;
        }
        info!(pumps, tiles = self.tiles.len(), "tileset shut down");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FinalizeCounts {
    finalized: usize,
    finalized_empty: usize,
    discarded_stale: usize,
    failed: usize,
}
