use std::collections::BTreeMap;
use std::thread::{self, ThreadId};

use futures::future::{self, BoxFuture, FutureExt};
use render_protocol::{
    GpuResourceKind, NodeDesc, NodeId, NodeKind, OverlayPlacement, OverlaySlot, RetiredResource,
    SceneGraph,
};
use thiserror::Error;
use tiles::{
    ContentKind, DeferredDestructionQueue, DestructionPumpReport, DestructionReadiness,
    IDENTITY_TRANSFORM, MeshContent, MeshPrimitive, TileContent, TileId, TileLoadResult,
    TransformMatrix4x4,
};
use tracing::{debug, trace, warn};

use crate::overlay::{
    OverlayImage, OverlayOptions, OverlayTexture, StagedOverlayTexture, stage_overlay,
};
use crate::staging::{
    Aabb, StagedPointCloud, StagedPrimitive, generate_flat_normals, generate_tangents,
    multiply_transforms, realign_attributes, sequential_indices, stage_point_cloud,
    stage_primitive, validate_primitive,
};

/// Staging input that is malformed rather than merely absent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrepareError {
    #[error("primitive {primitive}: index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        primitive: usize,
        index: u32,
        vertex_count: usize,
    },
    #[error("primitive {primitive}: {index_count} indices do not form whole triangles")]
    IncompleteTriangle {
        primitive: usize,
        index_count: usize,
    },
    #[error("primitive {primitive}: {vertex_count} vertices exceed the 32-bit index range")]
    TooManyVertices {
        primitive: usize,
        vertex_count: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOptions {
    pub generate_missing_normals: bool,
    pub always_include_tangents: bool,
    pub create_physics_meshes: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            generate_missing_normals: true,
            always_include_tangents: false,
            create_physics_meshes: true,
        }
    }
}

/// Output of the worker phase, waiting for the owner thread.
///
/// Neither `Clone` nor `Copy`: finalizing moves it.
#[derive(Debug, PartialEq)]
pub enum StagedResource {
    Mesh {
        transform: TransformMatrix4x4,
        primitives: Vec<StagedPrimitive>,
    },
    PointCloud {
        transform: TransformMatrix4x4,
        points: StagedPointCloud,
    },
}

impl StagedResource {
    pub fn kind(&self) -> ContentKind {
        match self {
            StagedResource::Mesh { .. } => ContentKind::Mesh,
            StagedResource::PointCloud { .. } => ContentKind::PointCloud,
        }
    }

    pub fn transform(&self) -> &TransformMatrix4x4 {
        match self {
            StagedResource::Mesh { transform, .. } | StagedResource::PointCloud { transform, .. } => {
                transform
            }
        }
    }

    pub fn bounds(&self) -> Option<Aabb> {
        match self {
            StagedResource::Mesh { primitives, .. } => primitives
                .iter()
                .filter_map(|primitive| primitive.bounds)
                .reduce(Aabb::union),
            StagedResource::PointCloud { points, .. } => points.bounds,
        }
    }
}

#[derive(Debug)]
pub struct WorkerStagedResult {
    /// The content, possibly rewritten by staging (generated normals,
    /// realigned attributes).
    pub load_result: TileLoadResult,
    /// `None` means there is nothing to render for this tile.
    pub staged: Option<StagedResource>,
}

/// Worker phase. Touches no owner-thread state and may run on any thread.
pub fn prepare_off_owner_thread(
    load_result: TileLoadResult,
    transform: TransformMatrix4x4,
    options: PrepareOptions,
) -> BoxFuture<'static, Result<WorkerStagedResult, PrepareError>> {
    async move {
        let TileLoadResult {
            content,
            content_transform,
        } = load_result;
        let placement = multiply_transforms(&transform, &content_transform);

        let (content, staged) = match content {
            TileContent::Mesh(mesh) => {
                let (mesh, primitives) = stage_mesh(mesh, options).await?;
                let staged = (!primitives.is_empty()).then(|| StagedResource::Mesh {
                    transform: placement,
                    primitives,
                });
                (TileContent::Mesh(mesh), staged)
            }
            TileContent::PointCloud(mut points) => {
                let staged = stage_point_cloud(&mut points);
                let staged = (staged.point_count > 0).then(|| StagedResource::PointCloud {
                    transform: placement,
                    points: staged,
                });
                (TileContent::PointCloud(points), staged)
            }
            other @ (TileContent::Empty | TileContent::External { .. }) => (other, None),
        };

        Ok(WorkerStagedResult {
            load_result: TileLoadResult {
                content,
                content_transform,
            },
            staged,
        })
    }
    .boxed()
}

async fn stage_mesh(
    mesh: MeshContent,
    options: PrepareOptions,
) -> Result<(MeshContent, Vec<StagedPrimitive>), PrepareError> {
    let staged = future::try_join_all(
        mesh.primitives
            .into_iter()
            .enumerate()
            .map(|(index, primitive)| stage_mesh_primitive(index, primitive, options)),
    )
    .await?;
    let (primitives, staged) = staged.into_iter().unzip();
    Ok((MeshContent { primitives }, staged))
}

async fn stage_mesh_primitive(
    index: usize,
    mut primitive: MeshPrimitive,
    options: PrepareOptions,
) -> Result<(MeshPrimitive, StagedPrimitive), PrepareError> {
    if primitive.indices.is_empty() {
        primitive.indices = sequential_indices(index, primitive.positions.len())?;
    }
    validate_primitive(index, &primitive)?;
    realign_attributes(index, &mut primitive);
    if options.generate_missing_normals && primitive.normals.is_none() {
        generate_flat_normals(index, &mut primitive)?;
    }
    if options.always_include_tangents && primitive.tangents.is_none() {
        generate_tangents(&mut primitive);
    }
    let staged = stage_primitive(&primitive, options.create_physics_meshes);
    Ok((primitive, staged))
}

/// Drop a staged result that will never be finalized. Safe from any thread.
pub fn release_staged(tile: TileId, staged: Option<StagedResource>) {
    if let Some(staged) = staged {
        trace!(?tile, kind = ?staged.kind(), "staged resource discarded");
    }
}

/// Drop a staged overlay that will never be finalized. Safe from any thread.
pub fn release_staged_overlay(staged: Option<StagedOverlayTexture>) {
    if let Some(staged) = staged {
        trace!(
            width = staged.width(),
            height = staged.height(),
            "staged overlay discarded"
        );
    }
}

/// Worker phase for a raster overlay.
pub fn prepare_overlay_off_owner_thread(
    image: Option<OverlayImage>,
    options: OverlayOptions,
) -> BoxFuture<'static, Option<StagedOverlayTexture>> {
    async move { image.and_then(|image| stage_overlay(image, options)) }.boxed()
}

/// Owner-thread notifications about tile content entering or leaving the
/// scene.
pub trait TileLifecycleObserver {
    fn on_tile_loaded(&mut self, _tile: TileId, _node: NodeId) {}

    fn on_tile_unloading(&mut self, _tile: TileId, _node: NodeId) {}
}

/// Owner-thread resource of a finalized tile.
#[derive(Debug)]
pub struct TileNode {
    tile: TileId,
    node: NodeId,
    kind: ContentKind,
    primitive_nodes: Vec<NodeId>,
    overlays: BTreeMap<OverlaySlot, (OverlayTexture, OverlayPlacement)>,
}

impl TileNode {
    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn primitive_nodes(&self) -> &[NodeId] {
        &self.primitive_nodes
    }

    pub fn overlay(&self, slot: OverlaySlot) -> Option<&OverlayTexture> {
        self.overlays.get(&slot).map(|(texture, _)| texture)
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Nothing,
    StagedDiscarded,
    OwnerDestroyed { retired: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    pub finalized: u64,
    pub finalized_empty: u64,
    pub staged_discarded: u64,
    pub owner_released: u64,
    pub overlays_finalized: u64,
    pub overlays_retired: u64,
}

/// Owner-thread half of the two-phase preparation protocol.
///
/// Everything here assumes the thread that created the bridge. Calling a
/// finalize/attach/detach/release operation from any other thread panics.
pub struct ResourcePreparationBridge {
    owner_thread: ThreadId,
    observers: Vec<Box<dyn TileLifecycleObserver>>,
    retired: DeferredDestructionQueue<RetiredResource>,
    stats: BridgeStats,
}

impl Default for ResourcePreparationBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourcePreparationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePreparationBridge")
            .field("owner_thread", &self.owner_thread)
            .field("observers", &self.observers.len())
            .field("retired", &self.retired.pending_destruction_count())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ResourcePreparationBridge {
    /// Binds the bridge to the calling thread.
    pub fn new() -> Self {
        Self::with_owner_thread(thread::current().id())
    }

    pub fn with_owner_thread(owner_thread: ThreadId) -> Self {
        Self {
            owner_thread,
            observers: Vec::new(),
            retired: DeferredDestructionQueue::new(),
            stats: BridgeStats::default(),
        }
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.owner_thread
    }

    pub fn add_observer(&mut self, observer: Box<dyn TileLifecycleObserver>) {
        self.observers.push(observer);
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    fn assert_owner_thread(&self, operation: &str) {
        assert_eq!(
            thread::current().id(),
            self.owner_thread,
            "{operation} must run on the owner thread"
        );
    }

    pub fn finalize_on_owner_thread<S: SceneGraph + ?Sized>(
        &mut self,
        scene: &mut S,
        tile: TileId,
        staged: Option<StagedResource>,
    ) -> Option<TileNode> {
        self.assert_owner_thread("finalize_on_owner_thread");
        let Some(staged) = staged else {
            self.stats.finalized_empty += 1;
            trace!(?tile, "nothing staged, tile has no render resources");
            return None;
        };

        let kind = staged.kind();
        let (transform, children) = match staged {
            StagedResource::Mesh {
                transform,
                primitives,
            } => (
                transform,
                primitives.into_iter().map(primitive_node_desc).collect(),
            ),
            StagedResource::PointCloud { transform, points } => (
                transform,
                vec![NodeDesc {
                    kind: NodeKind::PointCloud,
                    transform: IDENTITY_TRANSFORM,
                    resources: vec![(GpuResourceKind::PointBuffer, points.point_bytes)],
                }],
            ),
        };

        let node = scene.create_node(NodeDesc {
            kind: NodeKind::TileRoot { tile },
            transform,
            resources: Vec::new(),
        });
        let mut primitive_nodes = Vec::with_capacity(children.len());
        for desc in children {
            let child = scene.create_node(desc);
            if !scene.attach(child, node) {
                warn!(?tile, "primitive node could not be attached to its tile");
            }
            primitive_nodes.push(child);
        }

        for observer in &mut self.observers {
            observer.on_tile_loaded(tile, node);
        }
        self.stats.finalized += 1;
        debug!(?tile, ?kind, primitives = primitive_nodes.len(), "tile finalized");

        Some(TileNode {
            tile,
            node,
            kind,
            primitive_nodes,
            overlays: BTreeMap::new(),
        })
    }

    /// Release whichever half exists. The staged half is dropped without
    /// touching the scene; the owner half is torn down and its GPU
    /// allocations queued for deferred release.
    pub fn release<S: SceneGraph + ?Sized>(
        &mut self,
        scene: &mut S,
        tile: TileId,
        staged: Option<StagedResource>,
        owner: Option<TileNode>,
    ) -> ReleaseOutcome {
        let had_staged = staged.is_some();
        if had_staged && owner.is_some() {
            warn!(?tile, "release got both a staged and a finalized resource");
        }
        if had_staged {
            self.stats.staged_discarded += 1;
        }
        release_staged(tile, staged);

        let Some(owner) = owner else {
            return if had_staged {
                ReleaseOutcome::StagedDiscarded
            } else {
                ReleaseOutcome::Nothing
            };
        };

        self.assert_owner_thread("release");
        if owner.tile != tile {
            warn!(?tile, owner = ?owner.tile, "released resource belongs to another tile");
        }
        for observer in &mut self.observers {
            observer.on_tile_unloading(owner.tile, owner.node);
        }
        let TileNode { node, overlays, .. } = owner;
        for (texture, _) in overlays.into_values() {
            self.drop_overlay_holder(scene, texture);
        }
        let resources = scene.destroy_recursively(node);
        let retired = resources.len();
        for resource in resources {
            self.retired.enqueue(resource);
        }
        self.stats.owner_released += 1;
        debug!(?tile, retired, "tile resources released");
        ReleaseOutcome::OwnerDestroyed { retired }
    }

    pub fn finalize_overlay_on_owner_thread<S: SceneGraph + ?Sized>(
        &mut self,
        scene: &mut S,
        staged: Option<StagedOverlayTexture>,
    ) -> Option<OverlayTexture> {
        self.assert_owner_thread("finalize_overlay_on_owner_thread");
        let staged = staged?;
        let resource = scene.allocate(GpuResourceKind::Texture, staged.byte_size());
        self.stats.overlays_finalized += 1;
        Some(OverlayTexture::new(resource, &staged))
    }

    /// Release one holder of an overlay texture. The GPU texture is retired
    /// only once no tile still has it attached. Only the owner half needs the
    /// owner thread.
    pub fn release_overlay<S: SceneGraph + ?Sized>(
        &mut self,
        scene: &mut S,
        staged: Option<StagedOverlayTexture>,
        owner: Option<OverlayTexture>,
    ) {
        release_staged_overlay(staged);
        if let Some(texture) = owner {
            self.assert_owner_thread("release_overlay");
            self.drop_overlay_holder(scene, texture);
        }
    }

    fn drop_overlay_holder<S: SceneGraph + ?Sized>(&mut self, scene: &mut S, texture: OverlayTexture) {
        let Some(resource) = texture.into_last_resource() else {
            return;
        };
        if let Some(retired) = scene.retire_allocation(resource) {
            self.retired.enqueue(retired);
            self.stats.overlays_retired += 1;
        }
    }

    /// Bind `texture` to every primitive of the tile in `slot`, replacing
    /// whatever the slot held. Returns `false` without side effects when the
    /// tile resource is gone.
    pub fn attach_overlay<S: SceneGraph + ?Sized>(
        &mut self,
        scene: &mut S,
        tile: Option<&mut TileNode>,
        slot: OverlaySlot,
        texture: &OverlayTexture,
        placement: OverlayPlacement,
    ) -> bool {
        self.assert_owner_thread("attach_overlay");
        let Some(tile) = tile else {
            return false;
        };
        if !scene.contains(tile.node) {
            return false;
        }
        for primitive in &tile.primitive_nodes {
            scene.bind_overlay(*primitive, slot, texture.resource(), placement);
        }
        if let Some((previous, _)) = tile.overlays.insert(slot, (texture.clone(), placement)) {
            if previous != *texture {
                trace!(tile = ?tile.tile, ?slot, "overlay slot replaced");
            }
            self.drop_overlay_holder(scene, previous);
        }
        true
    }

    /// Unbind `texture` from `slot`. A slot holding a different texture is
    /// left alone.
    pub fn detach_overlay<S: SceneGraph + ?Sized>(
        &mut self,
        scene: &mut S,
        tile: Option<&mut TileNode>,
        slot: OverlaySlot,
        texture: &OverlayTexture,
    ) -> bool {
        self.assert_owner_thread("detach_overlay");
        let Some(tile) = tile else {
            return false;
        };
        if !scene.contains(tile.node) {
            return false;
        }
        let bound_here = tile
            .overlays
            .get(&slot)
            .is_some_and(|(bound, _)| bound == texture);
        if !bound_here {
            return false;
        }
        for primitive in &tile.primitive_nodes {
            scene.unbind_overlay(*primitive, slot);
        }
        if let Some((previous, _)) = tile.overlays.remove(&slot) {
            self.drop_overlay_holder(scene, previous);
        }
        true
    }

    pub fn pump_destruction(
        &mut self,
        readiness: &mut impl DestructionReadiness<RetiredResource>,
    ) -> DestructionPumpReport {
        self.retired.pump(readiness)
    }

    pub fn pending_destruction_count(&self) -> usize {
        self.retired.pending_destruction_count()
    }
}

fn primitive_node_desc(primitive: StagedPrimitive) -> NodeDesc {
    let mut resources = vec![(GpuResourceKind::VertexBuffer, primitive.vertex_bytes)];
    if primitive.index_bytes > 0 {
        resources.push((GpuResourceKind::IndexBuffer, primitive.index_bytes));
    }
    if let Some(bytes) = primitive.collision_bytes {
        resources.push((GpuResourceKind::CollisionBody, bytes));
    }
    NodeDesc {
        kind: NodeKind::MeshPrimitive,
        transform: IDENTITY_TRANSFORM,
        resources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetainedScene;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tiles::{PointCloudContent, TileArena};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Notification {
        Loaded(TileId),
        Unloading(TileId),
    }

    struct RecordingObserver(Rc<RefCell<Vec<Notification>>>);

    impl TileLifecycleObserver for RecordingObserver {
        fn on_tile_loaded(&mut self, tile: TileId, _node: NodeId) {
            self.0.borrow_mut().push(Notification::Loaded(tile));
        }

        fn on_tile_unloading(&mut self, tile: TileId, _node: NodeId) {
            self.0.borrow_mut().push(Notification::Unloading(tile));
        }
    }

    struct Immediate;

    impl DestructionReadiness<RetiredResource> for Immediate {
        fn begin_destroy(&mut self, _item: &mut RetiredResource) {}

        fn is_ready_for_finish(&mut self, _item: &RetiredResource) -> bool {
            true
        }

        fn finish_destroy(&mut self, _item: RetiredResource) {}
    }

    fn tile_id() -> TileId {
        TileArena::<()>::new().insert("tile")
    }

    fn quad() -> TileLoadResult {
        TileLoadResult::new(TileContent::Mesh(MeshContent {
            primitives: vec![MeshPrimitive {
                positions: vec![
                    [0.0, 0.0, 0.0],
                    [1.0, 0.0, 0.0],
                    [1.0, 1.0, 0.0],
                    [0.0, 1.0, 0.0],
                ],
                indices: vec![0, 1, 2, 0, 2, 3],
                ..MeshPrimitive::default()
            }],
        }))
    }

    fn stage(load_result: TileLoadResult) -> WorkerStagedResult {
        pollster::block_on(prepare_off_owner_thread(
            load_result,
            IDENTITY_TRANSFORM,
            PrepareOptions::default(),
        ))
        .expect("staging succeeds")
    }

    fn overlay_image() -> OverlayImage {
        OverlayImage {
            width: 2,
            height: 2,
            pixels: vec![255; 16],
        }
    }

    #[test]
    fn empty_content_is_a_null_resource_end_to_end() {
        let mut scene = RetainedScene::new();
        let mut bridge = ResourcePreparationBridge::new();
        let tile = tile_id();

        let result = stage(TileLoadResult::empty());
        assert!(result.staged.is_none());

        let owner = bridge.finalize_on_owner_thread(&mut scene, tile, result.staged);
        assert!(owner.is_none());
        assert_eq!(bridge.release(&mut scene, tile, None, None), ReleaseOutcome::Nothing);
        assert_eq!(scene.node_count(), 1);
        assert_eq!(bridge.stats().finalized_empty, 1);
    }

    #[test]
    fn external_and_empty_point_cloud_stage_nothing() {
        let external = stage(TileLoadResult::new(TileContent::External {
            tileset_url: "nested.json".to_owned(),
        }));
        assert!(external.staged.is_none());
        assert_eq!(external.load_result.content.kind(), ContentKind::External);

        let points = stage(TileLoadResult::new(TileContent::PointCloud(
            PointCloudContent::default(),
        )));
        assert!(points.staged.is_none());
    }

    #[test]
    fn staging_generates_flat_normals_into_returned_content() {
        let result = stage(quad());
        let TileContent::Mesh(mesh) = &result.load_result.content else {
            panic!("mesh content expected");
        };
        let primitive = &mesh.primitives[0];
        assert_eq!(primitive.positions.len(), 6);
        assert!(primitive.normals.is_some());

        let Some(StagedResource::Mesh { primitives, .. }) = &result.staged else {
            panic!("mesh staged expected");
        };
        assert_eq!(primitives.len(), 1);
        assert!(primitives[0].collision_bytes.is_some());
    }

    #[test]
    fn malformed_indices_fail_staging() {
        let mut load_result = quad();
        if let TileContent::Mesh(mesh) = &mut load_result.content {
            mesh.primitives[0].indices[5] = 9;
        }
        let error = pollster::block_on(prepare_off_owner_thread(
            load_result,
            IDENTITY_TRANSFORM,
            PrepareOptions::default(),
        ))
        .expect_err("index out of range");
        assert!(matches!(error, PrepareError::IndexOutOfRange { index: 9, .. }));
    }

    #[test]
    fn placement_transform_composes_with_content_transform() {
        let mut load_result = quad();
        load_result.content_transform[13] = 2.0;
        let mut placement = IDENTITY_TRANSFORM;
        placement[12] = 5.0;

        let result = pollster::block_on(prepare_off_owner_thread(
            load_result,
            placement,
            PrepareOptions::default(),
        ))
        .expect("staged");
        let transform = result.staged.as_ref().expect("staged").transform();
        assert_eq!(transform[12], 5.0);
        assert_eq!(transform[13], 2.0);
    }

    #[test]
    fn worker_staged_result_finalizes_on_owner_thread() {
        let staged = std::thread::spawn(|| stage(quad()))
            .join()
            .expect("worker thread");
        let mut scene = RetainedScene::new();
        let mut bridge = ResourcePreparationBridge::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        bridge.add_observer(Box::new(RecordingObserver(events.clone())));
        let tile = tile_id();

        let owner = bridge
            .finalize_on_owner_thread(&mut scene, tile, staged.staged)
            .expect("owner resource");

        assert_eq!(scene.kind(owner.node()), Some(NodeKind::TileRoot { tile }));
        assert_eq!(scene.children(owner.node()), owner.primitive_nodes().to_vec());
        assert!(!scene.is_visible(owner.node()));
        assert_eq!(events.borrow().as_slice(), &[Notification::Loaded(tile)]);
    }

    #[test]
    fn releasing_owner_half_tears_down_and_defers_gpu_release() {
        let mut scene = RetainedScene::new();
        let mut bridge = ResourcePreparationBridge::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        bridge.add_observer(Box::new(RecordingObserver(events.clone())));
        let tile = tile_id();
        let owner = bridge.finalize_on_owner_thread(&mut scene, tile, stage(quad()).staged);
        let node = owner.as_ref().expect("owner").node();

        let outcome = bridge.release(&mut scene, tile, None, owner);

        assert_eq!(outcome, ReleaseOutcome::OwnerDestroyed { retired: 3 });
        assert!(!scene.contains(node));
        assert_eq!(scene.node_count(), 1);
        assert_eq!(bridge.pending_destruction_count(), 3);
        assert_eq!(
            events.borrow().as_slice(),
            &[Notification::Loaded(tile), Notification::Unloading(tile)]
        );

        let report = bridge.pump_destruction(&mut Immediate);
        assert_eq!(report.finished, 3);
        assert_eq!(bridge.pending_destruction_count(), 0);
        assert_eq!(scene.live_allocation_count(), 0);
    }

    #[test]
    fn releasing_staged_half_leaves_scene_untouched() {
        let mut scene = RetainedScene::new();
        let mut bridge = ResourcePreparationBridge::new();
        let tile = tile_id();

        let outcome = bridge.release(&mut scene, tile, stage(quad()).staged, None);

        assert_eq!(outcome, ReleaseOutcome::StagedDiscarded);
        assert_eq!(scene.node_count(), 1);
        assert_eq!(bridge.pending_destruction_count(), 0);
        assert_eq!(bridge.stats().finalized, 0);
    }

    #[test]
    #[should_panic(expected = "must run on the owner thread")]
    fn finalizing_off_the_owner_thread_panics() {
        let other = std::thread::spawn(|| std::thread::current().id())
            .join()
            .expect("thread id");
        let mut bridge = ResourcePreparationBridge::with_owner_thread(other);
        let mut scene = RetainedScene::new();
        bridge.finalize_on_owner_thread(&mut scene, tile_id(), None);
    }

    #[test]
    fn staged_halves_release_off_the_owner_thread() {
        let other = std::thread::spawn(|| std::thread::current().id())
            .join()
            .expect("thread id");
        let mut bridge = ResourcePreparationBridge::with_owner_thread(other);
        let mut scene = RetainedScene::new();
        let staged_overlay = pollster::block_on(prepare_overlay_off_owner_thread(
            Some(overlay_image()),
            OverlayOptions::default(),
        ));
        assert!(staged_overlay.is_some());

        let outcome = bridge.release(&mut scene, tile_id(), stage(quad()).staged, None);
        bridge.release_overlay(&mut scene, staged_overlay, None);

        assert_eq!(outcome, ReleaseOutcome::StagedDiscarded);
        assert_eq!(scene.live_allocation_count(), 0);
        assert_eq!(bridge.pending_destruction_count(), 0);
    }

    #[test]
    fn overlay_attach_replaces_per_slot() {
        let mut scene = RetainedScene::new();
        let mut bridge = ResourcePreparationBridge::new();
        let tile = tile_id();
        let mut owner = bridge.finalize_on_owner_thread(&mut scene, tile, stage(quad()).staged);
        let primitive = owner.as_ref().expect("owner").primitive_nodes()[0];

        let first = bridge
            .finalize_overlay_on_owner_thread(
                &mut scene,
                pollster::block_on(prepare_overlay_off_owner_thread(
                    Some(overlay_image()),
                    OverlayOptions::default(),
                )),
            )
            .expect("first texture");
        let second = bridge
            .finalize_overlay_on_owner_thread(
                &mut scene,
                pollster::block_on(prepare_overlay_off_owner_thread(
                    Some(overlay_image()),
                    OverlayOptions::default(),
                )),
            )
            .expect("second texture");
        let slot = OverlaySlot(0);
        let placement = OverlayPlacement::default();

        assert!(bridge.attach_overlay(&mut scene, owner.as_mut(), slot, &first, placement));
        assert!(bridge.attach_overlay(&mut scene, owner.as_mut(), slot, &second, placement));

        let owner_ref = owner.as_ref().expect("owner");
        assert_eq!(owner_ref.overlay_count(), 1);
        assert_eq!(owner_ref.overlay(slot), Some(&second));
        assert_eq!(
            scene.overlay(primitive, slot).map(|(texture, _)| texture),
            Some(second.resource())
        );
        assert_eq!(first.holder_count(), 1);

        bridge.release_overlay(&mut scene, None, Some(first));
        assert_eq!(bridge.stats().overlays_retired, 1);

        bridge.release(&mut scene, tile, None, owner);
        assert_eq!(second.holder_count(), 1);
        bridge.release_overlay(&mut scene, None, Some(second));
        assert_eq!(bridge.stats().overlays_retired, 2);
    }

    #[test]
    fn overlay_operations_are_noops_once_the_tile_is_gone() {
        let mut scene = RetainedScene::new();
        let mut bridge = ResourcePreparationBridge::new();
        let texture = bridge
            .finalize_overlay_on_owner_thread(
                &mut scene,
                pollster::block_on(prepare_overlay_off_owner_thread(
                    Some(overlay_image()),
                    OverlayOptions {
                        generate_mipmaps: true,
                    },
                )),
            )
            .expect("texture");
        assert_eq!(texture.mip_levels(), 2);
        let slot = OverlaySlot(1);

        assert!(!bridge.attach_overlay(&mut scene, None, slot, &texture, OverlayPlacement::default()));
        assert!(!bridge.detach_overlay(&mut scene, None, slot, &texture));

        let tile = tile_id();
        let mut owner = bridge.finalize_on_owner_thread(&mut scene, tile, stage(quad()).staged);
        assert!(bridge.attach_overlay(
            &mut scene,
            owner.as_mut(),
            slot,
            &texture,
            OverlayPlacement::default()
        ));
        assert!(bridge.detach_overlay(&mut scene, owner.as_mut(), slot, &texture));
        assert!(!bridge.detach_overlay(&mut scene, owner.as_mut(), slot, &texture));
        assert_eq!(texture.holder_count(), 1);
    }

    #[test]
    fn missing_overlay_image_stages_nothing() {
        let staged = pollster::block_on(prepare_overlay_off_owner_thread(
            None,
            OverlayOptions::default(),
        ));
        let mut scene = RetainedScene::new();
        let mut bridge = ResourcePreparationBridge::new();
        assert!(bridge.finalize_overlay_on_owner_thread(&mut scene, staged).is_none());
        bridge.release_overlay(&mut scene, None, None);
        assert_eq!(scene.live_allocation_count(), 0);
    }
}
