use bitflags::bitflags;
use tiles::TileId;

slotmap::new_key_type! {
    pub struct NodeId;
    pub struct GpuResourceId;
}

pub type TransformMatrix4x4 = tiles::TransformMatrix4x4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u8 {
        const VISIBLE = 1 << 0;
        const QUERY_COLLISION = 1 << 1;
        const PHYSICS_COLLISION = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CollisionMode {
    #[default]
    NoCollision,
    QueryOnly,
    QueryAndPhysics,
}

impl CollisionMode {
    pub fn flags(self) -> NodeFlags {
        match self {
            CollisionMode::NoCollision => NodeFlags::empty(),
            CollisionMode::QueryOnly => NodeFlags::QUERY_COLLISION,
            CollisionMode::QueryAndPhysics => {
                NodeFlags::QUERY_COLLISION | NodeFlags::PHYSICS_COLLISION
            }
        }
    }
}

/// Per-tileset interaction settings copied onto every primitive of a shown
/// tile. Applying them twice is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InteractionPolicy {
    pub collision_channel: u8,
    pub double_sided_collisions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverlaySlot(pub i32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayPlacement {
    pub translation: [f64; 2],
    pub scale: [f64; 2],
}

impl Default for OverlayPlacement {
    fn default() -> Self {
        Self {
            translation: [0.0, 0.0],
            scale: [1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuResourceKind {
    VertexBuffer,
    IndexBuffer,
    CollisionBody,
    PointBuffer,
    Texture,
}

/// A renderer allocation detached from the scene and waiting for its
/// asynchronous release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetiredResource {
    pub id: GpuResourceId,
    pub kind: GpuResourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Root of one tile's content.
    TileRoot { tile: TileId },
    MeshPrimitive,
    PointCloud,
    Other,
}

/// Description of a node to create. The node starts detached; place it with
/// [`SceneGraph::attach`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDesc {
    pub kind: NodeKind,
    pub transform: TransformMatrix4x4,
    pub resources: Vec<(GpuResourceKind, u64)>,
}

/// Owner-thread-only view of the live scene graph.
///
/// Handles are generation-checked: an operation on a destroyed node is a
/// no-op (or returns `false`/`None`) rather than touching a recycled slot.
pub trait SceneGraph {
    fn root(&self) -> NodeId;

    fn contains(&self, node: NodeId) -> bool;

    /// Create a detached node. Resource byte sizes become GPU allocations
    /// owned by the node.
    fn create_node(&mut self, desc: NodeDesc) -> NodeId;

    /// Standalone allocation not owned by any node (overlay textures).
    fn allocate(&mut self, kind: GpuResourceKind, bytes: u64) -> GpuResourceId;

    /// Hand a standalone allocation over for deferred release.
    fn retire_allocation(&mut self, id: GpuResourceId) -> Option<RetiredResource>;

    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Returns `false` when attaching is impossible (stale handles, cycles).
    fn attach(&mut self, node: NodeId, parent: NodeId) -> bool;

    fn detach(&mut self, node: NodeId);

    fn flags(&self, node: NodeId) -> Option<NodeFlags>;

    fn set_visibility(&mut self, node: NodeId, visible: bool, propagate_to_children: bool);

    fn is_visible(&self, node: NodeId) -> bool {
        self.flags(node)
            .is_some_and(|flags| flags.contains(NodeFlags::VISIBLE))
    }

    /// Applies to the node and all its descendants.
    fn set_collision(&mut self, node: NodeId, mode: CollisionMode);

    fn interaction_policy(&self, node: NodeId) -> Option<InteractionPolicy>;

    fn set_interaction_policy(&mut self, node: NodeId, policy: InteractionPolicy);

    /// Forward LOD fade progress to the node's materials.
    fn set_fade(&mut self, node: NodeId, percentage: f32, fading_in: bool);

    fn fade(&self, node: NodeId) -> Option<(f32, bool)>;

    fn bind_overlay(
        &mut self,
        node: NodeId,
        slot: OverlaySlot,
        texture: GpuResourceId,
        placement: OverlayPlacement,
    );

    fn unbind_overlay(&mut self, node: NodeId, slot: OverlaySlot);

    fn overlay(&self, node: NodeId, slot: OverlaySlot) -> Option<(GpuResourceId, OverlayPlacement)>;

    /// Tear down `node` and its subtree: hide, disable collision, detach
    /// children depth first, then free the nodes. GPU allocations the nodes
    /// owned are returned for deferred release.
    fn destroy_recursively(&mut self, node: NodeId) -> Vec<RetiredResource>;
}
