use std::collections::BTreeMap;

use render_protocol::{
    CollisionMode, GpuResourceId, GpuResourceKind, InteractionPolicy, NodeDesc, NodeFlags,
    NodeId, NodeKind, OverlayPlacement, OverlaySlot, RetiredResource, SceneGraph,
    TransformMatrix4x4,
};
use slotmap::SlotMap;
use tracing::{trace, warn};

#[derive(Debug)]
struct SceneNode {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    flags: NodeFlags,
    transform: TransformMatrix4x4,
    policy: InteractionPolicy,
    fade: (f32, bool),
    overlays: BTreeMap<OverlaySlot, (GpuResourceId, OverlayPlacement)>,
    resources: Vec<GpuResourceId>,
}

impl SceneNode {
    fn new(kind: NodeKind, transform: TransformMatrix4x4) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
            flags: NodeFlags::empty(),
            transform,
            policy: InteractionPolicy::default(),
            fade: (1.0, true),
            overlays: BTreeMap::new(),
            resources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GpuAllocation {
    kind: GpuResourceKind,
    bytes: u64,
}

/// In-memory scene graph with the teardown rules the bridge relies on.
/// Hosts with a real renderer implement [`SceneGraph`] themselves.
#[derive(Debug)]
pub struct RetainedScene {
    nodes: SlotMap<NodeId, SceneNode>,
    allocations: SlotMap<GpuResourceId, GpuAllocation>,
    root: NodeId,
}

impl Default for RetainedScene {
    fn default() -> Self {
        Self::new()
    }
}

impl RetainedScene {
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let mut root = SceneNode::new(NodeKind::Other, tiles::IDENTITY_TRANSFORM);
        root.flags = NodeFlags::VISIBLE;
        let root = nodes.insert(root);
        Self {
            nodes,
            allocations: SlotMap::with_key(),
            root,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn live_allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn live_allocation_bytes(&self) -> u64 {
        self.allocations.values().map(|allocation| allocation.bytes).sum()
    }

    pub fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.nodes.get(node).map(|node| node.kind)
    }

    pub fn transform(&self, node: NodeId) -> Option<&TransformMatrix4x4> {
        self.nodes.get(node).map(|node| &node.transform)
    }

    fn is_ancestor_or_self(&self, candidate: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current == candidate {
                return true;
            }
            cursor = self.nodes.get(current).and_then(|node| node.parent);
        }
        false
    }

    fn subtree_post_order(&self, node: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![(node, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(scene_node) = self.nodes.get(current) {
                for child in scene_node.children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        order
    }
}

impl SceneGraph for RetainedScene {
    fn root(&self) -> NodeId {
        self.root
    }

    fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    fn create_node(&mut self, desc: NodeDesc) -> NodeId {
        let mut scene_node = SceneNode::new(desc.kind, desc.transform);
        for (kind, bytes) in desc.resources {
            scene_node
                .resources
                .push(self.allocations.insert(GpuAllocation { kind, bytes }));
        }
        self.nodes.insert(scene_node)
    }

    fn allocate(&mut self, kind: GpuResourceKind, bytes: u64) -> GpuResourceId {
        self.allocations.insert(GpuAllocation { kind, bytes })
    }

    fn retire_allocation(&mut self, id: GpuResourceId) -> Option<RetiredResource> {
        self.allocations
            .remove(id)
            .map(|allocation| RetiredResource {
                id,
                kind: allocation.kind,
            })
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node).and_then(|node| node.parent)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(node)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    fn attach(&mut self, node: NodeId, parent: NodeId) -> bool {
        if node == self.root || !self.contains(node) || !self.contains(parent) {
            return false;
        }
        if self.is_ancestor_or_self(node, parent) {
            return false;
        }
        self.detach(node);
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.push(node);
        }
        if let Some(scene_node) = self.nodes.get_mut(node) {
            scene_node.parent = Some(parent);
        }
        true
    }

    fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.nodes.get_mut(node).and_then(|node| node.parent.take()) else {
            return;
        };
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.retain(|child| *child != node);
        }
    }

    fn flags(&self, node: NodeId) -> Option<NodeFlags> {
        self.nodes.get(node).map(|node| node.flags)
    }

    fn set_visibility(&mut self, node: NodeId, visible: bool, propagate_to_children: bool) {
        let targets = if propagate_to_children {
            self.subtree_post_order(node)
        } else {
            vec![node]
        };
        for target in targets {
            if let Some(scene_node) = self.nodes.get_mut(target) {
                scene_node.flags.set(NodeFlags::VISIBLE, visible);
            }
        }
    }

    fn set_collision(&mut self, node: NodeId, mode: CollisionMode) {
        let collision = NodeFlags::QUERY_COLLISION | NodeFlags::PHYSICS_COLLISION;
        for target in self.subtree_post_order(node) {
            if let Some(scene_node) = self.nodes.get_mut(target) {
                scene_node.flags.remove(collision);
                scene_node.flags.insert(mode.flags());
            }
        }
    }

    fn interaction_policy(&self, node: NodeId) -> Option<InteractionPolicy> {
        self.nodes.get(node).map(|node| node.policy)
    }

    fn set_interaction_policy(&mut self, node: NodeId, policy: InteractionPolicy) {
        for target in self.subtree_post_order(node) {
            if let Some(scene_node) = self.nodes.get_mut(target) {
                if scene_node.policy != policy {
                    scene_node.policy = policy;
                }
            }
        }
    }

    fn set_fade(&mut self, node: NodeId, percentage: f32, fading_in: bool) {
        for target in self.subtree_post_order(node) {
            if let Some(scene_node) = self.nodes.get_mut(target) {
                scene_node.fade = (percentage, fading_in);
            }
        }
    }

    fn fade(&self, node: NodeId) -> Option<(f32, bool)> {
        self.nodes.get(node).map(|node| node.fade)
    }

    fn bind_overlay(
        &mut self,
        node: NodeId,
        slot: OverlaySlot,
        texture: GpuResourceId,
        placement: OverlayPlacement,
    ) {
        if let Some(scene_node) = self.nodes.get_mut(node) {
            scene_node.overlays.insert(slot, (texture, placement));
        }
    }

    fn unbind_overlay(&mut self, node: NodeId, slot: OverlaySlot) {
        if let Some(scene_node) = self.nodes.get_mut(node) {
            scene_node.overlays.remove(&slot);
        }
    }

    fn overlay(&self, node: NodeId, slot: OverlaySlot) -> Option<(GpuResourceId, OverlayPlacement)> {
        self.nodes
            .get(node)
            .and_then(|node| node.overlays.get(&slot).copied())
    }

    fn destroy_recursively(&mut self, node: NodeId) -> Vec<RetiredResource> {
        if node == self.root {
            warn!("refusing to destroy the scene root");
            return Vec::new();
        }
        if !self.contains(node) {
            return Vec::new();
        }

        self.set_visibility(node, false, true);
        self.set_collision(node, CollisionMode::NoCollision);
        self.detach(node);

        let mut retired = Vec::new();
        for target in self.subtree_post_order(node) {
            let Some(scene_node) = self.nodes.remove(target) else {
                continue;
            };
            for resource in scene_node.resources {
                if let Some(allocation) = self.allocations.remove(resource) {
                    retired.push(RetiredResource {
                        id: resource,
                        kind: allocation.kind,
                    });
                }
            }
        }
        trace!(?node, retired = retired.len(), "scene subtree destroyed");
        retired
    }
}
