use crate::{IDENTITY_TRANSFORM, TransformMatrix4x4};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Empty,
    Mesh,
    PointCloud,
    External,
}

impl ContentKind {
    pub fn is_renderable(self) -> bool {
        matches!(self, ContentKind::Mesh | ContentKind::PointCloud)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshPrimitive {
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub tangents: Option<Vec<[f32; 4]>>,
    pub tex_coords: Option<Vec<[f32; 2]>>,
    pub indices: Vec<u32>,
}

impl MeshPrimitive {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshContent {
    pub primitives: Vec<MeshPrimitive>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointCloudContent {
    pub positions: Vec<[f32; 3]>,
    pub colors: Option<Vec<[u8; 4]>>,
}

/// Decoded tile payload. The variant is decided once, when the engine
/// finishes decoding, and travels with the payload from then on.
#[derive(Debug, Clone, PartialEq)]
pub enum TileContent {
    Empty,
    Mesh(MeshContent),
    PointCloud(PointCloudContent),
    /// Points at another tileset; owns no renderable geometry itself.
    External {
        tileset_url: String,
    },
}

impl TileContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            TileContent::Empty => ContentKind::Empty,
            TileContent::Mesh(_) => ContentKind::Mesh,
            TileContent::PointCloud(_) => ContentKind::PointCloud,
            TileContent::External { .. } => ContentKind::External,
        }
    }
}

/// What the streaming engine hands to the worker-thread preparation phase.
#[derive(Debug, Clone, PartialEq)]
pub struct TileLoadResult {
    pub content: TileContent,
    /// Transform carried by the tile content itself (glTF up-axis, RTC center).
    pub content_transform: TransformMatrix4x4,
}

impl TileLoadResult {
    pub fn new(content: TileContent) -> Self {
        Self {
            content,
            content_transform: IDENTITY_TRANSFORM,
        }
    }

    pub fn empty() -> Self {
        Self::new(TileContent::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_geometry_is_renderable() {
        assert!(TileContent::Mesh(MeshContent::default()).kind().is_renderable());
        assert!(
            TileContent::PointCloud(PointCloudContent::default())
                .kind()
                .is_renderable()
        );
        assert!(!TileContent::Empty.kind().is_renderable());
        assert!(
            !TileContent::External {
                tileset_url: "child/tileset.json".to_owned(),
            }
            .kind()
            .is_renderable()
        );
    }
}
