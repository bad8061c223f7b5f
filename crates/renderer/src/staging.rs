use tiles::{MeshPrimitive, PointCloudContent, TransformMatrix4x4};
use tracing::warn;

use crate::PrepareError;

const POSITION_BYTES: u64 = 12;
const NORMAL_BYTES: u64 = 12;
const TANGENT_BYTES: u64 = 16;
const TEX_COORD_BYTES: u64 = 8;
const INDEX_BYTES: u64 = 4;
const POINT_COLOR_BYTES: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn from_points(points: &[[f32; 3]]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bounds = Aabb {
            min: *first,
            max: *first,
        };
        for point in rest {
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(point[axis]);
                bounds.max[axis] = bounds.max[axis].max(point[axis]);
            }
        }
        Some(bounds)
    }

    pub fn union(self, other: Aabb) -> Aabb {
        let mut merged = self;
        for axis in 0..3 {
            merged.min[axis] = merged.min[axis].min(other.min[axis]);
            merged.max[axis] = merged.max[axis].max(other.max[axis]);
        }
        merged
    }
}

/// GPU-ready description of one mesh primitive. Produced off the owner
/// thread, consumed exactly once when the tile is finalized.
#[derive(Debug, PartialEq)]
pub struct StagedPrimitive {
    pub vertex_count: usize,
    pub vertex_bytes: u64,
    pub index_bytes: u64,
    pub collision_bytes: Option<u64>,
    pub has_tangents: bool,
    pub bounds: Option<Aabb>,
}

#[derive(Debug, PartialEq)]
pub struct StagedPointCloud {
    pub point_count: usize,
    pub point_bytes: u64,
    pub bounds: Option<Aabb>,
}

/// `0..vertex_count` as an index buffer.
pub(crate) fn sequential_indices(
    primitive_index: usize,
    vertex_count: usize,
) -> Result<Vec<u32>, PrepareError> {
    let count = u32::try_from(vertex_count).map_err(|_| PrepareError::TooManyVertices {
        primitive: primitive_index,
        vertex_count,
    })?;
    Ok((0..count).collect())
}

pub(crate) fn validate_primitive(
    primitive_index: usize,
    primitive: &MeshPrimitive,
) -> Result<(), PrepareError> {
    if primitive.indices.len() % 3 != 0 {
        return Err(PrepareError::IncompleteTriangle {
            primitive: primitive_index,
            index_count: primitive.indices.len(),
        });
    }
    let vertex_count = primitive.positions.len();
    if let Some(index) = primitive
        .indices
        .iter()
        .copied()
        .find(|index| *index as usize >= vertex_count)
    {
        return Err(PrepareError::IndexOutOfRange {
            primitive: primitive_index,
            index,
            vertex_count,
        });
    }
    Ok(())
}

fn realign<T: Clone>(
    attribute: &mut Option<Vec<T>>,
    vertex_count: usize,
    fill: T,
    name: &'static str,
    primitive_index: usize,
) {
    let Some(values) = attribute.as_mut() else {
        return;
    };
    if values.len() != vertex_count {
        warn!(
            primitive = primitive_index,
            attribute = name,
            found = values.len(),
            expected = vertex_count,
            "vertex attribute length mismatch, realigning"
        );
        values.resize(vertex_count, fill);
    }
}

/// Pad or truncate parallel vertex attributes to the position count.
pub(crate) fn realign_attributes(primitive_index: usize, primitive: &mut MeshPrimitive) {
    let vertex_count = primitive.positions.len();
    realign(
        &mut primitive.normals,
        vertex_count,
        [0.0, 0.0, 1.0],
        "normal",
        primitive_index,
    );
    realign(
        &mut primitive.tangents,
        vertex_count,
        [1.0, 0.0, 0.0, 1.0],
        "tangent",
        primitive_index,
    );
    realign(
        &mut primitive.tex_coords,
        vertex_count,
        [0.0, 0.0],
        "tex_coord",
        primitive_index,
    );
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize_or(v: [f32; 3], fallback: [f32; 3]) -> [f32; 3] {
    let length = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if length <= f32::EPSILON || !length.is_finite() {
        return fallback;
    }
    [v[0] / length, v[1] / length, v[2] / length]
}

fn unindex<T: Copy>(values: &[T], indices: &[u32]) -> Vec<T> {
    indices.iter().map(|index| values[*index as usize]).collect()
}

/// Flat normals: every triangle gets its own three vertices carrying the
/// face normal, so the primitive is de-indexed. Indices must already be
/// validated.
pub(crate) fn generate_flat_normals(
    primitive_index: usize,
    primitive: &mut MeshPrimitive,
) -> Result<(), PrepareError> {
    let sequential = sequential_indices(primitive_index, primitive.indices.len())?;
    let indices = std::mem::take(&mut primitive.indices);
    let positions = unindex(&primitive.positions, &indices);
    let normals = positions
        .chunks_exact(3)
        .flat_map(|triangle| {
            let face = normalize_or(
                cross(sub(triangle[1], triangle[0]), sub(triangle[2], triangle[0])),
                [0.0, 0.0, 1.0],
            );
            [face; 3]
        })
        .collect();
    primitive.tangents = primitive
        .tangents
        .as_deref()
        .map(|tangents| unindex(tangents, &indices));
    primitive.tex_coords = primitive
        .tex_coords
        .as_deref()
        .map(|tex_coords| unindex(tex_coords, &indices));
    primitive.indices = sequential;
    primitive.positions = positions;
    primitive.normals = Some(normals);
    Ok(())
}

/// Per-vertex tangents from texture coordinates, falling back to +X when the
/// UV mapping is degenerate.
pub(crate) fn generate_tangents(primitive: &mut MeshPrimitive) {
    let vertex_count = primitive.positions.len();
    let mut accumulated = vec![[0.0_f32; 3]; vertex_count];
    if let Some(tex_coords) = primitive.tex_coords.as_ref() {
        for triangle in primitive.indices.chunks_exact(3) {
            let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|index| index as usize);
            let edge1 = sub(primitive.positions[b], primitive.positions[a]);
            let edge2 = sub(primitive.positions[c], primitive.positions[a]);
            let du1 = tex_coords[b][0] - tex_coords[a][0];
            let dv1 = tex_coords[b][1] - tex_coords[a][1];
            let du2 = tex_coords[c][0] - tex_coords[a][0];
            let dv2 = tex_coords[c][1] - tex_coords[a][1];
            let determinant = du1 * dv2 - du2 * dv1;
            if determinant.abs() <= f32::EPSILON {
                continue;
            }
            let r = 1.0 / determinant;
            let tangent = [
                (edge1[0] * dv2 - edge2[0] * dv1) * r,
                (edge1[1] * dv2 - edge2[1] * dv1) * r,
                (edge1[2] * dv2 - edge2[2] * dv1) * r,
            ];
            for vertex in [a, b, c] {
                for axis in 0..3 {
                    accumulated[vertex][axis] += tangent[axis];
                }
            }
        }
    }
    primitive.tangents = Some(
        accumulated
            .into_iter()
            .map(|tangent| {
                let [x, y, z] = normalize_or(tangent, [1.0, 0.0, 0.0]);
                [x, y, z, 1.0]
            })
            .collect(),
    );
}

pub(crate) fn stage_primitive(primitive: &MeshPrimitive, create_collision: bool) -> StagedPrimitive {
    let vertex_count = primitive.positions.len();
    let per_vertex = POSITION_BYTES
        + primitive.normals.as_ref().map_or(0, |_| NORMAL_BYTES)
        + primitive.tangents.as_ref().map_or(0, |_| TANGENT_BYTES)
        + primitive.tex_coords.as_ref().map_or(0, |_| TEX_COORD_BYTES);
    let index_bytes = primitive.indices.len() as u64 * INDEX_BYTES;
    let collision_bytes = (create_collision && primitive.triangle_count() > 0)
        .then(|| vertex_count as u64 * POSITION_BYTES + index_bytes);

    StagedPrimitive {
        vertex_count,
        vertex_bytes: vertex_count as u64 * per_vertex,
        index_bytes,
        collision_bytes,
        has_tangents: primitive.tangents.is_some(),
        bounds: Aabb::from_points(&primitive.positions),
    }
}

pub(crate) fn stage_point_cloud(points: &mut PointCloudContent) -> StagedPointCloud {
    let point_count = points.positions.len();
    if let Some(colors) = points.colors.as_mut() {
        if colors.len() != point_count {
            warn!(
                found = colors.len(),
                expected = point_count,
                "point color count mismatch, realigning"
            );
            colors.resize(point_count, [255, 255, 255, 255]);
        }
    }
    let per_point = POSITION_BYTES + points.colors.as_ref().map_or(0, |_| POINT_COLOR_BYTES);
    StagedPointCloud {
        point_count,
        point_bytes: point_count as u64 * per_point,
        bounds: Aabb::from_points(&points.positions),
    }
}

/// Column-major 4x4 product `a * b`.
pub fn multiply_transforms(a: &TransformMatrix4x4, b: &TransformMatrix4x4) -> TransformMatrix4x4 {
    let mut out = [0.0; 16];
    for column in 0..4 {
        for row in 0..4 {
            out[column * 4 + row] = (0..4)
                .map(|k| a[k * 4 + row] * b[column * 4 + k])
                .sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> MeshPrimitive {
        MeshPrimitive {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            tex_coords: Some(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]),
            indices: vec![0, 1, 2],
            ..MeshPrimitive::default()
        }
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut primitive = triangle();
        primitive.indices = vec![0, 1, 3];
        assert_eq!(
            validate_primitive(2, &primitive),
            Err(PrepareError::IndexOutOfRange {
                primitive: 2,
                index: 3,
                vertex_count: 3,
            })
        );
    }

    #[test]
    fn vertex_counts_beyond_u32_are_rejected() {
        assert_eq!(sequential_indices(0, 4).unwrap(), vec![0, 1, 2, 3]);
        let too_many = u32::MAX as usize + 1;
        assert_eq!(
            sequential_indices(1, too_many),
            Err(PrepareError::TooManyVertices {
                primitive: 1,
                vertex_count: too_many,
            })
        );
    }

    #[test]
    fn flat_normals_face_the_winding_direction() {
        let mut primitive = triangle();
        generate_flat_normals(0, &mut primitive).unwrap();
        let normals = primitive.normals.expect("normals");
        assert!(normals.iter().all(|normal| *normal == [0.0, 0.0, 1.0]));
    }

    #[test]
    fn flat_normals_split_shared_vertices() {
        let mut primitive = MeshPrimitive {
            positions: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
            tex_coords: Some(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]),
            indices: vec![0, 1, 2, 0, 3, 1],
            ..MeshPrimitive::default()
        };
        generate_flat_normals(0, &mut primitive).unwrap();

        assert_eq!(primitive.positions.len(), 6);
        assert_eq!(primitive.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(primitive.tex_coords.as_ref().map(Vec::len), Some(6));
        let normals = primitive.normals.expect("normals");
        assert_eq!(normals[0], [0.0, 0.0, 1.0]);
        assert_eq!(normals[3], [0.0, 1.0, 0.0]);
    }

    #[test]
    fn tangents_follow_u_direction() {
        let mut primitive = triangle();
        generate_tangents(&mut primitive);
        let tangents = primitive.tangents.expect("tangents");
        assert!(tangents.iter().all(|tangent| *tangent == [1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn short_attribute_arrays_are_padded() {
        let mut primitive = triangle();
        primitive.tex_coords = Some(vec![[0.5, 0.5]]);
        realign_attributes(0, &mut primitive);
        assert_eq!(primitive.tex_coords.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn collision_is_skipped_without_triangles() {
        let primitive = MeshPrimitive {
            positions: vec![[0.0; 3]],
            ..MeshPrimitive::default()
        };
        assert_eq!(stage_primitive(&primitive, true).collision_bytes, None);
        assert!(stage_primitive(&triangle(), true).collision_bytes.is_some());
    }

    #[test]
    fn identity_is_neutral_for_multiplication() {
        let mut translation = tiles::IDENTITY_TRANSFORM;
        translation[12] = 3.0;
        assert_eq!(
            multiply_transforms(&tiles::IDENTITY_TRANSFORM, &translation),
            translation
        );
        let doubled = multiply_transforms(&translation, &translation);
        assert_eq!(doubled[12], 6.0);
    }
}
