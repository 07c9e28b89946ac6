// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Deepest sierpinski subdivision accepted from configuration.
pub const MAX_SIERPINSKI_DEPTH: u32 = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: [f32; 2], color: [f32; 3]) -> Self {
        Self {
            position: Vec2::from_array(position),
            color: Vec3::from_array(color),
        }
    }

    fn midpoint(self, other: Vertex) -> Vertex {
        Vertex {
            position: self.position.lerp(other.position, 0.5),
            color: self.color.lerp(other.color, 0.5),
        }
    }
}

/// The default mesh: one triangle in clip space, red/green/blue corners.
pub fn base_triangle() -> [Vertex; 3] {
    [
        Vertex::new([0.0, -0.5], [1.0, 0.0, 0.0]),
        Vertex::new([0.5, 0.5], [0.0, 1.0, 0.0]),
        Vertex::new([-0.5, 0.5], [0.0, 0.0, 1.0]),
    ]
}

/// Recursively subdivides the triangle `(left, top, right)`.
///
/// Depth 0 yields exactly one triangle. Each further level replaces the
/// triangle with three corner triangles built from the edge midpoints, so
/// the result holds `3^(depth + 1)` vertices. Branches share nothing.
pub fn sierpinski(depth: u32, left: Vertex, top: Vertex, right: Vertex) -> Vec<Vertex> {
    if depth == 0 {
        return vec![top, right, left];
    }

    let left_top = left.midpoint(top);
    let right_top = right.midpoint(top);
    let left_right = left.midpoint(right);

    let mut out = sierpinski(depth - 1, left, left_top, left_right);
    out.extend(sierpinski(depth - 1, left_right, right_top, right));
    out.extend(sierpinski(depth - 1, left_top, top, right_top));
    out
}

/// The base triangle subdivided `depth` times (clamped to `MAX_SIERPINSKI_DEPTH`).
pub fn triangle_mesh(depth: u32) -> Vec<Vertex> {
    let [top, right, left] = base_triangle();
    sierpinski(depth.min(MAX_SIERPINSKI_DEPTH), left, top, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 5 * 4);
        assert_eq!(std::mem::offset_of!(Vertex, color), 2 * 4);
    }

    #[test]
    fn depth_zero_is_the_base_triangle() {
        let mesh = triangle_mesh(0);
        assert_eq!(mesh, base_triangle().to_vec());
    }

    #[test]
    fn each_level_triples_the_triangle_count() {
        for depth in 0..5 {
            assert_eq!(triangle_mesh(depth).len(), 3 * 3usize.pow(depth));
        }
    }

    #[test]
    fn depth_is_clamped() {
        assert_eq!(
            triangle_mesh(MAX_SIERPINSKI_DEPTH + 3).len(),
            triangle_mesh(MAX_SIERPINSKI_DEPTH).len()
        );
    }

    #[test]
    fn first_subdivision_uses_edge_midpoints() {
        let [top, right, left] = base_triangle();
        let mesh = sierpinski(1, left, top, right);
        let left_top = Vec2::new(-0.25, 0.0);
        let right_top = Vec2::new(0.25, 0.0);
        let left_right = Vec2::new(0.0, 0.5);

        // (top, right, left) of the lower-left corner triangle
        assert_eq!(mesh[0].position, left_top);
        assert_eq!(mesh[1].position, left_right);
        assert_eq!(mesh[2].position, left.position);
        // the top corner triangle keeps the apex
        assert_eq!(mesh[6].position, top.position);
        assert_eq!(mesh[7].position, right_top);
        assert!(mesh.iter().all(|v| v.color.min_element() >= 0.0 && v.color.max_element() <= 1.0));
    }
}
