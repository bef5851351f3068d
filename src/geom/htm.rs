//! Hierarchical Triangular Mesh indexing and spherical triangles.
//!
//! HTM triangles are subdivided into 4 sub-triangles as follows:
//!
//! ```text
//!         v2
//!          *
//!         / \
//!        /   \
//!   sv1 *-----* sv0
//!      / \   / \
//!     /   \ /   \
//! v0 *-----*-----* v1
//!         sv2
//! ```
//!
//! Vertices are unit 3-vectors stored counter-clockwise (seen from outside
//! the sphere), edges are great circles, and `sv0 = (v1 + v2).normalize()`
//! and so on. If a triangle has index I, its children T0..T3 have indexes
//! 4I, 4I+1, 4I+2, 4I+3 with T0 = (v0, sv2, sv1), T1 = (v1, sv0, sv2),
//! T2 = (v2, sv1, sv0) and T3 = (sv0, sv1, sv2).
//!
//! The 8 root triangles at subdivision level 0 carry ids 8..=15: S0..S3
//! cover the southern hemisphere and N0..N3 the northern one.

use glam::{DMat3, DVec3};

use crate::core::error::{Error, ErrorKind, Result};
use crate::geom::sphere::SphericalBox;

/// Maximum HTM subdivision level such that an id requires < 32 bits.
pub const HTM_MAX_LEVEL: i32 = 13;

const X: DVec3 = DVec3::new(1.0, 0.0, 0.0);
const Y: DVec3 = DVec3::new(0.0, 1.0, 0.0);
const Z: DVec3 = DVec3::new(0.0, 0.0, 1.0);
const NX: DVec3 = DVec3::new(-1.0, 0.0, 0.0);
const NY: DVec3 = DVec3::new(0.0, -1.0, 0.0);
const NZ: DVec3 = DVec3::new(0.0, 0.0, -1.0);

/// Vertex triplet for each HTM root triangle (S0..S3, N0..N3).
const ROOT_VERT: [[DVec3; 3]; 8] = [
    [X, NZ, Y],
    [Y, NZ, NX],
    [NX, NZ, NY],
    [NY, NZ, X],
    [X, Z, NY],
    [NY, Z, NX],
    [NX, Z, Y],
    [Y, Z, X],
];

// Root triangle numbers. Add 8 to obtain a level 0 HTM id.
const S0: u32 = 0;
const S1: u32 = 1;
const S2: u32 = 2;
const S3: u32 = 3;
const N0: u32 = 4;
const N1: u32 = 5;
const N2: u32 = 6;
const N3: u32 = 7;

/// Number of the HTM root triangle containing v.
fn root_num_for(v: DVec3) -> u32 {
    if v.z < 0.0 {
        if v.y > 0.0 {
            if v.x > 0.0 { S0 } else { S1 }
        } else if v.y == 0.0 {
            if v.x >= 0.0 { S0 } else { S2 }
        } else if v.x < 0.0 {
            S2
        } else {
            S3
        }
    } else if v.y > 0.0 {
        if v.x > 0.0 { N3 } else { N2 }
    } else if v.y == 0.0 {
        if v.x >= 0.0 { N3 } else { N1 }
    } else if v.x < 0.0 {
        N1
    } else {
        N0
    }
}

/// Compute the HTM id of the given point at the given subdivision level.
pub fn htm_id(v: DVec3, level: i32) -> Result<u32> {
    if !(0..=HTM_MAX_LEVEL).contains(&level) {
        return Err(Error::new(
            ErrorKind::Config,
            format!("invalid HTM subdivision level: {}", level),
        ));
    }
    let r = root_num_for(v);
    let mut id = r + 8;
    if level == 0 {
        return Ok(id);
    }
    let [mut v0, mut v1, mut v2] = ROOT_VERT[r as usize];
    for _ in 0..level {
        let sv1 = (v2 + v0).normalize();
        let sv2 = (v0 + v1).normalize();
        if v.dot((sv1 + sv2).cross(sv1 - sv2)) >= 0.0 {
            v1 = sv2;
            v2 = sv1;
            id <<= 2;
            continue;
        }
        let sv0 = (v1 + v2).normalize();
        if v.dot((sv2 + sv0).cross(sv2 - sv0)) >= 0.0 {
            v0 = v1;
            v1 = sv0;
            v2 = sv2;
            id = (id << 2) + 1;
            continue;
        }
        if v.dot((sv0 + sv1).cross(sv0 - sv1)) >= 0.0 {
            v0 = v2;
            v1 = sv1;
            v2 = sv0;
            id = (id << 2) + 2;
        } else {
            v0 = sv0;
            v1 = sv1;
            v2 = sv2;
            id = (id << 2) + 3;
        }
    }
    Ok(id)
}

/// Subdivision level of the given id, or -1 if the id is malformed.
pub fn htm_level(id: u32) -> i32 {
    if id < 8 {
        return -1;
    }
    // The index of the most significant bit must be even and the 4 bits
    // below it must place the root in 8..=15.
    let msb = 31 - id.leading_zeros();
    let level = msb as i32 - 3;
    if level & 1 != 0 || level > HTM_MAX_LEVEL * 2 {
        return -1;
    }
    if (id >> level) & 0x8 == 0 {
        return -1;
    }
    level >> 1
}

/// Total number of triangles at the given level; also the smallest valid
/// HTM id of the next level up.
pub fn num_triangles(level: i32) -> u32 {
    8u32 << (2 * level)
}

/// Vertices of the triangle with the given HTM id.
fn vertices(id: u32) -> Result<[DVec3; 3]> {
    let level = htm_level(id);
    if level < 0 {
        return Err(Error::new(
            ErrorKind::Config,
            format!("invalid HTM id: {}", id),
        ));
    }
    let r = (id >> (level * 2)) - 8;
    let [mut v0, mut v1, mut v2] = ROOT_VERT[r as usize];
    for l in (0..level).rev() {
        let child = (id >> (l * 2)) & 0x3;
        let sv0 = (v1 + v2).normalize();
        let sv1 = (v2 + v0).normalize();
        let sv2 = (v0 + v1).normalize();
        match child {
            0 => {
                v1 = sv2;
                v2 = sv1;
            }
            1 => {
                v0 = v1;
                v1 = sv0;
                v2 = sv2;
            }
            2 => {
                v0 = v2;
                v1 = sv1;
                v2 = sv0;
            }
            _ => {
                v0 = sv0;
                v1 = sv1;
                v2 = sv2;
            }
        }
    }
    Ok([v0, v1, v2])
}

/// A triangle on the unit sphere with great-circle edges.
///
/// The vertex matrix M has the triangle vertices as columns; its inverse
/// converts cartesian coordinates to spherical barycentric ones, so a
/// record in source trixel s maps into destination trixel d through
/// `M_d * M_s^-1`.
#[derive(Debug, Clone)]
pub struct SphericalTriangle {
    m: DMat3,
    mi: DMat3,
}

impl SphericalTriangle {
    /// Construct the HTM triangle with the given id.
    pub fn new(id: u32) -> Result<Self> {
        let [v0, v1, v2] = vertices(id)?;
        Ok(SphericalTriangle::from_vertices(v0, v1, v2))
    }

    pub fn from_vertices(v0: DVec3, v1: DVec3, v2: DVec3) -> Self {
        let m = DMat3::from_cols(v0, v1, v2);
        SphericalTriangle { m, mi: m.inverse() }
    }

    /// The i-th vertex (i = 0, 1, 2).
    pub fn vertex(&self, i: usize) -> DVec3 {
        self.m.col(i)
    }

    /// Matrix converting cartesian to spherical barycentric coordinates.
    pub fn barycentric_transform(&self) -> DMat3 {
        self.mi
    }

    /// Matrix converting spherical barycentric to cartesian coordinates.
    pub fn cartesian_transform(&self) -> DMat3 {
        self.m
    }

    pub fn to_barycentric(&self, v: DVec3) -> DVec3 {
        self.mi * v
    }

    pub fn to_cartesian(&self, b: DVec3) -> DVec3 {
        self.m * b
    }

    /// Bounding box of this triangle.
    pub fn bounding_box(&self) -> SphericalBox {
        SphericalBox::from_triangle(self.vertex(0), self.vertex(1), self.vertex(2))
    }

    /// Area of the triangle in steradians.
    pub fn area(&self) -> f64 {
        let poly = [
            (self.vertex(0), EdgeKind::Great),
            (self.vertex(1), EdgeKind::Great),
            (self.vertex(2), EdgeKind::Great),
        ];
        loop_area(&poly)
    }

    /// Area of the intersection of this triangle with a spherical box.
    ///
    /// Boxes with an RA extent strictly between 180 and 360 degrees are
    /// not supported.
    pub fn intersection_area(&self, b: &SphericalBox) -> Result<f64> {
        let extent = b.ra_extent();
        if extent > 180.0 && extent < 360.0 {
            return Err(Error::new(
                ErrorKind::Config,
                "unsupported spherical box: RA extent in (180, 360) deg".to_string(),
            ));
        }
        let mut poly: Vec<(DVec3, EdgeKind)> = vec![
            (self.vertex(0), EdgeKind::Great),
            (self.vertex(1), EdgeKind::Great),
            (self.vertex(2), EdgeKind::Great),
        ];
        use crate::geom::sphere::RAD_PER_DEG;
        if extent < 360.0 {
            // A lune of extent <= 180 deg is the intersection of two
            // hemispheres bounded by the meridian planes.
            let n_min = meridian_normal(b.ra_min());
            let n_max = meridian_normal(b.ra_max());
            poly = clip_plane(&poly, n_min);
            poly = clip_plane(&poly, -n_max);
        }
        if b.dec_min() > -90.0 {
            poly = clip_z(&poly, (b.dec_min() * RAD_PER_DEG).sin(), true);
        }
        if b.dec_max() < 90.0 {
            poly = clip_z(&poly, (b.dec_max() * RAD_PER_DEG).sin(), false);
        }
        Ok(loop_area(&poly))
    }
}

/// Conservative list of level-L triangles potentially overlapping the box.
pub fn htm_ids_overlapping(b: &SphericalBox, level: i32) -> Result<Vec<u32>> {
    if !(0..=HTM_MAX_LEVEL).contains(&level) {
        return Err(Error::new(
            ErrorKind::Config,
            format!("invalid HTM subdivision level: {}", level),
        ));
    }
    let mut ids = Vec::new();
    for r in 0..8u32 {
        let [v0, v1, v2] = ROOT_VERT[r as usize];
        find_ids(r + 8, level, v0, v1, v2, b, &mut ids);
    }
    Ok(ids)
}

fn find_ids(
    id: u32,
    level: i32,
    v0: DVec3,
    v1: DVec3,
    v2: DVec3,
    b: &SphericalBox,
    ids: &mut Vec<u32>,
) {
    if !b.intersects(&SphericalBox::from_triangle(v0, v1, v2)) {
        return;
    }
    if level == 0 {
        ids.push(id);
        return;
    }
    let sv0 = (v1 + v2).normalize();
    let sv1 = (v2 + v0).normalize();
    let sv2 = (v0 + v1).normalize();
    find_ids(id << 2, level - 1, v0, sv2, sv1, b, ids);
    find_ids((id << 2) + 1, level - 1, v1, sv0, sv2, b, ids);
    find_ids((id << 2) + 2, level - 1, v2, sv1, sv0, b, ids);
    find_ids((id << 2) + 3, level - 1, sv0, sv1, sv2, b, ids);
}

// ---------------------------------------------------------------------------
// Spherical polygon clipping and area.
//
// A polygon is a counter-clockwise vertex loop where each vertex carries the
// kind of the edge leading to the next vertex: a great-circle arc, or an arc
// of the parallel at height z (introduced by declination clipping).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum EdgeKind {
    Great,
    Parallel(f64),
}

/// Outward normal of the half-space of points east of the given meridian
/// (within 180 degrees).
fn meridian_normal(ra: f64) -> DVec3 {
    use crate::geom::sphere::RAD_PER_DEG;
    let t = ra * RAD_PER_DEG;
    DVec3::new(-t.sin(), t.cos(), 0.0)
}

const CLIP_EPS: f64 = 1e-12;

/// Clip a polygon of great-circle edges against the half-space n.p >= 0.
/// New boundary edges run along the clip plane's great circle.
fn clip_plane(poly: &[(DVec3, EdgeKind)], n: DVec3) -> Vec<(DVec3, EdgeKind)> {
    let mut out = Vec::with_capacity(poly.len() + 2);
    let len = poly.len();
    for i in 0..len {
        let (a, kind) = poly[i];
        let (b, _) = poly[(i + 1) % len];
        let da = n.dot(a);
        let db = n.dot(b);
        let a_in = da >= -CLIP_EPS;
        let b_in = db >= -CLIP_EPS;
        if a_in {
            out.push((a, kind));
        }
        if a_in != b_in {
            let m = a.cross(b);
            let d = n.cross(m);
            if d.length_squared() > CLIP_EPS {
                let mut p = d.normalize();
                // pick the intersection lying on the arc
                if a.cross(p).dot(m) < 0.0 || p.cross(b).dot(m) < 0.0 {
                    p = -p;
                }
                // Leaving the region: the next output edge runs along the
                // clip circle, which is a great circle.
                out.push((p, EdgeKind::Great));
            }
        }
    }
    out
}

/// Clip a polygon against the half-space z >= z0 (keep_above) or z <= z0.
/// New boundary edges run along the parallel at height z0. Great-circle
/// edges may cross the parallel twice.
fn clip_z(poly: &[(DVec3, EdgeKind)], z0: f64, keep_above: bool) -> Vec<(DVec3, EdgeKind)> {
    let inside = |p: DVec3| {
        if keep_above {
            p.z >= z0 - CLIP_EPS
        } else {
            p.z <= z0 + CLIP_EPS
        }
    };
    let mut out = Vec::with_capacity(poly.len() + 4);
    let len = poly.len();
    for i in 0..len {
        let (a, kind) = poly[i];
        let (b, _) = poly[(i + 1) % len];
        let mut crossings: Vec<DVec3> = Vec::new();
        if kind == EdgeKind::Great {
            let m = a.cross(b);
            if m.length_squared() > CLIP_EPS {
                let n = m.normalize();
                let h2 = n.x * n.x + n.y * n.y;
                if h2 > CLIP_EPS {
                    // points of the edge circle at height z0
                    let r2 = 1.0 - z0 * z0;
                    let c = -n.z * z0 / h2;
                    let d2 = r2 - c * c * h2;
                    if d2 > 0.0 {
                        let t = (d2 / h2).sqrt();
                        for s in [t, -t] {
                            let p = DVec3::new(c * n.x - s * n.y, c * n.y + s * n.x, z0);
                            let on_arc =
                                a.cross(p).dot(n) >= -CLIP_EPS && p.cross(b).dot(n) >= -CLIP_EPS;
                            if on_arc {
                                crossings.push(p);
                            }
                        }
                        // order by position along the arc
                        if crossings.len() == 2 {
                            let ref_dir = n.cross(a);
                            let ang = |p: DVec3| p.dot(ref_dir).atan2(p.dot(a));
                            if ang(crossings[0]) > ang(crossings[1]) {
                                crossings.swap(0, 1);
                            }
                        }
                    }
                }
            }
        }
        let mut cur_in = inside(a);
        if cur_in {
            out.push((a, kind));
        }
        for p in crossings {
            cur_in = !cur_in;
            if cur_in {
                // entering: the following piece continues the original edge
                out.push((p, kind));
            } else {
                // leaving: the following edge runs along the parallel
                out.push((p, EdgeKind::Parallel(z0)));
            }
        }
    }
    out
}

/// Area enclosed by a counter-clockwise vertex loop, in steradians.
///
/// Uses the boundary integral of (1 - sin dec) d(ra); great-circle edges
/// have a closed-form antiderivative and parallel edges contribute
/// (1 - z0) * delta_ra. The |winding| term absorbs loops around a pole.
fn loop_area(poly: &[(DVec3, EdgeKind)]) -> f64 {
    let len = poly.len();
    if len < 3 {
        return 0.0;
    }
    let lambda = |p: DVec3, other: DVec3| -> f64 {
        // longitude in radians, borrowing the neighbor's at the poles
        if p.x * p.x + p.y * p.y < CLIP_EPS {
            other.y.atan2(other.x)
        } else {
            p.y.atan2(p.x)
        }
    };
    let mut winding = 0.0;
    let mut s = 0.0;
    for i in 0..len {
        let (a, kind) = poly[i];
        let (b, _) = poly[(i + 1) % len];
        let la = lambda(a, b);
        let lb = lambda(b, a);
        let mut dl = lb - la;
        if dl > std::f64::consts::PI {
            dl -= 2.0 * std::f64::consts::PI;
        } else if dl < -std::f64::consts::PI {
            dl += 2.0 * std::f64::consts::PI;
        }
        winding += dl;
        match kind {
            EdgeKind::Parallel(z0) => {
                s += z0 * dl;
            }
            EdgeKind::Great => {
                let m = a.cross(b);
                if m.length_squared() < CLIP_EPS {
                    continue;
                }
                let n = m.normalize();
                if n.z.abs() > CLIP_EPS {
                    let w = |p: DVec3| n.y * p.x - n.x * p.y;
                    s += (w(b) / n.z).atan() - (w(a) / n.z).atan();
                }
            }
        }
    }
    let area = winding.abs() - s;
    area.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::sphere::{cartesian, spherical};

    #[test]
    fn test_root_of_x_axis_is_n3() {
        assert_eq!(htm_id(DVec3::new(1.0, 0.0, 0.0), 0).unwrap(), 15);
        assert_eq!(htm_level(15), 0);
        assert_eq!(htm_level(7), -1);
    }

    #[test]
    fn test_level_round_trip() {
        let dirs = [
            cartesian(0.0, 0.0),
            cartesian(123.4, 56.7),
            cartesian(359.9, -89.9),
            cartesian(45.0, -0.1),
            cartesian(180.0, 33.0),
        ];
        for level in 0..=HTM_MAX_LEVEL {
            for v in dirs {
                let id = htm_id(v, level).unwrap();
                assert_eq!(htm_level(id), level, "id {}", id);
            }
        }
    }

    #[test]
    fn test_invalid_levels_are_rejected() {
        assert!(htm_id(DVec3::X, -1).is_err());
        assert!(htm_id(DVec3::X, 14).is_err());
        assert!(SphericalTriangle::new(7).is_err());
    }

    #[test]
    fn test_malformed_ids_have_level_minus_one() {
        // below the root range
        assert_eq!(htm_level(0), -1);
        assert_eq!(htm_level(7), -1);
        // most significant bit at an odd position
        assert_eq!(htm_level(16), -1);
        assert_eq!(htm_level(64), -1);
        // valid ids at the level boundaries
        assert_eq!(htm_level(8), 0);
        assert_eq!(htm_level(32), 1);
        assert_eq!(htm_level(33), 1);
        assert_eq!(htm_level(63), 1);
        assert_eq!(htm_level(128), 2);
    }

    #[test]
    fn test_trixel_contains_its_center_point() {
        for level in [1, 3, 6] {
            let v = cartesian(40.0, 25.0);
            let id = htm_id(v, level).unwrap();
            let tri = SphericalTriangle::new(id).unwrap();
            let b = tri.to_barycentric(v);
            // inside the triangle, all barycentric coordinates are positive
            assert!(b.x > 0.0 && b.y > 0.0 && b.z > 0.0, "{:?}", b);
        }
    }

    #[test]
    fn test_barycentric_round_trip() {
        let id = htm_id(cartesian(200.0, -40.0), 5).unwrap();
        let tri = SphericalTriangle::new(id).unwrap();
        for (ra, dec) in [(200.0, -40.0), (12.0, 88.0), (300.0, 5.0)] {
            let v = cartesian(ra, dec);
            let rt = tri.to_cartesian(tri.to_barycentric(v));
            assert!((rt - v).length() < 1e-12);
        }
    }

    #[test]
    fn test_root_areas_sum_to_sphere() {
        let mut total = 0.0;
        for id in 8u32..16 {
            total += SphericalTriangle::new(id).unwrap().area();
        }
        assert!((total - 4.0 * std::f64::consts::PI).abs() < 1e-9, "{}", total);
    }

    #[test]
    fn test_level2_areas_sum_to_sphere() {
        let mut total = 0.0;
        for id in num_triangles(2)..2 * num_triangles(2) {
            total += SphericalTriangle::new(id).unwrap().area();
        }
        assert!((total - 4.0 * std::f64::consts::PI).abs() < 1e-9, "{}", total);
    }

    #[test]
    fn test_intersection_with_full_box_is_triangle_area() {
        let tri = SphericalTriangle::new(htm_id(cartesian(10.0, 10.0), 3).unwrap()).unwrap();
        let full = SphericalBox::default();
        let a = tri.intersection_area(&full).unwrap();
        assert!((a - tri.area()).abs() < 1e-12);
    }

    #[test]
    fn test_intersection_with_disjoint_box_is_zero() {
        let tri = SphericalTriangle::new(htm_id(cartesian(10.0, 10.0), 4).unwrap()).unwrap();
        let far = SphericalBox::new(180.0, 190.0, -50.0, -40.0);
        assert_eq!(tri.intersection_area(&far).unwrap(), 0.0);
    }

    #[test]
    fn test_intersection_rejects_wide_boxes() {
        let tri = SphericalTriangle::new(15).unwrap();
        let wide = SphericalBox::new(0.0, 200.0, -10.0, 10.0);
        assert!(tri.intersection_area(&wide).is_err());
    }

    #[test]
    fn test_intersection_area_of_partial_overlap() {
        // An octant has area pi/2; a box covering its lower-left RA half
        // cuts it roughly in half.
        let tri = SphericalTriangle::new(15).unwrap(); // N3: ra 0..90, dec 0..90
        let half = SphericalBox::new(0.0, 45.0, -90.0, 90.0);
        let a = tri.intersection_area(&half).unwrap();
        assert!((a - std::f64::consts::FRAC_PI_4).abs() < 1e-9, "{}", a);
    }

    #[test]
    fn test_htm_ids_cover_contained_points() {
        let b = SphericalBox::new(30.0, 40.0, 10.0, 20.0);
        for level in [0, 2, 5] {
            let ids = htm_ids_overlapping(&b, level).unwrap();
            for (ra, dec) in [(30.0, 10.0), (35.0, 15.0), (40.0, 20.0)] {
                let id = htm_id(cartesian(ra, dec), level).unwrap();
                assert!(ids.contains(&id), "level {} missing {}", level, id);
            }
        }
    }

    #[test]
    fn test_htm_ids_wrapping_box() {
        let b = SphericalBox::new(359.0, 1.0, -1.0, 1.0);
        let ids = htm_ids_overlapping(&b, 6).unwrap();
        for ra in [359.1, 0.0, 0.9] {
            let id = htm_id(cartesian(ra, 0.0), 6).unwrap();
            assert!(ids.contains(&id));
        }
    }

    #[test]
    fn test_trixel_bbox_contains_vertices_and_center() {
        for seed in [(5.0, 5.0), (100.0, -45.0), (250.0, 80.0), (359.5, -0.5)] {
            let id = htm_id(cartesian(seed.0, seed.1), 7).unwrap();
            let tri = SphericalTriangle::new(id).unwrap();
            let b = tri.bounding_box();
            for i in 0..3 {
                let (ra, dec) = spherical(tri.vertex(i));
                assert!(b.contains(ra, dec), "vertex ({}, {}) outside {:?}", ra, dec, b);
            }
            let center = (tri.vertex(0) + tri.vertex(1) + tri.vertex(2)).normalize();
            let (ra, dec) = spherical(center);
            assert!(b.contains(ra, dec));
        }
    }
}
