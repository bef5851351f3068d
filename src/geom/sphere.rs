use glam::DVec3;

use crate::core::error::{Error, ErrorKind, Result};

pub const DEG_PER_RAD: f64 = 57.2957795130823208767981548141;
pub const RAD_PER_DEG: f64 = 0.0174532925199432957692369076849;
/// 1 milliarcsecond, in degrees. The single epsilon used for partition
/// bound snapping and segment width computations.
pub const EPSILON_DEG: f64 = 0.001 / 3600.0;

/// Truncate a declination to [-90, 90].
pub fn clamp_dec(dec: f64) -> f64 {
    if dec < -90.0 {
        -90.0
    } else if dec > 90.0 {
        90.0
    } else {
        dec
    }
}

/// Wrap a right ascension to [0, 360).
pub fn reduce_ra(ra: f64) -> f64 {
    let mut r = ra % 360.0;
    if r < 0.0 {
        r += 360.0;
        if r == 360.0 {
            r = 0.0;
        }
    }
    r
}

/// Snap a longitude angle to 360. Partition bounds are computed by
/// multiplying a sub-chunk width by a sub-chunk number, so the upper bound
/// of the last sub-chunk in a sub-stripe can fall very slightly short of
/// 360.
pub fn clamp_ra(ra: f64) -> f64 {
    if ra >= 360.0 || 360.0 - ra < EPSILON_DEG {
        360.0
    } else {
        ra
    }
}

/// Minimum angular separation between two right ascensions.
pub fn min_delta_ra(ra1: f64, ra2: f64) -> f64 {
    let delta = (ra1 - ra2).abs();
    delta.min(360.0 - delta)
}

/// Compute the extent in longitude [-alpha, alpha] of a circle with the
/// given radius centered at (0, center_dec). Radius and declination are
/// in degrees; the radius must lie in [0, 90].
pub fn max_alpha(radius: f64, center_dec: f64) -> Result<f64> {
    if !(0.0..=90.0).contains(&radius) {
        return Err(Error::new(
            ErrorKind::Config,
            "radius must lie in range [0, 90] deg".to_string(),
        ));
    }
    if radius == 0.0 {
        return Ok(0.0);
    }
    let d = clamp_dec(center_dec);
    if d.abs() + radius > 90.0 - 1.0 / 3600.0 {
        return Ok(180.0);
    }
    let r = radius * RAD_PER_DEG;
    let d = d * RAD_PER_DEG;
    let y = r.sin();
    let x = ((d - r).cos() * (d + r).cos()).abs().sqrt();
    Ok(DEG_PER_RAD * (y / x).atan().abs())
}

/// Number of segments to divide the declination stripe [dec_min, dec_max]
/// into, such that two points separated by at least one segment are
/// separated by an angular distance of at least width.
pub fn segments(dec_min: f64, dec_max: f64, width: f64) -> i32 {
    let dec = dec_min.abs().max(dec_max.abs());
    if dec > 90.0 - 1.0 / 3600.0 {
        return 1;
    }
    let width = if width >= 180.0 {
        return 1;
    } else if width < 1.0 / 3600.0 {
        1.0 / 3600.0
    } else {
        width
    };
    let dec = dec * RAD_PER_DEG;
    let cw = (width * RAD_PER_DEG).cos();
    let sd = dec.sin();
    let cd = dec.cos();
    let x = cw - sd * sd;
    let u = cd * cd;
    let y = (u * u - x * x).abs().sqrt();
    (360.0 / (DEG_PER_RAD * y.atan2(x)).abs()).floor() as i32
}

/// Angular width of one segment of the declination stripe [dec_min,
/// dec_max] divided into num_segments equal-width segments.
pub fn segment_width(dec_min: f64, dec_max: f64, num_segments: i32) -> f64 {
    let dec = dec_min.abs().max(dec_max.abs()) * RAD_PER_DEG;
    let cw = (RAD_PER_DEG * (360.0 / num_segments as f64)).cos();
    let sd = dec.sin();
    let cd = dec.cos();
    (cw * cd * cd + sd * sd).acos() * DEG_PER_RAD
}

/// Unit 3-vector for the given right ascension and declination (degrees).
pub fn cartesian(ra: f64, dec: f64) -> DVec3 {
    let ra = ra * RAD_PER_DEG;
    let dec = dec * RAD_PER_DEG;
    let (sin_ra, cos_ra) = ra.sin_cos();
    let (sin_dec, cos_dec) = dec.sin_cos();
    DVec3::new(cos_ra * cos_dec, sin_ra * cos_dec, sin_dec)
}

/// Right ascension and declination (degrees) for the given 3-vector.
pub fn spherical(v: DVec3) -> (f64, f64) {
    let mut ra = 0.0;
    let mut dec = 0.0;
    let d2 = v.x * v.x + v.y * v.y;
    if d2 != 0.0 {
        let mut a = v.y.atan2(v.x) * DEG_PER_RAD;
        if a < 0.0 {
            a += 360.0;
            if a == 360.0 {
                a = 0.0;
            }
        }
        ra = a;
    }
    if v.z != 0.0 {
        dec = clamp_dec(v.z.atan2(d2.sqrt()) * DEG_PER_RAD);
    }
    (ra, dec)
}

/// A spherical coordinate space bounding box.
///
/// May correspond to the whole sphere, a cap, a lune or the usual
/// rectangle, and may span the 0/360 longitude discontinuity.
#[derive(Debug, Clone, PartialEq)]
pub struct SphericalBox {
    ra_min: f64,
    ra_max: f64,
    dec_min: f64,
    dec_max: f64,
}

impl Default for SphericalBox {
    fn default() -> Self {
        SphericalBox {
            ra_min: 0.0,
            ra_max: 360.0,
            dec_min: -90.0,
            dec_max: 90.0,
        }
    }
}

impl SphericalBox {
    pub fn new(ra_min: f64, ra_max: f64, dec_min: f64, dec_max: f64) -> Self {
        let (ra_min, ra_max) = if ra_max - ra_min >= 360.0 {
            (0.0, 360.0)
        } else {
            (reduce_ra(ra_min), clamp_ra(reduce_ra(ra_max)))
        };
        SphericalBox {
            ra_min,
            ra_max,
            dec_min: clamp_dec(dec_min),
            dec_max: clamp_dec(dec_max),
        }
    }

    /// A conservative bounding box for the spherical triangle with the
    /// given vertices.
    pub fn from_triangle(v0: DVec3, v1: DVec3, v2: DVec3) -> Self {
        let verts = [v0, v1, v2];
        let north = DVec3::Z;
        let contains_pole = |p: DVec3| {
            p.dot(v0.cross(v1)) >= 0.0
                && p.dot(v1.cross(v2)) >= 0.0
                && p.dot(v2.cross(v0)) >= 0.0
        };
        let north_inside = contains_pole(north);
        let south_inside = contains_pole(-north);

        let mut dec_min = f64::MAX;
        let mut dec_max = f64::MIN;
        for v in verts {
            let (_, d) = spherical(v);
            dec_min = dec_min.min(d);
            dec_max = dec_max.max(d);
        }
        // Edges can bulge above or below the vertex declinations; the
        // extremum of z along a great circle lies at the projection of the
        // pole onto the circle's plane.
        for (a, b) in [(v0, v1), (v1, v2), (v2, v0)] {
            let n = a.cross(b);
            if n.length_squared() == 0.0 {
                continue;
            }
            let n = n.normalize();
            let proj = north - n * n.dot(north);
            if proj.length_squared() < 1e-12 {
                continue; // edge lies on the equator
            }
            for p in [proj.normalize(), -proj.normalize()] {
                let in_arc = a.cross(p).dot(n) >= 0.0 && p.cross(b).dot(n) >= 0.0;
                if in_arc {
                    let (_, d) = spherical(p);
                    dec_min = dec_min.min(d);
                    dec_max = dec_max.max(d);
                }
            }
        }
        if north_inside {
            dec_max = 90.0;
        }
        if south_inside {
            dec_min = -90.0;
        }

        // RA extrema of a great-circle arc occur at its endpoints unless
        // the arc runs along a meridian, which only matters when a pole is
        // involved - and pole containment forces the full RA range below.
        let (ra_min, ra_max) = if north_inside || south_inside {
            (0.0, 360.0)
        } else {
            let anchor = spherical(v0).0;
            let mut lo = 0.0f64;
            let mut hi = 0.0f64;
            for v in [v1, v2] {
                let (ra, _) = spherical(v);
                let mut delta = ra - anchor;
                if delta > 180.0 {
                    delta -= 360.0;
                } else if delta < -180.0 {
                    delta += 360.0;
                }
                lo = lo.min(delta);
                hi = hi.max(delta);
            }
            if hi - lo > 180.0 {
                (0.0, 360.0)
            } else {
                (reduce_ra(anchor + lo - EPSILON_DEG), reduce_ra(anchor + hi + EPSILON_DEG))
            }
        };
        SphericalBox {
            ra_min,
            ra_max,
            dec_min: clamp_dec(dec_min - EPSILON_DEG),
            dec_max: clamp_dec(dec_max + EPSILON_DEG),
        }
    }

    pub fn ra_min(&self) -> f64 {
        self.ra_min
    }
    pub fn ra_max(&self) -> f64 {
        self.ra_max
    }
    pub fn dec_min(&self) -> f64 {
        self.dec_min
    }
    pub fn dec_max(&self) -> f64 {
        self.dec_max
    }

    pub fn is_empty(&self) -> bool {
        self.dec_max < self.dec_min
    }

    pub fn is_full(&self) -> bool {
        self.dec_min == -90.0 && self.dec_max == 90.0 && self.ra_min == 0.0 && self.ra_max == 360.0
    }

    /// Does the box wrap around the 0/360 right ascension discontinuity?
    pub fn wraps(&self) -> bool {
        self.ra_max < self.ra_min
    }

    pub fn ra_extent(&self) -> f64 {
        if self.wraps() {
            360.0 - self.ra_min + self.ra_max
        } else {
            self.ra_max - self.ra_min
        }
    }

    /// Grow the box by the given radius (degrees).
    pub fn expand(&mut self, radius: f64) {
        if radius <= 0.0 {
            return;
        }
        let alpha = max_alpha(radius, self.dec_min.abs().max(self.dec_max.abs()).min(90.0))
            .unwrap_or(180.0);
        if self.ra_extent() + 2.0 * alpha >= 360.0 {
            self.ra_min = 0.0;
            self.ra_max = 360.0;
        } else {
            self.ra_min = reduce_ra(self.ra_min - alpha);
            self.ra_max = reduce_ra(self.ra_max + alpha);
        }
        self.dec_min = clamp_dec(self.dec_min - radius);
        self.dec_max = clamp_dec(self.dec_max + radius);
    }

    pub fn contains(&self, ra: f64, dec: f64) -> bool {
        if dec < self.dec_min || dec > self.dec_max {
            return false;
        }
        if self.wraps() {
            ra >= self.ra_min || ra <= self.ra_max
        } else {
            ra >= self.ra_min && ra <= self.ra_max
        }
    }

    pub fn intersects(&self, other: &SphericalBox) -> bool {
        if other.is_empty() {
            return false;
        }
        if other.dec_min > self.dec_max || other.dec_max < self.dec_min {
            return false;
        }
        if self.wraps() {
            if other.wraps() {
                return true;
            }
            other.ra_min <= self.ra_max || other.ra_max >= self.ra_min
        } else if other.wraps() {
            self.ra_min <= other.ra_max || self.ra_max >= other.ra_min
        } else {
            self.ra_min <= other.ra_max && self.ra_max >= other.ra_min
        }
    }

    /// Area of the box in steradians.
    pub fn area(&self) -> f64 {
        let dz = (self.dec_max * RAD_PER_DEG).sin() - (self.dec_min * RAD_PER_DEG).sin();
        self.ra_extent() * RAD_PER_DEG * dz.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartesian_spherical_round_trip() {
        // Within 1 mas everywhere on a coarse grid.
        let mut ra = 0.0;
        while ra < 360.0 {
            let mut dec = -90.0;
            while dec <= 90.0 {
                let (r, d) = spherical(cartesian(ra, dec));
                if dec.abs() < 90.0 - 1e-9 {
                    assert!(min_delta_ra(r, reduce_ra(ra)) < EPSILON_DEG, "ra {} -> {}", ra, r);
                }
                assert!((d - clamp_dec(dec)).abs() < EPSILON_DEG, "dec {} -> {}", dec, d);
                dec += 7.5;
            }
            ra += 11.25;
        }
    }

    #[test]
    fn test_wraps_iff_ra_max_less_than_ra_min() {
        assert!(SphericalBox::new(350.0, 10.0, -10.0, 10.0).wraps());
        assert!(!SphericalBox::new(10.0, 350.0, -10.0, 10.0).wraps());
        assert!(!SphericalBox::default().wraps());
    }

    #[test]
    fn test_wrapped_containment_and_intersection() {
        let b = SphericalBox::new(350.0, 10.0, -10.0, 10.0);
        assert!(b.contains(355.0, 0.0));
        assert!(b.contains(5.0, 0.0));
        assert!(!b.contains(180.0, 0.0));
        let c = SphericalBox::new(5.0, 20.0, -5.0, 5.0);
        assert!(b.intersects(&c));
        let d = SphericalBox::new(90.0, 180.0, -5.0, 5.0);
        assert!(!b.intersects(&d));
    }

    #[test]
    fn test_expand_grows_bounds() {
        let mut b = SphericalBox::new(100.0, 110.0, 20.0, 30.0);
        b.expand(1.0);
        assert!(b.dec_min() < 20.0 && b.dec_max() > 30.0);
        assert!(b.ra_min() < 100.0 && b.ra_max() > 110.0);
    }

    #[test]
    fn test_max_alpha_poles_and_equator() {
        assert_eq!(max_alpha(0.0, 45.0).unwrap(), 0.0);
        assert_eq!(max_alpha(5.0, 89.0).unwrap(), 180.0);
        let a = max_alpha(1.0, 0.0).unwrap();
        assert!(a >= 1.0 && a < 1.01);
        assert!(max_alpha(91.0, 0.0).is_err());
    }

    #[test]
    fn test_segments_monotonic_toward_poles() {
        let eq = segments(-5.0, 5.0, 5.0);
        let mid = segments(40.0, 50.0, 5.0);
        let polar = segments(85.0, 90.0, 5.0);
        assert!(eq >= mid && mid >= polar);
        assert_eq!(segments(89.9999, 90.0, 5.0), 1);
    }

    #[test]
    fn test_clamp_ra_snaps_within_one_mas() {
        assert_eq!(clamp_ra(360.0 - EPSILON_DEG / 2.0), 360.0);
        assert!(clamp_ra(359.9) < 360.0);
    }
}
