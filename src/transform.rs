use imageproc::point::Point;

use crate::error::{Result, ScanError};
use crate::geometry::segment_length;

/// A similarity transform (translate, rotate, uniformly scale) carrying the
/// reference coordinate frame onto the scanned one, derived from the top
/// line's endpoints in both frames.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityTransform {
    origin_ref: Point<f64>,
    origin_scan: Point<f64>,
    scale: f64,
    theta: f64,
    sin_theta: f64,
    cos_theta: f64,
}

impl SimilarityTransform {
    /// Derives the transform mapping the reference segment `(ref_a, ref_b)`
    /// onto the observed segment `(scan_a, scan_b)`.
    pub fn between(
        ref_a: Point<f64>,
        ref_b: Point<f64>,
        scan_a: Point<f64>,
        scan_b: Point<f64>,
    ) -> Result<Self> {
        let theta = (scan_b.y - scan_a.y).atan2(scan_b.x - scan_a.x);
        let scale = segment_length(scan_a, scan_b) / segment_length(ref_a, ref_b);
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ScanError::TransformDegenerate { scale });
        }
        Ok(Self {
            origin_ref: ref_a,
            origin_scan: scan_a,
            scale,
            theta,
            sin_theta: theta.sin(),
            cos_theta: theta.cos(),
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Rotation in radians, positive y-down clockwise.
    pub fn rotation(&self) -> f64 {
        self.theta
    }

    /// Maps a reference-frame coordinate into the scanned frame.
    #[inline]
    pub fn map_f(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = (x - self.origin_ref.x) * self.scale;
        let dy = (y - self.origin_ref.y) * self.scale;
        (
            dx * self.cos_theta - dy * self.sin_theta + self.origin_scan.x,
            dx * self.sin_theta + dy * self.cos_theta + self.origin_scan.y,
        )
    }

    /// Integer variant of [`Self::map_f`], truncating toward zero.
    pub fn map(&self, x: i32, y: i32) -> (i32, i32) {
        let (fx, fy) = self.map_f(f64::from(x), f64::from(y));
        (fx as i32, fy as i32)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn pt(x: f64, y: f64) -> Point<f64> {
        Point::new(x, y)
    }

    #[test]
    fn identity_segments_give_the_identity() {
        let t =
            SimilarityTransform::between(pt(10.0, 20.0), pt(110.0, 20.0), pt(10.0, 20.0), pt(110.0, 20.0))
                .unwrap();
        assert!((t.scale() - 1.0).abs() < 1e-12);
        assert!(t.rotation().abs() < 1e-12);
        let (x, y) = t.map_f(37.0, 91.0);
        assert!((x - 37.0).abs() < 1e-9);
        assert!((y - 91.0).abs() < 1e-9);
    }

    #[test]
    fn maps_reference_endpoints_onto_observed_endpoints() {
        let ref_a = pt(60.0, 60.0);
        let ref_b = pt(1160.0, 60.0);
        let scan_a = pt(80.0, 95.0);
        let scan_b = pt(1170.0, 133.0);
        let t = SimilarityTransform::between(ref_a, ref_b, scan_a, scan_b).unwrap();

        let (ax, ay) = t.map_f(ref_a.x, ref_a.y);
        assert!((ax - scan_a.x).abs() < 1e-9);
        assert!((ay - scan_a.y).abs() < 1e-9);

        let (bx, by) = t.map_f(ref_b.x, ref_b.y);
        assert!((bx - scan_b.x).abs() < 1e-6);
        assert!((by - scan_b.y).abs() < 1e-6);
    }

    #[test]
    fn zero_length_observed_segment_is_degenerate() {
        let err = SimilarityTransform::between(
            pt(0.0, 0.0),
            pt(100.0, 0.0),
            pt(50.0, 50.0),
            pt(50.0, 50.0),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ScanError::TransformDegenerate { scale } if scale == 0.0
        ));
    }

    #[test]
    fn zero_length_reference_segment_is_degenerate() {
        let err = SimilarityTransform::between(
            pt(10.0, 10.0),
            pt(10.0, 10.0),
            pt(0.0, 0.0),
            pt(100.0, 0.0),
        )
        .unwrap_err();
        assert!(matches!(err, ScanError::TransformDegenerate { .. }));
    }

    #[test]
    fn integer_variant_truncates() {
        let t = SimilarityTransform::between(pt(0.0, 0.0), pt(100.0, 0.0), pt(0.5, 0.5), pt(100.5, 0.5))
            .unwrap();
        assert_eq!(t.map(10, 10), (10, 10));
    }

    proptest! {
        #[test]
        fn prop_recovers_a_known_rigid_motion(
            theta in -0.5f64..0.5,
            scale in 0.5f64..2.0,
            tx in -50.0f64..50.0,
            ty in -50.0f64..50.0,
        ) {
            let ref_a = pt(60.0, 60.0);
            let ref_b = pt(1060.0, 60.0);
            let apply = |p: Point<f64>| {
                let dx = (p.x - ref_a.x) * scale;
                let dy = (p.y - ref_a.y) * scale;
                pt(
                    dx * theta.cos() - dy * theta.sin() + ref_a.x + tx,
                    dx * theta.sin() + dy * theta.cos() + ref_a.y + ty,
                )
            };
            let t = SimilarityTransform::between(ref_a, ref_b, apply(ref_a), apply(ref_b)).unwrap();
            prop_assert!((t.rotation() - theta).abs() < 1e-9);
            prop_assert!((t.scale() - scale).abs() < 1e-9);

            // An arbitrary third point must follow the same motion.
            let probe = pt(300.0, 400.0);
            let expected = apply(probe);
            let (mx, my) = t.map_f(probe.x, probe.y);
            prop_assert!((mx - expected.x).abs() < 1e-6);
            prop_assert!((my - expected.y).abs() < 1e-6);
        }
    }
}
