use image::Rgba;

use crate::frame::ScanFrame;

/// Returned for any sample whose 4x4 neighborhood crosses the frame bounds.
pub const OUTSIDE: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Catmull-Rom weights for four taps around a fractional position
/// `x in [0, 1)` between the middle two.
pub fn catmull_rom_weights(x: f64) -> [f64; 4] {
    let alpha = 1.0 - x;
    let beta = -0.5 * x * alpha;
    let w0 = alpha * beta;
    let w3 = x * beta;
    let gamma = w3 - w0;
    let w1 = alpha - w0 + gamma;
    let w2 = x - w3 - gamma;
    [w0, w1, w2, w3]
}

/// Samples the frame at a fractional coordinate through a separable 4x4
/// Catmull-Rom kernel.
///
/// Rows are blended horizontally first, then the four row sums vertically.
/// The accumulated alpha is clamped to [0, 255] and each color channel to
/// [0, alpha], so the result is always a valid premultiplied color. Samples
/// reaching outside the frame return opaque black.
pub fn sample_bicubic(frame: &ScanFrame, x: f64, y: f64) -> Rgba<u8> {
    let fx = x.floor();
    let fy = y.floor();
    let ix = fx as i64;
    let iy = fy as i64;
    let width = i64::from(frame.width());
    let height = i64::from(frame.height());
    if ix < 1 || ix + 2 >= width || iy < 1 || iy + 2 >= height {
        return OUTSIDE;
    }

    let wx = catmull_rom_weights(x - fx);
    let mut rows = [[0.0f64; 4]; 4];
    for (row_idx, row) in rows.iter_mut().enumerate() {
        let py = (iy - 1 + row_idx as i64) as u32;
        for (tap, &weight) in wx.iter().enumerate() {
            let px = (ix - 1 + tap as i64) as u32;
            let c = frame.rgba(px, py);
            for channel in 0..4 {
                row[channel] += f64::from(c[channel]) * weight;
            }
        }
    }

    let wy = catmull_rom_weights(y - fy);
    let mut out = [0.0f64; 4];
    for (row, &weight) in rows.iter().zip(wy.iter()) {
        for channel in 0..4 {
            out[channel] += row[channel] * weight;
        }
    }

    let a = out[3].clamp(0.0, 255.0);
    let r = out[0].clamp(0.0, a);
    let g = out[1].clamp(0.0, a);
    let b = out[2].clamp(0.0, a);
    Rgba([r as u8, g as u8, b as u8, a as u8])
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, RgbaImage};
    use proptest::prelude::*;

    use super::*;

    fn checker_frame(size: u32) -> ScanFrame {
        let im = GrayImage::from_fn(size, size, |x, y| {
            Luma([if (x + y) % 2 == 0 { 230 } else { 40 }])
        });
        ScanFrame::Gray(im)
    }

    #[test]
    fn weights_sum_to_one() {
        for &x in &[0.0, 0.25, 0.5, 0.75, 0.999] {
            let w = catmull_rom_weights(x);
            let sum: f64 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "weights at {x} sum to {sum}");
        }
    }

    #[test]
    fn zero_offset_hits_the_center_tap() {
        let w = catmull_rom_weights(0.0);
        assert_eq!(w, [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn integer_interior_coordinates_reproduce_the_pixel() {
        let frame = checker_frame(12);
        for y in 1..10u32 {
            for x in 1..10u32 {
                let sampled = sample_bicubic(&frame, f64::from(x), f64::from(y));
                let expected = frame.rgba(x, y);
                for channel in 0..4 {
                    let diff = i16::from(sampled.0[channel]) - i16::from(expected[channel]);
                    assert!(
                        diff.abs() <= 1,
                        "({x},{y}) channel {channel}: {} vs {}",
                        sampled.0[channel],
                        expected[channel]
                    );
                }
            }
        }
    }

    #[test]
    fn neighborhood_crossing_the_border_is_black() {
        let frame = checker_frame(12);
        for &(x, y) in &[
            (0.5, 5.0),
            (5.0, 0.5),
            (10.5, 5.0),
            (5.0, 10.5),
            (-3.0, -3.0),
            (11.0, 11.0),
            (f64::NAN, 5.0),
        ] {
            assert_eq!(sample_bicubic(&frame, x, y), OUTSIDE, "at ({x},{y})");
        }
    }

    #[test]
    fn interior_edge_of_the_safe_region_is_sampled() {
        let frame = checker_frame(12);
        // ix in [1, 9] keeps the 4x4 neighborhood inside a 12-wide frame.
        assert_ne!(sample_bicubic(&frame, 1.0, 1.0), OUTSIDE);
        assert_ne!(sample_bicubic(&frame, 9.9, 9.9), OUTSIDE);
    }

    #[test]
    fn overshoot_is_clamped_to_alpha() {
        // A bright spike on transparent surroundings: interpolated color
        // may exceed the interpolated alpha and must be pulled back.
        let mut im = RgbaImage::from_pixel(8, 8, image::Rgba([0, 0, 0, 0]));
        im.put_pixel(4, 4, image::Rgba([255, 255, 255, 40]));
        let frame = ScanFrame::Rgba(im);
        for &(x, y) in &[(3.5, 3.5), (4.25, 4.25), (4.5, 4.0)] {
            let c = sample_bicubic(&frame, x, y);
            assert!(c.0[0] <= c.0[3] && c.0[1] <= c.0[3] && c.0[2] <= c.0[3]);
        }
    }

    proptest! {
        #[test]
        fn prop_output_is_premultiplied_valid(
            pixels in proptest::collection::vec(any::<[u8; 4]>(), 8 * 8),
            x in -2.0f64..10.0,
            y in -2.0f64..10.0,
        ) {
            let mut im = RgbaImage::new(8, 8);
            for (i, px) in pixels.iter().enumerate() {
                im.put_pixel(i as u32 % 8, i as u32 / 8, image::Rgba(*px));
            }
            let frame = ScanFrame::Rgba(im);
            let c = sample_bicubic(&frame, x, y);
            prop_assert!(c.0[0] <= c.0[3]);
            prop_assert!(c.0[1] <= c.0[3]);
            prop_assert!(c.0[2] <= c.0[3]);
        }
    }
}
