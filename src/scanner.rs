use std::env;
use std::sync::Arc;

use image::DynamicImage;
use imageproc::point::Point;
use log::debug;
use logging_timer::time;
use serde::Serialize;

use crate::edges::{find_left_edge, find_top_edge};
use crate::election::BallotSpec;
use crate::error::{Result, ScanError};
use crate::frame::{luma_from_rgb, ScanFrame};
use crate::geometry::{fit_line, LineFit};
use crate::resample::sample_bicubic;
use crate::threshold::{luma_histogram, otsu_threshold};
use crate::transform::SimilarityTransform;

/// Interior left untouched on each side when sweeping for edges.
pub const SWEEP_MARGIN: u32 = 100;

/// Spacing between edge sweeps.
pub const SWEEP_STRIDE: u32 = 50;

/// Step used when walking the fitted top line out to its endpoints.
const EXTRAPOLATION_STEP: i64 = 5;

/// Samples per reference pixel along each axis when scoring a bubble.
const OVERSAMPLE: u32 = 4;

const MARK_THRESHOLD_DEFAULT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Darkness at or above which a bubble counts as marked.
    pub mark_threshold: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mark_threshold: MARK_THRESHOLD_DEFAULT,
        }
    }
}

impl ScanConfig {
    /// Default, overridden by `SCAN_MARK_THRESHOLD`, overridden by the flag.
    pub fn resolve(flag: Option<f64>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = env::var("SCAN_MARK_THRESHOLD") {
            config.mark_threshold = value.parse().map_err(|_| {
                ScanError::Config(format!("SCAN_MARK_THRESHOLD {value:?} is not a number"))
            })?;
        }
        if let Some(value) = flag {
            config.mark_threshold = value;
        }
        Ok(config)
    }
}

/// The blank ballot rendering with its derived pixel geometry.
#[derive(Debug)]
pub struct ReferenceImage {
    frame: ScanFrame,
    px_per_pt: f64,
    top_left: Point<f64>,
    top_right: Point<f64>,
    threshold: u8,
}

impl ReferenceImage {
    /// Wraps a decoded reference rendering, deriving the pixels-per-point
    /// scale and the printed top-line endpoints. The rendering must be
    /// uniformly scaled: the per-axis scales may differ by at most 1%.
    pub fn new(image: DynamicImage, spec: &BallotSpec) -> Result<Self> {
        let frame = ScanFrame::from_dynamic(image);
        if frame.width() == 0 || frame.height() == 0 {
            return Err(ScanError::ReferenceGeometryInvalid(
                "empty reference rendering".to_string(),
            ));
        }
        let [page_w, page_h] = spec.draw_settings.page_size;
        let scale_x = f64::from(frame.width()) / page_w;
        let scale_y = f64::from(frame.height()) / page_h;
        if (scale_y / scale_x - 1.0).abs() > 0.01 {
            return Err(ScanError::ReferenceGeometryInvalid(format!(
                "pixel scale not square: {scale_x:.3} x {scale_y:.3} px/pt"
            )));
        }
        let px_per_pt = (scale_x + scale_y) / 2.0;
        let margin = spec.draw_settings.page_margin;
        let margin_px = margin * px_per_pt;
        let top_left = Point::new(margin_px, margin_px);
        let top_right = Point::new((page_w - margin) * px_per_pt, margin_px);
        let threshold = otsu_threshold(&luma_histogram(&frame))?;
        debug!(
            "reference {}x{} px, {px_per_pt:.3} px/pt, threshold {threshold}, top line ({:.0},{:.0})-({:.0},{:.0})",
            frame.width(),
            frame.height(),
            top_left.x,
            top_left.y,
            top_right.x,
            top_right.y,
        );
        Ok(Self {
            frame,
            px_per_pt,
            top_left,
            top_right,
            threshold,
        })
    }

    pub fn frame(&self) -> &ScanFrame {
        &self.frame
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn px_per_pt(&self) -> f64 {
        self.px_per_pt
    }

    pub fn top_left(&self) -> Point<f64> {
        self.top_left
    }

    pub fn top_right(&self) -> Point<f64> {
        self.top_right
    }

    /// Otsu level of the reference rendering itself.
    pub fn threshold(&self) -> u8 {
        self.threshold
    }
}

/// One bubble's verdict for a scanned ballot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BubbleResult {
    pub style: usize,
    pub contest: String,
    pub selection: String,
    /// `1 - mean(Y) / 255` over the bubble's oversampled region.
    pub darkness: f64,
    pub marked: bool,
}

/// Aligns scanned ballot images against one election's reference rendering
/// and scores every known bubble.
pub struct Scanner {
    spec: Arc<BallotSpec>,
    reference: ReferenceImage,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(spec: Arc<BallotSpec>, reference: ReferenceImage, config: ScanConfig) -> Self {
        Self {
            spec,
            reference,
            config,
        }
    }

    pub fn spec(&self) -> &BallotSpec {
        &self.spec
    }

    pub fn reference(&self) -> &ReferenceImage {
        &self.reference
    }

    /// Runs the whole pipeline over one scanned frame.
    #[time]
    pub fn scan(&self, frame: &ScanFrame) -> Result<Vec<BubbleResult>> {
        let transform = self.align(frame)?;
        Ok(self.score_bubbles(frame, &transform))
    }

    /// Recovers the transform carrying reference coordinates onto the frame:
    /// threshold, edge sweeps, top-line fit, endpoint extrapolation.
    #[time]
    pub fn align(&self, frame: &ScanFrame) -> Result<SimilarityTransform> {
        if frame.width() <= 2 * SWEEP_MARGIN || frame.height() <= 2 * SWEEP_MARGIN {
            return Err(ScanError::InputGeometryMismatch(format!(
                "{}x{} frame is too small to sweep",
                frame.width(),
                frame.height()
            )));
        }
        let threshold = otsu_threshold(&luma_histogram(frame))?;
        debug!("scan threshold {threshold}");

        self.sweep_left_edges(frame, threshold);
        let (top_left, top_right) = self.find_top_line(frame, threshold)?;
        debug!(
            "top line observed ({:.1},{:.1})-({:.1},{:.1})",
            top_left.x, top_left.y, top_right.x, top_right.y
        );

        SimilarityTransform::between(
            self.reference.top_left(),
            self.reference.top_right(),
            top_left,
            top_right,
        )
    }

    fn sweep_left_edges(&self, frame: &ScanFrame, threshold: u8) {
        let mid_x = frame.width() / 2;
        let mut hits = 0usize;
        let mut misses = 0usize;
        let mut y = SWEEP_MARGIN;
        while y < frame.height() - SWEEP_MARGIN {
            if find_left_edge(frame, y, threshold) < mid_x {
                hits += 1;
            } else {
                misses += 1;
            }
            y += SWEEP_STRIDE;
        }
        debug!("left edge: {hits} hits, {misses} misses");
    }

    fn find_top_line(&self, frame: &ScanFrame, threshold: u8) -> Result<(Point<f64>, Point<f64>)> {
        let mid_y = frame.height() / 2;
        let mut hits: Vec<Point<f64>> = Vec::new();
        let mut misses = 0usize;
        let mut x = SWEEP_MARGIN;
        while x < frame.width() - SWEEP_MARGIN {
            let edge_y = find_top_edge(frame, x, threshold);
            if edge_y < mid_y {
                hits.push(Point::new(f64::from(x), f64::from(edge_y)));
            } else {
                misses += 1;
            }
            x += SWEEP_STRIDE;
        }
        debug!("top edge: {} hits, {misses} misses", hits.len());
        if hits.len() < 2 {
            return Err(ScanError::EdgeDetectionMiss {
                hits: hits.len(),
                misses,
            });
        }

        let fit = fit_line(&hits)?;
        debug!(
            "top line fit slope {:.5} intercept {:.1} residual bound {:.2}",
            fit.slope, fit.intercept, fit.residual_bound
        );
        let top_left = extrapolate_endpoint(frame, threshold, &fit, hits[0], -EXTRAPOLATION_STEP);
        let top_right = extrapolate_endpoint(
            frame,
            threshold,
            &fit,
            hits[hits.len() - 1],
            EXTRAPOLATION_STEP,
        );
        Ok((top_left, top_right))
    }

    /// Scores every bubble of every ballot style through the transform.
    #[time]
    pub fn score_bubbles(
        &self,
        frame: &ScanFrame,
        transform: &SimilarityTransform,
    ) -> Vec<BubbleResult> {
        let px_per_pt = self.reference.px_per_pt();
        let ref_height = f64::from(self.reference.height());
        let step = 1.0 / f64::from(OVERSAMPLE);

        let mut results = Vec::with_capacity(self.spec.bubble_count());
        for (style, contest, selection, [x_pt, y_pt, w_pt, h_pt]) in self.spec.iter_bubbles() {
            // Bubble coordinates anchor its bottom-left corner; image y grows
            // downward from the top.
            let base_x = x_pt * px_per_pt;
            let base_y = ref_height - y_pt * px_per_pt;
            let samples_x = (w_pt * px_per_pt * f64::from(OVERSAMPLE)).ceil() as u32;
            let samples_y = (h_pt * px_per_pt * f64::from(OVERSAMPLE)).ceil() as u32;

            let mut sum = 0u64;
            for iy in 0..samples_y {
                let ry = base_y - f64::from(iy) * step;
                for ix in 0..samples_x {
                    let rx = base_x + f64::from(ix) * step;
                    let (sx, sy) = transform.map_f(rx, ry);
                    let [r, g, b, _] = sample_bicubic(frame, sx, sy).0;
                    sum += u64::from(luma_from_rgb(r, g, b));
                }
            }
            let count = u64::from(samples_x) * u64::from(samples_y);
            let darkness = 1.0 - (sum as f64 / count as f64) / 255.0;
            results.push(BubbleResult {
                style,
                contest: contest.to_string(),
                selection: selection.to_string(),
                darkness,
                marked: darkness >= self.config.mark_threshold,
            });
        }
        results
    }
}

/// Walks outward from an accepted sweep hit in fixed steps, re-running the
/// edge sweep and keeping each new hit while it stays within the fit's
/// residual bound. Returns the last accepted position.
fn extrapolate_endpoint(
    frame: &ScanFrame,
    threshold: u8,
    fit: &LineFit,
    start: Point<f64>,
    step: i64,
) -> Point<f64> {
    let mut x = start.x as i64;
    let mut y = start.y;
    loop {
        let next = x + step;
        if next < 0 || next >= i64::from(frame.width()) {
            break;
        }
        let edge_y = find_top_edge(frame, next as u32, threshold);
        if fit.distance_to(next as f64, f64::from(edge_y)) > fit.residual_bound {
            break;
        }
        x = next;
        y = f64::from(edge_y);
    }
    Point::new(x as f64, y)
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GrayImage, Luma};
    use imageproc::drawing::draw_filled_circle_mut;

    use super::*;

    const IMG_W: u32 = 1221;
    const IMG_H: u32 = 1584;
    const PAGE_W_PT: f64 = 610.5;
    const PAGE_H_PT: f64 = 792.0;
    const MARGIN_PT: f64 = 30.0;

    // Frame line geometry at 2 px/pt.
    const LINE_LEFT: u32 = 60;
    const LINE_RIGHT: u32 = 1161;
    const LINE_BOTTOM: u32 = 1524;

    fn paper_luma(x: u32, y: u32) -> u8 {
        (215 + (x * 31 + y * 17) % 41) as u8
    }

    fn test_spec() -> BallotSpec {
        let json = format!(
            r#"{{
                "draw_settings": {{"pagesize": [{PAGE_W_PT}, {PAGE_H_PT}], "pageMargin": {MARGIN_PT}}},
                "bubbles": [{{"mayor": {{"alice": [100.0, 300.0, 20.0, 10.0], "bob": [100.0, 350.0, 20.0, 10.0]}}}}]
            }}"#
        );
        BallotSpec::from_json_reader(json.as_bytes()).unwrap()
    }

    /// A plausible blank ballot: noisy paper, a dark frame line across the
    /// top and down the left, and a block of printed midtones.
    fn blank_page() -> GrayImage {
        let mut im = GrayImage::from_fn(IMG_W, IMG_H, |x, y| Luma([paper_luma(x, y)]));
        for x in LINE_LEFT..=LINE_RIGHT {
            for y in 60..=62 {
                im.put_pixel(x, y, Luma([30]));
            }
        }
        for y in LINE_LEFT..=LINE_BOTTOM {
            for x in 60..=62 {
                im.put_pixel(x, y, Luma([30]));
            }
        }
        for y in 700..745 {
            for x in 580..625 {
                im.put_pixel(x, y, Luma([130]));
            }
        }
        im
    }

    fn scanner_for(reference: GrayImage) -> Scanner {
        let spec = Arc::new(test_spec());
        let reference =
            ReferenceImage::new(DynamicImage::ImageLuma8(reference), &spec).unwrap();
        Scanner::new(spec, reference, ScanConfig::default())
    }

    #[test]
    fn reference_image_derives_scale_and_endpoints() {
        let reference =
            ReferenceImage::new(DynamicImage::ImageLuma8(blank_page()), &test_spec()).unwrap();
        assert!((reference.px_per_pt() - 2.0).abs() < 1e-9);
        assert!((reference.top_left().x - 60.0).abs() < 1e-9);
        assert!((reference.top_left().y - 60.0).abs() < 1e-9);
        assert!((reference.top_right().x - 1161.0).abs() < 1e-9);
        assert!((reference.top_right().y - 60.0).abs() < 1e-9);
    }

    #[test]
    fn identity_scan_recovers_endpoints_and_reads_blank() {
        let page = blank_page();
        let scanner = scanner_for(page.clone());
        let frame = ScanFrame::Gray(page);

        let threshold = otsu_threshold(&luma_histogram(&frame)).unwrap();
        assert!(
            (80..=220).contains(&threshold),
            "scan threshold {threshold}"
        );

        let (top_left, top_right) = scanner.find_top_line(&frame, threshold).unwrap();
        assert!(
            (top_left.x - 60.0).abs() <= 2.0 && (top_left.y - 60.0).abs() <= 2.0,
            "top left {top_left:?}"
        );
        assert!(
            (top_right.x - 1161.0).abs() <= 2.0 && (top_right.y - 60.0).abs() <= 2.0,
            "top right {top_right:?}"
        );

        let results = scanner.scan(&frame).unwrap();
        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(
                result.darkness < 0.1,
                "{}: darkness {}",
                result.selection,
                result.darkness
            );
            assert!(!result.marked);
        }
    }

    #[test]
    fn rotated_scan_recovers_rotation_and_scale() {
        let theta = 2.0f64.to_radians();
        let (sin_t, cos_t) = theta.sin_cos();
        let mut scan = GrayImage::from_pixel(IMG_W, IMG_H, Luma([240]));

        // The frame lines of `blank_page`, rotated by theta about (60, 60).
        for i in 0..=1101u32 {
            let x = (60.0 + f64::from(i) * cos_t).round() as u32;
            let y = (60.0 + f64::from(i) * sin_t).round() as u32;
            for dy in 0..3 {
                scan.put_pixel(x, y + dy, Luma([30]));
            }
        }
        for i in 0..=1464u32 {
            let x = (60.0 - f64::from(i) * sin_t).round() as u32;
            let y = (60.0 + f64::from(i) * cos_t).round() as u32;
            for dx in 0..3 {
                scan.put_pixel(x + dx, y, Luma([30]));
            }
        }
        // A nub above the top line at one sweep position keeps the fit's
        // residual bound clear of the staircase rounding error, the same
        // slack real print noise provides.
        {
            let nub_y = (60.0 + 540.0 * sin_t / cos_t).round() as u32 - 1;
            for x in 599..=601 {
                scan.put_pixel(x, nub_y, Luma([30]));
            }
        }

        let scanner = scanner_for(blank_page());
        let frame = ScanFrame::Gray(scan);
        let transform = scanner.align(&frame).unwrap();
        assert!(
            (0.030..=0.040).contains(&transform.rotation()),
            "rotation {}",
            transform.rotation()
        );
        assert!(
            (0.99..=1.01).contains(&transform.scale()),
            "scale {}",
            transform.scale()
        );

        // A region that is white paper in the reference must still read as
        // white through the recovered alignment.
        let (sx, sy) = transform.map_f(400.0, 400.0);
        let [r, g, b, _] = sample_bicubic(&frame, sx, sy).0;
        assert!(luma_from_rgb(r, g, b) > 200);
    }

    #[test]
    fn filled_bubble_is_marked_and_neighbor_is_not() {
        let mut scan = blank_page();
        // Fill the first bubble: its reference rect is x 200..240, y 964..984,
        // so a disk of radius 30 at the center swallows the whole rect.
        draw_filled_circle_mut(&mut scan, (220, 974), 30, Luma([30]));

        let scanner = scanner_for(blank_page());
        let results = scanner.scan(&ScanFrame::Gray(scan)).unwrap();

        let alice = results.iter().find(|r| r.selection == "alice").unwrap();
        assert!(alice.darkness >= 0.7, "alice darkness {}", alice.darkness);
        assert!(alice.marked);

        let bob = results.iter().find(|r| r.selection == "bob").unwrap();
        assert!(bob.darkness < 0.2, "bob darkness {}", bob.darkness);
        assert!(!bob.marked);
    }

    #[test]
    fn results_are_ordered_and_labeled() {
        let page = blank_page();
        let scanner = scanner_for(page.clone());
        let results = scanner.scan(&ScanFrame::Gray(page)).unwrap();
        let labels: Vec<_> = results
            .iter()
            .map(|r| (r.style, r.contest.as_str(), r.selection.as_str()))
            .collect();
        assert_eq!(labels, vec![(0, "mayor", "alice"), (0, "mayor", "bob")]);
    }

    #[test]
    fn blank_white_scan_fails_edge_detection() {
        let scanner = scanner_for(blank_page());
        let white = GrayImage::from_pixel(IMG_W, IMG_H, Luma([245]));
        let err = scanner.scan(&ScanFrame::Gray(white)).unwrap_err();
        assert!(matches!(err, ScanError::EdgeDetectionMiss { .. }));
    }

    #[test]
    fn undersized_frame_is_a_geometry_mismatch() {
        let scanner = scanner_for(blank_page());
        let tiny = GrayImage::from_pixel(150, 150, Luma([245]));
        let err = scanner.scan(&ScanFrame::Gray(tiny)).unwrap_err();
        assert!(matches!(err, ScanError::InputGeometryMismatch(_)));
    }

    #[test]
    fn non_square_reference_scale_is_rejected() {
        let json = r#"{
            "draw_settings": {"pagesize": [8.5, 11.0], "pageMargin": 1.0},
            "bubbles": []
        }"#;
        let spec = BallotSpec::from_json_reader(json.as_bytes()).unwrap();
        let im = GrayImage::from_pixel(1000, 500, Luma([255]));
        let err = ReferenceImage::new(DynamicImage::ImageLuma8(im), &spec).unwrap_err();
        assert!(matches!(err, ScanError::ReferenceGeometryInvalid(_)));
    }

    #[test]
    fn mark_threshold_flag_wins() {
        let config = ScanConfig::resolve(Some(0.9)).unwrap();
        assert_eq!(config.mark_threshold, 0.9);
    }
}
