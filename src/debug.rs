use std::path::Path;

use image::{Rgba, RgbaImage};
use imageproc::point::Point;
use log::debug;
use logging_timer::time;
use rand::Rng;

use crate::error::Result;
use crate::frame::ScanFrame;
use crate::resample::sample_bicubic;
use crate::scanner::{ReferenceImage, Scanner};
use crate::transform::SimilarityTransform;

/// Side length of a probed alignment hotspot.
const HOTSPOT_SIZE: u32 = 15;

/// How many hotspots to keep.
const HOTSPOT_COUNT: usize = 20;

/// How many random probes to score per kept hotspot.
const HOTSPOT_PROBES_PER_KEPT: usize = 5;

/// Resamples the whole scanned frame into the reference coordinate frame
/// and writes it as a PNG, for eyeballing the recovered alignment.
#[time]
pub fn write_rectified_png(
    reference: &ReferenceImage,
    frame: &ScanFrame,
    transform: &SimilarityTransform,
    path: &Path,
) -> Result<()> {
    let mut out = RgbaImage::new(reference.width(), reference.height());
    for y in 0..reference.height() {
        for x in 0..reference.width() {
            let (sx, sy) = transform.map_f(f64::from(x), f64::from(y));
            out.put_pixel(x, y, sample_bicubic(frame, sx, sy));
        }
    }
    out.save(path)?;
    Ok(())
}

/// Writes one vertical strip holding every bubble's oversampled crop from
/// the scanned frame, each cell sized for the largest bubble.
#[time]
pub fn write_bubble_strip_png(
    scanner: &Scanner,
    frame: &ScanFrame,
    transform: &SimilarityTransform,
    path: &Path,
) -> Result<()> {
    let px_per_pt = scanner.reference().px_per_pt();
    let ref_height = f64::from(scanner.reference().height());

    let bounds: Vec<[f64; 4]> = scanner
        .spec()
        .iter_bubbles()
        .map(|(_, _, _, bounds)| bounds)
        .collect();
    let max_w_px = bounds.iter().map(|b| b[2]).fold(0.0, f64::max) * px_per_pt;
    let max_h_px = bounds.iter().map(|b| b[3]).fold(0.0, f64::max) * px_per_pt;
    let cell_w = (max_w_px.ceil() as u32) * 4;
    let cell_h = (max_h_px.ceil() as u32) * 4;
    if cell_w == 0 || cell_h == 0 {
        debug!("no bubbles to crop, skipping {}", path.display());
        return Ok(());
    }

    let mut out = RgbaImage::new(cell_w, cell_h * bounds.len() as u32);
    for (index, [x_pt, y_pt, w_pt, h_pt]) in bounds.iter().copied().enumerate() {
        let base_x = x_pt * px_per_pt;
        let base_y = ref_height - y_pt * px_per_pt;
        let crop_w = (w_pt * px_per_pt * 4.0).ceil() as u32;
        let crop_h = (h_pt * px_per_pt * 4.0).ceil() as u32;
        // Anchor each crop at the bottom of its cell, filling upward.
        let cell_bottom = cell_h * (index as u32 + 1) - 1;
        for iy in 0..crop_h.min(cell_h) {
            let ry = base_y - f64::from(iy) * 0.25;
            for ix in 0..crop_w.min(cell_w) {
                let rx = base_x + f64::from(ix) * 0.25;
                let (sx, sy) = transform.map_f(rx, ry);
                out.put_pixel(ix, cell_bottom - iy, sample_bicubic(frame, sx, sy));
            }
        }
    }
    out.save(path)?;
    Ok(())
}

/// Probes random reference-image positions for patches with strong
/// horizontal and vertical structure, keeping the best scorers. Candidate
/// sync targets for alignment refinement.
#[time]
pub fn find_alignment_hotspots(reference: &ReferenceImage) -> Vec<Point<u32>> {
    let frame = reference.frame();
    if frame.width() < 4 * HOTSPOT_SIZE || frame.height() < 4 * HOTSPOT_SIZE {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();
    let mut scored: Vec<(i64, Point<u32>)> = Vec::new();
    for _ in 0..HOTSPOT_COUNT * HOTSPOT_PROBES_PER_KEPT {
        let x = rng.gen_range(HOTSPOT_SIZE..frame.width() - HOTSPOT_SIZE);
        let y = rng.gen_range(HOTSPOT_SIZE..frame.height() - HOTSPOT_SIZE);
        let score = hotspot_quality(frame, reference.threshold(), x, y);
        if score >= 0 {
            scored.push((score, Point::new(x, y)));
        }
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(HOTSPOT_COUNT);
    debug!(
        "kept {} hotspots, best score {:?}",
        scored.len(),
        scored.first().map(|s| s.0)
    );
    scored.into_iter().map(|(_, p)| p).collect()
}

/// Scores a patch by counting 3-same-then-3-different runs of its binarized
/// pixels along rows (horizontal structure) and columns (vertical
/// structure). Patches lacking either direction are rejected.
fn hotspot_quality(frame: &ScanFrame, threshold: u8, center_x: u32, center_y: u32) -> i64 {
    const N: usize = HOTSPOT_SIZE as usize;
    let left = center_x - HOTSPOT_SIZE / 2;
    let top = center_y - HOTSPOT_SIZE / 2;

    let mut bits = [[false; N]; N];
    for (iy, row) in bits.iter_mut().enumerate() {
        for (ix, bit) in row.iter_mut().enumerate() {
            *bit = frame.luma(left + ix as u32, top + iy as u32) >= threshold;
        }
    }

    let mut dx = 0i64;
    for row in &bits {
        for ix in 0..N - 6 {
            let w = &row[ix..ix + 6];
            if w[0] == w[1] && w[0] == w[2] && w[0] != w[3] && w[0] != w[4] && w[0] != w[5] {
                dx += 1;
            }
        }
    }
    let mut dy = 0i64;
    for iy in 0..N - 6 {
        for ix in 0..N {
            let c = [
                bits[iy][ix],
                bits[iy + 1][ix],
                bits[iy + 2][ix],
                bits[iy + 3][ix],
                bits[iy + 4][ix],
                bits[iy + 5][ix],
            ];
            if c[0] == c[1] && c[0] == c[2] && c[0] != c[3] && c[0] != c[4] && c[0] != c[5] {
                dy += 1;
            }
        }
    }
    if dx == 0 || dy == 0 {
        return -1;
    }
    let fx = ((dx as f64 * 0.5).log10() + 0.5) * dx as f64;
    let fy = ((dy as f64 * 0.5).log10() + 0.5) * dy as f64;
    (fx + fy) as i64
}

/// Writes the hotspot patches stacked into one strip so the chosen targets
/// can be inspected.
pub fn write_hotspots_png(
    reference: &ReferenceImage,
    spots: &[Point<u32>],
    path: &Path,
) -> Result<()> {
    let frame = reference.frame();
    let height = (HOTSPOT_SIZE * spots.len() as u32).max(1);
    let mut out = RgbaImage::from_pixel(HOTSPOT_SIZE, height, Rgba([0, 0, 0, 255]));
    for (index, spot) in spots.iter().enumerate() {
        let left = spot.x - HOTSPOT_SIZE / 2;
        let top = spot.y - HOTSPOT_SIZE / 2;
        for iy in 0..HOTSPOT_SIZE {
            for ix in 0..HOTSPOT_SIZE {
                let [r, g, b, a] = frame.rgba(left + ix, top + iy);
                out.put_pixel(ix, index as u32 * HOTSPOT_SIZE + iy, Rgba([r, g, b, a]));
            }
        }
    }
    out.save(path)?;
    Ok(())
}
