use crate::error::{Result, ScanError};
use crate::frame::ScanFrame;

/// Counts every luma value in the frame into a 256-bin histogram.
pub fn luma_histogram(frame: &ScanFrame) -> [u32; 256] {
    let mut hist = [0u32; 256];
    match frame {
        ScanFrame::Gray(im) => {
            for &v in im.as_raw() {
                hist[v as usize] += 1;
            }
        }
        ScanFrame::Rgba(_) => {
            for y in 0..frame.height() {
                for x in 0..frame.width() {
                    hist[frame.luma(x, y) as usize] += 1;
                }
            }
        }
    }
    hist
}

/// Otsu's method: the brightness cut that maximizes between-class variance
/// `w_B * w_F * (mean_B - mean_F)^2`. Bin `t` is folded into the background
/// class before the cut at `t` is evaluated, and ties keep the larger `t`.
///
/// Fails only when the histogram holds no pixels at all.
pub fn otsu_threshold(hist: &[u32; 256]) -> Result<u8> {
    let mut total: u64 = 0;
    let mut sum_total: u64 = 0;
    for (value, &count) in hist.iter().enumerate() {
        total += u64::from(count);
        sum_total += value as u64 * u64::from(count);
    }
    if total == 0 {
        return Err(ScanError::EmptyHistogram);
    }

    let mut w_b: u64 = 0;
    let mut sum_b: u64 = 0;
    let mut best = 0u8;
    let mut best_var = -1.0f64;
    for (t, &count) in hist.iter().enumerate() {
        w_b += u64::from(count);
        sum_b += t as u64 * u64::from(count);
        if w_b == 0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f == 0 {
            break;
        }
        let mean_b = sum_b as f64 / w_b as f64;
        let mean_f = (sum_total - sum_b) as f64 / w_f as f64;
        let diff = mean_b - mean_f;
        let var_between = w_b as f64 * w_f as f64 * diff * diff;
        if var_between >= best_var {
            best_var = var_between;
            best = t as u8;
        }
    }
    Ok(best)
}
