use imageproc::point::Point;

use crate::error::{Result, ScanError};

/// An ordinary-least-squares fit `y = slope * x + intercept` over edge hits,
/// together with the largest perpendicular distance of any accepted inlier.
#[derive(Debug, Clone, Copy)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    pub residual_bound: f64,
}

impl LineFit {
    /// Perpendicular distance from `(x, y)` to the fitted line.
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        point_line_distance(self.slope, self.intercept, x, y)
    }
}

/// Fits a line through the points by ordinary least squares.
///
/// Fails when fewer than two points are given or the denominator
/// degenerates (all x equal).
pub fn fit_line(points: &[Point<f64>]) -> Result<LineFit> {
    if points.len() < 2 {
        return Err(ScanError::LineFitFailed);
    }
    let n = points.len() as f64;
    let x_mean = points.iter().map(|p| p.x).sum::<f64>() / n;
    let y_mean = points.iter().map(|p| p.y).sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for p in points {
        let dx = p.x - x_mean;
        numerator += dx * (p.y - y_mean);
        denominator += dx * dx;
    }
    let slope = numerator / denominator;
    if !slope.is_finite() {
        return Err(ScanError::LineFitFailed);
    }
    let intercept = y_mean - slope * x_mean;

    let residual_bound = points
        .iter()
        .map(|p| point_line_distance(slope, intercept, p.x, p.y))
        .fold(0.0, f64::max);

    Ok(LineFit {
        slope,
        intercept,
        residual_bound,
    })
}

/// Distance from `(x, y)` to the line `y = slope * x + intercept`, via the
/// general form `a x + b y + c = 0` with `a = slope`, `b = -1`,
/// `c = intercept`.
pub fn point_line_distance(slope: f64, intercept: f64, x: f64, y: f64) -> f64 {
    (slope * x - y + intercept).abs() / (slope * slope + 1.0).sqrt()
}

/// Euclidean distance between two points.
pub fn segment_length(a: Point<f64>, b: Point<f64>) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    (dx * dx + dy * dy).sqrt()
}
