use crate::frame::ScanFrame;

/// Dark pixels required inside the window before an edge counts.
const DARK_PX_COUNT_THRESHOLD: u32 = 4;

/// Sliding-window length along the sweep direction.
const WINDOW_LEN: u32 = 10;

/// Sweeps a 3-row-tall, 10-column-wide window rightwards from x = 0 along
/// the rows around `y_center`, keeping a running count of pixels strictly
/// below `threshold`. Returns the window's leading column minus one when the
/// count reaches the trip level.
///
/// A sweep that never trips (or a `y_center` too close to the border to host
/// the window) returns the last column, which lands past the page midline
/// and reads as a miss to callers.
pub fn find_left_edge(frame: &ScanFrame, y_center: u32, threshold: u8) -> u32 {
    let width = frame.width();
    if y_center < 1 || y_center + 2 > frame.height() || width < WINDOW_LEN {
        return width.saturating_sub(1);
    }

    let mut dark = 0u32;
    for y in y_center - 1..=y_center + 1 {
        for x in 0..WINDOW_LEN {
            if frame.luma(x, y) < threshold {
                dark += 1;
            }
        }
    }

    let mut trailing = 0u32;
    let mut leading = WINDOW_LEN;
    while leading < width && dark < DARK_PX_COUNT_THRESHOLD {
        for y in y_center - 1..=y_center + 1 {
            if frame.luma(trailing, y) < threshold {
                dark -= 1;
            }
            if frame.luma(leading, y) < threshold {
                dark += 1;
            }
        }
        trailing += 1;
        leading += 1;
    }
    leading - 1
}

/// Transpose of [`find_left_edge`]: sweeps downwards from y = 0 along the
/// columns around `x_center`.
pub fn find_top_edge(frame: &ScanFrame, x_center: u32, threshold: u8) -> u32 {
    let height = frame.height();
    if x_center < 1 || x_center + 2 > frame.width() || height < WINDOW_LEN {
        return height.saturating_sub(1);
    }

    let mut dark = 0u32;
    for y in 0..WINDOW_LEN {
        for x in x_center - 1..=x_center + 1 {
            if frame.luma(x, y) < threshold {
                dark += 1;
            }
        }
    }

    let mut trailing = 0u32;
    let mut leading = WINDOW_LEN;
    while leading < height && dark < DARK_PX_COUNT_THRESHOLD {
        for x in x_center - 1..=x_center + 1 {
            if frame.luma(x, trailing) < threshold {
                dark -= 1;
            }
            if frame.luma(x, leading) < threshold {
                dark += 1;
            }
        }
        trailing += 1;
        leading += 1;
    }
    leading - 1
}
