use std::collections::BTreeMap;
use std::io::Read;

use serde::Deserialize;

use crate::error::{Result, ScanError};

/// Bubble extent in points: `[x, y, width, height]` with the page origin at
/// the bottom-left.
pub type SelectionBounds = [f64; 4];

/// Selection-name to bubble-extent mapping for one contest.
pub type ContestSelections = BTreeMap<String, SelectionBounds>;

/// Contest-name to selections mapping for one ballot style.
pub type BallotStyle = BTreeMap<String, ContestSelections>;

#[derive(Debug, Clone, Deserialize)]
pub struct DrawSettings {
    /// Page width and height in points.
    #[serde(rename = "pagesize")]
    pub page_size: [f64; 2],
    #[serde(rename = "pageMargin")]
    pub page_margin: f64,
}

/// Printed bubble geometry for one election, as produced by the ballot
/// layout service. Unknown fields in the source JSON are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct BallotSpec {
    pub draw_settings: DrawSettings,

    /// One entry per ballot style, in source-document order.
    pub bubbles: Vec<BallotStyle>,
}

impl BallotSpec {
    pub fn from_json_reader(reader: impl Read) -> Result<Self> {
        let spec: Self = serde_json::from_reader(reader)
            .map_err(|err| ScanError::InputDecode(format!("bubbles json: {err}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Checks the page and bubble extents before any pixel work happens.
    pub fn validate(&self) -> Result<()> {
        let [page_w, page_h] = self.draw_settings.page_size;
        if !(page_w > 0.0 && page_h > 0.0) {
            return Err(ScanError::ReferenceGeometryInvalid(format!(
                "page size {page_w}x{page_h}pt"
            )));
        }
        let margin = self.draw_settings.page_margin;
        if !(0.0..page_w.min(page_h) / 2.0).contains(&margin) {
            return Err(ScanError::ReferenceGeometryInvalid(format!(
                "page margin {margin}pt on a {page_w}x{page_h}pt page"
            )));
        }
        for (style, contest, selection, bounds) in self.iter_bubbles() {
            let [x, y, w, h] = bounds;
            let inside =
                w > 0.0 && h > 0.0 && x >= 0.0 && y >= 0.0 && x + w <= page_w && y + h <= page_h;
            if !inside {
                return Err(ScanError::ReferenceGeometryInvalid(format!(
                    "bubble {contest}/{selection} (style {style}) at [{x}, {y}, {w}, {h}]pt"
                )));
            }
        }
        Ok(())
    }

    /// All bubbles in emission order: by style, then contest, then selection.
    pub fn iter_bubbles(&self) -> impl Iterator<Item = (usize, &str, &str, SelectionBounds)> {
        self.bubbles.iter().enumerate().flat_map(|(style, contests)| {
            contests.iter().flat_map(move |(contest, selections)| {
                selections.iter().map(move |(selection, bounds)| {
                    (style, contest.as_str(), selection.as_str(), *bounds)
                })
            })
        })
    }

    pub fn bubble_count(&self) -> usize {
        self.iter_bubbles().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "draw_settings": {
            "pagesize": [612.0, 792.0],
            "pageMargin": 36.0,
            "bubbleFont": "ignored"
        },
        "bubbles": [
            {
                "mayor": {
                    "csel1": [44.2, 491.4, 22.68, 8.26],
                    "csel2": [44.2, 458.2, 22.68, 8.26]
                }
            }
        ]
    }"#;

    #[test]
    fn parses_and_ignores_unknown_fields() {
        let spec = BallotSpec::from_json_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(spec.draw_settings.page_size, [612.0, 792.0]);
        assert_eq!(spec.draw_settings.page_margin, 36.0);
        assert_eq!(spec.bubble_count(), 2);

        let all: Vec<_> = spec.iter_bubbles().collect();
        assert_eq!(all[0].1, "mayor");
        assert_eq!(all[0].2, "csel1");
        assert_eq!(all[1].2, "csel2");
    }

    #[test]
    fn rejects_bubble_outside_page() {
        let json = r#"{
            "draw_settings": {"pagesize": [100.0, 100.0], "pageMargin": 10.0},
            "bubbles": [{"c": {"s": [95.0, 50.0, 20.0, 8.0]}}]
        }"#;
        let err = BallotSpec::from_json_reader(json.as_bytes()).unwrap_err();
        assert!(matches!(err, ScanError::ReferenceGeometryInvalid(_)));
    }

    #[test]
    fn rejects_negative_bubble_extent() {
        let json = r#"{
            "draw_settings": {"pagesize": [100.0, 100.0], "pageMargin": 10.0},
            "bubbles": [{"c": {"s": [10.0, 50.0, -20.0, 8.0]}}]
        }"#;
        let err = BallotSpec::from_json_reader(json.as_bytes()).unwrap_err();
        assert!(matches!(err, ScanError::ReferenceGeometryInvalid(_)));
    }

    #[test]
    fn rejects_oversized_margin() {
        let json = r#"{
            "draw_settings": {"pagesize": [100.0, 200.0], "pageMargin": 50.0},
            "bubbles": []
        }"#;
        let err = BallotSpec::from_json_reader(json.as_bytes()).unwrap_err();
        assert!(matches!(err, ScanError::ReferenceGeometryInvalid(_)));
    }

    #[test]
    fn rejects_garbage_json() {
        let err = BallotSpec::from_json_reader(&b"not json"[..]).unwrap_err();
        assert!(matches!(err, ScanError::InputDecode(_)));
    }
}
