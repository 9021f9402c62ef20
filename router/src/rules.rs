use gridroute_common::geom::Rect;
use gridroute_common::tech::Layer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Routing direction of a track or wire segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Horizontal,
    Vertical,
}

impl Direction {
    pub fn orthogonal(&self) -> Direction {
        match self {
            Direction::Horizontal => Direction::Vertical,
            Direction::Vertical => Direction::Horizontal,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Horizontal => write!(f, "horizontal"),
            Direction::Vertical => write!(f, "vertical"),
        }
    }
}

/// Per-layer routing parameters handed to the grid once at setup.
#[derive(Clone, Debug)]
pub struct LayerInfo {
    pub layer: Layer,
    pub area: Rect,
    pub wire_width: i64,
    pub offset: i64,
    pub direction: Direction,
    pub pitch: i64,
    pub min_separation: i64,
}

/// Metal enclosure of a via on one of its connected layers.
#[derive(Clone, Copy, Debug, Default)]
pub struct ViaEncap {
    pub overhang_length: i64,
    pub overhang_width: i64,
}

/// Parameters of the via connecting one layer pair, including the metal
/// enclosure required on each side.
#[derive(Clone, Debug)]
pub struct ViaInfo {
    pub bottom: Layer,
    pub top: Layer,
    pub width: i64,
    pub height: i64,
    pub cost: f64,
    encaps: HashMap<Layer, ViaEncap>,
}

impl ViaInfo {
    pub fn new(bottom: Layer, top: Layer, width: i64, height: i64, cost: f64) -> Self {
        Self {
            bottom,
            top,
            width,
            height,
            cost,
            encaps: HashMap::new(),
        }
    }

    pub fn set_encap(&mut self, layer: Layer, encap: ViaEncap) {
        assert!(
            layer == self.bottom || layer == self.top,
            "via between {:?} and {:?} cannot carry an encap for {:?}",
            self.bottom,
            self.top,
            layer
        );
        self.encaps.insert(layer, encap);
    }

    pub fn encap(&self, layer: Layer) -> ViaEncap {
        self.encaps.get(&layer).copied().unwrap_or_default()
    }

    pub fn max_via_side(&self) -> i64 {
        self.width.max(self.height)
    }

    /// Enclosure span along the wire direction on `layer`.
    pub fn encap_length(&self, layer: Layer) -> i64 {
        self.max_via_side() + 2 * self.encap(layer).overhang_length
    }

    /// Enclosure span across the wire direction on `layer`.
    pub fn encap_width(&self, layer: Layer) -> i64 {
        self.max_via_side() + 2 * self.encap(layer).overhang_width
    }

    pub fn max_overhang(&self) -> i64 {
        self.encaps
            .values()
            .map(|e| e.overhang_length.max(e.overhang_width))
            .max()
            .unwrap_or(0)
    }

    pub fn connects(&self, layer: Layer) -> bool {
        layer == self.bottom || layer == self.top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encap_spans() {
        let mut via = ViaInfo::new(Layer(0), Layer(1), 150, 170, 1.0);
        via.set_encap(
            Layer(0),
            ViaEncap {
                overhang_length: 85,
                overhang_width: 55,
            },
        );
        assert_eq!(via.max_via_side(), 170);
        assert_eq!(via.encap_length(Layer(0)), 170 + 2 * 85);
        assert_eq!(via.encap_width(Layer(0)), 170 + 2 * 55);
        // A layer with no explicit encap gets the bare via size.
        assert_eq!(via.encap_length(Layer(1)), 170);
    }
}
