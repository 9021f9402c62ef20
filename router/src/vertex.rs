use crate::graph::{EdgeId, TrackId, VertexId};
use crate::nets::EquivalentNets;
use crate::rules::Direction;
use gridroute_common::geom::Point;
use gridroute_common::tech::Layer;
use std::collections::{BTreeMap, BTreeSet};

/// Position of a neighbouring grid vertex relative to this one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Compass {
    Upper,
    UpperRight,
    Right,
    LowerRight,
    Lower,
    LowerLeft,
    Left,
    UpperLeft,
}

pub const ALL_COMPASS: [Compass; 8] = [
    Compass::Upper,
    Compass::UpperRight,
    Compass::Right,
    Compass::LowerRight,
    Compass::Lower,
    Compass::LowerLeft,
    Compass::Left,
    Compass::UpperLeft,
];

/// One recorded use of or hazard near a vertex: whether it outlives the
/// current search, and the layer it applies to (None means every layer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetHazard {
    pub temporary: bool,
    pub layer: Option<Layer>,
}

/// A routable point, usually at the intersection of two orthogonal tracks.
///
/// Net occupancy (`in_use_by_nets`) and proximity hazards
/// (`blocked_by_nearby_nets`) are tracked independently: the net that owns
/// a vertex may route through it again while every other net is excluded.
/// Availability is cached because the search queries it constantly.
#[derive(Clone, Debug)]
pub struct Vertex {
    centre: Point,
    cost: f64,
    connected_layers: Vec<Layer>,
    horizontal_track: Option<TrackId>,
    vertical_track: Option<TrackId>,
    grid_position: Option<(usize, usize)>,
    edges: Vec<EdgeId>,
    neighbours: Vec<(Compass, VertexId)>,
    in_use_by_nets: BTreeMap<String, Vec<NetHazard>>,
    blocked_by_nearby_nets: BTreeMap<String, Vec<NetHazard>>,
    forced_blocked_layers: BTreeSet<Layer>,
    temporarily_forced_blocked_layers: BTreeSet<Layer>,
    forced_blocked: bool,
    temporarily_forced_blocked: bool,
    totally_available: bool,
    explicit_net_layer: Option<Layer>,
    forced_encap_directions: BTreeMap<Layer, Direction>,
    /// Paths (by installed-path index) crossing this vertex, with the edges
    /// they use it through.
    installed_in_paths: BTreeMap<usize, BTreeSet<EdgeId>>,
}

impl Vertex {
    pub fn new(centre: Point) -> Self {
        Self {
            centre,
            cost: 0.0,
            connected_layers: Vec::new(),
            horizontal_track: None,
            vertical_track: None,
            grid_position: None,
            edges: Vec::new(),
            neighbours: Vec::new(),
            in_use_by_nets: BTreeMap::new(),
            blocked_by_nearby_nets: BTreeMap::new(),
            forced_blocked_layers: BTreeSet::new(),
            temporarily_forced_blocked_layers: BTreeSet::new(),
            forced_blocked: false,
            temporarily_forced_blocked: false,
            totally_available: true,
            explicit_net_layer: None,
            forced_encap_directions: BTreeMap::new(),
            installed_in_paths: BTreeMap::new(),
        }
    }

    pub fn centre(&self) -> Point {
        self.centre
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn set_cost(&mut self, cost: f64) {
        self.cost = cost;
    }

    pub fn add_connected_layer(&mut self, layer: Layer) {
        if self.connected_layers.contains(&layer) {
            return;
        }
        self.connected_layers.push(layer);
        assert!(
            self.connected_layers.len() <= 2,
            "vertex at {} cannot connect more than 2 layers",
            self.centre
        );
    }

    pub fn connects_layer(&self, layer: Layer) -> bool {
        self.connected_layers.contains(&layer)
    }

    pub fn connected_layers(&self) -> &[Layer] {
        &self.connected_layers
    }

    pub fn connected_layer_other_than(&self, layer: Layer) -> Option<Layer> {
        self.connected_layers.iter().copied().find(|&l| l != layer)
    }

    pub fn set_horizontal_track(&mut self, track: Option<TrackId>) {
        self.horizontal_track = track;
    }

    pub fn horizontal_track(&self) -> Option<TrackId> {
        self.horizontal_track
    }

    pub fn set_vertical_track(&mut self, track: Option<TrackId>) {
        self.vertical_track = track;
    }

    pub fn vertical_track(&self) -> Option<TrackId> {
        self.vertical_track
    }

    pub fn tracks(&self) -> Vec<TrackId> {
        self.horizontal_track
            .iter()
            .chain(self.vertical_track.iter())
            .copied()
            .collect()
    }

    pub fn is_off_grid(&self) -> bool {
        self.horizontal_track.is_none() || self.vertical_track.is_none()
    }

    pub fn set_grid_position(&mut self, column: usize, row: usize) {
        self.grid_position = Some((column, row));
    }

    pub fn grid_position(&self) -> Option<(usize, usize)> {
        self.grid_position
    }

    pub fn add_edge(&mut self, edge: EdgeId) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn remove_edge(&mut self, edge: EdgeId) -> bool {
        match self.edges.iter().position(|&e| e == edge) {
            Some(index) => {
                self.edges.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn add_neighbour(&mut self, position: Compass, vertex: VertexId) {
        self.neighbours.push((position, vertex));
    }

    pub fn neighbours(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.neighbours.iter().map(|&(_, v)| v)
    }

    pub fn neighbours_in(&self, position: Compass) -> impl Iterator<Item = VertexId> + '_ {
        self.neighbours
            .iter()
            .filter(move |&&(p, _)| p == position)
            .map(|&(_, v)| v)
    }

    pub fn set_explicit_net_layer(&mut self, layer: Option<Layer>) {
        self.explicit_net_layer = layer;
    }

    pub fn explicit_net_layer(&self) -> Option<Layer> {
        self.explicit_net_layer
    }

    pub fn set_forced_encap_direction(&mut self, layer: Layer, direction: Direction) {
        self.forced_encap_directions.insert(layer, direction);
    }

    pub fn forced_encap_direction(&self, layer: Layer) -> Option<Direction> {
        self.forced_encap_directions.get(&layer).copied()
    }

    pub fn installed_in_paths(&self) -> &BTreeMap<usize, BTreeSet<EdgeId>> {
        &self.installed_in_paths
    }

    pub fn record_installed_path(&mut self, path_index: usize, edge: EdgeId) {
        self.installed_in_paths
            .entry(path_index)
            .or_default()
            .insert(edge);
    }

    /// True iff the vertex carries no hazards at all.
    pub fn available(&self) -> bool {
        self.totally_available
    }

    pub fn add_using_net(&mut self, net: &str, temporary: bool, layer: Option<Layer>) {
        Self::add_hazard(&mut self.in_use_by_nets, net, temporary, layer);
        self.update_cached_status();
    }

    pub fn add_blocking_net(&mut self, net: &str, temporary: bool, layer: Option<Layer>) {
        Self::add_hazard(&mut self.blocked_by_nearby_nets, net, temporary, layer);
        self.update_cached_status();
    }

    pub fn set_forced_blocked(&mut self, blocked: bool, temporary: bool, layer: Option<Layer>) {
        match (layer, temporary) {
            (None, false) => self.forced_blocked = blocked,
            (None, true) => self.temporarily_forced_blocked = blocked,
            (Some(layer), false) => {
                if blocked {
                    self.forced_blocked_layers.insert(layer);
                } else {
                    self.forced_blocked_layers.remove(&layer);
                }
            }
            (Some(layer), true) => {
                if blocked {
                    self.temporarily_forced_blocked_layers.insert(layer);
                } else {
                    self.temporarily_forced_blocked_layers.remove(&layer);
                }
            }
        }
        self.update_cached_status();
    }

    pub fn forced_blocked(&self, layer: Option<Layer>) -> bool {
        if self.forced_blocked || self.temporarily_forced_blocked {
            return true;
        }
        match layer {
            Some(layer) => {
                self.forced_blocked_layers.contains(&layer)
                    || self.temporarily_forced_blocked_layers.contains(&layer)
            }
            None => {
                !self.forced_blocked_layers.is_empty()
                    || !self.temporarily_forced_blocked_layers.is_empty()
            }
        }
    }

    pub fn reset_temporary_status(&mut self) {
        self.temporarily_forced_blocked = false;
        self.temporarily_forced_blocked_layers.clear();
        Self::remove_temporary_hazards(&mut self.in_use_by_nets);
        Self::remove_temporary_hazards(&mut self.blocked_by_nearby_nets);
        self.update_cached_status();
    }

    /// Nets using this vertex, restricted to `layer` if given (a hazard
    /// without a layer applies to every layer).
    pub fn using_net_names(&self, layer: Option<Layer>) -> BTreeSet<&str> {
        Self::net_names(&self.in_use_by_nets, layer)
    }

    pub fn blocking_net_names(&self, layer: Option<Layer>) -> BTreeSet<&str> {
        Self::net_names(&self.blocked_by_nearby_nets, layer)
    }

    pub fn in_use_by_single_net(&self, layer: Option<Layer>) -> Option<&str> {
        Self::single_net(Self::net_names(&self.in_use_by_nets, layer))
    }

    pub fn blocked_by_single_nearby_net(&self, layer: Option<Layer>) -> Option<&str> {
        Self::single_net(Self::net_names(&self.blocked_by_nearby_nets, layer))
    }

    /// The net this vertex is installed for, if exactly one permanent net
    /// uses it.
    pub fn net(&self) -> Option<&str> {
        let permanent: Vec<&str> = self
            .in_use_by_nets
            .iter()
            .filter(|(_, hazards)| hazards.iter().any(|h| !h.temporary))
            .map(|(net, _)| net.as_str())
            .collect();
        match permanent.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }

    /// Availability for a specific net set on a specific layer (or all
    /// layers when `layer` is None; any net when `for_nets` is None).
    ///
    /// A vertex in use by one net while blocked by a *different* nearby net
    /// has ambiguous ownership and is never available.
    pub fn available_for_all(
        &self,
        for_nets: Option<&EquivalentNets>,
        layer: Option<Layer>,
    ) -> bool {
        if self.totally_available {
            return true;
        }
        if self.forced_blocked(layer) {
            return false;
        }
        let using = self.using_net_names(layer);
        let blocking = self.blocking_net_names(layer);
        if using.len() > 1 || blocking.len() > 1 {
            return false;
        }
        let used_by = using.iter().next().copied();
        let blocked_by = blocking.iter().next().copied();
        if let (Some(u), Some(b)) = (used_by, blocked_by) {
            if u != b {
                return false;
            }
        }
        let nets = match for_nets {
            Some(nets) => nets,
            None => return used_by.is_none() && blocked_by.is_none(),
        };
        used_by.map_or(true, |u| nets.contains(u))
            && blocked_by.map_or(true, |b| nets.contains(b))
    }

    /// Inverse of `available_for_all` for a given net set; a blockage on
    /// any layer counts when `layer` is None.
    pub fn is_blocked(&self, for_nets: &EquivalentNets, layer: Option<Layer>) -> bool {
        !self.available_for_all(Some(for_nets), layer)
    }

    /// True if at least one connected layer is available for the nets.
    pub fn available_for_nets_on_any_layer(&self, nets: &EquivalentNets) -> bool {
        if self.connected_layers.is_empty() {
            log::warn!(
                "vertex at {} has no connected layers; availability check will fail",
                self.centre
            );
        }
        self.connected_layers
            .iter()
            .any(|&layer| self.available_for_all(Some(nets), Some(layer)))
    }

    fn add_hazard(
        container: &mut BTreeMap<String, Vec<NetHazard>>,
        net: &str,
        temporary: bool,
        layer: Option<Layer>,
    ) {
        let hazards = container.entry(net.to_string()).or_default();
        for hazard in hazards.iter_mut() {
            if hazard.layer == layer {
                // Permanent trumps temporary.
                if !temporary {
                    hazard.temporary = false;
                }
                return;
            }
        }
        hazards.push(NetHazard { temporary, layer });
    }

    fn remove_temporary_hazards(container: &mut BTreeMap<String, Vec<NetHazard>>) {
        container.retain(|_, hazards| {
            hazards.retain(|h| !h.temporary);
            !hazards.is_empty()
        });
    }

    fn net_names(
        container: &BTreeMap<String, Vec<NetHazard>>,
        layer: Option<Layer>,
    ) -> BTreeSet<&str> {
        container
            .iter()
            .filter(|(_, hazards)| {
                hazards
                    .iter()
                    .any(|h| h.layer.is_none() || layer.is_none() || h.layer == layer)
            })
            .map(|(net, _)| net.as_str())
            .collect()
    }

    fn single_net(names: BTreeSet<&str>) -> Option<&str> {
        if names.len() == 1 {
            names.into_iter().next()
        } else {
            None
        }
    }

    fn update_cached_status(&mut self) {
        self.totally_available = !self.forced_blocked
            && !self.temporarily_forced_blocked
            && self.forced_blocked_layers.is_empty()
            && self.temporarily_forced_blocked_layers.is_empty()
            && self.in_use_by_nets.is_empty()
            && self.blocked_by_nearby_nets.is_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(names: &[&str]) -> EquivalentNets {
        EquivalentNets::from_names(names.iter().map(|s| s.to_string()))
    }

    #[test]
    fn forced_blocked_permanent() {
        let mut v = Vertex::new(Point::new(0, 0));
        assert!(v.available());
        v.set_forced_blocked(true, false, None);
        assert!(!v.available());
        v.set_forced_blocked(false, false, None);
        assert!(v.available());
    }

    #[test]
    fn temporary_status_resets() {
        let mut v = Vertex::new(Point::new(0, 0));
        v.set_forced_blocked(true, true, None);
        v.add_using_net("a", true, None);
        assert!(!v.available());
        v.reset_temporary_status();
        assert!(v.available());
    }

    #[test]
    fn permanent_trumps_temporary() {
        let mut v = Vertex::new(Point::new(0, 0));
        v.add_using_net("a", true, None);
        v.add_using_net("a", false, None);
        v.reset_temporary_status();
        assert!(!v.available());
        assert_eq!(v.in_use_by_single_net(None), Some("a"));
    }

    #[test]
    fn available_for_owning_net_only() {
        let mut v = Vertex::new(Point::new(0, 0));
        v.add_using_net("a", false, None);
        assert!(v.available_for_all(Some(&nets(&["a"])), None));
        assert!(!v.available_for_all(Some(&nets(&["b"])), None));
        assert!(!v.available_for_all(None, None));
    }

    #[test]
    fn ambiguous_ownership_is_rejected() {
        let mut v = Vertex::new(Point::new(0, 0));
        v.add_using_net("a", false, None);
        v.add_blocking_net("b", false, None);
        // Even a net set containing both is refused: ownership is ambiguous.
        assert!(!v.available_for_all(Some(&nets(&["a", "b"])), None));
        assert!(!v.available_for_all(Some(&nets(&["a"])), None));
    }

    #[test]
    fn blocking_net_matches() {
        let mut v = Vertex::new(Point::new(0, 0));
        v.add_blocking_net("a", false, None);
        assert!(v.available_for_all(Some(&nets(&["a"])), None));
        assert!(!v.available_for_all(Some(&nets(&["b"])), None));
    }

    #[test]
    fn per_layer_hazards() {
        let mut v = Vertex::new(Point::new(0, 0));
        v.add_connected_layer(Layer(0));
        v.add_connected_layer(Layer(1));
        v.add_using_net("a", false, Some(Layer(0)));
        assert!(!v.available_for_all(Some(&nets(&["b"])), Some(Layer(0))));
        assert!(v.available_for_all(Some(&nets(&["b"])), Some(Layer(1))));
        assert!(v.available_for_nets_on_any_layer(&nets(&["b"])));
        assert!(v.available_for_nets_on_any_layer(&nets(&["a"])));
    }

    #[test]
    fn connected_layer_cap() {
        let mut v = Vertex::new(Point::new(0, 0));
        v.add_connected_layer(Layer(0));
        v.add_connected_layer(Layer(1));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            v.add_connected_layer(Layer(2));
        }));
        assert!(result.is_err());
    }
}
