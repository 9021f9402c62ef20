use crate::graph::{TrackId, VertexId};
use crate::nets::EquivalentNets;
use crate::rules::Direction;
use gridroute_common::tech::Layer;

/// An undirected routable connection between two vertices on one layer.
///
/// Track edges are owned by their track; off-grid edges belong to the
/// grid directly. The cost is a monotone function of length, computed
/// once at creation.
#[derive(Clone, Debug)]
pub struct Edge {
    first: VertexId,
    second: VertexId,
    track: Option<TrackId>,
    layer: Layer,
    direction: Direction,
    length: f64,
    cost: f64,
    blocked: bool,
    temporarily_blocked: bool,
    net: Option<String>,
    temporary_net: Option<String>,
}

impl Edge {
    pub fn new(
        first: VertexId,
        second: VertexId,
        layer: Layer,
        direction: Direction,
        length: f64,
    ) -> Self {
        // Proportional to the logarithm of the distance; zero-length
        // connector edges are free.
        let cost = if length <= 0.0 { 0.0 } else { length.ln().max(0.0) };
        Self {
            first,
            second,
            track: None,
            layer,
            direction,
            length,
            cost,
            blocked: false,
            temporarily_blocked: false,
            net: None,
            temporary_net: None,
        }
    }

    pub fn first(&self) -> VertexId {
        self.first
    }

    pub fn second(&self) -> VertexId {
        self.second
    }

    pub fn other_vertex_than(&self, given: VertexId) -> VertexId {
        if self.first == given { self.second } else { self.first }
    }

    pub fn set_track(&mut self, track: Option<TrackId>) {
        self.track = track;
    }

    pub fn track(&self) -> Option<TrackId> {
        self.track
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn set_layer(&mut self, layer: Layer) {
        self.layer = layer;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn set_cost(&mut self, cost: f64) {
        self.cost = cost;
    }

    pub fn blocked(&self) -> bool {
        self.blocked || self.temporarily_blocked
    }

    pub fn set_blocked(&mut self, blocked: bool, temporary: bool) {
        if temporary {
            self.temporarily_blocked = blocked;
        } else {
            self.blocked = blocked;
        }
    }

    pub fn set_net(&mut self, net: Option<String>, temporary: bool) {
        if temporary {
            self.temporary_net = net;
        } else {
            self.net = net;
        }
    }

    pub fn permanent_net(&self) -> Option<&str> {
        self.net.as_deref()
    }

    pub fn effective_net(&self) -> Option<&str> {
        self.net.as_deref().or(self.temporary_net.as_deref())
    }

    pub fn available(&self) -> bool {
        !self.blocked() && self.effective_net().is_none()
    }

    /// An edge already claimed by one of `ok_nets` can still be used to
    /// reach that net.
    pub fn available_for_nets(&self, ok_nets: &EquivalentNets) -> bool {
        if self.blocked() {
            return false;
        }
        match self.effective_net() {
            None => true,
            Some(net) => ok_nets.contains(net),
        }
    }

    pub fn reset_temporary_status(&mut self) {
        self.temporary_net = None;
        self.temporarily_blocked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge() -> Edge {
        Edge::new(
            VertexId::new(0),
            VertexId::new(1),
            Layer(0),
            Direction::Horizontal,
            100.0,
        )
    }

    #[test]
    fn cost_grows_with_length() {
        let short = Edge::new(
            VertexId::new(0),
            VertexId::new(1),
            Layer(0),
            Direction::Horizontal,
            10.0,
        );
        let long = edge();
        assert!(long.cost() > short.cost());
        let degenerate = Edge::new(
            VertexId::new(0),
            VertexId::new(1),
            Layer(0),
            Direction::Horizontal,
            0.0,
        );
        assert_eq!(degenerate.cost(), 0.0);
    }

    #[test]
    fn net_exceptions() {
        let mut e = edge();
        assert!(e.available());
        e.set_net(Some("a".to_string()), false);
        assert!(!e.available());
        let mut ok = EquivalentNets::from_name("a");
        assert!(e.available_for_nets(&ok));
        ok = EquivalentNets::from_name("b");
        assert!(!e.available_for_nets(&ok));
        e.set_blocked(true, false);
        assert!(!e.available_for_nets(&EquivalentNets::from_name("a")));
    }

    #[test]
    fn temporary_status_resets() {
        let mut e = edge();
        e.set_blocked(true, true);
        e.set_net(Some("a".to_string()), true);
        assert!(!e.available());
        e.reset_temporary_status();
        assert!(e.available());
    }
}
