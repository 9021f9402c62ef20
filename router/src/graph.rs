use crate::edge::Edge;
use crate::nets::EquivalentNets;
use crate::rules::Direction;
use crate::track::{Track, TrackBlockage};
use crate::vertex::Vertex;
use gridroute_common::define_index;
use gridroute_common::geom::Point;
use gridroute_common::tech::Layer;

define_index!(VertexId);
define_index!(EdgeId);
define_index!(TrackId);

/// Arena store for the routing graph. All vertices, edges and tracks live
/// here and refer to each other by id; a dangling id is a programming
/// error and panics on access.
#[derive(Default)]
pub struct Graph {
    vertices: Vec<Option<Vertex>>,
    edges: Vec<Option<Edge>>,
    tracks: Vec<Option<Track>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        self.vertices
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .unwrap_or_else(|| panic!("{:?} is not in the graph", id))
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> &mut Vertex {
        self.vertices
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .unwrap_or_else(|| panic!("{:?} is not in the graph", id))
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .unwrap_or_else(|| panic!("{:?} is not in the graph", id))
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .unwrap_or_else(|| panic!("{:?} is not in the graph", id))
    }

    pub fn track(&self, id: TrackId) -> &Track {
        self.tracks
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .unwrap_or_else(|| panic!("{:?} is not in the graph", id))
    }

    pub fn track_mut(&mut self, id: TrackId) -> &mut Track {
        self.tracks
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .unwrap_or_else(|| panic!("{:?} is not in the graph", id))
    }

    pub fn contains_vertex(&self, id: VertexId) -> bool {
        self.vertices
            .get(id.index())
            .map_or(false, |slot| slot.is_some())
    }

    pub fn contains_edge(&self, id: EdgeId) -> bool {
        self.edges
            .get(id.index())
            .map_or(false, |slot| slot.is_some())
    }

    pub fn num_vertex_slots(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| VertexId::new(i))
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| EdgeId::new(i))
    }

    pub fn track_ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.tracks
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| TrackId::new(i))
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> VertexId {
        let id = VertexId::new(self.vertices.len());
        self.vertices.push(Some(vertex));
        id
    }

    pub fn add_track(&mut self, track: Track) -> TrackId {
        let id = TrackId::new(self.tracks.len());
        self.tracks.push(Some(track));
        id
    }

    /// Deletes a vertex slot. The caller must already have detached the
    /// vertex from tracks and edges. Deleting a missing vertex panics: it
    /// means the graph has diverged from a valid state.
    pub fn delete_vertex(&mut self, id: VertexId) -> Vertex {
        self.vertices
            .get_mut(id.index())
            .and_then(|slot| slot.take())
            .unwrap_or_else(|| panic!("removing {:?} which is not in the graph", id))
    }

    pub fn delete_edge(&mut self, id: EdgeId) -> Edge {
        self.edges
            .get_mut(id.index())
            .and_then(|slot| slot.take())
            .unwrap_or_else(|| panic!("removing {:?} which is not in the graph", id))
    }

    /// Creates an edge between two vertices and registers it with both.
    /// The direction is derived from the endpoint geometry; the edge is
    /// not attached to any track here.
    pub fn create_edge(&mut self, first: VertexId, second: VertexId, layer: Layer) -> EdgeId {
        let a = self.vertex(first).centre();
        let b = self.vertex(second).centre();
        assert!(
            a.x == b.x || a.y == b.y,
            "edge between {} and {} is not rectilinear",
            a,
            b
        );
        let direction = if a.y == b.y {
            Direction::Horizontal
        } else {
            Direction::Vertical
        };
        let length = a.l2_distance_to(b);
        let edge = Edge::new(first, second, layer, direction, length);
        let id = EdgeId::new(self.edges.len());
        self.edges.push(Some(edge));
        self.vertex_mut(first).add_edge(id);
        self.vertex_mut(second).add_edge(id);
        id
    }

    /// Detaches an edge from its endpoints and track, then deletes it.
    pub fn remove_edge_fully(&mut self, id: EdgeId) {
        let (first, second, track) = {
            let edge = self.edge(id);
            (edge.first(), edge.second(), edge.track())
        };
        self.vertex_mut(first).remove_edge(id);
        self.vertex_mut(second).remove_edge(id);
        if let Some(track_id) = track {
            self.track_mut(track_id).edges_mut().retain(|&e| e != id);
        }
        self.delete_edge(id);
    }

    pub fn get_track_edge_between(
        &self,
        track_id: TrackId,
        lhs: VertexId,
        rhs: VertexId,
    ) -> Option<EdgeId> {
        self.track(track_id)
            .edges()
            .iter()
            .copied()
            .find(|&id| {
                let edge = self.edge(id);
                (edge.first() == lhs && edge.second() == rhs)
                    || (edge.first() == rhs && edge.second() == lhs)
            })
    }

    /// Tries to add a track edge between the two vertices; fails if the
    /// span is already blocked for `for_nets`. Same-net collisions label
    /// the new edge instead of blocking it.
    pub fn track_maybe_add_edge_between(
        &mut self,
        track_id: TrackId,
        one: VertexId,
        the_other: VertexId,
        for_nets: Option<&EquivalentNets>,
    ) -> bool {
        let a = self.vertex(one).centre();
        let b = self.vertex(the_other).centre();
        let mut same_net = Vec::new();
        let mut temporary_same_net = Vec::new();
        {
            let track = self.track(track_id);
            if track.is_edge_blocked_between(
                a,
                b,
                track.min_separation_to_new_blockages(),
                for_nets,
                &mut same_net,
                &mut temporary_same_net,
            ) {
                return false;
            }
        }
        let layer = self.track(track_id).layer();
        let edge_id = self.create_edge(one, the_other, layer);
        self.edge_mut(edge_id).set_track(Some(track_id));
        self.track_mut(track_id).edges_mut().push(edge_id);

        for blockage in same_net {
            self.apply_edge_blockage_to_single_edge(track_id, &blockage, false, edge_id);
        }
        for blockage in temporary_same_net {
            self.apply_edge_blockage_to_single_edge(track_id, &blockage, true, edge_id);
        }
        true
    }

    /// Adds a vertex to a track, generating an edge to every other vertex
    /// on the track whose connecting span is not blocked. Returns whether
    /// at least one edge was created (vacuously true for the first
    /// vertex). Duplicate insertion or an off-track position is a fatal
    /// construction bug.
    pub fn track_add_vertex(
        &mut self,
        track_id: TrackId,
        vertex_id: VertexId,
        for_nets: Option<&EquivalentNets>,
    ) -> bool {
        let centre = self.vertex(vertex_id).centre();
        let (offset, direction, blocked) = {
            let track = self.track(track_id);
            assert!(
                track.is_point_on_track(centre),
                "{} cannot accommodate vertex at {}",
                track.describe(),
                centre
            );
            assert!(
                !track.contains_vertex(vertex_id),
                "duplicate vertex added to track"
            );
            let offset = track.project_onto_track(centre);
            assert!(
                track.get_vertex_at_offset(offset).is_none(),
                "there already exists a vertex at offset {}",
                offset
            );
            (
                offset,
                track.direction(),
                track.is_vertex_blocked(centre, 0, for_nets),
            )
        };
        if blocked {
            log::warn!("track cannot add vertex at {}, it is blocked", centre);
        }

        let mut any_success = self.track(track_id).vertices_by_offset().is_empty();
        let others: Vec<VertexId> = self
            .track(track_id)
            .vertices_by_offset()
            .values()
            .copied()
            .collect();
        for other in others {
            // Bitwise OR: every candidate edge is attempted.
            any_success |=
                self.track_maybe_add_edge_between(track_id, vertex_id, other, for_nets);
        }

        if any_success {
            match direction {
                Direction::Horizontal => {
                    self.vertex_mut(vertex_id).set_horizontal_track(Some(track_id))
                }
                Direction::Vertical => {
                    self.vertex_mut(vertex_id).set_vertical_track(Some(track_id))
                }
            }
            self.track_mut(track_id)
                .vertices_by_offset_mut()
                .insert(offset, vertex_id);
        }
        any_success
    }

    /// Removes a vertex from a track together with every track edge that
    /// uses it. Returns false if the track did not know the vertex.
    pub fn track_remove_vertex(&mut self, track_id: TrackId, vertex_id: VertexId) -> bool {
        let centre = self.vertex(vertex_id).centre();
        let offset = self.track(track_id).project_onto_track(centre);
        if self
            .track_mut(track_id)
            .vertices_by_offset_mut()
            .remove(&offset)
            .is_none()
        {
            return false;
        }
        let doomed: Vec<EdgeId> = self
            .track(track_id)
            .edges()
            .iter()
            .copied()
            .filter(|&id| {
                let edge = self.edge(id);
                edge.first() == vertex_id || edge.second() == vertex_id
            })
            .collect();
        for edge_id in doomed {
            self.remove_edge_fully(edge_id);
        }
        match self.track(track_id).direction() {
            Direction::Horizontal => self.vertex_mut(vertex_id).set_horizontal_track(None),
            Direction::Vertical => self.vertex_mut(vertex_id).set_vertical_track(None),
        }
        true
    }

    /// Converts an edge into a permanent blockage spanning its endpoints:
    /// the edge is net-labeled, a blockage interval is merged into both
    /// planes, touching same-net edges inherit the label (edges touching a
    /// *different* net become permanently blocked), and every vertex
    /// strictly between the endpoints becomes unavailable and net-labeled.
    pub fn track_mark_edge_used(&mut self, track_id: TrackId, edge_id: EdgeId, net: &str) {
        self.edge_mut(edge_id).set_net(Some(net.to_string()), false);

        if !self.track(track_id).edges().contains(&edge_id) {
            // Possibly an off-grid edge; nothing further to do here.
            return;
        }

        let (first, second) = {
            let edge = self.edge(edge_id);
            (edge.first(), edge.second())
        };
        let a = self.vertex(first).centre();
        let b = self.vertex(second).centre();
        let margin = self.track(track_id).min_separation_between_edges();
        let layer = self.track(track_id).layer();

        self.track_mut(track_id)
            .merge_new_vertex_blockage(a, b, margin, Some(net));
        let current = self
            .track_mut(track_id)
            .merge_new_edge_blockage(a, b, margin, Some(net));

        // Edges touching the new blockage either inherit the net or, if
        // already labeled for a different net, become dead.
        let others: Vec<EdgeId> = self
            .track(track_id)
            .edges()
            .iter()
            .copied()
            .filter(|&id| id != edge_id)
            .collect();
        for other_id in others {
            let (oa, ob, blocked, other_net) = {
                let other = self.edge(other_id);
                (
                    self.vertex(other.first()).centre(),
                    self.vertex(other.second()).centre(),
                    other.blocked(),
                    other.permanent_net().map(|n| n.to_string()),
                )
            };
            if blocked {
                continue;
            }
            if !self
                .track(track_id)
                .blockage_blocks_span(&current, oa, ob, 0)
            {
                continue;
            }
            match other_net {
                Some(existing) if existing != net => {
                    let other = self.edge_mut(other_id);
                    other.set_blocked(true, false);
                    other.set_net(None, false);
                }
                _ => {
                    self.edge_mut(other_id).set_net(Some(net.to_string()), false);
                }
            }
        }

        // Spanned vertices become permanent members of the net.
        let spanned: Vec<VertexId> = {
            let track = self.track(track_id);
            track
                .vertices_in_span(a, b)
                .into_iter()
                .filter(|&v| v != first && v != second)
                .collect()
        };
        for vertex_id in spanned {
            self.vertex_mut(vertex_id).add_edge(edge_id);
            self.vertex_mut(vertex_id).add_using_net(net, false, Some(layer));
        }
    }

    /// The nearest vertices on either side of `vertex` along the track.
    pub fn track_immediate_neighbours(
        &self,
        track_id: TrackId,
        vertex_id: VertexId,
        available_only: bool,
    ) -> Vec<VertexId> {
        let track = self.track(track_id);
        let offset = track.project_onto_track(self.vertex(vertex_id).centre());
        let mut lower = None;
        let mut higher = None;
        for (&position, &candidate) in track.vertices_by_offset() {
            if position == offset {
                continue;
            }
            if available_only && !self.vertex(candidate).available() {
                continue;
            }
            if position < offset {
                lower = Some(candidate);
            } else {
                higher = Some(candidate);
                break;
            }
        }
        lower.into_iter().chain(higher).collect()
    }

    /// Restores connectivity across a blocked vertex by bridging its two
    /// immediate neighbours, when legal and not already bridged.
    pub fn track_heal_around_blocked_vertex(
        &mut self,
        track_id: TrackId,
        vertex_id: VertexId,
    ) -> bool {
        if self.vertex(vertex_id).available() {
            return false;
        }
        let neighbours = self.track_immediate_neighbours(track_id, vertex_id, false);
        if neighbours.len() == 2 {
            if self
                .get_track_edge_between(track_id, neighbours[0], neighbours[1])
                .is_some()
            {
                return false;
            }
            return self.track_maybe_add_edge_between(
                track_id,
                neighbours[0],
                neighbours[1],
                None,
            );
        }
        false
    }

    fn apply_edge_blockage_to_single_edge(
        &mut self,
        track_id: TrackId,
        blockage: &TrackBlockage,
        temporary: bool,
        edge_id: EdgeId,
    ) {
        let (a, b, blocked, effective_net) = {
            let edge = self.edge(edge_id);
            (
                self.vertex(edge.first()).centre(),
                self.vertex(edge.second()).centre(),
                edge.blocked(),
                edge.effective_net().map(|n| n.to_string()),
            )
        };
        if blocked {
            return;
        }
        let margin = self.track(track_id).min_separation_to_new_blockages();
        if !self
            .track(track_id)
            .blockage_blocks_span(blockage, a, b, margin)
        {
            return;
        }
        self.edge_mut(edge_id).set_blocked(true, temporary);
        if let Some(net) = blockage.net() {
            if effective_net.is_none() {
                self.edge_mut(edge_id).set_net(Some(net.to_string()), temporary);
            }
        }
    }

    /// Applies a vertex-blockage interval to every vertex on the track
    /// that it fully covers, reporting those it newly blocked.
    pub fn track_apply_vertex_blockage(
        &mut self,
        track_id: TrackId,
        blockage: &TrackBlockage,
        temporary: bool,
        blocked_vertices: &mut Vec<VertexId>,
    ) {
        let layer = self.track(track_id).layer();
        let members: Vec<VertexId> = self
            .track(track_id)
            .vertices_by_offset()
            .values()
            .copied()
            .collect();
        for vertex_id in members {
            let centre = self.vertex(vertex_id).centre();
            if !self.vertex(vertex_id).available() {
                continue;
            }
            if !self
                .track(track_id)
                .blockage_blocks_span(blockage, centre, centre, 0)
            {
                continue;
            }
            match blockage.net() {
                Some(net) => {
                    self.vertex_mut(vertex_id)
                        .add_blocking_net(net, temporary, Some(layer));
                }
                None => {
                    self.vertex_mut(vertex_id)
                        .set_forced_blocked(true, temporary, Some(layer));
                }
            }
            blocked_vertices.push(vertex_id);
        }
    }

    /// Applies an edge-blockage interval to every edge on the track,
    /// reporting those it newly blocked.
    pub fn track_apply_edge_blockage(
        &mut self,
        track_id: TrackId,
        blockage: &TrackBlockage,
        temporary: bool,
        blocked_edges: &mut Vec<EdgeId>,
    ) {
        let members: Vec<EdgeId> = self.track(track_id).edges().to_vec();
        for edge_id in members {
            let was_blocked = self.edge(edge_id).blocked();
            self.apply_edge_blockage_to_single_edge(track_id, blockage, temporary, edge_id);
            if !was_blocked && self.edge(edge_id).blocked() {
                blocked_edges.push(edge_id);
            }
        }
    }

    /// Adds a permanent blockage from a rectangle to the track, merging
    /// into the interval planes and invalidating covered vertices/edges.
    pub fn track_add_rect_blockage(
        &mut self,
        track_id: TrackId,
        rect: &gridroute_common::geom::Rect,
        padding: i64,
        net: Option<&str>,
    ) {
        if !self.track(track_id).intersects_rect(rect, padding) {
            return;
        }
        let margin = self.track(track_id).min_separation_between_edges() + padding;
        let vertex_blockage = self.track_mut(track_id).merge_new_vertex_blockage(
            rect.lower_left(),
            rect.upper_right(),
            margin,
            net,
        );
        let mut blocked_vertices = Vec::new();
        self.track_apply_vertex_blockage(track_id, &vertex_blockage, false, &mut blocked_vertices);

        let edge_blockage = self.track_mut(track_id).merge_new_edge_blockage(
            rect.lower_left(),
            rect.upper_right(),
            margin,
            net,
        );
        let mut blocked_edges = Vec::new();
        self.track_apply_edge_blockage(track_id, &edge_blockage, false, &mut blocked_edges);
    }

    /// Polygon variant: one blockage per span where the polygon crosses
    /// the track.
    pub fn track_add_polygon_blockage(
        &mut self,
        track_id: TrackId,
        polygon: &gridroute_common::geom::Polygon,
        padding: i64,
        net: Option<&str>,
    ) {
        let spans = self.track(track_id).intersects_polygon(polygon, padding);
        let margin = self.track(track_id).min_separation_between_edges() + padding;
        for (low, high) in spans {
            let a = self.track(track_id).point_on_track(low);
            let b = self.track(track_id).point_on_track(high);
            let vertex_blockage =
                self.track_mut(track_id)
                    .merge_new_vertex_blockage(a, b, margin, net);
            let mut blocked_vertices = Vec::new();
            self.track_apply_vertex_blockage(
                track_id,
                &vertex_blockage,
                false,
                &mut blocked_vertices,
            );
            let edge_blockage =
                self.track_mut(track_id)
                    .merge_new_edge_blockage(a, b, margin, net);
            let mut blocked_edges = Vec::new();
            self.track_apply_edge_blockage(track_id, &edge_blockage, false, &mut blocked_edges);
        }
    }

    /// Temporary rectangle blockage; returns the handles needed to remove
    /// it and reports every entity it blocked so the caller can restore
    /// them on teardown.
    #[allow(clippy::too_many_arguments)]
    pub fn track_add_temporary_rect_blockage(
        &mut self,
        track_id: TrackId,
        rect: &gridroute_common::geom::Rect,
        padding: i64,
        net: Option<&str>,
        id: u64,
        blocked_vertices: &mut Vec<VertexId>,
        blocked_edges: &mut Vec<EdgeId>,
    ) -> bool {
        if !self.track(track_id).intersects_rect(rect, padding) {
            return false;
        }
        let (low, high) = {
            let track = self.track(track_id);
            Track::project_pair_onto_axis(
                rect.lower_left(),
                rect.upper_right(),
                track.direction(),
            )
        };
        let vertex_blockage =
            TrackBlockage::with_id(low, high, net.map(|n| n.to_string()), id);
        self.track_apply_vertex_blockage(track_id, &vertex_blockage, true, blocked_vertices);
        self.track_mut(track_id)
            .add_temporary_vertex_blockage(vertex_blockage);

        let edge_blockage = TrackBlockage::with_id(low, high, net.map(|n| n.to_string()), id);
        self.track_apply_edge_blockage(track_id, &edge_blockage, true, blocked_edges);
        self.track_mut(track_id)
            .add_temporary_edge_blockage(edge_blockage);
        true
    }

    /// Fetches or lazily creates the centre point of a vertex pair span.
    pub fn edge_endpoints(&self, id: EdgeId) -> (Point, Point) {
        let edge = self.edge(id);
        (
            self.vertex(edge.first()).centre(),
            self.vertex(edge.second()).centre(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_track() -> (Graph, TrackId) {
        let mut graph = Graph::new();
        let track = Track::new(Layer(0), Direction::Horizontal, 10, 4, 6, 6, 2, 0);
        let track_id = graph.add_track(track);
        (graph, track_id)
    }

    fn add_vertex_at(graph: &mut Graph, track: TrackId, x: i64) -> VertexId {
        let mut vertex = Vertex::new(Point::new(x, 0));
        vertex.add_connected_layer(Layer(0));
        let id = graph.add_vertex(vertex);
        graph.track_add_vertex(track, id, None);
        id
    }

    #[test]
    fn add_vertex_generates_edges() {
        let (mut graph, track) = graph_with_track();
        let a = add_vertex_at(&mut graph, track, 0);
        let b = add_vertex_at(&mut graph, track, 10);
        let c = add_vertex_at(&mut graph, track, 20);
        // Fully connected along the track: ab, ac, bc.
        assert_eq!(graph.track(track).edges().len(), 3);
        assert!(graph.get_track_edge_between(track, a, b).is_some());
        assert!(graph.get_track_edge_between(track, a, c).is_some());
        assert!(graph.get_track_edge_between(track, b, c).is_some());
        assert_eq!(graph.vertex(a).horizontal_track(), Some(track));
    }

    #[test]
    #[should_panic(expected = "duplicate vertex")]
    fn duplicate_vertex_is_fatal() {
        let (mut graph, track) = graph_with_track();
        let a = add_vertex_at(&mut graph, track, 0);
        graph.track_add_vertex(track, a, None);
    }

    #[test]
    fn mark_edge_used_blocks_span() {
        let (mut graph, track) = graph_with_track();
        let a = add_vertex_at(&mut graph, track, 0);
        let middle = add_vertex_at(&mut graph, track, 10);
        let c = add_vertex_at(&mut graph, track, 20);
        let long_edge = graph.get_track_edge_between(track, a, c).unwrap();
        graph.track_mark_edge_used(track, long_edge, "clk");

        assert_eq!(graph.edge(long_edge).permanent_net(), Some("clk"));
        // The spanned interior vertex now belongs to the net.
        assert!(!graph.vertex(middle).available());
        assert_eq!(graph.vertex(middle).in_use_by_single_net(None), Some("clk"));
        // Endpoints are not marked by the track (the path installer does
        // that).
        assert!(graph.vertex(a).available());
        // Touching edges inherit the net.
        let ab = graph.get_track_edge_between(track, a, middle).unwrap();
        assert_eq!(graph.edge(ab).effective_net(), Some("clk"));
    }

    #[test]
    fn mark_edge_used_kills_foreign_net_edges() {
        let (mut graph, track) = graph_with_track();
        let a = add_vertex_at(&mut graph, track, 0);
        let b = add_vertex_at(&mut graph, track, 10);
        let c = add_vertex_at(&mut graph, track, 20);
        let ac = graph.get_track_edge_between(track, a, c).unwrap();
        let bc = graph.get_track_edge_between(track, b, c).unwrap();
        graph.edge_mut(bc).set_net(Some("other".to_string()), false);
        graph.track_mark_edge_used(track, ac, "clk");
        assert!(graph.edge(bc).blocked());
        assert_eq!(graph.edge(bc).permanent_net(), None);
    }

    #[test]
    fn blocked_span_prevents_new_edges() {
        let (mut graph, track) = graph_with_track();
        let blockage = graph.track_mut(track).merge_new_edge_blockage(
            Point::new(5, 0),
            Point::new(15, 0),
            1,
            None,
        );
        let mut blocked = Vec::new();
        graph.track_apply_edge_blockage(track, &blockage, false, &mut blocked);
        let a = add_vertex_at(&mut graph, track, 0);
        let b = {
            let mut vertex = Vertex::new(Point::new(20, 0));
            vertex.add_connected_layer(Layer(0));
            let id = graph.add_vertex(vertex);
            // The span a..b crosses the blockage, so no edge results and
            // the insertion reports failure.
            assert!(!graph.track_add_vertex(track, id, None));
            id
        };
        assert!(graph.get_track_edge_between(track, a, b).is_none());
    }

    #[test]
    fn remove_vertex_removes_incident_edges() {
        let (mut graph, track) = graph_with_track();
        let a = add_vertex_at(&mut graph, track, 0);
        let b = add_vertex_at(&mut graph, track, 10);
        assert_eq!(graph.track(track).edges().len(), 1);
        assert!(graph.track_remove_vertex(track, b));
        assert!(graph.track(track).edges().is_empty());
        assert!(graph.vertex(a).edges().is_empty());
        assert!(!graph.track_remove_vertex(track, b));
    }

    #[test]
    fn immediate_neighbours() {
        let (mut graph, track) = graph_with_track();
        let a = add_vertex_at(&mut graph, track, 0);
        let b = add_vertex_at(&mut graph, track, 10);
        let c = add_vertex_at(&mut graph, track, 20);
        let neighbours = graph.track_immediate_neighbours(track, b, false);
        assert_eq!(neighbours, vec![a, c]);
    }

    #[test]
    fn healing_rebridges_around_a_blocked_vertex() {
        let (mut graph, track) = graph_with_track();
        let a = add_vertex_at(&mut graph, track, 0);
        let b = add_vertex_at(&mut graph, track, 10);
        let c = add_vertex_at(&mut graph, track, 20);
        let ac = graph.get_track_edge_between(track, a, c).unwrap();
        graph.remove_edge_fully(ac);

        // An available vertex needs no healing.
        assert!(!graph.track_heal_around_blocked_vertex(track, b));
        graph.vertex_mut(b).set_forced_blocked(true, false, None);
        assert!(graph.track_heal_around_blocked_vertex(track, b));
        assert!(graph.get_track_edge_between(track, a, c).is_some());
        // Already bridged; a second heal is a no-op.
        assert!(!graph.track_heal_around_blocked_vertex(track, b));
    }
}
