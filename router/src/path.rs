use crate::graph::{EdgeId, Graph, VertexId};
use crate::grid::{Grid, Terminal};
use crate::nets::EquivalentNets;
use crate::rules::Direction;
use crate::vertex::Vertex;
use gridroute_common::geom::Point;
use gridroute_common::tech::Layer;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// A wire enclosure widening at one point of a polyline, typically around
/// a via.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Bulge {
    pub at: Point,
    /// Span along `direction`.
    pub length: i64,
    /// Span across `direction`.
    pub width: i64,
    pub direction: Direction,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoutePolyline {
    pub layer: Layer,
    pub width: i64,
    pub points: Vec<Point>,
    pub bulges: Vec<Bulge>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ViaPlacement {
    pub at: Point,
    pub bottom: Layer,
    pub top: Layer,
}

/// Physical geometry of one installed route, ready for a downstream
/// consumer to render into manufacturable shapes.
#[derive(Clone, Debug, Serialize)]
pub struct RouteGeometry {
    pub net: String,
    pub polylines: Vec<RoutePolyline>,
    pub vias: Vec<ViaPlacement>,
}

/// An ordered sequence of vertices and edges discovered by search.
///
/// Edges are undirected, so the vertex order carries the direction. After
/// legalization the path is physically valid: redundant jogs removed,
/// collinear track runs merged, crowded via pairs flattened, and terminal
/// access layers chosen.
#[derive(Clone, Debug)]
pub struct Path {
    vertices: Vec<VertexId>,
    edges: Vec<EdgeId>,
    nets: EquivalentNets,
    start_terminal: Option<Terminal>,
    end_terminal: Option<Terminal>,
    start_access_layers: BTreeSet<Layer>,
    end_access_layers: BTreeSet<Layer>,
    chosen_start_layer: Option<Layer>,
    chosen_end_layer: Option<Layer>,
    skipped_vias: BTreeSet<VertexId>,
    /// Flatten downgrades run through here rather than mutating shared
    /// track edges.
    layer_overrides: HashMap<EdgeId, Layer>,
    legalised: bool,
}

impl Path {
    /// Builds the vertex sequence by walking the edges from `start`.
    pub fn new(start: VertexId, edges: Vec<EdgeId>, graph: &Graph) -> Self {
        let mut vertices = vec![start];
        let mut last = start;
        for &edge_id in &edges {
            let next = graph.edge(edge_id).other_vertex_than(last);
            vertices.push(next);
            last = next;
        }
        Self {
            vertices,
            edges,
            nets: EquivalentNets::new(),
            start_terminal: None,
            end_terminal: None,
            start_access_layers: BTreeSet::new(),
            end_access_layers: BTreeSet::new(),
            chosen_start_layer: None,
            chosen_end_layer: None,
            skipped_vias: BTreeSet::new(),
            layer_overrides: HashMap::new(),
            legalised: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn vertices(&self) -> &[VertexId] {
        &self.vertices
    }

    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn nets(&self) -> &EquivalentNets {
        &self.nets
    }

    pub fn set_nets(&mut self, nets: EquivalentNets) {
        self.nets = nets;
    }

    pub fn legalised(&self) -> bool {
        self.legalised
    }

    pub fn skipped_vias(&self) -> &BTreeSet<VertexId> {
        &self.skipped_vias
    }

    pub fn set_start_terminal(&mut self, terminal: Terminal, access_layer: Option<Layer>) {
        if let Some(layer) = access_layer {
            self.start_access_layers.insert(layer);
        }
        self.start_access_layers.insert(terminal.layer);
        self.start_terminal = Some(terminal);
    }

    pub fn set_end_terminal(&mut self, terminal: Terminal, access_layer: Option<Layer>) {
        if let Some(layer) = access_layer {
            self.end_access_layers.insert(layer);
        }
        self.end_access_layers.insert(terminal.layer);
        self.end_terminal = Some(terminal);
    }

    pub fn add_end_access_layer(&mut self, layer: Layer) {
        self.end_access_layers.insert(layer);
    }

    pub fn chosen_start_layer(&self) -> Option<Layer> {
        self.chosen_start_layer
    }

    pub fn chosen_end_layer(&self) -> Option<Layer> {
        self.chosen_end_layer
    }

    /// The layer an edge is emitted on, honouring flatten downgrades.
    pub fn effective_edge_layer(&self, graph: &Graph, edge: EdgeId) -> Layer {
        self.layer_overrides
            .get(&edge)
            .copied()
            .unwrap_or_else(|| graph.edge(edge).layer())
    }

    /// Total path cost: every edge plus every vertex traversed after the
    /// start.
    pub fn cost(&self, grid: &Grid) -> f64 {
        let graph = grid.graph();
        let edge_cost: f64 = self.edges.iter().map(|&e| graph.edge(e).cost()).sum();
        let vertex_cost: f64 = self.vertices[1..]
            .iter()
            .map(|&v| graph.vertex(v).cost())
            .sum();
        edge_cost + vertex_cost
    }

    pub fn describe(&self, graph: &Graph) -> String {
        if self.is_empty() {
            return "empty path".to_string();
        }
        self.vertices
            .iter()
            .map(|&v| graph.vertex(v).centre().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    // ---------------------------------------------------------------
    // Legalization.
    // ---------------------------------------------------------------

    /// Turns the raw search result into physically valid geometry, in
    /// order: abbreviate jogs, merge collinear track runs, flatten
    /// crowded via pairs, then pick terminal access layers.
    pub fn legalise(&mut self, grid: &mut Grid) {
        if self.legalised {
            return;
        }
        self.abbreviate(grid);
        self.merge_track_runs(grid);
        self.flatten(grid);
        self.resolve_access_layers(grid);
        self.legalised = true;
    }

    /// Two parallel edges joined by a short perpendicular jog waste wire
    /// and a via pair. When legal, the detour is replaced by a bridging
    /// corner vertex, one straight edge extending the first run, and a
    /// short wrong-way connector, all on one layer.
    fn abbreviate(&mut self, grid: &mut Grid) {
        let mut i = 0;
        while self.edges.len() >= 3 && i + 2 < self.edges.len() {
            if !self.try_abbreviate_at(grid, i) {
                i += 1;
            }
        }
    }

    fn try_abbreviate_at(&mut self, grid: &mut Grid, i: usize) -> bool {
        let (e0, e1, e2) = (self.edges[i], self.edges[i + 1], self.edges[i + 2]);
        let (d0, d1, d2) = {
            let graph = grid.graph();
            (
                graph.edge(e0).direction(),
                graph.edge(e1).direction(),
                graph.edge(e2).direction(),
            )
        };
        if d0 != d2 || d1 == d0 {
            return false;
        }
        let l0 = self.effective_edge_layer(grid.graph(), e0);
        let l1 = self.effective_edge_layer(grid.graph(), e1);
        let l2 = self.effective_edge_layer(grid.graph(), e2);
        if l0 != l2 || l1 == l0 {
            return false;
        }

        let v0 = self.vertices[i];
        let v1 = self.vertices[i + 1];
        let v2 = self.vertices[i + 2];
        let v3 = self.vertices[i + 3];
        let (p0, p1, p2, p3) = {
            let graph = grid.graph();
            (
                graph.vertex(v0).centre(),
                graph.vertex(v1).centre(),
                graph.vertex(v2).centre(),
                graph.vertex(v3).centre(),
            )
        };

        // Only jogs whose via pair would violate spacing are worth (and
        // safe) removing.
        if !grid.points_are_too_close_for_vias(l0, p1, l1, p2, l1) {
            return false;
        }

        let corner = match d0 {
            Direction::Horizontal => Point::new(p3.x, p0.y),
            Direction::Vertical => Point::new(p0.x, p3.y),
        };

        // The jog collapses onto one layer; prefer the outer edges' layer
        // and fall back to the jog's own.
        'candidates: for candidate in [l0, l1] {
            // Vias remaining at the detour ends must not crowd each other
            // on the candidate layer.
            let prev_layer = if i > 0 {
                Some(self.effective_edge_layer(grid.graph(), self.edges[i - 1]))
            } else {
                None
            };
            let next_layer = if i + 3 < self.edges.len() {
                Some(self.effective_edge_layer(grid.graph(), self.edges[i + 3]))
            } else {
                None
            };
            if let (Some(prev), Some(next)) = (prev_layer, next_layer) {
                if prev != candidate
                    && next != candidate
                    && grid.points_are_too_close_for_vias(candidate, p0, prev, p3, next)
                {
                    continue 'candidates;
                }
            }

            // Reuse an existing vertex at the corner when one exists.
            let existing = grid
                .geometries()
                .find_map(|geometry| geometry.vertex_at(corner));
            let (bridge, bridge_is_new) = match existing {
                Some(vertex)
                    if grid
                        .graph()
                        .vertex(vertex)
                        .available_for_all(Some(&self.nets), None) =>
                {
                    (vertex, false)
                }
                Some(_) => continue 'candidates,
                None => {
                    let mut vertex = Vertex::new(corner);
                    vertex.set_cost(grid.config().vertex_cost);
                    vertex.add_connected_layer(candidate);
                    let vertex_id = grid.graph_mut().add_vertex(vertex);
                    if grid
                        .valid_against_known_blockages_vertex(
                            vertex_id,
                            Some(&self.nets),
                            None,
                        )
                        .is_err()
                        || grid
                            .valid_against_installed_paths_vertex(
                                vertex_id,
                                Some(&self.nets),
                                None,
                            )
                            .is_err()
                    {
                        grid.graph_mut().delete_vertex(vertex_id);
                        continue 'candidates;
                    }
                    (vertex_id, true)
                }
            };

            let long_edge = grid.graph_mut().create_edge(v0, bridge, candidate);
            let connector = grid.graph_mut().create_edge(bridge, v3, candidate);
            let nets = self.nets.clone();
            if grid
                .valid_against_known_blockages_edge(long_edge, Some(&nets))
                .is_err()
                || grid
                    .valid_against_known_blockages_edge(connector, Some(&nets))
                    .is_err()
            {
                grid.graph_mut().remove_edge_fully(connector);
                grid.graph_mut().remove_edge_fully(long_edge);
                if bridge_is_new {
                    grid.graph_mut().delete_vertex(bridge);
                }
                continue 'candidates;
            }

            grid.add_off_grid_edge(long_edge);
            grid.add_off_grid_edge(connector);
            if bridge_is_new {
                grid.register_off_grid_vertex(bridge);
            }

            log::debug!(
                "abbreviated jog {} -> {} -> {} -> {} via corner {}",
                p0,
                p1,
                p2,
                p3,
                corner
            );
            self.vertices.splice(i + 1..i + 3, [bridge]);
            self.edges.splice(i..i + 3, [long_edge, connector]);
            return true;
        }
        false
    }

    /// Collapses runs of consecutive edges on one track into a single
    /// edge; interior vertices stop implying vias.
    fn merge_track_runs(&mut self, grid: &mut Grid) {
        let mut i = 0;
        while i < self.edges.len() {
            let track = grid.graph().edge(self.edges[i]).track();
            let Some(track_id) = track else {
                i += 1;
                continue;
            };
            let mut j = i;
            while j + 1 < self.edges.len()
                && grid.graph().edge(self.edges[j + 1]).track() == Some(track_id)
            {
                j += 1;
            }
            if j == i {
                i += 1;
                continue;
            }

            let run_start = self.vertices[i];
            let run_end = self.vertices[j + 1];
            let merged = match grid
                .graph()
                .get_track_edge_between(track_id, run_start, run_end)
            {
                Some(edge) => edge,
                None => {
                    // The merged span is legal by construction: the path
                    // already runs through it.
                    let layer = grid.graph().track(track_id).layer();
                    let edge = grid.graph_mut().create_edge(run_start, run_end, layer);
                    grid.graph_mut().edge_mut(edge).set_track(Some(track_id));
                    grid.graph_mut()
                        .track_mut(track_id)
                        .edges_mut()
                        .push(edge);
                    edge
                }
            };

            for &vertex in &self.vertices[i + 1..=j] {
                self.skipped_vias.insert(vertex);
            }
            self.vertices.drain(i + 1..=j);
            self.edges.splice(i..=j, [merged]);
            i += 1;
        }
    }

    /// Removes via pairs that sit closer than the via-to-via minimum by
    /// downgrading the enclosed run onto the surrounding layer. The
    /// forced via-access directions at both ends are re-validated; a
    /// failure is reported as a potential design-rule violation, not
    /// corrected.
    fn flatten(&mut self, grid: &Grid) {
        loop {
            let runs = self.layer_runs(grid.graph());
            let mut changed = false;
            for window in runs.windows(3) {
                let (outer_before, inner, outer_after) = (&window[0], &window[1], &window[2]);
                if outer_before.layer != outer_after.layer {
                    continue;
                }
                let shared = outer_before.layer;
                let entry_vertex = self.vertices[inner.first_edge];
                let exit_vertex = self.vertices[inner.last_edge + 1];
                let entry = grid.graph().vertex(entry_vertex).centre();
                let exit = grid.graph().vertex(exit_vertex).centre();
                if !grid.points_are_too_close_for_vias(
                    shared,
                    entry,
                    inner.layer,
                    exit,
                    inner.layer,
                ) {
                    continue;
                }

                for index in inner.first_edge..=inner.last_edge {
                    self.layer_overrides.insert(self.edges[index], shared);
                }
                self.skipped_vias.insert(entry_vertex);
                self.skipped_vias.insert(exit_vertex);

                for (vertex_id, point) in [(entry_vertex, entry), (exit_vertex, exit)] {
                    let vertex = grid.graph().vertex(vertex_id);
                    if let Some(forced) = vertex.forced_encap_direction(shared) {
                        let through =
                            grid.graph().edge(self.edges[inner.first_edge]).direction();
                        if forced != through {
                            log::warn!(
                                "flattening at {} leaves the {:?} access direction \
                                 unsatisfied on layer {:?}; potential design rule \
                                 violation",
                                point,
                                forced,
                                shared
                            );
                        }
                    }
                }
                changed = true;
                break;
            }
            if !changed {
                break;
            }
        }
    }

    /// Picks, for each terminal, the cheapest reachable layer among its
    /// allowed access layers.
    fn resolve_access_layers(&mut self, grid: &Grid) {
        if let Some(&first_edge) = self.edges.first() {
            let from = self.effective_edge_layer(grid.graph(), first_edge);
            self.chosen_start_layer =
                Self::pick_access_layer(grid, from, &self.start_access_layers);
        }
        if let Some(&last_edge) = self.edges.last() {
            let from = self.effective_edge_layer(grid.graph(), last_edge);
            self.chosen_end_layer =
                Self::pick_access_layer(grid, from, &self.end_access_layers);
        }
    }

    fn pick_access_layer(
        grid: &Grid,
        source_layer: Layer,
        layers: &BTreeSet<Layer>,
    ) -> Option<Layer> {
        layers
            .iter()
            .filter_map(|&layer| {
                grid.via_stack_cost(source_layer, layer)
                    .map(|cost| (layer, cost))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(layer, _)| layer)
    }

    // ---------------------------------------------------------------
    // Geometry emission.
    // ---------------------------------------------------------------

    /// Emits the legalized path as one polyline per contiguous same-layer
    /// run, with via stacks and enclosure bulges at every layer change,
    /// a covering bulge where same-net vias crowd each other, and a
    /// matching bulge against notch-prone perpendicular crossings.
    pub fn to_geometry(&self, grid: &Grid) -> RouteGeometry {
        let graph = grid.graph();
        let mut polylines: Vec<RoutePolyline> = Vec::new();
        let mut vias: Vec<ViaPlacement> = Vec::new();

        let runs = self.layer_runs(graph);
        for run in &runs {
            let mut points = Vec::new();
            for index in run.first_edge..=run.last_edge + 1 {
                let point = graph.vertex(self.vertices[index]).centre();
                if points.last() != Some(&point) {
                    points.push(point);
                }
            }
            let width = grid
                .layer_info(run.layer)
                .map(|info| info.wire_width)
                .unwrap_or(0);
            polylines.push(RoutePolyline {
                layer: run.layer,
                width,
                points,
                bulges: Vec::new(),
            });
        }

        // Vias and bulges between consecutive runs.
        for index in 0..runs.len().saturating_sub(1) {
            let at = graph
                .vertex(self.vertices[runs[index].last_edge + 1])
                .centre();
            let from = runs[index].layer;
            let to = runs[index + 1].layer;
            self.emit_via_stack(grid, at, from, to, &mut vias);
            self.add_via_bulge(grid, at, from, to, &mut polylines[index]);
            self.add_via_bulge(grid, at, to, from, &mut polylines[index + 1]);
        }

        // Terminal access stacks.
        if let (Some(first_run), Some(chosen)) = (runs.first(), self.chosen_start_layer) {
            if chosen != first_run.layer {
                let at = graph.vertex(self.vertices[0]).centre();
                self.emit_via_stack(grid, at, first_run.layer, chosen, &mut vias);
                self.add_via_bulge(grid, at, first_run.layer, chosen, &mut polylines[0]);
            }
        }
        if let (Some(last_run), Some(chosen)) = (runs.last(), self.chosen_end_layer) {
            if chosen != last_run.layer {
                let at = graph
                    .vertex(*self.vertices.last().unwrap())
                    .centre();
                self.emit_via_stack(grid, at, last_run.layer, chosen, &mut vias);
                let last = polylines.len() - 1;
                self.add_via_bulge(grid, at, last_run.layer, chosen, &mut polylines[last]);
            }
        }

        self.cover_crowded_vias(grid, &vias, &mut polylines);
        self.cover_notches(grid, &mut polylines);

        RouteGeometry {
            net: self.nets.primary().to_string(),
            polylines,
            vias,
        }
    }

    /// Exports the path as ordered points with the layer of each hop, for
    /// the request boundary.
    pub fn to_points_and_layers(&self, grid: &Grid) -> Vec<(Point, Layer)> {
        if self.edges.is_empty() {
            return Vec::new();
        }
        let graph = grid.graph();
        let mut out = Vec::new();
        for (index, &vertex) in self.vertices.iter().enumerate() {
            let edge_index = index.min(self.edges.len() - 1);
            let layer = self.effective_edge_layer(graph, self.edges[edge_index]);
            out.push((graph.vertex(vertex).centre(), layer));
        }
        out
    }

    fn emit_via_stack(
        &self,
        grid: &Grid,
        at: Point,
        from: Layer,
        to: Layer,
        vias: &mut Vec<ViaPlacement>,
    ) {
        match grid.find_via_stack(from, to) {
            Some(stack) => {
                for info in stack {
                    vias.push(ViaPlacement {
                        at,
                        bottom: info.bottom,
                        top: info.top,
                    });
                }
            }
            None => {
                log::warn!(
                    "no via stack connects {:?} to {:?} at {}; geometry will be \
                     disconnected",
                    from,
                    to,
                    at
                );
            }
        }
    }

    fn add_via_bulge(
        &self,
        grid: &Grid,
        at: Point,
        on_layer: Layer,
        other_layer: Layer,
        polyline: &mut RoutePolyline,
    ) {
        let Some(info) = grid.via_info(on_layer, other_layer) else {
            // The stack spans multiple hops; use the first hop's rules.
            let Some(stack) = grid.find_via_stack(on_layer, other_layer) else {
                return;
            };
            let Some(first) = stack.first() else {
                return;
            };
            let direction = self.encap_direction_at(grid, at, on_layer);
            polyline.bulges.push(Bulge {
                at,
                length: first.encap_length(on_layer),
                width: first.encap_width(on_layer),
                direction,
            });
            return;
        };
        let direction = self.encap_direction_at(grid, at, on_layer);
        polyline.bulges.push(Bulge {
            at,
            length: info.encap_length(on_layer),
            width: info.encap_width(on_layer),
            direction,
        });
    }

    fn encap_direction_at(&self, grid: &Grid, at: Point, layer: Layer) -> Direction {
        let graph = grid.graph();
        // A forced direction recorded on the vertex wins; otherwise the
        // wire direction through the point.
        for (index, &vertex) in self.vertices.iter().enumerate() {
            if graph.vertex(vertex).centre() != at {
                continue;
            }
            if let Some(direction) = graph.vertex(vertex).forced_encap_direction(layer) {
                return direction;
            }
            let edge_index = index.min(self.edges.len() - 1);
            return graph.edge(self.edges[edge_index]).direction();
        }
        grid.layer_info(layer)
            .map(|info| info.direction)
            .unwrap_or(Direction::Horizontal)
    }

    /// Same-net vias landing too close on one layer get one covering
    /// bulge spanning the whole crowd, instead of several marginal
    /// enclosures. Crowds are collected as runs of successive too-close
    /// via vertices, per layer.
    fn cover_crowded_vias(
        &self,
        grid: &Grid,
        vias: &[ViaPlacement],
        polylines: &mut [RoutePolyline],
    ) {
        let graph = grid.graph();
        let mut collectors = crate::collector::LayeredVertexCollectors::new(
            |_layer, a: VertexId, b: VertexId| grid.vertices_are_too_close_for_vias(a, b),
        );
        for via in vias {
            let Some(&vertex) = self
                .vertices
                .iter()
                .find(|&&v| graph.vertex(v).centre() == via.at)
            else {
                continue;
            };
            for layer in [via.bottom, via.top] {
                collectors.offer(layer, vertex);
                // Installed same-net vias at neighbouring vertices join
                // the crowd.
                for neighbour in graph.vertex(vertex).neighbours() {
                    let other = graph.vertex(neighbour);
                    if !other.installed_in_paths().is_empty()
                        && other.net().is_some_and(|net| self.nets.contains(net))
                    {
                        collectors.offer(layer, neighbour);
                    }
                }
            }
        }

        for (layer, groups) in collectors.groups_by_layer() {
            for group in groups {
                let first = graph.vertex(group[0]).centre();
                let last = graph.vertex(*group.last().unwrap()).centre();
                let span_direction = if first.y == last.y {
                    Direction::Horizontal
                } else {
                    Direction::Vertical
                };
                let span = first.l1_distance_to(last);
                let mid = Point::new((first.x + last.x) / 2, (first.y + last.y) / 2);
                for polyline in polylines.iter_mut() {
                    if polyline.layer != layer {
                        continue;
                    }
                    let Some(other_layer) = graph
                        .vertex(group[0])
                        .connected_layer_other_than(layer)
                    else {
                        continue;
                    };
                    let Some(info) = grid.via_info(layer, other_layer) else {
                        continue;
                    };
                    log::debug!(
                        "covering {} crowded vias between {} and {} on {:?}",
                        group.len(),
                        first,
                        last,
                        layer
                    );
                    polyline.bulges.push(Bulge {
                        at: mid,
                        length: span + info.encap_length(layer),
                        width: info.encap_width(layer),
                        direction: span_direction,
                    });
                }
            }
        }
    }

    /// A perpendicular path crossing on another layer can leave a
    /// sub-minimum-width notch against our via enclosures; matching the
    /// neighbour's bulge closes it.
    fn cover_notches(&self, grid: &Grid, polylines: &mut [RoutePolyline]) {
        let graph = grid.graph();
        for polyline in polylines.iter_mut() {
            let Some(info) = grid.layer_info(polyline.layer) else {
                continue;
            };
            let min_width = info.wire_width;
            let mut extra: Vec<Bulge> = Vec::new();
            for bulge in &polyline.bulges {
                for other in grid.paths() {
                    if std::ptr::eq(other, self) {
                        continue;
                    }
                    for &other_vertex in other.vertices() {
                        let vertex = graph.vertex(other_vertex);
                        if vertex.centre() == bulge.at {
                            continue;
                        }
                        let Some(other_encap) =
                            grid.via_footprint(other_vertex, polyline.layer, 0, None)
                        else {
                            continue;
                        };
                        let own = bulge_rect(bulge);
                        let gap = own.closest_distance_to(&other_encap).ceil() as i64;
                        if gap > 0 && gap < min_width {
                            log::debug!(
                                "notch of {} units against path at {} on {:?}",
                                gap,
                                vertex.centre(),
                                polyline.layer
                            );
                            extra.push(Bulge {
                                at: vertex.centre(),
                                length: bulge.length,
                                width: bulge.width,
                                direction: bulge.direction,
                            });
                        }
                    }
                }
            }
            polyline.bulges.extend(extra);
        }
    }

    /// Contiguous same-layer edge runs, honouring flatten overrides.
    fn layer_runs(&self, graph: &Graph) -> Vec<LayerRun> {
        let mut runs: Vec<LayerRun> = Vec::new();
        for (index, &edge) in self.edges.iter().enumerate() {
            let layer = self.effective_edge_layer(graph, edge);
            match runs.last_mut() {
                Some(run) if run.layer == layer => run.last_edge = index,
                _ => runs.push(LayerRun {
                    layer,
                    first_edge: index,
                    last_edge: index,
                }),
            }
        }
        runs
    }
}

#[derive(Clone, Copy, Debug)]
struct LayerRun {
    layer: Layer,
    first_edge: usize,
    last_edge: usize,
}

fn bulge_rect(bulge: &Bulge) -> gridroute_common::geom::Rect {
    match bulge.direction {
        Direction::Horizontal => {
            gridroute_common::geom::Rect::centred_on(bulge.at, bulge.length, bulge.width)
        }
        Direction::Vertical => {
            gridroute_common::geom::Rect::centred_on(bulge.at, bulge.width, bulge.length)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockage::BlockageCache;
    use crate::nets::EquivalentNets;
    use crate::rules::{LayerInfo, ViaEncap, ViaInfo};
    use gridroute_common::geom::Rect;
    use gridroute_common::util::config::RouterConfig;

    const H: Layer = Layer(0);
    const V: Layer = Layer(1);

    fn layer_info(layer: Layer, direction: Direction) -> LayerInfo {
        LayerInfo {
            layer,
            area: Rect::new(Point::new(0, 0), Point::new(100, 100)),
            wire_width: 2,
            offset: 10,
            direction,
            pitch: 10,
            min_separation: 1,
        }
    }

    fn grid_with_via(via_side: i64, overhang: i64) -> Grid {
        let mut grid = Grid::new(RouterConfig::default());
        grid.add_layer_info(layer_info(H, Direction::Horizontal)).unwrap();
        grid.add_layer_info(layer_info(V, Direction::Vertical)).unwrap();
        let mut via = ViaInfo::new(H, V, via_side, via_side, 1.0);
        let encap = ViaEncap {
            overhang_length: overhang,
            overhang_width: overhang,
        };
        via.set_encap(H, encap);
        via.set_encap(V, encap);
        grid.add_via_info(H, V, via).unwrap();
        grid.connect_layers(H, V).unwrap();
        grid
    }

    fn vertex_at(grid: &Grid, x: i64, y: i64) -> VertexId {
        grid.geometries()
            .next()
            .unwrap()
            .vertex_at(Point::new(x, y))
            .unwrap()
    }

    fn track_edge(grid: &Grid, a: VertexId, b: VertexId) -> EdgeId {
        let track = grid
            .graph()
            .vertex(a)
            .tracks()
            .into_iter()
            .find(|&t| grid.graph().track(t).contains_vertex(b))
            .expect("vertices share no track");
        grid.graph()
            .get_track_edge_between(track, a, b)
            .expect("no track edge between vertices")
    }

    #[test]
    fn merge_collapses_same_track_runs() {
        let mut grid = grid_with_via(2, 1);
        let a = vertex_at(&grid, 10, 10);
        let b = vertex_at(&grid, 20, 10);
        let c = vertex_at(&grid, 30, 10);
        let ab = track_edge(&grid, a, b);
        let bc = track_edge(&grid, b, c);

        let mut path = Path::new(a, vec![ab, bc], grid.graph());
        path.set_nets(EquivalentNets::from_name("n1"));
        path.legalise(&mut grid);

        assert_eq!(path.edges().len(), 1);
        assert_eq!(path.vertices(), &[a, c]);
        assert!(path.skipped_vias().contains(&b));
        let merged = path.edges()[0];
        assert_eq!(grid.graph().edge(merged).layer(), H);
        assert!(grid.graph().edge(merged).track().is_some());
    }

    #[test]
    fn flatten_downgrades_crowded_via_pairs() {
        // Oversized via: two vias ten units apart violate spacing, so the
        // short perpendicular hop collapses onto the outer layer.
        let mut grid = grid_with_via(8, 2);
        let a = vertex_at(&grid, 10, 10);
        let b = vertex_at(&grid, 20, 10);
        let c = vertex_at(&grid, 20, 20);
        let d = vertex_at(&grid, 30, 20);
        let ab = track_edge(&grid, a, b);
        let bc = track_edge(&grid, b, c);
        let cd = track_edge(&grid, c, d);
        assert_eq!(grid.graph().edge(bc).layer(), V);

        let mut path = Path::new(a, vec![ab, bc, cd], grid.graph());
        path.set_nets(EquivalentNets::from_name("n1"));
        path.flatten(&grid);

        assert_eq!(path.effective_edge_layer(grid.graph(), bc), H);
        assert!(path.skipped_vias().contains(&b));
        assert!(path.skipped_vias().contains(&c));
    }

    #[test]
    fn small_vias_are_left_alone() {
        let grid = grid_with_via(2, 1);
        let a = vertex_at(&grid, 10, 10);
        let b = vertex_at(&grid, 20, 10);
        let c = vertex_at(&grid, 20, 20);
        let d = vertex_at(&grid, 30, 20);
        let ab = track_edge(&grid, a, b);
        let bc = track_edge(&grid, b, c);
        let cd = track_edge(&grid, c, d);

        let mut path = Path::new(a, vec![ab, bc, cd], grid.graph());
        path.flatten(&grid);
        assert_eq!(path.effective_edge_layer(grid.graph(), bc), V);
        assert!(path.skipped_vias().is_empty());
    }

    #[test]
    fn geometry_emission_splits_runs_and_places_vias() {
        let mut grid = grid_with_via(2, 1);
        let a = vertex_at(&grid, 10, 10);
        let b = vertex_at(&grid, 30, 10);
        let c = vertex_at(&grid, 30, 40);
        let ab = track_edge(&grid, a, b);
        let bc = track_edge(&grid, b, c);

        let mut path = Path::new(a, vec![ab, bc], grid.graph());
        path.set_nets(EquivalentNets::from_name("n1"));
        path.legalise(&mut grid);
        let geometry = path.to_geometry(&grid);

        assert_eq!(geometry.net, "n1");
        assert_eq!(geometry.polylines.len(), 2);
        assert_eq!(geometry.polylines[0].layer, H);
        assert_eq!(geometry.polylines[1].layer, V);
        assert_eq!(geometry.vias.len(), 1);
        assert_eq!(geometry.vias[0].at, Point::new(30, 10));
        // Each polyline carries an enclosure bulge at the layer change.
        assert!(!geometry.polylines[0].bulges.is_empty());
        assert!(!geometry.polylines[1].bulges.is_empty());
        // Via side 2 + 2x overhang 1 on each axis.
        assert_eq!(geometry.polylines[0].bulges[0].length, 4);
        assert_eq!(geometry.polylines[0].bulges[0].width, 4);
    }

    #[test]
    fn points_and_layers_export_follows_the_path() {
        let mut grid = grid_with_via(2, 1);
        let a = vertex_at(&grid, 10, 10);
        let b = vertex_at(&grid, 30, 10);
        let c = vertex_at(&grid, 30, 40);
        let ab = track_edge(&grid, a, b);
        let bc = track_edge(&grid, b, c);
        let mut path = Path::new(a, vec![ab, bc], grid.graph());
        path.set_nets(EquivalentNets::from_name("n1"));
        path.legalise(&mut grid);

        let export = path.to_points_and_layers(&grid);
        assert_eq!(export.len(), 3);
        assert_eq!(export[0], (Point::new(10, 10), H));
        assert_eq!(export[1], (Point::new(30, 10), V));
        assert_eq!(export[2], (Point::new(30, 40), V));
    }

    #[test]
    fn search_then_legalise_preserves_the_count_invariant() {
        let grid_ref = &mut grid_with_via(2, 1);
        let a = vertex_at(grid_ref, 10, 10);
        let b = vertex_at(grid_ref, 60, 60);
        let nets = EquivalentNets::from_name("n1");
        let path = {
            let cache = BlockageCache::new(grid_ref);
            grid_ref.shortest_path(a, b, &cache, &nets).unwrap()
        };
        let mut path = path;
        path.set_nets(nets);
        path.legalise(grid_ref);
        assert_eq!(path.vertices().len(), path.edges().len() + 1);
    }
}
