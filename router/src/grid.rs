use crate::blockage::{BlockageCache, GridBlockage, Shape, ShapeKind};
use crate::error::{Result, RouterError};
use crate::geometry::GridGeometry;
use crate::graph::{EdgeId, Graph, TrackId, VertexId};
use crate::nets::EquivalentNets;
use crate::path::Path;
use crate::rules::{Direction, LayerInfo, ViaInfo};
use crate::track::{BridgeOutcome, Track};
use crate::vertex::{ALL_COMPASS, Compass, Vertex};
use dashmap::DashMap;
use gridroute_common::geom::index::PointIndex;
use gridroute_common::geom::{Point, Rect};
use gridroute_common::tech::{Layer, ordered_layers};
use gridroute_common::util::config::RouterConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// A connection point requested by a route order: a location on a layer,
/// belonging to a net.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    pub centre: Point,
    pub layer: Layer,
    pub net: String,
}

/// The grid-side result of attaching a terminal: the vertex to search
/// from, the layer the terminal is reached on, and any off-grid
/// vertices/edges created to get there (rolled back if the search fails).
#[derive(Clone, Debug, Default)]
pub struct ConnectedTerminal {
    pub vertex: Option<VertexId>,
    pub layer: Option<Layer>,
    pub created_vertices: Vec<VertexId>,
    pub created_edges: Vec<EdgeId>,
}

/// Handle for a batch of temporary blockages installed around one search.
#[derive(Debug, Default)]
pub struct TemporaryBlockages {
    blocked_vertices: Vec<VertexId>,
    blocked_edges: Vec<EdgeId>,
    track_handles: Vec<(TrackId, u64)>,
    blockage_ids: Vec<u64>,
}

struct StoredBlockage {
    blockage: GridBlockage,
    id: u64,
    temporary: bool,
}

/// The top-level owner of all routing state: tracks, vertices and edges
/// across every connected layer pair, the installed paths, and the
/// permanent blockage list.
///
/// Searches only read the grid (`&Grid` is shared across workers); every
/// mutation of shared availability state funnels through `install_path`
/// and the explicit setup methods, which require `&mut Grid`.
pub struct Grid {
    config: RouterConfig,
    graph: Graph,
    layer_infos: HashMap<Layer, LayerInfo>,
    via_infos: HashMap<(Layer, Layer), ViaInfo>,
    geometries: Vec<GridGeometry>,
    geometry_index_by_layers: HashMap<(Layer, Layer), usize>,
    tracks_by_layer: HashMap<Layer, Vec<TrackId>>,
    paths: Vec<Path>,
    off_grid_edges: BTreeSet<EdgeId>,
    off_grid_vertex_index: PointIndex,
    blockages: Vec<StoredBlockage>,
    via_stack_memo: DashMap<(Layer, Layer), Option<Vec<(Layer, Layer)>>>,
    next_id: u64,
}

impl Grid {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            graph: Graph::new(),
            layer_infos: HashMap::new(),
            via_infos: HashMap::new(),
            geometries: Vec::new(),
            geometry_index_by_layers: HashMap::new(),
            tracks_by_layer: HashMap::new(),
            paths: Vec::new(),
            off_grid_edges: BTreeSet::new(),
            off_grid_vertex_index: PointIndex::new(),
            blockages: Vec::new(),
            via_stack_memo: DashMap::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn geometries(&self) -> impl Iterator<Item = &GridGeometry> {
        self.geometries.iter()
    }

    pub fn tracks_on_layer(&self, layer: Layer) -> Vec<TrackId> {
        self.tracks_by_layer
            .get(&layer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn off_grid_edges(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.off_grid_edges.iter().copied()
    }

    pub(crate) fn add_off_grid_edge(&mut self, edge: EdgeId) {
        self.off_grid_edges.insert(edge);
    }

    pub(crate) fn register_off_grid_vertex(&mut self, vertex: VertexId) {
        let centre = self.graph.vertex(vertex).centre();
        self.off_grid_vertex_index.insert(centre, vertex.index());
    }

    pub fn off_grid_vertices_near(&self, reference: Point, radius: i64) -> Vec<VertexId> {
        self.off_grid_vertex_index
            .find_nearby(reference, radius)
            .into_iter()
            .map(VertexId::new)
            .collect()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---------------------------------------------------------------
    // Setup: layer and via registration.
    // ---------------------------------------------------------------

    pub fn add_layer_info(&mut self, info: LayerInfo) -> Result<()> {
        if self.layer_infos.contains_key(&info.layer) {
            return Err(RouterError::Config(format!(
                "duplicate routing layer info: {:?}",
                info.layer
            )));
        }
        self.layer_infos.insert(info.layer, info);
        Ok(())
    }

    pub fn layer_info(&self, layer: Layer) -> Option<&LayerInfo> {
        self.layer_infos.get(&layer)
    }

    pub fn min_separation(&self, layer: Layer) -> i64 {
        self.layer_infos
            .get(&layer)
            .map(|info| info.min_separation)
            .unwrap_or(0)
    }

    pub fn add_via_info(&mut self, lhs: Layer, rhs: Layer, info: ViaInfo) -> Result<()> {
        let key = ordered_layers(lhs, rhs);
        if self.via_infos.contains_key(&key) {
            return Err(RouterError::Config(format!(
                "routing via info for layers {:?} and {:?} specified twice",
                lhs, rhs
            )));
        }
        self.via_infos.insert(key, info);
        Ok(())
    }

    pub fn via_info(&self, lhs: Layer, rhs: Layer) -> Option<&ViaInfo> {
        self.via_infos.get(&ordered_layers(lhs, rhs))
    }

    // ---------------------------------------------------------------
    // Via stacks over the layer adjacency graph.
    // ---------------------------------------------------------------

    fn layers_reachable_by_via(&self, from: Layer) -> Vec<(Layer, f64)> {
        let mut reachable = Vec::new();
        for (&(a, b), info) in &self.via_infos {
            if a == from {
                reachable.push((b, info.cost));
            } else if b == from {
                reachable.push((a, info.cost));
            }
        }
        reachable
    }

    /// The cheapest sequence of vias connecting two layers, or None when
    /// they cannot be connected. Memoised per ordered layer pair.
    pub fn find_via_stack(&self, lhs: Layer, rhs: Layer) -> Option<Vec<ViaInfo>> {
        if lhs == rhs {
            return Some(Vec::new());
        }
        let key = ordered_layers(lhs, rhs);
        if let Some(memo) = self.via_stack_memo.get(&key) {
            return memo
                .as_ref()
                .map(|pairs| self.via_infos_for_pairs(pairs));
        }
        let pairs = self.compute_via_stack(key.0, key.1);
        let result = pairs.as_ref().map(|p| self.via_infos_for_pairs(p));
        self.via_stack_memo.insert(key, pairs);
        result
    }

    pub fn via_stack_cost(&self, lhs: Layer, rhs: Layer) -> Option<f64> {
        self.find_via_stack(lhs, rhs)
            .map(|stack| stack.iter().map(|info| info.cost).sum())
    }

    fn via_infos_for_pairs(&self, pairs: &[(Layer, Layer)]) -> Vec<ViaInfo> {
        pairs
            .iter()
            .map(|&(a, b)| {
                self.via_info(a, b)
                    .unwrap_or_else(|| {
                        panic!("via stack references missing via info {:?}/{:?}", a, b)
                    })
                    .clone()
            })
            .collect()
    }

    /// Dijkstra over the via connectivity graph.
    fn compute_via_stack(&self, from: Layer, to: Layer) -> Option<Vec<(Layer, Layer)>> {
        let mut cost: HashMap<Layer, f64> = HashMap::new();
        let mut previous: HashMap<Layer, Layer> = HashMap::new();
        let mut seen: BTreeSet<Layer> = BTreeSet::new();
        let get_cost =
            |cost: &HashMap<Layer, f64>, layer: Layer| *cost.get(&layer).unwrap_or(&f64::MAX);

        let mut queue: Vec<Layer> = vec![from];
        cost.insert(from, 0.0);

        while let Some(current) = queue
            .iter()
            .copied()
            .min_by(|a, b| get_cost(&cost, *a).total_cmp(&get_cost(&cost, *b)))
        {
            queue.retain(|&l| l != current);
            if current == to {
                break;
            }
            for (next_layer, via_cost) in self.layers_reachable_by_via(current) {
                let next_cost = get_cost(&cost, current) + via_cost;
                if next_cost < get_cost(&cost, next_layer) {
                    cost.insert(next_layer, next_cost);
                    previous.insert(next_layer, current);
                    if seen.insert(next_layer) {
                        queue.push(next_layer);
                    }
                }
            }
        }

        if !previous.contains_key(&to) {
            return None;
        }
        let mut layer_stack = vec![to];
        let mut cursor = to;
        while let Some(&prev) = previous.get(&cursor) {
            layer_stack.push(prev);
            if prev == from {
                break;
            }
            cursor = prev;
        }
        if *layer_stack.last().unwrap() != from {
            return None;
        }
        layer_stack.reverse();
        Some(
            layer_stack
                .windows(2)
                .map(|pair| (pair[0], pair[1]))
                .collect(),
        )
    }

    // ---------------------------------------------------------------
    // Footprint math.
    // ---------------------------------------------------------------

    /// The metal footprint a via at `centre` would need on
    /// `footprint_layer` to reach `other_layer`, padded on all sides.
    /// Without a direction the worst-case square is returned.
    pub fn via_footprint_at(
        &self,
        centre: Point,
        other_layer: Layer,
        footprint_layer: Layer,
        padding: i64,
        direction: Option<Direction>,
    ) -> Option<Rect> {
        if footprint_layer == other_layer {
            return None;
        }
        let info = self.via_info(footprint_layer, other_layer)?;
        let via_width = info.encap_width(footprint_layer) + 2 * padding;
        let via_length = info.encap_length(footprint_layer) + 2 * padding;
        let rect = match direction {
            None => {
                let side = via_width.max(via_length);
                Rect::centred_on(centre, side, side)
            }
            Some(Direction::Vertical) => Rect::centred_on(centre, via_width, via_length),
            Some(Direction::Horizontal) => Rect::centred_on(centre, via_length, via_width),
        };
        Some(rect)
    }

    /// The via footprint implied by a vertex on `footprint_layer`, if the
    /// vertex actually changes layers there.
    pub fn via_footprint(
        &self,
        vertex: VertexId,
        footprint_layer: Layer,
        padding: i64,
        direction: Option<Direction>,
    ) -> Option<Rect> {
        let vertex = self.graph.vertex(vertex);
        if !vertex.connects_layer(footprint_layer) {
            return None;
        }
        let other = vertex.connected_layer_other_than(footprint_layer)?;
        self.via_footprint_at(vertex.centre(), other, footprint_layer, padding, direction)
    }

    /// The wire footprint of an edge, without the via encaps at its ends.
    pub fn edge_wire_footprint(&self, edge: EdgeId, padding: i64) -> Option<Rect> {
        let (a, b) = self.graph.edge_endpoints(edge);
        let layer = self.graph.edge(edge).layer();
        let width = self.layer_infos.get(&layer)?.wire_width + 2 * padding;
        let half = width / 2;
        let rect = if a.x == b.x {
            Rect::new(
                Point::new(a.x - half, a.y.min(b.y)),
                Point::new(a.x + half, a.y.max(b.y)),
            )
        } else {
            Rect::new(
                Point::new(a.x.min(b.x), a.y - half),
                Point::new(a.x.max(b.x), a.y + half),
            )
        };
        Some(rect)
    }

    pub fn via_would_intersect(
        &self,
        vertex: VertexId,
        shape: &Shape,
        padding: i64,
        access_direction: Option<Direction>,
    ) -> bool {
        match self.via_footprint(vertex, shape.layer, padding, access_direction) {
            Some(footprint) => shape.overlaps_rect(&footprint),
            None => {
                // A vertex that does not change layers still occupies its
                // point on the shape's layer.
                let vertex = self.graph.vertex(vertex);
                vertex.connects_layer(shape.layer) && shape.contains(vertex.centre())
            }
        }
    }

    pub fn wire_would_intersect(&self, edge: EdgeId, shape: &Shape, padding: i64) -> bool {
        if self.graph.edge(edge).layer() != shape.layer {
            return false;
        }
        match self.edge_wire_footprint(edge, padding) {
            Some(footprint) => shape.overlaps_rect(&footprint),
            None => false,
        }
    }

    /// Whether vias at the two points, each connecting `shared_layer` to
    /// its own far layer, would violate spacing on the shared layer.
    pub fn points_are_too_close_for_vias(
        &self,
        shared_layer: Layer,
        lhs: Point,
        lhs_connectee: Layer,
        rhs: Point,
        rhs_connectee: Layer,
    ) -> bool {
        let separation = lhs.l2_distance_to(rhs) as i64;
        let Some(lhs_via) = self.via_info(shared_layer, lhs_connectee) else {
            return false;
        };
        let Some(rhs_via) = self.via_info(shared_layer, rhs_connectee) else {
            return false;
        };
        let Some(info) = self.layer_infos.get(&shared_layer) else {
            return false;
        };
        let required = lhs_via.max_via_side() / 2
            + lhs_via.max_overhang()
            + info.min_separation
            + rhs_via.max_via_side() / 2
            + rhs_via.max_overhang();
        separation < required
    }

    pub fn vertices_are_too_close_for_vias(&self, lhs: VertexId, rhs: VertexId) -> bool {
        let lhs_vertex = self.graph.vertex(lhs);
        let rhs_vertex = self.graph.vertex(rhs);
        let shared: Vec<Layer> = lhs_vertex
            .connected_layers()
            .iter()
            .copied()
            .filter(|l| rhs_vertex.connects_layer(*l))
            .collect();
        if shared.is_empty() {
            return false;
        }

        // On-grid neighbours are spaced by construction; only immediate
        // neighbours conflict.
        if let (Some((li, lj)), Some((ri, rj))) =
            (lhs_vertex.grid_position(), rhs_vertex.grid_position())
        {
            if lhs_vertex.horizontal_track() == rhs_vertex.horizontal_track() && lj == rj {
                return li.abs_diff(ri) == 1;
            }
            if lhs_vertex.vertical_track() == rhs_vertex.vertical_track() && li == ri {
                return lj.abs_diff(rj) == 1;
            }
        }

        for &source_layer in &shared {
            for &lhs_connectee in lhs_vertex.connected_layers() {
                if lhs_connectee == source_layer {
                    continue;
                }
                for &rhs_connectee in rhs_vertex.connected_layers() {
                    if rhs_connectee == source_layer {
                        continue;
                    }
                    if self.points_are_too_close_for_vias(
                        source_layer,
                        lhs_vertex.centre(),
                        lhs_connectee,
                        rhs_vertex.centre(),
                        rhs_connectee,
                    ) {
                        return true;
                    }
                }
            }
        }
        false
    }

    // ---------------------------------------------------------------
    // Validity checks against existing state.
    // ---------------------------------------------------------------

    pub fn valid_against_known_blockages_vertex(
        &self,
        vertex: VertexId,
        for_nets: Option<&EquivalentNets>,
        access_direction: Option<Direction>,
    ) -> Result<()> {
        for stored in &self.blockages {
            if stored
                .blockage
                .blocks_vertex(self, vertex, for_nets, access_direction)
            {
                return Err(RouterError::Unavailable(format!(
                    "blocked by shape {} on {:?}",
                    stored.blockage.shape().bounding_box(),
                    stored.blockage.shape().layer
                )));
            }
        }
        Ok(())
    }

    pub fn valid_against_known_blockages_edge(
        &self,
        edge: EdgeId,
        for_nets: Option<&EquivalentNets>,
    ) -> Result<()> {
        for stored in &self.blockages {
            if stored.blockage.blocks_edge(self, edge, for_nets) {
                return Err(RouterError::Unavailable(format!(
                    "blocked by shape {} on {:?}",
                    stored.blockage.shape().bounding_box(),
                    stored.blockage.shape().layer
                )));
            }
        }
        Ok(())
    }

    /// Proximity check of a footprint against every installed path's
    /// wires and vias on the footprint's layer. Touching same-net shapes
    /// are permitted; same-net shapes violating min separation without
    /// touching are not.
    pub fn valid_against_installed_paths_footprint(
        &self,
        footprint: &Rect,
        footprint_layer: Layer,
        for_nets: Option<&EquivalentNets>,
    ) -> Result<()> {
        let min_separation = self.min_separation(footprint_layer);
        for path in &self.paths {
            for &edge_id in path.edges() {
                if self.graph.edge(edge_id).layer() != footprint_layer {
                    continue;
                }
                let Some(existing) = self.edge_wire_footprint(edge_id, 0) else {
                    continue;
                };
                let distance = existing.closest_distance_to(footprint).ceil() as i64;
                let same_net = for_nets.is_some_and(|nets| {
                    self.graph
                        .edge(edge_id)
                        .effective_net()
                        .is_some_and(|net| nets.contains(net))
                });
                if distance == 0 && same_net {
                    continue;
                }
                if distance < min_separation {
                    return Err(RouterError::Unavailable(format!(
                        "footprint {} is too close to an installed edge",
                        footprint
                    )));
                }
            }
            for &vertex_id in path.vertices() {
                let Some(other_encap) =
                    self.via_footprint(vertex_id, footprint_layer, 0, None)
                else {
                    continue;
                };
                let distance = footprint.closest_distance_to(&other_encap).ceil() as i64;
                let same_net = for_nets.is_some_and(|nets| {
                    self.graph
                        .vertex(vertex_id)
                        .net()
                        .is_some_and(|net| nets.contains(net))
                });
                if distance == 0 && same_net {
                    continue;
                }
                if distance < min_separation {
                    return Err(RouterError::Unavailable(format!(
                        "footprint {} is too close to an installed via at {}",
                        footprint,
                        self.graph.vertex(vertex_id).centre()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn valid_against_installed_paths_vertex(
        &self,
        vertex: VertexId,
        for_nets: Option<&EquivalentNets>,
        access_direction: Option<Direction>,
    ) -> Result<()> {
        let layers: Vec<Layer> = self.graph.vertex(vertex).connected_layers().to_vec();
        for layer in layers {
            let Some(footprint) = self.via_footprint(vertex, layer, 0, access_direction)
            else {
                continue;
            };
            self.valid_against_installed_paths_footprint(&footprint, layer, for_nets)?;
        }
        Ok(())
    }

    pub fn valid_against_installed_paths_edge(
        &self,
        edge: EdgeId,
        for_nets: Option<&EquivalentNets>,
    ) -> Result<()> {
        let Some(footprint) = self.edge_wire_footprint(edge, 0) else {
            return Err(RouterError::Unavailable(
                "could not get footprint of edge to check its validity".to_string(),
            ));
        };
        let layer = self.graph.edge(edge).layer();
        self.valid_against_installed_paths_footprint(&footprint, layer, for_nets)
    }

    /// Access directions in which a via could land at the vertex today.
    pub fn valid_access_directions_for_vertex(
        &self,
        vertex: VertexId,
        for_nets: &EquivalentNets,
    ) -> Vec<Direction> {
        [Direction::Horizontal, Direction::Vertical]
            .into_iter()
            .filter(|&direction| {
                self.valid_against_known_blockages_vertex(
                    vertex,
                    Some(for_nets),
                    Some(direction),
                )
                .is_ok()
                    && self
                        .valid_against_installed_paths_vertex(
                            vertex,
                            Some(for_nets),
                            Some(direction),
                        )
                        .is_ok()
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Grid construction.
    // ---------------------------------------------------------------

    /// Builds the full track/vertex/edge graph between two orthogonal
    /// layers. Exactly one layer must be horizontal and one vertical, a
    /// via rule must connect them, and the pair must not already be
    /// connected.
    pub fn connect_layers(&mut self, first: Layer, second: Layer) -> Result<()> {
        let first_info = self
            .layer_infos
            .get(&first)
            .ok_or_else(|| {
                RouterError::Config(format!("no routing layer info for {:?}", first))
            })?
            .clone();
        let second_info = self
            .layer_infos
            .get(&second)
            .ok_or_else(|| {
                RouterError::Config(format!("no routing layer info for {:?}", second))
            })?
            .clone();

        let (horizontal_info, vertical_info) =
            match (first_info.direction, second_info.direction) {
                (Direction::Horizontal, Direction::Vertical) => (first_info, second_info),
                (Direction::Vertical, Direction::Horizontal) => (second_info, first_info),
                _ => {
                    return Err(RouterError::Config(format!(
                        "exactly one of layers {:?}, {:?} must be horizontal and one \
                         vertical",
                        first, second
                    )));
                }
            };

        let via_info = self
            .via_info(first, second)
            .ok_or_else(|| {
                RouterError::Config(format!(
                    "no routing via info for {:?}, {:?}",
                    first, second
                ))
            })?
            .clone();

        let key = ordered_layers(first, second);
        if self.geometry_index_by_layers.contains_key(&key) {
            return Err(RouterError::Config(format!(
                "layers {:?} and {:?} are already connected",
                first, second
            )));
        }

        log::info!(
            "drawing grid between layers {:?}, {:?}",
            horizontal_info.layer,
            vertical_info.layer
        );

        let mut geometry = GridGeometry::compute_for_layers(&horizontal_info, &vertical_info)?;

        let mut vertical_tracks: Vec<TrackId> = Vec::new();
        let mut x = geometry.x_start();
        while x <= geometry.x_max() {
            let track = Track::new(
                vertical_info.layer,
                Direction::Vertical,
                geometry.x_pitch(),
                vertical_info.wire_width,
                via_info.encap_width(vertical_info.layer),
                via_info.encap_length(vertical_info.layer),
                vertical_info.min_separation,
                x,
            );
            let track_id = self.graph.add_track(track);
            vertical_tracks.push(track_id);
            geometry.push_vertical_track(track_id);
            self.tracks_by_layer
                .entry(vertical_info.layer)
                .or_default()
                .push(track_id);
            x += geometry.x_pitch();
        }

        let mut horizontal_tracks: Vec<TrackId> = Vec::new();
        let mut y = geometry.y_start();
        while y <= geometry.y_max() {
            let track = Track::new(
                horizontal_info.layer,
                Direction::Horizontal,
                geometry.y_pitch(),
                horizontal_info.wire_width,
                via_info.encap_width(horizontal_info.layer),
                via_info.encap_length(horizontal_info.layer),
                horizontal_info.min_separation,
                y,
            );
            let track_id = self.graph.add_track(track);
            horizontal_tracks.push(track_id);
            geometry.push_horizontal_track(track_id);
            self.tracks_by_layer
                .entry(horizontal_info.layer)
                .or_default()
                .push(track_id);
            y += geometry.y_pitch();
        }

        let columns = vertical_tracks.len();
        let rows = horizontal_tracks.len();
        let mut vertex_table: Vec<Vec<VertexId>> = vec![Vec::with_capacity(rows); columns];

        let mut num_vertices = 0usize;
        for (i, &vertical_track) in vertical_tracks.iter().enumerate() {
            for (j, &horizontal_track) in horizontal_tracks.iter().enumerate() {
                let centre = geometry.point_at(i as i64, j as i64);
                let mut vertex = Vertex::new(centre);
                vertex.set_cost(self.config.vertex_cost);
                vertex.add_connected_layer(first);
                vertex.add_connected_layer(second);
                vertex.set_grid_position(i, j);
                let vertex_id = self.graph.add_vertex(vertex);

                self.graph.track_add_vertex(horizontal_track, vertex_id, None);
                self.graph.track_add_vertex(vertical_track, vertex_id, None);
                geometry.assign_vertex_at(i as i64, j as i64, vertex_id);
                vertex_table[i].push(vertex_id);
                num_vertices += 1;

                // Reciprocal neighbour links; up to all 8 per iteration.
                if i > 0 {
                    let left = vertex_table[i - 1][j];
                    self.graph.vertex_mut(vertex_id).add_neighbour(Compass::Left, left);
                    self.graph.vertex_mut(left).add_neighbour(Compass::Right, vertex_id);
                    if j > 0 {
                        let lower_left = vertex_table[i - 1][j - 1];
                        self.graph
                            .vertex_mut(vertex_id)
                            .add_neighbour(Compass::LowerLeft, lower_left);
                        self.graph
                            .vertex_mut(lower_left)
                            .add_neighbour(Compass::UpperRight, vertex_id);
                    }
                    if j + 1 < vertex_table[i - 1].len() {
                        let upper_left = vertex_table[i - 1][j + 1];
                        self.graph
                            .vertex_mut(vertex_id)
                            .add_neighbour(Compass::UpperLeft, upper_left);
                        self.graph
                            .vertex_mut(upper_left)
                            .add_neighbour(Compass::LowerRight, vertex_id);
                    }
                }
                if j > 0 {
                    let lower = vertex_table[i][j - 1];
                    self.graph.vertex_mut(vertex_id).add_neighbour(Compass::Lower, lower);
                    self.graph.vertex_mut(lower).add_neighbour(Compass::Upper, vertex_id);
                }
            }
        }

        let index = self.geometries.len();
        self.geometries.push(geometry);
        self.geometry_index_by_layers.insert(key, index);

        let num_edges: usize = self
            .graph
            .track_ids()
            .map(|t| self.graph.track(t).edges().len())
            .sum();
        log::info!(
            "connected layers {:?} and {:?}; generated {} horizontal and {} vertical \
             tracks, {} vertices and {} edges",
            first,
            second,
            horizontal_tracks.len(),
            vertical_tracks.len(),
            num_vertices,
            num_edges
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // Shortest-path search.
    // ---------------------------------------------------------------

    /// Dijkstra between two vertices through the given blockage-cache
    /// view. An unreachable target is an ordinary NotFound outcome.
    pub fn shortest_path(
        &self,
        begin: VertexId,
        end: VertexId,
        cache: &BlockageCache,
        nets: &EquivalentNets,
    ) -> Result<Path> {
        let (path, _) = self.shortest_path_generic(
            begin,
            |v| v == end,
            |v| cache.available_for_nets_on_any_layer(v, nets),
            |e| cache.available_for_all_edge(e, nets),
            true,
        )?;
        Ok(path)
    }

    /// Multi-target Dijkstra: any vertex already labeled with one of
    /// `target_nets` terminates the search; the lowest-cost target wins.
    /// Targets do not need to be usable themselves.
    pub fn shortest_path_to_net(
        &self,
        begin: VertexId,
        target_nets: &EquivalentNets,
        usable_nets: &EquivalentNets,
        cache: &BlockageCache,
    ) -> Result<Path> {
        let mut all_nets = usable_nets.clone();
        all_nets.merge(target_nets);
        let graph = self.graph();
        let (path, end) = self.shortest_path_generic(
            begin,
            |v| {
                let vertex = graph.vertex(v);
                let on_net = vertex
                    .net()
                    .is_some_and(|net| target_nets.contains(net));
                if !on_net {
                    return false;
                }
                // A via landed here must not collide with foreign vias at
                // neighbouring vertices.
                for neighbour_id in vertex.neighbours() {
                    let neighbour = graph.vertex(neighbour_id);
                    if !neighbour.available()
                        && !neighbour.installed_in_paths().is_empty()
                        && !neighbour.net().is_some_and(|net| all_nets.contains(net))
                    {
                        return false;
                    }
                }
                true
            },
            |v| cache.available_for_nets_on_any_layer(v, &all_nets),
            |e| cache.available_for_all_edge(e, &all_nets),
            false,
        )?;
        log::debug!(
            "path to net {} terminates at {}",
            target_nets.primary(),
            graph.vertex(end).centre()
        );
        Ok(path)
    }

    fn shortest_path_generic<F, G, H>(
        &self,
        begin: VertexId,
        is_target: F,
        usable_vertex: G,
        usable_edge: H,
        target_must_be_usable: bool,
    ) -> Result<(Path, VertexId)>
    where
        F: Fn(VertexId) -> bool,
        G: Fn(VertexId) -> bool,
        H: Fn(EdgeId) -> bool,
    {
        #[derive(PartialEq)]
        struct SearchState {
            cost: f64,
            seq: u64,
            vertex: VertexId,
        }
        impl Eq for SearchState {}
        impl Ord for SearchState {
            fn cmp(&self, other: &Self) -> Ordering {
                // Min-heap on cost; ties broken by insertion order.
                other
                    .cost
                    .total_cmp(&self.cost)
                    .then(other.seq.cmp(&self.seq))
            }
        }
        impl PartialOrd for SearchState {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        if !usable_vertex(begin) {
            return Err(RouterError::NotFound(
                "start vertex for path is not available".to_string(),
            ));
        }

        let slots = self.graph.num_vertex_slots();
        let mut cost = vec![f64::INFINITY; slots];
        let mut prev: Vec<Option<(VertexId, EdgeId)>> = vec![None; slots];
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;
        let mut found_targets: Vec<VertexId> = Vec::new();

        cost[begin.index()] = 0.0;
        heap.push(SearchState {
            cost: 0.0,
            seq,
            vertex: begin,
        });

        while let Some(SearchState {
            cost: current_cost,
            vertex: current,
            ..
        }) = heap.pop()
        {
            if current_cost > cost[current.index()] {
                continue;
            }

            if target_must_be_usable {
                if !usable_vertex(current) && current != begin {
                    continue;
                }
                if is_target(current) && current != begin {
                    found_targets.push(current);
                    continue;
                }
            } else {
                if is_target(current) && current != begin {
                    found_targets.push(current);
                    continue;
                }
                if !usable_vertex(current) && current != begin {
                    continue;
                }
            }

            let edges: Vec<EdgeId> = self.graph.vertex(current).edges().to_vec();
            for edge_id in edges {
                if !usable_edge(edge_id) {
                    continue;
                }
                let edge = self.graph.edge(edge_id);
                let next = edge.other_vertex_than(current);
                let next_cost =
                    cost[current.index()] + edge.cost() + self.graph.vertex(next).cost();
                assert!(next_cost.is_finite(), "search cost overflow");
                if next_cost < cost[next.index()] {
                    cost[next.index()] = next_cost;
                    prev[next.index()] = Some((current, edge_id));
                    seq += 1;
                    heap.push(SearchState {
                        cost: next_cost,
                        seq,
                        vertex: next,
                    });
                }
            }
        }

        if found_targets.is_empty() {
            return Err(RouterError::NotFound("no usable targets found".to_string()));
        }

        // Lowest final cost wins; ties resolved by position for
        // determinism.
        found_targets.sort_by(|&a, &b| {
            cost[a.index()]
                .total_cmp(&cost[b.index()])
                .then_with(|| {
                    Point::compare_x_then_y(
                        self.graph.vertex(a).centre(),
                        self.graph.vertex(b).centre(),
                    )
                })
        });
        let end = found_targets[0];

        let mut edges_reversed = Vec::new();
        let mut cursor = end;
        while cursor != begin {
            let (previous, edge) = prev[cursor.index()]
                .unwrap_or_else(|| panic!("search back-track lost its way at {:?}", cursor));
            edges_reversed.push(edge);
            cursor = previous;
        }
        if edges_reversed.is_empty() {
            return Err(RouterError::NotFound(
                "search terminated on its own start".to_string(),
            ));
        }
        edges_reversed.reverse();
        Ok((Path::new(begin, edges_reversed, &self.graph), end))
    }

    // ---------------------------------------------------------------
    // Path installation.
    // ---------------------------------------------------------------

    /// Legalizes and permanently installs a discovered path: every edge
    /// and vertex it uses becomes unavailable to other nets, and
    /// neighbouring vertices that could no longer host a via are
    /// disabled.
    pub fn install_path(&mut self, mut path: Path) -> Result<usize> {
        if path.is_empty() {
            return Err(RouterError::NotFound("cannot install an empty path".to_string()));
        }
        let net = path.nets().primary().to_string();
        log::info!("installing path for net \"{}\": {}", net, path.describe(&self.graph));

        path.legalise(self);

        assert!(
            path.vertices().len() == path.edges().len() + 1,
            "path vertices and edges mismatched: {} edges, {} vertices",
            path.edges().len(),
            path.vertices().len()
        );

        let path_index = self.paths.len();

        for &edge_id in path.edges() {
            let track = self.graph.edge(edge_id).track();
            match track {
                Some(track_id) => {
                    self.graph.track_mark_edge_used(track_id, edge_id, &net);
                }
                None => {
                    self.graph
                        .edge_mut(edge_id)
                        .set_net(Some(net.clone()), false);
                    // Off-grid edges can obstruct tracks they cross.
                    if let Some(footprint) = self.edge_wire_footprint(edge_id, 0) {
                        let layer = self.graph.edge(edge_id).layer();
                        let shape = Shape::rect(footprint, layer).with_net(&net);
                        self.add_blockage(shape, 0);
                    }
                }
            }

            let spanned: Vec<VertexId> = match track {
                Some(track_id) => {
                    let (a, b) = self.graph.edge_endpoints(edge_id);
                    self.graph.track(track_id).vertices_in_span(a, b)
                }
                None => {
                    let edge = self.graph.edge(edge_id);
                    vec![edge.first(), edge.second()]
                }
            };
            for vertex_id in spanned {
                self.graph
                    .vertex_mut(vertex_id)
                    .record_installed_path(path_index, edge_id);
            }
        }

        for &vertex_id in path.vertices() {
            self.graph.vertex_mut(vertex_id).add_using_net(&net, false, None);
        }
        let vertices: Vec<VertexId> = path.vertices().to_vec();
        for vertex_id in vertices {
            self.install_vertex_in_path(vertex_id, &net, &path);
        }

        self.paths.push(path);
        Ok(path_index)
    }

    /// Disables neighbouring vertices now that this one is in use: a via
    /// may be placed at its centre, so nothing nearby can host one.
    fn install_vertex_in_path(&mut self, vertex_id: VertexId, net: &str, path: &Path) {
        let vertex = self.graph.vertex(vertex_id);
        if vertex.horizontal_track().is_some() && vertex.vertical_track().is_some() {
            // On-grid: the recorded 8 neighbours are exactly the
            // endangered ones.
            let mut neighbours = Vec::new();
            for position in ALL_COMPASS {
                neighbours.extend(self.graph.vertex(vertex_id).neighbours_in(position));
            }
            for neighbour_id in neighbours {
                let (available, usable_by_other_net) = {
                    let neighbour = self.graph.vertex(neighbour_id);
                    (
                        neighbour.available(),
                        neighbour
                            .blocked_by_single_nearby_net(None)
                            .is_some_and(|other| other != net),
                    )
                };
                // Newly endangered neighbours become reachable only by this
                // net; a neighbour held for a different net turns ambiguous
                // and is disabled for everyone.
                if available || usable_by_other_net {
                    self.graph
                        .vertex_mut(neighbour_id)
                        .add_blocking_net(net, false, None);
                }
            }
            return;
        }

        // Off-grid: gather the enveloping windows and check distances
        // explicitly.
        let centre = self.graph.vertex(vertex_id).centre();
        let connected: Vec<Layer> = self.graph.vertex(vertex_id).connected_layers().to_vec();
        let mut inner: BTreeSet<VertexId> = BTreeSet::new();
        let mut outer_window: BTreeSet<VertexId> = BTreeSet::new();
        for geometry in &self.geometries {
            if !connected.iter().any(|&l| geometry.uses_layer(l)) {
                continue;
            }
            let inner_window = geometry.enveloping_vertex_indices_for_point(centre, 0, 1);
            inner.extend(geometry.vertices_in_window(&inner_window));
            let wide = geometry.enveloping_vertex_indices_for_point(centre, 0, 2);
            outer_window.extend(geometry.vertices_in_window(&wide));
        }
        let outer: Vec<VertexId> = outer_window.difference(&inner).copied().collect();

        let mut blocked_tracks: BTreeSet<TrackId> = BTreeSet::new();
        for &inner_id in &inner {
            self.graph
                .vertex_mut(inner_id)
                .add_blocking_net(net, false, None);
            blocked_tracks.extend(self.graph.vertex(inner_id).tracks());
        }
        for own_track in self.graph.vertex(vertex_id).tracks() {
            blocked_tracks.remove(&own_track);
        }

        for layer in connected {
            // Prefer the direction of the path's own edge on this layer.
            let direction = path
                .edges()
                .iter()
                .find(|&&e| {
                    let edge = self.graph.edge(e);
                    (edge.first() == vertex_id || edge.second() == vertex_id)
                        && edge.layer() == layer
                })
                .map(|&e| self.graph.edge(e).direction())
                .or_else(|| self.layer_infos.get(&layer).map(|info| info.direction));
            let Some(direction) = direction else {
                continue;
            };
            let Some(via_encap) = self.via_footprint(vertex_id, layer, 0, Some(direction))
            else {
                continue;
            };
            for &track_id in &blocked_tracks {
                if self.graph.track(track_id).layer() != layer {
                    continue;
                }
                self.graph
                    .track_add_rect_blockage(track_id, &via_encap, 0, Some(net));
            }

            let min_separation = self.min_separation(layer);
            for &outer_id in &outer {
                let Some(outer_encap) = self.via_footprint(outer_id, layer, 0, None) else {
                    continue;
                };
                let distance = via_encap.closest_distance_to(&outer_encap).ceil() as i64;
                if distance < min_separation {
                    self.graph
                        .vertex_mut(outer_id)
                        .add_blocking_net(net, false, None);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Blockages.
    // ---------------------------------------------------------------

    /// Installs a permanent blockage: the shape plus its padding and the
    /// layer's min separation deny vias and wires near it. Netted shapes
    /// additionally grow off-grid connection vertices where tracks cross
    /// them, so later routes can land on the net.
    pub fn add_blockage(&mut self, shape: Shape, padding: i64) {
        let mut ticket = TemporaryBlockages::default();
        self.add_blockage_internal(shape, padding, false, &mut ticket);
    }

    /// Installs temporary blockages for the avoid-set of one search.
    pub fn set_up_temporary_blockages(&mut self, avoid: &[Shape]) -> TemporaryBlockages {
        let mut ticket = TemporaryBlockages::default();
        for shape in avoid {
            let shape = match &shape.kind {
                ShapeKind::Rect(_) => shape.clone(),
                ShapeKind::Polygon(polygon) => {
                    // Tracks do not support temporary polygon blockages;
                    // the bounding box is a safe over-approximation.
                    log::debug!(
                        "temporary polygon blockage approximated by bounding box {}",
                        polygon.bounding_box()
                    );
                    let mut rect_shape =
                        Shape::rect(polygon.bounding_box(), shape.layer);
                    rect_shape.net = shape.net.clone();
                    rect_shape
                }
            };
            self.add_blockage_internal(shape, 0, true, &mut ticket);
        }
        log::debug!(
            "avoiding {} vertices and {} edges",
            ticket.blocked_vertices.len(),
            ticket.blocked_edges.len()
        );
        ticket
    }

    pub fn tear_down_temporary_blockages(&mut self, ticket: TemporaryBlockages) {
        for vertex_id in ticket.blocked_vertices {
            self.graph.vertex_mut(vertex_id).reset_temporary_status();
        }
        for edge_id in ticket.blocked_edges {
            self.graph.edge_mut(edge_id).reset_temporary_status();
        }
        for (track_id, handle) in ticket.track_handles {
            self.graph.track_mut(track_id).remove_temporary_blockage(handle);
        }
        self.blockages
            .retain(|stored| !(stored.temporary && ticket.blockage_ids.contains(&stored.id)));
    }

    fn add_blockage_internal(
        &mut self,
        shape: Shape,
        padding: i64,
        temporary: bool,
        ticket: &mut TemporaryBlockages,
    ) {
        let layer = shape.layer;
        let min_separation = self.min_separation(layer);
        let effective_padding = padding + min_separation;
        let id = self.next_id();
        let blockage = GridBlockage::new(shape.clone(), effective_padding);

        // Fold the shape into every track on its layer.
        let tracks = self.tracks_on_layer(layer);
        for track_id in tracks {
            match (&shape.kind, temporary) {
                (ShapeKind::Rect(rect), false) => {
                    self.graph
                        .track_add_rect_blockage(track_id, rect, padding, shape.net());
                }
                (ShapeKind::Rect(rect), true) => {
                    let mut blocked_vertices = Vec::new();
                    let mut blocked_edges = Vec::new();
                    if self.graph.track_add_temporary_rect_blockage(
                        track_id,
                        rect,
                        padding,
                        shape.net(),
                        id,
                        &mut blocked_vertices,
                        &mut blocked_edges,
                    ) {
                        ticket.track_handles.push((track_id, id));
                    }
                    ticket.blocked_vertices.extend(blocked_vertices);
                    ticket.blocked_edges.extend(blocked_edges);
                }
                (ShapeKind::Polygon(polygon), false) => {
                    self.graph
                        .track_add_polygon_blockage(track_id, polygon, padding, shape.net());
                }
                (ShapeKind::Polygon(_), true) => {
                    // Converted to a bounding box by the caller.
                }
            }
        }

        self.apply_blockage_to_vertices(&blockage, temporary, ticket);

        if !temporary && shape.net().is_some() {
            self.add_off_grid_vertices_for_blockage(&blockage);
        }

        self.blockages.push(StoredBlockage {
            blockage,
            id,
            temporary,
        });
        if temporary {
            ticket.blockage_ids.push(id);
        }
    }

    /// Vertex-level effect of a blockage: vertices inside the shape join
    /// the shape's net (or become dead for netless shapes); vertices that
    /// cannot host a via in any direction are blocked; a single surviving
    /// direction is pinned as the forced via-encap direction.
    fn apply_blockage_to_vertices(
        &mut self,
        blockage: &GridBlockage,
        temporary: bool,
        ticket: &mut TemporaryBlockages,
    ) {
        let layer = blockage.shape().layer;
        let bbox = blockage.shape().bounding_box();
        let window_padding = blockage.padding() + self.config.blockage_search_margin;

        let mut candidates: Vec<VertexId> = Vec::new();
        for geometry in &self.geometries {
            if !geometry.uses_layer(layer) {
                continue;
            }
            let window =
                geometry.enveloping_vertex_indices_for_rect(&bbox, window_padding, 1);
            candidates.extend(geometry.vertices_in_window(&window));
        }
        let radius = bbox.width().max(bbox.height()) + window_padding;
        candidates.extend(self.off_grid_vertices_near(bbox.centre(), radius));
        candidates.sort_unstable();
        candidates.dedup();

        let net = blockage.shape().net().map(|n| n.to_string());
        for vertex_id in candidates {
            if !self.graph.vertex(vertex_id).available() {
                continue;
            }
            let centre = self.graph.vertex(vertex_id).centre();
            let intersects = blockage.intersects_point(centre);
            let mut open_directions = Vec::new();
            for direction in [Direction::Horizontal, Direction::Vertical] {
                if !blockage.blocks_vertex(self, vertex_id, None, Some(direction)) {
                    open_directions.push(direction);
                }
            }

            if intersects {
                match &net {
                    Some(net) => {
                        self.graph
                            .vertex_mut(vertex_id)
                            .add_using_net(net, temporary, Some(layer));
                    }
                    None => {
                        self.graph
                            .vertex_mut(vertex_id)
                            .set_forced_blocked(true, temporary, Some(layer));
                    }
                }
                ticket.blocked_vertices.push(vertex_id);
            } else if open_directions.is_empty() {
                match &net {
                    Some(net) => {
                        self.graph
                            .vertex_mut(vertex_id)
                            .add_blocking_net(net, temporary, Some(layer));
                    }
                    None => {
                        self.graph
                            .vertex_mut(vertex_id)
                            .set_forced_blocked(true, temporary, Some(layer));
                    }
                }
                ticket.blocked_vertices.push(vertex_id);
            } else if open_directions.len() == 1 {
                self.graph
                    .vertex_mut(vertex_id)
                    .set_forced_encap_direction(layer, open_directions[0]);
            }
        }
    }

    /// Creates unavailable, net-labeled vertices where tracks cross a
    /// netted blockage shape, so the net remains reachable.
    fn add_off_grid_vertices_for_blockage(&mut self, blockage: &GridBlockage) {
        let layer = blockage.shape().layer;
        let net = match blockage.shape().net() {
            Some(net) => net.to_string(),
            None => return,
        };
        let polygon = blockage.shape().as_polygon();

        let mut placements: Vec<(TrackId, Layer, Vec<Point>)> = Vec::new();
        for geometry in &self.geometries {
            if !geometry.uses_layer(layer) {
                continue;
            }
            for (track_id, points) in
                geometry.candidate_vertex_positions_on_crossed_tracks(&polygon)
            {
                let track_layer = self.graph.track(track_id).layer();
                let other_layer = if track_layer == geometry.horizontal_layer() {
                    geometry.vertical_layer()
                } else {
                    geometry.horizontal_layer()
                };
                placements.push((track_id, other_layer, points));
            }
        }

        let net_exceptions = EquivalentNets::from_name(&net);
        for (track_id, other_layer, points) in placements {
            for point in points {
                let Some(vertex_id) = self.create_new_vertex_on_track(
                    track_id,
                    point,
                    other_layer,
                    Some(&net_exceptions),
                ) else {
                    continue;
                };
                {
                    let vertex = self.graph.vertex_mut(vertex_id);
                    vertex.add_using_net(&net, false, None);
                    vertex.set_explicit_net_layer(Some(layer));
                }
                self.off_grid_vertex_index.insert(point, vertex_id.index());
            }
        }
    }

    /// Creates and validates a vertex at an arbitrary point on a track.
    fn create_new_vertex_on_track(
        &mut self,
        track_id: TrackId,
        point: Point,
        other_layer: Layer,
        for_nets: Option<&EquivalentNets>,
    ) -> Option<VertexId> {
        if !self.graph.track(track_id).is_point_on_track(point) {
            return None;
        }
        if self.graph.track(track_id).get_vertex_at(point).is_some() {
            return None;
        }
        let track_layer = self.graph.track(track_id).layer();
        let mut vertex = Vertex::new(point);
        vertex.set_cost(self.config.vertex_cost);
        vertex.add_connected_layer(track_layer);
        if other_layer != track_layer {
            vertex.add_connected_layer(other_layer);
        }
        let vertex_id = self.graph.add_vertex(vertex);
        if self
            .valid_against_installed_paths_vertex(vertex_id, for_nets, None)
            .is_err()
        {
            self.graph.delete_vertex(vertex_id);
            return None;
        }
        if !self.graph.track_add_vertex(track_id, vertex_id, for_nets) {
            self.graph.track_remove_vertex(track_id, vertex_id);
            self.graph.delete_vertex(vertex_id);
            return None;
        }
        Some(vertex_id)
    }

    // ---------------------------------------------------------------
    // Terminal connection and off-grid bridging.
    // ---------------------------------------------------------------

    /// Bridges a point onto the nearest point of a track, with the
    /// intention of connecting it to `target`.
    pub fn create_nearest_vertex_and_connect(
        &mut self,
        track_id: TrackId,
        target: VertexId,
        target_layer: Layer,
        for_nets: &EquivalentNets,
    ) -> BridgeOutcome {
        let target_point = self.graph.vertex(target).centre();
        let candidate_centre = {
            let track = self.graph.track(track_id);
            match track.direction() {
                Direction::Horizontal => Point::new(target_point.x, track.offset()),
                Direction::Vertical => Point::new(track.offset(), target_point.y),
            }
        };

        if self
            .graph
            .track(track_id)
            .is_vertex_blocked(candidate_centre, 0, Some(for_nets))
        {
            return BridgeOutcome::Failed;
        }

        let candidate_position = self
            .graph
            .track(track_id)
            .project_onto_track(candidate_centre);
        let existing = self
            .graph
            .track(track_id)
            .get_vertex_at_offset(candidate_position);

        if candidate_centre == target_point {
            if let Some(existing) = existing {
                return BridgeOutcome::TargetExists(existing);
            }
            if !self.graph.track_add_vertex(track_id, target, Some(for_nets)) {
                self.graph.track_remove_vertex(track_id, target);
                return BridgeOutcome::Failed;
            }
            return BridgeOutcome::TargetOnTrack;
        }

        if let Some(existing) = existing {
            return BridgeOutcome::Existing(existing);
        }

        // A new bridging vertex must fit in with installed paths before it
        // joins the track.
        let track_layer = self.graph.track(track_id).layer();
        let mut vertex = Vertex::new(candidate_centre);
        vertex.set_cost(self.config.vertex_cost);
        vertex.add_connected_layer(track_layer);
        if target_layer != track_layer {
            vertex.add_connected_layer(target_layer);
        }
        let bridging = self.graph.add_vertex(vertex);
        if self
            .valid_against_installed_paths_vertex(bridging, Some(for_nets), None)
            .is_err()
        {
            log::warn!(
                "new vertex at {} is not valid against other installed paths",
                candidate_centre
            );
            self.graph.delete_vertex(bridging);
            return BridgeOutcome::Failed;
        }
        if !self.graph.track_add_vertex(track_id, bridging, Some(for_nets)) {
            self.graph.track_remove_vertex(track_id, bridging);
            self.graph.delete_vertex(bridging);
            return BridgeOutcome::Failed;
        }
        BridgeOutcome::New(bridging)
    }

    /// Attaches a terminal to the grid: either an existing on-grid vertex
    /// at its position, or a new off-grid vertex bridged to the
    /// surrounding tracks. Created entities are reported for rollback.
    pub fn connect_terminal(
        &mut self,
        terminal: &Terminal,
        for_nets: &EquivalentNets,
    ) -> Result<ConnectedTerminal> {
        struct AccessOption {
            geometry_index: usize,
            access_layer: Layer,
            total_via_cost: f64,
        }

        let mut options: Vec<AccessOption> = Vec::new();
        for (index, geometry) in self.geometries.iter().enumerate() {
            for access_layer in [geometry.horizontal_layer(), geometry.vertical_layer()] {
                let Some(cost) = self.via_stack_cost(terminal.layer, access_layer) else {
                    continue;
                };
                options.push(AccessOption {
                    geometry_index: index,
                    access_layer,
                    total_via_cost: cost,
                });
            }
        }
        options.sort_by(|a, b| a.total_via_cost.total_cmp(&b.total_via_cost));

        if options.is_empty() {
            return Err(RouterError::NotFound(format!(
                "no grid is reachable from layer {:?}",
                terminal.layer
            )));
        }

        for option in options {
            let geometry = &self.geometries[option.geometry_index];
            if let Some(existing) = geometry.vertex_at(terminal.centre) {
                log::debug!(
                    "terminal at {} lands on existing vertex {:?}",
                    terminal.centre,
                    existing
                );
                return Ok(ConnectedTerminal {
                    vertex: Some(existing),
                    layer: Some(terminal.layer),
                    created_vertices: Vec::new(),
                    created_edges: Vec::new(),
                });
            }

            let mut off_grid = Vertex::new(terminal.centre);
            off_grid.set_cost(self.config.vertex_cost);
            off_grid.add_connected_layer(terminal.layer);
            if option.access_layer != terminal.layer {
                off_grid.add_connected_layer(option.access_layer);
            }
            let off_grid_id = self.graph.add_vertex(off_grid);

            let access_directions =
                self.valid_access_directions_for_vertex(off_grid_id, for_nets);
            if access_directions.is_empty() {
                log::debug!("invalid off-grid candidate at {}", terminal.centre);
                self.graph.delete_vertex(off_grid_id);
                continue;
            }

            let mut connected = ConnectedTerminal {
                vertex: Some(off_grid_id),
                layer: Some(terminal.layer),
                created_vertices: vec![off_grid_id],
                created_edges: Vec::new(),
            };
            match self.connect_to_surrounding_tracks(
                option.geometry_index,
                option.access_layer,
                for_nets,
                &access_directions,
                off_grid_id,
                &mut connected,
            ) {
                Ok(()) => {
                    self.off_grid_vertex_index
                        .insert(terminal.centre, off_grid_id.index());
                    return Ok(connected);
                }
                Err(error) => {
                    log::debug!(
                        "could not connect {} to surrounding tracks: {}",
                        terminal.centre,
                        error
                    );
                    self.rollback_connected_terminal(&connected);
                    continue;
                }
            }
        }

        Err(RouterError::NotFound(format!(
            "no workable access options for terminal at {}",
            terminal.centre
        )))
    }

    fn connect_to_surrounding_tracks(
        &mut self,
        geometry_index: usize,
        access_layer: Layer,
        for_nets: &EquivalentNets,
        allowed_directions: &[Direction],
        off_grid: VertexId,
        connected: &mut ConnectedTerminal,
    ) -> Result<()> {
        let centre = self.graph.vertex(off_grid).centre();
        let rings = self.config.bridging_track_rings;
        let nearest: Vec<TrackId> = self.geometries[geometry_index]
            .nearest_tracks(centre, rings)
            .into_iter()
            .collect();

        let mut errors: Vec<String> = Vec::new();
        let mut any_success = false;

        for track_id in nearest {
            let track_direction = self.graph.track(track_id).direction();
            match self.create_nearest_vertex_and_connect(
                track_id,
                off_grid,
                access_layer,
                for_nets,
            ) {
                BridgeOutcome::Failed => continue,
                BridgeOutcome::TargetExists(_) => {
                    errors.push(format!(
                        "{} already has a vertex at the off-grid position {}",
                        self.graph.track(track_id).describe(),
                        centre
                    ));
                    continue;
                }
                BridgeOutcome::TargetOnTrack => {
                    // The off-grid point landed on the track itself; the
                    // access direction is the track direction.
                    if !allowed_directions.contains(&track_direction) {
                        self.graph.track_remove_vertex(track_id, off_grid);
                        continue;
                    }
                    any_success = true;
                    continue;
                }
                outcome @ (BridgeOutcome::Existing(_) | BridgeOutcome::New(_)) => {
                    let (bridging, is_new) = match outcome {
                        BridgeOutcome::Existing(vertex) => (vertex, false),
                        BridgeOutcome::New(vertex) => (vertex, true),
                        _ => unreachable!(),
                    };
                    if is_new {
                        if self
                            .valid_against_known_blockages_vertex(
                                bridging,
                                Some(for_nets),
                                Some(track_direction),
                            )
                            .is_err()
                        {
                            self.graph.track_remove_vertex(track_id, bridging);
                            self.graph.delete_vertex(bridging);
                            continue;
                        }
                        let bridging_centre = self.graph.vertex(bridging).centre();
                        self.off_grid_vertex_index
                            .insert(bridging_centre, bridging.index());
                        connected.created_vertices.push(bridging);
                    }

                    let edge_id = self.graph.create_edge(bridging, off_grid, access_layer);
                    let edge_direction = self.graph.edge(edge_id).direction();
                    if !allowed_directions.contains(&edge_direction)
                        || self
                            .valid_against_known_blockages_edge(edge_id, Some(for_nets))
                            .is_err()
                    {
                        self.graph.remove_edge_fully(edge_id);
                        continue;
                    }
                    self.off_grid_edges.insert(edge_id);
                    connected.created_edges.push(edge_id);
                    any_success = true;
                }
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(RouterError::NotFound(errors.join("; ")))
        }
    }

    /// Removes everything a failed terminal connection created, so
    /// repeated failed searches do not grow the graph.
    pub fn rollback_connected_terminal(&mut self, connected: &ConnectedTerminal) {
        for &edge_id in &connected.created_edges {
            if self.graph.contains_edge(edge_id) {
                self.off_grid_edges.remove(&edge_id);
                self.graph.remove_edge_fully(edge_id);
            }
        }
        for &vertex_id in &connected.created_vertices {
            if self.graph.contains_vertex(vertex_id) {
                self.remove_vertex(vertex_id);
            }
        }
    }

    /// Detaches a vertex from its tracks and off-grid edges, then deletes
    /// it from the arena. A vertex missing from the arena is an
    /// unrecoverable internal-consistency fault.
    pub fn remove_vertex(&mut self, vertex_id: VertexId) {
        let tracks = self.graph.vertex(vertex_id).tracks();
        for track_id in tracks {
            self.graph.track_remove_vertex(track_id, vertex_id);
        }
        let doomed: Vec<EdgeId> = self
            .off_grid_edges
            .iter()
            .copied()
            .filter(|&e| {
                let edge = self.graph.edge(e);
                edge.first() == vertex_id || edge.second() == vertex_id
            })
            .collect();
        for edge_id in doomed {
            self.off_grid_edges.remove(&edge_id);
            self.graph.remove_edge_fully(edge_id);
        }
        let centre = self.graph.vertex(vertex_id).centre();
        self.off_grid_vertex_index.remove(centre, vertex_id.index());
        self.graph.delete_vertex(vertex_id);
    }

    // ---------------------------------------------------------------
    // Convenience request API (serial).
    // ---------------------------------------------------------------

    /// Finds and installs the shortest route between two terminals,
    /// avoiding the given shapes for the duration of the search.
    pub fn add_route_between(
        &mut self,
        begin: &Terminal,
        end: &Terminal,
        avoid: &[Shape],
        nets: &EquivalentNets,
    ) -> Result<usize> {
        let ticket = self.set_up_temporary_blockages(avoid);

        let begin_connection = match self.connect_terminal(begin, nets) {
            Ok(connection) => connection,
            Err(error) => {
                self.tear_down_temporary_blockages(ticket);
                return Err(RouterError::NotFound(format!(
                    "could not find available vertex for begin terminal: {}",
                    error
                )));
            }
        };
        let end_connection = match self.connect_terminal(end, nets) {
            Ok(connection) => connection,
            Err(error) => {
                self.rollback_connected_terminal(&begin_connection);
                self.tear_down_temporary_blockages(ticket);
                return Err(RouterError::NotFound(format!(
                    "could not find available vertex for end terminal: {}",
                    error
                )));
            }
        };

        let begin_vertex = begin_connection.vertex.unwrap();
        let end_vertex = end_connection.vertex.unwrap();

        let search = {
            let cache = BlockageCache::new(self);
            self.shortest_path(begin_vertex, end_vertex, &cache, nets)
        };
        let mut path = match search {
            Ok(path) => path,
            Err(error) => {
                self.rollback_connected_terminal(&end_connection);
                self.rollback_connected_terminal(&begin_connection);
                self.tear_down_temporary_blockages(ticket);
                return Err(error);
            }
        };

        path.set_nets(nets.clone());
        path.set_start_terminal(begin.clone(), begin_connection.layer);
        path.set_end_terminal(end.clone(), end_connection.layer);

        self.tear_down_temporary_blockages(ticket);
        self.install_path(path)
    }

    /// Finds and installs the shortest route from a terminal to any
    /// vertex already on one of `target_nets`.
    pub fn add_route_to_net(
        &mut self,
        begin: &Terminal,
        target_nets: &EquivalentNets,
        usable_nets: &EquivalentNets,
        avoid: &[Shape],
    ) -> Result<usize> {
        let ticket = self.set_up_temporary_blockages(avoid);

        let begin_connection = match self.connect_terminal(begin, usable_nets) {
            Ok(connection) => connection,
            Err(error) => {
                self.tear_down_temporary_blockages(ticket);
                return Err(RouterError::NotFound(format!(
                    "could not find available vertex for begin terminal: {}",
                    error
                )));
            }
        };
        let begin_vertex = begin_connection.vertex.unwrap();

        let search = {
            let cache = BlockageCache::new(self);
            self.shortest_path_to_net(begin_vertex, target_nets, usable_nets, &cache)
        };
        let mut path = match search {
            Ok(path) => path,
            Err(error) => {
                self.rollback_connected_terminal(&begin_connection);
                self.tear_down_temporary_blockages(ticket);
                return Err(error);
            }
        };

        // The end vertex attaches to the net on the layers its installed
        // paths reach it through.
        let end_vertex = *path.vertices().last().unwrap();
        let mut end_layers: BTreeSet<Layer> = BTreeSet::new();
        for edges in self.graph.vertex(end_vertex).installed_in_paths().values() {
            for &edge_id in edges {
                end_layers.insert(self.graph.edge(edge_id).layer());
            }
        }
        if let Some(explicit) = self.graph.vertex(end_vertex).explicit_net_layer() {
            end_layers.insert(explicit);
        }

        let mut all_nets = target_nets.clone();
        all_nets.merge(usable_nets);
        path.set_nets(all_nets);
        path.set_start_terminal(begin.clone(), begin_connection.layer);
        for layer in end_layers {
            path.add_end_access_layer(layer);
        }

        self.tear_down_temporary_blockages(ticket);
        self.install_path(path)
    }

    /// Re-checks that every entity a candidate path uses is still
    /// available for its nets; used before installing a path that was
    /// searched concurrently with other installations.
    pub fn path_still_available(&self, path: &Path, nets: &EquivalentNets) -> bool {
        for &edge_id in path.edges() {
            if !self.graph.edge(edge_id).available_for_nets(nets) {
                return false;
            }
        }
        for &vertex_id in path.vertices() {
            let vertex = self.graph.vertex(vertex_id);
            if !vertex.available_for_all(Some(nets), None) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ViaEncap;

    const H: Layer = Layer(0);
    const V: Layer = Layer(1);

    fn layer_info(layer: Layer, direction: Direction) -> LayerInfo {
        LayerInfo {
            layer,
            area: Rect::new(Point::new(0, 0), Point::new(200, 200)),
            wire_width: 2,
            offset: 10,
            direction,
            pitch: 10,
            min_separation: 1,
        }
    }

    fn small_via(bottom: Layer, top: Layer, cost: f64) -> ViaInfo {
        let mut via = ViaInfo::new(bottom, top, 2, 2, cost);
        via.set_encap(
            bottom,
            ViaEncap {
                overhang_length: 1,
                overhang_width: 1,
            },
        );
        via.set_encap(
            top,
            ViaEncap {
                overhang_length: 1,
                overhang_width: 1,
            },
        );
        via
    }

    fn grid() -> Grid {
        let mut grid = Grid::new(RouterConfig::default());
        grid.add_layer_info(layer_info(H, Direction::Horizontal)).unwrap();
        grid.add_layer_info(layer_info(V, Direction::Vertical)).unwrap();
        grid.add_via_info(H, V, small_via(H, V, 1.0)).unwrap();
        grid.connect_layers(H, V).unwrap();
        grid
    }

    fn vertex_at(grid: &Grid, x: i64, y: i64) -> VertexId {
        grid.geometries()
            .next()
            .unwrap()
            .vertex_at(Point::new(x, y))
            .expect("no vertex at requested point")
    }

    #[test]
    fn connect_layers_produces_full_grid() {
        let grid = grid();
        let geometry = grid.geometries().next().unwrap();
        // Pitch 10, offset 10 over (0,0)-(200,200): a 20x20 lattice from
        // (10,10) to (200,200).
        assert_eq!(geometry.max_column_index(), 19);
        assert_eq!(geometry.max_row_index(), 19);
        let mut count = 0;
        for i in 0..=19 {
            for j in 0..=19 {
                let vertex_id = geometry.vertex_at_indices(i, j).unwrap();
                let vertex = grid.graph().vertex(vertex_id);
                assert_eq!(vertex.centre(), Point::new(10 + 10 * i, 10 + 10 * j));
                assert!(vertex.horizontal_track().is_some());
                assert!(vertex.vertical_track().is_some());
                assert!(vertex.connects_layer(H));
                assert!(vertex.connects_layer(V));
                count += 1;
            }
        }
        assert_eq!(count, 400);
        assert_eq!(grid.tracks_on_layer(H).len(), 20);
        assert_eq!(grid.tracks_on_layer(V).len(), 20);
    }

    #[test]
    fn connect_layers_rejects_bad_configs() {
        let mut grid = Grid::new(RouterConfig::default());
        grid.add_layer_info(layer_info(H, Direction::Horizontal)).unwrap();
        grid.add_layer_info(layer_info(V, Direction::Horizontal)).unwrap();
        grid.add_via_info(H, V, small_via(H, V, 1.0)).unwrap();
        // Two horizontal layers cannot form a grid.
        assert!(matches!(
            grid.connect_layers(H, V),
            Err(RouterError::Config(_))
        ));

        let mut grid = Grid::new(RouterConfig::default());
        grid.add_layer_info(layer_info(H, Direction::Horizontal)).unwrap();
        grid.add_layer_info(layer_info(V, Direction::Vertical)).unwrap();
        // No via rule between the layers.
        assert!(matches!(
            grid.connect_layers(H, V),
            Err(RouterError::Config(_))
        ));

        let mut grid = self::grid();
        assert!(matches!(
            grid.connect_layers(H, V),
            Err(RouterError::Config(_))
        ));
    }

    #[test]
    fn duplicate_registrations_are_config_errors() {
        let mut grid = Grid::new(RouterConfig::default());
        grid.add_layer_info(layer_info(H, Direction::Horizontal)).unwrap();
        assert!(grid.add_layer_info(layer_info(H, Direction::Horizontal)).is_err());
        grid.add_via_info(H, V, small_via(H, V, 1.0)).unwrap();
        assert!(grid.add_via_info(V, H, small_via(H, V, 1.0)).is_err());
    }

    #[test]
    fn via_stack_spans_intermediate_layers() {
        let mut grid = Grid::new(RouterConfig::default());
        let m3 = Layer(2);
        grid.add_via_info(H, V, small_via(H, V, 1.0)).unwrap();
        grid.add_via_info(V, m3, small_via(V, m3, 3.0)).unwrap();

        let direct = grid.find_via_stack(H, V).unwrap();
        assert_eq!(direct.len(), 1);
        let stacked = grid.find_via_stack(H, m3).unwrap();
        assert_eq!(stacked.len(), 2);
        assert_eq!(grid.via_stack_cost(H, m3), Some(4.0));
        assert_eq!(grid.via_stack_cost(H, H), Some(0.0));
        assert!(grid.find_via_stack(H, Layer(9)).is_none());
        // Memoised result agrees.
        assert_eq!(grid.via_stack_cost(H, m3), Some(4.0));
    }

    #[test]
    fn shortest_path_connects_grid_points() {
        let grid = grid();
        let begin = vertex_at(&grid, 10, 10);
        let end = vertex_at(&grid, 50, 40);
        let cache = BlockageCache::new(&grid);
        let nets = EquivalentNets::from_name("n1");
        let path = grid.shortest_path(begin, end, &cache, &nets).unwrap();
        assert_eq!(*path.vertices().first().unwrap(), begin);
        assert_eq!(*path.vertices().last().unwrap(), end);
        assert_eq!(path.vertices().len(), path.edges().len() + 1);
    }

    #[test]
    fn unreachable_target_is_not_found() {
        let mut grid = grid();
        // Wall off the target's entire row and column neighbourhood.
        let target = vertex_at(&grid, 100, 100);
        for neighbour in grid.graph().vertex(target).neighbours().collect::<Vec<_>>() {
            grid.graph_mut()
                .vertex_mut(neighbour)
                .set_forced_blocked(true, false, None);
        }
        // Block all edges into the target.
        for edge in grid.graph().vertex(target).edges().to_vec() {
            grid.graph_mut().edge_mut(edge).set_blocked(true, false);
        }
        let begin = vertex_at(&grid, 10, 10);
        let cache = BlockageCache::new(&grid);
        let nets = EquivalentNets::from_name("n1");
        let result = grid.shortest_path(begin, target, &cache, &nets);
        assert!(matches!(result, Err(RouterError::NotFound(_))));
    }

    #[test]
    fn install_path_flips_availability() {
        let mut grid = grid();
        let nets = EquivalentNets::from_name("n1");
        let begin = Terminal {
            centre: Point::new(10, 10),
            layer: H,
            net: "n1".to_string(),
        };
        let end = Terminal {
            centre: Point::new(60, 10),
            layer: H,
            net: "n1".to_string(),
        };
        let index = grid.add_route_between(&begin, &end, &[], &nets).unwrap();
        let path = &grid.paths()[index];

        for &vertex in path.vertices() {
            assert!(!grid.graph().vertex(vertex).available());
            assert_eq!(grid.graph().vertex(vertex).net(), Some("n1"));
        }
        for &edge in path.edges() {
            assert!(!grid.graph().edge(edge).available());
            assert_eq!(grid.graph().edge(edge).effective_net(), Some("n1"));
        }
        // A far-away vertex is untouched.
        let far = vertex_at(&grid, 200, 200);
        assert!(grid.graph().vertex(far).available());
    }

    #[test]
    fn installed_path_blocks_other_nets_but_not_its_own() {
        let mut grid = grid();
        let nets = EquivalentNets::from_name("n1");
        let begin = Terminal {
            centre: Point::new(10, 10),
            layer: H,
            net: "n1".to_string(),
        };
        let end = Terminal {
            centre: Point::new(100, 10),
            layer: H,
            net: "n1".to_string(),
        };
        grid.add_route_between(&begin, &end, &[], &nets).unwrap();

        let used = vertex_at(&grid, 50, 10);
        assert!(!grid.graph().vertex(used).available());
        assert!(grid
            .graph()
            .vertex(used)
            .available_for_all(Some(&nets), None));
        let other = EquivalentNets::from_name("n2");
        assert!(!grid
            .graph()
            .vertex(used)
            .available_for_all(Some(&other), None));
    }

    #[test]
    fn temporary_blockages_round_trip() {
        let mut grid = grid();
        let probe = vertex_at(&grid, 50, 50);
        assert!(grid.graph().vertex(probe).available());

        let shape = Shape::rect(
            Rect::new(Point::new(40, 40), Point::new(60, 60)),
            H,
        );
        let ticket = grid.set_up_temporary_blockages(&[shape]);
        assert!(!grid.graph().vertex(probe).available());

        grid.tear_down_temporary_blockages(ticket);
        assert!(grid.graph().vertex(probe).available());
        // Every vertex is restored, not just the probe.
        for vertex in grid.graph().vertex_ids().collect::<Vec<_>>() {
            assert!(grid.graph().vertex(vertex).available());
        }
        for edge in grid.graph().edge_ids().collect::<Vec<_>>() {
            assert!(grid.graph().edge(edge).available());
        }
    }

    #[test]
    fn off_grid_terminal_is_bridged_and_rolled_back() {
        let mut grid = grid();
        let nets = EquivalentNets::from_name("n1");
        let terminal = Terminal {
            centre: Point::new(34, 57),
            layer: H,
            net: "n1".to_string(),
        };
        let slots_before = grid.graph().num_vertex_slots();
        let connected = grid.connect_terminal(&terminal, &nets).unwrap();
        assert!(!connected.created_vertices.is_empty());
        let off_grid = connected.vertex.unwrap();
        assert!(grid.graph().vertex(off_grid).is_off_grid());
        assert!(!grid.graph().vertex(off_grid).edges().is_empty());

        grid.rollback_connected_terminal(&connected);
        // Every created slot is cleared again.
        for &vertex in &connected.created_vertices {
            assert!(!grid.graph().contains_vertex(vertex));
        }
        for &edge in &connected.created_edges {
            assert!(!grid.graph().contains_edge(edge));
        }
        assert_eq!(
            grid.graph()
                .vertex_ids()
                .filter(|id| id.index() >= slots_before)
                .count(),
            0
        );
    }

    #[test]
    fn via_footprint_orientation() {
        let grid = grid();
        let vertex = vertex_at(&grid, 50, 50);
        // Encap: via side 2 + 2*overhang(1) = 4 along, 4 across here since
        // both overhangs are 1.
        let vertical = grid
            .via_footprint(vertex, H, 0, Some(Direction::Vertical))
            .unwrap();
        assert_eq!(vertical.width(), 4);
        assert_eq!(vertical.height(), 4);
        let padded = grid.via_footprint(vertex, H, 3, None).unwrap();
        assert_eq!(padded.width(), 10);
        assert_eq!(padded.centre(), Point::new(50, 50));
        // A layer the vertex does not connect has no footprint.
        assert!(grid.via_footprint(vertex, Layer(7), 0, None).is_none());
    }
}
