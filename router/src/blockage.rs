use crate::graph::{EdgeId, VertexId};
use crate::grid::Grid;
use crate::nets::EquivalentNets;
use crate::rules::Direction;
use gridroute_common::geom::{Point, Polygon, Rect};
use gridroute_common::tech::Layer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Keep-out geometry: a rectangle or polygon on one layer, optionally
/// owned by a net.
#[derive(Clone, Debug, PartialEq)]
pub enum ShapeKind {
    Rect(Rect),
    Polygon(Polygon),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Shape {
    pub kind: ShapeKind,
    pub layer: Layer,
    pub net: Option<String>,
}

impl Shape {
    pub fn rect(rect: Rect, layer: Layer) -> Self {
        Self {
            kind: ShapeKind::Rect(rect),
            layer,
            net: None,
        }
    }

    pub fn polygon(polygon: Polygon, layer: Layer) -> Self {
        Self {
            kind: ShapeKind::Polygon(polygon),
            layer,
            net: None,
        }
    }

    pub fn with_net(mut self, net: &str) -> Self {
        self.net = Some(net.to_string());
        self
    }

    pub fn net(&self) -> Option<&str> {
        self.net.as_deref()
    }

    pub fn bounding_box(&self) -> Rect {
        match &self.kind {
            ShapeKind::Rect(rect) => *rect,
            ShapeKind::Polygon(polygon) => polygon.bounding_box(),
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        match &self.kind {
            ShapeKind::Rect(rect) => rect.contains(point),
            ShapeKind::Polygon(polygon) => polygon.contains(point),
        }
    }

    pub fn overlaps_rect(&self, rect: &Rect) -> bool {
        match &self.kind {
            ShapeKind::Rect(own) => own.overlaps(rect),
            ShapeKind::Polygon(polygon) => polygon.overlaps_rect(rect),
        }
    }

    /// The shape's outline as a polygon, for track-crossing scans.
    pub fn as_polygon(&self) -> Polygon {
        match &self.kind {
            ShapeKind::Rect(rect) => {
                let ll = rect.lower_left();
                let ur = rect.upper_right();
                Polygon::new(vec![
                    ll,
                    Point::new(ur.x, ll.y),
                    ur,
                    Point::new(ll.x, ur.y),
                ])
            }
            ShapeKind::Polygon(polygon) => polygon.clone(),
        }
    }
}

/// A shape-with-padding installed in the grid (or a cache): answers
/// whether it denies a via at a vertex or a wire along an edge.
///
/// With exceptional nets, an intersection is forgiven only when the
/// shapes merely touch: the blocked test is retried with zero padding.
#[derive(Clone, Debug)]
pub struct GridBlockage {
    shape: Shape,
    padding: i64,
}

impl GridBlockage {
    pub fn new(shape: Shape, padding: i64) -> Self {
        Self { shape, padding }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn padding(&self) -> i64 {
        self.padding
    }

    pub fn intersects_point(&self, point: Point) -> bool {
        self.shape.contains(point)
    }

    pub fn blocks_vertex(
        &self,
        grid: &Grid,
        vertex: VertexId,
        exceptional_nets: Option<&EquivalentNets>,
        access_direction: Option<Direction>,
    ) -> bool {
        self.blocks_vertex_with_padding(
            grid,
            vertex,
            self.padding,
            exceptional_nets,
            access_direction,
        )
    }

    fn blocks_vertex_with_padding(
        &self,
        grid: &Grid,
        vertex: VertexId,
        padding: i64,
        exceptional_nets: Option<&EquivalentNets>,
        access_direction: Option<Direction>,
    ) -> bool {
        let intersects =
            grid.via_would_intersect(vertex, &self.shape, padding, access_direction);
        if intersects {
            if let (Some(nets), Some(net)) = (exceptional_nets, self.shape.net()) {
                if nets.contains(net) {
                    if padding == 0 {
                        return false;
                    }
                    // Touching same-net shapes are allowed; anything
                    // closer than the padding but not touching is not.
                    return !grid.via_would_intersect(
                        vertex,
                        &self.shape,
                        0,
                        access_direction,
                    );
                }
            }
        }
        intersects
    }

    pub fn blocks_edge(
        &self,
        grid: &Grid,
        edge: EdgeId,
        exceptional_nets: Option<&EquivalentNets>,
    ) -> bool {
        let intersects = grid.wire_would_intersect(edge, &self.shape, self.padding);
        if intersects {
            if let (Some(nets), Some(net)) = (exceptional_nets, self.shape.net()) {
                if nets.contains(net) {
                    if self.padding == 0 {
                        return false;
                    }
                    return !grid.wire_would_intersect(edge, &self.shape, 0);
                }
            }
        }
        intersects
    }
}

static NEXT_CACHE_TAG: AtomicU32 = AtomicU32::new(1);

/// Resolved reference to a blockage held by some cache in a parent chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockageHandle {
    tag: u32,
    index: usize,
}

#[derive(Clone, Copy, Debug)]
struct UserRecord {
    layer: Layer,
    index: usize,
}

#[derive(Clone, Copy, Debug)]
struct InhibitorRecord {
    direction: Direction,
    layer: Layer,
    index: usize,
}

/// Blockages recorded against one vertex: `users` intersect it outright
/// (keyed by the owning net), `inhibitors` deny one via direction.
#[derive(Debug, Default)]
struct VertexBlockages {
    users: HashMap<Option<String>, Vec<UserRecord>>,
    inhibitors: Vec<InhibitorRecord>,
}

/// Blockages crossing one edge, keyed by their net. An edge with a single
/// same-net source can still connect to that net.
#[derive(Debug, Default)]
struct EdgeBlockages {
    sources: HashMap<Option<String>, Vec<usize>>,
}

/// Memoised blockage resolution over a read-only grid.
///
/// The expensive shape-to-entity mapping is computed once, when a
/// blockage is added; queries afterwards are membership tests. Child
/// caches layer per-search exception sets on top of a shared parent:
/// cancelling a blockage resolves it by shape value once and masks it in
/// every later query, without mutating the parent. Queries walk
/// iteratively from child to root, threading the accumulated
/// cancellation set.
pub struct BlockageCache<'g> {
    grid: &'g Grid,
    parent: Option<&'g BlockageCache<'g>>,
    tag: u32,
    search_window_margin: i64,
    blockages: Vec<GridBlockage>,
    blocked_vertices: HashMap<VertexId, VertexBlockages>,
    blocked_edges: HashMap<EdgeId, EdgeBlockages>,
    cancelled: Vec<BlockageHandle>,
}

impl<'g> BlockageCache<'g> {
    pub fn new(grid: &'g Grid) -> Self {
        Self {
            grid,
            parent: None,
            tag: NEXT_CACHE_TAG.fetch_add(1, Ordering::Relaxed),
            search_window_margin: grid.config().blockage_search_margin,
            blockages: Vec::new(),
            blocked_vertices: HashMap::new(),
            blocked_edges: HashMap::new(),
            cancelled: Vec::new(),
        }
    }

    /// A child cache layered over `parent`; the parent is immutable for
    /// the child's lifetime.
    pub fn with_parent(grid: &'g Grid, parent: &'g BlockageCache<'g>) -> Self {
        let mut cache = Self::new(grid);
        cache.parent = Some(parent);
        cache
    }

    /// Resolves the shape against every vertex and edge it could affect
    /// and records the outcome. Candidate vertices come from the grid
    /// geometry index windows (on-grid) and the spatial point index
    /// (off-grid); candidate edges from nearest-track lookup.
    pub fn add_blockage(&mut self, shape: Shape, padding: i64) {
        let blockage = GridBlockage::new(shape, padding);
        let index = self.blockages.len();

        for vertex in self.determine_possibly_affected_vertices(&blockage) {
            self.apply_blockage_to_one_vertex(&blockage, index, vertex);
        }
        for edge in self.determine_affected_edges(&blockage) {
            if blockage.blocks_edge(self.grid, edge, None) {
                self.blocked_edges
                    .entry(edge)
                    .or_default()
                    .sources
                    .entry(blockage.shape().net.clone())
                    .or_default()
                    .push(index);
            }
        }

        self.blockages.push(blockage);
    }

    /// Masks a blockage previously added to this cache or any ancestor,
    /// matching by shape value. The underlying records are untouched;
    /// every subsequent query consults the cancellation list.
    pub fn cancel_blockage(&mut self, shape: &Shape) {
        let mut cache: Option<&BlockageCache> = Some(self);
        let mut handles = Vec::new();
        while let Some(level) = cache {
            for (index, blockage) in level.blockages.iter().enumerate() {
                if blockage.shape() == shape {
                    handles.push(BlockageHandle {
                        tag: level.tag,
                        index,
                    });
                }
            }
            cache = level.parent;
        }
        self.cancelled.extend(handles);
    }

    /// Is the vertex blocked for `for_nets`, in the given access
    /// direction (or any), on the given layer (or any)? Consults the
    /// vertex's own state, then every cache level from here to the root.
    pub fn is_vertex_blocked(
        &self,
        vertex: VertexId,
        for_nets: &EquivalentNets,
        direction_or_any: Option<Direction>,
        layer_or_any: Option<Layer>,
    ) -> bool {
        if self.grid.graph().vertex(vertex).is_blocked(for_nets, layer_or_any) {
            return true;
        }

        let cancellations = self.accumulated_cancellations();
        let mut cache: Option<&BlockageCache> = Some(self);
        while let Some(level) = cache {
            if let Some(records) = level.blocked_vertices.get(&vertex) {
                // Users: blockages intersecting the vertex outright. The
                // vertex remains usable for the blockage's own net.
                for (net, users) in &records.users {
                    let excepted = match net {
                        Some(net) => for_nets.contains(net),
                        None => false,
                    };
                    if excepted {
                        continue;
                    }
                    for user in users {
                        if layer_or_any.is_some_and(|l| l != user.layer) {
                            continue;
                        }
                        if !cancellations.contains(&BlockageHandle {
                            tag: level.tag,
                            index: user.index,
                        }) {
                            return true;
                        }
                    }
                }
                // Inhibitors: directional via-fit failures; no net
                // exceptions apply.
                for inhibitor in &records.inhibitors {
                    if direction_or_any.is_some_and(|d| d != inhibitor.direction) {
                        continue;
                    }
                    if layer_or_any.is_some_and(|l| l != inhibitor.layer) {
                        continue;
                    }
                    if !cancellations.contains(&BlockageHandle {
                        tag: level.tag,
                        index: inhibitor.index,
                    }) {
                        return true;
                    }
                }
            }
            cache = level.parent;
        }
        false
    }

    pub fn is_edge_blocked(&self, edge: EdgeId, for_nets: &EquivalentNets) -> bool {
        if !self.grid.graph().edge(edge).available_for_nets(for_nets) {
            return true;
        }
        let cancellations = self.accumulated_cancellations();
        let mut cache: Option<&BlockageCache> = Some(self);
        while let Some(level) = cache {
            if let Some(records) = level.blocked_edges.get(&edge) {
                for (net, sources) in &records.sources {
                    let excepted = match net {
                        Some(net) => for_nets.contains(net),
                        None => false,
                    };
                    if excepted {
                        continue;
                    }
                    for &index in sources {
                        if !cancellations.contains(&BlockageHandle {
                            tag: level.tag,
                            index,
                        }) {
                            return true;
                        }
                    }
                }
            }
            cache = level.parent;
        }
        false
    }

    /// True iff the vertex is completely unblocked for the nets on every
    /// layer and direction.
    pub fn available_for_all_vertex(
        &self,
        vertex: VertexId,
        for_nets: &EquivalentNets,
    ) -> bool {
        !self.is_vertex_blocked(vertex, for_nets, None, None)
    }

    /// True iff at least one of the vertex's connected layers is
    /// unblocked for the nets.
    pub fn available_for_nets_on_any_layer(
        &self,
        vertex: VertexId,
        for_nets: &EquivalentNets,
    ) -> bool {
        let layers: Vec<Layer> = self
            .grid
            .graph()
            .vertex(vertex)
            .connected_layers()
            .to_vec();
        layers
            .into_iter()
            .any(|layer| !self.is_vertex_blocked(vertex, for_nets, None, Some(layer)))
    }

    pub fn available_for_all_edge(&self, edge: EdgeId, for_nets: &EquivalentNets) -> bool {
        !self.is_edge_blocked(edge, for_nets)
    }

    fn accumulated_cancellations(&self) -> Vec<BlockageHandle> {
        let mut cancellations = Vec::new();
        let mut cache: Option<&BlockageCache> = Some(self);
        while let Some(level) = cache {
            cancellations.extend_from_slice(&level.cancelled);
            cache = level.parent;
        }
        cancellations
    }

    fn apply_blockage_to_one_vertex(
        &mut self,
        blockage: &GridBlockage,
        index: usize,
        vertex: VertexId,
    ) {
        let centre = self.grid.graph().vertex(vertex).centre();
        if blockage.intersects_point(centre) {
            self.blocked_vertices
                .entry(vertex)
                .or_default()
                .users
                .entry(blockage.shape().net.clone())
                .or_default()
                .push(UserRecord {
                    layer: blockage.shape().layer,
                    index,
                });
            return;
        }
        for direction in [Direction::Horizontal, Direction::Vertical] {
            if blockage.blocks_vertex(self.grid, vertex, None, Some(direction)) {
                self.blocked_vertices
                    .entry(vertex)
                    .or_default()
                    .inhibitors
                    .push(InhibitorRecord {
                        direction,
                        layer: blockage.shape().layer,
                        index,
                    });
            }
        }
    }

    fn determine_possibly_affected_vertices(&self, blockage: &GridBlockage) -> Vec<VertexId> {
        let layer = blockage.shape().layer;
        let bbox = blockage.shape().bounding_box();
        let padding = blockage.padding() + self.search_window_margin;

        let mut targets: Vec<VertexId> = Vec::new();
        for geometry in self.grid.geometries() {
            if !geometry.uses_layer(layer) {
                continue;
            }
            let window = geometry.enveloping_vertex_indices_for_rect(&bbox, padding, 1);
            targets.extend(geometry.vertices_in_window(&window));
        }

        let radius = bbox.width().max(bbox.height()) + padding;
        targets.extend(self.grid.off_grid_vertices_near(bbox.centre(), radius));

        targets.sort_unstable();
        targets.dedup();
        targets
    }

    fn determine_affected_edges(&self, blockage: &GridBlockage) -> Vec<EdgeId> {
        let layer = blockage.shape().layer;
        let padding = blockage.padding() + self.search_window_margin;
        let mut edges: Vec<EdgeId> = Vec::new();

        for track_id in self.grid.tracks_on_layer(layer) {
            let track = self.grid.graph().track(track_id);
            if !track.intersects_rect(&blockage.shape().bounding_box(), padding) {
                continue;
            }
            edges.extend_from_slice(track.edges());
        }
        for edge in self.grid.off_grid_edges() {
            if self.grid.graph().edge(edge).layer() == layer {
                edges.push(edge);
            }
        }
        edges.sort_unstable();
        edges.dedup();
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_value_equality() {
        let a = Shape::rect(
            Rect::new(Point::new(0, 0), Point::new(10, 10)),
            Layer(0),
        )
        .with_net("x");
        let b = Shape::rect(
            Rect::new(Point::new(0, 0), Point::new(10, 10)),
            Layer(0),
        )
        .with_net("x");
        let c = Shape::rect(Rect::new(Point::new(0, 0), Point::new(10, 10)), Layer(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rect_as_polygon_round_trip() {
        let shape = Shape::rect(Rect::new(Point::new(0, 0), Point::new(10, 20)), Layer(0));
        let polygon = shape.as_polygon();
        assert_eq!(polygon.vertices().len(), 4);
        assert_eq!(polygon.bounding_box(), shape.bounding_box());
    }
}
