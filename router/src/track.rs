use crate::graph::{EdgeId, TrackId, VertexId};
use crate::nets::EquivalentNets;
use crate::rules::Direction;
use gridroute_common::geom::{Line, Point, Polygon, Rect};
use gridroute_common::tech::Layer;
use std::collections::BTreeMap;

/// A closed interval of blocked positions along a track, projected onto
/// the track's axis. Carries the net responsible, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackBlockage {
    start: i64,
    end: i64,
    net: Option<String>,
    /// Non-zero only for temporary blockages, which are removed by handle.
    id: u64,
}

impl TrackBlockage {
    pub fn new(start: i64, end: i64, net: Option<String>) -> Self {
        assert!(start <= end, "track blockage start must not exceed end");
        Self {
            start,
            end,
            net,
            id: 0,
        }
    }

    pub fn with_id(start: i64, end: i64, net: Option<String>, id: u64) -> Self {
        let mut blockage = Self::new(start, end, net);
        blockage.id = id;
        blockage
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn net(&self) -> Option<&str> {
        self.net.as_deref()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn contains(&self, position: i64) -> bool {
        position >= self.start && position <= self.end
    }

    pub fn blocks(&self, low: i64, high: i64) -> bool {
        self.start <= high && self.end >= low
    }
}

/// Separate interval lists for vertex positions and edge spans; blocked
/// spans differ because an edge end must still fit a via.
#[derive(Clone, Debug, Default)]
pub struct BlockagePlane {
    pub vertex_blockages: Vec<TrackBlockage>,
    pub edge_blockages: Vec<TrackBlockage>,
}

/// Outcome of attempting to bridge a point onto a track. See
/// `Grid::create_nearest_vertex_and_connect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The candidate landing position is blocked; nothing was created.
    Failed,
    /// The target point coincides with an existing track vertex; the
    /// caller's vertex is redundant.
    TargetExists(VertexId),
    /// An existing vertex at the landing position will serve as the
    /// connection point.
    Existing(VertexId),
    /// A new bridging vertex was created on the track.
    New(VertexId),
    /// The target itself lay on the track and was added to it.
    TargetOnTrack,
}

/// A straight line of routing positions at a fixed offset on one layer.
///
/// Tracks do not own their vertices, but they own the edges generated
/// between them and the blockage intervals that invalidate spans of both.
#[derive(Clone, Debug)]
pub struct Track {
    layer: Layer,
    direction: Direction,
    offset: i64,
    pitch: i64,
    width: i64,
    vertex_via_width: i64,
    vertex_via_length: i64,
    min_separation: i64,
    min_separation_between_edges: i64,
    min_separation_to_new_blockages: i64,
    min_transverse_separation: i64,
    edges: Vec<EdgeId>,
    vertices_by_offset: BTreeMap<i64, VertexId>,
    blockages: BlockagePlane,
    temporary_blockages: BlockagePlane,
}

impl Track {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layer: Layer,
        direction: Direction,
        pitch: i64,
        width: i64,
        vertex_via_width: i64,
        vertex_via_length: i64,
        min_separation: i64,
        offset: i64,
    ) -> Self {
        Self {
            layer,
            direction,
            offset,
            pitch,
            width,
            vertex_via_width,
            vertex_via_length,
            min_separation,
            min_separation_between_edges: vertex_via_length + min_separation,
            min_separation_to_new_blockages: vertex_via_length / 2 + min_separation,
            min_transverse_separation: width.max(vertex_via_width) / 2 + min_separation,
            edges: Vec::new(),
            vertices_by_offset: BTreeMap::new(),
            blockages: BlockagePlane::default(),
            temporary_blockages: BlockagePlane::default(),
        }
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn pitch(&self) -> i64 {
        self.pitch
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn min_separation_between_edges(&self) -> i64 {
        self.min_separation_between_edges
    }

    pub fn min_separation_to_new_blockages(&self) -> i64 {
        self.min_separation_to_new_blockages
    }

    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub(crate) fn edges_mut(&mut self) -> &mut Vec<EdgeId> {
        &mut self.edges
    }

    pub fn vertices_by_offset(&self) -> &BTreeMap<i64, VertexId> {
        &self.vertices_by_offset
    }

    pub(crate) fn vertices_by_offset_mut(&mut self) -> &mut BTreeMap<i64, VertexId> {
        &mut self.vertices_by_offset
    }

    pub fn blockages(&self) -> &BlockagePlane {
        &self.blockages
    }

    pub fn project_onto_axis(point: Point, direction: Direction) -> i64 {
        match direction {
            Direction::Horizontal => point.x,
            Direction::Vertical => point.y,
        }
    }

    pub fn project_pair_onto_axis(lhs: Point, rhs: Point, direction: Direction) -> (i64, i64) {
        let a = Self::project_onto_axis(lhs, direction);
        let b = Self::project_onto_axis(rhs, direction);
        (a.min(b), a.max(b))
    }

    /// Projection of a point onto this track's major axis.
    pub fn project_onto_track(&self, point: Point) -> i64 {
        Self::project_onto_axis(point, self.direction)
    }

    /// Projection of a point onto the axis orthogonal to this track.
    pub fn project_onto_offset(&self, point: Point) -> i64 {
        Self::project_onto_axis(point, self.direction.orthogonal())
    }

    pub fn point_on_track(&self, projection: i64) -> Point {
        match self.direction {
            Direction::Horizontal => Point::new(projection, self.offset),
            Direction::Vertical => Point::new(self.offset, projection),
        }
    }

    pub fn is_point_on_track(&self, point: Point) -> bool {
        self.project_onto_offset(point) == self.offset
    }

    pub fn get_vertex_at_offset(&self, offset: i64) -> Option<VertexId> {
        self.vertices_by_offset.get(&offset).copied()
    }

    pub fn get_vertex_at(&self, point: Point) -> Option<VertexId> {
        if !self.is_point_on_track(point) {
            return None;
        }
        self.get_vertex_at_offset(self.project_onto_track(point))
    }

    pub fn contains_vertex(&self, vertex: VertexId) -> bool {
        self.vertices_by_offset.values().any(|&v| v == vertex)
    }

    /// Vertices whose projections fall within the span between the two
    /// points, ordered along the track.
    pub fn vertices_in_span(&self, one_end: Point, other_end: Point) -> Vec<VertexId> {
        let (low, high) =
            Self::project_pair_onto_axis(one_end, other_end, self.direction);
        self.vertices_by_offset
            .range(low..=high)
            .map(|(_, &v)| v)
            .collect()
    }

    fn blockage_blocks(
        &self,
        blockage: &TrackBlockage,
        one_end: Point,
        other_end: Point,
        margin: i64,
    ) -> bool {
        let (mut low, mut high) =
            Self::project_pair_onto_axis(one_end, other_end, self.direction);
        low -= margin - 1;
        high += margin - 1;
        blockage.blocks(low, high)
    }

    /// Whether a vertex (a point, for via purposes) at `point` is blocked
    /// on this track, excepting blockages whose net is in `for_nets`.
    pub fn is_vertex_blocked(
        &self,
        point: Point,
        margin: i64,
        for_nets: Option<&EquivalentNets>,
    ) -> bool {
        let position = self.project_onto_track(point);
        let low = position - (margin - 1);
        let high = position + (margin - 1);
        let excepted = |blockage: &TrackBlockage| match (for_nets, blockage.net()) {
            (Some(nets), Some(net)) => nets.contains(net),
            _ => false,
        };
        self.blockages
            .vertex_blockages
            .iter()
            .chain(self.temporary_blockages.vertex_blockages.iter())
            .any(|b| b.blocks(low, high) && !excepted(b))
    }

    /// Whether the span between the two points is blocked for a new edge.
    /// Same-net collisions are not blocking but are reported so the caller
    /// can label the new edge.
    #[allow(clippy::too_many_arguments)]
    pub fn is_edge_blocked_between(
        &self,
        one_end: Point,
        other_end: Point,
        margin: i64,
        for_nets: Option<&EquivalentNets>,
        same_net_collisions: &mut Vec<TrackBlockage>,
        temporary_same_net_collisions: &mut Vec<TrackBlockage>,
    ) -> bool {
        let (mut low, mut high) =
            Self::project_pair_onto_axis(one_end, other_end, self.direction);
        low -= margin - 1;
        high += margin - 1;

        for blockage in &self.blockages.edge_blockages {
            if !blockage.blocks(low, high) {
                continue;
            }
            match (for_nets, blockage.net()) {
                (Some(nets), Some(net)) if nets.contains(net) => {
                    same_net_collisions.push(blockage.clone());
                }
                _ => return true,
            }
        }
        for blockage in &self.temporary_blockages.edge_blockages {
            if !blockage.blocks(low, high) {
                continue;
            }
            match (for_nets, blockage.net()) {
                (Some(nets), Some(net)) if nets.contains(net) => {
                    temporary_same_net_collisions.push(blockage.clone());
                }
                _ => return true,
            }
        }
        false
    }

    /// Whether the rectangle comes close enough to this track's centre
    /// line to matter, by transverse projection.
    pub fn intersects_rect(&self, rectangle: &Rect, padding: i64) -> bool {
        let mut offset_low = self.project_onto_offset(rectangle.lower_left());
        let mut offset_high = self.project_onto_offset(rectangle.upper_right());
        if offset_low > offset_high {
            std::mem::swap(&mut offset_low, &mut offset_high);
        }
        let low = self.offset - (self.min_transverse_separation - 1) - padding;
        let high = self.offset + (self.min_transverse_separation - 1) + padding;
        !((low < offset_low && high < offset_low) || (low > offset_high && high > offset_high))
    }

    /// Spans of the polygon, projected onto this track, that come close
    /// enough to the centre line to block it. The polygon's widest run
    /// inside the track band is found by testing a scan line through
    /// every polygon vertex inside the band, plus the band edges.
    pub fn intersects_polygon(&self, polygon: &Polygon, padding: i64) -> Vec<(i64, i64)> {
        let boundary = self.min_transverse_separation + padding - 1;
        let low_offset = self.offset - boundary;
        let high_offset = self.offset + boundary;

        let bbox = polygon.bounding_box();
        let (poly_low, poly_high) =
            Self::project_pair_onto_axis(bbox.lower_left(), bbox.upper_right(),
                self.direction.orthogonal());

        // Entirely inside the band: the whole projected bounding box blocks.
        if poly_low >= low_offset && poly_high <= high_offset {
            let (low, high) = Self::project_pair_onto_axis(
                bbox.lower_left(),
                bbox.upper_right(),
                self.direction,
            );
            return vec![(low, high)];
        }

        let mut test_offsets = vec![low_offset, high_offset];
        for vertex in polygon.vertices() {
            let projection = self.project_onto_offset(*vertex);
            if projection >= low_offset
                && projection <= high_offset
                && !test_offsets.contains(&projection)
            {
                test_offsets.push(projection);
            }
        }

        let mut spans: Vec<(i64, i64)> = Vec::new();
        for offset in test_offsets {
            let line = self.parallel_line_at_offset(offset);
            for (a, b) in polygon.intersecting_points(&line) {
                let (low, high) = Self::project_pair_onto_axis(a, b, self.direction);
                spans.push((low, high));
            }
        }
        spans.sort_unstable();
        spans.dedup();
        spans
    }

    fn parallel_line_at_offset(&self, offset: i64) -> Line {
        match self.direction {
            Direction::Horizontal => Line::new(Point::new(0, offset), Point::new(1, offset)),
            Direction::Vertical => Line::new(Point::new(offset, 0), Point::new(offset, 1)),
        }
    }

    /// Merges a new blockage interval into `container`, coalescing with
    /// existing same-net intervals that fall within `margin`. Intervals on
    /// different nets are never merged, even when they overlap.
    pub fn merge_new_blockage(
        container: &mut Vec<TrackBlockage>,
        low: i64,
        high: i64,
        margin: i64,
        net: Option<&str>,
    ) -> TrackBlockage {
        let mut span: Option<(i64, i64)> = None;
        container.retain(|blockage| {
            if blockage.net() == net
                && blockage.blocks(low - (margin - 1), high + (margin - 1))
            {
                span = match span {
                    None => Some((blockage.start.min(low), blockage.end.max(high))),
                    Some((s, e)) => Some((s.min(blockage.start), e.max(blockage.end))),
                };
                false
            } else {
                true
            }
        });
        let (start, end) = span.unwrap_or((low, high));
        let merged = TrackBlockage::new(start, end, net.map(|n| n.to_string()));
        container.push(merged.clone());
        Self::sort_blockages(container);
        merged
    }

    pub fn merge_new_vertex_blockage(
        &mut self,
        one_end: Point,
        other_end: Point,
        margin: i64,
        net: Option<&str>,
    ) -> TrackBlockage {
        let (low, high) = Self::project_pair_onto_axis(one_end, other_end, self.direction);
        Self::merge_new_blockage(&mut self.blockages.vertex_blockages, low, high, margin, net)
    }

    pub fn merge_new_edge_blockage(
        &mut self,
        one_end: Point,
        other_end: Point,
        margin: i64,
        net: Option<&str>,
    ) -> TrackBlockage {
        let (low, high) = Self::project_pair_onto_axis(one_end, other_end, self.direction);
        Self::merge_new_blockage(&mut self.blockages.edge_blockages, low, high, margin, net)
    }

    /// Temporary blockages are not merged; each caller must be able to
    /// remove its own independently.
    pub fn add_temporary_vertex_blockage(&mut self, blockage: TrackBlockage) {
        self.temporary_blockages.vertex_blockages.push(blockage);
    }

    pub fn add_temporary_edge_blockage(&mut self, blockage: TrackBlockage) {
        self.temporary_blockages.edge_blockages.push(blockage);
    }

    pub fn remove_temporary_blockage(&mut self, id: u64) -> bool {
        let before = self.temporary_blockages.vertex_blockages.len()
            + self.temporary_blockages.edge_blockages.len();
        self.temporary_blockages
            .vertex_blockages
            .retain(|b| b.id != id);
        self.temporary_blockages
            .edge_blockages
            .retain(|b| b.id != id);
        before
            != self.temporary_blockages.vertex_blockages.len()
                + self.temporary_blockages.edge_blockages.len()
    }

    pub fn clear_temporary_blockages(&mut self) {
        self.temporary_blockages.vertex_blockages.clear();
        self.temporary_blockages.edge_blockages.clear();
    }

    pub fn blockage_blocks_span(
        &self,
        blockage: &TrackBlockage,
        one_end: Point,
        other_end: Point,
        margin: i64,
    ) -> bool {
        self.blockage_blocks(blockage, one_end, other_end, margin)
    }

    fn sort_blockages(container: &mut [TrackBlockage]) {
        container.sort_by(|lhs, rhs| {
            lhs.start
                .cmp(&rhs.start)
                .then(lhs.end.cmp(&rhs.end))
        });
    }

    pub fn describe(&self) -> String {
        format!(
            "{} track on layer {:?} offset={}",
            self.direction, self.layer, self.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> Track {
        Track::new(Layer(0), Direction::Horizontal, 10, 4, 6, 6, 2, 170)
    }

    #[test]
    fn merges_overlapping_same_net_blockages() {
        let mut container = Vec::new();
        Track::merge_new_blockage(&mut container, 0, 100, 1, None);
        Track::merge_new_blockage(&mut container, 50, 150, 1, None);
        assert_eq!(container.len(), 1);
        assert_eq!(container[0].start(), 0);
        assert_eq!(container[0].end(), 150);
    }

    #[test]
    fn keeps_separated_blockages_distinct() {
        let mut container = Vec::new();
        Track::merge_new_blockage(&mut container, 0, 100, 5, None);
        Track::merge_new_blockage(&mut container, 200, 300, 5, None);
        assert_eq!(container.len(), 2);
        // Within the margin they merge.
        Track::merge_new_blockage(&mut container, 102, 150, 5, None);
        assert_eq!(container.len(), 2);
        assert_eq!(container[0].start(), 0);
        assert_eq!(container[0].end(), 150);
    }

    #[test]
    fn never_merges_differing_nets() {
        let mut container = Vec::new();
        Track::merge_new_blockage(&mut container, 0, 100, 1, Some("a"));
        Track::merge_new_blockage(&mut container, 50, 150, 1, Some("b"));
        assert_eq!(container.len(), 2);
        Track::merge_new_blockage(&mut container, 60, 70, 1, None);
        assert_eq!(container.len(), 3);
    }

    #[test]
    fn vertex_blocked_with_net_exception() {
        let mut t = track();
        t.merge_new_vertex_blockage(
            Point::new(0, 170),
            Point::new(100, 170),
            1,
            Some("a"),
        );
        let nets_a = EquivalentNets::from_name("a");
        let nets_b = EquivalentNets::from_name("b");
        assert!(t.is_vertex_blocked(Point::new(50, 170), 1, None));
        assert!(t.is_vertex_blocked(Point::new(50, 170), 1, Some(&nets_b)));
        assert!(!t.is_vertex_blocked(Point::new(50, 170), 1, Some(&nets_a)));
        assert!(!t.is_vertex_blocked(Point::new(200, 170), 1, None));
    }

    #[test]
    fn rect_intersection_by_transverse_distance() {
        let t = track();
        // Track at y=170, min transverse separation = max(4, 6)/2 + 2 = 5.
        assert!(t.intersects_rect(&Rect::new(Point::new(0, 160), Point::new(10, 172)), 0));
        assert!(t.intersects_rect(&Rect::new(Point::new(0, 173), Point::new(10, 180)), 0));
        assert!(!t.intersects_rect(&Rect::new(Point::new(0, 180), Point::new(10, 190)), 0));
    }

    #[test]
    fn temporary_blockages_removed_by_id() {
        let mut t = track();
        t.add_temporary_vertex_blockage(TrackBlockage::with_id(0, 10, None, 7));
        assert!(t.is_vertex_blocked(Point::new(5, 170), 1, None));
        assert!(t.remove_temporary_blockage(7));
        assert!(!t.is_vertex_blocked(Point::new(5, 170), 1, None));
        assert!(!t.remove_temporary_blockage(7));
    }
}
