use crate::error::{Result, RouterError};
use crate::graph::{TrackId, VertexId};
use crate::rules::LayerInfo;
use gridroute_common::geom::{Line, Point, Polygon, Rect};
use gridroute_common::tech::Layer;
use std::collections::BTreeSet;

/// Pure index math for one connected pair of orthogonal layers: maps
/// continuous coordinates to discrete (column, row) track indices and
/// back, and bounds the vertex windows affected by shapes.
#[derive(Clone, Debug, Default)]
pub struct GridGeometry {
    x_offset: i64,
    x_pitch: i64,
    x_min: i64,
    x_max: i64,
    x_start: i64,
    max_column_index: i64,

    y_offset: i64,
    y_pitch: i64,
    y_min: i64,
    y_max: i64,
    y_start: i64,
    max_row_index: i64,

    horizontal_layer: Layer,
    vertical_layer: Layer,

    /// Vertex ids arranged by [column][row]; owned by the grid.
    vertices_by_grid_position: Vec<Vec<Option<VertexId>>>,
    horizontal_tracks_by_index: Vec<TrackId>,
    vertical_tracks_by_index: Vec<TrackId>,
}

impl GridGeometry {
    /// Computes the valid index ranges from the overlap of the two
    /// layers' routing areas. A degenerate pitch is a configuration
    /// error, surfaced before any graph construction happens.
    pub fn compute_for_layers(
        horizontal_info: &LayerInfo,
        vertical_info: &LayerInfo,
    ) -> Result<Self> {
        if vertical_info.pitch == 0 {
            return Err(RouterError::Config(format!(
                "routing pitch for layer {:?} is 0",
                vertical_info.layer
            )));
        }
        if horizontal_info.pitch == 0 {
            return Err(RouterError::Config(format!(
                "routing pitch for layer {:?} is 0",
                horizontal_info.layer
            )));
        }

        let overlap = horizontal_info.area.overlap_with(&vertical_info.area);
        log::info!(
            "layers {:?}, {:?} overlap on {}",
            horizontal_info.layer,
            vertical_info.layer,
            overlap
        );

        // The offset is relative to the start of the routing area bounds.
        let x_offset = vertical_info.offset;
        let x_pitch = vertical_info.pitch;
        let x_min = overlap.lower_left().x;
        let x_start = x_min + x_offset;
        let x_max = overlap.upper_right().x;
        let max_column_index = (x_max - x_start) / x_pitch;

        let y_offset = horizontal_info.offset;
        let y_pitch = horizontal_info.pitch;
        let y_min = overlap.lower_left().y;
        let y_start = y_min + y_offset;
        let y_max = overlap.upper_right().y;
        let max_row_index = (y_max - y_start) / y_pitch;

        if max_column_index < 0 || max_row_index < 0 {
            return Err(RouterError::Config(format!(
                "layers {:?} and {:?} have no routable overlap",
                horizontal_info.layer, vertical_info.layer
            )));
        }

        Ok(Self {
            x_offset,
            x_pitch,
            x_min,
            x_max,
            x_start,
            max_column_index,
            y_offset,
            y_pitch,
            y_min,
            y_max,
            y_start,
            max_row_index,
            horizontal_layer: horizontal_info.layer,
            vertical_layer: vertical_info.layer,
            vertices_by_grid_position: vec![
                vec![None; (max_row_index + 1) as usize];
                (max_column_index + 1) as usize
            ],
            horizontal_tracks_by_index: Vec::new(),
            vertical_tracks_by_index: Vec::new(),
        })
    }

    pub fn horizontal_layer(&self) -> Layer {
        self.horizontal_layer
    }

    pub fn vertical_layer(&self) -> Layer {
        self.vertical_layer
    }

    pub fn uses_layer(&self, layer: Layer) -> bool {
        self.horizontal_layer == layer || self.vertical_layer == layer
    }

    pub fn x_pitch(&self) -> i64 {
        self.x_pitch
    }

    pub fn y_pitch(&self) -> i64 {
        self.y_pitch
    }

    pub fn x_offset(&self) -> i64 {
        self.x_offset
    }

    pub fn y_offset(&self) -> i64 {
        self.y_offset
    }

    pub fn x_start(&self) -> i64 {
        self.x_start
    }

    pub fn y_start(&self) -> i64 {
        self.y_start
    }

    pub fn x_max(&self) -> i64 {
        self.x_max
    }

    pub fn y_max(&self) -> i64 {
        self.y_max
    }

    pub fn max_column_index(&self) -> i64 {
        self.max_column_index
    }

    pub fn max_row_index(&self) -> i64 {
        self.max_row_index
    }

    pub fn column_coordinate(&self, column_index: i64) -> i64 {
        self.x_start + self.x_pitch * column_index
    }

    pub fn row_coordinate(&self, row_index: i64) -> i64 {
        self.y_start + self.y_pitch * row_index
    }

    pub fn point_at(&self, column_index: i64, row_index: i64) -> Point {
        Point::new(
            self.column_coordinate(column_index),
            self.row_coordinate(row_index),
        )
    }

    pub fn horizontal_line_through(&self, row_index: i64) -> Line {
        let y = self.row_coordinate(row_index);
        Line::new(Point::new(self.x_min, y), Point::new(self.x_max, y))
    }

    pub fn vertical_line_through(&self, column_index: i64) -> Line {
        let x = self.column_coordinate(column_index);
        Line::new(Point::new(x, self.y_min), Point::new(x, self.y_max))
    }

    pub fn horizontal_tracks_by_index(&self) -> &[TrackId] {
        &self.horizontal_tracks_by_index
    }

    pub fn vertical_tracks_by_index(&self) -> &[TrackId] {
        &self.vertical_tracks_by_index
    }

    pub fn push_horizontal_track(&mut self, track: TrackId) {
        self.horizontal_tracks_by_index.push(track);
    }

    pub fn push_vertical_track(&mut self, track: TrackId) {
        self.vertical_tracks_by_index.push(track);
    }

    /// Unclamped bounding indices of the point on an infinite grid.
    fn unbounded_indices(&self, point: Point) -> (i64, i64, i64, i64) {
        let column_lower =
            ((point.x - self.x_start) as f64 / self.x_pitch as f64).floor() as i64;
        let column_upper =
            ((point.x - self.x_start) as f64 / self.x_pitch as f64).ceil() as i64;
        let row_lower = ((point.y - self.y_start) as f64 / self.y_pitch as f64).floor() as i64;
        let row_upper = ((point.y - self.y_start) as f64 / self.y_pitch as f64).ceil() as i64;
        (column_lower, column_upper, row_lower, row_upper)
    }

    pub fn map_point_to_bounding_indices(&self, point: Point) -> (i64, i64, i64, i64) {
        self.unbounded_indices(point)
    }

    pub fn map_rect_to_bounding_indices(&self, rect: &Rect) -> (i64, i64, i64, i64) {
        let (column_lower, _, row_lower, _) = self.unbounded_indices(rect.lower_left());
        let (_, column_upper, _, row_upper) = self.unbounded_indices(rect.upper_right());
        (column_lower, column_upper, row_lower, row_upper)
    }

    pub fn map_polygon_to_bounding_indices(&self, polygon: &Polygon) -> (i64, i64, i64, i64) {
        self.map_rect_to_bounding_indices(&polygon.bounding_box())
    }

    /// Clamps indices to the valid range, pushing the window out by
    /// `num_concentric_layers` - 1 additional rings.
    pub fn bound_grid_indices(
        &self,
        num_concentric_layers: i64,
        column_lower: &mut i64,
        column_upper: &mut i64,
        row_lower: &mut i64,
        row_upper: &mut i64,
    ) {
        let rings = num_concentric_layers - 1;
        *column_lower = (*column_lower - rings).clamp(0, self.max_column_index);
        *column_upper = (*column_upper + rings).clamp(0, self.max_column_index);
        *row_lower = (*row_lower - rings).clamp(0, self.max_row_index);
        *row_upper = (*row_upper + rings).clamp(0, self.max_row_index);
    }

    /// The minimal index window guaranteed to contain every vertex within
    /// `padding` of the point, expanded by concentric rings. Points
    /// outside the valid area clamp to the boundary.
    pub fn enveloping_vertex_indices_for_point(
        &self,
        point: Point,
        padding: i64,
        num_concentric_layers: i64,
    ) -> BTreeSet<(i64, i64)> {
        if padding != 0 {
            let keep_out = Rect::centred_on(point, 2 * padding, 2 * padding);
            return self.enveloping_vertex_indices_for_rect(
                &keep_out,
                0,
                num_concentric_layers,
            );
        }
        let (mut column_lower, mut column_upper, mut row_lower, mut row_upper) =
            self.unbounded_indices(point);
        // On-pitch points produce no spread; widen to the neighbours.
        if column_upper == column_lower {
            column_lower = (column_lower - 1).clamp(0, self.max_column_index);
            column_upper = (column_upper + 1).clamp(0, self.max_column_index);
        }
        if row_upper == row_lower {
            row_lower = (row_lower - 1).clamp(0, self.max_row_index);
            row_upper = (row_upper + 1).clamp(0, self.max_row_index);
        }
        self.bound_grid_indices(
            num_concentric_layers,
            &mut column_lower,
            &mut column_upper,
            &mut row_lower,
            &mut row_upper,
        );
        Self::window(column_lower, column_upper, row_lower, row_upper)
    }

    pub fn enveloping_vertex_indices_for_rect(
        &self,
        rect: &Rect,
        padding: i64,
        num_concentric_layers: i64,
    ) -> BTreeSet<(i64, i64)> {
        let mut column_lower = ((rect.lower_left().x - padding - self.x_start) as f64
            / self.x_pitch as f64)
            .floor() as i64;
        let mut row_lower = ((rect.lower_left().y - padding - self.y_start) as f64
            / self.y_pitch as f64)
            .floor() as i64;
        let mut column_upper = ((rect.upper_right().x + padding - self.x_start) as f64
            / self.x_pitch as f64)
            .ceil() as i64;
        let mut row_upper = ((rect.upper_right().y + padding - self.y_start) as f64
            / self.y_pitch as f64)
            .ceil() as i64;
        self.bound_grid_indices(
            num_concentric_layers,
            &mut column_lower,
            &mut column_upper,
            &mut row_lower,
            &mut row_upper,
        );
        Self::window(column_lower, column_upper, row_lower, row_upper)
    }

    pub fn enveloping_vertex_indices_for_polygon(
        &self,
        polygon: &Polygon,
        padding: i64,
        num_concentric_layers: i64,
    ) -> BTreeSet<(i64, i64)> {
        self.enveloping_vertex_indices_for_rect(
            &polygon.bounding_box(),
            padding,
            num_concentric_layers,
        )
    }

    fn window(
        column_lower: i64,
        column_upper: i64,
        row_lower: i64,
        row_upper: i64,
    ) -> BTreeSet<(i64, i64)> {
        let mut indices = BTreeSet::new();
        for i in column_lower..=column_upper {
            for j in row_lower..=row_upper {
                indices.insert((i, j));
            }
        }
        indices
    }

    /// Horizontal and vertical track indices nearest the point, expanded
    /// by concentric rings.
    pub fn nearest_track_indices(
        &self,
        point: Point,
        num_concentric_layers: i64,
    ) -> (BTreeSet<i64>, BTreeSet<i64>) {
        let (mut column_lower, mut column_upper, mut row_lower, mut row_upper) =
            self.unbounded_indices(point);
        self.bound_grid_indices(
            num_concentric_layers,
            &mut column_lower,
            &mut column_upper,
            &mut row_lower,
            &mut row_upper,
        );
        let mut horizontal = BTreeSet::new();
        let mut vertical = BTreeSet::new();
        for j in row_lower..=row_upper {
            horizontal.insert(j);
        }
        for i in column_lower..=column_upper {
            vertical.insert(i);
        }
        (horizontal, vertical)
    }

    /// Tracks surrounding the point within `num_concentric_layers` rings.
    pub fn nearest_tracks(
        &self,
        point: Point,
        num_concentric_layers: i64,
    ) -> BTreeSet<TrackId> {
        let (horizontal, vertical) = self.nearest_track_indices(point, num_concentric_layers);
        let mut tracks = BTreeSet::new();
        for index in horizontal {
            if let Some(&track) = self.horizontal_tracks_by_index.get(index as usize) {
                tracks.insert(track);
            }
        }
        for index in vertical {
            if let Some(&track) = self.vertical_tracks_by_index.get(index as usize) {
                tracks.insert(track);
            }
        }
        tracks
    }

    pub fn assign_vertex_at(&mut self, column_index: i64, row_index: i64, vertex: VertexId) {
        assert!(
            column_index >= 0 && column_index <= self.max_column_index,
            "column index {} out of bounds (max: {})",
            column_index,
            self.max_column_index
        );
        assert!(
            row_index >= 0 && row_index <= self.max_row_index,
            "row index {} out of bounds (max: {})",
            row_index,
            self.max_row_index
        );
        self.vertices_by_grid_position[column_index as usize][row_index as usize] = Some(vertex);
    }

    pub fn vertex_at_indices(&self, column_index: i64, row_index: i64) -> Option<VertexId> {
        if column_index < 0
            || column_index > self.max_column_index
            || row_index < 0
            || row_index > self.max_row_index
        {
            return None;
        }
        self.vertices_by_grid_position[column_index as usize][row_index as usize]
    }

    /// The on-grid vertex at exactly this point, if any.
    pub fn vertex_at(&self, point: Point) -> Option<VertexId> {
        let (column_lower, column_upper, row_lower, row_upper) = self.unbounded_indices(point);
        if column_lower != column_upper || row_lower != row_upper {
            return None;
        }
        self.vertex_at_indices(column_lower, row_lower)
    }

    /// Vertex ids inside the index window of a shape.
    pub fn vertices_in_window(
        &self,
        indices: &BTreeSet<(i64, i64)>,
    ) -> Vec<VertexId> {
        indices
            .iter()
            .filter_map(|&(i, j)| self.vertex_at_indices(i, j))
            .collect()
    }

    /// Candidate new-vertex positions where tracks cross the shape,
    /// grouped by track. Used to give blockage shapes with nets off-grid
    /// connection points.
    pub fn candidate_vertex_positions_on_crossed_tracks(
        &self,
        polygon: &Polygon,
    ) -> Vec<(TrackId, Vec<Point>)> {
        let (mut i_lower, mut i_upper, mut j_lower, mut j_upper) =
            self.map_polygon_to_bounding_indices(polygon);
        self.bound_grid_indices(1, &mut i_lower, &mut i_upper, &mut j_lower, &mut j_upper);

        let mut positions = Vec::new();
        for i in i_lower..=i_upper {
            let Some(&track) = self.vertical_tracks_by_index.get(i as usize) else {
                continue;
            };
            let line = self.vertical_line_through(i);
            let points: Vec<Point> = polygon
                .intersecting_points(&line)
                .into_iter()
                .map(|(a, b)| Point::new(a.x, (a.y + b.y) / 2))
                .collect();
            if !points.is_empty() {
                positions.push((track, points));
            }
        }
        for j in j_lower..=j_upper {
            let Some(&track) = self.horizontal_tracks_by_index.get(j as usize) else {
                continue;
            };
            let line = self.horizontal_line_through(j);
            let points: Vec<Point> = polygon
                .intersecting_points(&line)
                .into_iter()
                .map(|(a, b)| Point::new((a.x + b.x) / 2, a.y))
                .collect();
            if !points.is_empty() {
                positions.push((track, points));
            }
        }
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Direction;

    fn layer_info(layer: Layer, direction: Direction, pitch: i64, offset: i64) -> LayerInfo {
        LayerInfo {
            layer,
            area: Rect::new(Point::new(0, 0), Point::new(200, 200)),
            wire_width: 4,
            offset,
            direction,
            pitch,
            min_separation: 2,
        }
    }

    fn geometry() -> GridGeometry {
        GridGeometry::compute_for_layers(
            &layer_info(Layer(0), Direction::Horizontal, 10, 10),
            &layer_info(Layer(1), Direction::Vertical, 10, 10),
        )
        .unwrap()
    }

    #[test]
    fn zero_pitch_is_a_configuration_error() {
        let result = GridGeometry::compute_for_layers(
            &layer_info(Layer(0), Direction::Horizontal, 0, 0),
            &layer_info(Layer(1), Direction::Vertical, 10, 0),
        );
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[test]
    fn index_ranges() {
        let g = geometry();
        // Tracks at 10, 20, ..., 200: indices 0..=19.
        assert_eq!(g.max_column_index(), 19);
        assert_eq!(g.max_row_index(), 19);
        assert_eq!(g.column_coordinate(0), 10);
        assert_eq!(g.row_coordinate(19), 200);
        assert_eq!(g.point_at(3, 4), Point::new(40, 50));
    }

    #[test]
    fn enveloping_point_off_grid() {
        let g = geometry();
        let window = g.enveloping_vertex_indices_for_point(Point::new(25, 35), 0, 1);
        let expected: BTreeSet<(i64, i64)> =
            [(1, 2), (1, 3), (2, 2), (2, 3)].into_iter().collect();
        assert_eq!(window, expected);
    }

    #[test]
    fn enveloping_point_on_grid_widens() {
        let g = geometry();
        // (30, 30) is exactly on the grid; the window includes both
        // neighbours in each axis.
        let window = g.enveloping_vertex_indices_for_point(Point::new(30, 30), 0, 1);
        assert_eq!(window.len(), 9);
        assert!(window.contains(&(1, 1)));
        assert!(window.contains(&(3, 3)));
    }

    #[test]
    fn enveloping_point_outside_clamps_to_boundary() {
        let g = geometry();
        let window = g.enveloping_vertex_indices_for_point(Point::new(-50, -50), 0, 1);
        assert_eq!(window, [(0, 0)].into_iter().collect());
        let window = g.enveloping_vertex_indices_for_point(Point::new(500, 105), 0, 1);
        let expected: BTreeSet<(i64, i64)> = [(19, 9), (19, 10)].into_iter().collect();
        assert_eq!(window, expected);
    }

    #[test]
    fn concentric_rings_expand_window() {
        let g = geometry();
        let window = g.enveloping_vertex_indices_for_point(Point::new(25, 35), 0, 2);
        // 4x4 window once expanded by one ring.
        assert_eq!(window.len(), 16);
        assert!(window.contains(&(0, 1)));
        assert!(window.contains(&(3, 4)));
    }

    #[test]
    fn enveloping_rect_with_padding() {
        let g = geometry();
        let rect = Rect::new(Point::new(25, 25), Point::new(35, 35));
        let window = g.enveloping_vertex_indices_for_rect(&rect, 10, 1);
        // Padded rect spans [15, 45]: indices 0..=4 in each axis...
        assert!(window.contains(&(0, 0)));
        assert!(window.contains(&(4, 4)));
        assert_eq!(window.len(), 25);
    }

    #[test]
    fn nearest_track_indices_on_and_off_grid() {
        let g = geometry();
        let (horizontal, vertical) = g.nearest_track_indices(Point::new(30, 30), 1);
        assert_eq!(horizontal, [2].into_iter().collect());
        assert_eq!(vertical, [2].into_iter().collect());
        let (horizontal, vertical) = g.nearest_track_indices(Point::new(34, 30), 1);
        assert_eq!(horizontal, [2].into_iter().collect());
        assert_eq!(vertical, [2, 3].into_iter().collect());
    }

    #[test]
    fn vertex_assignment_round_trip() {
        let mut g = geometry();
        let id = VertexId::new(7);
        g.assign_vertex_at(3, 4, id);
        assert_eq!(g.vertex_at_indices(3, 4), Some(id));
        assert_eq!(g.vertex_at(Point::new(40, 50)), Some(id));
        assert_eq!(g.vertex_at(Point::new(41, 50)), None);
        assert_eq!(g.vertex_at_indices(25, 4), None);
    }
}
