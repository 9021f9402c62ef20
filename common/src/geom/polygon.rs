use super::line::Line;
use super::point::Point;
use super::rect::Rect;
use serde::{Deserialize, Serialize};

/// A simple polygon given by its boundary vertices in order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Polygon {
    vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn bounding_box(&self) -> Rect {
        let mut min = Point::new(i64::MAX, i64::MAX);
        let mut max = Point::new(i64::MIN, i64::MIN);
        for v in &self.vertices {
            min.x = min.x.min(v.x);
            min.y = min.y.min(v.y);
            max.x = max.x.max(v.x);
            max.y = max.y.max(v.y);
        }
        Rect::new(min, max)
    }

    /// Even-odd point containment. Points on the boundary count as inside.
    pub fn contains(&self, p: Point) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            if point_on_segment(p, a, b) {
                return true;
            }
            if (a.y > p.y) != (b.y > p.y) {
                let t = (p.y - a.y) as f64 / (b.y - a.y) as f64;
                let x = a.x as f64 + t * (b.x - a.x) as f64;
                if (p.x as f64) < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Intersections of an axis-parallel line with the polygon interior,
    /// returned as ordered pairs of crossing points along the line. Each pair
    /// spans one run of the line inside the polygon.
    pub fn intersecting_points(&self, line: &Line) -> Vec<(Point, Point)> {
        let n = self.vertices.len();
        if n < 3 {
            return Vec::new();
        }
        let mut crossings: Vec<i64> = Vec::new();
        if line.is_horizontal() {
            let y = line.start().y;
            for i in 0..n {
                let a = self.vertices[i];
                let b = self.vertices[(i + 1) % n];
                if (a.y > y) != (b.y > y) {
                    let t = (y - a.y) as f64 / (b.y - a.y) as f64;
                    crossings.push((a.x as f64 + t * (b.x - a.x) as f64).round() as i64);
                }
            }
            crossings.sort_unstable();
            crossings
                .chunks_exact(2)
                .map(|pair| (Point::new(pair[0], y), Point::new(pair[1], y)))
                .collect()
        } else if line.is_vertical() {
            let x = line.start().x;
            for i in 0..n {
                let a = self.vertices[i];
                let b = self.vertices[(i + 1) % n];
                if (a.x > x) != (b.x > x) {
                    let t = (x - a.x) as f64 / (b.x - a.x) as f64;
                    crossings.push((a.y as f64 + t * (b.y - a.y) as f64).round() as i64);
                }
            }
            crossings.sort_unstable();
            crossings
                .chunks_exact(2)
                .map(|pair| (Point::new(x, pair[0]), Point::new(x, pair[1])))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Overlap test against a rectangle: containment either way or any
    /// boundary crossing.
    pub fn overlaps_rect(&self, rect: &Rect) -> bool {
        if !self.bounding_box().overlaps(rect) {
            return false;
        }
        if self.contains(rect.lower_left())
            || self.contains(rect.upper_right())
            || self.contains(Point::new(rect.lower_left().x, rect.upper_right().y))
            || self.contains(Point::new(rect.upper_right().x, rect.lower_left().y))
        {
            return true;
        }
        if !self.vertices.is_empty() && rect.contains(self.vertices[0]) {
            return true;
        }
        let n = self.vertices.len();
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            if segment_intersects_rect(a, b, rect) {
                return true;
            }
        }
        false
    }
}

fn point_on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross != 0 {
        return false;
    }
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Cohen-Sutherland style reject test, then endpoint/edge checks.
fn segment_intersects_rect(a: Point, b: Point, rect: &Rect) -> bool {
    if rect.contains(a) || rect.contains(b) {
        return true;
    }
    let ll = rect.lower_left();
    let ur = rect.upper_right();
    let corners = [
        ll,
        Point::new(ur.x, ll.y),
        ur,
        Point::new(ll.x, ur.y),
    ];
    for i in 0..4 {
        if segments_intersect(a, b, corners[i], corners[(i + 1) % 4]) {
            return true;
        }
    }
    false
}

fn orientation(a: Point, b: Point, c: Point) -> i64 {
    ((b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)).signum()
}

fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let o1 = orientation(p1, p2, q1);
    let o2 = orientation(p1, p2, q2);
    let o3 = orientation(q1, q2, p1);
    let o4 = orientation(q1, q2, p2);
    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == 0 && point_on_segment(q1, p1, p2))
        || (o2 == 0 && point_on_segment(q2, p1, p2))
        || (o3 == 0 && point_on_segment(p1, q1, q2))
        || (o4 == 0 && point_on_segment(p2, q1, q2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l_shape() -> Polygon {
        // An L: (0,0)-(20,0)-(20,10)-(10,10)-(10,20)-(0,20)
        Polygon::new(vec![
            Point::new(0, 0),
            Point::new(20, 0),
            Point::new(20, 10),
            Point::new(10, 10),
            Point::new(10, 20),
            Point::new(0, 20),
        ])
    }

    #[test]
    fn contains() {
        let p = l_shape();
        assert!(p.contains(Point::new(5, 5)));
        assert!(p.contains(Point::new(15, 5)));
        assert!(!p.contains(Point::new(15, 15)));
        assert!(p.contains(Point::new(0, 0)));
    }

    #[test]
    fn horizontal_scan() {
        let p = l_shape();
        let spans =
            p.intersecting_points(&Line::new(Point::new(-100, 5), Point::new(100, 5)));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], (Point::new(0, 5), Point::new(20, 5)));

        let spans =
            p.intersecting_points(&Line::new(Point::new(-100, 15), Point::new(100, 15)));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], (Point::new(0, 15), Point::new(10, 15)));
    }

    #[test]
    fn rect_overlap() {
        let p = l_shape();
        assert!(p.overlaps_rect(&Rect::new(Point::new(5, 5), Point::new(8, 8))));
        assert!(p.overlaps_rect(&Rect::new(Point::new(-5, -5), Point::new(50, 50))));
        assert!(!p.overlaps_rect(&Rect::new(Point::new(12, 12), Point::new(18, 18))));
    }
}
