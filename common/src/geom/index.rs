use super::point::Point;
use rstar::{AABB, PointDistance, RTree, RTreeObject};

/// Spatial index over labelled points, used to find off-grid routing
/// vertices within a radius of a query point.
pub struct PointIndex {
    tree: RTree<IndexedPoint>,
}

#[derive(Clone, Copy, PartialEq)]
struct IndexedPoint {
    position: [i64; 2],
    id: usize,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[i64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[i64; 2]) -> i64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        dx * dx + dy * dy
    }
}

impl PointIndex {
    pub fn new() -> Self {
        Self { tree: RTree::new() }
    }

    pub fn insert(&mut self, at: Point, id: usize) {
        self.tree.insert(IndexedPoint {
            position: [at.x, at.y],
            id,
        });
    }

    pub fn remove(&mut self, at: Point, id: usize) -> bool {
        self.tree
            .remove(&IndexedPoint {
                position: [at.x, at.y],
                id,
            })
            .is_some()
    }

    /// Ids of all points within L2 distance `radius` of `reference`.
    pub fn find_nearby(&self, reference: Point, radius: i64) -> Vec<usize> {
        self.tree
            .locate_within_distance([reference.x, reference.y], radius * radius)
            .map(|item| item.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

impl Default for PointIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_query() {
        let mut index = PointIndex::new();
        index.insert(Point::new(0, 0), 1);
        index.insert(Point::new(10, 0), 2);
        index.insert(Point::new(100, 100), 3);

        let mut near = index.find_nearby(Point::new(0, 0), 15);
        near.sort_unstable();
        assert_eq!(near, vec![1, 2]);

        assert!(index.remove(Point::new(10, 0), 2));
        let near = index.find_nearby(Point::new(10, 0), 5);
        assert!(near.is_empty());
    }
}
