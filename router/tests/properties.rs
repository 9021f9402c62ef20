//! End-to-end properties of the routing engine: search optimality,
//! installation effects, blockage-cache parity and round trips, and
//! order consolidation/dispatch.

use gridroute_common::geom::{Point, Polygon, Rect};
use gridroute_common::tech::Layer;
use gridroute_common::util::config::RouterConfig;
use gridroute_router::blockage::{BlockageCache, GridBlockage, Shape};
use gridroute_router::graph::VertexId;
use gridroute_router::grid::{Grid, Terminal};
use gridroute_router::manager::{PairOutcome, RouteManager};
use gridroute_router::nets::EquivalentNets;
use gridroute_router::rules::{Direction, LayerInfo, ViaEncap, ViaInfo};

const H: Layer = Layer(0);
const V: Layer = Layer(1);

fn layer_info(layer: Layer, direction: Direction, span: i64, pitch: i64, offset: i64) -> LayerInfo {
    LayerInfo {
        layer,
        area: Rect::new(Point::new(0, 0), Point::new(span, span)),
        wire_width: 2,
        offset,
        direction,
        pitch,
        min_separation: 1,
    }
}

fn small_via() -> ViaInfo {
    let mut via = ViaInfo::new(H, V, 2, 2, 1.0);
    let encap = ViaEncap {
        overhang_length: 1,
        overhang_width: 1,
    };
    via.set_encap(H, encap);
    via.set_encap(V, encap);
    via
}

/// A pitch-10 grid over (0,0)-(span,span) with tracks offset by 10.
fn build_grid(span: i64) -> Grid {
    let mut grid = Grid::new(RouterConfig::default());
    grid.add_layer_info(layer_info(H, Direction::Horizontal, span, 10, 10))
        .unwrap();
    grid.add_layer_info(layer_info(V, Direction::Vertical, span, 10, 10))
        .unwrap();
    grid.add_via_info(H, V, small_via()).unwrap();
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

fn terminal(net: &str, x: i64, y: i64) -> Terminal {
    Terminal {
        centre: Point::new(x, y),
        layer: H,
        net: net.to_string(),
    }
}

// -------------------------------------------------------------------
// Property 1: shortest_path returns the cheapest simple path and its
// reported cost is the sum of its parts.
// -------------------------------------------------------------------

fn enumerate_simple_path_costs(
    grid: &Grid,
    current: VertexId,
    end: VertexId,
    visited: &mut Vec<VertexId>,
    cost_so_far: f64,
    costs: &mut Vec<f64>,
) {
    if current == end {
        costs.push(cost_so_far);
        return;
    }
    for &edge_id in grid.graph().vertex(current).edges() {
        let edge = grid.graph().edge(edge_id);
        let next = edge.other_vertex_than(current);
        if visited.contains(&next) {
            continue;
        }
        visited.push(next);
        enumerate_simple_path_costs(
            grid,
            next,
            end,
            visited,
            cost_so_far + edge.cost() + grid.graph().vertex(next).cost(),
            costs,
        );
        visited.pop();
    }
}

#[test]
fn shortest_path_is_optimal_among_simple_paths() {
    let grid = build_grid(30); // 3x3 lattice.
    let begin = vertex_at(&grid, 10, 10);
    let end = vertex_at(&grid, 30, 30);

    let cache = BlockageCache::new(&grid);
    let nets = EquivalentNets::from_name("n1");
    let path = grid.shortest_path(begin, end, &cache, &nets).unwrap();

    // The reported cost is exactly the sum of edge and vertex costs.
    let recomputed: f64 = path
        .edges()
        .iter()
        .map(|&e| grid.graph().edge(e).cost())
        .sum::<f64>()
        + path.vertices()[1..]
            .iter()
            .map(|&v| grid.graph().vertex(v).cost())
            .sum::<f64>();
    assert!((path.cost(&grid) - recomputed).abs() < 1e-9);

    // No other simple path is cheaper.
    let mut costs = Vec::new();
    let mut visited = vec![begin];
    enumerate_simple_path_costs(&grid, begin, end, &mut visited, 0.0, &mut costs);
    let best = costs.iter().cloned().fold(f64::INFINITY, f64::min);
    assert!(!costs.is_empty());
    assert!(path.cost(&grid) <= best + 1e-9);
}

// -------------------------------------------------------------------
// Property 2: installation flips availability for exactly the touched
// entities.
// -------------------------------------------------------------------

#[test]
fn install_makes_touched_entities_unavailable_and_leaves_the_rest() {
    let mut grid = build_grid(200);

    let untouched_vertices: Vec<VertexId> = grid
        .graph()
        .vertex_ids()
        .filter(|&v| grid.graph().vertex(v).centre().y >= 100)
        .collect();

    let nets = EquivalentNets::from_name("n1");
    let index = grid
        .add_route_between(
            &terminal("n1", 10, 10),
            &terminal("n1", 80, 10),
            &[],
            &nets,
        )
        .unwrap();

    let path = grid.paths()[index].clone();
    for &vertex in path.vertices() {
        assert!(!grid.graph().vertex(vertex).available());
    }
    for &edge in path.edges() {
        assert!(!grid.graph().edge(edge).available());
    }
    // Vertices well away from the route are untouched.
    for vertex in untouched_vertices {
        assert!(grid.graph().vertex(vertex).available());
    }
}

// -------------------------------------------------------------------
// Property 3: adding then cancelling a blockage in a cache restores
// every blocked status to its pre-blockage value.
// -------------------------------------------------------------------

#[test]
fn cache_blockage_cancel_round_trip() {
    let grid = build_grid(100);
    let nets = EquivalentNets::new();

    let vertices: Vec<VertexId> = grid.graph().vertex_ids().collect();
    let edges: Vec<_> = grid.graph().edge_ids().collect();

    let mut cache = BlockageCache::new(&grid);
    let baseline_vertices: Vec<bool> = vertices
        .iter()
        .map(|&v| cache.is_vertex_blocked(v, &nets, None, None))
        .collect();
    let baseline_edges: Vec<bool> = edges
        .iter()
        .map(|&e| cache.is_edge_blocked(e, &nets))
        .collect();

    let shape = Shape::rect(Rect::new(Point::new(30, 30), Point::new(60, 60)), H);
    cache.add_blockage(shape.clone(), 5);

    let blocked_count = vertices
        .iter()
        .filter(|&&v| cache.is_vertex_blocked(v, &nets, None, None))
        .count();
    assert!(blocked_count > 0);
    let inside = vertex_at(&grid, 40, 40);
    assert!(!cache.available_for_all_vertex(inside, &nets));

    cache.cancel_blockage(&shape);
    for (index, &vertex) in vertices.iter().enumerate() {
        assert_eq!(
            cache.is_vertex_blocked(vertex, &nets, None, None),
            baseline_vertices[index]
        );
    }
    for (index, &edge) in edges.iter().enumerate() {
        assert_eq!(cache.is_edge_blocked(edge, &nets), baseline_edges[index]);
    }
}

#[test]
fn child_cache_cancels_parent_blockage_without_mutating_it() {
    let grid = build_grid(100);
    let nets = EquivalentNets::new();
    let probe = vertex_at(&grid, 50, 50);

    let shape = Shape::rect(Rect::new(Point::new(40, 40), Point::new(60, 60)), H);
    let mut root = BlockageCache::new(&grid);
    root.add_blockage(shape.clone(), 0);
    assert!(root.is_vertex_blocked(probe, &nets, None, None));

    let mut child = BlockageCache::with_parent(&grid, &root);
    assert!(child.is_vertex_blocked(probe, &nets, None, None));
    child.cancel_blockage(&shape);
    assert!(!child.is_vertex_blocked(probe, &nets, None, None));
    // The parent still reports the blockage.
    assert!(root.is_vertex_blocked(probe, &nets, None, None));
}

// -------------------------------------------------------------------
// Property 4: cache results agree with direct per-vertex intersection
// tests, for rectangles, polygons, and direction-restricted queries.
// -------------------------------------------------------------------

fn assert_cache_parity(grid: &Grid, shape: Shape, padding: i64) {
    let nets = EquivalentNets::new();
    let mut cache = BlockageCache::new(grid);
    cache.add_blockage(shape.clone(), padding);
    let reference = GridBlockage::new(shape, padding);

    for vertex in grid.graph().vertex_ids() {
        let centre = grid.graph().vertex(vertex).centre();
        for direction in [Direction::Horizontal, Direction::Vertical] {
            let expected = reference.intersects_point(centre)
                || reference.blocks_vertex(grid, vertex, None, Some(direction));
            let actual = cache.is_vertex_blocked(vertex, &nets, Some(direction), None);
            assert_eq!(
                actual, expected,
                "direction {:?} mismatch at {}",
                direction, centre
            );
        }
        let expected_any = reference.intersects_point(centre)
            || reference.blocks_vertex(grid, vertex, None, Some(Direction::Horizontal))
            || reference.blocks_vertex(grid, vertex, None, Some(Direction::Vertical));
        let actual_any = cache.is_vertex_blocked(vertex, &nets, None, None);
        assert_eq!(actual_any, expected_any, "any-direction mismatch at {}", centre);
    }
}

#[test]
fn cache_matches_ground_truth_for_rectangles() {
    let grid = build_grid(100);
    assert_cache_parity(
        &grid,
        Shape::rect(Rect::new(Point::new(25, 35), Point::new(55, 48)), H),
        4,
    );
}

#[test]
fn cache_matches_ground_truth_for_polygons() {
    let grid = build_grid(100);
    let polygon = Polygon::new(vec![
        Point::new(20, 20),
        Point::new(70, 20),
        Point::new(70, 50),
        Point::new(45, 50),
        Point::new(45, 80),
        Point::new(20, 80),
    ]);
    assert_cache_parity(&grid, Shape::polygon(polygon, V), 3);
}

// -------------------------------------------------------------------
// Property 7: the horizontal-track blockage scenario. A slab crossing
// the y=170 track kills its vertices outright; the next track up keeps
// its vertices but only with horizontal via access.
// -------------------------------------------------------------------

#[test]
fn slab_blockage_blocks_one_track_and_restricts_the_next() {
    let mut grid = Grid::new(RouterConfig::default());
    let span = 2000;
    let mut horizontal = layer_info(H, Direction::Horizontal, span, 340, 170);
    horizontal.wire_width = 140;
    horizontal.min_separation = 140;
    let mut vertical = layer_info(V, Direction::Vertical, span, 340, 170);
    vertical.wire_width = 140;
    vertical.min_separation = 140;
    grid.add_layer_info(horizontal).unwrap();
    grid.add_layer_info(vertical).unwrap();

    let mut via = ViaInfo::new(H, V, 170, 170, 1.0);
    let encap = ViaEncap {
        overhang_length: 200,
        overhang_width: 20,
    };
    via.set_encap(H, encap);
    via.set_encap(V, encap);
    grid.add_via_info(H, V, via).unwrap();
    grid.connect_layers(H, V).unwrap();

    let shape = Shape::rect(Rect::new(Point::new(0, -240), Point::new(1500, 240)), H);
    grid.add_blockage(shape.clone(), 0);

    // Vertices on the y=170 track inside the slab are fully blocked.
    for x in (170..=1360).step_by(340) {
        let vertex = vertex_at(&grid, x, 170);
        assert!(
            !grid.graph().vertex(vertex).available(),
            "vertex at ({}, 170) should be blocked",
            x
        );
    }

    // Vertices on the next track up survive, but a via can only land
    // with horizontal access: the tall vertical enclosure would reach
    // into the slab.
    let reference = GridBlockage::new(shape, 140);
    for x in (170..=1360).step_by(340) {
        let vertex = vertex_at(&grid, x, 510);
        assert!(
            grid.graph().vertex(vertex).available(),
            "vertex at ({}, 510) should survive",
            x
        );
        assert!(reference.blocks_vertex(&grid, vertex, None, Some(Direction::Vertical)));
        assert!(!reference.blocks_vertex(&grid, vertex, None, Some(Direction::Horizontal)));
        assert_eq!(
            grid.graph().vertex(vertex).forced_encap_direction(H),
            Some(Direction::Horizontal)
        );
    }
}

// -------------------------------------------------------------------
// Route manager end-to-end: serial and parallel dispatch, multi-point
// orders, and per-pair reporting.
// -------------------------------------------------------------------

fn serial_config() -> RouterConfig {
    RouterConfig {
        jobs: 1,
        ..RouterConfig::default()
    }
}

#[test]
fn manager_routes_disjoint_orders() {
    let mut grid = build_grid(200);
    let mut manager = RouteManager::new(serial_config());
    manager.add_order(
        EquivalentNets::from_name("n1"),
        vec![vec![terminal("n1", 10, 10)], vec![terminal("n1", 110, 10)]],
    );
    manager.add_order(
        EquivalentNets::from_name("n2"),
        vec![vec![terminal("n2", 10, 200)], vec![terminal("n2", 110, 200)]],
    );

    let reports = manager.solve(&mut grid);
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(report.fully_routed(), "order {} failed: {:?}", report.net, report);
    }
    assert_eq!(grid.paths().len(), 2);
}

#[test]
fn manager_routes_multi_point_order_via_net_search() {
    let mut grid = build_grid(200);
    let mut manager = RouteManager::new(serial_config());
    manager.add_order(
        EquivalentNets::from_name("n3"),
        vec![
            vec![terminal("n3", 10, 100)],
            vec![terminal("n3", 110, 100)],
            vec![terminal("n3", 110, 150)],
        ],
    );

    let reports = manager.solve(&mut grid);
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.pairs.len(), 2);
    assert!(report.fully_routed(), "{:?}", report);
    // One path per connected pair.
    assert_eq!(grid.paths().len(), 2);
    // Every installed path carries the order's net.
    for path in grid.paths() {
        assert_eq!(path.nets().primary(), "n3");
    }
}

#[test]
fn manager_reports_unreachable_pairs_and_continues() {
    let mut grid = build_grid(200);
    // Wall the right-hand target off completely before routing.
    let wall = Shape::rect(Rect::new(Point::new(150, 0), Point::new(160, 200)), H);
    grid.add_blockage(wall, 0);
    let wall = Shape::rect(Rect::new(Point::new(150, 0), Point::new(160, 200)), V);
    grid.add_blockage(wall, 0);

    let mut manager = RouteManager::new(serial_config());
    manager.add_order(
        EquivalentNets::from_name("n1"),
        vec![
            vec![terminal("n1", 10, 10)],
            vec![terminal("n1", 190, 100)],
            vec![terminal("n1", 60, 10)],
        ],
    );

    let reports = manager.solve(&mut grid);
    let report = &reports[0];
    assert_eq!(report.pairs.len(), 2);
    // The walled-off pair fails with a search or attachment failure, not
    // silently.
    assert_ne!(report.pairs[0].outcome, PairOutcome::Routed);
    // The remaining pair still routes.
    assert_eq!(report.pairs[1].outcome, PairOutcome::Routed);
}

#[test]
fn manager_parallel_dispatch_matches_serial_outcomes() {
    let mut grid = build_grid(200);
    let config = RouterConfig {
        jobs: 2,
        ..RouterConfig::default()
    };
    let mut manager = RouteManager::new(config);
    manager.add_order(
        EquivalentNets::from_name("n1"),
        vec![vec![terminal("n1", 10, 10)], vec![terminal("n1", 110, 10)]],
    );
    manager.add_order(
        EquivalentNets::from_name("n2"),
        vec![vec![terminal("n2", 10, 200)], vec![terminal("n2", 110, 200)]],
    );

    let reports = manager.solve(&mut grid);
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(report.fully_routed(), "order {} failed: {:?}", report.net, report);
    }
    assert_eq!(grid.paths().len(), 2);
}
