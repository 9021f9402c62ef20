use crate::blockage::{BlockageCache, Shape};
use crate::error::{Result, RouterError};
use crate::graph::VertexId;
use crate::grid::{ConnectedTerminal, Grid, Terminal};
use crate::nets::EquivalentNets;
use crate::path::Path;
use gridroute_common::geom::Rect;
use gridroute_common::util::config::RouterConfig;
use rayon::prelude::*;
use serde::Serialize;

/// A named net plus an ordered list of terminal groups. Each group holds
/// electrically-equivalent candidate terminals; connecting any member
/// connects the group.
#[derive(Clone, Debug)]
pub struct RouteOrder {
    pub nets: EquivalentNets,
    pub groups: Vec<Vec<Terminal>>,
}

/// Why one terminal-group connection failed (or didn't).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PairOutcome {
    Routed,
    /// The search ran and found no path.
    Unreachable(String),
    /// A terminal could not even be attached to the grid.
    Blocked(String),
    /// Transient collisions persisted through every allowed retry.
    RetriesExhausted(u32),
}

#[derive(Clone, Debug, Serialize)]
pub struct PairReport {
    pub from_group: usize,
    pub to_group: usize,
    pub outcome: PairOutcome,
}

#[derive(Clone, Debug, Serialize)]
pub struct OrderReport {
    pub net: String,
    pub pairs: Vec<PairReport>,
}

impl OrderReport {
    pub fn fully_routed(&self) -> bool {
        self.pairs
            .iter()
            .all(|pair| pair.outcome == PairOutcome::Routed)
    }
}

/// Batches many named net requests, consolidates overlapping ones,
/// dispatches them serially or across a worker pool, and reports
/// per-terminal-pair outcomes. Searches read shared grid topology through
/// per-order blockage-cache children; only this orchestrator installs.
pub struct RouteManager {
    config: RouterConfig,
    orders: Vec<RouteOrder>,
}

impl RouteManager {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            orders: Vec::new(),
        }
    }

    pub fn orders(&self) -> &[RouteOrder] {
        &self.orders
    }

    /// Queues an order. The terminals' own net names become aliases of
    /// the order's net.
    pub fn add_order(
        &mut self,
        mut nets: EquivalentNets,
        groups: Vec<Vec<Terminal>>,
    ) -> usize {
        for group in &groups {
            for terminal in group {
                nets.add(&terminal.net);
            }
        }
        let position = self.orders.len();
        self.orders.push(RouteOrder { nets, groups });
        position
    }

    /// Merges orders that reference a net already claimed by another
    /// order, preserving first-seen ordering of terminal groups. The
    /// result has one order per connected component of net references.
    pub fn consolidate_orders(&mut self) {
        let mut consolidated: Vec<RouteOrder> = Vec::new();
        for incoming in self.orders.drain(..) {
            let matching: Vec<usize> = consolidated
                .iter()
                .enumerate()
                .filter(|(_, existing)| existing.nets.intersects(&incoming.nets))
                .map(|(index, _)| index)
                .collect();

            match matching.split_first() {
                None => consolidated.push(incoming),
                Some((&first, rest)) => {
                    // Absorb later matching orders into the earliest, in
                    // submission order, then the incoming order itself.
                    for &index in rest.iter().rev() {
                        let absorbed = consolidated.remove(index);
                        let target = &mut consolidated[first];
                        target.nets.merge(&absorbed.nets);
                        for group in absorbed.groups {
                            if !target.groups.contains(&group) {
                                target.groups.push(group);
                            }
                        }
                    }
                    let target = &mut consolidated[first];
                    target.nets.merge(&incoming.nets);
                    for group in incoming.groups {
                        if !target.groups.contains(&group) {
                            target.groups.push(group);
                        }
                    }
                }
            }
        }
        self.orders = consolidated;
    }

    /// Routes every consolidated order, serially or across a pool of
    /// `jobs` workers. Partial failures are reported per terminal pair,
    /// never hidden.
    pub fn solve(&mut self, grid: &mut Grid) -> Vec<OrderReport> {
        self.consolidate_orders();

        let shapes = self.collect_terminal_shapes(grid);
        let jobs = if self.config.jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.config.jobs
        };

        if jobs <= 1 || self.orders.len() <= 1 {
            log::info!("dispatching {} orders serially", self.orders.len());
            let orders = self.orders.clone();
            return orders
                .iter()
                .map(|order| self.run_order(grid, order, &shapes))
                .collect();
        }

        log::info!(
            "dispatching {} orders across {} workers",
            self.orders.len(),
            jobs
        );
        self.solve_parallel(grid, &shapes, jobs)
    }

    /// Every terminal acts as a keep-out shape for nets other than its
    /// own; orders cancel the shapes on their own nets in their child
    /// caches.
    fn collect_terminal_shapes(&self, grid: &Grid) -> Vec<(Shape, String)> {
        let mut shapes = Vec::new();
        for order in &self.orders {
            for group in &order.groups {
                for terminal in group {
                    let width = grid
                        .layer_info(terminal.layer)
                        .map(|info| info.wire_width)
                        .unwrap_or(2)
                        .max(2);
                    let net = if terminal.net.is_empty() {
                        order.nets.primary().to_string()
                    } else {
                        terminal.net.clone()
                    };
                    let shape = Shape::rect(
                        Rect::centred_on(terminal.centre, width, width),
                        terminal.layer,
                    )
                    .with_net(&net);
                    shapes.push((shape, net));
                }
            }
        }
        shapes
    }

    /// Runs one order to completion: terminal groups are connected
    /// pairwise, strictly in sequence, each connection depending on the
    /// net state left by the previous one. Only transient failures are
    /// retried; anything else is recorded and the order proceeds to its
    /// next pair.
    fn run_order(
        &self,
        grid: &mut Grid,
        order: &RouteOrder,
        shapes: &[(Shape, String)],
    ) -> OrderReport {
        let mut report = OrderReport {
            net: order.nets.primary().to_string(),
            pairs: Vec::new(),
        };
        if order.groups.len() < 2 {
            log::warn!(
                "order for net \"{}\" has fewer than two terminal groups",
                report.net
            );
            return report;
        }

        let usable_nets = order.nets.clone();
        let mut target_nets = EquivalentNets::new();
        let mut first_routed = false;

        for to_group in 1..order.groups.len() {
            let mut attempts: u32 = 0;
            let outcome = loop {
                let result = if first_routed {
                    self.attempt_route_to_net(
                        grid,
                        &order.groups[to_group],
                        &target_nets,
                        &usable_nets,
                        shapes,
                    )
                } else {
                    self.attempt_first_pair(
                        grid,
                        &order.groups[0],
                        &order.groups[to_group],
                        &usable_nets,
                        shapes,
                    )
                };
                match result {
                    Ok(()) => {
                        if !first_routed {
                            first_routed = true;
                            for terminal in &order.groups[0] {
                                target_nets.add(&terminal.net);
                            }
                        }
                        for terminal in &order.groups[to_group] {
                            target_nets.add(&terminal.net);
                        }
                        if target_nets.primary().is_empty() {
                            target_nets.set_primary(usable_nets.primary());
                        }
                        target_nets.add(usable_nets.primary());
                        break PairOutcome::Routed;
                    }
                    Err(RouterError::Unavailable(message)) => {
                        if attempts < self.config.max_retries {
                            attempts += 1;
                            log::debug!(
                                "transient failure for net \"{}\" (attempt {}): {}",
                                report.net,
                                attempts,
                                message
                            );
                            continue;
                        }
                        break PairOutcome::RetriesExhausted(attempts);
                    }
                    Err(RouterError::NotFound(message)) => {
                        break if message.contains("terminal") {
                            PairOutcome::Blocked(message)
                        } else {
                            PairOutcome::Unreachable(message)
                        };
                    }
                    Err(RouterError::Config(message)) => {
                        break PairOutcome::Blocked(message);
                    }
                }
            };
            let from_group = if first_routed && to_group > 1 { to_group - 1 } else { 0 };
            report.pairs.push(PairReport {
                from_group,
                to_group,
                outcome,
            });
        }
        report
    }

    /// Connects the first workable pair of candidate terminals from the
    /// two groups with a point-to-point search.
    fn attempt_first_pair(
        &self,
        grid: &mut Grid,
        begin_group: &[Terminal],
        end_group: &[Terminal],
        usable_nets: &EquivalentNets,
        shapes: &[(Shape, String)],
    ) -> Result<()> {
        let mut last_error =
            RouterError::NotFound("no candidate terminals in group".to_string());
        for begin in begin_group {
            for end in end_group {
                match self.route_pair(grid, begin, Some(end), None, usable_nets, shapes) {
                    Ok(()) => return Ok(()),
                    Err(error) => {
                        // A transient failure aborts the combo scan so the
                        // retry loop can run it again.
                        if error.is_transient() {
                            return Err(error);
                        }
                        last_error = error;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Connects any candidate terminal of the group to the growing net.
    fn attempt_route_to_net(
        &self,
        grid: &mut Grid,
        group: &[Terminal],
        target_nets: &EquivalentNets,
        usable_nets: &EquivalentNets,
        shapes: &[(Shape, String)],
    ) -> Result<()> {
        let mut last_error =
            RouterError::NotFound("no candidate terminals in group".to_string());
        for begin in group {
            match self.route_pair(grid, begin, None, Some(target_nets), usable_nets, shapes) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    if error.is_transient() {
                        return Err(error);
                    }
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// One search-and-install round trip: attach the terminal(s), search
    /// through a child cache that cancels blockages on the order's own
    /// nets, then install. Bridging vertices are rolled back on failure.
    fn route_pair(
        &self,
        grid: &mut Grid,
        begin: &Terminal,
        end: Option<&Terminal>,
        target_nets: Option<&EquivalentNets>,
        usable_nets: &EquivalentNets,
        shapes: &[(Shape, String)],
    ) -> Result<()> {
        let begin_connection = grid.connect_terminal(begin, usable_nets).map_err(|e| {
            RouterError::NotFound(format!("begin terminal unconnectable: {}", e))
        })?;
        let end_connection = match end {
            Some(end) => match grid.connect_terminal(end, usable_nets) {
                Ok(connection) => Some(connection),
                Err(error) => {
                    grid.rollback_connected_terminal(&begin_connection);
                    return Err(RouterError::NotFound(format!(
                        "end terminal unconnectable: {}",
                        error
                    )));
                }
            },
            None => None,
        };

        let search = {
            let mut root = BlockageCache::new(grid);
            for (shape, _) in shapes {
                root.add_blockage(shape.clone(), 0);
            }
            let mut child = BlockageCache::with_parent(grid, &root);
            for (shape, net) in shapes {
                if usable_nets.contains(net)
                    || target_nets.is_some_and(|targets| targets.contains(net))
                {
                    child.cancel_blockage(shape);
                }
            }

            let begin_vertex = begin_connection.vertex.unwrap();
            match (end.as_ref(), &end_connection, target_nets) {
                (Some(_), Some(connection), _) => grid.shortest_path(
                    begin_vertex,
                    connection.vertex.unwrap(),
                    &child,
                    usable_nets,
                ),
                (None, _, Some(targets)) => {
                    grid.shortest_path_to_net(begin_vertex, targets, usable_nets, &child)
                }
                _ => unreachable!("route_pair requires an end terminal or target nets"),
            }
        };

        match search {
            Ok(mut path) => {
                let mut nets = usable_nets.clone();
                if let Some(targets) = target_nets {
                    nets.merge(targets);
                }
                path.set_nets(nets);
                path.set_start_terminal(begin.clone(), begin_connection.layer);
                if let (Some(end), Some(connection)) = (end, &end_connection) {
                    path.set_end_terminal(end.clone(), connection.layer);
                }
                grid.install_path(path)?;
                Ok(())
            }
            Err(error) => {
                if let Some(connection) = &end_connection {
                    grid.rollback_connected_terminal(connection);
                }
                grid.rollback_connected_terminal(&begin_connection);
                Err(error)
            }
        }
    }

    // ---------------------------------------------------------------
    // Parallel dispatch.
    // ---------------------------------------------------------------

    /// Round-based parallel dispatch: the orchestrator serially attaches
    /// each active order's next terminal pair, the searches fan out over
    /// the shared read-only grid, and the results are installed serially
    /// with re-validation. A path invalidated by an earlier install in
    /// the same round counts as a transient failure and retries.
    fn solve_parallel(
        &mut self,
        grid: &mut Grid,
        shapes: &[(Shape, String)],
        jobs: usize,
    ) -> Vec<OrderReport> {
        struct OrderState {
            order: RouteOrder,
            usable_nets: EquivalentNets,
            target_nets: EquivalentNets,
            first_routed: bool,
            next_group: usize,
            attempts: u32,
            report: OrderReport,
        }

        struct RoundWork {
            state_index: usize,
            begin_vertex: VertexId,
            begin_connection: ConnectedTerminal,
            end_connection: Option<ConnectedTerminal>,
            begin_terminal: Terminal,
            end_terminal: Option<Terminal>,
        }

        let pool = match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
            Ok(pool) => pool,
            Err(error) => {
                log::warn!("could not build worker pool ({}); running serially", error);
                let orders = self.orders.clone();
                return orders
                    .iter()
                    .map(|order| self.run_order(grid, order, shapes))
                    .collect();
            }
        };

        let mut states: Vec<OrderState> = self
            .orders
            .clone()
            .into_iter()
            .map(|order| {
                let usable_nets = order.nets.clone();
                let report = OrderReport {
                    net: order.nets.primary().to_string(),
                    pairs: Vec::new(),
                };
                OrderState {
                    order,
                    usable_nets,
                    target_nets: EquivalentNets::new(),
                    first_routed: false,
                    next_group: 1,
                    attempts: 0,
                    report,
                }
            })
            .collect();

        loop {
            // Phase A (serial): attach this round's terminals.
            let mut work: Vec<RoundWork> = Vec::new();
            let mut active = false;
            for (state_index, state) in states.iter_mut().enumerate() {
                if state.next_group >= state.order.groups.len() {
                    continue;
                }
                active = true;

                let group = &state.order.groups[state.next_group];
                let (begin_terminal, end_terminal) = if state.first_routed {
                    (group[0].clone(), None)
                } else {
                    (group[0].clone(), Some(state.order.groups[0][0].clone()))
                };

                let begin_connection =
                    match grid.connect_terminal(&begin_terminal, &state.usable_nets) {
                        Ok(connection) => connection,
                        Err(error) => {
                            Self::record_pair(
                                state.next_group,
                                PairOutcome::Blocked(format!(
                                    "begin terminal unconnectable: {}",
                                    error
                                )),
                                &mut state.report,
                                &mut state.next_group,
                                &mut state.attempts,
                            );
                            continue;
                        }
                    };
                let end_connection = match &end_terminal {
                    Some(end) => match grid.connect_terminal(end, &state.usable_nets) {
                        Ok(connection) => Some(connection),
                        Err(error) => {
                            grid.rollback_connected_terminal(&begin_connection);
                            Self::record_pair(
                                state.next_group,
                                PairOutcome::Blocked(format!(
                                    "end terminal unconnectable: {}",
                                    error
                                )),
                                &mut state.report,
                                &mut state.next_group,
                                &mut state.attempts,
                            );
                            continue;
                        }
                    },
                    None => None,
                };

                work.push(RoundWork {
                    state_index,
                    begin_vertex: begin_connection.vertex.unwrap(),
                    begin_connection,
                    end_connection,
                    begin_terminal,
                    end_terminal,
                });
            }
            if !active {
                break;
            }
            if work.is_empty() {
                continue;
            }

            // Phase B (parallel): read-only searches through per-order
            // child caches over one shared root.
            let grid_view: &Grid = grid;
            let results: Vec<(usize, Result<Path>)> = pool.install(|| {
                let root = {
                    let mut root = BlockageCache::new(grid_view);
                    for (shape, _) in shapes {
                        root.add_blockage(shape.clone(), 0);
                    }
                    root
                };
                work.par_iter()
                    .map(|item| {
                        let state = &states[item.state_index];
                        let mut child = BlockageCache::with_parent(grid_view, &root);
                        for (shape, net) in shapes {
                            if state.usable_nets.contains(net)
                                || state.target_nets.contains(net)
                            {
                                child.cancel_blockage(shape);
                            }
                        }
                        let result = match &item.end_connection {
                            Some(connection) => grid_view.shortest_path(
                                item.begin_vertex,
                                connection.vertex.unwrap(),
                                &child,
                                &state.usable_nets,
                            ),
                            None => grid_view.shortest_path_to_net(
                                item.begin_vertex,
                                &state.target_nets,
                                &state.usable_nets,
                                &child,
                            ),
                        };
                        (item.state_index, result)
                    })
                    .collect()
            });

            // Phase C (serial): install in submission order, re-checking
            // that earlier installs in this round did not invalidate the
            // path.
            for (item, (state_index, result)) in work.into_iter().zip(results) {
                debug_assert_eq!(item.state_index, state_index);
                let state = &mut states[state_index];
                let outcome = match result {
                    Ok(mut path) => {
                        let mut nets = state.usable_nets.clone();
                        nets.merge(&state.target_nets);
                        if grid.path_still_available(&path, &nets) {
                            path.set_nets(nets);
                            path.set_start_terminal(
                                item.begin_terminal.clone(),
                                item.begin_connection.layer,
                            );
                            if let (Some(end), Some(connection)) =
                                (&item.end_terminal, &item.end_connection)
                            {
                                path.set_end_terminal(end.clone(), connection.layer);
                            }
                            match grid.install_path(path) {
                                Ok(_) => Ok(()),
                                Err(error) => Err(error),
                            }
                        } else {
                            Err(RouterError::Unavailable(
                                "path invalidated by a concurrent installation"
                                    .to_string(),
                            ))
                        }
                    }
                    Err(error) => Err(error),
                };

                match outcome {
                    Ok(()) => {
                        if !state.first_routed {
                            state.first_routed = true;
                            for terminal in &state.order.groups[0] {
                                state.target_nets.add(&terminal.net);
                            }
                        }
                        for terminal in &state.order.groups[state.next_group] {
                            state.target_nets.add(&terminal.net);
                        }
                        state.target_nets.add(state.usable_nets.primary());
                        state.report.pairs.push(PairReport {
                            from_group: if state.first_routed { 0 } else { state.next_group - 1 },
                            to_group: state.next_group,
                            outcome: PairOutcome::Routed,
                        });
                        state.next_group += 1;
                        state.attempts = 0;
                    }
                    Err(RouterError::Unavailable(message)) => {
                        if let Some(connection) = &item.end_connection {
                            grid.rollback_connected_terminal(connection);
                        }
                        grid.rollback_connected_terminal(&item.begin_connection);
                        if state.attempts < self.config.max_retries {
                            state.attempts += 1;
                            log::debug!(
                                "transient failure for net \"{}\" (attempt {}): {}",
                                state.report.net,
                                state.attempts,
                                message
                            );
                        } else {
                            let attempts = state.attempts;
                            Self::record_pair(
                                state.next_group,
                                PairOutcome::RetriesExhausted(attempts),
                                &mut state.report,
                                &mut state.next_group,
                                &mut state.attempts,
                            );
                        }
                    }
                    Err(RouterError::NotFound(message)) => {
                        if let Some(connection) = &item.end_connection {
                            grid.rollback_connected_terminal(connection);
                        }
                        grid.rollback_connected_terminal(&item.begin_connection);
                        Self::record_pair(
                            state.next_group,
                            PairOutcome::Unreachable(message),
                            &mut state.report,
                            &mut state.next_group,
                            &mut state.attempts,
                        );
                    }
                    Err(RouterError::Config(message)) => {
                        Self::record_pair(
                            state.next_group,
                            PairOutcome::Blocked(message),
                            &mut state.report,
                            &mut state.next_group,
                            &mut state.attempts,
                        );
                    }
                }
            }
        }

        states.into_iter().map(|state| state.report).collect()
    }

    fn record_pair(
        to_group: usize,
        outcome: PairOutcome,
        report: &mut OrderReport,
        next_group: &mut usize,
        attempts: &mut u32,
    ) {
        report.pairs.push(PairReport {
            from_group: 0,
            to_group,
            outcome,
        });
        *next_group += 1;
        *attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridroute_common::geom::Point;
    use gridroute_common::tech::Layer;

    fn terminal(net: &str, x: i64) -> Terminal {
        Terminal {
            centre: Point::new(x, 0),
            layer: Layer(0),
            net: net.to_string(),
        }
    }

    fn pair_order(manager: &mut RouteManager, a: Terminal, b: Terminal) {
        let nets =
            EquivalentNets::from_names([a.net.clone(), b.net.clone()]);
        manager.add_order(nets, vec![vec![a], vec![b]]);
    }

    #[test]
    fn consolidates_by_connected_component() {
        let mut manager = RouteManager::new(RouterConfig::default());
        let p1 = terminal("p1", 0);
        let p2 = terminal("p2", 10);
        let p3 = terminal("p3", 20);
        let p4 = terminal("p4", 30);
        let p5 = terminal("p5", 40);
        let p6 = terminal("p6", 50);
        // p1--p2, p3--p5, p4--p6, then p2--p6 joins the first and third.
        pair_order(&mut manager, p1.clone(), p2.clone());
        pair_order(&mut manager, p3.clone(), p5.clone());
        pair_order(&mut manager, p4.clone(), p6.clone());
        pair_order(&mut manager, p2.clone(), p6.clone());
        assert_eq!(manager.orders().len(), 4);

        manager.consolidate_orders();
        assert_eq!(manager.orders().len(), 2);

        let first = &manager.orders()[0];
        let nets: Vec<&str> = first
            .groups
            .iter()
            .map(|group| group[0].net.as_str())
            .collect();
        // First-seen group ordering is preserved across the merge; the
        // re-submitted p2 and p6 groups are duplicates and fold away.
        assert_eq!(nets, vec!["p1", "p2", "p4", "p6"]);

        let second = &manager.orders()[1];
        let nets: Vec<&str> = second
            .groups
            .iter()
            .map(|group| group[0].net.as_str())
            .collect();
        assert_eq!(nets, vec!["p3", "p5"]);
    }

    #[test]
    fn consolidation_dedupes_identical_groups() {
        let mut manager = RouteManager::new(RouterConfig::default());
        let nets = EquivalentNets::from_names(["a".to_string(), "b".to_string()]);
        manager.add_order(
            nets.clone(),
            vec![vec![terminal("a", 0)], vec![terminal("b", 10)]],
        );
        manager.add_order(
            nets,
            vec![vec![terminal("a", 0)], vec![terminal("b", 10)]],
        );
        manager.consolidate_orders();
        assert_eq!(manager.orders().len(), 1);
        assert_eq!(manager.orders()[0].groups.len(), 2);
    }

    #[test]
    fn disjoint_orders_stay_apart() {
        let mut manager = RouteManager::new(RouterConfig::default());
        pair_order(&mut manager, terminal("a", 0), terminal("b", 0));
        pair_order(&mut manager, terminal("c", 100), terminal("d", 100));
        manager.consolidate_orders();
        assert_eq!(manager.orders().len(), 2);
    }
}
