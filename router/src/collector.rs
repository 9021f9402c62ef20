use crate::graph::VertexId;
use gridroute_common::tech::Layer;
use std::collections::BTreeMap;

/// Groups successively offered vertices: as long as the predicate says an
/// offer belongs with the previous one, it joins the current group; any
/// break starts a new group. Groups keep offer order. Lone offers that
/// never pair with a neighbour produce no group.
pub struct VertexCollector<F>
where
    F: Fn(VertexId, VertexId) -> bool,
{
    same_group: F,
    state: CollectorState,
}

#[derive(Default)]
struct CollectorState {
    previous_offer: Option<VertexId>,
    needs_new_group: bool,
    groups: Vec<Vec<VertexId>>,
}

impl CollectorState {
    fn new() -> Self {
        Self {
            previous_offer: None,
            needs_new_group: true,
            groups: Vec::new(),
        }
    }

    fn offer(&mut self, vertex: VertexId, same_group: bool) {
        match self.previous_offer {
            Some(previous) if same_group => {
                if self.needs_new_group {
                    self.groups.push(vec![previous]);
                    self.needs_new_group = false;
                }
                self.groups.last_mut().unwrap().push(vertex);
            }
            _ => {
                self.needs_new_group = true;
            }
        }
        self.previous_offer = Some(vertex);
    }
}

impl<F> VertexCollector<F>
where
    F: Fn(VertexId, VertexId) -> bool,
{
    pub fn new(same_group: F) -> Self {
        Self {
            same_group,
            state: CollectorState::new(),
        }
    }

    pub fn offer(&mut self, vertex: VertexId) {
        let same = self
            .state
            .previous_offer
            .is_some_and(|previous| (self.same_group)(previous, vertex));
        self.state.offer(vertex, same);
    }

    pub fn groups(&self) -> &[Vec<VertexId>] {
        &self.state.groups
    }
}

/// Per-layer grouping with one shared, layer-aware predicate. Offers on
/// different layers never group together.
pub struct LayeredVertexCollectors<F>
where
    F: Fn(Layer, VertexId, VertexId) -> bool,
{
    same_group: F,
    states_by_layer: BTreeMap<Layer, CollectorState>,
}

impl<F> LayeredVertexCollectors<F>
where
    F: Fn(Layer, VertexId, VertexId) -> bool,
{
    pub fn new(same_group: F) -> Self {
        Self {
            same_group,
            states_by_layer: BTreeMap::new(),
        }
    }

    pub fn offer(&mut self, layer: Layer, vertex: VertexId) {
        let state = self
            .states_by_layer
            .entry(layer)
            .or_insert_with(CollectorState::new);
        let same = state
            .previous_offer
            .is_some_and(|previous| (self.same_group)(layer, previous, vertex));
        state.offer(vertex, same);
    }

    pub fn groups_by_layer(&self) -> BTreeMap<Layer, &[Vec<VertexId>]> {
        self.states_by_layer
            .iter()
            .map(|(&layer, state)| (layer, state.groups.as_slice()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaks_form_new_groups() {
        // Group vertices whose indices are consecutive.
        let mut collector =
            VertexCollector::new(|a: VertexId, b: VertexId| b.index() == a.index() + 1);
        for index in [0usize, 1, 2, 5, 6, 9] {
            collector.offer(VertexId::new(index));
        }
        let groups = collector.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0],
            vec![VertexId::new(0), VertexId::new(1), VertexId::new(2)]
        );
        assert_eq!(groups[1], vec![VertexId::new(5), VertexId::new(6)]);
    }

    #[test]
    fn singleton_offers_make_no_groups() {
        let mut collector = VertexCollector::new(|_, _| false);
        collector.offer(VertexId::new(0));
        collector.offer(VertexId::new(2));
        assert!(collector.groups().is_empty());
    }

    #[test]
    fn layered_collectors_keep_layers_apart() {
        let mut collectors = LayeredVertexCollectors::new(
            |_layer, a: VertexId, b: VertexId| b.index() == a.index() + 1,
        );
        collectors.offer(Layer(0), VertexId::new(0));
        collectors.offer(Layer(0), VertexId::new(1));
        collectors.offer(Layer(1), VertexId::new(10));
        collectors.offer(Layer(1), VertexId::new(11));
        let groups = collectors.groups_by_layer();
        assert_eq!(groups[&Layer(0)].len(), 1);
        assert_eq!(groups[&Layer(1)].len(), 1);
        assert_eq!(groups[&Layer(0)][0].len(), 2);
    }

    #[test]
    fn collectors_can_borrow_their_environment() {
        let centres = [0usize, 1, 10, 11];
        let mut collector = VertexCollector::new(|a: VertexId, b: VertexId| {
            centres[b.index()].abs_diff(centres[a.index()]) == 1
        });
        for index in 0..centres.len() {
            collector.offer(VertexId::new(index));
        }
        assert_eq!(collector.groups().len(), 2);
    }
}
