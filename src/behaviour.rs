//! Weekly behaviour schedules and the transient contact edges they create.

use crate::config::{BehaviourSpec, Behaviours};
use crate::graph::{Graph, NodeId};
use itertools::Itertools;
use rand::prelude::*;
use rand::seq::index;
use tracing::trace;

pub const DAYS_PER_WEEK: usize = 7;

/// Totals over the lifetime of a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub visits: usize,
    pub edges_added: usize,
    /// Spatial visits whose node had no close neighbour to meet.
    pub empty_pools: usize,
}

/// Decides, per node and behaviour, which weekdays a visit happens on and
/// turns those visits into transient edges on the graph.
#[derive(Debug, Clone)]
pub struct BehaviourScheduler {
    behaviours: Vec<(String, BehaviourSpec)>,
    /// One weekday bit mask per (node, behaviour).
    visit_days: Vec<u8>,
    node_count: usize,
    stats: SchedulerStats,
}

impl BehaviourScheduler {
    pub fn new(behaviours: &Behaviours, node_count: usize) -> BehaviourScheduler {
        let behaviours: Vec<(String, BehaviourSpec)> = behaviours
            .iter()
            .map(|(name, spec)| (name.clone(), *spec))
            .collect();
        BehaviourScheduler {
            visit_days: vec![0; node_count * behaviours.len()],
            behaviours,
            node_count,
            stats: SchedulerStats::default(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn behaviours(&self) -> impl Iterator<Item = &str> {
        self.behaviours.iter().map(|(name, _)| name.as_str())
    }

    /// Weekdays (0-6) on which `node` performs behaviour number `behaviour`.
    pub fn visit_days(&self, node: NodeId, behaviour: usize) -> Vec<usize> {
        let mask = self.visit_days[node * self.behaviours.len() + behaviour];
        (0..DAYS_PER_WEEK).filter(|d| mask & (1 << d) != 0).collect()
    }

    fn visits_on(&self, node: NodeId, behaviour: usize, weekday: usize) -> bool {
        self.visit_days[node * self.behaviours.len() + behaviour] & (1 << weekday) != 0
    }

    /// Draws this week's visit days: `visits` distinct weekdays per node and
    /// behaviour, uniformly without replacement. Inactive behaviours get no
    /// days and consume no randomness.
    pub fn plan_week<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let per_node = self.behaviours.len();
        for node in 0..self.node_count {
            for (b, (_, spec)) in self.behaviours.iter().enumerate() {
                if !spec.is_active() {
                    self.visit_days[node * per_node + b] = 0;
                    continue;
                }
                let visits = (spec.visits as usize).min(DAYS_PER_WEEK);
                self.visit_days[node * per_node + b] = index::sample(rng, DAYS_PER_WEEK, visits)
                    .into_iter()
                    .fold(0u8, |mask, day| mask | (1 << day));
            }
        }
    }

    /// Materializes the contacts of `timestep`, planning a new week first
    /// when the timestep starts one. Returns the number of edges added.
    pub fn add_interactions<R: Rng + ?Sized>(
        &mut self,
        graph: &mut Graph,
        timestep: usize,
        rng: &mut R,
    ) -> usize {
        let weekday = timestep % DAYS_PER_WEEK;
        if weekday == 0 {
            self.plan_week(rng);
        }
        let mut added = 0;
        for node in 0..self.node_count {
            for b in 0..self.behaviours.len() {
                let spec = self.behaviours[b].1;
                if spec.is_active() && self.visits_on(node, b, weekday) {
                    self.stats.visits += 1;
                    added += self.visit(graph, node, &spec, rng);
                }
            }
        }
        self.stats.edges_added += added;
        trace!("timestep {}: {} transient edges added", timestep, added);
        added
    }

    fn visit<R: Rng + ?Sized>(
        &mut self,
        graph: &mut Graph,
        node: NodeId,
        spec: &BehaviourSpec,
        rng: &mut R,
    ) -> usize {
        if spec.spatially_constrained {
            // errand: contact with each person met, none among them
            let pool: Vec<NodeId> = graph.close_nodes().row(node).collect();
            if pool.is_empty() {
                self.stats.empty_pools += 1;
                trace!("node {} has no close neighbours to visit", node);
                return 0;
            }
            let size = spec.num_people.min(pool.len());
            index::sample(rng, pool.len(), size)
                .into_iter()
                .filter(|i| graph.add_transient_edge(node, pool[*i]))
                .count()
        } else {
            // gathering: everybody present meets everybody else
            let others = graph.node_count() - 1;
            let size = spec.num_people.min(others);
            let mut group: Vec<NodeId> = index::sample(rng, others, size)
                .into_iter()
                .map(|i| if i >= node { i + 1 } else { i })
                .collect();
            group.push(node);
            group
                .into_iter()
                .tuple_combinations()
                .filter(|&(a, b)| graph.add_transient_edge(a, b))
                .count()
        }
    }

    /// Drops every transient edge from the graph.
    pub fn remove_interactions(&mut self, graph: &mut Graph) -> usize {
        graph.clear_transient_edges()
    }
}
