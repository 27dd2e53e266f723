use crate::behaviour::{BehaviourScheduler, SchedulerStats};
use crate::compartment::{reporting_steps, Compartment, CompartmentCounts, CompartmentSeries};
use crate::config::{ModelParams, StateTransitionTable};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use rand::prelude::*;
use rand::seq::index;
use tracing::{debug, warn};

/// Allowed deviation of a transition distribution's mass from 1.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Eq, PartialEq)]
pub enum StepRunResult {
    Finished,
    Step { timestep: usize, exposures: usize },
}
impl StepRunResult {
    pub fn success(&self) -> bool {
        match self {
            StepRunResult::Finished => false,
            StepRunResult::Step { .. } => true,
        }
    }
}

/// Outcome of one cumulative-sum draw.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Draw {
    Target(Compartment),
    /// The cumulative sum never reached the draw; the lexicographically
    /// smallest target was taken instead.
    Fallback(Compartment),
}

impl Draw {
    pub fn compartment(self) -> Compartment {
        match self {
            Draw::Target(c) | Draw::Fallback(c) => c,
        }
    }
}

/// Transition distributions resolved against a graph's age groups:
/// `[source compartment][age group index] -> ordered (target, p)`.
#[derive(Debug, Clone)]
pub struct TransitionSampler {
    table: Vec<Vec<Vec<(Compartment, f64)>>>,
}

impl TransitionSampler {
    /// Every progressing compartment needs a distribution for every age
    /// group that has members, and each distribution must sum to 1.
    pub fn compile(table: &StateTransitionTable, graph: &Graph) -> Result<TransitionSampler> {
        let mut compiled = vec![vec![vec![]; graph.age_labels().len()]; Compartment::COUNT];
        for source in Compartment::progressing() {
            for (age, label) in graph.age_labels().iter().enumerate() {
                let distribution = match table.distribution(source, label) {
                    Some(d) => d,
                    None if graph.age_structure().get(label).copied().unwrap_or(0) == 0 => continue,
                    None => {
                        return Err(Error::InvalidTransitions {
                            reason: format!("no transitions from {} for age group '{}'", source, label),
                        })
                    }
                };
                if let Some((target, p)) = distribution.iter().find(|(_, p)| p.is_nan() || **p < 0.) {
                    return Err(Error::InvalidTransitions {
                        reason: format!("{} -> {} for '{}' has probability {}", source, target, label, p),
                    });
                }
                let mass: f64 = distribution.values().sum();
                if (mass - 1.).abs() > PROBABILITY_TOLERANCE {
                    return Err(Error::InvalidTransitions {
                        reason: format!(
                            "transitions from {} for '{}' sum to {} instead of 1",
                            source, label, mass
                        ),
                    });
                }
                compiled[source.index()][age] = distribution.iter().map(|(c, p)| (*c, *p)).collect();
            }
        }
        Ok(TransitionSampler { table: compiled })
    }

    /// Picks the target whose cumulative probability first reaches `draw`.
    pub fn sample(&self, source: Compartment, age: usize, draw: f64) -> Draw {
        let targets = &self.table[source.index()][age];
        match targets
            .iter()
            .scan(0.0, |sum, (c, p)| {
                *sum += p;
                Some((*c, *sum))
            })
            .find(|(_, sum)| draw <= *sum)
        {
            Some((c, _)) => Draw::Target(c),
            None => Draw::Fallback(
                targets
                    .iter()
                    .map(|(c, _)| *c)
                    .min_by_key(|c| c.letter())
                    .unwrap_or(source),
            ),
        }
    }
}

/// Compartment of every node at every timestep `0..=time_horizon`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTimeline {
    node_count: usize,
    states: Vec<Compartment>,
}

impl StateTimeline {
    pub fn new(time_horizon: usize, node_count: usize) -> StateTimeline {
        StateTimeline {
            node_count,
            states: vec![Compartment::Susceptible; (time_horizon + 1) * node_count],
        }
    }

    pub fn time_horizon(&self) -> usize {
        if self.node_count == 0 {
            return 0;
        }
        self.states.len() / self.node_count - 1
    }

    pub fn get(&self, timestep: usize, node: NodeId) -> Compartment {
        self.states[timestep * self.node_count + node]
    }

    pub fn set(&mut self, timestep: usize, node: NodeId, state: Compartment) {
        self.states[timestep * self.node_count + node] = state;
    }

    pub fn row(&self, timestep: usize) -> &[Compartment] {
        &self.states[timestep * self.node_count..(timestep + 1) * self.node_count]
    }

    /// Row `timestep` to read from and row `timestep + 1` to write to.
    fn rows_mut(&mut self, timestep: usize) -> (&[Compartment], &mut [Compartment]) {
        let n = self.node_count;
        let (current, next) = self.states[timestep * n..(timestep + 2) * n].split_at_mut(n);
        (&*current, next)
    }

    pub fn counts(&self, timestep: usize) -> CompartmentCounts {
        CompartmentCounts::from_states(self.row(timestep))
    }

    /// Counts at timesteps 0, 7, 14, ... up to the horizon.
    pub fn reporting_series(&self) -> CompartmentSeries {
        let mut series = CompartmentSeries::default();
        for step in reporting_steps(self.time_horizon()) {
            series.push(step, self.counts(step));
        }
        series
    }

    /// Everybody who has left S by `timestep`.
    pub fn cumulative_cases(&self, timestep: usize) -> usize {
        self.node_count - self.counts(timestep)[Compartment::Susceptible]
    }

    /// For each timestep, how many timesteps it takes until cumulative cases
    /// have at least doubled, if they ever do within the horizon. Timesteps
    /// without any case have no doubling time.
    pub fn doubling_times(&self) -> Vec<Option<usize>> {
        let cases: Vec<usize> = (0..self.time_horizon())
            .map(|t| self.cumulative_cases(t))
            .collect();
        (0..cases.len())
            .map(|t| {
                if cases[t] == 0 {
                    return None;
                }
                ((t + 1)..cases.len())
                    .find(|future| cases[*future] >= cases[t] * 2)
                    .map(|future| future - t)
            })
            .collect()
    }
}

/// One realization together with its diagnostics.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub series: CompartmentSeries,
    pub timeline: StateTimeline,
    pub exposures: usize,
    /// Progression draws that fell through every cumulative bucket.
    pub fallback_draws: usize,
    pub scheduler: SchedulerStats,
}

/// A single stochastic realization of the epidemic on a graph.
///
/// The run holds the graph mutably because behaviours inject transient
/// edges into it; they are all removed again at the end of every timestep.
pub struct Simulation<'g, R: Rng> {
    graph: &'g mut Graph,
    sampler: TransitionSampler,
    scheduler: BehaviourScheduler,
    timeline: StateTimeline,
    rng: R,
    current_time: usize,
    exposures: usize,
    fallback_draws: usize,
}

impl<'g, R: Rng> Simulation<'g, R> {
    /// Prepares a run and seeds `num_infected` uniformly chosen nodes as I.
    pub fn new(graph: &'g mut Graph, params: &ModelParams, mut rng: R) -> Result<Simulation<'g, R>> {
        params.check_behaviours()?;
        let sampler = TransitionSampler::compile(&params.state_transitions, graph)?;
        let node_count = graph.node_count();
        let time_horizon = graph.config().time_horizon;
        let num_infected = graph.config().num_infected;
        if time_horizon == 0 {
            return Err(Error::invalid("time_horizon", "must be greater than zero"));
        }
        if num_infected > node_count {
            return Err(Error::invalid(
                "num_infected",
                format!("{} initial infections for {} nodes", num_infected, node_count),
            ));
        }

        let mut timeline = StateTimeline::new(time_horizon, node_count);
        for node in index::sample(&mut rng, node_count, num_infected).into_iter() {
            timeline.set(0, node, Compartment::Symptomatic);
        }
        let scheduler = BehaviourScheduler::new(&params.behaviours, node_count);
        Ok(Simulation {
            graph,
            sampler,
            scheduler,
            timeline,
            rng,
            current_time: 0,
            exposures: 0,
            fallback_draws: 0,
        })
    }

    pub fn timeline(&self) -> &StateTimeline {
        &self.timeline
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    /// Timestep whose row is read by the next call to [`Simulation::step`].
    pub fn current_time(&self) -> usize {
        self.current_time
    }

    pub fn is_finished(&self) -> bool {
        self.current_time >= self.timeline.time_horizon()
    }

    /// Advances from `current_time` to `current_time + 1`.
    pub fn step(&mut self) -> StepRunResult {
        if self.is_finished() {
            return StepRunResult::Finished;
        }
        let t = self.current_time;
        self.scheduler.add_interactions(self.graph, t, &mut self.rng);
        self.do_progression(t);
        let exposures = self.do_infection(t);
        self.scheduler.remove_interactions(self.graph);
        self.current_time += 1;
        StepRunResult::Step {
            timestep: t,
            exposures,
        }
    }

    /// Nodes outside S, D and R draw their next state; the rest carry over.
    fn do_progression(&mut self, t: usize) {
        let Simulation {
            graph,
            sampler,
            timeline,
            rng,
            fallback_draws,
            ..
        } = self;
        let (current, next) = timeline.rows_mut(t);
        for (node, state) in current.iter().enumerate() {
            next[node] = if state.is_absorbing() {
                *state
            } else {
                let age = graph.age_group_index(node);
                match sampler.sample(*state, age, rng.gen()) {
                    Draw::Target(c) => c,
                    Draw::Fallback(c) => {
                        *fallback_draws += 1;
                        warn!(
                            "no next state reached from {} for age group '{}', choosing {}",
                            state,
                            graph.age_group(node),
                            c
                        );
                        c
                    }
                }
            };
        }
    }

    /// A and I nodes expose each susceptible neighbour with the edge weight
    /// as probability, one draw per (infectious node, neighbour) pair.
    fn do_infection(&mut self, t: usize) -> usize {
        let Simulation {
            graph,
            timeline,
            rng,
            exposures,
            ..
        } = self;
        let (current, next) = timeline.rows_mut(t);
        let mut exposed = 0;
        for node in graph.nodes().filter(|n| current[*n].is_infectious()) {
            for link in graph.neighbours(node) {
                if current[link.peer] != Compartment::Susceptible {
                    continue;
                }
                let luck: f64 = rng.gen();
                if luck <= link.weight {
                    debug_assert!(matches!(
                        next[link.peer],
                        Compartment::Susceptible | Compartment::Exposed
                    ));
                    if next[link.peer] == Compartment::Susceptible {
                        exposed += 1;
                    }
                    next[link.peer] = Compartment::Exposed;
                }
            }
        }
        *exposures += exposed;
        exposed
    }

    /// Runs all remaining timesteps.
    pub fn run(&mut self) {
        while self.step().success() {}
        debug!(
            "run finished after {} timesteps, {} exposures\n{}",
            self.current_time,
            self.exposures,
            self.timeline.counts(self.current_time)
        );
    }

    pub fn results(&self) -> CompartmentSeries {
        self.timeline.reporting_series()
    }

    pub fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            series: self.timeline.reporting_series(),
            exposures: self.exposures,
            fallback_draws: self.fallback_draws,
            scheduler: self.scheduler.stats(),
            timeline: self.timeline,
        }
    }
}

/// One complete realization: seeds, runs every timestep and reports counts
/// every 7 timesteps.
pub fn run_single<R: Rng>(graph: &mut Graph, params: &ModelParams, rng: R) -> Result<RunOutcome> {
    let mut simulation = Simulation::new(graph, params, rng)?;
    simulation.run();
    let outcome = simulation.into_outcome();
    if outcome.fallback_draws > 0 {
        warn!(
            "{} progression draws used the fallback state",
            outcome.fallback_draws
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraphConfiguration, SimulationConfig};
    use assert_float_eq::*;
    use rand_chacha::ChaCha8Rng;
    use Compartment::*;

    const AGE: &str = "(0, 9)";

    fn sim_config(time_horizon: usize, num_infected: usize) -> SimulationConfig {
        SimulationConfig {
            time_horizon,
            num_infected,
            graph_config: GraphConfiguration::default(),
        }
    }

    /// Nodes 0-4, edges 0-1, 0-2, 2-3, everything transmits with certainty.
    fn simple_graph(time_horizon: usize, num_infected: usize) -> Graph {
        Graph::from_edges(5, &[(0, 1), (0, 2), (2, 3)], 1.0, AGE, sim_config(time_horizon, num_infected))
    }

    fn chain_transitions() -> StateTransitionTable {
        let mut table = StateTransitionTable::default();
        table.insert(Exposed, AGE, Asymptomatic, 1.0);
        table.insert(Asymptomatic, AGE, Symptomatic, 1.0);
        table.insert(Symptomatic, AGE, Hospitalised, 1.0);
        table.insert(Hospitalised, AGE, Recovered, 1.0);
        table
    }

    fn params(table: StateTransitionTable) -> ModelParams {
        ModelParams {
            generic_infection: Some(1.0),
            state_transitions: table,
            ..Default::default()
        }
    }

    fn set_row(sim: &mut Simulation<ChaCha8Rng>, t: usize, states: &[Compartment]) {
        for (node, state) in states.iter().enumerate() {
            sim.timeline.set(t, node, *state);
        }
    }

    #[test]
    fn draws_follow_the_distribution() {
        let mut table = chain_transitions();
        table.0.get_mut(&Exposed).unwrap().insert(
            AGE.to_string(),
            [(Asymptomatic, 0.1), (Symptomatic, 0.2), (Recovered, 0.7)].into_iter().collect(),
        );
        let graph = simple_graph(1, 0);
        let sampler = TransitionSampler::compile(&table, &graph).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let n = 10000;
        let mut counts = CompartmentCounts::default();
        for _ in 0..n {
            counts[sampler.sample(Exposed, 0, rng.gen()).compartment()] += 1;
        }
        assert_float_relative_eq!(counts[Asymptomatic] as f64 / n as f64, 0.1, 0.1);
        assert_float_relative_eq!(counts[Symptomatic] as f64 / n as f64, 0.2, 0.1);
        assert_float_relative_eq!(counts[Recovered] as f64 / n as f64, 0.7, 0.1);
    }

    #[test]
    fn underflow_falls_back_to_smallest_letter() {
        let mut table = chain_transitions();
        table.0.get_mut(&Hospitalised).unwrap().insert(
            AGE.to_string(),
            [(Hospitalised, 0.5), (Dead, 0.5 - 1e-9)].into_iter().collect(),
        );
        let graph = simple_graph(1, 0);
        let sampler = TransitionSampler::compile(&table, &graph).unwrap();
        assert_eq!(sampler.sample(Hospitalised, 0, 0.2), Draw::Target(Hospitalised));
        assert_eq!(sampler.sample(Hospitalised, 0, 0.9999999999), Draw::Fallback(Dead));
    }

    #[test]
    fn broken_tables_are_rejected() {
        let graph = simple_graph(1, 0);
        let mut table = chain_transitions();
        table.0.remove(&Symptomatic);
        assert!(matches!(
            TransitionSampler::compile(&table, &graph),
            Err(Error::InvalidTransitions { .. })
        ));

        let mut table = chain_transitions();
        table.insert(Exposed, AGE, Symptomatic, 0.5);
        assert!(TransitionSampler::compile(&table, &graph).is_err());

        let mut table = chain_transitions();
        table.insert(Exposed, AGE, Asymptomatic, 1.5);
        table.insert(Exposed, AGE, Symptomatic, -0.5);
        assert!(TransitionSampler::compile(&table, &graph).is_err());
    }

    #[test]
    fn progression_without_change() {
        let mut graph = simple_graph(1, 0);
        let mut sim = Simulation::new(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(0)).unwrap();
        set_row(&mut sim, 0, &[Recovered, Dead, Susceptible, Recovered, Dead]);
        sim.do_progression(0);
        assert_eq!(sim.timeline.row(0), sim.timeline.row(1));
    }

    #[test]
    fn progression_with_change() {
        let mut graph = Graph::from_edges(4, &[], 1.0, AGE, sim_config(5, 0));
        let mut sim = Simulation::new(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(0)).unwrap();
        set_row(&mut sim, 0, &[Exposed, Asymptomatic, Symptomatic, Hospitalised]);
        sim.do_progression(0);
        assert_eq!(sim.timeline.row(1), &[Asymptomatic, Symptomatic, Hospitalised, Recovered]);
        for t in 1..4 {
            sim.do_progression(t);
        }
        assert_eq!(sim.timeline.row(4), &[Recovered; 4]);
    }

    #[test]
    fn infection_reaches_susceptible_neighbours_only() {
        let mut graph = simple_graph(1, 0);
        let mut sim = Simulation::new(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(0)).unwrap();
        set_row(&mut sim, 0, &[Symptomatic, Asymptomatic, Susceptible, Susceptible, Susceptible]);
        set_row(&mut sim, 1, &[Symptomatic, Asymptomatic, Susceptible, Susceptible, Hospitalised]);
        assert_eq!(sim.do_infection(0), 1);
        let next = sim.timeline.row(1);
        // infectious nodes stay as they were
        assert_eq!(next[0], Symptomatic);
        assert_eq!(next[1], Asymptomatic);
        // the neighbour is exposed, the neighbour's neighbour is not yet
        assert_eq!(next[2], Exposed);
        assert_eq!(next[3], Susceptible);
        assert_eq!(next[4], Hospitalised);
    }

    #[test]
    fn zero_weight_never_infects() {
        let mut graph = Graph::from_edges(3, &[(0, 1), (1, 2)], 0.0, AGE, sim_config(20, 1));
        let outcome = run_single(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(1)).unwrap();
        assert_eq!(outcome.exposures, 0);
        let last = outcome.timeline.counts(20);
        assert_eq!(last[Susceptible], 2);
        assert_eq!(last[Recovered], 1);
    }

    #[test]
    fn basic_simulation_keeps_invariants() {
        let mut graph = simple_graph(5, 1);
        let outcome = run_single(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(3)).unwrap();
        let timeline = &outcome.timeline;
        assert_eq!(timeline.counts(0)[Symptomatic], 1);
        for t in 0..5 {
            assert_eq!(timeline.counts(t).total(), 5);
            for node in 0..5 {
                let (now, next) = (timeline.get(t, node), timeline.get(t + 1, node));
                if now == Susceptible {
                    assert!(next == Susceptible || next == Exposed);
                }
                if now == Dead || now == Recovered {
                    assert_eq!(now, next);
                }
            }
        }
        // node 4 has no neighbours and nothing else can reach it
        assert_eq!(timeline.get(5, 4) == Susceptible, timeline.get(0, 4) == Susceptible);
        assert_eq!(graph.transient_edge_count(), 0);
    }

    #[test]
    fn same_seed_same_run() {
        let run = |seed| {
            let mut graph = simple_graph(14, 1);
            run_single(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(seed))
                .unwrap()
                .timeline
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn step_stops_at_the_horizon() {
        let mut graph = simple_graph(2, 1);
        let mut sim = Simulation::new(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(sim.current_time(), 0);
        assert!(matches!(sim.step(), StepRunResult::Step { timestep: 0, .. }));
        assert_eq!(sim.current_time(), 1);
        assert!(sim.step().success());
        assert_eq!(sim.step(), StepRunResult::Finished);
        assert_eq!(sim.current_time(), 2);
        assert!(sim.is_finished());
    }

    #[test]
    fn reporting_series_and_doubling_times() {
        let mut timeline = StateTimeline::new(14, 4);
        timeline.set(0, 0, Symptomatic);
        for t in 1..=14 {
            timeline.set(t, 0, Recovered);
        }
        for t in 3..=14 {
            timeline.set(t, 1, Exposed);
        }
        for t in 6..=14 {
            timeline.set(t, 2, Symptomatic);
            timeline.set(t, 3, Asymptomatic);
        }
        let series = timeline.reporting_series();
        assert_eq!(series.steps, vec![0, 7, 14]);
        assert_eq!(series.of(Susceptible), vec![3, 0, 0]);
        assert_eq!(series.of(Recovered), vec![0, 1, 1]);

        let doubling = timeline.doubling_times();
        assert_eq!(doubling.len(), 14);
        assert_eq!(doubling[0], Some(3));
        assert_eq!(doubling[3], Some(3));
        assert_eq!(doubling[6], None);
    }

    #[test]
    fn too_many_initial_infections_is_an_error() {
        let mut graph = simple_graph(3, 6);
        assert!(Simulation::new(&mut graph, &params(chain_transitions()), ChaCha8Rng::seed_from_u64(0)).is_err());
    }
}
