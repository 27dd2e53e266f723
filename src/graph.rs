//! Population contact graph: a navigable small-world lattice over a square
//! grid, node attributes (location, age group), the precomputed closeness
//! relation, and the transient edges injected by behaviours.

use crate::config::{AgeStructure, GraphConfiguration, ModelParams, SimulationConfig};
use crate::error::{Error, Result};
use rand::prelude::*;
use rand_distr::WeightedAliasIndex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub type NodeId = usize;

/// Draws per node before a long-range contact is given up on. Only reached
/// when nearly the whole window falls outside the grid.
const MAX_LONG_RANGE_ATTEMPTS: usize = 64;

pub trait SetInsertable {
    fn binary_insert(&mut self, val: usize) -> bool;
}

impl SetInsertable for Vec<usize> {
    /// Inserts keeping the vector sorted; returns true if `val` was present.
    fn binary_insert(&mut self, val: usize) -> bool {
        match self.binary_search(&val) {
            Ok(_) => true,
            Err(pos) => {
                self.insert(pos, val);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub x: usize,
    pub y: usize,
}

impl Location {
    pub fn chebyshev(self, other: Location) -> usize {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs() as usize;
        let dy = (self.y as i64 - other.y as i64).unsigned_abs() as usize;
        dx.max(dy)
    }
}

/// One side of an undirected edge, stored in the adjacency list of the other
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub peer: NodeId,
    pub weight: f64,
    pub transient: bool,
}

/// Dense symmetric bit matrix: `is_close(a, b)` iff a != b and the Chebyshev
/// distance between their locations is at most the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseNodes {
    size: usize,
    words_per_row: usize,
    bits: Vec<u64>,
}

impl CloseNodes {
    pub fn new(locations: &[Location], threshold: usize) -> CloseNodes {
        let size = locations.len();
        let words_per_row = (size + 63) / 64;
        let mut bits = vec![0u64; size * words_per_row];
        for a in 0..size {
            for b in (a + 1)..size {
                if locations[a].chebyshev(locations[b]) <= threshold {
                    bits[a * words_per_row + b / 64] |= 1 << (b % 64);
                    bits[b * words_per_row + a / 64] |= 1 << (a % 64);
                }
            }
        }
        CloseNodes {
            size,
            words_per_row,
            bits,
        }
    }

    /// Number of nodes, i.e. the length of every row.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_close(&self, a: NodeId, b: NodeId) -> bool {
        self.bits[a * self.words_per_row + b / 64] & (1 << (b % 64)) != 0
    }

    /// Close nodes of `a` in ascending order.
    pub fn row(&self, a: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let words = &self.bits[a * self.words_per_row..(a + 1) * self.words_per_row];
        words.iter().enumerate().flat_map(|(w, &word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| w * 64 + bit)
        })
    }

    pub fn count(&self, a: NodeId) -> usize {
        self.bits[a * self.words_per_row..(a + 1) * self.words_per_row]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }
}

/// Values a reloaded graph has to match before it may be reused.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphExpectations {
    pub graph_config: GraphConfiguration,
    pub time_horizon: usize,
    pub num_infected: usize,
    pub population_size: usize,
    pub infection_rate: f64,
}

impl GraphExpectations {
    pub fn new(config: &SimulationConfig, params: &ModelParams) -> Result<Self> {
        let (age_structure, infection_rate) = required_inputs(params)?;
        Ok(GraphExpectations {
            graph_config: config.graph_config.clone(),
            time_horizon: config.time_horizon,
            num_infected: config.num_infected,
            population_size: age_structure.values().sum(),
            infection_rate,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    config: SimulationConfig,
    age_structure: AgeStructure,
    infection_rate: f64,
    side: usize,
    locations: Vec<Location>,
    age_labels: Vec<String>,
    age_groups: Vec<usize>,
    adjacency: Vec<Vec<Link>>,
    close_nodes: CloseNodes,
    #[serde(skip)]
    transient: Vec<(NodeId, NodeId)>,
}

fn required_inputs(params: &ModelParams) -> Result<(&AgeStructure, f64)> {
    match (&params.age_structure, params.generic_infection) {
        (Some(age_structure), Some(rate)) => Ok((age_structure, rate)),
        (age_structure, rate) => {
            let mut missing = vec![];
            if age_structure.is_none() {
                missing.push("the community has not been set".to_string());
            }
            if rate.is_none() {
                missing.push("the infection data has not been set".to_string());
            }
            Err(Error::MissingInput { missing })
        }
    }
}

/// Builds a graph from model parameters, failing before any work if the
/// population or the infection rate has not been provided.
pub fn construct_graph<R: Rng + ?Sized>(
    params: &ModelParams,
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<Graph> {
    let (age_structure, rate) = required_inputs(params)?;
    Graph::construct(age_structure, rate, config, rng)
}

/// Smallest side length whose square holds `n` cells.
fn grid_side(n: usize) -> usize {
    let mut side = (n as f64).sqrt().ceil() as usize;
    while side * side < n {
        side += 1;
    }
    while side > 1 && (side - 1) * (side - 1) >= n {
        side -= 1;
    }
    side
}

/// Relative long-range offsets inside the Chebyshev window, weighted by
/// lattice distance to the power of `-decay`.
struct LongRangeTable {
    offsets: Vec<(i64, i64)>,
    sampler: WeightedAliasIndex<f64>,
}

impl LongRangeTable {
    fn new(window: usize, decay: f64) -> Option<LongRangeTable> {
        let w = window as i64;
        let offsets: Vec<(i64, i64)> = (-w..=w)
            .flat_map(|dx| (-w..=w).map(move |dy| (dx, dy)))
            .filter(|&(dx, dy)| (dx, dy) != (0, 0))
            .collect();
        if offsets.is_empty() {
            return None;
        }
        let weights: Vec<f64> = offsets
            .iter()
            .map(|(dx, dy)| ((dx.abs() + dy.abs()) as f64).powf(-decay))
            .collect();
        let sampler = WeightedAliasIndex::new(weights).ok()?;
        Some(LongRangeTable { offsets, sampler })
    }

    /// Rejection-samples an in-grid target, which keeps the weights
    /// normalised over the cells that actually exist around `cell`.
    fn draw<R: Rng + ?Sized>(&self, rng: &mut R, cell: Location, side: usize) -> Option<usize> {
        for _ in 0..MAX_LONG_RANGE_ATTEMPTS {
            let (dx, dy) = self.offsets[self.sampler.sample(rng)];
            let x = cell.x as i64 + dx;
            let y = cell.y as i64 + dy;
            if x >= 0 && y >= 0 && (x as usize) < side && (y as usize) < side {
                return Some(x as usize * side + y as usize);
            }
        }
        None
    }
}

fn connect(adjacency: &mut [Vec<usize>], a: usize, b: usize) {
    if a != b {
        adjacency[a].binary_insert(b);
        adjacency[b].binary_insert(a);
    }
}

/// Undirected cell-level adjacency of the small-world lattice on a full
/// `side` x `side` grid, self-loops excluded.
fn small_world_lattice<R: Rng + ?Sized>(
    side: usize,
    config: &GraphConfiguration,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let cells = side * side;
    let location = |cell: usize| Location {
        x: cell / side,
        y: cell % side,
    };
    let mut adjacency: Vec<Vec<usize>> = vec![vec![]; cells];

    let short = config.short_connection_diameter;
    for cell in 0..cells {
        let here = location(cell);
        let x_range = here.x.saturating_sub(short)..=(here.x + short).min(side - 1);
        for x in x_range {
            for y in here.y.saturating_sub(short)..=(here.y + short).min(side - 1) {
                connect(&mut adjacency, cell, x * side + y);
            }
        }
    }

    if let Some(table) = LongRangeTable::new(config.long_connection_diameter, config.decay) {
        let mut missed = 0;
        for cell in 0..cells {
            match table.draw(rng, location(cell), side) {
                Some(target) => connect(&mut adjacency, cell, target),
                None => missed += 1,
            }
        }
        if missed > 0 {
            debug!("{} cells got no long-range contact inside the grid", missed);
        }
    }
    adjacency
}

impl Graph {
    /// Builds the population graph.
    ///
    /// The lattice is laid out on the smallest square grid holding the whole
    /// population; surplus cells are deleted uniformly at random and the
    /// survivors are numbered `0..N` in row-major order. Age groups are
    /// shuffled over the nodes so each group keeps its exact count.
    pub fn construct<R: Rng + ?Sized>(
        age_structure: &AgeStructure,
        infection_rate: f64,
        config: &SimulationConfig,
        rng: &mut R,
    ) -> Result<Graph> {
        config.check()?;
        let population: usize = age_structure.values().sum();
        if population == 0 {
            return Err(Error::invalid("age_structure", "population is empty"));
        }
        if !(0.0..=1.0).contains(&infection_rate) {
            return Err(Error::invalid(
                "generic_infection",
                format!("must be a probability, got {}", infection_rate),
            ));
        }
        if config.num_infected > population {
            return Err(Error::invalid(
                "num_infected",
                format!(
                    "{} initial infections for a population of {}",
                    config.num_infected, population
                ),
            ));
        }

        let side = grid_side(population);
        let cell_adjacency = small_world_lattice(side, &config.graph_config, rng);

        let cells = side * side;
        let mut removed = vec![false; cells];
        for cell in rand::seq::index::sample(rng, cells, cells - population).into_iter() {
            removed[cell] = true;
        }
        let mut node_of_cell = vec![None; cells];
        let mut locations = Vec::with_capacity(population);
        for cell in (0..cells).filter(|c| !removed[*c]) {
            node_of_cell[cell] = Some(locations.len());
            locations.push(Location {
                x: cell / side,
                y: cell % side,
            });
        }

        // node numbering is monotone in cell index, so lists stay sorted
        let adjacency: Vec<Vec<Link>> = (0..cells)
            .filter(|c| !removed[*c])
            .map(|cell| {
                cell_adjacency[cell]
                    .iter()
                    .filter_map(|other| node_of_cell[*other])
                    .map(|peer| Link {
                        peer,
                        weight: infection_rate,
                        transient: false,
                    })
                    .collect()
            })
            .collect();

        let age_labels: Vec<String> = age_structure.keys().cloned().collect();
        let mut age_groups: Vec<usize> = age_structure
            .values()
            .enumerate()
            .flat_map(|(group, count)| std::iter::repeat(group).take(*count))
            .collect();
        age_groups.shuffle(rng);

        let close_nodes = CloseNodes::new(&locations, config.graph_config.closeness_threshold);

        let graph = Graph {
            config: config.clone(),
            age_structure: age_structure.clone(),
            infection_rate,
            side,
            locations,
            age_labels,
            age_groups,
            adjacency,
            close_nodes,
            transient: vec![],
        };
        info!(
            "built graph: {} nodes on a {}x{} grid ({} cells removed), {} edges",
            graph.node_count(),
            side,
            side,
            cells - population,
            graph.edge_count()
        );
        Ok(graph)
    }

    /// A graph with exactly the given lattice edges, nodes laid out on one
    /// grid row and all in age group `age_group`.
    #[cfg(test)]
    pub(crate) fn from_edges(
        node_count: usize,
        edges: &[(NodeId, NodeId)],
        infection_rate: f64,
        age_group: &str,
        config: SimulationConfig,
    ) -> Graph {
        let locations: Vec<Location> = (0..node_count).map(|y| Location { x: 0, y }).collect();
        let close_nodes = CloseNodes::new(&locations, config.graph_config.closeness_threshold);
        let mut graph = Graph {
            config,
            age_structure: [(age_group.to_string(), node_count)].into_iter().collect(),
            infection_rate,
            side: node_count,
            locations,
            age_labels: vec![age_group.to_string()],
            age_groups: vec![0; node_count],
            adjacency: vec![vec![]; node_count],
            close_nodes,
            transient: vec![],
        };
        for &(a, b) in edges {
            let link = |peer| Link {
                peer,
                weight: infection_rate,
                transient: false,
            };
            graph.insert_link(a, link(b));
            graph.insert_link(b, link(a));
        }
        graph
    }

    /// A fresh graph built from the same inputs as this one.
    pub fn rebuild<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Graph> {
        Graph::construct(&self.age_structure, self.infection_rate, &self.config, rng)
    }

    pub fn node_count(&self) -> usize {
        self.locations.len()
    }

    pub fn nodes(&self) -> std::ops::Range<NodeId> {
        0..self.node_count()
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn age_structure(&self) -> &AgeStructure {
        &self.age_structure
    }

    pub fn infection_rate(&self) -> f64 {
        self.infection_rate
    }

    pub fn location(&self, node: NodeId) -> Location {
        self.locations[node]
    }

    pub fn age_labels(&self) -> &[String] {
        &self.age_labels
    }

    /// Index into [`Graph::age_labels`].
    pub fn age_group_index(&self, node: NodeId) -> usize {
        self.age_groups[node]
    }

    pub fn age_group(&self, node: NodeId) -> &str {
        &self.age_labels[self.age_groups[node]]
    }

    pub fn close_nodes(&self) -> &CloseNodes {
        &self.close_nodes
    }

    /// Lattice and transient neighbours of `node`, sorted by id.
    pub fn neighbours(&self, node: NodeId) -> &[Link] {
        &self.adjacency[node]
    }

    pub fn edge(&self, a: NodeId, b: NodeId) -> Option<&Link> {
        let links = &self.adjacency[a];
        links
            .binary_search_by_key(&b, |l| l.peer)
            .ok()
            .map(|pos| &links[pos])
    }

    pub fn has_edge(&self, a: NodeId, b: NodeId) -> bool {
        self.edge(a, b).is_some()
    }

    /// Undirected edge count, transient edges included.
    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(|l| l.len()).sum::<usize>() / 2
    }

    pub fn transient_edge_count(&self) -> usize {
        self.transient.len()
    }

    fn insert_link(&mut self, from: NodeId, link: Link) {
        let links = &mut self.adjacency[from];
        if let Err(pos) = links.binary_search_by_key(&link.peer, |l| l.peer) {
            links.insert(pos, link);
        }
    }

    /// Adds a behaviour-induced edge weighted with the generic infection
    /// rate. Existing edges, lattice or transient, are left untouched.
    /// Returns whether an edge was added.
    pub fn add_transient_edge(&mut self, a: NodeId, b: NodeId) -> bool {
        if a == b || self.has_edge(a, b) {
            return false;
        }
        let weight = self.infection_rate;
        self.insert_link(
            a,
            Link {
                peer: b,
                weight,
                transient: true,
            },
        );
        self.insert_link(
            b,
            Link {
                peer: a,
                weight,
                transient: true,
            },
        );
        self.transient.push((a, b));
        true
    }

    /// Removes every transient edge, restoring the static lattice.
    pub fn clear_transient_edges(&mut self) -> usize {
        let transient = std::mem::take(&mut self.transient);
        for &(a, b) in &transient {
            self.adjacency[a].retain(|l| !(l.transient && l.peer == b));
            self.adjacency[b].retain(|l| !(l.transient && l.peer == a));
        }
        transient.len()
    }

    /// Accepts a graph built elsewhere (e.g. reloaded from disk) only if it
    /// was built for exactly the expected configuration and inputs.
    pub fn validate_reloaded(&self, expected: &GraphExpectations) -> Result<()> {
        let mut fields = vec![];
        if self.config.graph_config != expected.graph_config {
            fields.push("graph_config");
        }
        if self.config.time_horizon != expected.time_horizon {
            fields.push("time_horizon");
        }
        if self.config.num_infected != expected.num_infected {
            fields.push("num_infected");
        }
        if self.node_count() != expected.population_size {
            fields.push("population_size");
        }
        if self.infection_rate != expected.infection_rate {
            fields.push("infection_rate");
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(Error::GraphMismatch { fields })
        }
    }
}
