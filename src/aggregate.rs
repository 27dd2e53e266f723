//! Many independent realizations merged into one reporting series.

use crate::compartment::{Compartment, CompartmentCounts, CompartmentSeries};
use crate::config::ModelParams;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::simulation::{run_single, RunOutcome};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::info;

/// What each run is played on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphReuse {
    /// Runs one after another on the caller's graph.
    Shared,
    /// Runs in parallel, each on its own clone of the caller's graph.
    Copied,
    /// Runs in parallel, each on a freshly built graph with the caller's
    /// graph inputs.
    Rebuilt,
}

#[derive(Debug, Clone)]
pub struct MultiRunOptions {
    /// Run `i` uses stream `i` of a ChaCha8 generator seeded with this.
    pub seed: u64,
    pub reuse: GraphReuse,
    pub show_progress: bool,
}

impl Default for MultiRunOptions {
    fn default() -> Self {
        MultiRunOptions {
            seed: 0,
            reuse: GraphReuse::Copied,
            show_progress: false,
        }
    }
}

/// Mean series over all runs plus the spread behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedSeries {
    /// Rounded means, repaired to sum to the population at every step.
    pub series: CompartmentSeries,
    /// Population standard deviation per reporting step and compartment.
    pub stddev: Vec<[f64; Compartment::COUNT]>,
    pub runs: usize,
    pub fallback_draws: usize,
}

impl AggregatedSeries {
    pub fn to_json(&self) -> serde_json::Value {
        self.series.to_json()
    }
}

fn run_rng(seed: u64, run: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(run as u64);
    rng
}

fn progress_bar(n: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(n as u64);
    bar.set_style(
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} runs"),
    );
    bar
}

/// Plays `n` independent realizations and averages their reporting series.
pub fn run_multiple(
    graph: &mut Graph,
    params: &ModelParams,
    n: usize,
    options: &MultiRunOptions,
) -> Result<AggregatedSeries> {
    if n == 0 {
        return Err(Error::invalid("num_runs", "at least one run is needed"));
    }
    info!("starting {} runs with {:?} graphs", n, options.reuse);
    let seed = options.seed;
    let outcomes: Vec<RunOutcome> = match options.reuse {
        GraphReuse::Shared => {
            let bar = progress_bar(n, options.show_progress);
            let outcomes = (0..n)
                .map(|run| {
                    let outcome = run_single(graph, params, run_rng(seed, run));
                    bar.inc(1);
                    outcome
                })
                .collect::<Result<Vec<_>>>()?;
            bar.finish_and_clear();
            outcomes
        }
        GraphReuse::Copied => {
            let base: &Graph = graph;
            (0..n)
                .into_par_iter()
                .progress_with(progress_bar(n, options.show_progress))
                .map(|run| run_single(&mut base.clone(), params, run_rng(seed, run)))
                .collect::<Result<Vec<_>>>()?
        }
        GraphReuse::Rebuilt => {
            let base: &Graph = graph;
            (0..n)
                .into_par_iter()
                .progress_with(progress_bar(n, options.show_progress))
                .map(|run| {
                    let mut rng = run_rng(seed, run);
                    let mut fresh = base.rebuild(&mut rng)?;
                    run_single(&mut fresh, params, rng)
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let runs: Vec<CompartmentSeries> = outcomes.iter().map(|o| o.series.clone()).collect();
    let aggregated = AggregatedSeries {
        series: average_series(&runs, graph.node_count()),
        stddev: spread(&runs),
        runs: n,
        fallback_draws: outcomes.iter().map(|o| o.fallback_draws).sum(),
    };
    info!(
        "finished {} runs, {} exposures in total",
        n,
        outcomes.iter().map(|o| o.exposures).sum::<usize>()
    );
    Ok(aggregated)
}

/// Per step and compartment: the mean over runs rounded half to even, then
/// repaired so the compartments add up to `population` again.
pub fn average_series(runs: &[CompartmentSeries], population: usize) -> CompartmentSeries {
    let mut averaged = CompartmentSeries::default();
    let Some(first) = runs.first() else {
        return averaged;
    };
    for (i, step) in first.steps.iter().enumerate() {
        let mut counts = CompartmentCounts::default();
        for c in Compartment::ALL {
            let mean = stats::mean(runs.iter().map(|r| r.counts[i][c]));
            counts[c] = mean.round_ties_even() as usize;
        }
        repair_conservation(&mut counts, population);
        averaged.push(*step, counts);
    }
    averaged
}

/// Brings the total back to `population`.
///
/// Missing people are added to the largest compartment. A surplus is taken
/// from the largest compartment, at most what it holds, and whatever remains
/// from the next largest ones in turn. Ties go to the earliest in
/// S, E, A, I, H, D, R order.
pub fn repair_conservation(counts: &mut CompartmentCounts, population: usize) {
    let total = counts.total();
    let mut by_size = Compartment::ALL;
    // stable sort keeps S, E, A, I, H, D, R order among equal counts
    by_size.sort_by_key(|c| std::cmp::Reverse(counts[*c]));
    if total < population {
        counts[by_size[0]] += population - total;
        return;
    }
    let mut surplus = total - population;
    for c in by_size {
        if surplus == 0 {
            break;
        }
        let taken = surplus.min(counts[c]);
        counts[c] -= taken;
        surplus -= taken;
    }
}

fn spread(runs: &[CompartmentSeries]) -> Vec<[f64; Compartment::COUNT]> {
    let steps = runs.first().map_or(0, |r| r.len());
    (0..steps)
        .map(|i| {
            let mut row = [0.; Compartment::COUNT];
            for c in Compartment::ALL {
                row[c.index()] = stats::stddev(runs.iter().map(|r| r.counts[i][c]));
            }
            row
        })
        .collect()
}
