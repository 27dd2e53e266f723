//! Stochastic compartmental epidemics on a small-world contact graph.
//!
//! A [`Graph`] lays the population out on a square grid with short lattice
//! links and one long-range link per node. Weekly behaviours add transient
//! contacts on top of it, and every run moves each person through the
//! S, E, A, I, H, D, R compartments one timestep at a time.
//! [`run_multiple`] averages many such runs into one series whose counts
//! always add up to the population.

mod aggregate;
mod behaviour;
mod compartment;
mod config;
mod error;
mod graph;
mod simulation;

#[cfg(test)]
mod tests;

pub use aggregate::*;
pub use behaviour::*;
pub use compartment::*;
pub use config::*;
pub use error::*;
pub use graph::*;
pub use simulation::*;
