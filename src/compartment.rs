//! Epidemic compartments and the per-step count records built from them.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::{Display, Formatter};
use std::ops::{Index, IndexMut};

/// Epidemic state of a single person.
///
/// The declaration order S, E, A, I, H, D, R is the fixed iteration order used
/// for reporting and for tie-breaks during conservation repair.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Compartment {
    #[serde(rename = "S")]
    Susceptible,
    #[serde(rename = "E")]
    Exposed,
    #[serde(rename = "A")]
    Asymptomatic,
    #[serde(rename = "I")]
    Symptomatic,
    #[serde(rename = "H")]
    Hospitalised,
    #[serde(rename = "D")]
    Dead,
    #[serde(rename = "R")]
    Recovered,
}

impl Default for Compartment {
    fn default() -> Self {
        Compartment::Susceptible
    }
}

impl Compartment {
    pub const COUNT: usize = 7;

    pub const ALL: [Compartment; Compartment::COUNT] = [
        Compartment::Susceptible,
        Compartment::Exposed,
        Compartment::Asymptomatic,
        Compartment::Symptomatic,
        Compartment::Hospitalised,
        Compartment::Dead,
        Compartment::Recovered,
    ];

    pub const fn letter(self) -> char {
        match self {
            Compartment::Susceptible => 'S',
            Compartment::Exposed => 'E',
            Compartment::Asymptomatic => 'A',
            Compartment::Symptomatic => 'I',
            Compartment::Hospitalised => 'H',
            Compartment::Dead => 'D',
            Compartment::Recovered => 'R',
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Compartment::Susceptible => "Susceptible",
            Compartment::Exposed => "Exposed",
            Compartment::Asymptomatic => "Asymptomatic",
            Compartment::Symptomatic => "Symptomatic",
            Compartment::Hospitalised => "Hospitalised",
            Compartment::Dead => "Dead",
            Compartment::Recovered => "Recovered",
        }
    }

    /// Position in [`Compartment::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }

    /// S, D and R never change during progression.
    pub const fn is_absorbing(self) -> bool {
        matches!(
            self,
            Compartment::Susceptible | Compartment::Dead | Compartment::Recovered
        )
    }

    /// A and I nodes spread the infection to susceptible neighbours.
    pub const fn is_infectious(self) -> bool {
        matches!(self, Compartment::Asymptomatic | Compartment::Symptomatic)
    }

    /// States that need a transition distribution.
    pub fn progressing() -> impl Iterator<Item = Compartment> {
        Compartment::ALL.into_iter().filter(|c| !c.is_absorbing())
    }
}

impl Display for Compartment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Number of nodes per compartment at one timestep.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CompartmentCounts(pub [usize; Compartment::COUNT]);

impl CompartmentCounts {
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a Compartment>) -> Self {
        let mut counts = CompartmentCounts::default();
        for state in states {
            counts[*state] += 1;
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Compartment, usize)> + '_ {
        Compartment::ALL.iter().map(move |c| (*c, self[*c]))
    }
}

impl Index<Compartment> for CompartmentCounts {
    type Output = usize;

    fn index(&self, c: Compartment) -> &usize {
        &self.0[c.index()]
    }
}

impl IndexMut<Compartment> for CompartmentCounts {
    fn index_mut(&mut self, c: Compartment) -> &mut usize {
        &mut self.0[c.index()]
    }
}

impl Display for CompartmentCounts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (c, n) in self.iter() {
            writeln!(f, "{:<15}{:>10}", c.name(), n)?;
        }
        write!(f, "{}", "-".repeat(30))
    }
}

/// Compartment counts sampled every [`REPORTING_INTERVAL`] timesteps.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CompartmentSeries {
    pub steps: Vec<usize>,
    pub counts: Vec<CompartmentCounts>,
}

pub const REPORTING_INTERVAL: usize = 7;

/// Reporting timesteps 0, 7, 14, ... up to and including `time_horizon`.
pub fn reporting_steps(time_horizon: usize) -> impl Iterator<Item = usize> {
    (0..=time_horizon).step_by(REPORTING_INTERVAL)
}

impl CompartmentSeries {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn push(&mut self, step: usize, counts: CompartmentCounts) {
        self.steps.push(step);
        self.counts.push(counts);
    }

    /// Counts of a single compartment over all reporting steps.
    pub fn of(&self, c: Compartment) -> Vec<usize> {
        self.counts.iter().map(|counts| counts[c]).collect()
    }

    /// `{"S": [...], "E": [...], ...}`
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = Compartment::ALL
            .iter()
            .map(|c| (c.letter().to_string(), json!(self.of(*c))))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl Display for CompartmentSeries {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "step,{}", Compartment::ALL.iter().join(","))?;
        for (step, counts) in self.steps.iter().zip(self.counts.iter()) {
            writeln!(f, "{},{}", step, counts.0.iter().join(","))?;
        }
        Ok(())
    }
}
