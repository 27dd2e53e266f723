//! Input records consumed by the core.
//!
//! Field names follow the JSON layout of the community/infection/simulation
//! data files so that callers can feed them straight through `serde_json`.

use crate::compartment::Compartment;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Age-group label -> number of people in that group.
pub type AgeStructure = BTreeMap<String, usize>;

/// Behaviour name -> how often and with how many people it happens.
pub type Behaviours = BTreeMap<String, BehaviourSpec>;

/// Behaviours whose contacts are restricted to spatially close nodes.
pub const SPATIAL_BEHAVIOURS: &[&str] = &["food_shopping"];

/// Parameters of the small-world lattice and of the closeness relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawGraphConfiguration", into = "RawGraphConfiguration")]
pub struct GraphConfiguration {
    pub short_connection_diameter: usize,
    pub long_connection_diameter: usize,
    pub decay: f64,
    pub closeness_threshold: usize,
}

#[derive(Serialize, Deserialize)]
struct RawGraphConfiguration {
    params: RawLatticeParams,
    closeness_threshold: usize,
}

#[derive(Serialize, Deserialize)]
struct RawLatticeParams {
    short_connection_diameter: usize,
    long_connection_diameter: usize,
    decay: f64,
}

impl From<RawGraphConfiguration> for GraphConfiguration {
    fn from(raw: RawGraphConfiguration) -> Self {
        GraphConfiguration {
            short_connection_diameter: raw.params.short_connection_diameter,
            long_connection_diameter: raw.params.long_connection_diameter,
            decay: raw.params.decay,
            closeness_threshold: raw.closeness_threshold,
        }
    }
}

impl From<GraphConfiguration> for RawGraphConfiguration {
    fn from(config: GraphConfiguration) -> Self {
        RawGraphConfiguration {
            params: RawLatticeParams {
                short_connection_diameter: config.short_connection_diameter,
                long_connection_diameter: config.long_connection_diameter,
                decay: config.decay,
            },
            closeness_threshold: config.closeness_threshold,
        }
    }
}

impl Default for GraphConfiguration {
    fn default() -> Self {
        GraphConfiguration {
            short_connection_diameter: 1,
            long_connection_diameter: 3,
            decay: 2.0,
            closeness_threshold: 1,
        }
    }
}

impl GraphConfiguration {
    pub fn check(&self) -> Result<()> {
        if !self.decay.is_finite() || self.decay < 0. {
            return Err(Error::invalid(
                "decay",
                format!("must be a finite non-negative exponent, got {}", self.decay),
            ));
        }
        Ok(())
    }
}

/// Shape of a run; a graph is stamped with the one it was built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub time_horizon: usize,
    pub num_infected: usize,
    pub graph_config: GraphConfiguration,
}

impl SimulationConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: SimulationConfig = serde_json::from_str(s)?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        if self.time_horizon == 0 {
            return Err(Error::invalid("time_horizon", "must be greater than zero"));
        }
        self.graph_config.check()
    }
}

/// How often a behaviour happens per week and with how many people.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviourSpec {
    pub visits: u8,
    pub num_people: usize,
    #[serde(default)]
    pub spatially_constrained: bool,
}

impl BehaviourSpec {
    pub fn new(visits: u8, num_people: usize) -> Self {
        BehaviourSpec {
            visits,
            num_people,
            spatially_constrained: false,
        }
    }

    pub fn spatial(visits: u8, num_people: usize) -> Self {
        BehaviourSpec {
            spatially_constrained: true,
            ..BehaviourSpec::new(visits, num_people)
        }
    }

    /// A behaviour without visits or without company adds no edges.
    pub fn is_active(&self) -> bool {
        self.visits > 0 && self.num_people > 0
    }

    pub fn check(&self, name: &str) -> Result<()> {
        if self.visits > 7 {
            return Err(Error::invalid(
                "visits",
                format!("behaviour '{}' has {} visits per week", name, self.visits),
            ));
        }
        Ok(())
    }
}

/// A behaviour variant in its `name_visits_people` string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviourVariant {
    pub name: String,
    pub spec: BehaviourSpec,
}

impl FromStr for BehaviourVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.rsplitn(3, '_').collect();
        let (num_people, visits, name) = match parts.as_slice() {
            [num_people, visits, name] if !name.is_empty() => (*num_people, *visits, *name),
            _ => {
                return Err(Error::invalid(
                    "behaviours",
                    format!("'{}' is not of the form name_visits_people", s),
                ))
            }
        };
        let visits: u8 = visits
            .parse()
            .map_err(|_| Error::invalid("behaviours", format!("bad visit count in '{}'", s)))?;
        let num_people: usize = num_people
            .parse()
            .map_err(|_| Error::invalid("behaviours", format!("bad group size in '{}'", s)))?;
        let spec = BehaviourSpec {
            visits,
            num_people,
            spatially_constrained: SPATIAL_BEHAVIOURS.contains(&name),
        };
        spec.check(name)?;
        Ok(BehaviourVariant {
            name: name.to_string(),
            spec,
        })
    }
}

/// Collects variant strings into a behaviour map; later duplicates win.
pub fn behaviours_from_variants<'a>(variants: impl IntoIterator<Item = &'a str>) -> Result<Behaviours> {
    variants
        .into_iter()
        .map(|v| v.parse::<BehaviourVariant>().map(|b| (b.name, b.spec)))
        .collect()
}

/// Source state -> age group -> target state -> probability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTransitionTable(pub BTreeMap<Compartment, BTreeMap<String, BTreeMap<Compartment, f64>>>);

impl StateTransitionTable {
    /// Builds the table from the `{source: {target: {age_group: p}}}` layout
    /// used by the infection data files.
    pub fn from_target_major(
        raw: BTreeMap<Compartment, BTreeMap<Compartment, BTreeMap<String, f64>>>,
    ) -> Self {
        let mut table = StateTransitionTable::default();
        for (source, targets) in raw {
            let by_age = table.0.entry(source).or_default();
            for (target, ages) in targets {
                for (age_group, p) in ages {
                    by_age.entry(age_group).or_default().insert(target, p);
                }
            }
        }
        table
    }

    pub fn insert(&mut self, source: Compartment, age_group: &str, target: Compartment, p: f64) {
        self.0
            .entry(source)
            .or_default()
            .entry(age_group.to_string())
            .or_default()
            .insert(target, p);
    }

    pub fn distribution(
        &self,
        source: Compartment,
        age_group: &str,
    ) -> Option<&BTreeMap<Compartment, f64>> {
        self.0.get(&source)?.get(age_group)
    }
}

/// Contents of an infection data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfectionData {
    pub state_transitions: BTreeMap<Compartment, BTreeMap<Compartment, BTreeMap<String, f64>>>,
    pub generic_infection: f64,
}

impl InfectionData {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn transition_table(&self) -> StateTransitionTable {
        StateTransitionTable::from_target_major(self.state_transitions.clone())
    }
}

/// Everything a run needs besides the graph. Inputs that a caller may not
/// have provided yet are optional so that construction can report them.
#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    pub age_structure: Option<AgeStructure>,
    pub generic_infection: Option<f64>,
    pub state_transitions: StateTransitionTable,
    pub behaviours: Behaviours,
}

impl ModelParams {
    pub fn population_size(&self) -> Option<usize> {
        self.age_structure.as_ref().map(|a| a.values().sum())
    }

    pub fn with_infection_data(mut self, data: &InfectionData) -> Self {
        self.state_transitions = data.transition_table();
        self.generic_infection = Some(data.generic_infection);
        self
    }

    pub fn check_behaviours(&self) -> Result<()> {
        self.behaviours
            .iter()
            .try_for_each(|(name, spec)| spec.check(name))
    }
}
