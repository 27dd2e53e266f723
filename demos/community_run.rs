/* Include our library */
use contact_epidemic::*;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const SIMULATION: &str = r#"{
    "time_horizon": 84,
    "num_infected": 5,
    "graph_config": {
        "params": {"short_connection_diameter": 1, "long_connection_diameter": 4, "decay": 2.0},
        "closeness_threshold": 2
    }
}"#;

const INFECTION: &str = r#"{
    "generic_infection": 0.05,
    "state_transitions": {
        "E": {"A": {"(0, 19)": 0.7, "(20, 59)": 0.5, "(60, 99)": 0.3},
              "I": {"(0, 19)": 0.3, "(20, 59)": 0.5, "(60, 99)": 0.7}},
        "A": {"A": {"(0, 19)": 0.8, "(20, 59)": 0.8, "(60, 99)": 0.8},
              "R": {"(0, 19)": 0.2, "(20, 59)": 0.2, "(60, 99)": 0.2}},
        "I": {"I": {"(0, 19)": 0.8, "(20, 59)": 0.75, "(60, 99)": 0.7},
              "H": {"(0, 19)": 0.01, "(20, 59)": 0.05, "(60, 99)": 0.15},
              "R": {"(0, 19)": 0.19, "(20, 59)": 0.2, "(60, 99)": 0.15}},
        "H": {"H": {"(0, 19)": 0.8, "(20, 59)": 0.8, "(60, 99)": 0.75},
              "D": {"(0, 19)": 0.01, "(20, 59)": 0.04, "(60, 99)": 0.15},
              "R": {"(0, 19)": 0.19, "(20, 59)": 0.16, "(60, 99)": 0.1}}
    }
}"#;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    /* behaviours come in as variant strings: name_visits_people */
    let behaviour_variants: Vec<String> = std::env::args().skip(1).collect();
    let behaviours = if behaviour_variants.is_empty() {
        behaviours_from_variants(["food_shopping_2_5", "church_1_20", "school_5_10"])?
    } else {
        behaviours_from_variants(behaviour_variants.iter().map(String::as_str))?
    };

    let config = SimulationConfig::from_json_str(SIMULATION)?;
    let params = ModelParams {
        age_structure: Some(
            [("(0, 19)", 400), ("(20, 59)", 1000), ("(60, 99)", 600)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        ),
        behaviours,
        ..Default::default()
    }
    .with_infection_data(&InfectionData::from_json_str(INFECTION)?);

    let start = Instant::now();
    let mut graph = construct_graph(&params, &config, &mut ChaCha8Rng::seed_from_u64(42))?;
    println!("Graph with {} edges built in {:?}", graph.edge_count(), start.elapsed());

    let options = MultiRunOptions {
        seed: 42,
        reuse: GraphReuse::Copied,
        show_progress: true,
    };
    let aggregated = run_multiple(&mut graph, &params, 50, &options)?;
    println!("{}", aggregated.series);
    println!("{}", aggregated.to_json());
    Ok(())
}
