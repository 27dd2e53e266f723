use crate::*;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::time::Instant;

const INFECTION_DATA: &str = r#"{
    "generic_infection": 0.3,
    "state_transitions": {
        "E": {"A": {"young": 0.6, "old": 0.3}, "I": {"young": 0.4, "old": 0.7}},
        "A": {"R": {"young": 0.5, "old": 0.4}, "A": {"young": 0.5, "old": 0.6}},
        "I": {"I": {"young": 0.6, "old": 0.5}, "H": {"young": 0.1, "old": 0.3}, "R": {"young": 0.3, "old": 0.2}},
        "H": {"H": {"young": 0.7, "old": 0.6}, "D": {"young": 0.05, "old": 0.2}, "R": {"young": 0.25, "old": 0.2}}
    }
}"#;

fn community(groups: &[(&str, usize)]) -> AgeStructure {
    groups.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn sim_config(time_horizon: usize, num_infected: usize) -> SimulationConfig {
    SimulationConfig {
        time_horizon,
        num_infected,
        graph_config: GraphConfiguration::default(),
    }
}

fn realistic_params() -> ModelParams {
    let data = InfectionData::from_json_str(INFECTION_DATA).unwrap();
    ModelParams {
        age_structure: Some(community(&[("young", 60), ("old", 40)])),
        behaviours: behaviours_from_variants(["food_shopping_2_3", "church_1_5", "sport_0_4"]).unwrap(),
        ..Default::default()
    }
    .with_infection_data(&data)
}

fn deterministic_chain(age_group: &str) -> StateTransitionTable {
    let mut table = StateTransitionTable::default();
    table.insert(Compartment::Exposed, age_group, Compartment::Asymptomatic, 1.0);
    table.insert(Compartment::Asymptomatic, age_group, Compartment::Symptomatic, 1.0);
    table.insert(Compartment::Symptomatic, age_group, Compartment::Hospitalised, 1.0);
    table.insert(Compartment::Hospitalised, age_group, Compartment::Recovered, 1.0);
    table
}

#[test]
fn seeded_node_progresses_deterministically() {
    let params = ModelParams {
        age_structure: Some(community(&[("all", 5)])),
        generic_infection: Some(1.0),
        state_transitions: deterministic_chain("all"),
        ..Default::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let mut graph = construct_graph(&params, &sim_config(7, 1), &mut rng).unwrap();
    assert_eq!(graph.node_count(), 5);

    let outcome = run_single(&mut graph, &params, rng).unwrap();
    let timeline = &outcome.timeline;
    let seeded = graph
        .nodes()
        .find(|n| timeline.get(0, *n) == Compartment::Symptomatic)
        .unwrap();
    assert_eq!(timeline.get(1, seeded), Compartment::Hospitalised);
    for t in 2..=7 {
        assert_eq!(timeline.get(t, seeded), Compartment::Recovered);
    }
    // every neighbour is exposed right away
    for link in graph.neighbours(seeded) {
        assert_eq!(timeline.get(1, link.peer), Compartment::Exposed);
    }

    assert_eq!(outcome.series.steps, vec![0, 7]);
    assert_eq!(outcome.series.counts[0][Compartment::Symptomatic], 1);
    assert_eq!(outcome.series.counts[0][Compartment::Susceptible], 4);
    assert_eq!(outcome.series.counts[1].total(), 5);
    assert_eq!(outcome.fallback_draws, 0);
}

#[test]
fn nine_people_fill_a_three_by_three_grid() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let graph = Graph::construct(&community(&[("x", 9)]), 0.1, &sim_config(7, 1), &mut rng).unwrap();
    assert_eq!(graph.node_count(), 9);
    assert_eq!(graph.side(), 3);
    assert_eq!(graph.close_nodes().size(), 9);
    let mut cells: Vec<_> = graph.nodes().map(|n| graph.location(n)).collect();
    cells.dedup();
    assert_eq!(cells.len(), 9);
    // no deletions means node ids follow the grid in row-major order
    for node in graph.nodes() {
        assert_eq!(graph.location(node), Location { x: node / 3, y: node % 3 });
    }
}

#[test]
fn states_only_move_along_allowed_transitions() {
    let params = realistic_params();
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let mut graph = construct_graph(&params, &sim_config(42, 5), &mut rng).unwrap();
    let outcome = run_single(&mut graph, &params, rng).unwrap();
    let timeline = &outcome.timeline;
    let table = &params.state_transitions;

    for t in 0..42 {
        assert_eq!(timeline.counts(t).total(), 100);
        for node in graph.nodes() {
            let (now, next) = (timeline.get(t, node), timeline.get(t + 1, node));
            match now {
                Compartment::Susceptible => {
                    assert!(next == Compartment::Susceptible || next == Compartment::Exposed)
                }
                Compartment::Dead | Compartment::Recovered => assert_eq!(now, next),
                _ => {
                    let allowed = table.distribution(now, graph.age_group(node)).unwrap();
                    assert!(allowed.contains_key(&next), "{} -> {} not allowed", now, next);
                }
            }
        }
    }
    assert_eq!(graph.transient_edge_count(), 0);
    assert!(outcome.scheduler.visits > 0);
}

#[test]
fn aggregated_counts_always_sum_to_population() {
    let params = realistic_params();
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let mut graph = construct_graph(&params, &sim_config(28, 3), &mut rng).unwrap();
    let lattice_edges = graph.edge_count();

    let options = MultiRunOptions {
        seed: 11,
        ..Default::default()
    };
    let start = Instant::now();
    let aggregated = run_multiple(&mut graph, &params, 8, &options).unwrap();
    println!("8 runs took {:?}", start.elapsed());

    assert_eq!(aggregated.runs, 8);
    assert_eq!(aggregated.series.steps, vec![0, 7, 14, 21, 28]);
    assert_eq!(aggregated.stddev.len(), 5);
    for counts in &aggregated.series.counts {
        assert_eq!(counts.total(), 100);
    }
    // all runs start with the same number of infections
    assert_eq!(aggregated.series.counts[0][Compartment::Symptomatic], 3);
    assert_eq!(aggregated.stddev[0][Compartment::Symptomatic.index()], 0.);
    assert_eq!(graph.edge_count(), lattice_edges);

    let json = aggregated.to_json();
    assert_eq!(json["S"].as_array().unwrap().len(), 5);
}

#[test]
fn shared_and_copied_graphs_give_the_same_runs() {
    let params = realistic_params();
    let mut rng = ChaCha8Rng::seed_from_u64(6);
    let mut graph = construct_graph(&params, &sim_config(21, 2), &mut rng).unwrap();
    let run = |graph: &mut Graph, reuse| {
        let options = MultiRunOptions {
            seed: 1,
            reuse,
            show_progress: false,
        };
        run_multiple(graph, &params, 4, &options).unwrap()
    };
    let shared = run(&mut graph, GraphReuse::Shared);
    let copied = run(&mut graph, GraphReuse::Copied);
    assert_eq!(shared, copied);

    let rebuilt = run(&mut graph, GraphReuse::Rebuilt);
    for counts in &rebuilt.series.counts {
        assert_eq!(counts.total(), 100);
    }
}

#[test]
fn zero_runs_is_an_error() {
    let params = realistic_params();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut graph = construct_graph(&params, &sim_config(7, 1), &mut rng).unwrap();
    assert!(matches!(
        run_multiple(&mut graph, &params, 0, &MultiRunOptions::default()),
        Err(Error::InvalidInput { field: "num_runs", .. })
    ));
}

#[test]
fn missing_age_group_transitions_stop_the_run() {
    let mut params = realistic_params();
    params.state_transitions = deterministic_chain("young");
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let mut graph = construct_graph(&params, &sim_config(7, 1), &mut rng).unwrap();
    assert!(matches!(
        run_single(&mut graph, &params, rng),
        Err(Error::InvalidTransitions { .. })
    ));
}

#[test]
fn reloaded_graph_can_be_reused() {
    let params = realistic_params();
    let config = sim_config(14, 2);
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let graph = construct_graph(&params, &config, &mut rng).unwrap();
    let stored = serde_json::to_string(&graph).unwrap();

    let mut reloaded: Graph = serde_json::from_str(&stored).unwrap();
    reloaded
        .validate_reloaded(&GraphExpectations::new(&config, &params).unwrap())
        .unwrap();
    let outcome = run_single(&mut reloaded, &params, rng).unwrap();
    assert_eq!(outcome.series.len(), 3);

    let err = reloaded
        .validate_reloaded(&GraphExpectations::new(&sim_config(21, 2), &params).unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("time_horizon"));
}

#[test]
fn doubling_times_follow_the_outbreak() {
    let params = ModelParams {
        generic_infection: Some(1.0),
        ..realistic_params()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(10);
    let mut graph = construct_graph(&params, &sim_config(30, 1), &mut rng).unwrap();
    let outcome = run_single(&mut graph, &params, rng).unwrap();
    let doubling = outcome.timeline.doubling_times();
    assert_eq!(doubling.len(), 30);
    // with certain transmission the first case has company the next day
    assert_eq!(doubling[0], Some(1));
}
