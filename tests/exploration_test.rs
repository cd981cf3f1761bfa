//! End-to-end exploration tests
//!
//! - Non-deterministic clicks split the source state
//! - Trees survive every rebuild
//! - A full run over a snapshot directory, then a resumed model

mod common;

use ape::agent::{Agent, ApeConfig, DirectorySource, DryRunDevice, SataStrategy};
use ape::model::{ModelConfig, ModelEvent, ModelSnapshot, StateId};
use ape::{ApeAgent, Explorer};
use common::*;
use proptest::prelude::*;

/// Source of the non-back edge entering the state of `activity`
fn entered_from(agent: &ape::agent::StatefulAgent, activity: &str) -> StateId {
    let graph = agent.model().graph();
    let state = graph
        .states()
        .find(|s| s.activity() == activity)
        .unwrap_or_else(|| panic!("no state for {}", activity));
    let edge = graph
        .in_edges(state.id)
        .into_iter()
        .find(|e| !graph.action(e.action).unwrap().is_back())
        .unwrap_or_else(|| panic!("nothing enters {}", activity));
    edge.source
}

#[test]
fn test_non_determinism_splits_source_state() {
    let config = ModelConfig {
        action_refinement_first: false,
        ..Default::default()
    };
    let mut agent = stateful(settings(true), config);
    let mut source = NullSource;
    let mut strategy = Clicker;

    // Rows x and y look alike under the base naming
    let steps = [
        screen("A", &["x"]),
        blank("B"),
        screen("A", &["y"]),
        blank("C"),
    ];
    let mut states = Vec::new();
    for ui in steps {
        agent.tick();
        agent.step(ui, &mut source, &mut strategy).unwrap();
        states.push(agent.current_state().unwrap());
    }
    // The merged source state was rebuilt away
    assert!(agent.model().graph().state(states[0]).is_err());

    let to_b = entered_from(&agent, "B");
    let to_c = entered_from(&agent, "C");
    assert_ne!(to_b, to_c);
    let graph = agent.model().graph();
    assert_eq!(graph.state(to_b).unwrap().activity(), "A");
    assert_eq!(graph.state(to_c).unwrap().activity(), "A");
    assert_eq!(
        agent.model().counters().get(&ModelEvent::NonDeterministicTransition),
        Some(&1)
    );
    assert_trees_accounted(&agent);
}

#[test]
fn test_deterministic_clicks_keep_one_state() {
    let mut agent = stateful(settings(true), ModelConfig::default());
    let mut source = NullSource;
    let mut strategy = Clicker;
    for ui in [screen("A", &["x"]), blank("B"), screen("A", &["y"]), blank("B")] {
        agent.tick();
        agent.step(ui, &mut source, &mut strategy).unwrap();
    }
    let graph = agent.model().graph();
    assert_eq!(graph.states().filter(|s| s.activity() == "A").count(), 1);
    assert!(agent.model().counters().get(&ModelEvent::NonDeterministicTransition).is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_trees_survive_exploration(screens in prop::collection::vec((0usize..3, 1usize..5), 1..30)) {
        let mut agent = stateful(settings(true), ModelConfig::default());
        let mut source = NullSource;
        let mut strategy = SataStrategy::new(0.1);
        let rows = ["r0", "r1", "r2", "r3"];
        for (activity, count) in screens {
            agent.tick();
            let ui = screen(["A", "B", "C"][activity], &rows[..count]);
            prop_assert!(agent.step(ui, &mut source, &mut strategy).is_ok());
        }
        assert_trees_accounted(&agent);
        for edge in agent.model().graph().transitions() {
            prop_assert!(agent.model().graph().state(edge.source).is_ok());
            prop_assert!(agent.model().graph().state(edge.target).is_ok());
        }
    }
}

#[test]
fn test_directory_run_and_resume() {
    let snapshots = temp_dir("ape-snapshots");
    let output = temp_dir("ape-output");
    let main = vec!["search", "settings", "about", "help", "share", "rate"];
    let pages = [
        ("Main", main.clone()),
        ("Search", vec!["query", "go", "clear", "voice", "history", "filters"]),
        ("Main", main.clone()),
        ("Settings", vec!["wifi", "sound", "display", "storage", "battery", "privacy"]),
        ("Main", main.clone()),
        ("About", vec!["licenses", "version", "terms", "credits", "contact", "website"]),
        ("Main", main.clone()),
        ("Search", vec!["query", "go", "clear", "voice", "history", "filters"]),
    ];
    for (i, (activity, labels)) in pages.iter().enumerate() {
        std::fs::write(
            snapshots.join(format!("{:03}.json", i)),
            snapshot_json(activity, labels),
        )
        .unwrap();
    }

    let mut config = ApeConfig::default();
    config.agent = settings(true);
    config.io.output_dir = output.clone();
    config.io.snapshot_dir = Some(snapshots.clone());
    config.io.model_path = Some(output.join("resume.bin"));

    let source = DirectorySource::open(&snapshots, config.io.tree_options()).unwrap();
    let agent = ApeAgent::from_config(&config).unwrap();
    let mut explorer = Explorer::new(agent, source, DryRunDevice::new(), &config).unwrap();
    let summary = explorer.run(100).unwrap();

    assert_eq!(summary.steps, pages.len() as u64 + 1);
    assert!(summary.stop_reason.as_deref().unwrap_or("").contains("exhausted"));
    assert!(summary.states >= 4);
    let log = std::fs::read_to_string(output.join("action.log")).unwrap();
    assert_eq!(log.lines().count() as u64, summary.actions_performed);
    assert!(output.join("sataGraph.dot").exists());

    let inner = explorer.agent().inner();
    ModelSnapshot::save(&output.join("resume.bin"), inner.model(), inner.controller()).unwrap();
    let resumed = ApeAgent::from_config(&config).unwrap();
    assert_eq!(resumed.model().graph().len(), summary.states);
    assert_eq!(resumed.model().history().len(), explorer.agent().model().history().len());

    std::fs::remove_dir_all(&snapshots).ok();
    std::fs::remove_dir_all(&output).ok();
}
