//! Fixtures shared by the integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use ape::agent::{AgentSettings, Selection, SnapshotSource, StatefulAgent, Strategy};
use ape::common::{ActionType, RawNode, RawSnapshot, Rect, Result, TreeOptions, UiTree};
use ape::model::{Controller, Model, ModelAction, ModelConfig, NamingContext};
use ape::naming::BaseNaming;

fn node(class: &str, id: &str, text: &str, clickable: bool, bounds: Rect) -> RawNode {
    RawNode {
        class_name: class.into(),
        resource_id: id.into(),
        text: text.into(),
        clickable,
        enabled: true,
        bounds,
        ..Default::default()
    }
}

/// A list of clickable rows on `activity`
pub fn screen(activity: &str, rows: &[&str]) -> UiTree {
    let mut list = node("android.widget.ListView", "list", "", false, Rect::new(0, 0, 100, 100));
    list.scrollable = true;
    for (i, row) in rows.iter().enumerate() {
        let top = i as i32 * 10;
        list.children.push(node(
            "android.widget.TextView",
            row,
            row,
            true,
            Rect::new(0, top, 100, top + 10),
        ));
    }
    let mut root = node("android.widget.FrameLayout", "", "", false, Rect::new(0, 0, 100, 100));
    root.children.push(list);
    build(activity, root)
}

/// A screen without any actionable widget
pub fn blank(activity: &str) -> UiTree {
    let root = node("android.widget.FrameLayout", "", "", false, Rect::new(0, 0, 100, 100));
    build(activity, root)
}

fn build(activity: &str, root: RawNode) -> UiTree {
    UiTree::build(
        &RawSnapshot {
            activity: activity.into(),
            root,
        },
        &TreeOptions::default(),
    )
    .unwrap()
}

/// Snapshot document with one button per label, as a device dump would look
pub fn snapshot_json(activity: &str, labels: &[&str]) -> String {
    let children: Vec<String> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            format!(
                r#"{{"class": "android.widget.Button", "resource-id": "{label}", "text": "{label}",
                    "clickable": true, "enabled": true, "bounds": "[0,{}][100,{}]"}}"#,
                i * 20,
                i * 20 + 20
            )
        })
        .collect();
    format!(
        r#"{{"activity": "{activity}", "root": {{"class": "android.widget.FrameLayout",
            "bounds": "[0,0][100,200]", "enabled": true, "children": [{}]}}}}"#,
        children.join(",")
    )
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn settings(evolve_model: bool) -> AgentSettings {
    AgentSettings {
        seed: Some(11),
        evolve_model,
        check_restart: false,
        do_fuzzing: false,
        package: "com.example".into(),
        main_activity: "com.example.Main".into(),
        ..Default::default()
    }
}

pub fn stateful(settings: AgentSettings, config: ModelConfig) -> StatefulAgent {
    let ctx = NamingContext::new(true, true, BaseNaming::ActionType).unwrap();
    StatefulAgent::new(Model::new(ctx, config), Controller::new(), settings)
}

/// Never yields a snapshot
pub struct NullSource;

impl SnapshotSource for NullSource {
    fn snapshot(&mut self) -> Result<Option<UiTree>> {
        Ok(None)
    }

    fn screenshot(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Clicks the first valid click of every state, else goes back
pub struct Clicker;

impl Strategy for Clicker {
    fn name(&self) -> &'static str {
        "clicker"
    }

    fn select(&mut self, agent: &mut StatefulAgent, _: &mut dyn SnapshotSource) -> Result<Selection> {
        if let Some(id) = agent.select_from_buffer()? {
            return Ok(Selection::Model(id));
        }
        let state = agent.model().graph().state(agent.new_state()?)?;
        let click = state.first_action(&|a: &ModelAction| a.action_type == ActionType::ModelClick && a.valid);
        match click {
            Some(id) => Ok(Selection::Model(id)),
            None => Ok(Selection::Model(agent.handle_null_action()?)),
        }
    }
}

/// Every tree is held by exactly the state it points at
pub fn assert_trees_accounted(agent: &StatefulAgent) {
    let model = agent.model();
    let mut held = 0;
    for state in model.graph().states() {
        for tree in state.trees() {
            assert_eq!(model.tree(*tree).unwrap().state(), Some(state.id));
            held += 1;
        }
    }
    assert_eq!(held, model.trees().len());
}
