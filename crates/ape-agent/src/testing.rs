//! Fixtures shared by the unit tests of this crate

use ape_common::{RawNode, RawSnapshot, Rect, TreeOptions, UiTree};
use ape_model::{Controller, Model, ModelConfig, NamingContext};
use ape_naming::BaseNaming;

use crate::agent::StatefulAgent;
use crate::config::AgentSettings;
use crate::device::MockSnapshotSource;

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

/// A single edit text on `activity`
pub fn form(activity: &str) -> UiTree {
    let mut root = node("android.widget.FrameLayout", "", "", false, Rect::new(0, 0, 100, 100));
    root.children.push(node(
        "android.widget.EditText",
        "name",
        "",
        true,
        Rect::new(0, 0, 100, 20),
    ));
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

/// Deterministic settings without model evolution, restarts or fuzzing
pub fn settings() -> AgentSettings {
    AgentSettings {
        seed: Some(7),
        evolve_model: false,
        check_restart: false,
        do_fuzzing: false,
        package: "com.example".into(),
        main_activity: "com.example.Main".into(),
        ..Default::default()
    }
}

pub fn model() -> Model {
    let ctx = NamingContext::new(true, true, BaseNaming::ActionType).unwrap();
    Model::new(ctx, ModelConfig::default())
}

pub fn stateful(settings: AgentSettings) -> StatefulAgent {
    StatefulAgent::new(model(), Controller::new(), settings)
}

/// A source that never yields a snapshot
pub fn null_source() -> MockSnapshotSource {
    let mut source = MockSnapshotSource::new();
    source.expect_snapshot().returning(|| Ok(None));
    source.expect_screenshot().returning(|| Ok(None));
    source
}
