//! Fixtures shared by the unit tests of this crate

use ape_common::{ActionType, NodeId, RawNode, RawSnapshot, Rect, TreeId, TreeOptions, UiTree};
use ape_naming::{BaseNaming, NamerLattice, NamerType, NamerTypeSet, NamingId, NamingTree, Selector};

use crate::config::ModelConfig;
use crate::graph::Graph;
use crate::model::Model;
use crate::naming_manager::NamingContext;
use crate::state::StateId;
use crate::state_key::StateKey;
use crate::transition::TransitionId;
use crate::tree::TreeAction;

pub fn name_tree() -> (NamerLattice, NamingTree) {
    let lattice = NamerLattice::new(true, true).unwrap();
    let namings = NamingTree::new(&lattice, BaseNaming::ActionType).unwrap();
    (lattice, namings)
}

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

/// A frame holding a list of clickable rows; each entry is `resource-id`
/// and text of one row
pub fn list_tree(activity: &str, rows: &[&str]) -> UiTree {
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
    UiTree::build(
        &RawSnapshot {
            activity: activity.into(),
            root,
        },
        &TreeOptions::default(),
    )
    .unwrap()
}

/// `n` states of activity `A`, each with a differently identified row
pub fn graph_with_states(n: usize) -> (Graph, NamerLattice, Vec<StateId>) {
    let (mut lattice, mut namings) = name_tree();
    let mut graph = Graph::new();
    let base = namings.base();
    let mut states = Vec::with_capacity(n);
    for i in 0..n {
        let row = format!("w{}", i);
        let ui = list_tree("A", &[row.as_str()]);
        let result = namings
            .naming_result(&mut lattice, base, TreeId(i as u32), &ui)
            .unwrap();
        let key = StateKey::from_result("A", base, &result);
        states.push(graph.get_or_create_state(key, &lattice));
    }
    (graph, lattice, states)
}

pub fn key(graph: &Graph, state: StateId) -> StateKey {
    graph.state(state).unwrap().key().clone()
}

pub fn model(config: ModelConfig) -> Model {
    let ctx = NamingContext::new(true, true, BaseNaming::ActionType).unwrap();
    Model::new(ctx, config)
}

/// Node of `tree` whose resource id is `id`
pub fn row(model: &Model, tree: TreeId, id: &str) -> NodeId {
    let ui = model.tree(tree).unwrap().ui();
    ui.node_ids().find(|n| ui.node(*n).resource_id == id).unwrap()
}

/// Record a click on row `id` of `source` that led to `target`
pub fn click(model: &mut Model, source: TreeId, id: &str, target: TreeId) -> TransitionId {
    let node = row(model, source, id);
    let state = model.tree(source).unwrap().state().unwrap();
    let action = model
        .action_of(state, source, Some(node), ActionType::ModelClick)
        .unwrap();
    let tree_action = TreeAction {
        action_type: ActionType::ModelClick,
        node: Some(node),
        model_action: action,
    };
    model
        .add_transition(Some((source, tree_action)), target, 0)
        .unwrap()
        .unwrap()
}

/// Child of `naming` telling clickable nodes apart by type and text
pub fn text_refinement(model: &mut Model, naming: NamingId) -> NamingId {
    let ctx = &mut model.ctx;
    let namelet = ctx.namings.naming(naming).namelets[0];
    let namer = ctx
        .lattice
        .namer_for(NamerTypeSet::of(&[NamerType::Type, NamerType::Text]))
        .unwrap();
    let selector = Selector::parse("//*[@clickable='true']").unwrap();
    ctx.namings
        .extend(&ctx.lattice, naming, namelet, selector, namer)
        .unwrap()
}

/// Two single-row screens of `A` that look alike under the base naming,
/// where clicking the row led to `B` from the first and to `C` from the
/// second. Returns both edges.
pub fn diverging_clicks(model: &mut Model) -> (TransitionId, TransitionId) {
    let (a1, _) = model.add_tree(list_tree("A", &["x"]), 0).unwrap();
    let (b, _) = model.add_tree(list_tree("B", &[]), 1).unwrap();
    let first = click(model, a1, "x", b);
    let (a2, _) = model.add_tree(list_tree("A", &["y"]), 2).unwrap();
    let (c, _) = model.add_tree(list_tree("C", &[]), 3).unwrap();
    let second = click(model, a2, "y", c);
    (first, second)
}
