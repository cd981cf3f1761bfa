//! The exploration model
//!
//! Owns everything the agent learns about the app under test: the observed
//! trees, the naming lattice and naming tree, the per-tree naming
//! assignment and the state/transition graph built on top of them.
//!
//! ```text
//!   UiTree ──insert──► TreeStore ──get_naming──► StateNamingManager
//!                          │                            │
//!                          └──────── StateKey ◄─────────┘
//!                                       │
//!                                       ▼
//!                                     Graph
//! ```
//!
//! When the controller changes the naming of some trees, [`Model::rebuild`]
//! removes the states those trees belonged to and replays their evidence
//! under the new naming.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use ape_common::{ActionType, GraphError, NodeId, Result, TreeId, UiTree};
use ape_naming::{NameId, NamingId, NamingResult};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::action::{Action, ActionId, ModelPayload};
use crate::config::ModelConfig;
use crate::controller::Controller;
use crate::graph::Graph;
use crate::naming_manager::{NamingContext, StateNamingManager};
use crate::state::StateId;
use crate::state_key::StateKey;
use crate::transition::{TransitionId, VisitKind};
use crate::tree::{GuiTree, TreeAction, TreeStore};

/// Model evolutions counted over a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelEvent {
    NonDeterministicTransition,
    ActionRefinement,
    StateAbstraction,
}

/// An executed action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Wall clock, milliseconds since the epoch
    pub clock_timestamp: i64,
    /// Agent step
    pub agent_timestamp: u64,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub(crate) ctx: NamingContext,
    pub(crate) manager: StateNamingManager,
    pub(crate) graph: Graph,
    pub(crate) trees: TreeStore,
    history: Vec<ActionRecord>,
    version: u32,
    counters: BTreeMap<ModelEvent, u32>,
    config: ModelConfig,
    /// Edges removed by a rebuild mapped to the edge their evidence moved to
    relocated_edges: HashMap<TransitionId, TransitionId>,
}

impl Model {
    pub fn new(ctx: NamingContext, config: ModelConfig) -> Self {
        Self {
            ctx,
            manager: StateNamingManager::new(),
            graph: Graph::new(),
            trees: TreeStore::new(),
            history: Vec::new(),
            version: 0,
            counters: BTreeMap::new(),
            config,
            relocated_edges: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn trees(&self) -> &TreeStore {
        &self.trees
    }

    pub fn tree(&self, id: TreeId) -> Result<&GuiTree> {
        self.trees.get(id)
    }

    pub fn naming(&self) -> &NamingContext {
        &self.ctx
    }

    pub fn manager(&self) -> &StateNamingManager {
        &self.manager
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn history(&self) -> &[ActionRecord] {
        &self.history
    }

    pub fn counters(&self) -> &BTreeMap<ModelEvent, u32> {
        &self.counters
    }

    pub fn append_to_history(&mut self, clock_timestamp: i64, agent_timestamp: u64, action: Action) {
        self.history.push(ActionRecord {
            clock_timestamp,
            agent_timestamp,
            action,
        });
    }

    /// Store a snapshot and resolve it to a state
    pub fn add_tree(&mut self, ui: UiTree, timestamp: u64) -> Result<(TreeId, StateId)> {
        let tree = self.trees.insert(ui, timestamp);
        let state = self.resolve_tree(tree)?;
        Ok((tree, state))
    }

    /// Assign the current naming to `tree` and attach it to its state
    pub(crate) fn resolve_tree(&mut self, id: TreeId) -> Result<StateId> {
        let tree = self.trees.get(id)?;
        let naming = self.manager.get_naming(&mut self.ctx, tree)?;
        let result = self.ctx.result(naming, tree)?;
        let key = StateKey::from_result(tree.activity(), naming, &result);
        let state = self.graph.get_or_create_state(key, &self.ctx.lattice);
        self.graph.append_tree(state, id)?;
        let tree = self.trees.get_mut(id)?;
        tree.set_naming(naming, result);
        tree.set_state(state);
        Ok(state)
    }

    /// Forget the cached naming data of a tree that is no longer used
    pub fn release(&mut self, tree: TreeId) {
        self.ctx.release(tree);
        self.manager.release(tree);
    }

    /// Drop the tree a refreshed snapshot superseded
    pub fn drop_refreshed_tree(&mut self, state: StateId) -> Result<Option<TreeId>> {
        let removed = self.graph.state_mut(state)?.remove_last_last_tree();
        if let Some(tree) = removed {
            self.release(tree);
        }
        Ok(removed)
    }

    pub fn is_trivial_state(&self, state: StateId) -> Result<bool> {
        Ok(self.graph.state(state)?.is_trivial(
            self.config.trivial_state_widget_threshold,
            self.config.trivial_state_action_threshold,
        ))
    }

    pub fn is_trivial_activity(&self, activity: &str) -> bool {
        self.graph.activity(activity).map_or(false, |a| {
            a.is_trivial(
                self.config.trivial_activity_state_threshold,
                self.config.trivial_activity_visit_threshold,
            )
        })
    }

    /// Key of `tree` under `naming`, whatever its assigned naming is
    pub fn state_key(&mut self, naming: NamingId, tree: TreeId) -> Result<StateKey> {
        let tree = self.trees.get(tree)?;
        self.ctx.state_key(naming, tree)
    }

    pub(crate) fn naming_result(&mut self, naming: NamingId, tree: TreeId) -> Result<Arc<NamingResult>> {
        let tree = self.trees.get(tree)?;
        self.ctx.result(naming, tree)
    }

    /// Name of `node` in `tree` under `naming`
    pub(crate) fn name_under(&mut self, naming: NamingId, tree: TreeId, node: NodeId) -> Result<Option<NameId>> {
        Ok(self.naming_result(naming, tree)?.name_of(node))
    }

    /// Pick a node for `action` in the latest tree of its state
    pub fn resolve_action<R: Rng + ?Sized>(
        &mut self,
        id: ActionId,
        throttle: u32,
        timestamp: u64,
        rng: &mut R,
    ) -> Result<()> {
        let tree_id = self.graph.state(id.state)?.latest_tree().ok_or_else(|| {
            GraphError::InvalidTransition(format!("state {} has no tree", id.state))
        })?;
        let tree = self.trees.get(tree_id)?;
        let action = self.graph.action_mut(id)?;
        let (node, nodes) = match action.target {
            Some(name) => {
                let nodes = tree.nodes_of(name).to_vec();
                (nodes.choose(rng).copied(), nodes)
            }
            None => (None, Vec::new()),
        };
        action.resolve_at(timestamp, throttle, tree_id, node, nodes)
    }

    /// Selector of `node` under the finest namer
    pub fn full_xpath(&mut self, tree: TreeId, node: NodeId) -> Result<String> {
        let full = self.ctx.lattice.full_namer()?;
        let ui = self.trees.get(tree)?.ui();
        let assigned = vec![None; ui.len()];
        let name = self.ctx.lattice.name_node(full, ui, node, &assigned)?;
        Ok(self.ctx.lattice.name(name).xpath.clone())
    }

    /// Executable form of a resolved model action
    pub fn to_action(&mut self, id: ActionId) -> Result<Action> {
        let action = self.graph.action(id)?.clone();
        let tree = action.resolved_tree().ok_or_else(|| {
            GraphError::InvalidTransition(format!("action {} is not resolved", action.label))
        })?;
        let node = action.resolved_node();
        let target = action.target.map(|t| self.ctx.lattice.name(t).xpath.clone());
        let (full, bounds) = match node {
            Some(node) => (
                Some(self.full_xpath(tree, node)?),
                Some(self.trees.get(tree)?.ui().node(node).bounds),
            ),
            None => (None, None),
        };
        Ok(Action::model(
            &action,
            ModelPayload {
                action: id,
                tree,
                node,
                target,
                full,
                bounds,
                input_text: None,
            },
        ))
    }

    /// Record the transition from `source` to `target`; without a source
    /// only the graph clock advances
    pub fn add_transition(
        &mut self,
        source: Option<(TreeId, TreeAction)>,
        target: TreeId,
        throttle: u32,
    ) -> Result<Option<TransitionId>> {
        let target_state = self.live_state_of(target)?;
        let Some((source_tree, mut action)) = source else {
            self.graph.observe(target_state)?;
            return Ok(None);
        };
        let source_state = self.live_state_of(source_tree)?;
        action.model_action = self.update_action(action.model_action, source_tree, &action)?;
        let tt = self.trees.add_transition(source_tree, action, target, throttle)?;
        let edge = self.graph.add_transition(
            source_state,
            action.model_action,
            target_state,
            tt,
            source_tree,
            throttle,
        )?;
        self.trees.transition_mut(tt)?.state_transition = Some(edge);
        Ok(Some(edge))
    }

    fn live_state_of(&self, tree: TreeId) -> Result<StateId> {
        let state = self
            .trees
            .get(tree)?
            .state()
            .ok_or_else(|| GraphError::InvalidTransition(format!("tree {} has no state", tree)))?;
        if !self.graph.contains(state) {
            return Err(GraphError::StaleState(state.0).into());
        }
        Ok(state)
    }

    /// `state` if it is still in the graph, else the state `tree` moved to
    pub fn update_state(&self, state: StateId, tree: TreeId) -> Result<StateId> {
        if self.graph.contains(state) {
            return Ok(state);
        }
        self.live_state_of(tree)
    }

    /// `action` if its state survived, else the action of the same type on
    /// the same node in the state `tree` moved to
    pub fn update_action(&self, action: ActionId, tree: TreeId, tree_action: &TreeAction) -> Result<ActionId> {
        if self.graph.contains(action.state) {
            return Ok(action);
        }
        let state = self.update_state(action.state, tree)?;
        self.action_of(state, tree, tree_action.node, tree_action.action_type)
    }

    /// The action of `state` acting on `node` of `tree`
    pub fn action_of(
        &self,
        state: StateId,
        tree: TreeId,
        node: Option<NodeId>,
        action_type: ActionType,
    ) -> Result<ActionId> {
        let state = self.graph.state(state)?;
        if !action_type.requires_target() {
            return state.get_untargeted(action_type);
        }
        let node = node.ok_or_else(|| GraphError::NoSuchAction {
            state: state.id.0,
            action_type: format!("{} without a node", action_type.as_str()),
        })?;
        let name = self.trees.get(tree)?.name_of(node).ok_or_else(|| GraphError::NoSuchAction {
            state: state.id.0,
            action_type: format!("{} on unnamed node {}", action_type.as_str(), node.0),
        })?;
        state.get_action(name, action_type)
    }

    /// `edge` if it survived, else the edge its evidence moved to
    pub fn update_transition(&self, edge: TransitionId) -> Option<TransitionId> {
        let mut current = edge;
        for _ in 0..=self.relocated_edges.len() {
            if self.graph.has_transition(current) {
                return Some(current);
            }
            current = *self.relocated_edges.get(&current)?;
        }
        None
    }

    /// Counterpart of `action` in `state`: the same action, the untargeted
    /// action of the same type, or the comparable target with the finest namer
    pub fn relocate(&self, state: StateId, action: ActionId) -> Result<Option<ActionId>> {
        if action.state == state {
            return Ok(Some(action));
        }
        let original = self.graph.action(action)?;
        let state = self.graph.state(state)?;
        let Some(target) = original.target else {
            return Ok(state.get_untargeted(original.action_type).ok());
        };
        let lattice = &self.ctx.lattice;
        let best = state
            .actions()
            .iter()
            .filter(|a| a.action_type == original.action_type)
            .filter_map(|a| a.target.map(|t| (a.id, t)))
            .filter(|(_, t)| lattice.name_refines_to(target, *t) || lattice.name_refines_to(*t, target))
            .max_by(|(_, a), (_, b)| lattice.compare(lattice.name(*a).namer, lattice.name(*b).namer));
        Ok(best.map(|(id, _)| id))
    }

    /// Re-resolve every tree whose assigned naming changed
    #[instrument(level = "debug", skip(self), fields(version = self.version))]
    pub fn rebuild(&mut self) -> Result<()> {
        let start = Instant::now();

        // Step 1: states holding a tree whose naming changed
        let mut affected = BTreeSet::new();
        for state in self.graph.states() {
            for id in state.trees() {
                let tree = self.trees.get(*id)?;
                let naming = self.manager.get_naming(&mut self.ctx, tree)?;
                if tree.naming() != Some(naming) {
                    affected.insert(state.id);
                    break;
                }
            }
        }
        if affected.is_empty() {
            return Ok(());
        }

        // Step 2: remove them, keeping their trees and evidence
        let mut trees = Vec::new();
        let mut evidence = Vec::new();
        let mut removed_edges = Vec::new();
        for id in &affected {
            trees.extend_from_slice(self.graph.state(*id)?.trees());
            for edge in self.graph.remove(*id)? {
                evidence.extend_from_slice(edge.tree_transitions());
                removed_edges.push((edge.id, edge.last_tree_transition()));
            }
        }
        let store = &self.trees;
        trees.sort_by_key(|t| (store.get(*t).map(|t| t.timestamp).unwrap_or(0), *t));
        trees.dedup();
        evidence.sort_by_key(|t| (store.transition(*t).map(|t| t.timestamp).unwrap_or(0), *t));
        evidence.dedup();

        // Step 3: new version for the states created below
        self.version += 1;
        self.graph.set_version(self.version);

        // Step 4: re-resolve the trees
        for tree in &trees {
            self.resolve_tree(*tree)?;
        }

        // Step 5: re-add the edges
        for tt_id in &evidence {
            let tt = self.trees.transition(*tt_id)?.clone();
            let source = self.live_state_of(tt.source)?;
            let target = self.live_state_of(tt.target)?;
            let action = self.action_of(source, tt.source, tt.action.node, tt.action.action_type)?;
            self.trees.transition_mut(*tt_id)?.action.model_action = action;
            let edge = self.graph.add_rebuilt_transition(
                source,
                action,
                target,
                *tt_id,
                tt.source,
                tt.throttle,
                tt.timestamp,
            )?;
            self.trees.transition_mut(*tt_id)?.state_transition = Some(edge);
        }
        for (old, last) in removed_edges {
            let Some(last) = last else { continue };
            if let Some(new) = self.trees.transition(last)?.state_transition {
                self.relocated_edges.insert(old, new);
            }
        }

        // Step 6: edge statistics follow the history again
        self.graph.rebuild_history(&self.trees)?;

        // Step 7: executed actions point at the rebuilt states
        self.refresh_history();
        info!(
            version = self.version,
            removed = affected.len(),
            trees = trees.len(),
            evidence = evidence.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model rebuilt"
        );
        Ok(())
    }

    fn refresh_history(&mut self) {
        let mut updates = Vec::new();
        for (index, record) in self.history.iter().enumerate() {
            let Some(payload) = record.action.model_payload() else {
                continue;
            };
            if self.graph.contains(payload.action.state) {
                continue;
            }
            let tree_action = TreeAction {
                action_type: record.action.action_type,
                node: payload.node,
                model_action: payload.action,
            };
            match self.update_action(payload.action, payload.tree, &tree_action) {
                Ok(updated) => updates.push((index, updated)),
                Err(e) => debug!(index, error = %e, "history record left stale"),
            }
        }
        for (index, updated) in updates {
            if let Some(payload) = self.history[index].action.model_payload_mut() {
                payload.action = updated;
            }
        }
    }

    fn count(&mut self, event: ModelEvent, version: u32, start: Instant) -> bool {
        if version == self.version {
            return false;
        }
        *self.counters.entry(event).or_insert(0) += 1;
        info!(
            event = ?event,
            version = self.version,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model evolved"
        );
        true
    }

    /// Try to split the targets of a freshly non-deterministic edge
    pub fn resolve_non_deterministic_transitions(
        &mut self,
        controller: &mut Controller,
        edge: TransitionId,
    ) -> Result<bool> {
        let transition = self.graph.transition(edge)?;
        if transition.kind != VisitKind::NewActionTarget {
            return Ok(false);
        }
        if self.graph.action(transition.action)?.is_back() {
            return Ok(false);
        }
        let (version, start) = (self.version, Instant::now());
        controller.resolve_non_determinism(self, edge)?;
        Ok(self.count(ModelEvent::NonDeterministicTransition, version, start))
    }

    /// Try to split the nodes an action resolves to
    pub fn action_refinement(&mut self, controller: &mut Controller, action: ActionId) -> Result<bool> {
        let (version, start) = (self.version, Instant::now());
        controller.action_refinement(self, action)?;
        Ok(self.count(ModelEvent::ActionRefinement, version, start))
    }

    /// Try to merge the states of `naming` that look alike under its parent
    pub fn state_abstraction(
        &mut self,
        controller: &mut Controller,
        naming: NamingId,
        state: StateId,
        target_naming: NamingId,
        target_states: &BTreeSet<StateId>,
    ) -> Result<bool> {
        let (version, start) = (self.version, Instant::now());
        controller.batch_abstract(self, naming, state, target_naming, target_states)?;
        Ok(self.count(ModelEvent::StateAbstraction, version, start))
    }

    /// Recompute the cached naming results after deserialization
    pub(crate) fn restore(&mut self) -> Result<()> {
        self.ctx.lattice.reindex();
        let ids: Vec<TreeId> = self.trees.iter().map(|t| t.id).collect();
        for id in ids {
            let tree = self.trees.get(id)?;
            let Some(naming) = tree.naming() else { continue };
            let result = self.ctx.result(naming, tree)?;
            self.trees.get_mut(id)?.set_naming(naming, result);
        }
        debug!(trees = self.trees.len(), "naming results restored");
        Ok(())
    }
}
