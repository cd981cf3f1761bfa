//! State/transition graph
//!
//! Arenas of states and transitions addressed by [`StateId`] and
//! [`TransitionId`]. Removed entries leave a tombstone so ids stay stable
//! across rebuilds; every index over them (key, naming, activity, action,
//! name) is maintained here.
//!
//! ```text
//!   StateKey ──> StateId ──> State { actions[ActionId], trees }
//!                   │
//!                   └── out/in ──> TransitionId ──> StateTransition { hits, misses, evidence }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use ape_common::{GraphError, Result, TreeId};
use ape_naming::{NameId, NamerLattice, NamingId, NamingTree};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::action::{ActionFilter, ActionId, ActionPredicate, ModelAction};
use crate::activity::ActivityNode;
use crate::filter::{FnFilter, SubsequenceFilter};
use crate::state::{State, StateId};
use crate::state_key::StateKey;
use crate::subsequence::Subsequence;
use crate::transition::{StateTransition, TransitionId, VisitKind};
use crate::tree::{TreeStore, TreeTransitionId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    version: u32,
    timestamp: u64,
    states: Vec<Option<State>>,
    transitions: Vec<Option<StateTransition>>,
    key_to_state: HashMap<StateKey, StateId>,
    naming_to_states: HashMap<NamingId, BTreeSet<StateId>>,
    activities: BTreeMap<String, ActivityNode>,
    /// `(action, target)` identifies an edge; the source is the action's state
    edge_index: HashMap<(ActionId, StateId), TransitionId>,
    action_edges: HashMap<ActionId, Vec<TransitionId>>,
    visited_actions: BTreeSet<ActionId>,
    unvisited_actions: BTreeSet<ActionId>,
    name_to_actions: HashMap<String, HashMap<NameId, BTreeSet<ActionId>>>,
    entry_trees: BTreeSet<TreeId>,
    clean_entry_trees: BTreeSet<TreeId>,
    entry_states: BTreeSet<StateId>,
    clean_entry_states: BTreeSet<StateId>,
    tree_history: Vec<TreeTransitionId>,
    edge_history: Vec<TransitionId>,
    state_counter: u32,
    edge_counter: u32,
    action_counter: u32,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Number of transitions added so far
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Number of live states
    pub fn len(&self) -> usize {
        self.key_to_state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_state.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_index.len()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter().flatten()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &StateTransition> {
        self.transitions.iter().flatten()
    }

    pub fn state(&self, id: StateId) -> Result<&State> {
        match self.states.get(id.index()) {
            Some(Some(state)) => Ok(state),
            Some(None) => Err(GraphError::StaleState(id.0).into()),
            None => Err(GraphError::UnknownState(id.0).into()),
        }
    }

    pub fn state_mut(&mut self, id: StateId) -> Result<&mut State> {
        match self.states.get_mut(id.index()) {
            Some(Some(state)) => Ok(state),
            Some(None) => Err(GraphError::StaleState(id.0).into()),
            None => Err(GraphError::UnknownState(id.0).into()),
        }
    }

    pub fn contains(&self, id: StateId) -> bool {
        matches!(self.states.get(id.index()), Some(Some(_)))
    }

    pub fn state_by_key(&self, key: &StateKey) -> Option<StateId> {
        self.key_to_state.get(key).copied()
    }

    pub fn action(&self, id: ActionId) -> Result<&ModelAction> {
        self.state(id.state)?.action(id)
    }

    pub fn action_mut(&mut self, id: ActionId) -> Result<&mut ModelAction> {
        self.state_mut(id.state)?.action_mut(id)
    }

    pub fn transition(&self, id: TransitionId) -> Result<&StateTransition> {
        self.transitions
            .get(id.index())
            .and_then(|t| t.as_ref())
            .ok_or_else(|| GraphError::MissingTransition(id.to_string()).into())
    }

    pub fn transition_mut(&mut self, id: TransitionId) -> Result<&mut StateTransition> {
        self.transitions
            .get_mut(id.index())
            .and_then(|t| t.as_mut())
            .ok_or_else(|| GraphError::MissingTransition(id.to_string()).into())
    }

    pub fn has_transition(&self, id: TransitionId) -> bool {
        matches!(self.transitions.get(id.index()), Some(Some(_)))
    }

    pub fn find_transition(&self, action: ActionId, target: StateId) -> Option<TransitionId> {
        self.edge_index.get(&(action, target)).copied()
    }

    pub fn out_edges(&self, state: StateId) -> Vec<&StateTransition> {
        self.edges_of(self.state(state).map(|s| s.out_edges()).unwrap_or(&[]))
    }

    pub fn in_edges(&self, state: StateId) -> Vec<&StateTransition> {
        self.edges_of(self.state(state).map(|s| s.in_edges()).unwrap_or(&[]))
    }

    pub fn action_out_edges(&self, action: ActionId) -> Vec<&StateTransition> {
        self.edges_of(
            self.action_edges
                .get(&action)
                .map(|v| v.as_slice())
                .unwrap_or(&[]),
        )
    }

    fn edges_of(&self, ids: &[TransitionId]) -> Vec<&StateTransition> {
        ids.iter().filter_map(|id| self.transition(*id).ok()).collect()
    }

    pub fn count_out_edges(&self, state: StateId) -> usize {
        self.state(state).map(|s| s.out_edges().len()).unwrap_or(0)
    }

    pub fn count_weak_out_edges(&self, state: StateId) -> usize {
        self.out_edges(state)
            .iter()
            .filter(|e| !e.is_strong())
            .count()
    }

    /// Actions of `state` that have at least one out-edge
    pub fn count_out_actions(&self, state: StateId) -> usize {
        self.state(state)
            .map(|s| {
                s.actions()
                    .iter()
                    .filter(|a| self.action_edges.contains_key(&a.id))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn has_in_edge_from(&self, state: StateId, other: StateId) -> bool {
        self.in_edges(state).iter().any(|e| e.source == other)
    }

    pub fn unvisited_action_count(&self) -> usize {
        self.unvisited_actions.len()
    }

    pub fn visited_action_count(&self) -> usize {
        self.visited_actions.len()
    }

    pub fn activity(&self, activity: &str) -> Option<&ActivityNode> {
        self.activities.get(activity)
    }

    pub fn activities(&self) -> impl Iterator<Item = &ActivityNode> {
        self.activities.values()
    }

    /// Visited actions over all actions of the activity's states
    pub fn activity_visited_rate(&self, activity: &str) -> f32 {
        let Some(node) = self.activities.get(activity) else {
            return 0.0;
        };
        let mut total = 0usize;
        let mut visited = 0usize;
        for state in node.states.iter().filter_map(|s| self.state(*s).ok()) {
            for action in state.actions() {
                total += 1;
                if action.is_visited() {
                    visited += 1;
                }
            }
        }
        if total == 0 {
            return 0.0;
        }
        visited as f32 / total as f32
    }

    /// Return the state for `key`, creating it with fresh actions if needed
    pub fn get_or_create_state(&mut self, key: StateKey, lattice: &NamerLattice) -> StateId {
        if let Some(id) = self.key_to_state.get(&key) {
            return *id;
        }
        let id = StateId(self.states.len() as u32);
        let label = format!("g{}s{}", self.version, self.state_counter);
        self.state_counter += 1;
        let activity = key.activity().to_string();
        let naming = key.naming();
        let mut state = State::new(id, label, key.clone(), lattice);

        let by_name = self.name_to_actions.entry(activity.clone()).or_default();
        for action in state.actions_mut() {
            action.label = format!("g{}a{}", self.version, self.action_counter);
            self.action_counter += 1;
            self.unvisited_actions.insert(action.id);
            if let Some(target) = action.target {
                by_name.entry(target).or_default().insert(action.id);
            }
        }
        debug!(state = %state, "state created");

        self.states.push(Some(state));
        self.key_to_state.insert(key, id);
        self.naming_to_states.entry(naming).or_default().insert(id);
        self.activities
            .entry(activity.clone())
            .or_insert_with(|| ActivityNode::new(activity))
            .states
            .insert(id);
        id
    }

    pub(crate) fn append_tree(&mut self, state: StateId, tree: TreeId) -> Result<()> {
        self.state_mut(state)?.append_tree(tree);
        Ok(())
    }

    pub fn add_entry_tree(&mut self, tree: TreeId) {
        self.entry_trees.insert(tree);
    }

    pub fn add_clean_entry_tree(&mut self, tree: TreeId) {
        self.clean_entry_trees.insert(tree);
    }

    pub fn is_entry_state(&self, state: StateId) -> bool {
        self.entry_states.contains(&state)
    }

    pub fn is_clean_entry_state(&self, state: StateId) -> bool {
        self.clean_entry_states.contains(&state)
    }

    pub fn entry_states(&self) -> &BTreeSet<StateId> {
        &self.entry_states
    }

    fn add_state_transition(
        &mut self,
        source: StateId,
        action: ActionId,
        target: StateId,
    ) -> Result<(TransitionId, bool)> {
        if action.state != source {
            return Err(GraphError::InvalidTransition(format!(
                "action {} does not belong to {}",
                action, source
            ))
            .into());
        }
        self.state(source)?;
        self.state(target)?;
        if let Some(existing) = self.edge_index.get(&(action, target)).copied() {
            self.transition_mut(existing)?.kind = VisitKind::Existing;
            return Ok((existing, false));
        }

        let id = TransitionId(self.transitions.len() as u32);
        let targets = self.action_edges.entry(action).or_default();
        targets.push(id);
        let kind = if targets.len() == 1 {
            VisitKind::NewAction
        } else {
            VisitKind::NewActionTarget
        };
        let label = format!("g{}e{}", self.version, self.edge_counter);
        self.edge_counter += 1;
        self.transitions.push(Some(StateTransition::new(
            id, label, source, action, target, kind,
        )));
        self.edge_index.insert((action, target), id);
        self.state_mut(source)?.out_edges.push(id);
        self.state_mut(target)?.in_edges.push(id);
        Ok((id, true))
    }

    fn record_entry(&mut self, source: StateId, source_tree: TreeId) {
        if self.entry_trees.contains(&source_tree) {
            self.entry_states.insert(source);
        }
        if self.clean_entry_trees.contains(&source_tree) {
            self.clean_entry_states.insert(source);
        }
    }

    /// Count an observation that has no source state, such as the first
    /// tree after a start; no edge is created
    pub fn observe(&mut self, target: StateId) -> Result<()> {
        self.state(target)?;
        self.timestamp += 1;
        Ok(())
    }

    /// Record an observed transition backed by `evidence`
    pub fn add_transition(
        &mut self,
        source: StateId,
        action: ActionId,
        target: StateId,
        evidence: TreeTransitionId,
        source_tree: TreeId,
        throttle: u32,
    ) -> Result<TransitionId> {
        let (id, added) = self.add_state_transition(source, action, target)?;
        self.timestamp += 1;
        let timestamp = self.timestamp;
        {
            let edge = self.transition_mut(id)?;
            edge.update_throttle(throttle);
            edge.trees.push(evidence);
            edge.strengthen();
            edge.visits.visited_at(timestamp);
        }
        self.edge_history.push(id);
        self.tree_history.push(evidence);
        self.record_entry(source, source_tree);
        debug!(edge = %id, added, "transition recorded");
        Ok(id)
    }

    /// Re-add an edge while rebuilding; marks source, action and edge
    /// visited at the evidence timestamp
    pub(crate) fn add_rebuilt_transition(
        &mut self,
        source: StateId,
        action: ActionId,
        target: StateId,
        evidence: TreeTransitionId,
        source_tree: TreeId,
        throttle: u32,
        timestamp: u64,
    ) -> Result<TransitionId> {
        let (id, _) = self.add_state_transition(source, action, target)?;
        self.record_entry(source, source_tree);
        {
            let edge = self.transition_mut(id)?;
            edge.strengthen();
            edge.update_throttle(throttle);
            edge.trees.push(evidence);
        }
        self.mark_state_visited(source, timestamp)?;
        self.mark_action_visited(action, timestamp)?;
        self.transition_mut(id)?.visits.visited_at(timestamp);
        Ok(id)
    }

    /// Record a miss on an existing edge
    pub fn weaken(&mut self, action: ActionId, target: StateId) -> Result<()> {
        let id = self.edge_index.get(&(action, target)).copied().ok_or_else(|| {
            GraphError::MissingTransition(format!("{} =[{}]=> {}", action.state, action, target))
        })?;
        self.transition_mut(id)?.weaken();
        Ok(())
    }

    pub fn mark_action_visited(&mut self, id: ActionId, timestamp: u64) -> Result<()> {
        let action = self.action(id)?;
        if !action.action_type.is_model_action() {
            return Ok(());
        }
        if action.is_unvisited() {
            if !self.unvisited_actions.remove(&id) {
                return Err(GraphError::InvalidTransition(format!("untracked action {}", id)).into());
            }
            self.visited_actions.insert(id);
        } else if !self.visited_actions.contains(&id) {
            return Err(GraphError::InvalidTransition(format!("untracked action {}", id)).into());
        }
        self.action_mut(id)?.visits.visited_at(timestamp);
        Ok(())
    }

    pub fn mark_state_visited(&mut self, id: StateId, timestamp: u64) -> Result<()> {
        let state = self.state_mut(id)?;
        state.visits.visited_at(timestamp);
        let activity = state.activity().to_string();
        if let Some(node) = self.activities.get_mut(&activity) {
            node.visits.visited_at(timestamp);
        }
        Ok(())
    }

    /// Remove a state and every edge touching it; returns the removed edges
    pub fn remove(&mut self, id: StateId) -> Result<Vec<StateTransition>> {
        let state = self.state(id)?;
        let mut edge_ids: Vec<TransitionId> = state.in_edges().to_vec();
        edge_ids.extend_from_slice(state.out_edges());
        edge_ids.sort();
        edge_ids.dedup();

        let mut removed = Vec::with_capacity(edge_ids.len());
        for edge_id in edge_ids {
            let Some(edge) = self.transitions.get_mut(edge_id.index()).and_then(|e| e.take()) else {
                continue;
            };
            self.edge_index.remove(&(edge.action, edge.target));
            if let Some(list) = self.action_edges.get_mut(&edge.action) {
                list.retain(|e| *e != edge_id);
                if list.is_empty() {
                    self.action_edges.remove(&edge.action);
                }
            }
            if let Ok(source) = self.state_mut(edge.source) {
                source.out_edges.retain(|e| *e != edge_id);
            }
            if let Ok(target) = self.state_mut(edge.target) {
                target.in_edges.retain(|e| *e != edge_id);
            }
            removed.push(edge);
        }

        let state = self.states[id.index()]
            .take()
            .ok_or(GraphError::StaleState(id.0))?;
        if let Some(node) = self.activities.get_mut(state.activity()) {
            node.states.remove(&id);
        }
        if let Some(by_name) = self.name_to_actions.get_mut(state.activity()) {
            for action in state.actions() {
                if let Some(target) = action.target {
                    if let Some(set) = by_name.get_mut(&target) {
                        set.remove(&action.id);
                        if set.is_empty() {
                            by_name.remove(&target);
                        }
                    }
                }
            }
        }
        for action in state.actions() {
            self.unvisited_actions.remove(&action.id);
            self.visited_actions.remove(&action.id);
            self.action_edges.remove(&action.id);
        }
        self.entry_states.remove(&id);
        self.clean_entry_states.remove(&id);
        self.key_to_state.remove(state.key());
        if let Some(set) = self.naming_to_states.get_mut(&state.key().naming()) {
            set.remove(&id);
        }
        debug!(state = %state.label, edges = removed.len(), "state removed");
        Ok(removed)
    }

    pub fn states_of_naming(&self, naming: NamingId) -> BTreeSet<StateId> {
        self.naming_to_states
            .get(&naming)
            .cloned()
            .unwrap_or_default()
    }

    /// States of `naming` and of every naming refined from it
    pub fn all_states_of_naming(&self, naming: NamingId, namings: &NamingTree) -> BTreeSet<StateId> {
        let mut out = BTreeSet::new();
        let mut stack = vec![naming];
        while let Some(n) = stack.pop() {
            out.extend(self.states_of_naming(n));
            stack.extend(namings.naming(n).children());
        }
        out
    }

    fn sorted_out_edges(&self, state: StateId) -> Vec<&StateTransition> {
        let mut edges = self.out_edges(state);
        edges.sort_by(|a, b| a.visits.cmp_last_visit(&b.visits).then(a.id.cmp(&b.id)));
        edges
    }

    /// Breadth-first search from `start`; every state is reached at most once
    pub fn find_shortest_paths(
        &self,
        start: StateId,
        filter: &dyn SubsequenceFilter,
        max_len: usize,
    ) -> Vec<Subsequence> {
        let mut selected = Vec::new();
        let mut visited: HashSet<StateId> = HashSet::new();
        visited.insert(start);
        let mut queue: VecDeque<Subsequence> = VecDeque::new();
        queue.push_back(Subsequence::new(start));

        while let Some(mut path) = queue.pop_front() {
            if !path.is_empty() && path.len() >= max_len {
                path.close();
                continue;
            }
            for edge in self.sorted_out_edges(path.last_state()) {
                if visited.contains(&edge.target) {
                    continue;
                }
                if !filter.extend(self, &path, edge) {
                    continue;
                }
                let mut next = path.extended(edge);
                visited.insert(edge.target);
                if filter.include(self, &next) {
                    next.close();
                    selected.push(next);
                    continue;
                }
                queue.push_back(next);
            }
        }
        selected
    }

    pub fn find_shortest_path(&self, start: StateId, filter: &dyn SubsequenceFilter) -> Option<Subsequence> {
        self.find_shortest_paths(start, filter, usize::MAX)
            .into_iter()
            .next()
    }

    /// Paths of strong, enabled and valid edges from `from` to `to`
    pub fn move_to_state(
        &self,
        from: StateId,
        to: StateId,
        include_back: bool,
        max_len: usize,
    ) -> Vec<Subsequence> {
        let filter = FnFilter::new(
            |graph: &Graph, _: &Subsequence, edge: &StateTransition| {
                let Ok(action) = graph.action(edge.action) else {
                    return false;
                };
                if !ActionFilter::EnabledValid.include(action) {
                    return false;
                }
                if !include_back && action.is_back() {
                    return false;
                }
                edge.is_strong()
            },
            |_: &Graph, path: &Subsequence| !path.is_empty() && path.last_state() == to,
        );
        self.find_shortest_paths(from, &filter, max_len)
    }

    /// Reachability over strong edges
    pub fn is_reachable(&self, from: &[StateId], to: StateId) -> bool {
        if from.contains(&to) {
            return true;
        }
        let mut visited: HashSet<StateId> = from.iter().copied().collect();
        let mut queue: VecDeque<StateId> = from.iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            for edge in self.out_edges(current) {
                if visited.contains(&edge.target) || !edge.is_strong() {
                    continue;
                }
                if edge.target == to {
                    return true;
                }
                visited.insert(edge.target);
                queue.push_back(edge.target);
            }
        }
        false
    }

    /// Recover the edges connecting `states` from the transition history.
    ///
    /// Walks the history backwards matching consecutive states; self loops
    /// are skipped. Returns `None` unless every state is matched.
    pub fn fill_transitions_by_history(&self, states: &[StateId]) -> Option<Subsequence> {
        let mut h = self.edge_history.len();
        let mut s = states.len();
        let mut edges: Vec<&StateTransition> = Vec::new();
        while h > 0 && s > 0 {
            s -= 1;
            let current = states[s];
            while h > 0 {
                h -= 1;
                let Ok(edge) = self.transition(self.edge_history[h]) else {
                    continue;
                };
                if edge.target != current || edge.is_circle() {
                    continue;
                }
                if s == 0 {
                    break;
                }
                if edge.source == states[s - 1] {
                    edges.push(edge);
                    break;
                }
            }
        }
        if s > 0 || edges.len() + 1 != states.len() {
            return None;
        }
        edges.reverse();
        Subsequence::from_edges(&edges)
    }

    /// Paths following exactly `states` over strong, valid edges
    pub fn fill_transitions(&self, states: &[StateId]) -> Vec<Subsequence> {
        let Some(first) = states.first() else {
            return Vec::new();
        };
        let expected = states.len() - 1;
        let filter = FnFilter::new(
            |graph: &Graph, path: &Subsequence, edge: &StateTransition| {
                let size = path.len();
                if states.get(size) != Some(&edge.source) || states.get(size + 1) != Some(&edge.target) {
                    return false;
                }
                if !edge.is_strong() {
                    return false;
                }
                graph
                    .action(edge.action)
                    .map(|a| a.is_back() || a.valid)
                    .unwrap_or(false)
            },
            |_: &Graph, path: &Subsequence| path.len() == expected,
        );
        self.find_shortest_paths(*first, &filter, expected)
    }

    /// Actions sharing the target name of `action` in its activity
    pub fn actions_by_name(&self, action: &ModelAction) -> Vec<ActionId> {
        let Some(target) = action.target else {
            return Vec::new();
        };
        let Ok(state) = self.state(action.id.state) else {
            return Vec::new();
        };
        self.name_to_actions
            .get(state.activity())
            .and_then(|m| m.get(&target))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The single target reached by every same-typed action sharing the name
    pub fn name_global_target(&self, action: &ModelAction) -> Option<StateId> {
        let shared = self.actions_by_name(action);
        if shared.len() <= 1 {
            return None;
        }
        let mut targets = BTreeSet::new();
        for id in shared {
            let Ok(other) = self.action(id) else { continue };
            if other.action_type != action.action_type {
                continue;
            }
            for edge in self.action_out_edges(id) {
                targets.insert(edge.target);
            }
        }
        if targets.len() == 1 {
            targets.into_iter().next()
        } else {
            None
        }
    }

    pub fn is_name_global_action(&self, action: &ModelAction) -> bool {
        self.name_global_target(action).is_some()
    }

    /// Unvisited in every state of the activity that shares the target name
    pub fn is_action_unvisited_by_name(&self, action: &ModelAction) -> bool {
        if !action.requires_target() {
            return action.is_unvisited();
        }
        let shared = self.actions_by_name(action);
        if shared.is_empty() {
            return action.is_unvisited();
        }
        !shared.iter().any(|id| {
            self.action(*id)
                .map(|a| a.is_visited() && a.action_type == action.action_type)
                .unwrap_or(false)
        })
    }

    /// Out-edges of every same-typed action sharing the target name
    pub fn transitions_by_name(&self, action: &ModelAction) -> Vec<Vec<TransitionId>> {
        if !action.requires_target() {
            return Vec::new();
        }
        self.actions_by_name(action)
            .into_iter()
            .filter(|id| {
                self.action(*id)
                    .map(|a| a.action_type == action.action_type)
                    .unwrap_or(false)
            })
            .map(|id| self.action_out_edges(id).iter().map(|e| e.id).collect())
            .collect()
    }

    pub fn tree_history(&self) -> &[TreeTransitionId] {
        &self.tree_history
    }

    /// Recompute edge statistics and the edge history from the tree history
    pub(crate) fn rebuild_history(&mut self, trees: &TreeStore) -> Result<()> {
        for edge in self.transitions.iter_mut().flatten() {
            edge.visits.reset();
        }
        self.edge_history.clear();
        for tt_id in self.tree_history.clone() {
            let tt = trees.transition(tt_id)?;
            let Some(edge_id) = tt.state_transition else {
                return Err(GraphError::InvalidTransition(format!(
                    "tree transition {} has no state transition",
                    tt_id.0
                ))
                .into());
            };
            self.transition_mut(edge_id)?.visits.visited_at(tt.timestamp);
            self.edge_history.push(edge_id);
        }
        Ok(())
    }

    /// GraphViz rendering; weak edges dashed, edges with misses bold
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph GSTG {\n");
        for state in self.states() {
            let _ = writeln!(out, "\t{} [label=\"{}\"];", state.label, state.label);
        }
        for edge in self.transitions() {
            let (Ok(source), Ok(target), Ok(action)) = (
                self.state(edge.source),
                self.state(edge.target),
                self.action(edge.action),
            ) else {
                continue;
            };
            let style = if edge.strength() < 1 {
                "dashed"
            } else if edge.misses > 0 {
                "bold"
            } else {
                "solid"
            };
            let _ = writeln!(
                out,
                "\t{} -> {} [style={}, label=\"{}[{}]\"];",
                source.label, target.label, style, edge.label, action.label
            );
        }
        out.push_str("}\n");
        out
    }

    pub fn log_summary(&self) {
        info!(
            version = self.version,
            activities = self.activities.len(),
            states = self.len(),
            edges = self.edge_count(),
            unvisited_actions = self.unvisited_actions.len(),
            visited_actions = self.visited_actions.len(),
            "graph summary"
        );
        for node in self.activities.values() {
            info!(
                activity = %node.activity,
                visited_rate = self.activity_visited_rate(&node.activity),
                states = node.states.len(),
                visits = node.visits.count,
                "activity"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ape_common::ActionType;

    use crate::testing::{graph_with_states, key};

    fn click(graph: &Graph, state: StateId) -> ActionId {
        graph
            .state(state)
            .unwrap()
            .actions()
            .iter()
            .find(|a| a.action_type == ActionType::ModelClick)
            .unwrap()
            .id
    }

    fn back(graph: &Graph, state: StateId) -> ActionId {
        graph.state(state).unwrap().back_action().id
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (mut graph, lattice, states) = graph_with_states(2);
        let again = graph.get_or_create_state(key(&graph, states[0]), &lattice);
        assert_eq!(again, states[0]);
        assert_eq!(graph.len(), 2);
        assert!(graph.state(states[1]).unwrap().label.starts_with("g0s"));
    }

    #[test]
    fn test_visit_kinds() {
        let (mut graph, _lattice, s) = graph_with_states(3);
        let a = click(&graph, s[0]);
        let e1 = graph
            .add_transition(s[0], a, s[1], TreeTransitionId(0), TreeId(0), 100)
            .unwrap();
        assert_eq!(graph.transition(e1).unwrap().kind, VisitKind::NewAction);
        let e2 = graph
            .add_transition(s[0], a, s[2], TreeTransitionId(1), TreeId(0), 100)
            .unwrap();
        assert_eq!(graph.transition(e2).unwrap().kind, VisitKind::NewActionTarget);
        let again = graph
            .add_transition(s[0], a, s[1], TreeTransitionId(2), TreeId(0), 50)
            .unwrap();
        assert_eq!(again, e1);
        let edge = graph.transition(e1).unwrap();
        assert_eq!(edge.kind, VisitKind::Existing);
        assert_eq!(edge.hits, 2);
        assert_eq!(edge.throttle, 50);
        assert_eq!(graph.action_out_edges(a).len(), 2);
    }

    #[test]
    fn test_no_source_creates_no_edge() {
        let (mut graph, _lattice, s) = graph_with_states(1);
        let before = graph.timestamp();
        graph.observe(s[0]).unwrap();
        assert_eq!(graph.timestamp(), before + 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_weaken_missing_edge() {
        let (mut graph, _lattice, s) = graph_with_states(2);
        let a = click(&graph, s[0]);
        assert!(graph.weaken(a, s[1]).is_err());
    }

    #[test]
    fn test_remove_detaches_edges() {
        let (mut graph, _lattice, s) = graph_with_states(3);
        let a0 = click(&graph, s[0]);
        let a1 = click(&graph, s[1]);
        graph
            .add_transition(s[0], a0, s[1], TreeTransitionId(0), TreeId(0), 0)
            .unwrap();
        graph
            .add_transition(s[1], a1, s[2], TreeTransitionId(1), TreeId(1), 0)
            .unwrap();
        let removed = graph.remove(s[1]).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!graph.contains(s[1]));
        assert!(graph.state(s[1]).is_err());
        assert!(graph.out_edges(s[0]).is_empty());
        assert!(graph.in_edges(s[2]).is_empty());
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.action_out_edges(a0).is_empty());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_labels_not_reused_after_remove() {
        let (mut graph, lattice, s) = graph_with_states(3);
        let a0 = click(&graph, s[0]);
        let a1 = click(&graph, s[1]);
        graph
            .add_transition(s[0], a0, s[1], TreeTransitionId(0), TreeId(0), 0)
            .unwrap();
        graph
            .add_transition(s[1], a1, s[2], TreeTransitionId(1), TreeId(1), 0)
            .unwrap();
        let removed_key = key(&graph, s[1]);
        let removed_label = graph.state(s[1]).unwrap().label.clone();
        let removed_edges: Vec<String> = graph.remove(s[1]).unwrap().into_iter().map(|e| e.label).collect();

        let fresh = graph.get_or_create_state(removed_key, &lattice);
        assert_ne!(fresh, s[1]);
        let mut labels: Vec<String> = graph.states().map(|state| state.label.clone()).collect();
        labels.push(removed_label);
        let count = labels.len();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), count);

        let edge = graph
            .add_transition(s[0], a0, s[2], TreeTransitionId(2), TreeId(0), 0)
            .unwrap();
        let label = &graph.transition(edge).unwrap().label;
        assert!(!removed_edges.contains(label));
    }

    #[test]
    fn test_shortest_paths_and_reachability() {
        let (mut graph, _lattice, s) = graph_with_states(4);
        for i in 0..3 {
            let a = click(&graph, s[i]);
            graph
                .add_transition(
                    s[i],
                    a,
                    s[i + 1],
                    TreeTransitionId(i as u32),
                    TreeId(i as u32),
                    0,
                )
                .unwrap();
            graph.action_mut(a).unwrap().valid = true;
        }
        let paths = graph.move_to_state(s[0], s[3], false, 10);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 3);
        assert!(paths[0].is_closed());
        assert!(graph.move_to_state(s[0], s[3], false, 2).is_empty());
        assert!(graph.is_reachable(&[s[0]], s[3]));
        assert!(!graph.is_reachable(&[s[3]], s[0]));

        let filled = graph.fill_transitions(&[s[0], s[1], s[2]]);
        assert_eq!(filled.len(), 1);
        let by_history = graph.fill_transitions_by_history(&[s[1], s[2], s[3]]).unwrap();
        assert_eq!(by_history.start, s[1]);
        assert_eq!(by_history.last_state(), s[3]);
        assert!(graph.fill_transitions_by_history(&[s[3], s[0]]).is_none());
    }

    #[test]
    fn test_back_edges_excluded_unless_requested() {
        let (mut graph, _lattice, s) = graph_with_states(2);
        let b = back(&graph, s[0]);
        graph.action_mut(b).unwrap().valid = true;
        graph
            .add_transition(s[0], b, s[1], TreeTransitionId(0), TreeId(0), 0)
            .unwrap();
        assert!(graph.move_to_state(s[0], s[1], false, 5).is_empty());
        assert_eq!(graph.move_to_state(s[0], s[1], true, 5).len(), 1);
    }

    #[test]
    fn test_mark_visited_tracks_sets() {
        let (mut graph, _lattice, s) = graph_with_states(1);
        let a = click(&graph, s[0]);
        let unvisited = graph.unvisited_action_count();
        graph.mark_action_visited(a, 3).unwrap();
        graph.mark_action_visited(a, 4).unwrap();
        assert_eq!(graph.unvisited_action_count(), unvisited - 1);
        assert_eq!(graph.visited_action_count(), 1);
        assert_eq!(graph.action(a).unwrap().visits.count, 2);
        graph.mark_state_visited(s[0], 4).unwrap();
        let activity = graph.state(s[0]).unwrap().activity().to_string();
        assert_eq!(graph.activity(&activity).unwrap().visits.count, 1);
        assert!(graph.activity_visited_rate(&activity) > 0.0);
    }

    #[test]
    fn test_dot_output() {
        let (mut graph, _lattice, s) = graph_with_states(2);
        let a = click(&graph, s[0]);
        graph
            .add_transition(s[0], a, s[1], TreeTransitionId(0), TreeId(0), 0)
            .unwrap();
        graph.weaken(a, s[1]).unwrap();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph GSTG {"));
        assert!(dot.contains("style=dashed"));
    }
}
