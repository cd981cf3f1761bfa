//! Refinement searches
//!
//! Both searches walk candidate namers in lattice order above the namer
//! being refined. A namer that was examined pushes an upper bound; any
//! later candidate at least as fine as a bound is skipped, since it can
//! only fragment the states further.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use ape_common::{GraphError, NodeId, Result, TreeId};
use ape_naming::{NameId, NameletId, NamerId, NamingId, Selector};
use tracing::{debug, info, instrument, warn};

use super::{Controller, Predicate, PredicateKind};
use crate::action::ActionId;
use crate::model::Model;
use crate::state::StateId;
use crate::state_key::StateKey;
use crate::transition::TransitionId;
use crate::tree::TreeTransitionId;

/// An accepted candidate naming
#[derive(Debug, Clone)]
struct Candidate {
    kind: PredicateKind,
    naming: NamingId,
    /// Namer of the namelet being refined
    original_namer: NamerId,
    updated_namer: NamerId,
    selector: String,
    /// Distinct source states of both edges under `naming`
    state_count: usize,
    partitions: Vec<Vec<TreeTransitionId>>,
}

/// Source states and evidence partitions of an accepted check
type Separation = (usize, Vec<Vec<TreeTransitionId>>);

impl Candidate {
    /// Smaller is better
    fn compare(&self, other: &Self, model: &Model) -> Ordering {
        let lattice = &model.naming().lattice;
        self.state_count
            .cmp(&other.state_count)
            .then_with(|| lattice.compare(self.original_namer, other.original_namer))
            .then_with(|| lattice.compare(self.updated_namer, other.updated_namer))
            .then_with(|| self.selector.cmp(&other.selector))
    }

    fn into_predicate(self) -> Predicate {
        match self.kind {
            PredicateKind::ActionRefinement => Predicate::ActionDivergent {
                naming: self.naming,
                partitions: self.partitions,
            },
            _ => Predicate::SourceDivergent {
                naming: self.naming,
                partitions: self.partitions,
            },
        }
    }
}

/// The two conflicting edges of one action
struct Conflict<'a> {
    naming: NamingId,
    target: Option<NameId>,
    source: StateId,
    tts1: &'a [TreeTransitionId],
    tts2: &'a [TreeTransitionId],
    affected: &'a BTreeSet<TreeId>,
}

fn skipped_by_bound(model: &Model, namer: NamerId, bounds: &[NamerId]) -> bool {
    let lattice = &model.naming().lattice;
    bounds.iter().any(|upper| lattice.refines_to(namer, *upper))
}

fn source_trees(model: &Model, tts: &[TreeTransitionId]) -> Result<Vec<TreeId>> {
    tts.iter()
        .map(|t| model.trees().transition(*t).map(|tt| tt.source))
        .collect()
}

impl Controller {
    /// Try to make the targets of `edge` and another out-edge of the same
    /// action come from different states or different actions
    #[instrument(level = "debug", skip(self, model), fields(edge = %edge))]
    pub(crate) fn resolve_non_determinism(&mut self, model: &mut Model, edge: TransitionId) -> Result<()> {
        let transition = model.graph().transition(edge)?;
        let action = transition.action;
        let source = transition.source;
        let tts2 = transition.tree_transitions().to_vec();
        if self.is_non_determinism_blacklisted(action) {
            debug!(action = %action, "action blacklisted for non-determinism");
            return Ok(());
        }
        let others: Vec<(TransitionId, Vec<TreeTransitionId>)> = model
            .graph()
            .action_out_edges(action)
            .into_iter()
            .filter(|e| e.id != edge)
            .map(|e| (e.id, e.tree_transitions().to_vec()))
            .collect();
        let state = model.graph().state(source)?;
        let naming = state.key().naming();
        let affected: BTreeSet<TreeId> = state.trees().iter().copied().collect();
        let target = model.graph().action(action)?.target;

        for (other, tts1) in &others {
            if tts1.is_empty() || tts2.is_empty() {
                continue;
            }
            debug!(st1 = %other, st2 = %edge, "non-deterministic edges");
            let conflict = Conflict {
                naming,
                target,
                source,
                tts1,
                tts2: &tts2,
                affected: &affected,
            };
            let mut candidates = self.refine(model, &conflict)?;
            if candidates.is_empty() {
                debug!(st1 = %other, "no naming separates the edges");
                continue;
            }
            candidates.sort_by(|a, b| a.compare(b, model));
            let best = candidates.swap_remove(0);
            info!(
                from = %naming,
                to = %best.naming,
                kind = ?best.kind,
                states = best.state_count,
                "non-determinism resolved"
            );
            let updated = best.naming;
            self.apply(model, &affected, updated)?;
            self.add_predicate(best.into_predicate());
            return Ok(());
        }
        if others.len() + 1 >= 3 {
            info!(action = %action, targets = others.len() + 1, "action blacklisted for non-determinism");
            self.non_determinism_blacklist.insert(action);
        }
        Ok(())
    }

    fn refine(&self, model: &mut Model, conflict: &Conflict<'_>) -> Result<Vec<Candidate>> {
        let first = model.config().action_refinement_first;
        let mut results = Vec::new();
        if first {
            self.refine_action(model, conflict, &mut results)?;
        }
        if results.is_empty() {
            self.refine_state(model, conflict, &mut results)?;
        }
        if !first && results.is_empty() {
            self.refine_action(model, conflict, &mut results)?;
        }
        Ok(results)
    }

    /// The namelet naming `name` in every source tree of both edges, if it
    /// is the same one and uses the namer of the name
    fn check_namelet(&self, model: &Model, conflict: &Conflict<'_>, name: NameId) -> Result<Option<NameletId>> {
        let mut found = None;
        for tts in [conflict.tts1, conflict.tts2] {
            let mut namelet = None;
            for tree in source_trees(model, tts)? {
                let tree = model.tree(tree)?;
                let Some(result) = tree.result() else {
                    return Ok(None);
                };
                let nodes = result.nodes_of(name);
                if nodes.is_empty() {
                    return Err(GraphError::InvalidTransition(format!(
                        "no node named {} in tree {}",
                        name, tree.id
                    ))
                    .into());
                }
                for node in nodes {
                    let current = result.namelet_of(*node);
                    match namelet {
                        None => namelet = current,
                        Some(n) if current != Some(n) => {
                            debug!(name = %name, "nodes of the name come from different namelets");
                            return Ok(None);
                        }
                        _ => {}
                    }
                }
            }
            match (found, namelet) {
                (_, None) => return Ok(None),
                (None, Some(n)) => found = Some(n),
                (Some(a), Some(b)) if a != b => {
                    debug!(name = %name, "the edges name the target with different namelets");
                    return Ok(None);
                }
                _ => {}
            }
        }
        let Some(namelet) = found else {
            return Ok(None);
        };
        let ctx = model.naming();
        if ctx.namings.namelet(namelet).namer != ctx.lattice.name(name).namer {
            debug!(name = %name, "namelet and name disagree on the namer");
            return Ok(None);
        }
        Ok(Some(namelet))
    }

    /// Candidates separating the action nodes of the two edges by name
    fn refine_action(&self, model: &mut Model, conflict: &Conflict<'_>, results: &mut Vec<Candidate>) -> Result<()> {
        let Some(widget) = conflict.target else {
            return Ok(());
        };
        let mut shared = false;
        for tree in source_trees(model, conflict.tts1)?
            .into_iter()
            .chain(source_trees(model, conflict.tts2)?)
        {
            if model.tree(tree)?.nodes_of(widget).len() > 1 {
                shared = true;
                break;
            }
        }
        if !shared {
            debug!(widget = %widget, "target is not aliased, no action refinement");
            return Ok(());
        }
        let Some(namelet) = self.check_namelet(model, conflict, widget)? else {
            return Ok(());
        };
        let current_namer = model.naming().lattice.name(widget).namer;

        if model.naming().namings.is_replaceable(conflict.naming, namelet) {
            let parent = model.naming().namings.namelet(namelet).parent;
            if let Some(parent) = parent {
                let parent_namer = model.naming().namings.namelet(parent).namer;
                let refined_namers = model.naming().lattice.sorted_above(parent_namer)?.to_vec();
                let mut bounds = Vec::new();
                for refined in refined_namers {
                    if skipped_by_bound(model, refined, &bounds) {
                        continue;
                    }
                    if model.naming().lattice.refines_to(current_namer, refined) {
                        continue;
                    }
                    let ctx = &mut model.ctx;
                    let updated = ctx.namings.replace_last(&ctx.lattice, conflict.naming, namelet, refined)?;
                    let Some(states) = self.check_action_refinement(model, conflict, updated, refined, &mut bounds)?
                    else {
                        continue;
                    };
                    if !self.check_predicates(model, conflict.affected, updated)? {
                        continue;
                    }
                    let selector = model.naming().namings.namelet(namelet).selector.as_str().to_string();
                    results.push(Candidate {
                        kind: PredicateKind::ActionRefinement,
                        naming: updated,
                        original_namer: current_namer,
                        updated_namer: refined,
                        selector,
                        state_count: states.0,
                        partitions: states.1,
                    });
                    break;
                }
            }
        }

        let selector_text = model.naming().lattice.name(widget).xpath.clone();
        let refined_namers = model.naming().lattice.sorted_above(current_namer)?.to_vec();
        let mut bounds = Vec::new();
        for refined in refined_namers {
            if skipped_by_bound(model, refined, &bounds) {
                continue;
            }
            let selector = Selector::parse(&selector_text)?;
            let ctx = &mut model.ctx;
            let updated = ctx
                .namings
                .extend(&ctx.lattice, conflict.naming, namelet, selector, refined)?;
            let Some(states) = self.check_action_refinement(model, conflict, updated, refined, &mut bounds)? else {
                continue;
            };
            if !self.check_predicates(model, conflict.affected, updated)? {
                continue;
            }
            results.push(Candidate {
                kind: PredicateKind::ActionRefinement,
                naming: updated,
                original_namer: current_namer,
                updated_namer: refined,
                selector: selector_text.clone(),
                state_count: states.0,
                partitions: states.1,
            });
            break;
        }
        Ok(())
    }

    /// Action nodes of the two edges must get distinct names and the source
    /// trees must stay within the state threshold
    fn check_action_refinement(
        &self,
        model: &mut Model,
        conflict: &Conflict<'_>,
        naming: NamingId,
        namer: NamerId,
        bounds: &mut Vec<NamerId>,
    ) -> Result<Option<Separation>> {
        let mut names = HashSet::new();
        for (i, tts) in [conflict.tts1, conflict.tts2].into_iter().enumerate() {
            for id in tts {
                let tt = model.trees().transition(*id)?;
                let (source, node) = (tt.source, tt.action.node);
                let Some(node) = node else { continue };
                let name = model.name_under(naming, source, node)?;
                if !names.insert(name) && i == 1 {
                    return Ok(None);
                }
            }
        }

        let threshold = model.naming().namings.max_states_for_refinement(&model.naming().lattice, naming);
        let mut states = HashSet::new();
        for id in conflict.tts1.iter().chain(conflict.tts2) {
            let source = model.trees().transition(*id)?.source;
            states.insert(model.state_key(naming, source)?);
            if states.len() > threshold {
                bounds.push(namer);
                return Ok(None);
            }
        }
        bounds.push(namer);
        Ok(Some((
            states.len(),
            vec![conflict.tts1.to_vec(), conflict.tts2.to_vec()],
        )))
    }

    /// Candidates separating the source trees of the two edges by state
    fn refine_state(&self, model: &mut Model, conflict: &Conflict<'_>, results: &mut Vec<Candidate>) -> Result<()> {
        let (Some(last1), Some(last2)) = (conflict.tts1.last(), conflict.tts2.last()) else {
            return Ok(());
        };
        let tree1 = model.trees().transition(*last1)?.source;
        let tree2 = model.trees().transition(*last2)?.source;
        let top = model.naming().namings.top();
        if model.state_key(top, tree1)? == model.state_key(top, tree2)? {
            let isomorphic = model.tree(tree1)?.ui().is_isomorphic(model.tree(tree2)?.ui());
            debug!(isomorphic, "source trees are equal under the top naming");
            return Ok(());
        }

        let state = model.graph().state(conflict.source)?;
        let mut names: Vec<NameId> = state
            .actions()
            .iter()
            .filter_map(|a| if a.requires_target() { a.target } else { None })
            .collect();
        names.sort();
        names.dedup();

        let last = model.naming().namings.naming(conflict.naming).last_namelet();
        if let Some(last) = last.filter(|l| model.naming().namings.is_replaceable(conflict.naming, *l)) {
            let (last_namer, parent) = {
                let namelet = model.naming().namings.namelet(last);
                (namelet.namer, namelet.parent)
            };
            if let Some(parent) = parent {
                let parent_namer = model.naming().namings.namelet(parent).namer;
                let refined_namers = model.naming().lattice.sorted_above(parent_namer)?.to_vec();
                let mut bounds = Vec::new();
                for refined in refined_namers {
                    if skipped_by_bound(model, refined, &bounds) {
                        continue;
                    }
                    if model.naming().lattice.refines_to(last_namer, refined) {
                        continue;
                    }
                    let ctx = &mut model.ctx;
                    let updated = ctx.namings.replace_last(&ctx.lattice, conflict.naming, last, refined)?;
                    let Some(states) = self.check_state_refinement(model, conflict, updated, refined, &mut bounds)?
                    else {
                        continue;
                    };
                    if !self.check_predicates(model, conflict.affected, updated)? {
                        continue;
                    }
                    let selector = model.naming().namings.namelet(last).selector.as_str().to_string();
                    results.push(Candidate {
                        kind: PredicateKind::StateRefinement,
                        naming: updated,
                        original_namer: last_namer,
                        updated_namer: refined,
                        selector,
                        state_count: states.0,
                        partitions: states.1,
                    });
                    break;
                }
            }
        }

        for name in names {
            let Some(namelet) = self.check_namelet(model, conflict, name)? else {
                continue;
            };
            let current_namer = model.naming().lattice.name(name).namer;
            let selector_text = model.naming().lattice.name(name).xpath.clone();
            let refined_namers = model.naming().lattice.sorted_above(current_namer)?.to_vec();
            let mut bounds = Vec::new();
            for refined in refined_namers {
                if skipped_by_bound(model, refined, &bounds) {
                    continue;
                }
                let selector = Selector::parse(&selector_text)?;
                let ctx = &mut model.ctx;
                let updated = ctx
                    .namings
                    .extend(&ctx.lattice, conflict.naming, namelet, selector, refined)?;
                let Some(states) = self.check_state_refinement(model, conflict, updated, refined, &mut bounds)? else {
                    continue;
                };
                if !self.check_predicates(model, conflict.affected, updated)? {
                    continue;
                }
                results.push(Candidate {
                    kind: PredicateKind::StateRefinement,
                    naming: updated,
                    original_namer: current_namer,
                    updated_namer: refined,
                    selector: selector_text.clone(),
                    state_count: states.0,
                    partitions: states.1,
                });
                break;
            }
        }
        Ok(())
    }

    /// Latest source trees get distinct keys, no key is shared between the
    /// edges and the total stays within the threshold
    fn check_state_refinement(
        &self,
        model: &mut Model,
        conflict: &Conflict<'_>,
        naming: NamingId,
        namer: NamerId,
        bounds: &mut Vec<NamerId>,
    ) -> Result<Option<Separation>> {
        let (Some(last1), Some(last2)) = (conflict.tts1.last(), conflict.tts2.last()) else {
            return Ok(None);
        };
        let tree1 = model.trees().transition(*last1)?.source;
        let tree2 = model.trees().transition(*last2)?.source;
        if model.state_key(naming, tree1)? == model.state_key(naming, tree2)? {
            return Ok(None);
        }

        let threshold = model.naming().namings.max_states_for_refinement(&model.naming().lattice, naming);
        let mut states1: BTreeMap<StateKey, Vec<TreeTransitionId>> = BTreeMap::new();
        for id in conflict.tts1 {
            let source = model.trees().transition(*id)?.source;
            let key = model.state_key(naming, source)?;
            states1.entry(key).or_default().push(*id);
            if states1.len() > threshold {
                bounds.push(namer);
                return Ok(None);
            }
        }
        let mut states2: BTreeMap<StateKey, Vec<TreeTransitionId>> = BTreeMap::new();
        for id in conflict.tts2 {
            let source = model.trees().transition(*id)?.source;
            let key = model.state_key(naming, source)?;
            if states1.contains_key(&key) {
                return Ok(None);
            }
            states2.entry(key).or_default().push(*id);
            if states1.len() + states2.len() > threshold {
                bounds.push(namer);
                return Ok(None);
            }
        }
        bounds.push(namer);
        let count = states1.len() + states2.len();
        Ok(Some((count, states1.into_values().chain(states2.into_values()).collect())))
    }

    /// Split an action whose target matches too many nodes
    #[instrument(level = "debug", skip(self, model), fields(action = %action))]
    pub(crate) fn action_refinement(&mut self, model: &mut Model, action: ActionId) -> Result<()> {
        let a = model.graph().action(action)?;
        if !a.requires_target() {
            return Ok(());
        }
        if self.is_action_refinement_blacklisted(action) {
            debug!("action blacklisted for refinement");
            return Ok(());
        }
        let nodes = a.resolved_nodes().to_vec();
        if nodes.len() <= model.config().action_refinement_threshold {
            return Ok(());
        }
        let (Some(widget), Some(node), Some(tree)) = (a.target, a.resolved_node(), a.resolved_tree()) else {
            warn!("action resolved to many nodes but has no resolved node");
            return Ok(());
        };
        let state = model.graph().state(action.state)?;
        if state.widget_count() >= model.config().max_initial_names_per_state {
            debug!(widgets = state.widget_count(), "state already has too many names");
            return Ok(());
        }
        let naming = state.key().naming();
        let trees: Vec<TreeId> = state.trees().to_vec();
        let affected: BTreeSet<TreeId> = trees.iter().copied().collect();
        let namelet = model
            .naming_result(naming, tree)?
            .namelet_of(node)
            .ok_or_else(|| GraphError::InvalidTransition(format!("node {} has no namelet", node.0)))?;
        let namer = model.naming().namings.namelet(namelet).namer;
        info!(widget = %widget, nodes = nodes.len(), "refining an aliased action");

        if model.naming().namings.is_replaceable(naming, namelet) {
            if let Some(parent) = model.naming().namings.namelet(namelet).parent {
                let parent_namer = model.naming().namings.namelet(parent).namer;
                let refined_namers = model.naming().lattice.sorted_above(parent_namer)?.to_vec();
                let mut bounds = Vec::new();
                for refined in refined_namers {
                    if skipped_by_bound(model, refined, &bounds) {
                        continue;
                    }
                    if model.naming().lattice.refines_to(namer, refined) {
                        continue;
                    }
                    let ctx = &mut model.ctx;
                    let updated = ctx.namings.replace_last(&ctx.lattice, naming, namelet, refined)?;
                    if self.try_split_nodes(model, updated, refined, &nodes, tree, &affected, &mut bounds)? {
                        return Ok(());
                    }
                }
            }
        }

        let selector_text = model.naming().lattice.name(widget).xpath.clone();
        let refined_namers = model.naming().lattice.sorted_above(namer)?.to_vec();
        let mut bounds = Vec::new();
        for refined in refined_namers {
            if skipped_by_bound(model, refined, &bounds) {
                continue;
            }
            let selector = Selector::parse(&selector_text)?;
            let ctx = &mut model.ctx;
            let updated = ctx.namings.extend(&ctx.lattice, naming, namelet, selector, refined)?;
            if self.try_split_nodes(model, updated, refined, &nodes, tree, &affected, &mut bounds)? {
                return Ok(());
            }
        }
        info!("action blacklisted for refinement");
        self.action_refinement_blacklist.insert(action);
        Ok(())
    }

    /// Accept `naming` if it splits the nodes, keeps every tree within the
    /// name cap and the states within the threshold
    #[allow(clippy::too_many_arguments)]
    fn try_split_nodes(
        &mut self,
        model: &mut Model,
        naming: NamingId,
        namer: NamerId,
        nodes: &[NodeId],
        tree: TreeId,
        affected: &BTreeSet<TreeId>,
        bounds: &mut Vec<NamerId>,
    ) -> Result<bool> {
        // Step 1: the nodes need more than one name
        let mut partitions: BTreeMap<Option<NameId>, Vec<NodeId>> = BTreeMap::new();
        for node in nodes {
            let name = model.name_under(naming, tree, *node)?;
            partitions.entry(name).or_default().push(*node);
        }
        if partitions.len() == 1 {
            debug!(naming = %naming, "nodes still share one name");
            return Ok(false);
        }

        // Step 2: states stay coarse enough
        let cap = model.config().max_initial_names_per_state;
        let threshold = model.naming().namings.max_states_for_refinement(&model.naming().lattice, naming);
        let mut states = HashSet::new();
        for t in affected {
            let key = model.state_key(naming, *t)?;
            if key.widgets().len() > cap {
                debug!(widgets = key.widgets().len(), cap, "too many names per state");
                bounds.push(namer);
                return Ok(false);
            }
            states.insert(key);
            if states.len() > threshold {
                debug!(states = states.len(), threshold, "states too fine");
                bounds.push(namer);
                return Ok(false);
            }
        }

        // Step 3: recorded constraints still hold
        if !self.check_predicates(model, affected, naming)? {
            return Ok(false);
        }
        bounds.push(namer);
        info!(naming = %naming, names = partitions.len(), states = states.len(), "action refined");
        self.add_predicate(Predicate::ActionDivergentNodes {
            naming,
            tree,
            partitions: partitions.into_values().collect(),
        });
        self.apply(model, affected, naming)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::ModelEvent;
    use crate::testing::{click, diverging_clicks, list_tree, model};
    use ape_common::ActionType;
    use proptest::prelude::*;

    /// The click action of `state`, resolved in its latest tree
    fn resolved_click(model: &mut Model, state: StateId) -> ActionId {
        let action = model
            .graph()
            .state(state)
            .unwrap()
            .actions()
            .iter()
            .find(|a| a.action_type == ActionType::ModelClick)
            .unwrap()
            .id;
        model
            .resolve_action(action, 0, 0, &mut rand::thread_rng())
            .unwrap();
        action
    }

    fn moved_edge(model: &Model, edge: TransitionId) -> (StateId, ActionId) {
        let edge = model.graph().transition(model.update_transition(edge).unwrap()).unwrap();
        (edge.source, edge.action)
    }

    #[test]
    fn test_action_first_splits_aliased_rows() {
        let mut model = model(ModelConfig::default());
        let mut controller = Controller::new();
        let (a, state) = model.add_tree(list_tree("A", &["a", "b"]), 0).unwrap();
        let (b, _) = model.add_tree(list_tree("B", &[]), 1).unwrap();
        let first = click(&mut model, a, "a", b);
        let (c, _) = model.add_tree(list_tree("C", &[]), 2).unwrap();
        let second = click(&mut model, a, "b", c);

        controller.resolve_non_determinism(&mut model, second).unwrap();
        assert_eq!(controller.predicates().len(), 1);
        assert_eq!(controller.predicates()[0].kind(), PredicateKind::ActionRefinement);
        assert!(model.graph().state(state).is_err());
        let (source1, action1) = moved_edge(&model, first);
        let (source2, action2) = moved_edge(&model, second);
        assert_eq!(source1, source2);
        assert_ne!(action1, action2);
    }

    #[test]
    fn test_state_refinement_when_action_refinement_is_second() {
        let config = ModelConfig {
            action_refinement_first: false,
            ..Default::default()
        };
        let mut model = model(config);
        let mut controller = Controller::new();
        let (first, second) = diverging_clicks(&mut model);

        controller.resolve_non_determinism(&mut model, second).unwrap();
        assert_eq!(controller.predicates()[0].kind(), PredicateKind::StateRefinement);
        assert_ne!(moved_edge(&model, first).0, moved_edge(&model, second).0);
    }

    #[test]
    fn test_action_refinement_splits_aliased_action() {
        let mut model = model(ModelConfig::default());
        let mut controller = Controller::new();
        let (tree, state) = model
            .add_tree(list_tree("A", &["a", "b", "c", "d", "e", "f"]), 0)
            .unwrap();
        let action = resolved_click(&mut model, state);

        assert!(model.action_refinement(&mut controller, action).unwrap());
        assert_eq!(model.counters().get(&ModelEvent::ActionRefinement), Some(&1));
        assert!(matches!(
            controller.predicates(),
            [Predicate::ActionDivergentNodes { .. }]
        ));
        assert!(model.graph().state(state).is_err());
        let moved = model.tree(tree).unwrap().state().unwrap();
        let clicks = model
            .graph()
            .state(moved)
            .unwrap()
            .actions()
            .iter()
            .filter(|a| a.action_type == ActionType::ModelClick)
            .count();
        assert!(clicks > 1);
        assert!(!controller.is_action_refinement_blacklisted(action));
    }

    #[test]
    fn test_action_refinement_blacklists_when_names_overflow() {
        let config = ModelConfig {
            max_initial_names_per_state: 4,
            ..Default::default()
        };
        let mut model = model(config);
        let mut controller = Controller::new();
        let (_, state) = model
            .add_tree(list_tree("A", &["a", "b", "c", "d", "e", "f"]), 0)
            .unwrap();
        let action = resolved_click(&mut model, state);
        let version = model.version();

        assert!(!model.action_refinement(&mut controller, action).unwrap());
        assert!(controller.is_action_refinement_blacklisted(action));
        assert!(controller.predicates().is_empty());
        assert_eq!(model.version(), version);
        assert!(model.graph().state(state).is_ok());

        // later requests for the same action are skipped
        assert!(!model.action_refinement(&mut controller, action).unwrap());
    }

    #[test]
    fn test_candidate_violating_predicate_is_rejected() {
        fn setup() -> (Model, Vec<TreeId>, ActionId) {
            let mut model = model(ModelConfig::default());
            let (t1, s1) = model.add_tree(list_tree("A", &["a", "b", "c", "d"]), 0).unwrap();
            let (t2, s2) = model
                .add_tree(list_tree("A", &["a", "b", "c", "d", "e"]), 1)
                .unwrap();
            assert_eq!(s1, s2);
            let action = resolved_click(&mut model, s2);
            (model, vec![t1, t2], action)
        }

        let (mut model, _, action) = setup();
        let mut controller = Controller::new();
        assert!(model.action_refinement(&mut controller, action).unwrap());

        // both screens were recorded as a single state earlier
        let (mut model, trees, action) = setup();
        let mut controller = Controller::new();
        let base = model.naming().namings.base();
        controller.add_predicate(Predicate::StatesFewerThan {
            naming: base,
            trees,
            threshold: 1,
        });
        assert!(!model.action_refinement(&mut controller, action).unwrap());
        assert!(controller.is_action_refinement_blacklisted(action));
        assert_eq!(controller.predicates().len(), 1);
    }

    #[test]
    fn test_failed_resolution_leaves_model_untouched() {
        let mut model = model(ModelConfig::default());
        let mut controller = Controller::new();
        let (first, second) = diverging_clicks(&mut model);
        let source = model.graph().transition(first).unwrap().source;
        let base = model.naming().namings.base();
        // refers to a tree the model never stored
        controller.add_predicate(Predicate::StatesFewerThan {
            naming: base,
            trees: vec![TreeId(999)],
            threshold: 1,
        });

        assert!(model
            .resolve_non_deterministic_transitions(&mut controller, second)
            .is_err());
        assert_eq!(model.version(), 0);
        assert!(model.graph().state(source).is_ok());
        assert!(model.graph().has_transition(first));
        assert!(model.counters().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_accepted_naming_separates_evidence(
            rows1 in prop::collection::vec("[a-z]{1,3}", 1..4),
            rows2 in prop::collection::vec("[a-z]{1,3}", 1..4),
            action_first in any::<bool>(),
        ) {
            let config = ModelConfig {
                action_refinement_first: action_first,
                ..Default::default()
            };
            let mut model = model(config);
            let mut controller = Controller::new();
            let rows1: Vec<&str> = rows1.iter().map(String::as_str).collect();
            let rows2: Vec<&str> = rows2.iter().map(String::as_str).collect();
            let (a1, s1) = model.add_tree(list_tree("A", &rows1), 0).unwrap();
            let (b, _) = model.add_tree(list_tree("B", &[]), 1).unwrap();
            let first = click(&mut model, a1, rows1[0], b);
            let (a2, s2) = model.add_tree(list_tree("A", &rows2), 2).unwrap();
            prop_assume!(s1 == s2);
            let (c, _) = model.add_tree(list_tree("C", &[]), 3).unwrap();
            let second = click(&mut model, a2, rows2[0], c);
            let version = model.version();

            controller.resolve_non_determinism(&mut model, second).unwrap();
            if controller.predicates().is_empty() {
                prop_assert_eq!(model.version(), version);
            } else {
                prop_assert_ne!(moved_edge(&model, first), moved_edge(&model, second));
            }
        }
    }
}
