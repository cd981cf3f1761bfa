//! Batch abstraction: revert a naming that split one parent state into too
//! many states

use std::collections::{BTreeSet, HashSet};

use ape_common::{GraphError, NamingError, Result, TreeId, MAX_ABSTRACTION_STATES};
use ape_naming::NamingId;
use tracing::{debug, info, instrument};

use super::{Controller, Predicate};
use crate::model::Model;
use crate::state::StateId;

impl Controller {
    /// Check whether `target_naming` is too fine compared to its parent for
    /// the states looking like `initial_state` under the parent, and revert
    /// them to the parent naming if so.
    ///
    /// `target_states` holds the states named by `target_naming` or one of
    /// its descendants.
    #[instrument(level = "debug", skip(self, model, target_states), fields(state = %initial_state))]
    pub(crate) fn batch_abstract(
        &mut self,
        model: &mut Model,
        initial_naming: NamingId,
        initial_state: StateId,
        target_naming: NamingId,
        target_states: &BTreeSet<StateId>,
    ) -> Result<()> {
        let Some(parent) = model.naming().namings.parent(target_naming) else {
            return Ok(());
        };
        if model.naming().namings.parent(initial_naming).is_none() {
            return Ok(());
        }

        let affected_states = self.filter_targets(model, initial_state, target_naming, parent, target_states)?;
        let threshold = model
            .naming()
            .namings
            .max_states_for_refinement(&model.naming().lattice, target_naming);
        let mut affected = BTreeSet::new();
        for state in &affected_states {
            affected.extend(model.graph().state(*state)?.trees().iter().copied());
        }
        let mut targets = HashSet::new();
        for tree in &affected {
            targets.insert(model.state_key(target_naming, *tree)?);
        }
        debug!(
            targets = targets.len(),
            states = affected_states.len(),
            threshold,
            "abstraction check"
        );
        if affected_states.len() <= MAX_ABSTRACTION_STATES && targets.len() <= threshold {
            return Ok(());
        }

        info!(
            from = %target_naming,
            to = %parent,
            states = affected_states.len(),
            trees = affected.len(),
            "reverting naming"
        );
        let predicate = Predicate::StatesFewerThan {
            naming: parent,
            trees: affected.iter().copied().collect::<Vec<TreeId>>(),
            threshold,
        };
        for tree in &affected {
            self.tree_naming_blacklist
                .entry(*tree)
                .or_default()
                .insert(target_naming);
        }
        self.apply(model, &affected, parent)?;
        self.remove_conflicting_predicates(model, &affected, parent)?;
        self.add_predicate(predicate);
        Ok(())
    }

    /// States whose latest tree has the same key under `parent` as the
    /// latest tree of `initial_state`
    fn filter_targets(
        &self,
        model: &mut Model,
        initial_state: StateId,
        target_naming: NamingId,
        parent: NamingId,
        target_states: &BTreeSet<StateId>,
    ) -> Result<Vec<StateId>> {
        let tree = model
            .graph()
            .state(initial_state)?
            .latest_tree()
            .ok_or_else(|| GraphError::InvalidTransition(format!("state {} has no tree", initial_state)))?;
        let origin = model.state_key(parent, tree)?;
        let mut filtered = Vec::new();
        for id in target_states {
            let state = model.graph().state(*id)?;
            let Some(latest) = state.latest_tree() else {
                continue;
            };
            let naming = state.key().naming();
            if naming != target_naming && !model.naming().namings.is_ancestor(target_naming, naming) {
                return Err(NamingError::NamingConflict(format!(
                    "state {} is named by {}, outside {}",
                    id, naming, target_naming
                ))
                .into());
            }
            if model.state_key(parent, latest)? == origin {
                filtered.push(*id);
            }
        }
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::ModelEvent;
    use crate::testing::{list_tree, model, text_refinement};

    /// One single-row screen of `A` per row, moved to a naming that tells
    /// the rows apart by text
    fn refined(rows: usize) -> (Controller, Model, Vec<TreeId>, NamingId) {
        let mut model = model(ModelConfig::default());
        let mut controller = Controller::new();
        let mut trees = Vec::new();
        for i in 0..rows {
            let row = format!("r{}", i);
            let (tree, _) = model.add_tree(list_tree("A", &[row.as_str()]), i as u64).unwrap();
            trees.push(tree);
        }
        let base = model.naming().namings.base();
        let child = text_refinement(&mut model, base);
        let affected: BTreeSet<TreeId> = trees.iter().copied().collect();
        controller.apply(&mut model, &affected, child).unwrap();
        (controller, model, trees, child)
    }

    fn states_of(model: &Model, naming: NamingId) -> BTreeSet<StateId> {
        model
            .graph()
            .states()
            .filter(|s| s.key().naming() == naming)
            .map(|s| s.id)
            .collect()
    }

    #[test]
    fn test_too_many_states_revert_to_parent() {
        let (mut controller, mut model, trees, child) = refined(MAX_ABSTRACTION_STATES + 2);
        let states = states_of(&model, child);
        assert_eq!(states.len(), trees.len());
        let first = *states.iter().next().unwrap();

        assert!(model
            .state_abstraction(&mut controller, child, first, child, &states)
            .unwrap());
        assert_eq!(model.counters().get(&ModelEvent::StateAbstraction), Some(&1));
        let base = model.naming().namings.base();
        let merged = states_of(&model, base);
        assert_eq!(merged.len(), 1);
        assert!(states_of(&model, child).is_empty());
        match controller.predicates() {
            [Predicate::StatesFewerThan {
                naming,
                trees: recorded,
                ..
            }] => {
                assert_eq!(*naming, base);
                assert_eq!(recorded, &trees);
            }
            other => panic!("unexpected predicates {:?}", other),
        }
        for tree in &trees {
            assert!(controller.is_naming_blacklisted(*tree, child));
        }
    }

    #[test]
    fn test_few_states_are_kept() {
        let (mut controller, mut model, _, child) = refined(2);
        let states = states_of(&model, child);
        let first = *states.iter().next().unwrap();
        let version = model.version();

        assert!(!model
            .state_abstraction(&mut controller, child, first, child, &states)
            .unwrap());
        assert_eq!(model.version(), version);
        assert_eq!(states_of(&model, child), states);
        assert!(controller.predicates().is_empty());
    }

    #[test]
    fn test_base_naming_is_never_abstracted() {
        let mut model = model(ModelConfig::default());
        let mut controller = Controller::new();
        let (_, state) = model.add_tree(list_tree("A", &["a"]), 0).unwrap();
        let base = model.naming().namings.base();
        let states: BTreeSet<StateId> = [state].into_iter().collect();
        controller
            .batch_abstract(&mut model, base, state, base, &states)
            .unwrap();
        assert_eq!(model.version(), 0);
    }
}
