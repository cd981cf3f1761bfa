//! Abstraction and refinement controller
//!
//! Decides when the naming of a group of trees changes:
//!
//! ```text
//!   non-deterministic edge ──► refine (action, then state) ──┐
//!   action on many nodes   ──► action refinement ────────────┼──► update_naming
//!   too many similar states ─► batch abstraction ────────────┘        │
//!                                                                     ▼
//!                                                              Model::rebuild
//! ```
//!
//! Candidates are checked against cached naming results only; the model is
//! touched once a candidate is accepted. Rejections are remembered for the
//! rest of the run.

mod abstraction;
mod predicate;
mod refinement;

use std::collections::{BTreeSet, HashMap};

use ape_common::{Result, TreeId};
use ape_naming::NamingId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::ActionId;
use crate::model::Model;

pub use predicate::{Predicate, PredicateKind};

use predicate::Evaluation;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Controller {
    /// Ordered by kind
    predicates: Vec<Predicate>,
    action_refinement_blacklist: BTreeSet<ActionId>,
    non_determinism_blacklist: BTreeSet<ActionId>,
    tree_naming_blacklist: HashMap<TreeId, BTreeSet<NamingId>>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_action_refinement_blacklisted(&self, action: ActionId) -> bool {
        self.action_refinement_blacklist.contains(&action)
    }

    pub fn is_non_determinism_blacklisted(&self, action: ActionId) -> bool {
        self.non_determinism_blacklist.contains(&action)
    }

    /// Exclude `action` from later action refinements
    pub fn reject_action_refinement(&mut self, action: ActionId) {
        self.action_refinement_blacklist.insert(action);
    }

    /// Leave the non-determinism of `action` unresolved from now on
    pub fn reject_non_determinism(&mut self, action: ActionId) {
        self.non_determinism_blacklist.insert(action);
    }

    pub fn is_naming_blacklisted(&self, tree: TreeId, naming: NamingId) -> bool {
        self.tree_naming_blacklist
            .get(&tree)
            .map_or(false, |set| set.contains(&naming))
    }

    fn add_predicate(&mut self, predicate: Predicate) {
        let kind = predicate.kind();
        let index = self.predicates.partition_point(|p| p.kind() <= kind);
        info!(predicate = %predicate, "predicate recorded");
        self.predicates.insert(index, predicate);
    }

    /// Whether `naming` may name the `affected` trees
    fn check_predicates(&self, model: &mut Model, affected: &BTreeSet<TreeId>, naming: NamingId) -> Result<bool> {
        if affected.iter().any(|t| self.is_naming_blacklisted(*t, naming)) {
            debug!(naming = %naming, "naming blacklisted for an affected tree");
            return Ok(false);
        }
        let mut eval = Evaluation::new(model, affected, naming);
        for predicate in &self.predicates {
            if !predicate.eval(&mut eval)? {
                debug!(naming = %naming, predicate = %predicate, "candidate violates predicate");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drop the predicates `naming` violates for the `affected` trees
    fn remove_conflicting_predicates(
        &mut self,
        model: &mut Model,
        affected: &BTreeSet<TreeId>,
        naming: NamingId,
    ) -> Result<usize> {
        let mut eval = Evaluation::new(model, affected, naming);
        let mut kept = Vec::with_capacity(self.predicates.len());
        let mut removed = 0;
        for predicate in self.predicates.drain(..) {
            if predicate.eval(&mut eval)? {
                kept.push(predicate);
            } else {
                info!(predicate = %predicate, "violated predicate removed");
                removed += 1;
            }
        }
        self.predicates = kept;
        Ok(removed)
    }

    /// Move every affected tree to `naming` and rebuild the model. If any
    /// tree cannot move, every assignment is restored and nothing is rebuilt.
    fn apply(&self, model: &mut Model, affected: &BTreeSet<TreeId>, naming: NamingId) -> Result<()> {
        let saved = model.manager.clone();
        for id in affected {
            let moved = match model.trees.get(*id) {
                Ok(tree) => model.manager.update_naming(&mut model.ctx, tree, naming),
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                warn!(tree = %id, naming = %naming, error = %e, "naming update rejected, assignments restored");
                model.manager = saved;
                return Err(e);
            }
        }
        model.rebuild()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::testing::{list_tree, model, text_refinement};

    #[test]
    fn test_predicates_stay_ordered_by_kind() {
        let mut controller = Controller::new();
        controller.add_predicate(Predicate::ActionDivergent {
            naming: NamingId(2),
            partitions: Vec::new(),
        });
        controller.add_predicate(Predicate::StatesFewerThan {
            naming: NamingId(1),
            trees: Vec::new(),
            threshold: 1,
        });
        controller.add_predicate(Predicate::SourceDivergent {
            naming: NamingId(3),
            partitions: Vec::new(),
        });
        let kinds: Vec<PredicateKind> = controller.predicates().iter().map(|p| p.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                PredicateKind::StateAbstraction,
                PredicateKind::StateRefinement,
                PredicateKind::ActionRefinement
            ]
        );
    }

    #[test]
    fn test_naming_blacklist() {
        let mut controller = Controller::new();
        controller
            .tree_naming_blacklist
            .entry(TreeId(0))
            .or_default()
            .insert(NamingId(4));
        assert!(controller.is_naming_blacklisted(TreeId(0), NamingId(4)));
        assert!(!controller.is_naming_blacklisted(TreeId(1), NamingId(4)));
    }

    #[test]
    fn test_failed_apply_restores_assignments() {
        let mut model = model(ModelConfig::default());
        let (moved, state) = model.add_tree(list_tree("A", &["a"]), 0).unwrap();
        // stored but never named
        let unnamed = model.trees.insert(list_tree("A", &["b"]), 1);
        let base = model.naming().namings.base();
        let child = text_refinement(&mut model, base);
        let version = model.manager().version();

        let affected: BTreeSet<TreeId> = [moved, unnamed].into_iter().collect();
        assert!(Controller::new().apply(&mut model, &affected, child).is_err());
        assert_eq!(model.manager().version(), version);
        assert!(model.manager().is_leaf(base));
        assert_eq!(model.version(), 0);
        assert!(model.graph().state(state).is_ok());
        assert_eq!(model.tree(moved).unwrap().naming(), Some(base));
    }
}
