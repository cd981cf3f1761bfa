//! Constraints recorded by accepted model evolutions
//!
//! Every accepted refinement or abstraction leaves a predicate behind. A
//! later candidate naming is only accepted if all predicates still hold
//! when the affected trees are named by the candidate and every other tree
//! keeps its assigned naming.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::Hash;

use ape_common::{NodeId, Result, TreeId};
use ape_naming::{NameId, NamingId};
use serde::{Deserialize, Serialize};

use crate::model::Model;
use crate::state_key::StateKey;
use crate::tree::TreeTransitionId;

/// Evaluation order: abstraction constraints first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PredicateKind {
    StateAbstraction,
    StateRefinement,
    ActionRefinement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Action nodes of the partitions keep distinct names
    ActionDivergent {
        naming: NamingId,
        partitions: Vec<Vec<TreeTransitionId>>,
    },
    /// Source trees of the partitions keep distinct state keys
    SourceDivergent {
        naming: NamingId,
        partitions: Vec<Vec<TreeTransitionId>>,
    },
    /// Node partitions of one tree keep distinct names
    ActionDivergentNodes {
        naming: NamingId,
        tree: TreeId,
        partitions: Vec<Vec<NodeId>>,
    },
    /// The trees resolve to at most `threshold` states
    StatesFewerThan {
        naming: NamingId,
        trees: Vec<TreeId>,
        threshold: usize,
    },
}

/// Names and keys under a candidate naming for the affected trees and the
/// assigned naming for the rest
pub(crate) struct Evaluation<'a> {
    model: &'a mut Model,
    affected: &'a BTreeSet<TreeId>,
    naming: NamingId,
}

impl<'a> Evaluation<'a> {
    pub(crate) fn new(model: &'a mut Model, affected: &'a BTreeSet<TreeId>, naming: NamingId) -> Self {
        Self {
            model,
            affected,
            naming,
        }
    }

    fn naming_of(&self, tree: TreeId) -> Result<NamingId> {
        if self.affected.contains(&tree) {
            return Ok(self.naming);
        }
        Ok(self.model.tree(tree)?.naming().unwrap_or(self.naming))
    }

    fn key(&mut self, tree: TreeId) -> Result<StateKey> {
        let naming = self.naming_of(tree)?;
        self.model.state_key(naming, tree)
    }

    fn name(&mut self, tree: TreeId, node: NodeId) -> Result<Option<NameId>> {
        let naming = self.naming_of(tree)?;
        self.model.name_under(naming, tree, node)
    }
}

/// No value may show up in two different partitions
fn disjoint<T: Eq + Hash>(partitions: Vec<HashSet<T>>) -> bool {
    let mut seen = HashSet::new();
    for partition in partitions {
        for value in partition {
            if !seen.insert(value) {
                return false;
            }
        }
    }
    true
}

impl Predicate {
    pub fn kind(&self) -> PredicateKind {
        match self {
            Predicate::ActionDivergent { .. } | Predicate::ActionDivergentNodes { .. } => {
                PredicateKind::ActionRefinement
            }
            Predicate::SourceDivergent { .. } => PredicateKind::StateRefinement,
            Predicate::StatesFewerThan { .. } => PredicateKind::StateAbstraction,
        }
    }

    /// Naming the predicate was recorded for
    pub fn naming(&self) -> NamingId {
        match self {
            Predicate::ActionDivergent { naming, .. }
            | Predicate::SourceDivergent { naming, .. }
            | Predicate::ActionDivergentNodes { naming, .. }
            | Predicate::StatesFewerThan { naming, .. } => *naming,
        }
    }

    pub(crate) fn eval(&self, eval: &mut Evaluation<'_>) -> Result<bool> {
        match self {
            Predicate::ActionDivergent { partitions, .. } => {
                let mut names = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let mut set = HashSet::new();
                    for id in partition {
                        let tt = eval.model.trees().transition(*id)?;
                        let (source, node) = (tt.source, tt.action.node);
                        let Some(node) = node else { continue };
                        if let Some(name) = eval.name(source, node)? {
                            set.insert(name);
                        }
                    }
                    names.push(set);
                }
                Ok(disjoint(names))
            }
            Predicate::SourceDivergent { partitions, .. } => {
                let mut keys = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let mut set = HashSet::new();
                    for id in partition {
                        let source = eval.model.trees().transition(*id)?.source;
                        set.insert(eval.key(source)?);
                    }
                    keys.push(set);
                }
                Ok(disjoint(keys))
            }
            Predicate::ActionDivergentNodes { tree, partitions, .. } => {
                let mut names = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let mut set = HashSet::new();
                    for node in partition {
                        if let Some(name) = eval.name(*tree, *node)? {
                            set.insert(name);
                        }
                    }
                    names.push(set);
                }
                Ok(disjoint(names))
            }
            Predicate::StatesFewerThan { trees, threshold, .. } => {
                let mut keys = HashSet::new();
                for tree in trees {
                    keys.insert(eval.key(*tree)?);
                }
                Ok(keys.len() <= *threshold)
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::ActionDivergent { naming, partitions } => {
                write!(f, "ActionDivergent[{}]({} partitions)", naming, partitions.len())
            }
            Predicate::SourceDivergent { naming, partitions } => {
                write!(f, "SourceDivergent[{}]({} partitions)", naming, partitions.len())
            }
            Predicate::ActionDivergentNodes {
                naming,
                tree,
                partitions,
            } => write!(
                f,
                "ActionDivergentNodes[{}](tree {}, {} partitions)",
                naming,
                tree,
                partitions.len()
            ),
            Predicate::StatesFewerThan {
                naming,
                trees,
                threshold,
            } => write!(
                f,
                "StatesFewerThan[{}]({} trees <= {})",
                naming,
                trees.len(),
                threshold
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_order() {
        assert!(PredicateKind::StateAbstraction < PredicateKind::StateRefinement);
        assert!(PredicateKind::StateRefinement < PredicateKind::ActionRefinement);
        let p = Predicate::SourceDivergent {
            naming: NamingId(1),
            partitions: Vec::new(),
        };
        assert_eq!(p.kind(), PredicateKind::StateRefinement);
        assert_eq!(p.naming(), NamingId(1));
    }

    #[test]
    fn test_disjoint() {
        let a: HashSet<u32> = [1, 2].into_iter().collect();
        let b: HashSet<u32> = [3].into_iter().collect();
        let c: HashSet<u32> = [2].into_iter().collect();
        assert!(disjoint(vec![a.clone(), b]));
        assert!(!disjoint(vec![a, c]));
    }
}
