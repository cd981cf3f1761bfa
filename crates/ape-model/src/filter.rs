//! Path search filters

use crate::graph::Graph;
use crate::subsequence::Subsequence;
use crate::transition::StateTransition;

/// Controls [`Graph::find_shortest_paths`]
pub trait SubsequenceFilter {
    /// Whether `path` may be extended with `edge`
    fn extend(&self, graph: &Graph, path: &Subsequence, edge: &StateTransition) -> bool;

    /// Whether `path` is a result; accepted paths are not extended further
    fn include(&self, graph: &Graph, path: &Subsequence) -> bool;
}

/// Filter built from two closures
pub struct FnFilter<E, I> {
    extend: E,
    include: I,
}

impl<E, I> FnFilter<E, I>
where
    E: Fn(&Graph, &Subsequence, &StateTransition) -> bool,
    I: Fn(&Graph, &Subsequence) -> bool,
{
    pub fn new(extend: E, include: I) -> Self {
        Self { extend, include }
    }
}

impl<E, I> SubsequenceFilter for FnFilter<E, I>
where
    E: Fn(&Graph, &Subsequence, &StateTransition) -> bool,
    I: Fn(&Graph, &Subsequence) -> bool,
{
    fn extend(&self, graph: &Graph, path: &Subsequence, edge: &StateTransition) -> bool {
        (self.extend)(graph, path, edge)
    }

    fn include(&self, graph: &Graph, path: &Subsequence) -> bool {
        (self.include)(graph, path)
    }
}
