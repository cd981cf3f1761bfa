//! State keys
//!
//! A state is identified by the activity, the naming that produced its
//! names, and the sorted set of distinct names in the tree.

use std::fmt;

use ape_naming::{NameId, NamingId, NamingResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    activity: String,
    naming: NamingId,
    /// Sorted, unique
    widgets: Vec<NameId>,
}

impl StateKey {
    pub fn new(activity: impl Into<String>, naming: NamingId, mut widgets: Vec<NameId>) -> Self {
        widgets.sort_unstable();
        widgets.dedup();
        Self {
            activity: activity.into(),
            naming,
            widgets,
        }
    }

    pub fn from_result(activity: impl Into<String>, naming: NamingId, result: &NamingResult) -> Self {
        Self {
            activity: activity.into(),
            naming,
            widgets: result.names().to_vec(),
        }
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn naming(&self) -> NamingId {
        self.naming
    }

    pub fn widgets(&self) -> &[NameId] {
        &self.widgets
    }

    pub fn contains_target(&self, name: NameId) -> bool {
        self.widgets.binary_search(&name).is_ok()
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}[{} widgets]",
            self.activity,
            self.naming,
            self.widgets.len()
        )
    }
}
