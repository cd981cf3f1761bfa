//! Base namings
//!
//! Every naming tree starts from three roots: `top` and `bottom` (a single
//! `//*` namelet with the top or bottom namer) and a configurable base
//! naming that the state naming manager starts every tree from.

use std::fmt;
use std::str::FromStr;

use ape_common::{NamingError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lattice::NamerLattice;
use crate::namer::{NamerType, NamerTypeSet};
use crate::naming::{NameletKind, NameletSpec, NamingId, NamingTree};
use crate::selector::Selector;

const ACTIONABLE: &str =
    "//*[@clickable='true' or @long-clickable='true' or @checkable='true' or @scrollable='true']";
const NOT_ACTIONABLE: &str =
    "//*[@clickable='false' and @long-clickable='false' and @checkable='false' and @scrollable='false']";

const LIST_CLASSES: [&str; 6] = [
    "android.widget.ListView",
    "android.widget.GridView",
    "android.support.v7.widget.RecyclerView",
    "android.support.v17.leanback.widget.VerticalGridView",
    "android.support.v17.leanback.widget.HorizontalGridView",
    "android.widget.ExpandableListView",
];

/// Initial abstraction applied to unseen trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseNaming {
    /// Actionable nodes by type, everything else collapsed
    #[default]
    ActionType,
    /// Action type plus parent/type/index for children of non-list containers
    Boosted,
    /// Parent/type/index everywhere, parent/type for list items
    Stoat,
    /// Type everywhere, split by presence of a resource id
    ResourceId,
    /// Parent/index everywhere
    ParentIndex,
    /// Finest namer everywhere
    Top,
    /// Coarsest namer everywhere
    Bottom,
}

impl BaseNaming {
    pub fn as_str(self) -> &'static str {
        match self {
            BaseNaming::ActionType => "actiontype",
            BaseNaming::Boosted => "boosted",
            BaseNaming::Stoat => "stoat",
            BaseNaming::ResourceId => "resourceid",
            BaseNaming::ParentIndex => "parentindex",
            BaseNaming::Top => "top",
            BaseNaming::Bottom => "bottom",
        }
    }
}

impl fmt::Display for BaseNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseNaming {
    type Err = NamingError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "actiontype" => Ok(BaseNaming::ActionType),
            "boosted" => Ok(BaseNaming::Boosted),
            "stoat" => Ok(BaseNaming::Stoat),
            "resourceid" => Ok(BaseNaming::ResourceId),
            "parentindex" => Ok(BaseNaming::ParentIndex),
            "top" => Ok(BaseNaming::Top),
            "bottom" => Ok(BaseNaming::Bottom),
            other => Err(NamingError::UnknownBaseNaming(other.to_string())),
        }
    }
}

fn class_filter(op: &str, joiner: &str) -> String {
    let parts: Vec<String> = LIST_CLASSES
        .iter()
        .map(|c| format!("@class{}'{}'", op, c))
        .collect();
    format!("//*[{}]/*", parts.join(joiner))
}

fn base(expr: &str, namer: crate::namer::NamerId) -> NameletSpec {
    NameletSpec {
        kind: NameletKind::Base,
        expr: expr.to_string(),
        namer,
        parent: None,
    }
}

impl NamingTree {
    /// Naming tree with `top`, `bottom` and the selected base naming
    pub fn new(lattice: &NamerLattice, base_naming: BaseNaming) -> Result<Self> {
        let mut tree = NamingTree::empty();
        let top = tree.create_root(lattice, &[base("//*", lattice.top())])?;
        let bottom = tree.create_root(lattice, &[base("//*", lattice.bottom())])?;
        let base_id = match base_naming {
            BaseNaming::Top => top,
            BaseNaming::Bottom => bottom,
            other => tree.create_base(lattice, other)?,
        };
        tree.set_sentinels(top, bottom, base_id);
        info!(base = %base_naming, naming = %base_id, "naming tree created");
        Ok(tree)
    }

    fn create_base(&mut self, lattice: &NamerLattice, kind: BaseNaming) -> Result<NamingId> {
        let namer = |types: &[NamerType]| lattice.namer_for(NamerTypeSet::of(types));
        match kind {
            BaseNaming::ActionType => self.create_root(
                lattice,
                &[
                    base(ACTIONABLE, namer(&[NamerType::Type])?),
                    base(NOT_ACTIONABLE, lattice.bottom()),
                ],
            ),
            BaseNaming::Boosted => {
                let root = self.create_root(
                    lattice,
                    &[
                        base(ACTIONABLE, namer(&[NamerType::Type])?),
                        base(NOT_ACTIONABLE, lattice.bottom()),
                    ],
                )?;
                let default_namelet = self.naming(root).namelets[1];
                let selector = Selector::parse(&class_filter("!=", " and "))?;
                self.extend(
                    lattice,
                    root,
                    default_namelet,
                    selector,
                    namer(&[NamerType::Parent, NamerType::Type, NamerType::Index])?,
                )
            }
            BaseNaming::Stoat => self.create_root(
                lattice,
                &[
                    base(
                        "//*",
                        namer(&[NamerType::Parent, NamerType::Type, NamerType::Index])?,
                    ),
                    NameletSpec {
                        kind: NameletKind::Refine,
                        expr: class_filter("=", " or "),
                        namer: namer(&[NamerType::Parent, NamerType::Type])?,
                        parent: Some(0),
                    },
                ],
            ),
            BaseNaming::ResourceId => self.create_root(
                lattice,
                &[
                    base("//*[@resource-id!='']", namer(&[NamerType::Type])?),
                    base("//*[@resource-id='']", namer(&[NamerType::Type])?),
                ],
            ),
            BaseNaming::ParentIndex => self.create_root(
                lattice,
                &[base("//*", namer(&[NamerType::Parent, NamerType::Index])?)],
            ),
            BaseNaming::Top | BaseNaming::Bottom => Err(NamingError::UnknownBaseNaming(
                kind.as_str().to_string(),
            )
            .into()),
        }
    }
}
