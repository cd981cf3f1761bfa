//! Model actions and executed actions
//!
//! A [`ModelAction`] is an abstract action of a state: a target name (or
//! none) plus an action type. Before it can be executed it is resolved
//! against the latest concrete tree of its state, which picks the node to
//! act on and records how saturated the action is.
//!
//! An [`Action`] is what the agent hands to the device: a common header plus
//! a variant payload.

use std::fmt;

use ape_common::{ActionType, GraphError, NodeId, Rect, Result, TreeId};
use ape_naming::NameId;
use serde::{Deserialize, Serialize};

use crate::state::StateId;
use crate::visit::VisitStats;

/// Visits a shared target needs before it counts as saturated
const SATURATED_VISITED_THRESHOLD: usize = 2;

/// Index of an action within its state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId {
    pub state: StateId,
    pub index: u32,
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}a{}", self.state, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionFilter {
    All,
    WithTarget,
    Valid,
    EnabledValidUnvisited,
    EnabledValidUnsaturated,
    EnabledValid,
}

/// Anything that can select actions; implemented by [`ActionFilter`] and closures
pub trait ActionPredicate {
    fn include(&self, action: &ModelAction) -> bool;
}

impl ActionPredicate for ActionFilter {
    fn include(&self, action: &ModelAction) -> bool {
        match self {
            ActionFilter::All => true,
            ActionFilter::WithTarget => action.requires_target(),
            ActionFilter::Valid => action.valid,
            ActionFilter::EnabledValidUnvisited => {
                action.enabled && action.valid && action.visits.is_unvisited()
            }
            ActionFilter::EnabledValidUnsaturated => {
                action.enabled && action.valid && !action.is_saturated()
            }
            ActionFilter::EnabledValid => action.enabled && action.valid,
        }
    }
}

impl<F: Fn(&ModelAction) -> bool> ActionPredicate for F {
    fn include(&self, action: &ModelAction) -> bool {
        self(action)
    }
}

/// Outcome of resolving an action against a concrete tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub timestamp: u64,
    pub tree: TreeId,
    pub node: Option<NodeId>,
    pub nodes: Vec<NodeId>,
    pub saturation: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAction {
    pub id: ActionId,
    pub label: String,
    pub target: Option<NameId>,
    pub action_type: ActionType,
    pub enabled: bool,
    pub valid: bool,
    pub priority: i32,
    pub throttle: u32,
    pub visits: VisitStats,
    resolution: Option<Resolution>,
}

impl ModelAction {
    pub fn new(id: ActionId, target: Option<NameId>, action_type: ActionType) -> Self {
        Self {
            id,
            label: String::new(),
            target,
            action_type,
            enabled: true,
            valid: false,
            priority: 0,
            throttle: 0,
            visits: VisitStats::default(),
            resolution: None,
        }
    }

    pub fn requires_target(&self) -> bool {
        self.action_type.requires_target()
    }

    pub fn is_back(&self) -> bool {
        self.action_type.is_back()
    }

    pub fn is_visited(&self) -> bool {
        self.visits.is_visited()
    }

    pub fn is_unvisited(&self) -> bool {
        self.visits.is_unvisited()
    }

    pub fn is_saturated(&self) -> bool {
        if !self.requires_target() {
            return self.is_visited();
        }
        self.resolution
            .as_ref()
            .map(|r| r.saturation >= 1.0)
            .unwrap_or(false)
    }

    pub fn resolved_saturation(&self) -> f32 {
        if !self.requires_target() {
            return if self.is_visited() { 1.0 } else { 0.0 };
        }
        self.resolution
            .as_ref()
            .map(|r| r.saturation.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    /// Record a resolution; targeted actions need at least one node
    pub fn resolve_at(
        &mut self,
        timestamp: u64,
        throttle: u32,
        tree: TreeId,
        node: Option<NodeId>,
        nodes: Vec<NodeId>,
    ) -> Result<()> {
        self.throttle = throttle;
        if !self.requires_target() {
            self.resolution = Some(Resolution {
                timestamp,
                tree,
                node: None,
                nodes: Vec::new(),
                saturation: 0.0,
            });
            return Ok(());
        }
        let saturation = match nodes.len() {
            0 => {
                return Err(GraphError::NoSuchAction {
                    state: self.id.state.0,
                    action_type: format!("{} has no node to resolve to", self.label),
                }
                .into())
            }
            1 => {
                if self.is_visited() {
                    1.0
                } else {
                    0.0
                }
            }
            n => {
                let total = n.min(SATURATED_VISITED_THRESHOLD) as f32;
                (self.visits.count as f32 / total).min(1.0)
            }
        };
        self.resolution = Some(Resolution {
            timestamp,
            tree,
            node,
            nodes,
            saturation,
        });
        Ok(())
    }

    pub fn is_resolved_at(&self, timestamp: u64) -> bool {
        match &self.resolution {
            Some(r) if r.timestamp == timestamp => !self.requires_target() || r.node.is_some(),
            _ => false,
        }
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub fn resolved_node(&self) -> Option<NodeId> {
        self.resolution.as_ref().and_then(|r| r.node)
    }

    pub fn resolved_nodes(&self) -> &[NodeId] {
        self.resolution
            .as_ref()
            .map(|r| r.nodes.as_slice())
            .unwrap_or(&[])
    }

    pub fn resolved_tree(&self) -> Option<TreeId> {
        self.resolution.as_ref().map(|r| r.tree)
    }
}

impl fmt::Display for ModelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.label, self.action_type.as_str())?;
        if let Some(target) = self.target {
            write!(f, "[{}]", target)?;
        }
        write!(
            f,
            "[P={}][T={}]{}{}{}",
            self.priority,
            self.throttle,
            if self.valid { "" } else { "[INVALID]" },
            if self.enabled { "" } else { "[DISABLED]" },
            if self.is_visited() { "" } else { "[UNVISITED]" }
        )
    }
}

/// Low-level events emitted by fuzzing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FuzzEvent {
    Tap { x: i32, y: i32 },
    Swipe { from: (i32, i32), to: (i32, i32) },
    Rotate { degrees: u32 },
    Key { code: u32 },
}

/// Payload of an executed model action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPayload {
    pub action: ActionId,
    pub tree: TreeId,
    pub node: Option<NodeId>,
    /// Selector of the target name
    pub target: Option<String>,
    /// Selector of the node under the full namer
    pub full: Option<String>,
    pub bounds: Option<Rect>,
    pub input_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionPayload {
    Model(ModelPayload),
    /// Start, restart and clean restart
    Start { package: String, class: String },
    Fuzz { events: Vec<FuzzEvent> },
    Crash { activity: String, message: String },
    Nop,
    Activate,
}

/// An action handed to the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub throttle: u32,
    pub priority: i32,
    pub payload: ActionPayload,
}

impl Action {
    pub fn nop(throttle: u32) -> Self {
        Self {
            action_type: ActionType::EventNop,
            throttle,
            priority: 0,
            payload: ActionPayload::Nop,
        }
    }

    pub fn activate() -> Self {
        Self {
            action_type: ActionType::EventActivate,
            throttle: 0,
            priority: 0,
            payload: ActionPayload::Activate,
        }
    }

    pub fn start(action_type: ActionType, package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            action_type,
            throttle: 0,
            priority: 0,
            payload: ActionPayload::Start {
                package: package.into(),
                class: class.into(),
            },
        }
    }

    pub fn fuzz(events: Vec<FuzzEvent>, throttle: u32) -> Self {
        Self {
            action_type: ActionType::Fuzz,
            throttle,
            priority: 0,
            payload: ActionPayload::Fuzz { events },
        }
    }

    pub fn crash(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::PhantomCrash,
            throttle: 0,
            priority: 0,
            payload: ActionPayload::Crash {
                activity: activity.into(),
                message: message.into(),
            },
        }
    }

    pub fn model(action: &ModelAction, payload: ModelPayload) -> Self {
        Self {
            action_type: action.action_type,
            throttle: action.throttle,
            priority: action.priority,
            payload: ActionPayload::Model(payload),
        }
    }

    pub fn is_model_action(&self) -> bool {
        matches!(self.payload, ActionPayload::Model(_))
    }

    pub fn model_action(&self) -> Option<ActionId> {
        match &self.payload {
            ActionPayload::Model(p) => Some(p.action),
            _ => None,
        }
    }

    pub fn model_payload(&self) -> Option<&ModelPayload> {
        match &self.payload {
            ActionPayload::Model(p) => Some(p),
            _ => None,
        }
    }

    pub fn model_payload_mut(&mut self) -> Option<&mut ModelPayload> {
        match &mut self.payload {
            ActionPayload::Model(p) => Some(p),
            _ => None,
        }
    }

    pub fn can_start_app(&self) -> bool {
        self.action_type.can_start_app()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            ActionPayload::Model(p) => write!(
                f,
                "{}[{}]{}",
                self.action_type.as_str(),
                p.action,
                p.target.as_deref().unwrap_or("")
            ),
            ActionPayload::Start { package, class } => {
                write!(f, "{}[{}/{}]", self.action_type.as_str(), package, class)
            }
            _ => f.write_str(self.action_type.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(target: Option<NameId>, ty: ActionType) -> ModelAction {
        ModelAction::new(
            ActionId {
                state: StateId(0),
                index: 0,
            },
            target,
            ty,
        )
    }

    #[test]
    fn test_single_node_saturation() {
        let mut a = action(Some(NameId(1)), ActionType::ModelClick);
        a.resolve_at(1, 0, TreeId(0), Some(NodeId(2)), vec![NodeId(2)])
            .unwrap();
        assert!(!a.is_saturated());
        a.visits.visited_at(1);
        a.resolve_at(2, 0, TreeId(0), Some(NodeId(2)), vec![NodeId(2)])
            .unwrap();
        assert!(a.is_saturated());
        assert!(a.is_resolved_at(2));
        assert!(!a.is_resolved_at(1));
    }

    #[test]
    fn test_aliased_saturation() {
        let mut a = action(Some(NameId(1)), ActionType::ModelClick);
        let nodes = vec![NodeId(1), NodeId(2), NodeId(3)];
        a.visits.visited_at(1);
        a.resolve_at(2, 0, TreeId(0), Some(NodeId(1)), nodes.clone())
            .unwrap();
        assert!((a.resolved_saturation() - 0.5).abs() < f32::EPSILON);
        a.visits.visited_at(2);
        a.resolve_at(3, 0, TreeId(0), Some(NodeId(1)), nodes).unwrap();
        assert!(a.is_saturated());
    }

    #[test]
    fn test_targeted_resolution_requires_nodes() {
        let mut a = action(Some(NameId(1)), ActionType::ModelClick);
        assert!(a.resolve_at(1, 0, TreeId(0), None, Vec::new()).is_err());
    }

    #[test]
    fn test_untargeted_saturated_once_visited() {
        let mut back = action(None, ActionType::ModelBack);
        back.resolve_at(1, 0, TreeId(0), None, Vec::new()).unwrap();
        assert!(back.is_resolved_at(1));
        assert!(!back.is_saturated());
        back.visits.visited_at(1);
        assert!(back.is_saturated());
    }

    #[test]
    fn test_filters() {
        let mut a = action(Some(NameId(1)), ActionType::ModelClick);
        assert!(!ActionFilter::EnabledValid.include(&a));
        a.valid = true;
        assert!(ActionFilter::EnabledValidUnvisited.include(&a));
        a.enabled = false;
        assert!(!ActionFilter::EnabledValid.include(&a));
        assert!(ActionFilter::WithTarget.include(&a));
        let closure = |m: &ModelAction| m.is_back();
        assert!(!closure.include(&a));
    }
}
