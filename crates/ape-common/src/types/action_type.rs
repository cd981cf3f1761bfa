//! Action types
//!
//! The ordering of the variants is significant: model actions occupy a
//! contiguous range, and targeted actions are the tail of that range.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of an executable action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Phantom record of an application crash
    PhantomCrash,
    /// Random low-level input burst
    Fuzz,
    /// Start the main activity
    EventStart,
    /// Kill the process and start again
    EventRestart,
    /// Kill the process, clear app data and start again
    EventCleanRestart,
    /// Wait
    EventNop,
    /// Bring the app to the foreground
    EventActivate,
    ModelBack,
    ModelClick,
    ModelLongClick,
    ModelScrollTopDown,
    ModelScrollBottomUp,
    ModelScrollLeftRight,
    ModelScrollRightLeft,
}

impl ActionType {
    /// All variants in ordinal order
    pub const ALL: [ActionType; 14] = [
        ActionType::PhantomCrash,
        ActionType::Fuzz,
        ActionType::EventStart,
        ActionType::EventRestart,
        ActionType::EventCleanRestart,
        ActionType::EventNop,
        ActionType::EventActivate,
        ActionType::ModelBack,
        ActionType::ModelClick,
        ActionType::ModelLongClick,
        ActionType::ModelScrollTopDown,
        ActionType::ModelScrollBottomUp,
        ActionType::ModelScrollLeftRight,
        ActionType::ModelScrollRightLeft,
    ];

    fn ordinal(self) -> u8 {
        self as u8
    }

    /// Targeted actions operate on a widget
    pub fn requires_target(self) -> bool {
        let ord = self.ordinal();
        ord >= ActionType::ModelClick.ordinal() && ord <= ActionType::ModelScrollRightLeft.ordinal()
    }

    pub fn can_start_app(self) -> bool {
        matches!(
            self,
            ActionType::EventStart | ActionType::EventRestart | ActionType::EventCleanRestart
        )
    }

    pub fn is_scroll(self) -> bool {
        let ord = self.ordinal();
        ord >= ActionType::ModelScrollTopDown.ordinal()
            && ord <= ActionType::ModelScrollRightLeft.ordinal()
    }

    /// Model actions label edges of the state graph
    pub fn is_model_action(self) -> bool {
        let ord = self.ordinal();
        ord >= ActionType::ModelBack.ordinal() && ord <= ActionType::ModelScrollRightLeft.ordinal()
    }

    pub fn is_back(self) -> bool {
        self == ActionType::ModelBack
    }

    /// Base priority weight used by the exploration policy
    pub fn base_priority(self) -> i32 {
        match self {
            ActionType::ModelClick => 4,
            ActionType::ModelLongClick => 2,
            ActionType::ModelScrollTopDown => 2,
            ActionType::ModelScrollBottomUp => 3,
            ActionType::ModelScrollLeftRight => 3,
            ActionType::ModelScrollRightLeft => 2,
            _ => 1,
        }
    }

    /// Log name, e.g. `MODEL_CLICK`
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::PhantomCrash => "PHANTOM_CRASH",
            ActionType::Fuzz => "FUZZ",
            ActionType::EventStart => "EVENT_START",
            ActionType::EventRestart => "EVENT_RESTART",
            ActionType::EventCleanRestart => "EVENT_CLEAN_RESTART",
            ActionType::EventNop => "EVENT_NOP",
            ActionType::EventActivate => "EVENT_ACTIVATE",
            ActionType::ModelBack => "MODEL_BACK",
            ActionType::ModelClick => "MODEL_CLICK",
            ActionType::ModelLongClick => "MODEL_LONG_CLICK",
            ActionType::ModelScrollTopDown => "MODEL_SCROLL_TOP_DOWN",
            ActionType::ModelScrollBottomUp => "MODEL_SCROLL_BOTTOM_UP",
            ActionType::ModelScrollLeftRight => "MODEL_SCROLL_LEFT_RIGHT",
            ActionType::ModelScrollRightLeft => "MODEL_SCROLL_RIGHT_LEFT",
        }
    }

    /// Parse a log name
    pub fn parse(s: &str) -> Option<ActionType> {
        ActionType::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_ranges() {
        assert!(ActionType::ModelBack.is_model_action());
        assert!(!ActionType::ModelBack.requires_target());
        assert!(ActionType::ModelClick.requires_target());
        assert!(ActionType::ModelScrollRightLeft.requires_target());
        assert!(ActionType::ModelScrollTopDown.is_scroll());
        assert!(!ActionType::ModelLongClick.is_scroll());
        assert!(!ActionType::EventActivate.is_model_action());
        assert!(ActionType::EventCleanRestart.can_start_app());
    }

    #[test]
    fn test_action_type_names_round_trip() {
        for t in ActionType::ALL {
            assert_eq!(ActionType::parse(t.as_str()), Some(t));
        }
        let json = serde_json::to_string(&ActionType::ModelLongClick).unwrap();
        assert_eq!(json, "\"MODEL_LONG_CLICK\"");
    }
}
