use serde::{Deserialize, Serialize};

use crate::model::event::Bookmark;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub agent_id: String,
    pub template_id: String,
    pub created_at: String,
    pub config_version: String,
    /// Ancestor agent ids, oldest first. Empty for a root agent.
    pub lineage: Vec<String>,
    pub message_count: u64,
    /// Index of the most recent safe-fork-point, -1 if none.
    pub last_sfp_index: i64,
    pub last_bookmark: Option<Bookmark>,
    pub breakpoint: Option<BreakpointState>,
    pub metadata: serde_json::Value,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            template_id: template_id.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            config_version: "v1".to_string(),
            lineage: Vec::new(),
            message_count: 0,
            last_sfp_index: -1,
            last_bookmark: None,
            breakpoint: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Effective breakpoint state; an unset breakpoint means the agent is running.
    pub fn breakpoint_state(&self) -> BreakpointState {
        self.breakpoint.unwrap_or(BreakpointState::Running)
    }

    /// The immediate parent this agent was forked from, if any.
    pub fn parent_id(&self) -> Option<&str> {
        self.lineage.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakpointState {
    Running,
    AwaitingApproval,
    Paused,
    Done,
}

impl BreakpointState {
    pub fn can_transition_to(self, next: BreakpointState) -> bool {
        use BreakpointState::*;
        matches!(
            (self, next),
            (Running, AwaitingApproval | Paused | Done)
                | (AwaitingApproval, AwaitingApproval | Running)
                | (Paused, Running)
                | (Done, Running)
        )
    }
}

impl std::fmt::Display for BreakpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointState::Running => write!(f, "RUNNING"),
            BreakpointState::AwaitingApproval => write!(f, "AWAITING_APPROVAL"),
            BreakpointState::Paused => write!(f, "PAUSED"),
            BreakpointState::Done => write!(f, "DONE"),
        }
    }
}

impl std::str::FromStr for BreakpointState {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(BreakpointState::Running),
            "AWAITING_APPROVAL" => Ok(BreakpointState::AwaitingApproval),
            "PAUSED" => Ok(BreakpointState::Paused),
            "DONE" => Ok(BreakpointState::Done),
            _ => Err(crate::error::Error::Validation(format!(
                "invalid breakpoint state: {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_info_serde() {
        let mut info = AgentInfo::new("agent-1", "tpl");
        info.lineage = vec!["root".to_string()];
        info.last_bookmark = Some(Bookmark {
            seq: 4,
            timestamp: "2025-01-01T00:00:00Z".to_string(),
        });
        info.breakpoint = Some(BreakpointState::AwaitingApproval);
        info.metadata = serde_json::json!({"z": 1, "a": {"nested": [1, "two", null]}});
        let json = serde_json::to_string(&info).unwrap();
        let deserialized: AgentInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, deserialized);
        assert_eq!(deserialized.parent_id(), Some("root"));
    }

    #[test]
    fn test_breakpoint_display_fromstr() {
        assert_eq!(BreakpointState::AwaitingApproval.to_string(), "AWAITING_APPROVAL");
        assert_eq!("PAUSED".parse::<BreakpointState>().unwrap(), BreakpointState::Paused);
        assert!("paused".parse::<BreakpointState>().is_err());
        assert_eq!(AgentInfo::new("a", "t").breakpoint_state(), BreakpointState::Running);
    }

    #[test]
    fn test_breakpoint_transitions() {
        use BreakpointState::*;
        assert!(Running.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Done.can_transition_to(Running));
        assert!(!Paused.can_transition_to(AwaitingApproval));
        assert!(!AwaitingApproval.can_transition_to(Done));
        assert!(!Done.can_transition_to(Paused));
    }
}
