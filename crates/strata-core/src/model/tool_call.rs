use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub state: ToolCallState,
    pub approval: Approval,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub is_error: bool,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    /// Every state transition, oldest first. Never truncated or reordered.
    pub audit_trail: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub state: ToolCallState,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Approval {
    pub required: bool,
    pub decision: Option<ApprovalDecision>,
    pub decided_by: Option<String>,
    pub decided_at: Option<String>,
    pub note: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallState {
    Pending,
    ApprovalRequired,
    Approved,
    Denied,
    Running,
    Completed,
    Failed,
    Sealed,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallState::Denied | ToolCallState::Completed | ToolCallState::Failed | ToolCallState::Sealed
        )
    }

    pub fn can_transition_to(self, next: ToolCallState) -> bool {
        use ToolCallState::*;
        match (self, next) {
            (Pending, ApprovalRequired | Approved | Denied | Running) => true,
            (ApprovalRequired, Approved | Denied) => true,
            (Approved, Running) => true,
            (Running, Completed | Failed) => true,
            // Unfinished calls may be sealed when a run is abandoned.
            (s, Sealed) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolCallState::Pending => "PENDING",
            ToolCallState::ApprovalRequired => "APPROVAL_REQUIRED",
            ToolCallState::Approved => "APPROVED",
            ToolCallState::Denied => "DENIED",
            ToolCallState::Running => "RUNNING",
            ToolCallState::Completed => "COMPLETED",
            ToolCallState::Failed => "FAILED",
            ToolCallState::Sealed => "SEALED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ToolCallState {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ToolCallState::Pending),
            "APPROVAL_REQUIRED" => Ok(ToolCallState::ApprovalRequired),
            "APPROVED" => Ok(ToolCallState::Approved),
            "DENIED" => Ok(ToolCallState::Denied),
            "RUNNING" => Ok(ToolCallState::Running),
            "COMPLETED" => Ok(ToolCallState::Completed),
            "FAILED" => Ok(ToolCallState::Failed),
            "SEALED" => Ok(ToolCallState::Sealed),
            _ => Err(Error::Validation(format!("invalid tool call state: {s}"))),
        }
    }
}

impl ToolCallRecord {
    /// A freshly issued call in `PENDING` with a one-entry audit trail.
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            name: name.into(),
            input,
            state: ToolCallState::Pending,
            approval: Approval::default(),
            result: None,
            error: None,
            is_error: false,
            created_at: now.clone(),
            updated_at: now.clone(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            audit_trail: vec![AuditEntry {
                state: ToolCallState::Pending,
                timestamp: now,
                note: None,
            }],
        }
    }

    /// Move to `next`, appending the transition to the audit trail.
    pub fn transition(&mut self, next: ToolCallState, note: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: format!("tool call {}", self.id),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = chrono::Utc::now();
        let stamp = now.to_rfc3339();
        match next {
            ToolCallState::Running => self.started_at = Some(stamp.clone()),
            s if s.is_terminal() => {
                self.completed_at = Some(stamp.clone());
                self.duration_ms = self
                    .started_at
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|started| (now - started.with_timezone(&chrono::Utc)).num_milliseconds());
            }
            _ => {}
        }
        self.state = next;
        self.updated_at = stamp.clone();
        self.audit_trail.push(AuditEntry {
            state: next,
            timestamp: stamp,
            note,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_has_pending_audit() {
        let rec = ToolCallRecord::new("c1", "bash", json!({"cmd": "ls"}));
        assert_eq!(rec.state, ToolCallState::Pending);
        assert_eq!(rec.audit_trail.len(), 1);
        assert_eq!(rec.audit_trail[0].state, ToolCallState::Pending);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut rec = ToolCallRecord::new("c1", "bash", json!({}));
        rec.transition(ToolCallState::Approved, None).unwrap();
        rec.transition(ToolCallState::Running, None).unwrap();
        rec.transition(ToolCallState::Completed, Some("exit 0".into())).unwrap();
        let states: Vec<_> = rec.audit_trail.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                ToolCallState::Pending,
                ToolCallState::Approved,
                ToolCallState::Running,
                ToolCallState::Completed
            ]
        );
        assert!(rec.started_at.is_some());
        assert!(rec.completed_at.is_some());
        assert!(rec.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn test_rejected_transition_leaves_trail_untouched() {
        let mut rec = ToolCallRecord::new("c1", "bash", json!({}));
        rec.transition(ToolCallState::Denied, None).unwrap();
        let err = rec.transition(ToolCallState::Running, None).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(rec.audit_trail.len(), 2);
        assert_eq!(rec.audit_trail.last().unwrap().state, rec.state);
    }

    #[test]
    fn test_seal_only_unfinished() {
        assert!(ToolCallState::Running.can_transition_to(ToolCallState::Sealed));
        assert!(!ToolCallState::Completed.can_transition_to(ToolCallState::Sealed));
        assert!(!ToolCallState::Sealed.can_transition_to(ToolCallState::Sealed));
    }

    #[test]
    fn test_state_display_fromstr() {
        assert_eq!(ToolCallState::ApprovalRequired.to_string(), "APPROVAL_REQUIRED");
        assert_eq!("FAILED".parse::<ToolCallState>().unwrap(), ToolCallState::Failed);
        assert!("bogus".parse::<ToolCallState>().is_err());
    }
}
