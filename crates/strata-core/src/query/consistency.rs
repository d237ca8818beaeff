use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::agent::{AgentInfo, BreakpointState};
use crate::model::message::{Message, safe_fork_point};
use crate::model::snapshot::Snapshot;
use crate::model::tool_call::{ToolCallRecord, ToolCallState};
use crate::query::StrataEngine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyViolation {
    MessageCountMismatch {
        recorded: u64,
        actual: u64,
    },
    SfpOutOfRange {
        index: i64,
        message_count: u64,
    },
    /// The recorded safe-fork-point is not the one the messages yield, as
    /// left by a message save whose info update failed.
    SfpStale {
        recorded: i64,
        actual: i64,
    },
    /// A `tool_use` block with no matching tool call record.
    MissingToolCallRecord {
        tool_use_id: String,
        message_index: usize,
    },
    /// A `tool_result` that answers neither an earlier `tool_use` nor a record.
    OrphanToolResult {
        tool_use_id: String,
        message_index: usize,
    },
    EmptyAuditTrail {
        tool_call_id: String,
    },
    AuditStateMismatch {
        tool_call_id: String,
        audit_state: ToolCallState,
        state: ToolCallState,
    },
    AuditOutOfOrder {
        tool_call_id: String,
        position: usize,
    },
    SnapshotSfpOutOfRange {
        snapshot_id: String,
        index: i64,
        message_count: u64,
    },
    /// The agent's breakpoint disagrees with its pending approvals.
    BreakpointMismatch {
        breakpoint: BreakpointState,
        awaiting: usize,
    },
}

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub agent_id: String,
    pub checked_at: String,
    pub violations: Vec<ConsistencyViolation>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Cross-check an agent's denormalized fields against its data. Reports,
/// never repairs.
pub async fn execute(engine: &StrataEngine, agent_id: &str) -> Result<ConsistencyReport> {
    engine
        .with_agent_lock(agent_id, async {
            let info = engine.require_info(agent_id).await?;
            let messages = engine.storage.load_messages(agent_id).await?;
            let records = engine.storage.load_tool_call_records(agent_id).await?;
            let snapshots = engine.storage.list_snapshots(agent_id).await?;

            let violations = check(&info, &messages, &records, &snapshots);
            if !violations.is_empty() {
                tracing::warn!(
                    agent_id,
                    violations = violations.len(),
                    "consistency check found violations"
                );
            }
            Ok(ConsistencyReport {
                agent_id: agent_id.to_string(),
                checked_at: chrono::Utc::now().to_rfc3339(),
                violations,
            })
        })
        .await
}

pub fn check(
    info: &AgentInfo,
    messages: &[Message],
    records: &[ToolCallRecord],
    snapshots: &[Snapshot],
) -> Vec<ConsistencyViolation> {
    let mut violations = Vec::new();
    let actual = messages.len() as u64;

    if info.message_count != actual {
        violations.push(ConsistencyViolation::MessageCountMismatch {
            recorded: info.message_count,
            actual,
        });
    }
    if !sfp_in_range(info.last_sfp_index, actual) {
        violations.push(ConsistencyViolation::SfpOutOfRange {
            index: info.last_sfp_index,
            message_count: actual,
        });
    } else {
        let sfp = safe_fork_point(messages);
        if info.last_sfp_index != sfp {
            violations.push(ConsistencyViolation::SfpStale {
                recorded: info.last_sfp_index,
                actual: sfp,
            });
        }
    }

    let recorded: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
    let mut issued: HashSet<&str> = HashSet::new();
    for (message_index, message) in messages.iter().enumerate() {
        for id in message.tool_result_ids() {
            if !issued.contains(id) && !recorded.contains(id) {
                violations.push(ConsistencyViolation::OrphanToolResult {
                    tool_use_id: id.to_string(),
                    message_index,
                });
            }
        }
        for id in message.tool_use_ids() {
            issued.insert(id);
            if !recorded.contains(id) {
                violations.push(ConsistencyViolation::MissingToolCallRecord {
                    tool_use_id: id.to_string(),
                    message_index,
                });
            }
        }
    }

    for record in records {
        check_audit(record, &mut violations);
    }

    for snapshot in snapshots {
        let count = snapshot.messages.len() as u64;
        if !sfp_in_range(snapshot.last_sfp_index, count) {
            violations.push(ConsistencyViolation::SnapshotSfpOutOfRange {
                snapshot_id: snapshot.id.clone(),
                index: snapshot.last_sfp_index,
                message_count: count,
            });
        }
    }

    let awaiting = records
        .iter()
        .filter(|r| r.state == ToolCallState::ApprovalRequired)
        .count();
    let breakpoint = info.breakpoint_state();
    if (breakpoint == BreakpointState::AwaitingApproval) != (awaiting > 0) {
        violations.push(ConsistencyViolation::BreakpointMismatch { breakpoint, awaiting });
    }

    violations
}

fn sfp_in_range(index: i64, message_count: u64) -> bool {
    index == -1 || (index >= 0 && (index as u64) < message_count)
}

fn check_audit(record: &ToolCallRecord, violations: &mut Vec<ConsistencyViolation>) {
    let Some(last) = record.audit_trail.last() else {
        violations.push(ConsistencyViolation::EmptyAuditTrail {
            tool_call_id: record.id.clone(),
        });
        return;
    };
    if last.state != record.state {
        violations.push(ConsistencyViolation::AuditStateMismatch {
            tool_call_id: record.id.clone(),
            audit_state: last.state,
            state: record.state,
        });
    }
    let stamps: Vec<_> = record
        .audit_trail
        .iter()
        .map(|e| chrono::DateTime::parse_from_rfc3339(&e.timestamp).ok())
        .collect();
    for (position, pair) in stamps.windows(2).enumerate() {
        if let [Some(prev), Some(next)] = pair {
            if next < prev {
                violations.push(ConsistencyViolation::AuditOutOfOrder {
                    tool_call_id: record.id.clone(),
                    position: position + 1,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::{ContentBlock, Role};
    use crate::model::tool_call::AuditEntry;
    use serde_json::json;

    fn tool_use(id: &str) -> Message {
        Message::new(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: id.into(),
                name: "bash".into(),
                input: json!({}),
            }],
        )
    }

    #[test]
    fn test_clean_agent_has_no_violations() {
        let mut info = AgentInfo::new("a1", "tpl");
        let messages = vec![
            Message::user("go"),
            tool_use("c1"),
            Message::tool_result("c1", json!("ok"), false),
        ];
        info.message_count = 3;
        info.last_sfp_index = 2;
        let records = vec![ToolCallRecord::new("c1", "bash", json!({}))];
        assert!(check(&info, &messages, &records, &[]).is_empty());
    }

    #[test]
    fn test_reports_count_and_reference_drift() {
        let mut info = AgentInfo::new("a1", "tpl");
        info.message_count = 5;
        info.last_sfp_index = 7;
        let messages = vec![tool_use("c1"), Message::tool_result("c9", json!("?"), false)];
        let violations = check(&info, &messages, &[], &[]);
        assert!(violations.contains(&ConsistencyViolation::MessageCountMismatch {
            recorded: 5,
            actual: 2
        }));
        assert!(violations.contains(&ConsistencyViolation::SfpOutOfRange {
            index: 7,
            message_count: 2
        }));
        assert!(violations.contains(&ConsistencyViolation::MissingToolCallRecord {
            tool_use_id: "c1".into(),
            message_index: 0
        }));
        assert!(violations.contains(&ConsistencyViolation::OrphanToolResult {
            tool_use_id: "c9".into(),
            message_index: 1
        }));
    }

    #[test]
    fn test_reports_stale_sfp() {
        let mut info = AgentInfo::new("a1", "tpl");
        let messages = vec![
            Message::user("go"),
            Message::assistant("done"),
            Message::user("again"),
        ];
        info.message_count = 3;
        info.last_sfp_index = 0;
        assert_eq!(
            check(&info, &messages, &[], &[]),
            vec![ConsistencyViolation::SfpStale {
                recorded: 0,
                actual: 2
            }]
        );
    }

    #[test]
    fn test_reports_audit_problems() {
        let info = AgentInfo::new("a1", "tpl");
        let mut empty = ToolCallRecord::new("c1", "bash", json!({}));
        empty.audit_trail.clear();
        let mut stale = ToolCallRecord::new("c2", "bash", json!({}));
        stale.state = ToolCallState::Running;
        let mut reordered = ToolCallRecord::new("c3", "bash", json!({}));
        reordered.audit_trail = vec![
            AuditEntry {
                state: ToolCallState::Pending,
                timestamp: "2025-01-01T00:00:05Z".into(),
                note: None,
            },
            AuditEntry {
                state: ToolCallState::Pending,
                timestamp: "2025-01-01T00:00:01Z".into(),
                note: None,
            },
        ];
        let violations = check(&info, &[], &[empty, stale, reordered], &[]);
        assert_eq!(
            violations,
            vec![
                ConsistencyViolation::EmptyAuditTrail {
                    tool_call_id: "c1".into()
                },
                ConsistencyViolation::AuditStateMismatch {
                    tool_call_id: "c2".into(),
                    audit_state: ToolCallState::Pending,
                    state: ToolCallState::Running,
                },
                ConsistencyViolation::AuditOutOfOrder {
                    tool_call_id: "c3".into(),
                    position: 1
                },
            ]
        );
    }

    #[test]
    fn test_reports_breakpoint_without_pending_approval() {
        let mut info = AgentInfo::new("a1", "tpl");
        info.breakpoint = Some(BreakpointState::AwaitingApproval);
        let violations = check(&info, &[], &[], &[]);
        assert_eq!(
            violations,
            vec![ConsistencyViolation::BreakpointMismatch {
                breakpoint: BreakpointState::AwaitingApproval,
                awaiting: 0
            }]
        );
    }
}
