//! Breakpoint state machine.
//!
//! An agent is `RUNNING` until a tool call needs approval (`AWAITING_APPROVAL`),
//! someone pauses it (`PAUSED`), or its turn ends (`DONE`). Tool calls move
//! through their own states and every move is appended to the call's audit
//! trail. All operations run under the agent lock, persist records before
//! agent info, and announce the outcome on the control channel.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::agent::{AgentInfo, BreakpointState};
use crate::model::event::TimelineEvent;
use crate::model::message::{Message, safe_fork_point};
use crate::model::tool_call::{ApprovalDecision, ToolCallRecord, ToolCallState};
use crate::query::StrataEngine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointResponse {
    pub agent_id: String,
    pub breakpoint: BreakpointState,
    pub tool_call: Option<ToolCallRecord>,
    pub event: TimelineEvent,
}

struct Turn {
    info: AgentInfo,
    records: Vec<ToolCallRecord>,
    records_changed: bool,
}

impl Turn {
    async fn load(engine: &StrataEngine, agent_id: &str) -> Result<Self> {
        let info = engine.require_info(agent_id).await?;
        let records = engine.storage.load_tool_call_records(agent_id).await?;
        Ok(Self {
            info,
            records,
            records_changed: false,
        })
    }

    fn state(&self) -> BreakpointState {
        self.info.breakpoint_state()
    }

    fn move_agent(&mut self, next: BreakpointState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: format!("agent {}", self.info.agent_id),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.info.breakpoint = (next != BreakpointState::Running).then_some(next);
        Ok(())
    }

    /// Tool work is only accepted while the agent is live.
    fn require_live(&self, to: ToolCallState) -> Result<()> {
        match self.state() {
            BreakpointState::Running | BreakpointState::AwaitingApproval => Ok(()),
            other => Err(Error::InvalidTransition {
                entity: format!("agent {}", self.info.agent_id),
                from: other.to_string(),
                to: to.to_string(),
            }),
        }
    }

    fn call_mut(&mut self, call_id: &str) -> Result<&mut ToolCallRecord> {
        self.records_changed = true;
        let agent_id = &self.info.agent_id;
        self.records
            .iter_mut()
            .find(|r| r.id == call_id)
            .ok_or_else(|| Error::NotFound(format!("tool call {call_id} of agent {agent_id}")))
    }

    fn call(&self, call_id: &str) -> Option<ToolCallRecord> {
        self.records.iter().find(|r| r.id == call_id).cloned()
    }

    fn awaiting_approval(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.state == ToolCallState::ApprovalRequired)
    }

    async fn commit(
        self,
        engine: &StrataEngine,
        kind: &str,
        call_id: Option<&str>,
        extra: serde_json::Value,
    ) -> Result<BreakpointResponse> {
        let agent_id = self.info.agent_id.clone();
        if self.records_changed {
            engine
                .storage
                .save_tool_call_records(&agent_id, &self.records)
                .await?;
        }
        engine.storage.save_info(&self.info).await?;

        let tool_call = call_id.and_then(|id| self.call(id));
        let breakpoint = self.state();
        let mut payload = serde_json::json!({ "breakpoint": breakpoint });
        if let Some(call) = &tool_call {
            payload["tool_call_id"] = call.id.clone().into();
            payload["tool_name"] = call.name.clone().into();
            payload["state"] = call.state.to_string().into();
        }
        if let (Some(map), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            map.extend(extra);
        }
        let event = engine.timeline.control(&agent_id, kind, payload).await?;
        tracing::debug!(agent_id = %agent_id, kind, breakpoint = %breakpoint, "breakpoint transition");
        Ok(BreakpointResponse {
            agent_id,
            breakpoint,
            tool_call,
            event,
        })
    }
}

/// Record a freshly issued tool call. Starts a new turn if the previous one
/// was finished.
pub async fn register_tool_call(
    engine: &StrataEngine,
    agent_id: &str,
    record: ToolCallRecord,
) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            if turn.records.iter().any(|r| r.id == record.id) {
                return Err(Error::ConstraintViolation(format!(
                    "tool call {} already recorded for agent {agent_id}",
                    record.id
                )));
            }
            if record.audit_trail.last().map(|e| e.state) != Some(record.state) {
                return Err(Error::Validation(format!(
                    "tool call {} audit trail does not end in {}",
                    record.id, record.state
                )));
            }
            if turn.state() == BreakpointState::Done {
                turn.move_agent(BreakpointState::Running)?;
            }
            turn.require_live(record.state)?;
            let call_id = record.id.clone();
            turn.records.push(record);
            turn.records_changed = true;
            turn.commit(engine, "tool_call_registered", Some(&call_id), serde_json::json!({}))
                .await
        })
        .await
}

pub async fn require_approval(
    engine: &StrataEngine,
    agent_id: &str,
    call_id: &str,
    meta: serde_json::Value,
) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            turn.require_live(ToolCallState::ApprovalRequired)?;
            let call = turn.call_mut(call_id)?;
            call.transition(ToolCallState::ApprovalRequired, None)?;
            call.approval.required = true;
            call.approval.meta = meta;
            turn.move_agent(BreakpointState::AwaitingApproval)?;
            turn.commit(engine, "approval_required", Some(call_id), serde_json::json!({}))
                .await
        })
        .await
}

/// Resolve a pending approval. A denial also appends a synthetic error
/// `tool_result` so the conversation stays well formed. The messages are
/// saved before the record, so a retried denial finds its `tool_result`
/// already present and does not append another.
pub async fn decide(
    engine: &StrataEngine,
    agent_id: &str,
    call_id: &str,
    decision: Decision,
    decided_by: Option<String>,
) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            let now = chrono::Utc::now().to_rfc3339();
            let call = turn.call_mut(call_id)?;
            if call.state != ToolCallState::ApprovalRequired {
                return Err(Error::InvalidTransition {
                    entity: format!("tool call {call_id}"),
                    from: call.state.to_string(),
                    to: match decision {
                        Decision::Allow => ToolCallState::Approved.to_string(),
                        Decision::Deny { .. } => ToolCallState::Denied.to_string(),
                    },
                });
            }
            call.approval.decided_by = decided_by.clone();
            call.approval.decided_at = Some(now);
            match &decision {
                Decision::Allow => {
                    call.transition(ToolCallState::Approved, None)?;
                    call.approval.decision = Some(ApprovalDecision::Allow);
                }
                Decision::Deny { reason } => {
                    call.transition(ToolCallState::Denied, Some(reason.clone()))?;
                    call.approval.decision = Some(ApprovalDecision::Deny);
                    call.approval.note = Some(reason.clone());
                    call.is_error = true;
                    call.error = Some(reason.clone());

                    let mut messages = engine.storage.load_messages(agent_id).await?;
                    let answered = messages
                        .iter()
                        .any(|m| m.tool_result_ids().any(|id| id == call_id));
                    if !answered {
                        messages.push(Message::tool_result(
                            call_id,
                            serde_json::json!({ "error": "denied", "reason": reason }),
                            true,
                        ));
                        engine.storage.save_messages(agent_id, &messages).await?;
                    }
                    turn.info.message_count = messages.len() as u64;
                    turn.info.last_sfp_index = safe_fork_point(&messages);
                }
            }
            if !turn.awaiting_approval() {
                turn.move_agent(BreakpointState::Running)?;
            }
            turn.commit(
                engine,
                "approval_decided",
                Some(call_id),
                serde_json::json!({ "decision": decision, "decided_by": decided_by }),
            )
            .await
        })
        .await
}

pub async fn start_tool(engine: &StrataEngine, agent_id: &str, call_id: &str) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            turn.require_live(ToolCallState::Running)?;
            turn.call_mut(call_id)?
                .transition(ToolCallState::Running, None)?;
            turn.commit(engine, "tool_started", Some(call_id), serde_json::json!({}))
                .await
        })
        .await
}

pub async fn complete_tool(
    engine: &StrataEngine,
    agent_id: &str,
    call_id: &str,
    result: serde_json::Value,
) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            let call = turn.call_mut(call_id)?;
            call.transition(ToolCallState::Completed, None)?;
            call.result = Some(result);
            turn.commit(engine, "tool_completed", Some(call_id), serde_json::json!({}))
                .await
        })
        .await
}

pub async fn fail_tool(
    engine: &StrataEngine,
    agent_id: &str,
    call_id: &str,
    error: String,
) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            let call = turn.call_mut(call_id)?;
            call.transition(ToolCallState::Failed, Some(error.clone()))?;
            call.error = Some(error);
            call.is_error = true;
            turn.commit(engine, "tool_failed", Some(call_id), serde_json::json!({}))
                .await
        })
        .await
}

pub async fn pause(engine: &StrataEngine, agent_id: &str, reason: Option<String>) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            turn.move_agent(BreakpointState::Paused)?;
            turn.commit(engine, "paused", None, serde_json::json!({ "reason": reason }))
                .await
        })
        .await
}

pub async fn resume_agent(engine: &StrataEngine, agent_id: &str) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            if turn.state() == BreakpointState::AwaitingApproval {
                return Err(Error::InvalidTransition {
                    entity: format!("agent {agent_id}"),
                    from: BreakpointState::AwaitingApproval.to_string(),
                    to: BreakpointState::Running.to_string(),
                });
            }
            turn.move_agent(BreakpointState::Running)?;
            turn.commit(engine, "resumed", None, serde_json::json!({}))
                .await
        })
        .await
}

/// End the agent's turn. Calls that never reached a terminal state are sealed.
pub async fn finish_turn(engine: &StrataEngine, agent_id: &str) -> Result<BreakpointResponse> {
    engine
        .with_agent_lock(agent_id, async {
            let mut turn = Turn::load(engine, agent_id).await?;
            turn.move_agent(BreakpointState::Done)?;
            let mut sealed = Vec::new();
            for record in turn.records.iter_mut().filter(|r| !r.state.is_terminal()) {
                record.transition(ToolCallState::Sealed, Some("turn finished".to_string()))?;
                sealed.push(record.id.clone());
            }
            turn.records_changed = !sealed.is_empty();
            turn.commit(engine, "turn_finished", None, serde_json::json!({ "sealed": sealed }))
                .await
        })
        .await
}
