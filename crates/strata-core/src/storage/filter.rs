//! Predicate, ordering and paging helpers shared by the adapters.
//!
//! SQL adapters assemble a `WHERE` clause with [`WhereBuilder`] using `$n`
//! placeholders, which both DuckDB and Postgres accept. The file adapter
//! evaluates the same filters in memory with the `*_matches` functions so
//! that every medium returns identical results for identical inputs.

use std::collections::BTreeMap;

use crate::model::agent::AgentInfo;
use crate::model::message::Message;
use crate::model::snapshot::Snapshot;
use crate::model::tool_call::ToolCallRecord;
use crate::storage::{
    AgentFilter, AgentStats, MessageFilter, Page, SnapshotFilter, Sort, SortDirection, SortKey,
    ToolCallFilter,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

impl From<String> for SqlParam {
    fn from(s: String) -> Self {
        SqlParam::Text(s)
    }
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::Text(s.to_string())
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Int(v)
    }
}

#[derive(Debug, Default)]
pub struct WhereBuilder {
    conditions: Vec<String>,
    params: Vec<SqlParam>,
}

impl WhereBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    /// `column <op> $n`
    pub fn compare(&mut self, column: &str, op: &str, value: impl Into<SqlParam>) -> &mut Self {
        let placeholder = self.bind(value.into());
        self.conditions.push(format!("{column} {op} {placeholder}"));
        self
    }

    pub fn eq(&mut self, column: &str, value: impl Into<SqlParam>) -> &mut Self {
        self.compare(column, "=", value)
    }

    pub fn eq_opt<V: Into<SqlParam> + Clone>(&mut self, column: &str, value: Option<&V>) -> &mut Self {
        if let Some(v) = value {
            self.eq(column, v.clone());
        }
        self
    }

    /// Inclusive lower and exclusive upper bound on an RFC 3339 column.
    pub fn time_range(&mut self, column: &str, after: Option<&String>, before: Option<&String>) -> &mut Self {
        if let Some(after) = after {
            self.compare(column, ">=", after.clone());
        }
        if let Some(before) = before {
            self.compare(column, "<", before.clone());
        }
        self
    }

    /// `column IN (...)`; an empty set matches nothing.
    pub fn any_of<V: Into<SqlParam>>(&mut self, column: &str, values: impl IntoIterator<Item = V>) -> &mut Self {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.bind(v.into())).collect();
        if placeholders.is_empty() {
            self.conditions.push("1 = 0".to_string());
        } else {
            self.conditions
                .push(format!("{column} IN ({})", placeholders.join(", ")));
        }
        self
    }

    /// Literal prefix match; `%`, `_` and `\` in `prefix` carry no wildcard meaning.
    pub fn prefix(&mut self, column: &str, prefix: &str) -> &mut Self {
        let placeholder = self.bind(SqlParam::Text(format!("{}%", escape_like(prefix))));
        self.conditions
            .push(format!("{column} LIKE {placeholder} ESCAPE '\\'"));
        self
    }

    pub fn clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }
}

pub fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `ORDER BY` for `sort`, with `id_column` as the tie-breaker.
pub fn order_by(sort: &Sort, id_column: &str) -> String {
    let dir = sort.sql_direction();
    match sort.key {
        SortKey::CreatedAt => format!("ORDER BY created_at {dir}, {id_column} {dir}"),
        SortKey::Id => format!("ORDER BY {id_column} {dir}"),
    }
}

pub fn agent_filter_sql(filter: &AgentFilter) -> WhereBuilder {
    let mut w = WhereBuilder::new();
    if let Some(prefix) = &filter.agent_id_prefix {
        w.prefix("agent_id", prefix);
    }
    w.eq_opt("template_id", filter.template_id.as_ref());
    w.time_range("created_at", filter.created_after.as_ref(), filter.created_before.as_ref());
    match filter.breakpoint {
        // An unset breakpoint is stored as NULL and means RUNNING.
        Some(crate::model::agent::BreakpointState::Running) => {
            w.conditions
                .push("(breakpoint IS NULL OR breakpoint = 'RUNNING')".to_string());
        }
        Some(state) => {
            w.eq("breakpoint", state.to_string());
        }
        None => {}
    }
    w
}

pub fn message_filter_sql(filter: &MessageFilter) -> WhereBuilder {
    let mut w = WhereBuilder::new();
    w.eq_opt("agent_id", filter.agent_id.as_ref());
    if let Some(role) = filter.role {
        w.eq("role", role.to_string());
    }
    if let Some(from) = filter.seq_from {
        w.compare("seq", ">=", from as i64);
    }
    if let Some(to) = filter.seq_to {
        w.compare("seq", "<=", to as i64);
    }
    w
}

pub fn tool_call_filter_sql(filter: &ToolCallFilter) -> WhereBuilder {
    let mut w = WhereBuilder::new();
    w.eq_opt("agent_id", filter.agent_id.as_ref());
    w.eq_opt("name", filter.tool_name.as_ref());
    if let Some(state) = filter.state {
        w.eq("state", state.to_string());
    }
    w.time_range("created_at", filter.created_after.as_ref(), filter.created_before.as_ref());
    w
}

pub fn snapshot_filter_sql(filter: &SnapshotFilter) -> WhereBuilder {
    let mut w = WhereBuilder::new();
    w.eq_opt("agent_id", filter.agent_id.as_ref());
    w.time_range("created_at", filter.created_after.as_ref(), filter.created_before.as_ref());
    w
}

fn in_range(value: &str, after: Option<&String>, before: Option<&String>) -> bool {
    after.is_none_or(|a| value >= a.as_str()) && before.is_none_or(|b| value < b.as_str())
}

pub fn agent_matches(filter: &AgentFilter, info: &AgentInfo) -> bool {
    filter
        .agent_id_prefix
        .as_ref()
        .is_none_or(|p| info.agent_id.starts_with(p.as_str()))
        && filter
            .template_id
            .as_ref()
            .is_none_or(|t| &info.template_id == t)
        && in_range(
            &info.created_at,
            filter.created_after.as_ref(),
            filter.created_before.as_ref(),
        )
        && filter
            .breakpoint
            .is_none_or(|b| info.breakpoint_state() == b)
}

pub fn message_matches(filter: &MessageFilter, agent_id: &str, seq: u64, message: &Message) -> bool {
    filter.agent_id.as_ref().is_none_or(|a| a == agent_id)
        && filter.role.is_none_or(|r| message.role == r)
        && filter.seq_from.is_none_or(|from| seq >= from)
        && filter.seq_to.is_none_or(|to| seq <= to)
}

pub fn tool_call_matches(filter: &ToolCallFilter, agent_id: &str, record: &ToolCallRecord) -> bool {
    filter.agent_id.as_ref().is_none_or(|a| a == agent_id)
        && filter.tool_name.as_ref().is_none_or(|n| &record.name == n)
        && filter.state.is_none_or(|s| record.state == s)
        && in_range(
            &record.created_at,
            filter.created_after.as_ref(),
            filter.created_before.as_ref(),
        )
}

pub fn snapshot_matches(filter: &SnapshotFilter, snapshot: &Snapshot) -> bool {
    filter
        .agent_id
        .as_ref()
        .is_none_or(|a| &snapshot.agent_id == a)
        && in_range(
            &snapshot.created_at,
            filter.created_after.as_ref(),
            filter.created_before.as_ref(),
        )
}

/// In-memory counterpart of [`order_by`].
pub fn sort_in_memory<T>(
    items: &mut [T],
    sort: &Sort,
    created_at: impl Fn(&T) -> &str,
    id: impl Fn(&T) -> &str,
) {
    items.sort_by(|a, b| {
        let ord = match sort.key {
            SortKey::CreatedAt => created_at(a)
                .cmp(created_at(b))
                .then_with(|| id(a).cmp(id(b))),
            SortKey::Id => id(a).cmp(id(b)),
        };
        match sort.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    });
}

/// In-memory counterpart of [`Page::sql_clause`].
pub fn paginate<T>(items: Vec<T>, page: &Page) -> Vec<T> {
    match page.limit {
        Some(limit) => items.into_iter().skip(page.offset).take(limit).collect(),
        None => items,
    }
}

pub fn stats_from_records(
    agent_id: &str,
    message_count: u64,
    tool_calls: &[ToolCallRecord],
    snapshot_count: u64,
    event_count: u64,
) -> AgentStats {
    let mut by_name: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_state: BTreeMap<String, u64> = BTreeMap::new();
    for record in tool_calls {
        *by_name.entry(record.name.clone()).or_default() += 1;
        *by_state.entry(record.state.to_string()).or_default() += 1;
    }
    AgentStats {
        agent_id: agent_id.to_string(),
        message_count,
        tool_call_count: tool_calls.len() as u64,
        snapshot_count,
        event_count,
        tool_calls_by_name: by_name,
        tool_calls_by_state: by_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::BreakpointState;
    use crate::model::tool_call::ToolCallState;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("a_b%c\\d"), "a\\_b\\%c\\\\d");
    }

    #[test]
    fn test_where_builder_numbers_placeholders() {
        let filter = ToolCallFilter {
            agent_id: Some("a1".into()),
            tool_name: Some("bash".into()),
            state: Some(ToolCallState::Completed),
            created_after: Some("2025-01-01T00:00:00+00:00".into()),
            created_before: None,
        };
        let w = tool_call_filter_sql(&filter);
        assert_eq!(
            w.clause(),
            "WHERE agent_id = $1 AND name = $2 AND state = $3 AND created_at >= $4"
        );
        assert_eq!(w.params()[2], SqlParam::Text("COMPLETED".into()));
    }

    #[test]
    fn test_agent_prefix_clause() {
        let filter = AgentFilter {
            agent_id_prefix: Some("team_a".into()),
            ..Default::default()
        };
        let w = agent_filter_sql(&filter);
        assert_eq!(w.clause(), "WHERE agent_id LIKE $1 ESCAPE '\\'");
        assert_eq!(w.params()[0], SqlParam::Text("team\\_a%".into()));
        assert!(WhereBuilder::new().clause().is_empty());
    }

    #[test]
    fn test_any_of() {
        let mut w = WhereBuilder::new();
        w.eq("agent_id", "a1").any_of("channel", ["control", "monitor"]);
        assert_eq!(w.clause(), "WHERE agent_id = $1 AND channel IN ($2, $3)");
        let mut empty = WhereBuilder::new();
        empty.any_of::<String>("channel", Vec::new());
        assert_eq!(empty.clause(), "WHERE 1 = 0");
    }

    #[test]
    fn test_agent_matches_running_when_unset() {
        let info = AgentInfo::new("team-1", "tpl");
        let filter = AgentFilter {
            agent_id_prefix: Some("team".into()),
            breakpoint: Some(BreakpointState::Running),
            ..Default::default()
        };
        assert!(agent_matches(&filter, &info));
        let paused = AgentFilter {
            breakpoint: Some(BreakpointState::Paused),
            ..Default::default()
        };
        assert!(!agent_matches(&paused, &info));
    }

    #[test]
    fn test_paginate_ignores_offset_without_limit() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(
            paginate(items.clone(), &Page { limit: None, offset: 5 }).len(),
            10
        );
        assert_eq!(paginate(items, &Page::new(3, 8)), vec![8, 9]);
    }

    #[test]
    fn test_sort_in_memory_desc_with_tiebreak() {
        let mut rows = vec![("t1", "b"), ("t2", "a"), ("t1", "a")];
        sort_in_memory(&mut rows, &Sort::default(), |r| r.0, |r| r.1);
        assert_eq!(rows, vec![("t2", "a"), ("t1", "b"), ("t1", "a")]);
    }

    #[test]
    fn test_stats_groups_by_name_and_state() {
        let mut done = ToolCallRecord::new("c1", "bash", serde_json::json!({}));
        done.transition(ToolCallState::Running, None).unwrap();
        done.transition(ToolCallState::Completed, None).unwrap();
        let pending = ToolCallRecord::new("c2", "bash", serde_json::json!({}));
        let read = ToolCallRecord::new("c3", "read_file", serde_json::json!({}));
        let stats = stats_from_records("a1", 4, &[done, pending, read], 1, 9);
        assert_eq!(stats.tool_call_count, 3);
        assert_eq!(stats.tool_calls_by_name["bash"], 2);
        assert_eq!(stats.tool_calls_by_state["PENDING"], 2);
        assert_eq!(stats.tool_calls_by_state["COMPLETED"], 1);
        assert_eq!(stats.event_count, 9);
    }
}
