use serde::{Deserialize, Serialize};

/// One entry of an agent's append-only timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub agent_id: String,
    /// Per-agent sequence number, strictly increasing from 1.
    pub seq: i64,
    pub channel: Channel,
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

impl TimelineEvent {
    pub fn bookmark(&self) -> Bookmark {
        Bookmark {
            seq: self.seq,
            timestamp: self.timestamp.clone(),
        }
    }
}

/// An event as submitted by a producer, before the store assigns its
/// sequence number and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub channel: Channel,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(channel: Channel, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel,
            kind: kind.into(),
            payload,
        }
    }
}

/// Cursor into an agent's timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bookmark {
    pub seq: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Streamed text and tool deltas. High volume, not needed for resume.
    Progress,
    /// Approval and lifecycle signals. Never dropped.
    Control,
    /// Low-frequency operational signals.
    Monitor,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Progress, Channel::Control, Channel::Monitor];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Progress => write!(f, "progress"),
            Channel::Control => write!(f, "control"),
            Channel::Monitor => write!(f, "monitor"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Channel::Progress),
            "control" => Ok(Channel::Control),
            "monitor" => Ok(Channel::Monitor),
            _ => Err(crate::error::Error::Validation(format!(
                "invalid channel: {s}"
            ))),
        }
    }
}

/// Selection for one page of timeline reads.
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// Deliver only events with `seq` strictly greater than this bookmark's.
    pub since: Option<Bookmark>,
    /// `None` means every channel.
    pub channels: Option<Vec<Channel>>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            since: None,
            channels: None,
            limit: 500,
        }
    }
}

impl EventQuery {
    pub fn since_seq(&self) -> i64 {
        self.since.as_ref().map(|b| b.seq).unwrap_or(0)
    }

    pub fn matches(&self, event: &TimelineEvent) -> bool {
        event.seq > self.since_seq()
            && self
                .channels
                .as_ref()
                .is_none_or(|chs| chs.contains(&event.channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_display_fromstr() {
        for ch in Channel::ALL {
            assert_eq!(ch.to_string().parse::<Channel>().unwrap(), ch);
        }
        assert!("audit".parse::<Channel>().is_err());
    }

    #[test]
    fn test_event_query_matches() {
        let event = TimelineEvent {
            agent_id: "a1".into(),
            seq: 5,
            channel: Channel::Control,
            kind: "approval_required".into(),
            payload: serde_json::json!({}),
            timestamp: "2025-01-01T00:00:00Z".into(),
        };
        let mut query = EventQuery::default();
        assert!(query.matches(&event));
        query.since = Some(event.bookmark());
        assert!(!query.matches(&event));
        query.since = None;
        query.channels = Some(vec![Channel::Progress]);
        assert!(!query.matches(&event));
    }
}
