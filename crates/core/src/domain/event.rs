// Lifecycle events published on the queue's capped stream

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Waiting,
    Active,
    Stalled,
    Progress,
    Log,
    Completed,
    Failed,
    Delayed,
    Removed,
    Cleaned,
    Drained,
    Duplicated,
    Paused,
    Resumed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Added => "added",
            EventKind::Waiting => "waiting",
            EventKind::Active => "active",
            EventKind::Stalled => "stalled",
            EventKind::Progress => "progress",
            EventKind::Log => "log",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Delayed => "delayed",
            EventKind::Removed => "removed",
            EventKind::Cleaned => "cleaned",
            EventKind::Drained => "drained",
            EventKind::Duplicated => "duplicated",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(EventKind::Added),
            "waiting" => Ok(EventKind::Waiting),
            "active" => Ok(EventKind::Active),
            "stalled" => Ok(EventKind::Stalled),
            "progress" => Ok(EventKind::Progress),
            "log" => Ok(EventKind::Log),
            "completed" => Ok(EventKind::Completed),
            "failed" => Ok(EventKind::Failed),
            "delayed" => Ok(EventKind::Delayed),
            "removed" => Ok(EventKind::Removed),
            "cleaned" => Ok(EventKind::Cleaned),
            "drained" => Ok(EventKind::Drained),
            "duplicated" => Ok(EventKind::Duplicated),
            "paused" => Ok(EventKind::Paused),
            "resumed" => Ok(EventKind::Resumed),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// One entry of the `events` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEvent {
    /// Stream entry id, used as the consumer cursor
    pub id: String,
    pub kind: EventKind,
    pub job_id: Option<String>,
    /// State the job left, when the event is a transition
    pub prev: Option<String>,
    /// Remaining event payload fields
    pub fields: HashMap<String, String>,
}

impl QueueEvent {
    /// Build from raw stream fields; `event` selects the kind.
    pub fn from_stream_entry(
        id: impl Into<String>,
        mut fields: HashMap<String, String>,
    ) -> Option<Self> {
        let kind: EventKind = fields.remove("event")?.parse().ok()?;
        let job_id = fields.remove("jobId");
        let prev = fields.remove("prev");
        Some(Self {
            id: id.into(),
            kind,
            job_id,
            prev,
            fields,
        })
    }
}
