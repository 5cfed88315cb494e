use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "port:opened")]
    PortOpened,
    #[serde(rename = "port:closed")]
    PortClosed,
    #[serde(rename = "port:mapped")]
    PortMapped,
    #[serde(rename = "git:dirty")]
    GitDirty,
    #[serde(rename = "git:clean")]
    GitClean,
    #[serde(rename = "process:started")]
    ProcessStarted,
    #[serde(rename = "process:stopped")]
    ProcessStopped,
    #[serde(rename = "container:status")]
    ContainerStatus,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "notification:show")]
    NotificationShow,
    #[serde(rename = "worktree:updated")]
    WorktreeUpdated,
    #[serde(rename = "worktree:batch_updated")]
    WorktreeBatchUpdated,
    #[serde(rename = "worktree:created")]
    WorktreeCreated,
    #[serde(rename = "orchestration:phase")]
    OrchestrationPhase,
    #[serde(rename = "orchestration:output")]
    OrchestrationOutput,
    #[serde(rename = "cache:invalidated")]
    CacheInvalidated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PortOpened => "port:opened",
            EventType::PortClosed => "port:closed",
            EventType::PortMapped => "port:mapped",
            EventType::GitDirty => "git:dirty",
            EventType::GitClean => "git:clean",
            EventType::ProcessStarted => "process:started",
            EventType::ProcessStopped => "process:stopped",
            EventType::ContainerStatus => "container:status",
            EventType::Heartbeat => "heartbeat",
            EventType::NotificationShow => "notification:show",
            EventType::WorktreeUpdated => "worktree:updated",
            EventType::WorktreeBatchUpdated => "worktree:batch_updated",
            EventType::WorktreeCreated => "worktree:created",
            EventType::OrchestrationPhase => "orchestration:phase",
            EventType::OrchestrationOutput => "orchestration:output",
            EventType::CacheInvalidated => "cache:invalidated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A domain event: discriminator plus free-form JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AppEvent {
    /// Build an event from any serializable payload. Payload types in this
    /// module always serialize; anything else degrades to `null`.
    pub fn new<P: Serialize>(event_type: EventType, payload: &P) -> Self {
        Self {
            event_type,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn container_status(status: impl Into<String>, message: Option<String>) -> Self {
        Self::new(
            EventType::ContainerStatus,
            &ContainerStatusPayload {
                status: status.into(),
                message,
            },
        )
    }

    pub fn heartbeat(timestamp: i64, uptime: i64) -> Self {
        Self::new(EventType::Heartbeat, &HeartbeatPayload { timestamp, uptime })
    }

    pub fn git_dirty(workspace: impl Into<String>, files: Vec<String>) -> Self {
        Self::new(
            EventType::GitDirty,
            &GitPayload {
                workspace: workspace.into(),
                files,
            },
        )
    }

    pub fn cache_invalidated(worktree_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            EventType::CacheInvalidated,
            &CacheInvalidatedPayload {
                worktree_id: worktree_id.into(),
                reason: reason.into(),
            },
        )
    }

    pub fn phase(phase: impl Into<String>, status_text: impl Into<String>) -> Self {
        Self::new(
            EventType::OrchestrationPhase,
            &PhasePayload {
                phase: phase.into(),
                status_text: status_text.into(),
            },
        )
    }

    pub fn output(line: impl Into<String>) -> Self {
        Self::new(
            EventType::OrchestrationOutput,
            &OutputPayload { line: line.into() },
        )
    }

    pub fn notification(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(
            EventType::NotificationShow,
            &NotificationPayload {
                title: title.into(),
                body: body.into(),
                subtitle: None,
                url: None,
            },
        )
    }
}

/// One frame on the wire: `data: {"id":..,"timestamp":..,"event":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseMessage {
    pub id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub event: AppEvent,
}

impl SseMessage {
    pub fn new(event: AppEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }

    pub fn to_json(&self) -> String {
        // every field is a string, integer or JSON value
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// First frame on every stream. Not a domain event; clients drop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub payload: ConnectionPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPayload {
    pub client_id: String,
}

pub const CONNECTION_FRAME_TYPE: &str = "connection";

impl ConnectionFrame {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            frame_type: CONNECTION_FRAME_TYPE.to_string(),
            payload: ConnectionPayload {
                client_id: client_id.to_string(),
            },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPayload {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitPayload {
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPayload {
    pub pid: u32,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStoppedPayload {
    pub pid: u32,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatusPayload {
    /// `"running"`, `"stopped"` or `"error"`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: i64,
    pub uptime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasePayload {
    pub phase: String,
    pub status_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInvalidatedPayload {
    pub worktree_id: String,
    pub reason: String,
}
