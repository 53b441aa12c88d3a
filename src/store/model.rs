//! Shared types for the event store interface

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution lifecycle status (spec.md §3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Continued,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Continued => "continued",
        };
        write!(f, "{s}")
    }
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Continued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Continued => "continued",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "continued" => Self::Continued,
            _ => return None,
        })
    }
}

/// Advisory projection of execution metadata, used to bound reconstruction
/// cost (spec.md §3 "Snapshot"). The event log remains authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_hash: String,
    pub inputs_hash: String,
    pub status: ExecutionStatus,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub last_event_seq: i64,
    pub workflow_data: Vec<u8>,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub error: Option<String>,
    /// Predecessor execution id, set when this execution was minted by a
    /// continue-as-new handoff rather than `create` (spec.md §4.I).
    pub continued_from: Option<Uuid>,
}

/// Filter for [`crate::store::EventStore::list_executions`]
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub workflow_name: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl ExecutionFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            workflow_name: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Summary row returned by `list_executions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
