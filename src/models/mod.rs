//! Data models for Beehive entities.
//!
//! This module defines the core data structures:
//! - `Task` - Work items with status, priority, dependencies
//! - `Message` - Structured inter-bee messages
//! - `AgentState` - Per-bee liveness and workload tracking
//! - `Assignment` - Task assignment records
//! - `ActivityEntry` / `InjectionLogEntry` - Append-only audit rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Names addressable on the message bus.
///
/// `Queen`, `Developer`, `Qa` and `Analyst` are real bees with a pane of
/// their own. `System` and `Beekeeper` are synthetic senders without a
/// pane, and `All` is the broadcast target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeeName {
    Queen,
    Developer,
    Qa,
    Analyst,
    System,
    Beekeeper,
    All,
}

impl BeeName {
    /// The real bees, in pane order.
    pub const REAL: [BeeName; 4] = [
        BeeName::Queen,
        BeeName::Developer,
        BeeName::Qa,
        BeeName::Analyst,
    ];

    /// The worker bees (everything the queen can delegate to).
    pub const WORKERS: [BeeName; 3] = [BeeName::Developer, BeeName::Qa, BeeName::Analyst];

    /// Whether this name denotes a real bee with a pane.
    pub fn is_real(&self) -> bool {
        matches!(
            self,
            BeeName::Queen | BeeName::Developer | BeeName::Qa | BeeName::Analyst
        )
    }

    /// Whether this name may appear in `tasks.assigned_to`.
    pub fn can_be_assignee(&self) -> bool {
        self.is_real()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BeeName::Queen => "queen",
            BeeName::Developer => "developer",
            BeeName::Qa => "qa",
            BeeName::Analyst => "analyst",
            BeeName::System => "system",
            BeeName::Beekeeper => "beekeeper",
            BeeName::All => "all",
        }
    }

    /// Strict closed-set parse.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "queen" => Ok(BeeName::Queen),
            "developer" => Ok(BeeName::Developer),
            "qa" => Ok(BeeName::Qa),
            "analyst" => Ok(BeeName::Analyst),
            "system" => Ok(BeeName::System),
            "beekeeper" => Ok(BeeName::Beekeeper),
            "all" => Ok(BeeName::All),
            other => Err(Error::InvalidName(other.to_string())),
        }
    }
}

impl std::fmt::Display for BeeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BeeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BeeName::parse(s)
    }
}

/// Task status in the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown task status: {other}"))),
        }
    }

    /// Whether this status ends the task's lifecycle.
    ///
    /// `failed` is terminal for timestamps (`completed_at` is set) but
    /// still allows the `failed -> pending` retry path.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The transition table.
    ///
    /// Self-transitions are rejected separately as no-ops; the
    /// `pending -> in_progress` edge is additionally gated on blocking
    /// dependencies by the caller.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Pending, InProgress) | (Pending, Failed) | (Pending, Cancelled) => true,
            (InProgress, Pending)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled) => true,
            (Failed, Pending) | (Failed, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task priority level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(Error::InvalidInput(format!(
                "unknown task priority: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message priority level. Orders delivery within a recipient's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(MessagePriority::Low),
            "normal" => Ok(MessagePriority::Normal),
            "high" => Ok(MessagePriority::High),
            "urgent" => Ok(MessagePriority::Urgent),
            other => Err(Error::InvalidInput(format!(
                "unknown message priority: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message type. The built-in set is closed; deployments may accept
/// additional types by listing them in `extra_message_types` config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Info,
    Question,
    Request,
    Response,
    Alert,
    TaskUpdate,
    Instruction,
    Conversation,
    RoleInjection,
    Notification,
    Heartbeat,
    /// A deployment-specific type outside the built-in set.
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Info => "info",
            MessageType::Question => "question",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Alert => "alert",
            MessageType::TaskUpdate => "task_update",
            MessageType::Instruction => "instruction",
            MessageType::Conversation => "conversation",
            MessageType::RoleInjection => "role_injection",
            MessageType::Notification => "notification",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Custom(s) => s,
        }
    }

    /// Whether this is one of the built-in types.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, MessageType::Custom(_))
    }

    /// Parse any string; unknown names become `Custom`.
    pub fn parse(s: &str) -> Self {
        match s {
            "info" => MessageType::Info,
            "question" => MessageType::Question,
            "request" => MessageType::Request,
            "response" => MessageType::Response,
            "alert" => MessageType::Alert,
            "task_update" => MessageType::TaskUpdate,
            "instruction" => MessageType::Instruction,
            "conversation" => MessageType::Conversation,
            "role_injection" => MessageType::RoleInjection,
            "notification" => MessageType::Notification,
            "heartbeat" => MessageType::Heartbeat,
            other => MessageType::Custom(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        MessageType::parse(&s)
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Agent (bee) status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Waiting,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "waiting" => Ok(AgentStatus::Waiting),
            "offline" => Ok(AgentStatus::Offline),
            "error" => Ok(AgentStatus::Error),
            other => Err(Error::InvalidInput(format!("unknown agent status: {other}"))),
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dependency relationship between two tasks.
///
/// Only `blocks` gates the `pending -> in_progress` transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    #[default]
    Blocks,
    Related,
    Subtask,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::Related => "related",
            DependencyType::Subtask => "subtask",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blocks" => Ok(DependencyType::Blocks),
            "related" => Ok(DependencyType::Related),
            "subtask" => Ok(DependencyType::Subtask),
            other => Err(Error::InvalidInput(format!(
                "unknown dependency type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a bee plays on an assignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentRole {
    #[default]
    Primary,
    Reviewer,
    Collaborator,
}

impl AssignmentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentRole::Primary => "primary",
            AssignmentRole::Reviewer => "reviewer",
            AssignmentRole::Collaborator => "collaborator",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(AssignmentRole::Primary),
            "reviewer" => Ok(AssignmentRole::Reviewer),
            "collaborator" => Ok(AssignmentRole::Collaborator),
            other => Err(Error::InvalidInput(format!(
                "unknown assignment role: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for AssignmentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A work item tracked by the hive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUID v4 string)
    pub task_id: String,

    /// Task title
    pub title: String,

    /// Detailed description
    pub description: String,

    /// Current status
    pub status: TaskStatus,

    /// Priority level
    pub priority: TaskPriority,

    /// Assigned bee, if any (always a real bee)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<BeeName>,

    /// Who created the task
    pub created_by: BeeName,

    /// Parent task ID for hierarchical organization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Opaque structured metadata; never interpreted by the core
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Set when the task first enters `in_progress`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set when the task reaches a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with a fresh UUID.
    pub fn new(title: impl Into<String>, description: impl Into<String>, created_by: BeeName) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::default(),
            priority: TaskPriority::default(),
            assigned_to: None,
            created_by,
            parent_task_id: None,
            metadata: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Filter for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub assigned_to: Option<BeeName>,
    pub parent_task_id: Option<String>,
}

/// A structured inter-bee message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonically assigned identifier
    pub message_id: i64,

    /// Sender
    pub from_bee: BeeName,

    /// Receiver (never `all` in the store; broadcasts are expanded)
    pub to_bee: BeeName,

    /// Message type
    pub message_type: MessageType,

    /// Optional subject line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Message body (non-empty)
    pub content: String,

    /// Related task, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Delivery priority
    pub priority: MessagePriority,

    /// Whether the receiver has acknowledged the message
    pub processed: bool,

    /// When the message was acknowledged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    /// True iff the message was produced through the sanctioned sender
    /// CLI path; false marks a protocol violation candidate
    pub sender_cli_used: bool,

    /// Groups the per-recipient copies of one broadcast
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    /// Message this replies to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Expiry; expired messages are never delivered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Whether the message has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e < now).unwrap_or(false)
    }
}

/// Parameters for enqueueing a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_bee: BeeName,
    pub to_bee: BeeName,
    pub message_type: MessageType,
    pub subject: Option<String>,
    pub content: String,
    pub task_id: Option<String>,
    pub priority: MessagePriority,
    pub sender_cli_used: bool,
    pub conversation_id: Option<String>,
    pub reply_to: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    /// A plain message with defaults for the optional fields.
    pub fn new(
        from_bee: BeeName,
        to_bee: BeeName,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from_bee,
            to_bee,
            message_type,
            subject: None,
            content: content.into(),
            task_id: None,
            priority: MessagePriority::Normal,
            sender_cli_used: true,
            conversation_id: None,
            reply_to: None,
            expires_at: None,
        }
    }
}

/// Per-bee agent state row. One row per real bee, created at init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub bee_name: BeeName,
    pub status: AgentStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,

    /// Advisory load indicator, 0-100
    pub workload_score: f64,

    /// Advisory quality indicator, 0-100
    pub performance_score: f64,

    /// Capability tags used by auto-assignment
    pub capabilities: Vec<String>,

    /// Updated on any inbound/outbound traffic
    pub last_activity: DateTime<Utc>,

    /// Updated on explicit heartbeats
    pub last_heartbeat: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Partial update for an agent state row. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct AgentStatePatch {
    pub status: Option<AgentStatus>,
    /// `Some(None)` clears the current task
    pub current_task_id: Option<Option<String>>,
    pub workload_score: Option<f64>,
    pub performance_score: Option<f64>,
    pub capabilities: Option<Vec<String>>,
}

/// Auxiliary record of a task assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: i64,
    pub task_id: String,
    pub assigned_to: BeeName,
    pub assigned_by: BeeName,
    pub role: AssignmentRole,
    /// `active`, `reassigned` or `completed`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only audit row describing a change to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub activity_id: i64,
    pub task_id: String,
    pub bee_name: BeeName,
    /// e.g. `created`, `status_change`, `assignment_change`
    pub activity_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row for one injector call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionLogEntry {
    pub injection_id: i64,
    pub session_name: String,
    pub target_pane: String,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub dry_run: bool,
    /// `delivered`, `dry_run`, `pane_not_found`, `session_not_found`,
    /// `transport_error` or `cancelled`
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}
