//! Command implementations for the hive CLI.
//!
//! Each command returns a typed result implementing [`Output`] with a
//! JSON rendering (the default) and a human rendering (`--human`).
//! Commands that only read state open the store directly; commands that
//! talk to bees are built over the bus/injector with the real tmux
//! multiplexer (or the recording fake in tests).

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::bus::{Delivery, MessageBus, Outbound};
use crate::config::HiveConfig;
use crate::engine::{AssignOptions, NewTask, TaskEngine, TaskProgress, ProgressSummary};
use crate::injector::{Injector, SendOptions};
use crate::models::{
    AgentState, AgentStatus, AssignmentRole, BeeName, DependencyType, MessagePriority,
    MessageType, Task, TaskFilter, TaskPriority, TaskStatus,
};
use crate::store::{MessageStats, Store};
use crate::supervisor::pid_file::{send_signal, DaemonPidFile, DaemonPidInfo, Signal};
use crate::supervisor::{InitReport, Supervisor};
use crate::tmux::Multiplexer;
use crate::{CancelToken, Error, Result};

/// Output format trait for commands.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;
    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

// === Component wiring ===

fn open_store(config: &HiveConfig) -> Result<Store> {
    Store::open_with_timeout(
        &config.database_path(),
        Duration::from_secs(config.db_timeout_secs),
    )
}

fn open_bus(config: &HiveConfig, mux: Arc<dyn Multiplexer>) -> Result<MessageBus> {
    let injector = Injector::new(open_store(config)?, mux, config);
    Ok(MessageBus::new(open_store(config)?, injector, config))
}

fn open_engine(config: &HiveConfig, mux: Arc<dyn Multiplexer>) -> Result<TaskEngine> {
    let bus = open_bus(config, mux)?;
    Ok(TaskEngine::new(open_store(config)?, bus))
}

fn require_session(config: &HiveConfig, mux: &Arc<dyn Multiplexer>) -> Result<()> {
    if !mux.has_session(&config.session_name)? {
        return Err(Error::SessionNotRunning(config.session_name.clone()));
    }
    Ok(())
}

// === init ===

impl Output for InitReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Hive initialized: session '{}' with {} bees ({})",
            self.session,
            self.bees_started.len(),
            self.bees_started
                .iter()
                .map(|b| b.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// Initialize the store, create the session, spawn and role-inject the
/// bees.
pub fn init(config: &HiveConfig, mux: Arc<dyn Multiplexer>, force: bool) -> Result<InitReport> {
    Store::init(&config.database_path())?;
    let mut supervisor = Supervisor::new(config, mux)?;
    supervisor.init(force)
}

// === inject-roles ===

#[derive(Serialize)]
pub struct RolesInjected {
    pub injected: usize,
}

impl Output for RolesInjected {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Injected {} role document(s)", self.injected)
    }
}

/// Re-inject role prompts into running bees.
pub fn inject_roles(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    bee: Option<BeeName>,
) -> Result<RolesInjected> {
    require_session(config, &mux)?;
    let mut supervisor = Supervisor::new(config, mux)?;
    Ok(RolesInjected {
        injected: supervisor.inject_roles(bee)?,
    })
}

// === start-task ===

#[derive(Debug, Serialize)]
pub struct TaskStarted {
    pub task_id: String,
    pub title: String,
}

impl Output for TaskStarted {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Task {} handed to the queen: \"{}\"", self.task_id, self.title)
    }
}

/// Create a task assigned to the queen and deliver the instruction to
/// her pane. The first line of the text becomes the title.
pub fn start_task(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    text: &str,
) -> Result<TaskStarted> {
    if text.trim().is_empty() {
        return Err(Error::InvalidInput("task text must not be empty".into()));
    }
    require_session(config, &mux)?;

    let title: String = text.lines().next().unwrap_or(text).chars().take(80).collect();

    let mut engine = open_engine(config, mux.clone())?;
    let mut spec = NewTask::new(title.clone(), text, BeeName::Beekeeper);
    spec.assignee = Some(BeeName::Queen);
    let task = engine.create_task(spec)?;

    let mut bus = open_bus(config, mux)?;
    bus.send(
        &Outbound::new(
            BeeName::Beekeeper,
            BeeName::Queen,
            MessageType::Instruction,
            text,
        )
        .subject("Beekeeper instruction")
        .task(task.task_id.clone()),
    )?;

    Ok(TaskStarted {
        task_id: task.task_id,
        title,
    })
}

// === task create / list / details / assign / status / stats ===

#[derive(Serialize)]
pub struct TaskCreated {
    pub task_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<BeeName>,
}

impl Output for TaskCreated {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match self.assigned_to {
            Some(bee) => format!("Created task {} \"{}\" -> {bee}", self.task_id, self.title),
            None => format!("Created task {} \"{}\"", self.task_id, self.title),
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn task_create(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    title: &str,
    description: &str,
    priority: &str,
    assignee: Option<&str>,
    parent: Option<&str>,
    depends_on: &[String],
    created_by: &str,
) -> Result<TaskCreated> {
    let mut spec = NewTask::new(title, description, BeeName::parse(created_by)?);
    spec.priority = TaskPriority::parse(priority)?;
    spec.assignee = assignee.map(BeeName::parse).transpose()?;
    spec.parent = parent.map(|s| s.to_string());
    spec.dependencies = depends_on
        .iter()
        .map(|id| (id.clone(), DependencyType::Blocks))
        .collect();

    let mut engine = open_engine(config, mux)?;
    let task = engine.create_task(spec)?;
    Ok(TaskCreated {
        task_id: task.task_id,
        title: task.title,
        assigned_to: task.assigned_to,
    })
}

#[derive(Serialize)]
pub struct TaskList {
    pub tasks: Vec<Task>,
    pub count: usize,
}

impl Output for TaskList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks found.".to_string();
        }
        let mut lines = vec![format!("{} task(s):", self.count)];
        for task in &self.tasks {
            let status_char = match task.status {
                TaskStatus::Pending => " ",
                TaskStatus::InProgress => ">",
                TaskStatus::Completed => "x",
                TaskStatus::Failed => "!",
                TaskStatus::Cancelled => "-",
            };
            let assignee = task
                .assigned_to
                .map(|b| format!(" @{b}"))
                .unwrap_or_default();
            lines.push(format!(
                "[{}] {} {} {}{}",
                status_char, task.task_id, task.priority, task.title, assignee
            ));
        }
        lines.join("\n")
    }
}

pub fn task_list(
    config: &HiveConfig,
    status: Option<&str>,
    assignee: Option<&str>,
    priority: Option<&str>,
) -> Result<TaskList> {
    let store = open_store(config)?;
    let filter = TaskFilter {
        status: status.map(TaskStatus::parse).transpose()?,
        assigned_to: assignee.map(BeeName::parse).transpose()?,
        priority: priority.map(TaskPriority::parse).transpose()?,
        parent_task_id: None,
    };
    let tasks = store.list_tasks(&filter)?;
    Ok(TaskList {
        count: tasks.len(),
        tasks,
    })
}

impl Output for TaskProgress {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("{} {}", self.task.task_id, self.task.title));
        lines.push(format!(
            "  Status: {}  Priority: {}",
            self.task.status, self.task.priority
        ));
        if let Some(bee) = self.task.assigned_to {
            lines.push(format!("  Assignee: {bee}"));
        }
        lines.push(format!("  Description: {}", self.task.description));
        if !self.blockers.is_empty() {
            lines.push(format!("  Blocked by: {}", self.blockers.join(", ")));
        }
        if !self.assignments.is_empty() {
            lines.push("  Assignments:".to_string());
            for a in &self.assignments {
                lines.push(format!(
                    "    {} ({}, {}) by {}",
                    a.assigned_to, a.role, a.status, a.assigned_by
                ));
            }
        }
        if !self.recent_activity.is_empty() {
            lines.push("  Recent activity:".to_string());
            for entry in &self.recent_activity {
                lines.push(format!(
                    "    {} [{}] {}",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.bee_name,
                    entry.description
                ));
            }
        }
        lines.join("\n")
    }
}

pub fn task_details(config: &HiveConfig, id: &str) -> Result<TaskProgress> {
    let store = open_store(config)?;
    Ok(TaskProgress {
        task: store.get_task(id)?,
        assignments: store.assignments_for(id)?,
        blockers: store.blocking_dependencies(id)?,
        recent_activity: store.recent_activity(Some(id), 10)?,
    })
}

#[derive(Serialize)]
pub struct TaskAssigned {
    pub task_id: String,
    pub assignee: BeeName,
    pub auto: bool,
}

impl Output for TaskAssigned {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.auto {
            format!("Task {} auto-assigned to {}", self.task_id, self.assignee)
        } else {
            format!("Task {} assigned to {}", self.task_id, self.assignee)
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn task_assign(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    id: &str,
    assignee: Option<&str>,
    auto: bool,
    assigner: &str,
    role: &str,
    note: Option<&str>,
) -> Result<TaskAssigned> {
    let assigner = BeeName::parse(assigner)?;
    let mut engine = open_engine(config, mux)?;

    if auto {
        let chosen = engine.assign_auto(id, assigner, config.max_tasks_per_bee)?;
        return Ok(TaskAssigned {
            task_id: id.to_string(),
            assignee: chosen,
            auto: true,
        });
    }

    let assignee = BeeName::parse(
        assignee.ok_or_else(|| Error::InvalidInput("assignee required without --auto".into()))?,
    )?;
    engine.assign(
        id,
        assignee,
        &AssignOptions {
            assigner,
            role: AssignmentRole::parse(role)?,
            note: note.map(|s| s.to_string()),
        },
    )?;
    Ok(TaskAssigned {
        task_id: id.to_string(),
        assignee,
        auto: false,
    })
}

#[derive(Serialize)]
pub struct TaskTransitioned {
    pub task_id: String,
    pub status: TaskStatus,
    /// IDs cancelled by the cascade (cancellations only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cascade: Vec<String>,
}

impl Output for TaskTransitioned {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.cascade.len() > 1 {
            format!(
                "Task {} cancelled together with {} descendant(s)",
                self.task_id,
                self.cascade.len() - 1
            )
        } else {
            format!("Task {} is now {}", self.task_id, self.status)
        }
    }
}

pub fn task_status(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    id: &str,
    status: &str,
    actor: &str,
    note: Option<&str>,
) -> Result<TaskTransitioned> {
    let status = TaskStatus::parse(status)?;
    let actor = BeeName::parse(actor)?;
    let mut engine = open_engine(config, mux)?;

    // Cancellation cascades to descendant subtasks.
    if status == TaskStatus::Cancelled {
        let cascade = engine.cancel(id, actor, note.unwrap_or("cancelled"))?;
        return Ok(TaskTransitioned {
            task_id: id.to_string(),
            status,
            cascade,
        });
    }

    let task = engine.transition(id, status, actor, note)?;
    Ok(TaskTransitioned {
        task_id: task.task_id,
        status: task.status,
        cascade: Vec::new(),
    })
}

#[derive(Serialize)]
pub struct HiveStats {
    pub tasks: ProgressSummary,
    pub messages: MessageStats,
}

impl Output for HiveStats {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("{} task(s) total", self.tasks.total)];
        for (status, count) in &self.tasks.by_status {
            lines.push(format!("  {status}: {count}"));
        }
        lines.push(format!(
            "{} message(s), {:.1}% through the sender CLI",
            self.messages.total, self.messages.sender_cli_usage_rate
        ));
        lines.join("\n")
    }
}

pub fn task_stats(config: &HiveConfig) -> Result<HiveStats> {
    let store = open_store(config)?;
    let by_status = store
        .status_counts()?
        .into_iter()
        .map(|(s, n)| (s.as_str().to_string(), n))
        .collect::<std::collections::BTreeMap<_, _>>();
    let by_assignee = store
        .assignee_counts()?
        .into_iter()
        .map(|(bee, n)| {
            (
                bee.map(|b| b.as_str().to_string())
                    .unwrap_or_else(|| "unassigned".to_string()),
                n,
            )
        })
        .collect::<std::collections::BTreeMap<_, _>>();
    Ok(HiveStats {
        tasks: ProgressSummary {
            total: by_status.values().sum(),
            by_status,
            by_assignee,
        },
        messages: store.message_stats()?,
    })
}

// === send / task message ===

#[derive(Debug, Serialize)]
pub struct MessageSent {
    pub message_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub failed: Vec<(BeeName, String)>,
    pub dry_run: bool,
}

impl Output for MessageSent {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.dry_run {
            return "Dry run: payload logged, nothing delivered".to_string();
        }
        let mut line = format!("Sent message(s): {:?}", self.message_ids);
        if !self.failed.is_empty() {
            let failures: Vec<String> = self
                .failed
                .iter()
                .map(|(bee, outcome)| format!("{bee}: {outcome}"))
                .collect();
            line.push_str(&format!("  (failed: {})", failures.join(", ")));
        }
        line
    }
}

/// Arguments for the sender CLI.
pub struct SendArgs<'a> {
    pub to: &'a str,
    pub content: &'a str,
    pub from: &'a str,
    pub message_type: &'a str,
    pub subject: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub priority: &'a str,
    pub reply_to: Option<i64>,
    pub dry_run: bool,
}

/// Send a structured message through the sanctioned path.
pub fn send_message(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    args: &SendArgs<'_>,
) -> Result<MessageSent> {
    let from = BeeName::parse(args.from)?;
    let to = BeeName::parse(args.to)?;

    let mut out = Outbound::new(
        from,
        to,
        MessageType::parse(args.message_type),
        args.content,
    );
    out.subject = args.subject.map(|s| s.to_string());
    out.task_id = args.task_id.map(|s| s.to_string());
    out.priority = MessagePriority::parse(args.priority)?;
    out.reply_to = args.reply_to;

    if args.dry_run {
        if to == BeeName::All {
            return Err(Error::InvalidInput(
                "--dry-run does not support broadcast".into(),
            ));
        }
        let payload = crate::bus::compose_wire_payload(&out);
        let mut injector = Injector::new(open_store(config)?, mux, config);
        injector.send(
            to,
            &payload,
            &SendOptions {
                message_type: Some(out.message_type.as_str().to_string()),
                sender: Some(from.as_str().to_string()),
                metadata: None,
                dry_run: true,
            },
        )?;
        return Ok(MessageSent {
            message_ids: Vec::new(),
            conversation_id: None,
            failed: Vec::new(),
            dry_run: true,
        });
    }

    let mut bus = open_bus(config, mux)?;
    let Delivery {
        message_ids,
        conversation_id,
        failed,
    } = bus.send(&out)?;
    Ok(MessageSent {
        message_ids,
        conversation_id,
        failed,
        dry_run: false,
    })
}

// === heartbeat ===

#[derive(Serialize)]
pub struct HeartbeatRecorded {
    pub bee: BeeName,
    pub status: AgentStatus,
}

impl Output for HeartbeatRecorded {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Heartbeat recorded for {} (status: {})", self.bee, self.status)
    }
}

pub fn heartbeat(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    bee: &str,
) -> Result<HeartbeatRecorded> {
    let bee = BeeName::parse(bee)?;
    let mut supervisor = Supervisor::new(config, mux)?;
    let status = supervisor.heartbeat(bee)?;
    Ok(HeartbeatRecorded { bee, status })
}

// === status ===

#[derive(Serialize)]
pub struct HiveStatus {
    pub session: String,
    pub session_running: bool,
    pub daemon_running: bool,
    pub agents: Vec<AgentState>,
    pub tasks: std::collections::BTreeMap<String, i64>,
}

impl Output for HiveStatus {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "Session '{}': {}   Daemon: {}",
            self.session,
            if self.session_running { "running" } else { "not running" },
            if self.daemon_running { "running" } else { "not running" },
        ));
        lines.push("Bees:".to_string());
        let now = Utc::now();
        for agent in &self.agents {
            let silent = (now - agent.last_heartbeat).num_seconds().max(0);
            let task = agent
                .current_task_id
                .as_deref()
                .map(|id| format!("  task {id}"))
                .unwrap_or_default();
            lines.push(format!(
                "  {:<10} {:<8} heartbeat {silent}s ago{task}",
                agent.bee_name.as_str(),
                agent.status.as_str(),
            ));
        }
        lines.push("Tasks:".to_string());
        for (status, count) in &self.tasks {
            lines.push(format!("  {status}: {count}"));
        }
        lines.join("\n")
    }
}

pub fn status(config: &HiveConfig, mux: Arc<dyn Multiplexer>) -> Result<HiveStatus> {
    let store = open_store(config)?;
    let session_running = mux.has_session(&config.session_name).unwrap_or(false);
    let daemon_running = DaemonPidFile::new(config.pid_file_path())
        .check_running()
        .ok()
        .flatten()
        .map(|(alive, _)| alive)
        .unwrap_or(false);
    let tasks = store
        .status_counts()?
        .into_iter()
        .map(|(s, n)| (s.as_str().to_string(), n))
        .collect();
    Ok(HiveStatus {
        session: config.session_name.clone(),
        session_running,
        daemon_running,
        agents: store.list_states()?,
        tasks,
    })
}

// === logs ===

#[derive(Serialize)]
pub struct PaneLogs {
    pub bee: BeeName,
    pub pane: String,
    pub output: String,
}

impl Output for PaneLogs {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("--- {} ({}) ---\n{}", self.bee, self.pane, self.output)
    }
}

pub fn logs(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    bee: Option<&str>,
    lines: u32,
) -> Result<PaneLogs> {
    let bee = match bee {
        Some(name) => BeeName::parse(name)?,
        None => BeeName::Queen,
    };
    let panes = config.pane_map();
    let pane = panes.resolve(bee)?.to_string();
    let output = mux.capture_pane(&pane, lines)?;
    Ok(PaneLogs { bee, pane, output })
}

// === remind ===

#[derive(Serialize)]
pub struct RemindersSent {
    pub sent: usize,
}

impl Output for RemindersSent {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Sent {} reminder(s)", self.sent)
    }
}

pub fn remind(
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    bee: Option<&str>,
) -> Result<RemindersSent> {
    let bee = bee.map(BeeName::parse).transpose()?;
    let mut supervisor = Supervisor::new(config, mux)?;
    Ok(RemindersSent {
        sent: supervisor.send_reminders(bee)?,
    })
}

// === stop ===

#[derive(Serialize)]
pub struct HiveStopped {
    pub session: String,
    pub daemon_stopped: bool,
}

impl Output for HiveStopped {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Hive '{}' stopped", self.session)
    }
}

/// Graceful shutdown: stop the daemon, notify the bees, tear down the
/// session. The caller is responsible for confirmation.
pub fn stop(config: &HiveConfig, mux: Arc<dyn Multiplexer>) -> Result<HiveStopped> {
    let daemon_stopped = match daemon_stop(config) {
        Ok(result) => result.stopped,
        Err(e) => {
            tracing::debug!(error = %e, "daemon stop during shutdown");
            false
        }
    };

    let mut supervisor = Supervisor::new(config, mux)?;
    supervisor.stop()?;

    Ok(HiveStopped {
        session: config.session_name.clone(),
        daemon_stopped,
    })
}

// === daemon ===

#[derive(Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl Output for DaemonStatus {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match (self.running, self.pid) {
            (true, Some(pid)) => format!("Daemon running (pid {pid})"),
            _ => "Daemon not running".to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct DaemonStopped {
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl Output for DaemonStopped {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match (self.stopped, self.pid, self.method.as_deref()) {
            (true, Some(pid), Some(method)) => format!("Daemon {pid} stopped ({method})"),
            _ => "Daemon was not running".to_string(),
        }
    }
}

/// Spawn the daemon as a detached `hive daemon run` child.
pub fn daemon_start(config: &HiveConfig) -> Result<DaemonStatus> {
    let pid_file = DaemonPidFile::new(config.pid_file_path());
    if let Some((true, info)) = pid_file.check_running()? {
        return Err(Error::AlreadyRunning(format!("daemon pid {}", info.pid)));
    }
    pid_file.delete().ok();

    std::fs::create_dir_all(&config.hive_dir)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.hive_dir.join("daemon.log"))?;

    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .arg("daemon")
        .arg("run")
        .arg("--hive-dir")
        .arg(&config.hive_dir)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()?;

    tracing::info!(pid = child.id(), "daemon spawned");
    Ok(DaemonStatus {
        running: true,
        pid: Some(child.id()),
        session: Some(config.session_name.clone()),
    })
}

/// Stop the daemon: SIGTERM, a grace period, then SIGKILL.
pub fn daemon_stop(config: &HiveConfig) -> Result<DaemonStopped> {
    let pid_file = DaemonPidFile::new(config.pid_file_path());
    let Some((alive, info)) = pid_file.check_running()? else {
        return Ok(DaemonStopped {
            stopped: false,
            pid: None,
            method: None,
        });
    };
    if !alive {
        pid_file.delete().ok();
        return Ok(DaemonStopped {
            stopped: false,
            pid: Some(info.pid),
            method: Some("stale_pid_file".to_string()),
        });
    }

    if !send_signal(info.pid, Signal::Term) {
        pid_file.delete().ok();
        return Ok(DaemonStopped {
            stopped: true,
            pid: Some(info.pid),
            method: Some("already_gone".to_string()),
        });
    }

    const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);
    const POLL_INTERVAL: Duration = Duration::from_millis(100);
    let deadline = std::time::Instant::now() + GRACEFUL_TIMEOUT;
    loop {
        std::thread::sleep(POLL_INTERVAL);
        match pid_file.check_running()? {
            Some((true, _)) if std::time::Instant::now() >= deadline => {
                send_signal(info.pid, Signal::Kill);
                std::thread::sleep(Duration::from_millis(500));
                pid_file.delete().ok();
                return Ok(DaemonStopped {
                    stopped: true,
                    pid: Some(info.pid),
                    method: Some("sigkill".to_string()),
                });
            }
            Some((true, _)) => {} // keep waiting
            _ => {
                pid_file.delete().ok();
                return Ok(DaemonStopped {
                    stopped: true,
                    pid: Some(info.pid),
                    method: Some("sigterm".to_string()),
                });
            }
        }
    }
}

pub fn daemon_status(config: &HiveConfig) -> Result<DaemonStatus> {
    let pid_file = DaemonPidFile::new(config.pid_file_path());
    match pid_file.check_running()? {
        Some((alive, info)) => Ok(DaemonStatus {
            running: alive,
            pid: Some(info.pid),
            session: Some(info.session),
        }),
        None => Ok(DaemonStatus {
            running: false,
            pid: None,
            session: None,
        }),
    }
}

#[derive(Serialize)]
pub struct InjectionLogTail {
    pub entries: Vec<crate::models::InjectionLogEntry>,
}

impl Output for InjectionLogTail {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "No injections logged.".to_string();
        }
        self.entries
            .iter()
            .map(|e| {
                format!(
                    "{} {} -> {} [{}] {} chars",
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                    e.sender.as_deref().unwrap_or("-"),
                    e.target_pane,
                    e.outcome,
                    e.payload.chars().count()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn daemon_logs(config: &HiveConfig, n: Option<usize>) -> Result<InjectionLogTail> {
    let store = open_store(config)?;
    Ok(InjectionLogTail {
        entries: store.recent_injections(n.unwrap_or(20))?,
    })
}

static DAEMON_CANCEL: std::sync::OnceLock<CancelToken> = std::sync::OnceLock::new();

extern "C" fn handle_termination(_sig: libc::c_int) {
    if let Some(token) = DAEMON_CANCEL.get() {
        token.cancel();
    }
}

fn install_signal_handlers(cancel: CancelToken) {
    let _ = DAEMON_CANCEL.set(cancel);
    unsafe {
        libc::signal(
            libc::SIGTERM,
            handle_termination as usize as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            handle_termination as usize as libc::sighandler_t,
        );
    }
}

/// Foreground daemon loop: write the pid file, run the supervisor until
/// SIGTERM/SIGINT, clean up.
pub fn daemon_run(config: &HiveConfig, mux: Arc<dyn Multiplexer>) -> Result<()> {
    let mut supervisor = Supervisor::new(config, mux)?;

    let pid_file = DaemonPidFile::new(config.pid_file_path());
    pid_file.write(&DaemonPidInfo {
        pid: std::process::id(),
        session: config.session_name.clone(),
    })?;

    let cancel = CancelToken::new();
    install_signal_handlers(cancel.clone());
    supervisor.run(&cancel);

    pid_file.delete().ok();
    Ok(())
}

// === attach ===

/// Hand the terminal over to `tmux attach`. Returns the exit code.
pub fn attach(config: &HiveConfig) -> Result<i32> {
    let status = Command::new("tmux")
        .args(["attach-session", "-t", &config.session_name])
        .status()?;
    Ok(status.code().unwrap_or(1))
}

/// Ask for confirmation on stdin. Any line starting with `y` or `Y`
/// confirms; everything else declines. Works the same for a pipe.
pub fn confirm(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().chars().next(), Some('y') | Some('Y'))
}
