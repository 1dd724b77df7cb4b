//! Task lifecycle engine.
//!
//! Thin orchestration over the store's transactional task operations:
//! creation (with dependencies and an optional initial assignment),
//! assignment including workload-based auto-assignment, gated status
//! transitions, transitive cancellation and progress reporting.
//!
//! Completion and failure automatically notify the queen through the
//! message bus; a notification that cannot be delivered is logged and
//! never fails the transition that produced it.

use std::collections::BTreeMap;

use crate::bus::{MessageBus, Outbound};
use crate::models::{
    ActivityEntry, AgentStatePatch, AgentStatus, Assignment, AssignmentRole, BeeName,
    DependencyType, MessagePriority, MessageType, Task, TaskFilter, TaskPriority, TaskStatus,
};
use crate::store::Store;
use crate::{Error, Result};

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub assignee: Option<BeeName>,
    pub parent: Option<String>,
    pub dependencies: Vec<(String, DependencyType)>,
    pub metadata: Option<serde_json::Value>,
    pub created_by: BeeName,
}

impl NewTask {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        created_by: BeeName,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority: TaskPriority::default(),
            assignee: None,
            parent: None,
            dependencies: Vec::new(),
            metadata: None,
            created_by,
        }
    }
}

/// Options for an assignment.
#[derive(Debug, Clone)]
pub struct AssignOptions {
    pub assigner: BeeName,
    pub role: AssignmentRole,
    pub note: Option<String>,
}

impl Default for AssignOptions {
    fn default() -> Self {
        Self {
            assigner: BeeName::System,
            role: AssignmentRole::Primary,
            note: None,
        }
    }
}

/// Detailed progress for one task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskProgress {
    pub task: Task,
    pub assignments: Vec<Assignment>,
    /// Unresolved blocking dependency IDs
    pub blockers: Vec<String>,
    pub recent_activity: Vec<ActivityEntry>,
}

/// Aggregate progress across all tasks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressSummary {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_assignee: BTreeMap<String, i64>,
}

/// Task lifecycle operations, persisted through the store.
pub struct TaskEngine {
    store: Store,
    bus: MessageBus,
}

impl TaskEngine {
    pub fn new(store: Store, bus: MessageBus) -> Self {
        Self { store, bus }
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a task in `pending`, inserting dependency rows and, when
    /// an assignee is given, an initial primary assignment.
    pub fn create_task(&mut self, spec: NewTask) -> Result<Task> {
        let mut task = Task::new(spec.title, spec.description, spec.created_by);
        task.priority = spec.priority;
        task.assigned_to = spec.assignee;
        task.parent_task_id = spec.parent;
        task.metadata = spec.metadata;

        self.store
            .create_task(&task, &spec.dependencies, spec.created_by)?;
        tracing::info!(task_id = %task.task_id, title = %task.title, "task created");

        if let Some(assignee) = task.assigned_to {
            self.notify_assignee(&task, assignee);
        }

        Ok(self.store.get_task(&task.task_id)?)
    }

    /// Assign a task to a bee.
    pub fn assign(&mut self, task_id: &str, assignee: BeeName, opts: &AssignOptions) -> Result<()> {
        self.store.set_assignee(
            task_id,
            assignee,
            opts.assigner,
            opts.role,
            opts.note.as_deref(),
        )?;
        tracing::info!(task_id, assignee = %assignee, role = %opts.role, "task assigned");

        let task = self.store.get_task(task_id)?;
        self.notify_assignee(&task, assignee);
        Ok(())
    }

    /// Assign a task to the least-loaded worker with spare capacity.
    ///
    /// Candidates are the workers (never the queen); ties break in pane
    /// order. Fails with `NoCapacity` when every worker is at
    /// `max_tasks_per_bee`.
    pub fn assign_auto(
        &mut self,
        task_id: &str,
        assigner: BeeName,
        max_tasks_per_bee: u32,
    ) -> Result<BeeName> {
        let workload = self.store.agent_workload()?;
        let mut chosen: Option<(BeeName, i64)> = None;
        for bee in BeeName::WORKERS {
            let Some(row) = workload.iter().find(|row| row.bee_name == bee) else {
                continue;
            };
            if row.open_tasks >= i64::from(max_tasks_per_bee) {
                continue;
            }
            // Strict comparison keeps pane order as the tie-breaker.
            if chosen.map_or(true, |(_, best)| row.open_tasks < best) {
                chosen = Some((bee, row.open_tasks));
            }
        }
        let chosen = chosen.map(|(bee, _)| bee).ok_or(Error::NoCapacity)?;

        self.assign(
            task_id,
            chosen,
            &AssignOptions {
                assigner,
                role: AssignmentRole::Primary,
                note: Some("auto-assigned by workload".to_string()),
            },
        )?;
        Ok(chosen)
    }

    /// Transition a task to a new status.
    ///
    /// Applies the transition table, gates `in_progress` entry on
    /// blocking dependencies, and on completion/failure enqueues the
    /// automatic notification from `system` to `queen`.
    pub fn transition(
        &mut self,
        task_id: &str,
        to: TaskStatus,
        actor: BeeName,
        note: Option<&str>,
    ) -> Result<Task> {
        let current = self.store.get_task(task_id)?;
        let task = self
            .store
            .set_status(task_id, current.status, to, actor, note)?;
        tracing::info!(task_id, from = %current.status, to = %to, actor = %actor, "task transitioned");

        self.sync_agent_state(&task, to);

        match to {
            TaskStatus::Completed => {
                self.notify_queen(
                    &task,
                    MessageType::TaskUpdate,
                    MessagePriority::Normal,
                    format!("Task completed: {} ({})", task.title, task.task_id),
                );
            }
            TaskStatus::Failed => {
                self.notify_queen(
                    &task,
                    MessageType::Alert,
                    MessagePriority::High,
                    format!("Task failed: {} ({})", task.title, task.task_id),
                );
            }
            _ => {}
        }

        Ok(task)
    }

    /// Cancel a task and, transitively, its descendant subtasks.
    ///
    /// Descendants already in a terminal state are left alone. Returns
    /// the IDs that were actually cancelled.
    pub fn cancel(&mut self, task_id: &str, actor: BeeName, reason: &str) -> Result<Vec<String>> {
        // Existence check up front so a bad ID is an error, not an
        // empty cascade.
        self.store.get_task(task_id)?;

        let mut to_cancel = vec![task_id.to_string()];
        let mut index = 0;
        while index < to_cancel.len() {
            let children = self.store.children_of(&to_cancel[index])?;
            to_cancel.extend(children);
            index += 1;
        }

        let mut cancelled = Vec::new();
        for id in &to_cancel {
            let task = self.store.get_task(id)?;
            if task.status.is_terminal() && task.status != TaskStatus::Failed {
                continue;
            }
            let note = if id == task_id {
                reason.to_string()
            } else {
                format!("cancelled with parent {task_id}: {reason}")
            };
            match self
                .store
                .set_status(id, task.status, TaskStatus::Cancelled, actor, Some(&note))
            {
                Ok(task) => {
                    self.sync_agent_state(&task, TaskStatus::Cancelled);
                    cancelled.push(id.clone());
                }
                // A concurrent writer finished or cancelled it first.
                Err(Error::ConflictingTransition) | Err(Error::NoOpTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(task_id, count = cancelled.len(), "cancel cascade");
        Ok(cancelled)
    }

    /// Detailed progress for one task.
    pub fn task_progress(&self, task_id: &str) -> Result<TaskProgress> {
        let task = self.store.get_task(task_id)?;
        Ok(TaskProgress {
            assignments: self.store.assignments_for(task_id)?,
            blockers: self.store.blocking_dependencies(task_id)?,
            recent_activity: self.store.recent_activity(Some(task_id), 10)?,
            task,
        })
    }

    /// Aggregate counts per status and per assignee.
    pub fn progress_summary(&self) -> Result<ProgressSummary> {
        let by_status: BTreeMap<String, i64> = self
            .store
            .status_counts()?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();
        let by_assignee: BTreeMap<String, i64> = self
            .store
            .assignee_counts()?
            .into_iter()
            .map(|(bee, count)| {
                (
                    bee.map(|b| b.as_str().to_string())
                        .unwrap_or_else(|| "unassigned".to_string()),
                    count,
                )
            })
            .collect();
        let total = by_status.values().sum();
        Ok(ProgressSummary {
            total,
            by_status,
            by_assignee,
        })
    }

    /// List tasks through the engine (CLI convenience).
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list_tasks(filter)
    }

    /// Keep the assignee's agent state consistent with the task status:
    /// `busy` with the task while it runs, back to `idle` once the bee
    /// has nothing left in flight.
    fn sync_agent_state(&mut self, task: &Task, to: TaskStatus) {
        let Some(bee) = task.assigned_to else {
            return;
        };
        let result = match to {
            TaskStatus::InProgress => self.store.upsert_state(
                bee,
                &AgentStatePatch {
                    status: Some(AgentStatus::Busy),
                    current_task_id: Some(Some(task.task_id.clone())),
                    ..Default::default()
                },
            ),
            _ => {
                let state = match self.store.get_state(bee) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!(bee = %bee, error = %e, "agent state read failed");
                        return;
                    }
                };
                if state.current_task_id.as_deref() == Some(task.task_id.as_str()) {
                    self.store.upsert_state(
                        bee,
                        &AgentStatePatch {
                            status: Some(AgentStatus::Idle),
                            current_task_id: Some(None),
                            ..Default::default()
                        },
                    )
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            tracing::warn!(bee = %bee, error = %e, "agent state update failed");
        }
    }

    fn notify_queen(
        &mut self,
        task: &Task,
        message_type: MessageType,
        priority: MessagePriority,
        content: String,
    ) {
        let out = Outbound::new(BeeName::System, BeeName::Queen, message_type, content)
            .subject("Task status")
            .task(task.task_id.clone())
            .priority(priority);
        if let Err(e) = self.bus.send(&out) {
            tracing::warn!(task_id = %task.task_id, error = %e, "queen notification failed");
        }
    }

    fn notify_assignee(&mut self, task: &Task, assignee: BeeName) {
        let content = format!(
            "You have been assigned a task.\n\nTitle: {}\nPriority: {}\n\n{}",
            task.title, task.priority, task.description
        );
        let out = Outbound::new(BeeName::System, assignee, MessageType::TaskUpdate, content)
            .subject("Task assignment")
            .task(task.task_id.clone());
        if let Err(e) = self.bus.send(&out) {
            tracing::warn!(task_id = %task.task_id, assignee = %assignee, error = %e,
                "assignment notification failed");
        }
    }
}
