//! Durable store for hive state.
//!
//! Single SQLite database holding tasks, dependencies, assignments,
//! messages, agent states and the two append-only audit logs. All writes
//! go through the typed operations here; there is no ad-hoc SQL at call
//! sites. Every public operation is one transaction.
//!
//! Trigger-equivalent automation is implemented inside the operations so
//! call sites cannot skip it:
//! - a status change appends a `status_change` activity row
//! - an assignee change appends an `assignment_change` activity row
//! - every task write refreshes `updated_at`
//!
//! Transient SQLite faults (busy/locked) are retried with exponential
//! backoff up to five attempts; constraint violations are surfaced as
//! integrity errors and never retried.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::models::{
    ActivityEntry, AgentState, AgentStatePatch, AgentStatus, Assignment, AssignmentRole, BeeName,
    DependencyType, InjectionLogEntry, Message, MessagePriority, MessageType, NewMessage, Task,
    TaskFilter, TaskPriority, TaskStatus,
};
use crate::{Error, Result};

/// Schema version understood by this binary. Databases with a higher
/// `user_version` abort startup; lower versions are migrated in order.
pub const SCHEMA_VERSION: i32 = 1;

const MAX_WRITE_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Activity row parameters, used by the store itself and by callers
/// recording explicit activities.
#[derive(Debug, Clone)]
pub struct NewActivity<'a> {
    pub task_id: &'a str,
    pub bee_name: BeeName,
    pub activity_type: &'a str,
    pub description: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Injection log row parameters.
#[derive(Debug, Clone)]
pub struct NewInjection<'a> {
    pub session_name: &'a str,
    pub target_pane: &'a str,
    pub payload: &'a str,
    pub message_type: Option<&'a str>,
    pub sender: Option<&'a str>,
    pub metadata: Option<serde_json::Value>,
    pub dry_run: bool,
    pub outcome: &'a str,
}

/// One row of the `active_tasks` view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveTaskRow {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<BeeName>,
    pub dependency_count: i64,
    pub child_count: i64,
}

/// One row of the `agent_workload` view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkloadRow {
    pub bee_name: BeeName,
    pub status: AgentStatus,
    pub open_tasks: i64,
    pub active_assignments: i64,
}

/// Aggregate message statistics for `task stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MessageStats {
    pub total: i64,
    pub processed: i64,
    pub sender_cli_used: i64,
    /// Percentage of messages that went through the sender CLI
    pub sender_cli_usage_rate: f64,
}

/// Storage manager for one hive database.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open an existing hive database.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotInitialized);
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create (or open) the hive database, seeding one agent-state row
    /// per real bee.
    pub fn init(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        store.seed_agent_states()?;
        Ok(store)
    }

    /// Open an existing hive database with the configured busy timeout.
    pub fn open_with_timeout(path: &Path, timeout: Duration) -> Result<Self> {
        let store = Self::open(path)?;
        store.set_busy_timeout(timeout)?;
        Ok(store)
    }

    /// Whether a hive database exists at the given path.
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(())
    }

    /// Apply a specific busy timeout (from `db_timeout` configuration).
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn
            .pragma_update(None, "busy_timeout", timeout.as_millis() as i64)?;
        Ok(())
    }

    /// Create or migrate the schema based on `PRAGMA user_version`.
    fn ensure_schema(&mut self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > SCHEMA_VERSION {
            return Err(Error::SchemaTooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }

        if version == 0 {
            self.conn.execute_batch(SCHEMA_SQL)?;
            self.conn
                .pragma_update(None, "user_version", SCHEMA_VERSION)?;
            return Ok(());
        }

        // Future migrations run here in order, bumping user_version after
        // each step. Version 1 is current; nothing to do yet.
        Ok(())
    }

    fn seed_agent_states(&mut self) -> Result<()> {
        let now = fmt_ts(Utc::now());
        for bee in BeeName::REAL {
            self.conn.execute(
                "INSERT OR IGNORE INTO bee_states
                 (bee_name, status, workload_score, performance_score, capabilities,
                  last_activity, last_heartbeat, updated_at)
                 VALUES (?1, 'idle', 0.0, 100.0, '[]', ?2, ?2, ?2)",
                params![bee.as_str(), now],
            )?;
        }
        Ok(())
    }

    /// Run `f` inside an immediate transaction, retrying transient
    /// busy/locked failures with exponential backoff.
    fn with_tx<T>(&mut self, mut f: impl FnMut(&Transaction) -> Result<T>) -> Result<T> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<T> = (|| {
                let tx = self
                    .conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(Error::from)?;
                let value = f(&tx)?;
                tx.commit().map_err(Error::from)?;
                Ok(value)
            })();

            match result {
                Err(e) if e.is_transient() && attempt < MAX_WRITE_ATTEMPTS => {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::StoreUnavailable {
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
                other => return other,
            }
        }
    }

    // === Task Operations ===

    /// Create a task, its dependency rows and an optional initial
    /// assignment in one transaction.
    ///
    /// Appends a `created` activity, plus an `assignment_change` activity
    /// when `task.assigned_to` is set.
    pub fn create_task(
        &mut self,
        task: &Task,
        dependencies: &[(String, DependencyType)],
        assigner: BeeName,
    ) -> Result<()> {
        if task.title.trim().is_empty() {
            return Err(Error::InvalidInput("task title must not be empty".into()));
        }
        if task.description.trim().is_empty() {
            return Err(Error::InvalidInput(
                "task description must not be empty".into(),
            ));
        }
        if let Some(assignee) = task.assigned_to {
            if !assignee.can_be_assignee() {
                return Err(Error::InvalidInput(format!(
                    "cannot assign a task to {assignee}"
                )));
            }
        }

        let task = task.clone();
        let deps = dependencies.to_vec();
        self.with_tx(move |tx| {
            if let Some(parent) = &task.parent_task_id {
                if !task_exists_tx(tx, parent)? {
                    return Err(Error::NotFound(format!("parent task: {parent}")));
                }
            }

            tx.execute(
                "INSERT INTO tasks
                 (task_id, title, description, status, priority, assigned_to, created_by,
                  parent_task_id, metadata, created_at, updated_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    task.task_id,
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.priority.as_str(),
                    task.assigned_to.map(|b| b.as_str()),
                    task.created_by.as_str(),
                    task.parent_task_id,
                    task.metadata.as_ref().map(|m| m.to_string()),
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                    task.started_at.map(fmt_ts),
                    task.completed_at.map(fmt_ts),
                ],
            )?;

            for (depends_on, dep_type) in &deps {
                insert_dependency_tx(tx, &task.task_id, depends_on, *dep_type)?;
            }

            append_activity_tx(
                tx,
                &NewActivity {
                    task_id: &task.task_id,
                    bee_name: task.created_by,
                    activity_type: "created",
                    description: format!("Task created: {}", task.title),
                    old_value: None,
                    new_value: Some(task.status.as_str().to_string()),
                },
            )?;

            if let Some(assignee) = task.assigned_to {
                tx.execute(
                    "INSERT INTO task_assignments
                     (task_id, assigned_to, assigned_by, role, status, notes, assigned_at)
                     VALUES (?1, ?2, ?3, 'primary', 'active', NULL, ?4)",
                    params![
                        task.task_id,
                        assignee.as_str(),
                        assigner.as_str(),
                        fmt_ts(Utc::now()),
                    ],
                )?;
                append_activity_tx(
                    tx,
                    &NewActivity {
                        task_id: &task.task_id,
                        bee_name: assigner,
                        activity_type: "assignment_change",
                        description: format!("Assigned to {assignee}"),
                        old_value: None,
                        new_value: Some(assignee.as_str().to_string()),
                    },
                )?;
            }

            Ok(())
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.conn
            .query_row(
                "SELECT * FROM tasks WHERE task_id = ?1",
                [id],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("task: {id}")))
    }

    /// List tasks matching the filter, newest first within priority.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(status.as_str().to_string()));
        }
        if let Some(priority) = filter.priority {
            sql.push_str(" AND priority = ?");
            params_vec.push(Box::new(priority.as_str().to_string()));
        }
        if let Some(bee) = filter.assigned_to {
            sql.push_str(" AND assigned_to = ?");
            params_vec.push(Box::new(bee.as_str().to_string()));
        }
        if let Some(parent) = &filter.parent_task_id {
            sql.push_str(" AND parent_task_id = ?");
            params_vec.push(Box::new(parent.clone()));
        }

        sql.push_str(
            " ORDER BY CASE priority
                 WHEN 'critical' THEN 3 WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0
               END DESC, created_at ASC",
        );

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params_refs.as_slice(), task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Transition a task from `from` to `to` with compare-and-swap
    /// semantics: if the row no longer has status `from`, the caller
    /// lost a race and gets `ConflictingTransition`.
    ///
    /// Enforces the transition table, gates `pending -> in_progress` on
    /// blocking dependencies, maintains `started_at`/`completed_at`,
    /// refreshes `updated_at`, closes out active assignments on terminal
    /// statuses and appends the `status_change` activity row.
    pub fn set_status(
        &mut self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        actor: BeeName,
        note: Option<&str>,
    ) -> Result<Task> {
        if from == to {
            return Err(Error::NoOpTransition(from));
        }
        if !from.can_transition(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let id = id.to_string();
        let note = note.map(|s| s.to_string());
        self.with_tx(move |tx| {
            if to == TaskStatus::InProgress {
                let blockers = blocking_dependencies_tx(tx, &id)?;
                if !blockers.is_empty() {
                    return Err(Error::DependencyUnmet {
                        task_id: id.clone(),
                        blockers,
                    });
                }
            }

            let now = Utc::now();
            let changed = if to == TaskStatus::InProgress {
                tx.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2,
                            started_at = COALESCE(started_at, ?2), completed_at = NULL
                     WHERE task_id = ?3 AND status = ?4",
                    params![to.as_str(), fmt_ts(now), id, from.as_str()],
                )?
            } else if to.is_terminal() {
                tx.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2, completed_at = ?2
                     WHERE task_id = ?3 AND status = ?4",
                    params![to.as_str(), fmt_ts(now), id, from.as_str()],
                )?
            } else {
                tx.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2, completed_at = NULL
                     WHERE task_id = ?3 AND status = ?4",
                    params![to.as_str(), fmt_ts(now), id, from.as_str()],
                )?
            };

            if changed == 0 {
                if task_exists_tx(tx, &id)? {
                    return Err(Error::ConflictingTransition);
                }
                return Err(Error::NotFound(format!("task: {id}")));
            }

            if to == TaskStatus::InProgress {
                tx.execute(
                    "UPDATE task_assignments SET accepted_at = COALESCE(accepted_at, ?1)
                     WHERE task_id = ?2 AND role = 'primary' AND status = 'active'",
                    params![fmt_ts(now), id],
                )?;
            } else if to.is_terminal() {
                tx.execute(
                    "UPDATE task_assignments SET status = 'completed', completed_at = ?1
                     WHERE task_id = ?2 AND status = 'active'",
                    params![fmt_ts(now), id],
                )?;
            }

            let description = match &note {
                Some(n) => format!("Status changed from {from} to {to}: {n}"),
                None => format!("Status changed from {from} to {to}"),
            };
            append_activity_tx(
                tx,
                &NewActivity {
                    task_id: &id,
                    bee_name: actor,
                    activity_type: "status_change",
                    description,
                    old_value: Some(from.as_str().to_string()),
                    new_value: Some(to.as_str().to_string()),
                },
            )?;

            tx.query_row("SELECT * FROM tasks WHERE task_id = ?1", [&id], task_from_row)
                .map_err(Error::from)
        })
    }

    /// Change the primary assignee (or record a reviewer/collaborator).
    ///
    /// For `primary`: any existing active primary rows are marked
    /// `reassigned`, `tasks.assigned_to` is updated and an
    /// `assignment_change` activity is appended. Assigning the same bee
    /// as the current active primary is rejected as `AlreadyAssigned`.
    pub fn set_assignee(
        &mut self,
        id: &str,
        assignee: BeeName,
        assigner: BeeName,
        role: AssignmentRole,
        note: Option<&str>,
    ) -> Result<()> {
        if !assignee.can_be_assignee() {
            return Err(Error::InvalidInput(format!(
                "cannot assign a task to {assignee}"
            )));
        }

        let id = id.to_string();
        let note = note.map(|s| s.to_string());
        self.with_tx(move |tx| {
            let previous: Option<String> = tx
                .query_row(
                    "SELECT assigned_to FROM tasks WHERE task_id = ?1",
                    [&id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::NotFound(format!("task: {id}")))?;

            let now = Utc::now();
            if role == AssignmentRole::Primary {
                let current_primary: Option<String> = tx
                    .query_row(
                        "SELECT assigned_to FROM task_assignments
                         WHERE task_id = ?1 AND role = 'primary' AND status = 'active'
                         ORDER BY assignment_id DESC LIMIT 1",
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;

                if current_primary.as_deref() == Some(assignee.as_str()) {
                    return Err(Error::AlreadyAssigned(assignee.to_string()));
                }

                tx.execute(
                    "UPDATE task_assignments SET status = 'reassigned'
                     WHERE task_id = ?1 AND role = 'primary' AND status = 'active'",
                    [&id],
                )?;
                tx.execute(
                    "UPDATE tasks SET assigned_to = ?1, updated_at = ?2 WHERE task_id = ?3",
                    params![assignee.as_str(), fmt_ts(now), id],
                )?;
            }

            tx.execute(
                "INSERT INTO task_assignments
                 (task_id, assigned_to, assigned_by, role, status, notes, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6)",
                params![
                    id,
                    assignee.as_str(),
                    assigner.as_str(),
                    role.as_str(),
                    note,
                    fmt_ts(now),
                ],
            )?;

            let description = match role {
                AssignmentRole::Primary => format!("Assigned to {assignee}"),
                other => format!("Added {assignee} as {other}"),
            };
            append_activity_tx(
                tx,
                &NewActivity {
                    task_id: &id,
                    bee_name: assigner,
                    activity_type: "assignment_change",
                    description,
                    old_value: previous,
                    new_value: Some(assignee.as_str().to_string()),
                },
            )?;

            Ok(())
        })
    }

    /// All assignment rows for a task, oldest first.
    pub fn assignments_for(&self, task_id: &str) -> Result<Vec<Assignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM task_assignments WHERE task_id = ?1 ORDER BY assignment_id ASC",
        )?;
        let rows = stmt
            .query_map([task_id], assignment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // === Dependency Operations ===

    /// Add a dependency edge. Rejects self-dependencies, duplicates,
    /// missing endpoints and anything that would close a cycle.
    pub fn add_dependency(
        &mut self,
        task_id: &str,
        depends_on: &str,
        dep_type: DependencyType,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let depends_on = depends_on.to_string();
        self.with_tx(move |tx| {
            if !task_exists_tx(tx, &task_id)? {
                return Err(Error::NotFound(format!("task: {task_id}")));
            }
            insert_dependency_tx(tx, &task_id, &depends_on, dep_type)
        })
    }

    /// IDs of unresolved `blocks` dependencies of a task.
    pub fn blocking_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.depends_on_task_id FROM task_dependencies d
             JOIN tasks t ON t.task_id = d.depends_on_task_id
             WHERE d.task_id = ?1 AND d.dependency_type = 'blocks'
               AND t.status != 'completed'
             ORDER BY d.depends_on_task_id",
        )?;
        let ids = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// All dependencies of a task (what it depends on), with types.
    pub fn dependencies_of(&self, task_id: &str) -> Result<Vec<(String, DependencyType)>> {
        let mut stmt = self.conn.prepare(
            "SELECT depends_on_task_id, dependency_type FROM task_dependencies
             WHERE task_id = ?1 ORDER BY depends_on_task_id",
        )?;
        let rows = stmt
            .query_map([task_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, t)| Ok((id, DependencyType::parse(&t)?)))
            .collect()
    }

    /// Direct children of a task in the parent/child forest.
    pub fn children_of(&self, task_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT task_id FROM tasks WHERE parent_task_id = ?1 ORDER BY created_at")?;
        let ids = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    // === Message Operations ===

    /// Persist a message. The receiver must be a concrete name;
    /// broadcasts are expanded by the bus before they reach the store.
    pub fn enqueue_message(&mut self, msg: &NewMessage) -> Result<i64> {
        if msg.content.trim().is_empty() {
            return Err(Error::InvalidInput(
                "message content must not be empty".into(),
            ));
        }
        if msg.to_bee == BeeName::All {
            return Err(Error::InvalidInput(
                "broadcast messages must be expanded before persisting".into(),
            ));
        }
        if msg.from_bee == BeeName::All {
            return Err(Error::InvalidName("all is not a valid sender".into()));
        }

        let msg = msg.clone();
        self.with_tx(move |tx| {
            tx.execute(
                "INSERT INTO bee_messages
                 (from_bee, to_bee, message_type, subject, content, task_id, priority,
                  processed, sender_cli_used, conversation_id, reply_to, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?12)",
                params![
                    msg.from_bee.as_str(),
                    msg.to_bee.as_str(),
                    msg.message_type.as_str(),
                    msg.subject,
                    msg.content,
                    msg.task_id,
                    msg.priority.as_str(),
                    msg.sender_cli_used,
                    msg.conversation_id,
                    msg.reply_to,
                    fmt_ts(Utc::now()),
                    msg.expires_at.map(fmt_ts),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Get a message by ID.
    pub fn get_message(&self, id: i64) -> Result<Message> {
        self.conn
            .query_row(
                "SELECT * FROM bee_messages WHERE message_id = ?1",
                [id],
                message_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("message: {id}")))
    }

    /// Dequeue messages for a bee, highest priority first, oldest first
    /// within a priority.
    ///
    /// An expired message is never observable unless it was already
    /// processed and `include_processed` is set; an expired unprocessed
    /// message stays invisible until the reaper marks it.
    pub fn dequeue_messages(
        &self,
        bee: BeeName,
        include_processed: bool,
        max: Option<usize>,
    ) -> Result<Vec<Message>> {
        let mut sql = String::from("SELECT * FROM bee_messages WHERE to_bee = ?1");
        if include_processed {
            sql.push_str(
                " AND (processed = 1
                       OR expires_at IS NULL OR datetime(expires_at) > datetime(?2))",
            );
        } else {
            sql.push_str(
                " AND processed = 0
                  AND (expires_at IS NULL OR datetime(expires_at) > datetime(?2))",
            );
        }
        sql.push_str(
            " ORDER BY CASE priority
                 WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0
               END DESC, created_at ASC",
        );
        if let Some(n) = max {
            sql.push_str(&format!(" LIMIT {n}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![bee.as_str(), fmt_ts(Utc::now())], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mark a message processed. Idempotent: a second call leaves the
    /// original `processed_at` in place.
    pub fn mark_processed(&mut self, id: i64) -> Result<()> {
        let changed = self.with_tx(move |tx| {
            let n = tx.execute(
                "UPDATE bee_messages
                 SET processed = 1, processed_at = COALESCE(processed_at, ?1)
                 WHERE message_id = ?2",
                params![fmt_ts(Utc::now()), id],
            )?;
            Ok(n)
        })?;
        if changed == 0 {
            return Err(Error::NotFound(format!("message: {id}")));
        }
        Ok(())
    }

    /// Mark all expired, unprocessed messages as processed with a
    /// synthetic note so they are never delivered. Returns the count.
    pub fn reap_expired_messages(&mut self) -> Result<usize> {
        self.with_tx(move |tx| {
            let now = fmt_ts(Utc::now());
            let n = tx.execute(
                "UPDATE bee_messages
                 SET processed = 1, processed_at = ?1,
                     processed_note = 'expired before delivery'
                 WHERE processed = 0 AND expires_at IS NOT NULL
                   AND datetime(expires_at) <= datetime(?1)",
                params![now],
            )?;
            Ok(n)
        })
    }

    /// Messages after `last_seen_id` from real bees that bypassed the
    /// sender CLI. Input for the supervisor's violation scan.
    pub fn violations_since(&self, last_seen_id: i64) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM bee_messages
             WHERE message_id > ?1 AND sender_cli_used = 0
               AND from_bee IN ('queen', 'developer', 'qa', 'analyst')
             ORDER BY message_id ASC",
        )?;
        let rows = stmt
            .query_map([last_seen_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Highest assigned message ID, 0 when the table is empty.
    pub fn max_message_id(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(MAX(message_id), 0) FROM bee_messages", [], |r| {
                r.get(0)
            })?)
    }

    /// Aggregate message statistics.
    pub fn message_stats(&self) -> Result<MessageStats> {
        let (total, processed, cli): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(processed), 0),
                    COALESCE(SUM(sender_cli_used), 0)
             FROM bee_messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let rate = if total == 0 {
            100.0
        } else {
            cli as f64 * 100.0 / total as f64
        };
        Ok(MessageStats {
            total,
            processed,
            sender_cli_used: cli,
            sender_cli_usage_rate: rate,
        })
    }

    // === Agent Operations ===

    /// Get the state row for a bee.
    pub fn get_state(&self, bee: BeeName) -> Result<AgentState> {
        self.conn
            .query_row(
                "SELECT * FROM bee_states WHERE bee_name = ?1",
                [bee.as_str()],
                agent_state_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("agent state: {bee}")))
    }

    /// All state rows, in pane order.
    pub fn list_states(&self) -> Result<Vec<AgentState>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM bee_states
             ORDER BY CASE bee_name
                 WHEN 'queen' THEN 0 WHEN 'developer' THEN 1 WHEN 'qa' THEN 2 ELSE 3
             END",
        )?;
        let rows = stmt
            .query_map([], agent_state_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Partially update a bee's state row.
    pub fn upsert_state(&mut self, bee: BeeName, patch: &AgentStatePatch) -> Result<()> {
        if !bee.is_real() {
            return Err(Error::InvalidInput(format!("{bee} has no agent state")));
        }
        let patch = patch.clone();
        let changed = self.with_tx(move |tx| {
            let mut sets = vec!["updated_at = ?1".to_string()];
            let mut values: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(fmt_ts(Utc::now()))];
            let mut idx = 1;

            if let Some(status) = patch.status {
                idx += 1;
                sets.push(format!("status = ?{idx}"));
                values.push(Box::new(status.as_str().to_string()));
            }
            if let Some(task) = &patch.current_task_id {
                idx += 1;
                sets.push(format!("current_task_id = ?{idx}"));
                values.push(Box::new(task.clone()));
            }
            if let Some(score) = patch.workload_score {
                idx += 1;
                sets.push(format!("workload_score = ?{idx}"));
                values.push(Box::new(score));
            }
            if let Some(score) = patch.performance_score {
                idx += 1;
                sets.push(format!("performance_score = ?{idx}"));
                values.push(Box::new(score));
            }
            if let Some(caps) = &patch.capabilities {
                idx += 1;
                sets.push(format!("capabilities = ?{idx}"));
                values.push(Box::new(serde_json::to_string(caps)?));
            }

            idx += 1;
            let sql = format!(
                "UPDATE bee_states SET {} WHERE bee_name = ?{idx}",
                sets.join(", ")
            );
            values.push(Box::new(bee.as_str().to_string()));

            let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            Ok(tx.execute(&sql, refs.as_slice())?)
        })?;
        if changed == 0 {
            return Err(Error::NotFound(format!("agent state: {bee}")));
        }
        Ok(())
    }

    /// Refresh `last_activity` on inbound/outbound traffic.
    pub fn touch_activity(&mut self, bee: BeeName) -> Result<()> {
        if !bee.is_real() {
            return Ok(());
        }
        self.with_tx(move |tx| {
            tx.execute(
                "UPDATE bee_states SET last_activity = ?1, updated_at = ?1 WHERE bee_name = ?2",
                params![fmt_ts(Utc::now()), bee.as_str()],
            )?;
            Ok(())
        })
    }

    /// Refresh `last_heartbeat` (and `last_activity`).
    pub fn touch_heartbeat(&mut self, bee: BeeName) -> Result<()> {
        let changed = self.with_tx(move |tx| {
            Ok(tx.execute(
                "UPDATE bee_states
                 SET last_heartbeat = ?1, last_activity = ?1, updated_at = ?1
                 WHERE bee_name = ?2",
                params![fmt_ts(Utc::now()), bee.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(Error::NotFound(format!("agent state: {bee}")));
        }
        Ok(())
    }

    /// Overwrite `last_heartbeat` with an explicit timestamp.
    ///
    /// Exists for the supervisor's liveness tests and for backfills;
    /// normal code paths use [`Store::touch_heartbeat`].
    pub fn set_heartbeat_at(&mut self, bee: BeeName, at: DateTime<Utc>) -> Result<()> {
        self.with_tx(move |tx| {
            tx.execute(
                "UPDATE bee_states SET last_heartbeat = ?1, updated_at = ?2 WHERE bee_name = ?3",
                params![fmt_ts(at), fmt_ts(Utc::now()), bee.as_str()],
            )?;
            Ok(())
        })
    }

    // === Activity Log ===

    /// Append an activity entry. The log is append-only; nothing in this
    /// crate updates or deletes rows.
    pub fn append_activity(&mut self, activity: &NewActivity<'_>) -> Result<i64> {
        let activity = NewActivity {
            task_id: activity.task_id,
            bee_name: activity.bee_name,
            activity_type: activity.activity_type,
            description: activity.description.clone(),
            old_value: activity.old_value.clone(),
            new_value: activity.new_value.clone(),
        };
        self.with_tx(move |tx| append_activity_tx(tx, &activity))
    }

    /// Recent activity rows, newest first. Optionally scoped to a task.
    pub fn recent_activity(
        &self,
        task_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>> {
        let (sql, param): (String, Option<String>) = match task_id {
            Some(id) => (
                format!(
                    "SELECT * FROM task_activity WHERE task_id = ?1
                     ORDER BY activity_id DESC LIMIT {limit}"
                ),
                Some(id.to_string()),
            ),
            None => (
                format!("SELECT * FROM task_activity ORDER BY activity_id DESC LIMIT {limit}"),
                None,
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match param {
            Some(p) => stmt
                .query_map([p], activity_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], activity_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Total number of activity rows.
    pub fn activity_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM task_activity", [], |r| r.get(0))?)
    }

    // === Injection Log ===

    /// Append an injection log entry. Append-only.
    pub fn append_injection(&mut self, entry: &NewInjection<'_>) -> Result<i64> {
        let entry = NewInjection {
            session_name: entry.session_name,
            target_pane: entry.target_pane,
            payload: entry.payload,
            message_type: entry.message_type,
            sender: entry.sender,
            metadata: entry.metadata.clone(),
            dry_run: entry.dry_run,
            outcome: entry.outcome,
        };
        self.with_tx(move |tx| {
            tx.execute(
                "INSERT INTO injection_log
                 (session_name, target_pane, payload, message_type, sender, metadata,
                  dry_run, outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.session_name,
                    entry.target_pane,
                    entry.payload,
                    entry.message_type,
                    entry.sender,
                    entry.metadata.as_ref().map(|m| m.to_string()),
                    entry.dry_run,
                    entry.outcome,
                    fmt_ts(Utc::now()),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Recent injection log entries, newest first.
    pub fn recent_injections(&self, limit: usize) -> Result<Vec<InjectionLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT * FROM injection_log ORDER BY injection_id DESC LIMIT {limit}"
        ))?;
        let rows = stmt
            .query_map([], injection_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // === Views ===

    /// Tasks in `pending`/`in_progress` with dependency and child counts.
    pub fn active_tasks(&self) -> Result<Vec<ActiveTaskRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, title, status, priority, assigned_to, dependency_count, child_count
             FROM active_tasks",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(task_id, title, status, priority, assigned_to, deps, children)| {
                Ok(ActiveTaskRow {
                    task_id,
                    title,
                    status: TaskStatus::parse(&status)?,
                    priority: TaskPriority::parse(&priority)?,
                    assigned_to: assigned_to.as_deref().map(BeeName::parse).transpose()?,
                    dependency_count: deps,
                    child_count: children,
                })
            })
            .collect()
    }

    /// Unprocessed, unexpired messages in delivery order.
    pub fn pending_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare("SELECT * FROM pending_messages")?;
        let rows = stmt
            .query_map([], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Per-bee open-task and assignment counts.
    pub fn agent_workload(&self) -> Result<Vec<WorkloadRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT bee_name, status, open_tasks, active_assignments FROM agent_workload",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(bee, status, open_tasks, active_assignments)| {
                Ok(WorkloadRow {
                    bee_name: BeeName::parse(&bee)?,
                    status: AgentStatus::parse(&status)?,
                    open_tasks,
                    active_assignments,
                })
            })
            .collect()
    }

    /// Task counts grouped by status.
    pub fn status_counts(&self) -> Result<Vec<(TaskStatus, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(s, n)| Ok((TaskStatus::parse(&s)?, n)))
            .collect()
    }

    /// Task counts grouped by assignee (unassigned tasks under `None`).
    pub fn assignee_counts(&self) -> Result<Vec<(Option<BeeName>, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT assigned_to, COUNT(*) FROM tasks GROUP BY assigned_to")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(s, n)| Ok((s.as_deref().map(BeeName::parse).transpose()?, n)))
            .collect()
    }
}

// === Transaction Helpers ===

fn task_exists_tx(tx: &Transaction, id: &str) -> Result<bool> {
    Ok(tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE task_id = ?1)",
        [id],
        |row| row.get(0),
    )?)
}

fn blocking_dependencies_tx(tx: &Transaction, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = tx.prepare(
        "SELECT d.depends_on_task_id FROM task_dependencies d
         JOIN tasks t ON t.task_id = d.depends_on_task_id
         WHERE d.task_id = ?1 AND d.dependency_type = 'blocks'
           AND t.status != 'completed'
         ORDER BY d.depends_on_task_id",
    )?;
    let ids = stmt
        .query_map([task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

fn insert_dependency_tx(
    tx: &Transaction,
    task_id: &str,
    depends_on: &str,
    dep_type: DependencyType,
) -> Result<()> {
    if task_id == depends_on {
        return Err(Error::InvalidInput(
            "a task cannot depend on itself".into(),
        ));
    }
    if !task_exists_tx(tx, depends_on)? {
        return Err(Error::NotFound(format!("task: {depends_on}")));
    }

    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM task_dependencies
         WHERE task_id = ?1 AND depends_on_task_id = ?2)",
        params![task_id, depends_on],
        |row| row.get(0),
    )?;
    if exists {
        return Err(Error::InvalidInput(format!(
            "dependency already exists: {task_id} -> {depends_on}"
        )));
    }

    if would_create_cycle_tx(tx, task_id, depends_on)? {
        return Err(Error::CycleDetected);
    }

    tx.execute(
        "INSERT INTO task_dependencies (task_id, depends_on_task_id, dependency_type, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![task_id, depends_on, dep_type.as_str(), fmt_ts(Utc::now())],
    )?;
    Ok(())
}

/// DFS from `depends_on` along existing dependency edges; a path back to
/// `task_id` means the new edge would close a cycle.
fn would_create_cycle_tx(tx: &Transaction, task_id: &str, depends_on: &str) -> Result<bool> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![depends_on.to_string()];

    while let Some(current) = stack.pop() {
        if current == task_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }

        let mut stmt = tx.prepare(
            "SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1",
        )?;
        let next = stmt
            .query_map([&current], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for id in next {
            if !visited.contains(&id) {
                stack.push(id);
            }
        }
    }

    Ok(false)
}

fn append_activity_tx(tx: &Transaction, activity: &NewActivity<'_>) -> Result<i64> {
    tx.execute(
        "INSERT INTO task_activity
         (task_id, bee_name, activity_type, description, old_value, new_value, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            activity.task_id,
            activity.bee_name.as_str(),
            activity.activity_type,
            activity.description,
            activity.old_value,
            activity.new_value,
            fmt_ts(Utc::now()),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

// === Row Mapping ===

/// Timestamps are stored as RFC 3339 with microsecond precision and a
/// `Z` suffix so that SQLite's `datetime()` can parse them and lexical
/// order matches chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn conv_err<E: std::error::Error + Send + Sync + 'static>(
    idx: usize,
    e: E,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let priority: String = row.get("priority")?;
    let assigned_to: Option<String> = row.get("assigned_to")?;
    let created_by: String = row.get("created_by")?;
    let metadata: Option<String> = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(Task {
        task_id: row.get("task_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status).map_err(|e| conv_err(3, e))?,
        priority: TaskPriority::parse(&priority).map_err(|e| conv_err(4, e))?,
        assigned_to: assigned_to
            .as_deref()
            .map(BeeName::parse)
            .transpose()
            .map_err(|e| conv_err(5, e))?,
        created_by: BeeName::parse(&created_by).map_err(|e| conv_err(6, e))?,
        parent_task_id: row.get("parent_task_id")?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| conv_err(8, e))?,
        created_at: parse_ts(9, &created_at)?,
        updated_at: parse_ts(10, &updated_at)?,
        started_at: started_at.as_deref().map(|s| parse_ts(11, s)).transpose()?,
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_ts(12, s))
            .transpose()?,
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let from_bee: String = row.get("from_bee")?;
    let to_bee: String = row.get("to_bee")?;
    let message_type: String = row.get("message_type")?;
    let priority: String = row.get("priority")?;
    let processed_at: Option<String> = row.get("processed_at")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;

    Ok(Message {
        message_id: row.get("message_id")?,
        from_bee: BeeName::parse(&from_bee).map_err(|e| conv_err(1, e))?,
        to_bee: BeeName::parse(&to_bee).map_err(|e| conv_err(2, e))?,
        message_type: MessageType::parse(&message_type),
        subject: row.get("subject")?,
        content: row.get("content")?,
        task_id: row.get("task_id")?,
        priority: MessagePriority::parse(&priority).map_err(|e| conv_err(7, e))?,
        processed: row.get("processed")?,
        processed_at: processed_at
            .as_deref()
            .map(|s| parse_ts(9, s))
            .transpose()?,
        sender_cli_used: row.get("sender_cli_used")?,
        conversation_id: row.get("conversation_id")?,
        reply_to: row.get("reply_to")?,
        created_at: parse_ts(13, &created_at)?,
        expires_at: expires_at.as_deref().map(|s| parse_ts(14, s)).transpose()?,
    })
}

fn agent_state_from_row(row: &Row) -> rusqlite::Result<AgentState> {
    let bee_name: String = row.get("bee_name")?;
    let status: String = row.get("status")?;
    let capabilities: String = row.get("capabilities")?;
    let last_activity: String = row.get("last_activity")?;
    let last_heartbeat: String = row.get("last_heartbeat")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(AgentState {
        bee_name: BeeName::parse(&bee_name).map_err(|e| conv_err(0, e))?,
        status: AgentStatus::parse(&status).map_err(|e| conv_err(1, e))?,
        current_task_id: row.get("current_task_id")?,
        workload_score: row.get("workload_score")?,
        performance_score: row.get("performance_score")?,
        capabilities: serde_json::from_str(&capabilities).map_err(|e| conv_err(5, e))?,
        last_activity: parse_ts(6, &last_activity)?,
        last_heartbeat: parse_ts(7, &last_heartbeat)?,
        updated_at: parse_ts(8, &updated_at)?,
    })
}

fn assignment_from_row(row: &Row) -> rusqlite::Result<Assignment> {
    let assigned_to: String = row.get("assigned_to")?;
    let assigned_by: String = row.get("assigned_by")?;
    let role: String = row.get("role")?;
    let assigned_at: String = row.get("assigned_at")?;
    let accepted_at: Option<String> = row.get("accepted_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(Assignment {
        assignment_id: row.get("assignment_id")?,
        task_id: row.get("task_id")?,
        assigned_to: BeeName::parse(&assigned_to).map_err(|e| conv_err(2, e))?,
        assigned_by: BeeName::parse(&assigned_by).map_err(|e| conv_err(3, e))?,
        role: AssignmentRole::parse(&role).map_err(|e| conv_err(4, e))?,
        status: row.get("status")?,
        notes: row.get("notes")?,
        assigned_at: parse_ts(7, &assigned_at)?,
        accepted_at: accepted_at.as_deref().map(|s| parse_ts(8, s)).transpose()?,
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_ts(9, s))
            .transpose()?,
    })
}

fn activity_from_row(row: &Row) -> rusqlite::Result<ActivityEntry> {
    let bee_name: String = row.get("bee_name")?;
    let created_at: String = row.get("created_at")?;

    Ok(ActivityEntry {
        activity_id: row.get("activity_id")?,
        task_id: row.get("task_id")?,
        bee_name: BeeName::parse(&bee_name).map_err(|e| conv_err(2, e))?,
        activity_type: row.get("activity_type")?,
        description: row.get("description")?,
        old_value: row.get("old_value")?,
        new_value: row.get("new_value")?,
        created_at: parse_ts(7, &created_at)?,
    })
}

fn injection_from_row(row: &Row) -> rusqlite::Result<InjectionLogEntry> {
    let metadata: Option<String> = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;

    Ok(InjectionLogEntry {
        injection_id: row.get("injection_id")?,
        session_name: row.get("session_name")?,
        target_pane: row.get("target_pane")?,
        payload: row.get("payload")?,
        message_type: row.get("message_type")?,
        sender: row.get("sender")?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| conv_err(6, e))?,
        dry_run: row.get("dry_run")?,
        outcome: row.get("outcome")?,
        created_at: parse_ts(9, &created_at)?,
    })
}

// === Schema ===

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    title TEXT NOT NULL CHECK (length(title) > 0),
    description TEXT NOT NULL CHECK (length(description) > 0),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'cancelled')),
    priority TEXT NOT NULL DEFAULT 'medium'
        CHECK (priority IN ('low', 'medium', 'high', 'critical')),
    assigned_to TEXT
        CHECK (assigned_to IN ('queen', 'developer', 'qa', 'analyst')),
    created_by TEXT NOT NULL,
    parent_task_id TEXT REFERENCES tasks(task_id),
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    CHECK (status != 'in_progress' OR started_at IS NOT NULL),
    CHECK (status NOT IN ('completed', 'failed', 'cancelled') OR completed_at IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
    depends_on_task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
    dependency_type TEXT NOT NULL DEFAULT 'blocks'
        CHECK (dependency_type IN ('blocks', 'related', 'subtask')),
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on_task_id),
    CHECK (task_id != depends_on_task_id)
);

CREATE TABLE IF NOT EXISTS task_assignments (
    assignment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
    assigned_to TEXT NOT NULL
        CHECK (assigned_to IN ('queen', 'developer', 'qa', 'analyst')),
    assigned_by TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'primary'
        CHECK (role IN ('primary', 'reviewer', 'collaborator')),
    status TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active', 'reassigned', 'completed')),
    notes TEXT,
    assigned_at TEXT NOT NULL,
    accepted_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS bee_messages (
    message_id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_bee TEXT NOT NULL
        CHECK (from_bee IN ('queen', 'developer', 'qa', 'analyst', 'system', 'beekeeper')),
    to_bee TEXT NOT NULL
        CHECK (to_bee IN ('queen', 'developer', 'qa', 'analyst', 'system', 'beekeeper')),
    message_type TEXT NOT NULL,
    subject TEXT,
    content TEXT NOT NULL CHECK (length(content) > 0),
    task_id TEXT REFERENCES tasks(task_id),
    priority TEXT NOT NULL DEFAULT 'normal'
        CHECK (priority IN ('low', 'normal', 'high', 'urgent')),
    processed INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT,
    processed_note TEXT,
    sender_cli_used INTEGER NOT NULL DEFAULT 0,
    conversation_id TEXT,
    reply_to INTEGER REFERENCES bee_messages(message_id),
    created_at TEXT NOT NULL,
    expires_at TEXT,
    CHECK ((processed = 1) = (processed_at IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS bee_states (
    bee_name TEXT PRIMARY KEY
        CHECK (bee_name IN ('queen', 'developer', 'qa', 'analyst')),
    status TEXT NOT NULL DEFAULT 'idle'
        CHECK (status IN ('idle', 'busy', 'waiting', 'offline', 'error')),
    current_task_id TEXT REFERENCES tasks(task_id),
    workload_score REAL NOT NULL DEFAULT 0.0
        CHECK (workload_score BETWEEN 0.0 AND 100.0),
    performance_score REAL NOT NULL DEFAULT 100.0
        CHECK (performance_score BETWEEN 0.0 AND 100.0),
    capabilities TEXT NOT NULL DEFAULT '[]',
    last_activity TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_activity (
    activity_id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(task_id),
    bee_name TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    description TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS injection_log (
    injection_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_name TEXT NOT NULL,
    target_pane TEXT NOT NULL,
    payload TEXT NOT NULL,
    message_type TEXT,
    sender TEXT,
    metadata TEXT,
    dry_run INTEGER NOT NULL DEFAULT 0,
    outcome TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_assigned_to ON tasks(assigned_to);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);
CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON task_dependencies(depends_on_task_id);
CREATE INDEX IF NOT EXISTS idx_assignments_task ON task_assignments(task_id);
CREATE INDEX IF NOT EXISTS idx_assignments_bee ON task_assignments(assigned_to, status);
CREATE INDEX IF NOT EXISTS idx_messages_to_bee ON bee_messages(to_bee, processed);
CREATE INDEX IF NOT EXISTS idx_messages_sender_cli ON bee_messages(sender_cli_used);
CREATE INDEX IF NOT EXISTS idx_activity_task ON task_activity(task_id);
CREATE INDEX IF NOT EXISTS idx_injection_pane ON injection_log(target_pane);

CREATE VIEW IF NOT EXISTS active_tasks AS
SELECT t.*,
       (SELECT COUNT(*) FROM task_dependencies d WHERE d.task_id = t.task_id)
           AS dependency_count,
       (SELECT COUNT(*) FROM tasks c WHERE c.parent_task_id = t.task_id)
           AS child_count
FROM tasks t
WHERE t.status IN ('pending', 'in_progress');

CREATE VIEW IF NOT EXISTS pending_messages AS
SELECT * FROM bee_messages
WHERE processed = 0
  AND (expires_at IS NULL OR datetime(expires_at) > datetime('now'))
ORDER BY CASE priority
    WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0
END DESC, created_at ASC;

CREATE VIEW IF NOT EXISTS agent_workload AS
SELECT b.bee_name,
       b.status,
       (SELECT COUNT(*) FROM tasks t
        WHERE t.assigned_to = b.bee_name AND t.status IN ('pending', 'in_progress'))
           AS open_tasks,
       (SELECT COUNT(*) FROM task_assignments a
        WHERE a.assigned_to = b.bee_name AND a.status = 'active')
           AS active_assignments
FROM bee_states b;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;

    fn make_task(created_by: BeeName) -> Task {
        Task::new("Test task", "A task for testing", created_by)
    }

    #[test]
    fn test_init_seeds_agent_states() {
        let env = TestEnv::new();
        let store = env.open_store();
        let states = store.list_states().unwrap();
        assert_eq!(states.len(), 4);
        assert!(states.iter().all(|s| s.status == AgentStatus::Idle));
        let names: Vec<BeeName> = states.iter().map(|s| s.bee_name).collect();
        assert_eq!(names, BeeName::REAL.to_vec());
    }

    #[test]
    fn test_init_is_idempotent() {
        let env = TestEnv::new();
        Store::init(&env.db_path()).unwrap();
        Store::init(&env.db_path()).unwrap();
        let store = env.open_store();
        assert_eq!(store.list_states().unwrap().len(), 4);
    }

    #[test]
    fn test_open_missing_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.db");
        assert!(matches!(Store::open(&missing), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_schema_too_new_aborts() {
        let env = TestEnv::new();
        {
            let store = env.open_store();
            store
                .conn
                .pragma_update(None, "user_version", 99)
                .unwrap();
        }
        match Store::open(&env.db_path()) {
            Err(Error::SchemaTooNew { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected SchemaTooNew, got {other:?}"),
        }
    }

    #[test]
    fn test_create_and_get_task() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::Beekeeper);
        store.create_task(&task, &[], BeeName::System).unwrap();

        let loaded = store.get_task(&task.task_id).unwrap();
        assert_eq!(loaded.title, "Test task");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.created_by, BeeName::Beekeeper);

        // Exactly one 'created' activity row
        let activity = store.recent_activity(Some(&task.task_id), 10).unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].activity_type, "created");
    }

    #[test]
    fn test_create_task_rejects_empty_title() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::System);
        task.title = "   ".to_string();
        assert!(matches!(
            store.create_task(&task, &[], BeeName::System),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_create_task_with_initial_assignee() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::Beekeeper);
        task.assigned_to = Some(BeeName::Queen);
        store.create_task(&task, &[], BeeName::Beekeeper).unwrap();

        let loaded = store.get_task(&task.task_id).unwrap();
        assert_eq!(loaded.assigned_to, Some(BeeName::Queen));

        let assignments = store.assignments_for(&task.task_id).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].assigned_to, BeeName::Queen);
        assert_eq!(assignments[0].role, AssignmentRole::Primary);
        assert_eq!(assignments[0].status, "active");

        // created + assignment_change
        let activity = store.recent_activity(Some(&task.task_id), 10).unwrap();
        assert_eq!(activity.len(), 2);
        let types: Vec<&str> = activity.iter().map(|a| a.activity_type.as_str()).collect();
        assert!(types.contains(&"created"));
        assert!(types.contains(&"assignment_change"));
    }

    #[test]
    fn test_create_task_rejects_synthetic_assignee() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::System);
        task.assigned_to = Some(BeeName::Beekeeper);
        assert!(store.create_task(&task, &[], BeeName::System).is_err());
    }

    #[test]
    fn test_create_task_missing_parent() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::System);
        task.parent_task_id = Some("no-such-task".to_string());
        assert!(matches!(
            store.create_task(&task, &[], BeeName::System),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_list_tasks_filters() {
        let env = TestEnv::new();
        let mut store = env.open_store();

        let mut a = make_task(BeeName::System);
        a.priority = TaskPriority::High;
        a.assigned_to = Some(BeeName::Developer);
        store.create_task(&a, &[], BeeName::System).unwrap();

        let b = make_task(BeeName::System);
        store.create_task(&b, &[], BeeName::System).unwrap();

        let all = store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        // High priority sorts first
        assert_eq!(all[0].task_id, a.task_id);

        let filtered = store
            .list_tasks(&TaskFilter {
                assigned_to: Some(BeeName::Developer),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].task_id, a.task_id);

        let none = store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_set_status_sets_timestamps() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();

        let t = store
            .set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert!(t.started_at.is_some());
        assert!(t.completed_at.is_none());

        let t = store
            .set_status(
                &task.task_id,
                TaskStatus::InProgress,
                TaskStatus::Completed,
                BeeName::Developer,
                Some("done"),
            )
            .unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.completed_at.is_some());
        assert!(t.completed_at.unwrap() >= t.started_at.unwrap());
    }

    #[test]
    fn test_set_status_appends_activity() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();

        store
            .set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();

        let activity = store.recent_activity(Some(&task.task_id), 10).unwrap();
        let change = activity
            .iter()
            .find(|a| a.activity_type == "status_change")
            .unwrap();
        assert_eq!(change.old_value.as_deref(), Some("pending"));
        assert_eq!(change.new_value.as_deref(), Some("in_progress"));
        assert_eq!(change.bee_name, BeeName::Queen);
    }

    #[test]
    fn test_set_status_noop_rejected() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();

        assert!(matches!(
            store.set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::Pending,
                BeeName::System,
                None,
            ),
            Err(Error::NoOpTransition(TaskStatus::Pending))
        ));
    }

    #[test]
    fn test_set_status_invalid_transition() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();

        assert!(matches!(
            store.set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::Completed,
                BeeName::System,
                None,
            ),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_set_status_conflicting_transition() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();

        // Another writer moved the task first.
        store
            .set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();

        // A caller holding the stale 'pending' snapshot loses.
        assert!(matches!(
            store.set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                BeeName::System,
                None,
            ),
            Err(Error::ConflictingTransition)
        ));
    }

    #[test]
    fn test_dependency_gating() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let blocker = make_task(BeeName::System);
        store.create_task(&blocker, &[], BeeName::System).unwrap();

        let blocked = make_task(BeeName::System);
        store
            .create_task(
                &blocked,
                &[(blocker.task_id.clone(), DependencyType::Blocks)],
                BeeName::System,
            )
            .unwrap();

        match store.set_status(
            &blocked.task_id,
            TaskStatus::Pending,
            TaskStatus::InProgress,
            BeeName::Queen,
            None,
        ) {
            Err(Error::DependencyUnmet { blockers, .. }) => {
                assert_eq!(blockers, vec![blocker.task_id.clone()]);
            }
            other => panic!("expected DependencyUnmet, got {other:?}"),
        }

        // Complete the blocker, then the transition goes through.
        store
            .set_status(
                &blocker.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();
        store
            .set_status(
                &blocker.task_id,
                TaskStatus::InProgress,
                TaskStatus::Completed,
                BeeName::Queen,
                None,
            )
            .unwrap();
        store
            .set_status(
                &blocked.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_related_dependency_does_not_gate() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let other = make_task(BeeName::System);
        store.create_task(&other, &[], BeeName::System).unwrap();

        let task = make_task(BeeName::System);
        store
            .create_task(
                &task,
                &[(other.task_id.clone(), DependencyType::Related)],
                BeeName::System,
            )
            .unwrap();

        store
            .set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_cycle_detection() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let a = make_task(BeeName::System);
        let b = make_task(BeeName::System);
        let c = make_task(BeeName::System);
        store.create_task(&a, &[], BeeName::System).unwrap();
        store.create_task(&b, &[], BeeName::System).unwrap();
        store.create_task(&c, &[], BeeName::System).unwrap();

        store
            .add_dependency(&a.task_id, &b.task_id, DependencyType::Blocks)
            .unwrap();
        store
            .add_dependency(&b.task_id, &c.task_id, DependencyType::Blocks)
            .unwrap();

        // c -> a would close the loop
        assert!(matches!(
            store.add_dependency(&c.task_id, &a.task_id, DependencyType::Blocks),
            Err(Error::CycleDetected)
        ));

        // self-dependency
        assert!(store
            .add_dependency(&a.task_id, &a.task_id, DependencyType::Blocks)
            .is_err());
    }

    #[test]
    fn test_duplicate_dependency_rejected() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let a = make_task(BeeName::System);
        let b = make_task(BeeName::System);
        store.create_task(&a, &[], BeeName::System).unwrap();
        store.create_task(&b, &[], BeeName::System).unwrap();

        store
            .add_dependency(&a.task_id, &b.task_id, DependencyType::Blocks)
            .unwrap();
        assert!(store
            .add_dependency(&a.task_id, &b.task_id, DependencyType::Blocks)
            .is_err());
    }

    #[test]
    fn test_set_assignee_reassignment() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::Beekeeper);
        task.assigned_to = Some(BeeName::Queen);
        store.create_task(&task, &[], BeeName::Beekeeper).unwrap();

        store
            .set_assignee(
                &task.task_id,
                BeeName::Developer,
                BeeName::Queen,
                AssignmentRole::Primary,
                None,
            )
            .unwrap();

        let loaded = store.get_task(&task.task_id).unwrap();
        assert_eq!(loaded.assigned_to, Some(BeeName::Developer));

        let assignments = store.assignments_for(&task.task_id).unwrap();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].status, "reassigned");
        assert_eq!(assignments[1].status, "active");
        assert_eq!(assignments[1].assigned_to, BeeName::Developer);
    }

    #[test]
    fn test_set_assignee_same_bee_rejected() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::Beekeeper);
        task.assigned_to = Some(BeeName::Queen);
        store.create_task(&task, &[], BeeName::Beekeeper).unwrap();

        assert!(matches!(
            store.set_assignee(
                &task.task_id,
                BeeName::Queen,
                BeeName::System,
                AssignmentRole::Primary,
                None,
            ),
            Err(Error::AlreadyAssigned(_))
        ));
    }

    #[test]
    fn test_reviewer_does_not_displace_primary() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::Beekeeper);
        task.assigned_to = Some(BeeName::Developer);
        store.create_task(&task, &[], BeeName::Beekeeper).unwrap();

        store
            .set_assignee(
                &task.task_id,
                BeeName::Qa,
                BeeName::Queen,
                AssignmentRole::Reviewer,
                Some("please review"),
            )
            .unwrap();

        let loaded = store.get_task(&task.task_id).unwrap();
        assert_eq!(loaded.assigned_to, Some(BeeName::Developer));

        let assignments = store.assignments_for(&task.task_id).unwrap();
        assert_eq!(assignments.len(), 2);
        assert!(assignments
            .iter()
            .any(|a| a.role == AssignmentRole::Reviewer && a.assigned_to == BeeName::Qa));
    }

    #[test]
    fn test_enqueue_and_dequeue_messages() {
        let env = TestEnv::new();
        let mut store = env.open_store();

        let id1 = store
            .enqueue_message(&NewMessage::new(
                BeeName::System,
                BeeName::Queen,
                MessageType::Info,
                "first",
            ))
            .unwrap();
        let mut urgent = NewMessage::new(
            BeeName::System,
            BeeName::Queen,
            MessageType::Alert,
            "second",
        );
        urgent.priority = MessagePriority::Urgent;
        let id2 = store.enqueue_message(&urgent).unwrap();

        assert!(id2 > id1);

        // Urgent sorts first despite arriving later.
        let messages = store
            .dequeue_messages(BeeName::Queen, false, None)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_id, id2);
        assert_eq!(messages[1].message_id, id1);
    }

    #[test]
    fn test_message_rejects_empty_content() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        assert!(store
            .enqueue_message(&NewMessage::new(
                BeeName::System,
                BeeName::Queen,
                MessageType::Info,
                "  ",
            ))
            .is_err());
    }

    #[test]
    fn test_message_rejects_broadcast_row() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        assert!(store
            .enqueue_message(&NewMessage::new(
                BeeName::System,
                BeeName::All,
                MessageType::Info,
                "hello",
            ))
            .is_err());
    }

    #[test]
    fn test_mark_processed_idempotent() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let id = store
            .enqueue_message(&NewMessage::new(
                BeeName::System,
                BeeName::Queen,
                MessageType::Info,
                "hello",
            ))
            .unwrap();

        store.mark_processed(id).unwrap();
        let first = store.get_message(id).unwrap();
        assert!(first.processed);
        let first_at = first.processed_at.unwrap();

        store.mark_processed(id).unwrap();
        let second = store.get_message(id).unwrap();
        assert_eq!(second.processed_at.unwrap(), first_at);
    }

    #[test]
    fn test_expired_messages_not_dequeued() {
        let env = TestEnv::new();
        let mut store = env.open_store();

        let mut expired = NewMessage::new(
            BeeName::System,
            BeeName::Queen,
            MessageType::Info,
            "too late",
        );
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(10));
        let expired_id = store.enqueue_message(&expired).unwrap();

        let mut fresh = NewMessage::new(
            BeeName::System,
            BeeName::Queen,
            MessageType::Info,
            "on time",
        );
        fresh.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        let fresh_id = store.enqueue_message(&fresh).unwrap();

        let messages = store
            .dequeue_messages(BeeName::Queen, false, None)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, fresh_id);

        // Expired and unprocessed: invisible even in the history view.
        let all = store.dequeue_messages(BeeName::Queen, true, None).unwrap();
        assert!(!all.iter().any(|m| m.message_id == expired_id));

        // Once reaped (processed), it shows up in the history view.
        store.reap_expired_messages().unwrap();
        let all = store.dequeue_messages(BeeName::Queen, true, None).unwrap();
        assert!(all.iter().any(|m| m.message_id == expired_id));
    }

    #[test]
    fn test_reap_expired_messages() {
        let env = TestEnv::new();
        let mut store = env.open_store();

        let mut expired = NewMessage::new(
            BeeName::System,
            BeeName::Queen,
            MessageType::Info,
            "too late",
        );
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(10));
        let id = store.enqueue_message(&expired).unwrap();

        let reaped = store.reap_expired_messages().unwrap();
        assert_eq!(reaped, 1);

        let msg = store.get_message(id).unwrap();
        assert!(msg.processed);
        assert!(msg.processed_at.is_some());

        // Second sweep finds nothing
        assert_eq!(store.reap_expired_messages().unwrap(), 0);
    }

    #[test]
    fn test_violations_since() {
        let env = TestEnv::new();
        let mut store = env.open_store();

        let mut illicit = NewMessage::new(
            BeeName::Developer,
            BeeName::Queen,
            MessageType::Info,
            "psst",
        );
        illicit.sender_cli_used = false;
        let id = store.enqueue_message(&illicit).unwrap();

        // Sanctioned traffic and synthetic senders are not violations.
        store
            .enqueue_message(&NewMessage::new(
                BeeName::Qa,
                BeeName::Queen,
                MessageType::Info,
                "hi",
            ))
            .unwrap();
        let mut synthetic = NewMessage::new(
            BeeName::System,
            BeeName::Queen,
            MessageType::Info,
            "sys",
        );
        synthetic.sender_cli_used = false;
        store.enqueue_message(&synthetic).unwrap();

        let violations = store.violations_since(0).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].message_id, id);
        assert_eq!(violations[0].from_bee, BeeName::Developer);

        // Nothing new after the cursor
        assert!(store.violations_since(id).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_state_partial() {
        let env = TestEnv::new();
        let mut store = env.open_store();

        store
            .upsert_state(
                BeeName::Developer,
                &AgentStatePatch {
                    status: Some(AgentStatus::Busy),
                    workload_score: Some(60.0),
                    ..Default::default()
                },
            )
            .unwrap();

        let state = store.get_state(BeeName::Developer).unwrap();
        assert_eq!(state.status, AgentStatus::Busy);
        assert_eq!(state.workload_score, 60.0);
        // Untouched field keeps its seed value
        assert_eq!(state.performance_score, 100.0);
    }

    #[test]
    fn test_upsert_state_clears_task() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();

        store
            .upsert_state(
                BeeName::Qa,
                &AgentStatePatch {
                    current_task_id: Some(Some(task.task_id.clone())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            store.get_state(BeeName::Qa).unwrap().current_task_id,
            Some(task.task_id.clone())
        );

        store
            .upsert_state(
                BeeName::Qa,
                &AgentStatePatch {
                    current_task_id: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.get_state(BeeName::Qa).unwrap().current_task_id, None);
    }

    #[test]
    fn test_touch_heartbeat() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let before = store.get_state(BeeName::Analyst).unwrap().last_heartbeat;
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.touch_heartbeat(BeeName::Analyst).unwrap();
        let after = store.get_state(BeeName::Analyst).unwrap().last_heartbeat;
        assert!(after > before);
    }

    #[test]
    fn test_activity_append_only_counter() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();
        let count1 = store.activity_count().unwrap();

        store
            .set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();
        let count2 = store.activity_count().unwrap();
        assert!(count2 > count1);

        // Failed operations never decrease the count.
        let _ = store.set_status(
            &task.task_id,
            TaskStatus::Pending,
            TaskStatus::Cancelled,
            BeeName::Queen,
            None,
        );
        assert_eq!(store.activity_count().unwrap(), count2);
    }

    #[test]
    fn test_injection_log_roundtrip() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let id = store
            .append_injection(&NewInjection {
                session_name: "beehive",
                target_pane: "beehive:0",
                payload: "hello queen",
                message_type: Some("info"),
                sender: Some("system"),
                metadata: Some(serde_json::json!({"to_bee": "queen"})),
                dry_run: false,
                outcome: "delivered",
            })
            .unwrap();
        assert!(id > 0);

        let entries = store.recent_injections(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "delivered");
        assert_eq!(entries[0].target_pane, "beehive:0");
        assert!(!entries[0].dry_run);
    }

    #[test]
    fn test_active_tasks_view() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let blocker = make_task(BeeName::System);
        store.create_task(&blocker, &[], BeeName::System).unwrap();

        let mut child = make_task(BeeName::System);
        child.parent_task_id = Some(blocker.task_id.clone());
        store
            .create_task(
                &child,
                &[(blocker.task_id.clone(), DependencyType::Blocks)],
                BeeName::System,
            )
            .unwrap();

        let rows = store.active_tasks().unwrap();
        assert_eq!(rows.len(), 2);
        let parent_row = rows.iter().find(|r| r.task_id == blocker.task_id).unwrap();
        assert_eq!(parent_row.child_count, 1);
        assert_eq!(parent_row.dependency_count, 0);
        let child_row = rows.iter().find(|r| r.task_id == child.task_id).unwrap();
        assert_eq!(child_row.dependency_count, 1);
    }

    #[test]
    fn test_agent_workload_view() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let mut task = make_task(BeeName::System);
        task.assigned_to = Some(BeeName::Developer);
        store.create_task(&task, &[], BeeName::System).unwrap();

        let rows = store.agent_workload().unwrap();
        assert_eq!(rows.len(), 4);
        let dev = rows
            .iter()
            .find(|r| r.bee_name == BeeName::Developer)
            .unwrap();
        assert_eq!(dev.open_tasks, 1);
        assert_eq!(dev.active_assignments, 1);
        let qa = rows.iter().find(|r| r.bee_name == BeeName::Qa).unwrap();
        assert_eq!(qa.open_tasks, 0);
    }

    #[test]
    fn test_message_stats() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        store
            .enqueue_message(&NewMessage::new(
                BeeName::System,
                BeeName::Queen,
                MessageType::Info,
                "a",
            ))
            .unwrap();
        let mut illicit =
            NewMessage::new(BeeName::Developer, BeeName::Queen, MessageType::Info, "b");
        illicit.sender_cli_used = false;
        store.enqueue_message(&illicit).unwrap();

        let stats = store.message_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.sender_cli_used, 1);
        assert!((stats.sender_cli_usage_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_status_counts() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let a = make_task(BeeName::System);
        store.create_task(&a, &[], BeeName::System).unwrap();
        let b = make_task(BeeName::System);
        store.create_task(&b, &[], BeeName::System).unwrap();
        store
            .set_status(
                &b.task_id,
                TaskStatus::Pending,
                TaskStatus::InProgress,
                BeeName::Queen,
                None,
            )
            .unwrap();

        let counts = store.status_counts().unwrap();
        let pending = counts
            .iter()
            .find(|(s, _)| *s == TaskStatus::Pending)
            .unwrap()
            .1;
        let in_progress = counts
            .iter()
            .find(|(s, _)| *s == TaskStatus::InProgress)
            .unwrap()
            .1;
        assert_eq!(pending, 1);
        assert_eq!(in_progress, 1);
    }

    #[test]
    fn test_failed_retry_path() {
        let env = TestEnv::new();
        let mut store = env.open_store();
        let task = make_task(BeeName::System);
        store.create_task(&task, &[], BeeName::System).unwrap();

        store
            .set_status(
                &task.task_id,
                TaskStatus::Pending,
                TaskStatus::Failed,
                BeeName::System,
                Some("spawn error"),
            )
            .unwrap();
        let t = store.get_task(&task.task_id).unwrap();
        assert!(t.completed_at.is_some());

        // failed -> pending reopens and clears completed_at
        let t = store
            .set_status(
                &task.task_id,
                TaskStatus::Failed,
                TaskStatus::Pending,
                BeeName::Queen,
                Some("retrying"),
            )
            .unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.completed_at.is_none());
    }
}
