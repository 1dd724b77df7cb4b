//! Bee supervision.
//!
//! The supervisor owns every periodic duty of the hive: liveness
//! classification, role reminders, protocol-violation detection and
//! expired-message reaping run on one tick; heartbeat acceptance,
//! session startup with role injection, and graceful shutdown are its
//! on-demand operations.
//!
//! Duties are isolated: a failure in one is logged and degrades at most
//! that bee's status, it never aborts the sweep or propagates to the
//! caller.

pub mod pid_file;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::bus::{MessageBus, Outbound};
use crate::config::HiveConfig;
use crate::injector::{Injector, SendOptions};
use crate::models::{
    AgentStatePatch, AgentStatus, BeeName, MessagePriority, MessageType, TaskStatus,
};
use crate::roles;
use crate::store::Store;
use crate::tmux::Multiplexer;
use crate::{CancelToken, Error, Result};

/// How often the role-ack poll re-reads the pane during init.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What one supervisor sweep did.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TickReport {
    pub offline_marked: Vec<BeeName>,
    pub reminders_sent: usize,
    pub violations_alerted: usize,
    pub messages_reaped: usize,
    /// Duty failures, logged and carried here for observability
    pub errors: Vec<String>,
}

/// Result of session initialization.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InitReport {
    pub session: String,
    pub bees_started: Vec<BeeName>,
}

/// The long-running supervision component.
pub struct Supervisor {
    store: Store,
    bus: MessageBus,
    injector: Injector,
    mux: Arc<dyn Multiplexer>,
    config: HiveConfig,
    /// Violation-scan cursor: highest message ID already examined
    last_seen_message_id: i64,
    /// Per-offender timestamp of the last violation alert
    last_violation_alert: HashMap<BeeName, DateTime<Utc>>,
    last_remind_at: DateTime<Utc>,
}

impl Supervisor {
    /// Build a supervisor over an initialized hive database.
    pub fn new(config: &HiveConfig, mux: Arc<dyn Multiplexer>) -> Result<Self> {
        let db = config.database_path();
        let timeout = Duration::from_secs(config.db_timeout_secs);
        let open = || Store::open_with_timeout(&db, timeout);

        let injector = Injector::new(open()?, mux.clone(), config);
        let bus_injector =
            Injector::with_limiter(open()?, mux.clone(), config, injector.limiter());
        let bus = MessageBus::new(open()?, bus_injector, config);
        let store = open()?;

        // Scan violations only from here on; restarts do not re-alert
        // on history.
        let last_seen_message_id = store.max_message_id()?;

        Ok(Self {
            store,
            bus,
            injector,
            mux,
            config: config.clone(),
            last_seen_message_id,
            last_violation_alert: HashMap::new(),
            last_remind_at: Utc::now(),
        })
    }

    /// One duty sweep. Never fails; per-duty errors are collected in
    /// the report and logged.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        match self.classify_liveness() {
            Ok(marked) => report.offline_marked = marked,
            Err(e) => {
                tracing::error!(error = %e, "liveness sweep failed");
                report.errors.push(format!("liveness: {e}"));
            }
        }

        let due = Utc::now() - self.last_remind_at
            >= chrono::Duration::seconds(self.config.remind_interval_secs as i64);
        if due {
            match self.send_reminders(None) {
                Ok(count) => report.reminders_sent = count,
                Err(e) => {
                    tracing::error!(error = %e, "reminder sweep failed");
                    report.errors.push(format!("reminders: {e}"));
                }
            }
        }

        match self.detect_violations() {
            Ok(count) => report.violations_alerted = count,
            Err(e) => {
                tracing::error!(error = %e, "violation sweep failed");
                report.errors.push(format!("violations: {e}"));
            }
        }

        match self.store.reap_expired_messages() {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(count, "reaped expired messages");
                }
                report.messages_reaped = count;
            }
            Err(e) => {
                tracing::error!(error = %e, "expiry sweep failed");
                report.errors.push(format!("reaping: {e}"));
            }
        }

        report
    }

    /// Run the tick loop until cancelled. Finishes the current sweep
    /// before exiting.
    pub fn run(&mut self, cancel: &CancelToken) {
        let interval = Duration::from_secs(self.config.tick_interval_secs);
        tracing::info!(interval_secs = self.config.tick_interval_secs, "supervisor loop started");

        while !cancel.is_cancelled() {
            let report = self.tick();
            if !report.errors.is_empty() {
                tracing::warn!(errors = ?report.errors, "tick completed with errors");
            }

            // Sleep in small slices so cancellation is prompt.
            let deadline = Instant::now() + interval;
            while Instant::now() < deadline {
                if cancel.is_cancelled() {
                    tracing::info!("supervisor loop cancelled");
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        tracing::info!("supervisor loop cancelled");
    }

    /// Duty 1: mark bees whose heartbeat is older than `t_silent` as
    /// offline and alert the queen.
    fn classify_liveness(&mut self) -> Result<Vec<BeeName>> {
        let now = Utc::now();
        let mut marked = Vec::new();

        for state in self.store.list_states()? {
            let silent_for = (now - state.last_heartbeat).num_seconds();
            if silent_for < self.config.t_idle_secs {
                continue;
            }
            if silent_for < self.config.t_silent_secs {
                tracing::debug!(bee = %state.bee_name, silent_for, "bee quiet but within threshold");
                continue;
            }
            if matches!(state.status, AgentStatus::Offline | AgentStatus::Error) {
                continue;
            }

            tracing::warn!(bee = %state.bee_name, silent_for, "marking bee offline");
            self.store.upsert_state(
                state.bee_name,
                &AgentStatePatch {
                    status: Some(AgentStatus::Offline),
                    ..Default::default()
                },
            )?;
            let out = Outbound::new(
                BeeName::System,
                BeeName::Queen,
                MessageType::Alert,
                format!(
                    "{} has not sent a heartbeat for {silent_for}s and was marked offline",
                    state.bee_name
                ),
            )
            .subject("Bee offline")
            .priority(MessagePriority::High);
            if let Err(e) = self.bus.send(&out) {
                tracing::warn!(bee = %state.bee_name, error = %e, "offline alert delivery failed");
            }
            marked.push(state.bee_name);
        }

        Ok(marked)
    }

    /// Duty 2: send every bee (or one bee) a `role_injection` reminder
    /// of its identity and current task. Public entry for `hive remind`.
    pub fn send_reminders(&mut self, only: Option<BeeName>) -> Result<usize> {
        let mut sent = 0;
        for state in self.store.list_states()? {
            if let Some(bee) = only {
                if state.bee_name != bee {
                    continue;
                }
            }
            let text = roles::reminder_text(state.bee_name, state.current_task_id.as_deref());
            let out = Outbound::new(
                BeeName::System,
                state.bee_name,
                MessageType::RoleInjection,
                text,
            )
            .subject("Role reminder");
            match self.bus.send(&out) {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!(bee = %state.bee_name, error = %e, "reminder delivery failed");
                }
            }
        }
        self.last_remind_at = Utc::now();
        Ok(sent)
    }

    /// Duty 3: alert the observer about messages that bypassed the
    /// sender CLI, at most once per offender per violation window.
    fn detect_violations(&mut self) -> Result<usize> {
        let cursor = self.store.max_message_id()?;
        let violations = self.store.violations_since(self.last_seen_message_id)?;
        self.last_seen_message_id = cursor;

        let mut alerted = 0;
        let now = Utc::now();
        let window = chrono::Duration::seconds(self.config.violation_window_secs);

        let mut offenders: Vec<(BeeName, i64)> = Vec::new();
        for violation in &violations {
            if !offenders.iter().any(|(bee, _)| *bee == violation.from_bee) {
                offenders.push((violation.from_bee, violation.message_id));
            }
        }

        for (offender, message_id) in offenders {
            if let Some(last) = self.last_violation_alert.get(&offender) {
                if now - *last < window {
                    tracing::debug!(bee = %offender, "violation within alert window, suppressed");
                    continue;
                }
            }

            tracing::warn!(bee = %offender, message_id, "protocol violation detected");
            let out = Outbound::new(
                BeeName::System,
                self.config.observer_bee,
                MessageType::Alert,
                format!(
                    "Protocol violation: {offender} produced message {message_id} \
                     without the sender CLI. All bee communication must go through \
                     `hive send`."
                ),
            )
            .subject("Communication protocol violation")
            .priority(MessagePriority::High);
            if let Err(e) = self.bus.send(&out) {
                tracing::warn!(bee = %offender, error = %e, "violation alert delivery failed");
            }
            self.last_violation_alert.insert(offender, now);
            alerted += 1;
        }

        Ok(alerted)
    }

    /// Duty 5: accept a heartbeat from a bee. Revives `offline`/`error`
    /// bees to `busy` when their current task is running, `idle`
    /// otherwise.
    pub fn heartbeat(&mut self, bee: BeeName) -> Result<AgentStatus> {
        if !bee.is_real() {
            return Err(Error::InvalidName(format!("{bee} cannot heartbeat")));
        }
        self.store.touch_heartbeat(bee)?;

        let state = self.store.get_state(bee)?;
        if !matches!(state.status, AgentStatus::Offline | AgentStatus::Error) {
            return Ok(state.status);
        }

        let revived = match &state.current_task_id {
            Some(task_id) => {
                let active = self
                    .store
                    .get_task(task_id)
                    .map(|t| t.status == TaskStatus::InProgress)
                    .unwrap_or(false);
                if active {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Idle
                }
            }
            None => AgentStatus::Idle,
        };

        tracing::info!(bee = %bee, from = %state.status, to = %revived, "bee revived by heartbeat");
        self.store.upsert_state(
            bee,
            &AgentStatePatch {
                status: Some(revived),
                ..Default::default()
            },
        )?;
        Ok(revived)
    }

    /// Duty 6: create the session, spawn one interactive bee process
    /// per window and inject every role document, then wait for each
    /// bee to print the acknowledgement token.
    pub fn init(&mut self, force: bool) -> Result<InitReport> {
        let session = self.config.session_name.clone();

        if self.mux.has_session(&session)? {
            if !force {
                return Err(Error::AlreadyRunning(session));
            }
            tracing::info!(session = %session, "recreating existing session");
            self.mux.kill_session(&session)?;
        }

        let bees = BeeName::REAL;
        self.mux.create_session(&session, bees[0].as_str())?;
        for bee in &bees[1..] {
            self.mux.new_window(&session, bee.as_str())?;
        }

        // Spawn the interactive bee process by typing its command into
        // each fresh shell.
        let panes = self.config.pane_map();
        for bee in bees {
            let pane = panes.resolve(bee)?;
            self.mux.send_text(pane, &self.config.bee_command)?;
            self.mux.send_enter(pane)?;
        }

        self.inject_roles(None)?;

        let laggards = self.await_role_acks(&bees)?;
        if !laggards.is_empty() {
            for bee in &laggards {
                self.store.upsert_state(
                    *bee,
                    &AgentStatePatch {
                        status: Some(AgentStatus::Error),
                        ..Default::default()
                    },
                )?;
            }
            return Err(Error::RoleAckTimeout {
                bees: laggards.iter().map(|b| b.to_string()).collect(),
            });
        }

        for bee in bees {
            self.store.upsert_state(
                bee,
                &AgentStatePatch {
                    status: Some(AgentStatus::Idle),
                    ..Default::default()
                },
            )?;
            self.store.touch_heartbeat(bee)?;
        }

        tracing::info!(session = %session, "hive initialized");
        Ok(InitReport {
            session,
            bees_started: bees.to_vec(),
        })
    }

    /// Inject role documents into every pane (or one bee's pane).
    /// Role injections go through the injector like any other payload.
    pub fn inject_roles(&mut self, only: Option<BeeName>) -> Result<usize> {
        let roles_dir = self.config.roles_dir();
        let mut injected = 0;
        for bee in BeeName::REAL {
            if let Some(target) = only {
                if bee != target {
                    continue;
                }
            }
            let document = roles::role_document(bee, &roles_dir)?;
            self.injector.send(
                bee,
                &document,
                &SendOptions {
                    message_type: Some(MessageType::RoleInjection.as_str().to_string()),
                    sender: Some(BeeName::System.as_str().to_string()),
                    metadata: Some(serde_json::json!({"role": bee.as_str()})),
                    dry_run: false,
                },
            )?;
            injected += 1;
        }
        Ok(injected)
    }

    /// Poll each bee's pane for the acknowledgement token until the
    /// deadline. Returns the bees that never acknowledged.
    fn await_role_acks(&mut self, bees: &[BeeName]) -> Result<Vec<BeeName>> {
        let panes = self.config.pane_map();
        let deadline = Instant::now() + Duration::from_secs(self.config.role_ack_timeout_secs);
        let token = self.config.role_ack_token.clone();
        let mut pending: Vec<BeeName> = bees.to_vec();

        loop {
            pending.retain(|bee| {
                let pane = match panes.resolve(*bee) {
                    Ok(pane) => pane,
                    Err(_) => return true,
                };
                match self.mux.capture_pane(pane, 50) {
                    Ok(output) => !output.contains(&token),
                    Err(e) => {
                        tracing::debug!(bee = %bee, error = %e, "ack capture failed");
                        true
                    }
                }
            });

            if pending.is_empty() || Instant::now() >= deadline {
                return Ok(pending);
            }
            std::thread::sleep(ACK_POLL_INTERVAL);
        }
    }

    /// Duty 7: graceful shutdown. Sends each bee a termination notice,
    /// then tears down the session; both best-effort.
    pub fn stop(&mut self) -> Result<()> {
        for bee in BeeName::REAL {
            let result = self.injector.send(
                bee,
                "The hive is shutting down. Finish your current thought and stop working.",
                &SendOptions {
                    message_type: Some(MessageType::Notification.as_str().to_string()),
                    sender: Some(BeeName::System.as_str().to_string()),
                    metadata: None,
                    dry_run: false,
                },
            );
            if let Err(e) = result {
                tracing::warn!(bee = %bee, error = %e, "shutdown notice failed");
            }
        }

        match self.mux.kill_session(&self.config.session_name) {
            Ok(()) => tracing::info!(session = %self.config.session_name, "session torn down"),
            Err(e) => {
                tracing::warn!(session = %self.config.session_name, error = %e,
                    "session teardown failed (multiplexer unreachable?)");
            }
        }
        Ok(())
    }
}
