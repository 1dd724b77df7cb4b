//! Beehive - a multi-agent orchestrator for tmux-hosted LLM CLI workers.
//!
//! This library provides the core functionality for the `hive` CLI tool:
//! a durable task/message store, a structured message bus that injects
//! text into tmux panes, a task lifecycle engine, and a supervisor that
//! keeps the worker processes (bees) alive and on-script.

pub mod bus;
pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod injector;
pub mod models;
pub mod roles;
pub mod store;
pub mod supervisor;
pub mod tmux;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::models::TaskStatus;
use crate::tmux::TransportError;

/// Cooperative cancellation flag shared between the daemon loop and
/// long-running operations.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Library-level error type for Beehive operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown bee name: {0}")]
    InvalidName(String),

    #[error("no pane mapped for bee: {0}")]
    InvalidPane(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("not initialized: run `hive init` first")]
    NotInitialized,

    #[error("session already running: {0} (use --force to recreate)")]
    AlreadyRunning(String),

    #[error("session not running: {0} (run `hive init` first)")]
    SessionNotRunning(String),

    #[error("database busy: {0}")]
    StoreTransient(String),

    #[error("database unavailable after {attempts} attempts: {detail}")]
    StoreUnavailable { attempts: u32, detail: String },

    #[error("integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("cycle detected in task dependencies")]
    CycleDetected,

    #[error("task {task_id} has unmet blocking dependencies: {blockers:?}")]
    DependencyUnmet {
        task_id: String,
        blockers: Vec<String>,
    },

    #[error("transition to the current status is a no-op: {0}")]
    NoOpTransition(TaskStatus),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("conflicting transition: task was modified concurrently")]
    ConflictingTransition,

    #[error("task already has this primary assignee: {0}")]
    AlreadyAssigned(String),

    #[error("no worker has spare capacity for auto-assignment")]
    NoCapacity,

    #[error("role injection not acknowledged by: {}", bees.join(", "))]
    RoleAckTimeout { bees: Vec<String> },

    #[error("schema version {found} is newer than this binary supports ({supported})")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable kind string, printed alongside the human
    /// message so scripts can dispatch without parsing prose.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::InvalidInput(_) | Error::InvalidName(_) | Error::InvalidPane(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::NotInitialized => "not_initialized",
            Error::AlreadyRunning(_) => "already_running",
            Error::SessionNotRunning(_) => "session_not_running",
            Error::StoreTransient(_) => "store_transient",
            Error::StoreUnavailable { .. } => "store_unavailable",
            Error::StoreIntegrity(_) => "store_integrity",
            Error::Database(_) => "database",
            Error::Transport(_) => "transport",
            Error::CycleDetected => "cyclic_dependency",
            Error::DependencyUnmet { .. } => "dependency_unmet",
            Error::NoOpTransition(_) => "noop_transition",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::ConflictingTransition => "conflicting_transition",
            Error::AlreadyAssigned(_) => "already_assigned",
            Error::NoCapacity => "no_capacity",
            Error::RoleAckTimeout { .. } => "role_ack_timeout",
            Error::SchemaTooNew { .. } => "schema_too_new",
            Error::Cancelled => "cancelled",
            Error::Other(_) => "other",
        }
    }

    /// Process exit code for the CLI: 0 success, 1 generic error,
    /// 2 precondition violation, 3 external dependency failure,
    /// 4 role injection timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotInitialized
            | Error::AlreadyRunning(_)
            | Error::SessionNotRunning(_)
            | Error::InvalidInput(_)
            | Error::InvalidName(_)
            | Error::SchemaTooNew { .. } => 2,
            Error::Transport(_) | Error::StoreUnavailable { .. } => 3,
            Error::RoleAckTimeout { .. } => 4,
            _ => 1,
        }
    }

    /// Whether a caller-side retry can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreTransient(_))
    }
}

/// Classify SQLite failures per the error taxonomy: busy/locked faults
/// are transient and retryable, constraint violations indicate a logic
/// bug or stale input and must not be retried.
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(e, msg) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Error::StoreTransient(msg.clone().unwrap_or_else(|| e.to_string()))
                }
                ErrorCode::ConstraintViolation => {
                    Error::StoreIntegrity(msg.clone().unwrap_or_else(|| e.to_string()))
                }
                _ => Error::Database(err),
            },
            _ => Error::Database(err),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

/// Result type alias for Beehive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Test utilities for isolated hive environments.
#[cfg(test)]
pub(crate) mod test_utils {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::bus::MessageBus;
    use crate::config::HiveConfig;
    use crate::engine::TaskEngine;
    use crate::injector::Injector;
    use crate::store::Store;
    use crate::tmux::RecordingMux;

    /// Test environment with an isolated hive directory and a recording
    /// fake multiplexer in place of tmux.
    pub struct TestEnv {
        /// Isolated hive directory (holds the database)
        pub hive_dir: TempDir,
        /// Configuration pointing into `hive_dir`
        pub config: HiveConfig,
        /// Fake multiplexer shared by every component built from this env
        pub mux: Arc<RecordingMux>,
    }

    impl TestEnv {
        /// Create a new test environment with an initialized store.
        pub fn new() -> Self {
            let hive_dir = TempDir::new().unwrap();
            let mut config = HiveConfig::default();
            config.hive_dir = hive_dir.path().to_path_buf();
            config.db_path = PathBuf::from("hive_memory.db");
            // No confirm delay in tests; nothing is typing on the far end.
            config.confirm_delay_ms = 0;
            Store::init(&config.database_path()).unwrap();
            Self {
                hive_dir,
                config,
                mux: Arc::new(RecordingMux::new()),
            }
        }

        pub fn db_path(&self) -> PathBuf {
            self.config.database_path()
        }

        #[allow(dead_code)]
        pub fn path(&self) -> &Path {
            self.hive_dir.path()
        }

        pub fn open_store(&self) -> Store {
            Store::open(&self.db_path()).unwrap()
        }

        pub fn injector(&self) -> Injector {
            Injector::new(self.open_store(), self.mux.clone(), &self.config)
        }

        pub fn bus(&self) -> MessageBus {
            MessageBus::new(self.open_store(), self.injector(), &self.config)
        }

        pub fn engine(&self) -> TaskEngine {
            TaskEngine::new(self.open_store(), self.bus())
        }
    }

    impl Default for TestEnv {
        fn default() -> Self {
            Self::new()
        }
    }
}
