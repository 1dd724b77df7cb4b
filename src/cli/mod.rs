//! CLI argument definitions for the hive orchestrator.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Beehive - drive a hive of tmux-hosted LLM CLI workers.
///
/// The beekeeper uses this binary to run the hive; the bees themselves
/// use the same binary (`hive send`, `hive heartbeat`, `hive task ...`)
/// to talk to each other.
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(author, version, about = "Multi-agent orchestrator for tmux-hosted LLM workers", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Hive directory holding the database, config and pid file.
    /// Can also be set via BEEHIVE_HIVE_DIR.
    #[arg(short = 'd', long = "hive-dir", global = true)]
    pub hive_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the tmux session, spawn the bees and inject their roles
    Init {
        /// Recreate the session if it already exists
        #[arg(long)]
        force: bool,
    },

    /// Re-inject role prompts into running bees
    InjectRoles {
        /// Only this bee (default: all)
        #[arg(long)]
        bee: Option<String>,
    },

    /// Create a task for the queen and hand her the instruction
    StartTask {
        /// The instruction text; the first line becomes the task title
        text: String,
    },

    /// Task management commands
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Send a structured message to a bee (the sender CLI)
    Send {
        /// Recipient bee name, or "all" to broadcast
        to: String,

        /// Message body
        content: String,

        /// Sender name
        #[arg(long, default_value = "beekeeper")]
        from: String,

        /// Message type
        #[arg(long = "type", default_value = "info")]
        message_type: String,

        /// Subject line
        #[arg(long)]
        subject: Option<String>,

        /// Related task ID
        #[arg(long = "task-id")]
        task_id: Option<String>,

        /// Priority (low, normal, high, urgent)
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Message ID this replies to
        #[arg(long = "reply-to")]
        reply_to: Option<i64>,

        /// Log the injection without contacting tmux
        #[arg(long)]
        dry_run: bool,
    },

    /// Record a liveness heartbeat for a bee
    Heartbeat {
        /// Bee name
        bee: String,
    },

    /// Print bee liveness and task counts
    Status,

    /// Read recent pane output for a bee
    Logs {
        /// Bee name (default: queen)
        bee: Option<String>,

        /// Number of lines to capture
        #[arg(long, default_value = "50")]
        lines: u32,
    },

    /// Attach to the tmux session
    Attach,

    /// Force a role reminder sweep now
    Remind {
        /// Only this bee (default: all)
        #[arg(long)]
        bee: Option<String>,
    },

    /// Manage the supervisor daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Gracefully shut down the hive
    Stop {
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a new task
    Create {
        /// Task title
        title: String,

        /// Task description
        #[arg(long)]
        description: String,

        /// Priority (low, medium, high, critical)
        #[arg(short, long, default_value = "medium")]
        priority: String,

        /// Initial assignee
        #[arg(short, long)]
        assignee: Option<String>,

        /// Parent task ID
        #[arg(long)]
        parent: Option<String>,

        /// Task IDs this task is blocked by (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Creator name
        #[arg(long, default_value = "beekeeper")]
        from: String,
    },

    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,

        /// Filter by assignee
        #[arg(long)]
        assignee: Option<String>,

        /// Filter by priority
        #[arg(long)]
        priority: Option<String>,
    },

    /// Show one task with assignments, blockers and recent activity
    Details {
        /// Task ID
        id: String,
    },

    /// Assign a task to a bee (or auto-pick the least-loaded worker)
    Assign {
        /// Task ID
        id: String,

        /// Assignee bee name (omit with --auto)
        assignee: Option<String>,

        /// Pick the least-loaded worker automatically
        #[arg(long)]
        auto: bool,

        /// Who is assigning
        #[arg(long, default_value = "system")]
        assigner: String,

        /// Assignment role (primary, reviewer, collaborator)
        #[arg(long, default_value = "primary")]
        role: String,

        /// Assignment note
        #[arg(long)]
        note: Option<String>,
    },

    /// Change a task's status
    Status {
        /// Task ID
        id: String,

        /// New status (pending, in_progress, completed, failed, cancelled)
        status: String,

        /// Who is making the change
        #[arg(long, default_value = "system")]
        actor: String,

        /// Note recorded with the change
        #[arg(long)]
        note: Option<String>,
    },

    /// Send a task-scoped message to a bee
    Message {
        /// Recipient bee name
        to: String,

        /// Message body
        content: String,

        /// Related task ID
        #[arg(long = "task-id")]
        task_id: Option<String>,

        /// Sender name
        #[arg(long, default_value = "beekeeper")]
        from: String,
    },

    /// Aggregate task and message statistics
    Stats,
}

/// Daemon subcommands
#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Start the supervisor daemon in the background
    Start,

    /// Stop the supervisor daemon
    Stop,

    /// Report whether the daemon is running
    Status,

    /// Restart the supervisor daemon
    Restart,

    /// Force a role reminder sweep through the daemon's store
    Remind {
        /// Only this bee (default: all)
        #[arg(long)]
        bee: Option<String>,
    },

    /// Show recent injection log entries
    Logs {
        /// Number of entries
        n: Option<usize>,
    },

    /// Run the supervisor loop in the foreground (used by `start`)
    #[command(hide = true)]
    Run,
}
