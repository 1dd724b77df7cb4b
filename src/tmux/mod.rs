//! Tmux integration.
//!
//! The multiplexer is an external service: it exposes "send text to a
//! pane" and session create/destroy primitives, nothing more. The
//! [`Multiplexer`] trait captures exactly that surface so the rest of
//! the crate never shells out to tmux directly, and tests can substitute
//! the recording fake.

pub mod command;

use std::process::Command;

use command::TmuxCommand;

/// Classified failure of a multiplexer primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("pane not found: {0}")]
    PaneNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("multiplexer error: {0}")]
    Transport(String),
}

impl TransportError {
    /// Outcome string recorded in the injection log.
    pub fn outcome(&self) -> &'static str {
        match self {
            TransportError::PaneNotFound(_) => "pane_not_found",
            TransportError::SessionNotFound(_) => "session_not_found",
            TransportError::Transport(_) => "transport_error",
        }
    }
}

/// Result alias for multiplexer primitives.
pub type MuxResult<T> = std::result::Result<T, TransportError>;

/// The external multiplexer surface the orchestrator depends on.
pub trait Multiplexer: Send + Sync {
    /// Type literal text into a pane without submitting it.
    fn send_text(&self, target: &str, text: &str) -> MuxResult<()>;

    /// Press Enter in a pane, submitting the typed text.
    fn send_enter(&self, target: &str) -> MuxResult<()>;

    /// Whether the session exists.
    fn has_session(&self, session: &str) -> MuxResult<bool>;

    /// Create a detached session whose first window has the given name.
    fn create_session(&self, session: &str, first_window: &str) -> MuxResult<()>;

    /// Add a named window to a session.
    fn new_window(&self, session: &str, window: &str) -> MuxResult<()>;

    /// Tear down a session and everything in it.
    fn kill_session(&self, session: &str) -> MuxResult<()>;

    /// Read the last `lines` lines of a pane.
    fn capture_pane(&self, target: &str, lines: u32) -> MuxResult<String>;
}

/// Real tmux-backed multiplexer.
#[derive(Debug, Default)]
pub struct TmuxMultiplexer;

impl TmuxMultiplexer {
    pub fn new() -> Self {
        Self
    }

    /// Run a tmux command, classifying failures from stderr.
    fn run(&self, cmd: &TmuxCommand, target: &str) -> MuxResult<String> {
        let args = cmd.args();
        let output = Command::new(&args[0])
            .args(&args[1..])
            .output()
            .map_err(|e| TransportError::Transport(format!("failed to run tmux: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        Err(classify_stderr(&stderr, target))
    }
}

/// Map tmux stderr to a classified error for the given target.
fn classify_stderr(stderr: &str, target: &str) -> TransportError {
    if stderr.contains("can't find pane") || stderr.contains("can't find window") {
        TransportError::PaneNotFound(target.to_string())
    } else if stderr.contains("no server running")
        || stderr.contains("can't find session")
        || stderr.contains("no such session")
        || stderr.contains("session not found")
    {
        TransportError::SessionNotFound(target.to_string())
    } else {
        TransportError::Transport(stderr.trim().to_string())
    }
}

impl Multiplexer for TmuxMultiplexer {
    fn send_text(&self, target: &str, text: &str) -> MuxResult<()> {
        self.run(&TmuxCommand::send_keys(target, text, true), target)?;
        Ok(())
    }

    fn send_enter(&self, target: &str) -> MuxResult<()> {
        self.run(&TmuxCommand::send_enter(target), target)?;
        Ok(())
    }

    fn has_session(&self, session: &str) -> MuxResult<bool> {
        match self.run(&TmuxCommand::has_session(session), session) {
            Ok(_) => Ok(true),
            Err(TransportError::SessionNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_session(&self, session: &str, first_window: &str) -> MuxResult<()> {
        self.run(&TmuxCommand::new_session(session, first_window), session)?;
        Ok(())
    }

    fn new_window(&self, session: &str, window: &str) -> MuxResult<()> {
        self.run(&TmuxCommand::new_window(session, window), session)?;
        Ok(())
    }

    fn kill_session(&self, session: &str) -> MuxResult<()> {
        self.run(&TmuxCommand::kill_session(session), session)?;
        Ok(())
    }

    fn capture_pane(&self, target: &str, lines: u32) -> MuxResult<String> {
        self.run(&TmuxCommand::capture_pane(target, lines), target)
    }
}

/// Recording fake used by the test suite in place of a live tmux.
///
/// Records every primitive call and lets tests configure per-pane
/// failures and canned `capture-pane` output.
#[cfg(test)]
pub struct RecordingMux {
    state: std::sync::Mutex<RecordingState>,
}

#[cfg(test)]
#[derive(Default)]
struct RecordingState {
    /// (target, text) for every send_text call, in order
    sends: Vec<(String, String)>,
    /// targets of send_enter calls, in order
    enters: Vec<String>,
    sessions: std::collections::HashSet<String>,
    windows: Vec<(String, String)>,
    killed: Vec<String>,
    failing_panes: std::collections::HashSet<String>,
    capture_output: std::collections::HashMap<String, String>,
}

#[cfg(test)]
impl RecordingMux {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(RecordingState::default()),
        }
    }

    /// Make every primitive targeting this pane fail with PaneNotFound.
    pub fn fail_pane(&self, target: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_panes
            .insert(target.to_string());
    }

    /// Set the canned capture-pane output for a target.
    pub fn set_capture(&self, target: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .capture_output
            .insert(target.to_string(), output.to_string());
    }

    /// All (target, text) chunks sent so far, in call order.
    pub fn sends(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().sends.clone()
    }

    /// Text chunks sent to one target, in call order.
    pub fn sends_to(&self, target: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sends
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Number of Enter presses on one target.
    pub fn enters_to(&self, target: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .enters
            .iter()
            .filter(|t| *t == target)
            .count()
    }

    /// Windows created, in order.
    pub fn windows(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().windows.clone()
    }

    /// Sessions passed to kill_session, in order.
    pub fn killed_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    /// Pre-create a session so has_session() reports it.
    pub fn add_session(&self, session: &str) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(session.to_string());
    }
}

#[cfg(test)]
impl Multiplexer for RecordingMux {
    fn send_text(&self, target: &str, text: &str) -> MuxResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_panes.contains(target) {
            return Err(TransportError::PaneNotFound(target.to_string()));
        }
        state.sends.push((target.to_string(), text.to_string()));
        Ok(())
    }

    fn send_enter(&self, target: &str) -> MuxResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_panes.contains(target) {
            return Err(TransportError::PaneNotFound(target.to_string()));
        }
        state.enters.push(target.to_string());
        Ok(())
    }

    fn has_session(&self, session: &str) -> MuxResult<bool> {
        Ok(self.state.lock().unwrap().sessions.contains(session))
    }

    fn create_session(&self, session: &str, first_window: &str) -> MuxResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session.to_string());
        state
            .windows
            .push((session.to_string(), first_window.to_string()));
        Ok(())
    }

    fn new_window(&self, session: &str, window: &str) -> MuxResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains(session) {
            return Err(TransportError::SessionNotFound(session.to_string()));
        }
        state
            .windows
            .push((session.to_string(), window.to_string()));
        Ok(())
    }

    fn kill_session(&self, session: &str) -> MuxResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.remove(session) {
            return Err(TransportError::SessionNotFound(session.to_string()));
        }
        state.killed.push(session.to_string());
        Ok(())
    }

    fn capture_pane(&self, target: &str, _lines: u32) -> MuxResult<String> {
        let state = self.state.lock().unwrap();
        if state.failing_panes.contains(target) {
            return Err(TransportError::PaneNotFound(target.to_string()));
        }
        Ok(state
            .capture_output
            .get(target)
            .cloned()
            .unwrap_or_default())
    }
}
