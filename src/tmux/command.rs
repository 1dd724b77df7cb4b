//! Tmux command generation.
//!
//! This module provides a builder for generating tmux CLI command
//! argument vectors. It does not execute commands, only assembles them;
//! execution and outcome classification live in the parent module.

/// Builder for tmux command invocations.
#[derive(Debug, Clone)]
pub struct TmuxCommand {
    args: Vec<String>,
}

impl TmuxCommand {
    fn new(command: &str) -> Self {
        Self {
            args: vec!["tmux".to_string(), command.to_string()],
        }
    }

    fn flag(mut self, flag: &str) -> Self {
        self.args.push(flag.to_string());
        self
    }

    fn flag_with_value(mut self, flag: &str, value: &str) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
        self
    }

    fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Build the command as a display string.
    pub fn build(self) -> String {
        self.args.join(" ")
    }

    /// The arguments as a slice for execution (`args()[0]` is `tmux`).
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Create a new detached session with a named first window.
    ///
    /// # Example
    /// ```
    /// use beehive::tmux::command::TmuxCommand;
    /// let cmd = TmuxCommand::new_session("beehive", "queen");
    /// assert_eq!(cmd.build(), "tmux new-session -d -s beehive -n queen");
    /// ```
    pub fn new_session(session_name: &str, window_name: &str) -> Self {
        Self::new("new-session")
            .flag("-d")
            .flag_with_value("-s", session_name)
            .flag_with_value("-n", window_name)
    }

    /// Create a new window in a session.
    ///
    /// # Example
    /// ```
    /// use beehive::tmux::command::TmuxCommand;
    /// let cmd = TmuxCommand::new_window("beehive", "developer");
    /// assert_eq!(cmd.build(), "tmux new-window -t beehive -n developer");
    /// ```
    pub fn new_window(target_session: &str, window_name: &str) -> Self {
        Self::new("new-window")
            .flag_with_value("-t", target_session)
            .flag_with_value("-n", window_name)
    }

    /// Send keys to a pane.
    ///
    /// With `literal` the text is sent as-is (`-l`), without key-name
    /// interpretation; this is how payload chunks are delivered.
    ///
    /// # Example
    /// ```
    /// use beehive::tmux::command::TmuxCommand;
    /// let cmd = TmuxCommand::send_keys("beehive:0", "echo hello", true);
    /// assert_eq!(cmd.build(), "tmux send-keys -t beehive:0 -l echo hello");
    /// ```
    pub fn send_keys(target: &str, keys: &str, literal: bool) -> Self {
        let mut cmd = Self::new("send-keys").flag_with_value("-t", target);
        if literal {
            cmd = cmd.flag("-l");
        }
        cmd.arg(keys)
    }

    /// Send the Enter key to a pane, submitting whatever was typed.
    pub fn send_enter(target: &str) -> Self {
        Self::new("send-keys")
            .flag_with_value("-t", target)
            .arg("Enter")
    }

    /// Check if a session exists.
    pub fn has_session(session_name: &str) -> Self {
        Self::new("has-session").flag_with_value("-t", session_name)
    }

    /// Kill a session and every process in it.
    pub fn kill_session(session_name: &str) -> Self {
        Self::new("kill-session").flag_with_value("-t", session_name)
    }

    /// Capture the last `lines` lines of a pane to stdout.
    ///
    /// # Example
    /// ```
    /// use beehive::tmux::command::TmuxCommand;
    /// let cmd = TmuxCommand::capture_pane("beehive:1", 50);
    /// assert_eq!(cmd.build(), "tmux capture-pane -p -t beehive:1 -S -50");
    /// ```
    pub fn capture_pane(target: &str, lines: u32) -> Self {
        Self::new("capture-pane")
            .flag("-p")
            .flag_with_value("-t", target)
            .flag_with_value("-S", &format!("-{lines}"))
    }

    /// Attach to an existing session.
    pub fn attach_session(session_name: &str) -> Self {
        Self::new("attach-session").flag_with_value("-t", session_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session() {
        let cmd = TmuxCommand::new_session("beehive", "queen");
        assert_eq!(cmd.build(), "tmux new-session -d -s beehive -n queen");
    }

    #[test]
    fn test_new_window() {
        let cmd = TmuxCommand::new_window("beehive", "qa");
        assert_eq!(cmd.build(), "tmux new-window -t beehive -n qa");
    }

    #[test]
    fn test_send_keys_literal() {
        let cmd = TmuxCommand::send_keys("beehive:0", "hello world", true);
        assert_eq!(cmd.build(), "tmux send-keys -t beehive:0 -l hello world");
    }

    #[test]
    fn test_send_keys_not_literal() {
        let cmd = TmuxCommand::send_keys("beehive:0", "C-c", false);
        assert_eq!(cmd.build(), "tmux send-keys -t beehive:0 C-c");
    }

    #[test]
    fn test_send_keys_preserves_payload_as_single_arg() {
        let cmd = TmuxCommand::send_keys("beehive:0", "line with 'quotes'", true);
        let args = cmd.args();
        assert_eq!(args.last().unwrap(), "line with 'quotes'");
    }

    #[test]
    fn test_send_enter() {
        let cmd = TmuxCommand::send_enter("beehive:2");
        assert_eq!(cmd.build(), "tmux send-keys -t beehive:2 Enter");
    }

    #[test]
    fn test_has_session() {
        let cmd = TmuxCommand::has_session("beehive");
        assert_eq!(cmd.build(), "tmux has-session -t beehive");
    }

    #[test]
    fn test_kill_session() {
        let cmd = TmuxCommand::kill_session("beehive");
        assert_eq!(cmd.build(), "tmux kill-session -t beehive");
    }

    #[test]
    fn test_capture_pane() {
        let cmd = TmuxCommand::capture_pane("beehive:3", 100);
        assert_eq!(cmd.build(), "tmux capture-pane -p -t beehive:3 -S -100");
    }

    #[test]
    fn test_attach_session() {
        let cmd = TmuxCommand::attach_session("beehive");
        assert_eq!(cmd.build(), "tmux attach-session -t beehive");
    }

    #[test]
    fn test_args_accessor() {
        let cmd = TmuxCommand::new_session("hive", "queen");
        assert_eq!(
            cmd.args(),
            &["tmux", "new-session", "-d", "-s", "hive", "-n", "queen"]
        );
    }

    #[test]
    fn test_builder_is_reusable() {
        let cmd = TmuxCommand::has_session("hive");
        let clone = cmd.clone();
        assert_eq!(cmd.build(), clone.build());
    }
}
