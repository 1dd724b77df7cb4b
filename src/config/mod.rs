//! Configuration for the hive.
//!
//! Settings are read from `config.kdl` in the hive directory, overridden
//! by `BEEHIVE_*` environment variables, overridden in turn by CLI flags.
//! The pane-addressing table (bee name -> tmux pane) is part of
//! configuration, not runtime state: it is loaded once at startup and
//! immutable for the life of the process.
//!
//! # KDL Schema
//!
//! ```kdl
//! session-name "beehive"
//! db-path "hive_memory.db"
//! log-level "info"
//! db-timeout 30
//! tick-interval 5
//! remind-interval 300
//! t-idle 120
//! t-silent 600
//! violation-window 60
//! injector-concurrency 4
//! observer-bee "queen"
//! bee-command "claude"
//! chunk-size 4000
//! confirm-delay-ms 1000
//! role-ack-token "ROLE ACCEPTED"
//! role-ack-timeout 30
//! max-tasks-per-bee 3
//! extra-message-types "escalation" "handoff"
//! pane-mapping {
//!     queen "beehive:0"
//!     developer "beehive:1"
//!     qa "beehive:2"
//!     analyst "beehive:3"
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use kdl::KdlDocument;

use crate::models::BeeName;
use crate::{Error, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "BEEHIVE_";

/// Name of the configuration file inside the hive directory.
pub const CONFIG_FILE: &str = "config.kdl";

/// Hive-wide configuration.
///
/// Constructed once at startup and passed explicitly through component
/// constructors; there is no process-wide mutable configuration state.
#[derive(Debug, Clone, PartialEq)]
pub struct HiveConfig {
    /// Base directory for all durable state (database, pid file, roles)
    pub hive_dir: PathBuf,

    /// Database file, resolved against `hive_dir` unless absolute
    pub db_path: PathBuf,

    /// tmux session identifier
    pub session_name: String,

    /// tracing filter directive (e.g. "info", "beehive=debug")
    pub log_level: String,

    /// SQLite busy timeout in seconds
    pub db_timeout_secs: u64,

    /// Supervisor sweep period in seconds
    pub tick_interval_secs: u64,

    /// Role reminder period in seconds
    pub remind_interval_secs: u64,

    /// Liveness: heartbeats older than this are noted (seconds)
    pub t_idle_secs: i64,

    /// Liveness: heartbeats older than this mark the bee offline (seconds)
    pub t_silent_secs: i64,

    /// At most one protocol-violation alert per sender per window (seconds)
    pub violation_window_secs: i64,

    /// Max concurrent injector sends
    pub injector_concurrency: usize,

    /// Recipient of protocol-violation alerts
    pub observer_bee: BeeName,

    /// Interactive command spawned in each pane
    pub bee_command: String,

    /// Injector chunk size in characters
    pub chunk_size: usize,

    /// Pause before the trailing Enter keypress, milliseconds
    pub confirm_delay_ms: u64,

    /// Text pattern a bee must print to acknowledge its role
    pub role_ack_token: String,

    /// Deadline for the role acknowledgement, seconds
    pub role_ack_timeout_secs: u64,

    /// Auto-assignment saturation limit per worker
    pub max_tasks_per_bee: u32,

    /// Additional accepted message types beyond the built-in set
    pub extra_message_types: Vec<String>,

    /// Explicit bee -> pane overrides; unlisted bees get
    /// `<session>:<index>` in pane order
    pub pane_overrides: BTreeMap<String, String>,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            hive_dir: PathBuf::from("hive"),
            db_path: PathBuf::from("hive_memory.db"),
            session_name: "beehive".to_string(),
            log_level: "info".to_string(),
            db_timeout_secs: 30,
            tick_interval_secs: 5,
            remind_interval_secs: 300,
            t_idle_secs: 120,
            t_silent_secs: 600,
            violation_window_secs: 60,
            injector_concurrency: 4,
            observer_bee: BeeName::Queen,
            bee_command: "claude".to_string(),
            chunk_size: 4000,
            confirm_delay_ms: 1000,
            role_ack_token: "ROLE ACCEPTED".to_string(),
            role_ack_timeout_secs: 30,
            max_tasks_per_bee: 3,
            extra_message_types: Vec::new(),
            pane_overrides: BTreeMap::new(),
        }
    }
}

impl HiveConfig {
    /// Load configuration: defaults, then `config.kdl` (if present), then
    /// `BEEHIVE_*` environment variables.
    pub fn load(hive_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = hive_dir {
            config.hive_dir = dir;
        } else if let Ok(dir) = std::env::var(format!("{ENV_PREFIX}HIVE_DIR")) {
            config.hive_dir = PathBuf::from(dir);
        }

        let config_path = config.hive_dir.join(CONFIG_FILE);
        if config_path.exists() {
            let text = fs::read_to_string(&config_path)?;
            config.apply_kdl(&text)?;
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Absolute (or cwd-relative) path to the database file.
    pub fn database_path(&self) -> PathBuf {
        if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            self.hive_dir.join(&self.db_path)
        }
    }

    /// Path to the supervisor daemon pid file.
    pub fn pid_file_path(&self) -> PathBuf {
        self.hive_dir.join("daemon.pid")
    }

    /// Directory holding role prompt overrides.
    pub fn roles_dir(&self) -> PathBuf {
        self.hive_dir.join("roles")
    }

    /// Whether the given message type is acceptable on the bus.
    pub fn accepts_message_type(&self, t: &crate::models::MessageType) -> bool {
        t.is_builtin() || self.extra_message_types.iter().any(|e| e == t.as_str())
    }

    /// Parse a KDL document and overlay its values.
    fn apply_kdl(&mut self, text: &str) -> Result<()> {
        let doc: KdlDocument = text
            .parse()
            .map_err(|e| Error::InvalidInput(format!("config.kdl: {e}")))?;

        if let Some(s) = get_string(&doc, "session-name") {
            self.session_name = s;
        }
        if let Some(s) = get_string(&doc, "db-path") {
            self.db_path = PathBuf::from(s);
        }
        if let Some(s) = get_string(&doc, "log-level") {
            self.log_level = s;
        }
        if let Some(n) = get_integer(&doc, "db-timeout") {
            self.db_timeout_secs = n as u64;
        }
        if let Some(n) = get_integer(&doc, "tick-interval") {
            self.tick_interval_secs = n as u64;
        }
        if let Some(n) = get_integer(&doc, "remind-interval") {
            self.remind_interval_secs = n as u64;
        }
        if let Some(n) = get_integer(&doc, "t-idle") {
            self.t_idle_secs = n;
        }
        if let Some(n) = get_integer(&doc, "t-silent") {
            self.t_silent_secs = n;
        }
        if let Some(n) = get_integer(&doc, "violation-window") {
            self.violation_window_secs = n;
        }
        if let Some(n) = get_integer(&doc, "injector-concurrency") {
            self.injector_concurrency = n as usize;
        }
        if let Some(s) = get_string(&doc, "observer-bee") {
            self.observer_bee = BeeName::parse(&s)?;
        }
        if let Some(s) = get_string(&doc, "bee-command") {
            self.bee_command = s;
        }
        if let Some(n) = get_integer(&doc, "chunk-size") {
            self.chunk_size = n as usize;
        }
        if let Some(n) = get_integer(&doc, "confirm-delay-ms") {
            self.confirm_delay_ms = n as u64;
        }
        if let Some(s) = get_string(&doc, "role-ack-token") {
            self.role_ack_token = s;
        }
        if let Some(n) = get_integer(&doc, "role-ack-timeout") {
            self.role_ack_timeout_secs = n as u64;
        }
        if let Some(n) = get_integer(&doc, "max-tasks-per-bee") {
            self.max_tasks_per_bee = n as u32;
        }
        if let Some(node) = doc.get("extra-message-types") {
            self.extra_message_types = node
                .entries()
                .iter()
                .filter_map(|e| e.value().as_string().map(|s| s.to_string()))
                .collect();
        }
        if let Some(node) = doc.get("pane-mapping") {
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    let bee = child.name().value().to_string();
                    if let Some(pane) = child
                        .entries()
                        .first()
                        .and_then(|e| e.value().as_string())
                    {
                        self.pane_overrides.insert(bee, pane.to_string());
                    }
                }
            }
        }

        Ok(())
    }

    /// Overlay `BEEHIVE_*` environment variables.
    fn apply_env(&mut self) {
        if let Some(s) = env_var("SESSION_NAME") {
            self.session_name = s;
        }
        if let Some(s) = env_var("DB_PATH") {
            self.db_path = PathBuf::from(s);
        }
        if let Some(s) = env_var("LOG_LEVEL") {
            self.log_level = s;
        }
        if let Some(n) = env_parse::<u64>("DB_TIMEOUT") {
            self.db_timeout_secs = n;
        }
        if let Some(n) = env_parse::<u64>("TICK_INTERVAL") {
            self.tick_interval_secs = n;
        }
        if let Some(n) = env_parse::<u64>("REMIND_INTERVAL") {
            self.remind_interval_secs = n;
        }
        if let Some(n) = env_parse::<i64>("T_IDLE") {
            self.t_idle_secs = n;
        }
        if let Some(n) = env_parse::<i64>("T_SILENT") {
            self.t_silent_secs = n;
        }
        if let Some(n) = env_parse::<i64>("VIOLATION_WINDOW") {
            self.violation_window_secs = n;
        }
        if let Some(n) = env_parse::<usize>("INJECTOR_CONCURRENCY") {
            self.injector_concurrency = n;
        }
        if let Some(s) = env_var("OBSERVER_BEE") {
            if let Ok(bee) = BeeName::parse(&s) {
                self.observer_bee = bee;
            }
        }
        if let Some(s) = env_var("BEE_COMMAND") {
            self.bee_command = s;
        }
        if let Some(n) = env_parse::<usize>("CHUNK_SIZE") {
            self.chunk_size = n;
        }
        if let Some(n) = env_parse::<u64>("CONFIRM_DELAY_MS") {
            self.confirm_delay_ms = n;
        }
        if let Some(s) = env_var("ROLE_ACK_TOKEN") {
            self.role_ack_token = s;
        }
        if let Some(n) = env_parse::<u64>("ROLE_ACK_TIMEOUT") {
            self.role_ack_timeout_secs = n;
        }
        if let Some(n) = env_parse::<u32>("MAX_TASKS_PER_BEE") {
            self.max_tasks_per_bee = n;
        }
    }

    /// Check the configuration values for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.session_name.is_empty() {
            return Err(Error::InvalidInput("session-name must not be empty".into()));
        }
        if self.session_name.contains(':') || self.session_name.contains('.') {
            return Err(Error::InvalidInput(
                "session-name must not contain ':' or '.'".into(),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(Error::InvalidInput("tick-interval must be positive".into()));
        }
        if self.t_idle_secs <= 0 || self.t_silent_secs <= 0 {
            return Err(Error::InvalidInput(
                "liveness thresholds must be positive".into(),
            ));
        }
        if self.t_idle_secs >= self.t_silent_secs {
            return Err(Error::InvalidInput(
                "t-idle must be smaller than t-silent".into(),
            ));
        }
        if self.injector_concurrency == 0 {
            return Err(Error::InvalidInput(
                "injector-concurrency must be at least 1".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput("chunk-size must be positive".into()));
        }
        if !self.observer_bee.is_real() {
            return Err(Error::InvalidInput(format!(
                "observer-bee must be a real bee, got {}",
                self.observer_bee
            )));
        }
        for (bee, _) in &self.pane_overrides {
            let name = BeeName::parse(bee)?;
            if !name.is_real() {
                return Err(Error::InvalidInput(format!(
                    "pane-mapping entry for non-real bee: {bee}"
                )));
            }
        }
        Ok(())
    }

    /// Build the immutable pane-addressing table from this configuration.
    pub fn pane_map(&self) -> PaneMap {
        PaneMap::new(self)
    }
}

fn get_string(doc: &KdlDocument, name: &str) -> Option<String> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .and_then(|entry| entry.value().as_string())
        .map(|s| s.to_string())
}

fn get_integer(doc: &KdlDocument, name: &str) -> Option<i64> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .and_then(|entry| entry.value().as_integer())
        .map(|n| n as i64)
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|s| s.parse().ok())
}

/// Process-wide immutable table mapping each real bee to its tmux pane.
///
/// All other components treat panes as opaque strings and always resolve
/// through this table; nothing outside this module stores raw panes.
#[derive(Debug, Clone)]
pub struct PaneMap {
    entries: Vec<(BeeName, String)>,
}

impl PaneMap {
    fn new(config: &HiveConfig) -> Self {
        let entries = BeeName::REAL
            .iter()
            .enumerate()
            .map(|(index, bee)| {
                let pane = config
                    .pane_overrides
                    .get(bee.as_str())
                    .cloned()
                    .unwrap_or_else(|| format!("{}:{}", config.session_name, index));
                (*bee, pane)
            })
            .collect();
        Self { entries }
    }

    /// Strict lookup. `all` and the synthetic senders have no pane.
    pub fn resolve(&self, bee: BeeName) -> Result<&str> {
        self.entries
            .iter()
            .find(|(name, _)| *name == bee)
            .map(|(_, pane)| pane.as_str())
            .ok_or_else(|| Error::InvalidPane(bee.to_string()))
    }

    /// Validate a raw name against the closed set.
    pub fn validate(&self, name: &str) -> Result<BeeName> {
        BeeName::parse(name)
    }

    /// Every (bee, pane) pair, in pane order. Broadcast expansion.
    pub fn all(&self) -> &[(BeeName, String)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HiveConfig::default();
        assert_eq!(config.session_name, "beehive");
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.remind_interval_secs, 300);
        assert_eq!(config.t_idle_secs, 120);
        assert_eq!(config.t_silent_secs, 600);
        assert_eq!(config.injector_concurrency, 4);
        assert_eq!(config.observer_bee, BeeName::Queen);
        assert_eq!(config.chunk_size, 4000);
        config.validate().unwrap();
    }

    #[test]
    fn test_database_path_relative() {
        let config = HiveConfig::default();
        assert_eq!(
            config.database_path(),
            PathBuf::from("hive/hive_memory.db")
        );
    }

    #[test]
    fn test_database_path_absolute() {
        let mut config = HiveConfig::default();
        config.db_path = PathBuf::from("/var/lib/hive.db");
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/hive.db"));
    }

    #[test]
    fn test_kdl_scalars() {
        let mut config = HiveConfig::default();
        config
            .apply_kdl(
                r#"
session-name "apiary"
log-level "debug"
tick-interval 10
t-idle 60
t-silent 300
observer-bee "analyst"
chunk-size 2000
"#,
            )
            .unwrap();
        assert_eq!(config.session_name, "apiary");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.tick_interval_secs, 10);
        assert_eq!(config.t_idle_secs, 60);
        assert_eq!(config.t_silent_secs, 300);
        assert_eq!(config.observer_bee, BeeName::Analyst);
        assert_eq!(config.chunk_size, 2000);
        config.validate().unwrap();
    }

    #[test]
    fn test_kdl_pane_mapping() {
        let mut config = HiveConfig::default();
        config
            .apply_kdl(
                r#"
pane-mapping {
    queen "beehive:9"
    qa "%3"
}
"#,
            )
            .unwrap();
        let panes = config.pane_map();
        assert_eq!(panes.resolve(BeeName::Queen).unwrap(), "beehive:9");
        assert_eq!(panes.resolve(BeeName::Qa).unwrap(), "%3");
        // Unlisted bees keep the positional default.
        assert_eq!(panes.resolve(BeeName::Developer).unwrap(), "beehive:1");
    }

    #[test]
    fn test_kdl_extra_message_types() {
        let mut config = HiveConfig::default();
        config
            .apply_kdl(r#"extra-message-types "escalation" "handoff""#)
            .unwrap();
        assert_eq!(config.extra_message_types, vec!["escalation", "handoff"]);

        use crate::models::MessageType;
        assert!(config.accepts_message_type(&MessageType::parse("escalation")));
        assert!(!config.accepts_message_type(&MessageType::parse("gossip")));
        assert!(config.accepts_message_type(&MessageType::Alert));
    }

    #[test]
    fn test_kdl_bad_syntax() {
        let mut config = HiveConfig::default();
        assert!(config.apply_kdl(r#"session-name "unterminated"#).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_session_name() {
        let mut config = HiveConfig::default();
        config.session_name = "bee:hive".to_string();
        assert!(config.validate().is_err());

        config.session_name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = HiveConfig::default();
        config.t_idle_secs = 600;
        config.t_silent_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_synthetic_observer() {
        let mut config = HiveConfig::default();
        config.observer_bee = BeeName::System;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pane_map_defaults() {
        let config = HiveConfig::default();
        let panes = config.pane_map();
        assert_eq!(panes.resolve(BeeName::Queen).unwrap(), "beehive:0");
        assert_eq!(panes.resolve(BeeName::Developer).unwrap(), "beehive:1");
        assert_eq!(panes.resolve(BeeName::Qa).unwrap(), "beehive:2");
        assert_eq!(panes.resolve(BeeName::Analyst).unwrap(), "beehive:3");
    }

    #[test]
    fn test_pane_map_rejects_paneless_names() {
        let config = HiveConfig::default();
        let panes = config.pane_map();
        assert!(panes.resolve(BeeName::System).is_err());
        assert!(panes.resolve(BeeName::All).is_err());
    }

    #[test]
    fn test_pane_map_all_in_order() {
        let config = HiveConfig::default();
        let panes = config.pane_map();
        let bees: Vec<BeeName> = panes.all().iter().map(|(b, _)| *b).collect();
        assert_eq!(bees, BeeName::REAL.to_vec());
    }
}
