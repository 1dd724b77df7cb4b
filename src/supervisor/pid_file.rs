//! PID file management for the supervisor daemon.
//!
//! The PID file lives in the hive directory as `daemon.pid` and tracks
//! the daemon process across invocations:
//! ```text
//! PID=12345
//! SESSION=beehive
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Information stored in the daemon PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPidInfo {
    /// Process ID of the running daemon
    pub pid: u32,
    /// Session the daemon supervises
    pub session: String,
}

/// Manages the daemon PID file for process lifecycle tracking.
#[derive(Debug)]
pub struct DaemonPidFile {
    path: PathBuf,
}

impl DaemonPidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the PID file, creating the parent directory if needed.
    pub fn write(&self, info: &DaemonPidInfo) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = format!("PID={}\nSESSION={}\n", info.pid, info.session);
        let mut file = fs::File::create(&self.path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read and parse the PID file. `Ok(None)` when it doesn't exist.
    pub fn read(&self) -> io::Result<Option<DaemonPidInfo>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(Self::parse_contents(&contents)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete the PID file if it exists.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the PID file and check whether that process is alive.
    /// Returns the info plus the liveness verdict.
    pub fn check_running(&self) -> io::Result<Option<(bool, DaemonPidInfo)>> {
        match self.read()? {
            Some(info) => {
                let alive = process_is_running(info.pid);
                Ok(Some((alive, info)))
            }
            None => Ok(None),
        }
    }

    fn parse_contents(contents: &str) -> io::Result<DaemonPidInfo> {
        let mut pid: Option<u32> = None;
        let mut session: Option<String> = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                match key {
                    "PID" => {
                        pid = Some(value.parse().map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "Invalid PID value")
                        })?);
                    }
                    "SESSION" => {
                        session = Some(value.to_string());
                    }
                    _ => {} // Ignore unknown keys for forward compatibility
                }
            }
        }

        let pid =
            pid.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Missing PID field"))?;
        let session = session
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Missing SESSION field"))?;

        Ok(DaemonPidInfo { pid, session })
    }
}

/// Whether a process with the given PID exists (signal 0 probe).
pub fn process_is_running(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Signal type for daemon termination.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Term,
    Kill,
}

/// Send a signal to a process. Returns false if the process is gone.
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    let signal_str = match signal {
        Signal::Term => "-TERM",
        Signal::Kill => "-KILL",
    };
    Command::new("kill")
        .args([signal_str, &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
