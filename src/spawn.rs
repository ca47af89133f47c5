//! Helper process launching
//!
//! A [`ChildProcessSpec`] owns its argument vector; nothing is ever passed
//! through a shell. [`ProcessLauncher`] starts helpers with
//! `std::process::Command`, which on Linux suspends the caller only until
//! the child has exec'd (`posix_spawn`/`CLONE_VFORK`) and reports a failed
//! exec back through a close-on-exec pipe, so a helper that cannot be
//! loaded surfaces as [`SpawnError::Launch`].

use std::fmt;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Cannot launch a helper with an empty argument list")]
    EmptyArgv,

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to signal {program} (pid {pid}): {source}")]
    Signal {
        program: String,
        pid: u32,
        #[source]
        source: Errno,
    },

    #[error("Failed to wait for {program} (pid {pid}): {source}")]
    Wait {
        program: String,
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Runs in the child between fork and exec
#[derive(Clone)]
pub enum PreExecAction {
    /// Put the child in its own process group so it can be signalled as a unit
    NewProcessGroup,
    /// Arbitrary hook; must only use async-signal-safe calls
    Custom(Arc<dyn Fn() -> io::Result<()> + Send + Sync>),
}

impl fmt::Debug for PreExecAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewProcessGroup => f.write_str("NewProcessGroup"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One helper process launch
#[derive(Debug, Clone)]
pub struct ChildProcessSpec {
    /// Program path followed by its arguments
    pub argv: Vec<String>,
    pub pre_exec: Option<PreExecAction>,
}

impl ChildProcessSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            pre_exec: None,
        }
    }

    pub fn with_pre_exec(mut self, action: PreExecAction) -> Self {
        self.pre_exec = Some(action);
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    /// Whether the child gets a process group of its own
    pub fn new_process_group(&self) -> bool {
        matches!(self.pre_exec, Some(PreExecAction::NewProcessGroup))
    }
}

/// How a helper ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperExit {
    Code(i32),
    Signal(i32),
}

impl From<ExitStatus> for HelperExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(sig)) => Self::Signal(sig),
            // Stopped/continued statuses never come out of wait()
            (None, None) => Self::Code(-1),
        }
    }
}

impl fmt::Display for HelperExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// A launched helper
pub trait HelperHandle {
    fn pid(&self) -> u32;
    fn program(&self) -> &str;
    /// Ask the helper to stop and flush (SIGINT)
    fn interrupt(&mut self) -> Result<(), SpawnError>;
    /// Block until the helper has exited
    fn wait(&mut self) -> Result<HelperExit, SpawnError>;
}

/// Starts helper processes
pub trait Launcher {
    type Handle: HelperHandle;

    fn launch(&mut self, spec: &ChildProcessSpec) -> Result<Self::Handle, SpawnError>;
}

/// Launches real processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(&mut self, spec: &ChildProcessSpec) -> Result<ProcessHandle, SpawnError> {
        let program = spec.program().ok_or(SpawnError::EmptyArgv)?;

        let mut command = Command::new(program);
        command
            .args(spec.args())
            .stdin(Stdio::null())
            // Helpers must not inherit an instrumentation preload
            .env_remove("LD_PRELOAD");

        match &spec.pre_exec {
            Some(PreExecAction::NewProcessGroup) => {
                command.process_group(0);
            }
            Some(PreExecAction::Custom(action)) => {
                let action = Arc::clone(action);
                // SAFETY: Custom actions are documented to be async-signal-safe.
                unsafe {
                    command.pre_exec(move || action());
                }
            }
            None => {}
        }

        let child = command.spawn().map_err(|source| SpawnError::Launch {
            program: program.to_string(),
            source,
        })?;

        debug!(program, pid = child.id(), "launched helper");
        Ok(ProcessHandle {
            child,
            program: program.to_string(),
            group: spec.new_process_group(),
            exit: None,
        })
    }
}

/// Handle to a helper started by [`ProcessLauncher`]
///
/// Dropping it does not kill the helper.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    program: String,
    group: bool,
    exit: Option<HelperExit>,
}

impl HelperHandle for ProcessHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn program(&self) -> &str {
        &self.program
    }

    fn interrupt(&mut self) -> Result<(), SpawnError> {
        if self.exit.is_some() {
            return Ok(());
        }

        let pid = Pid::from_raw(self.child.id() as i32);
        let sent = if self.group {
            signal::killpg(pid, Signal::SIGINT)
        } else {
            signal::kill(pid, Signal::SIGINT)
        };

        match sent {
            Ok(()) => Ok(()),
            // Already gone
            Err(Errno::ESRCH) => {
                warn!(program = %self.program, "helper exited before it was interrupted");
                Ok(())
            }
            Err(source) => Err(SpawnError::Signal {
                program: self.program.clone(),
                pid: self.child.id(),
                source,
            }),
        }
    }

    fn wait(&mut self) -> Result<HelperExit, SpawnError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().map_err(|source| SpawnError::Wait {
            program: self.program.clone(),
            pid: self.child.id(),
            source,
        })?;
        let exit = HelperExit::from(status);
        self.exit = Some(exit);
        Ok(exit)
    }
}
