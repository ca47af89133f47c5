//! Helper process choreography around the measured window
//!
//! `begin_session` launches the affinity tool and then the counter tool,
//! waiting for neither: the target is pinned while its function already
//! runs, and the pinning latency is an accepted race. `end_session`
//! interrupts only the counter tool so it flushes its output; the target
//! process keeps running.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CoreList, CounterBackend, TmaConfig, ToolPaths};
use crate::spawn::{
    ChildProcessSpec, HelperExit, HelperHandle, Launcher, PreExecAction, SpawnError,
};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("A measurement is already running for process {0}")]
    AlreadyRunning(i32),

    #[error("No measurement is running")]
    NotRunning,

    /// The window closed but a helper could not be stopped or collected;
    /// the report records what happened to each one
    #[error("Helper cleanup failed: {source}")]
    Cleanup {
        report: Box<SessionReport>,
        #[source]
        source: SpawnError,
    },
}

/// Everything the helpers need to know about one measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub target_pid: i32,
    pub cores: CoreList,
    pub level: String,
    pub output_file: PathBuf,
    pub backend: CounterBackend,
    pub tools: ToolPaths,
}

impl SessionParams {
    pub fn new(target_pid: i32, config: &TmaConfig) -> Self {
        Self {
            target_pid,
            cores: config.cores.clone(),
            level: config.level.clone(),
            output_file: config.output_file.clone(),
            backend: config.backend.clone(),
            tools: config.tools.clone(),
        }
    }
}

/// `taskset --pid --cpu-list <cores> <pid>`
pub fn affinity_command(params: &SessionParams) -> ChildProcessSpec {
    ChildProcessSpec::new([
        params.tools.taskset.display().to_string(),
        "--pid".to_string(),
        "--cpu-list".to_string(),
        params.cores.as_str().to_string(),
        params.target_pid.to_string(),
    ])
}

/// Counter collection command for the configured backend
///
/// Launched in its own process group so `end_session` can interrupt it
/// together with anything it forks (toplev runs perf underneath).
pub fn counter_command(params: &SessionParams) -> ChildProcessSpec {
    let pid = params.target_pid.to_string();
    let output = params.output_file.display().to_string();

    let argv = match &params.backend {
        CounterBackend::PerfStat => vec![
            params.tools.perf.display().to_string(),
            "stat".to_string(),
            "-M".to_string(),
            params.level.clone(),
            "-p".to_string(),
            pid,
            "-o".to_string(),
            output,
        ],
        CounterBackend::Toplev { dir } => {
            let mut argv = Vec::with_capacity(12);
            if let Some(python) = &params.tools.python {
                argv.push(python.display().to_string());
            }
            argv.extend([
                dir.join("toplev.py").display().to_string(),
                "--single-thread".to_string(),
                "-l".to_string(),
                params.level.clone(),
                "-o".to_string(),
                output,
                "--pid".to_string(),
                pid,
                "--core".to_string(),
                format!("C{}", params.cores.as_str()),
            ]);
            argv
        }
    };

    ChildProcessSpec::new(argv).with_pre_exec(PreExecAction::NewProcessGroup)
}

/// What a helper was for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperRole {
    Affinity,
    Counter,
}

/// Final state of one helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelperOutcome {
    pub role: HelperRole,
    pub program: String,
    pub pid: u32,
    /// `None` when the helper could not be waited for
    pub exit: Option<HelperExit>,
    /// Failure to signal or collect the helper
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HelperOutcome {
    pub fn succeeded(&self) -> bool {
        if self.error.is_some() {
            return false;
        }
        match (self.role, self.exit) {
            (_, Some(HelperExit::Code(0))) => true,
            // Interrupted on purpose at session end
            (HelperRole::Counter, Some(HelperExit::Signal(sig))) => sig == libc::SIGINT,
            _ => false,
        }
    }

    /// Exit status for display
    pub fn exit_label(&self) -> String {
        match (&self.exit, &self.error) {
            (Some(exit), None) => exit.to_string(),
            (Some(exit), Some(error)) => format!("{exit} ({error})"),
            (None, Some(error)) => error.clone(),
            (None, None) => "unknown".to_string(),
        }
    }
}

/// Result of one measured window
///
/// Deliberately carries no address information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub target_pid: i32,
    pub backend: CounterBackend,
    pub output_file: PathBuf,
    #[serde(rename = "window_us", serialize_with = "serialize_micros")]
    pub window: Duration,
    pub helpers: Vec<HelperOutcome>,
}

impl SessionReport {
    pub fn all_helpers_succeeded(&self) -> bool {
        self.helpers.iter().all(HelperOutcome::succeeded)
    }
}

fn serialize_micros<S: serde::Serializer>(window: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(window.as_micros()).unwrap_or(u64::MAX))
}

/// Fold one helper's cleanup steps into its outcome, keeping the first error
fn collect<H: HelperHandle>(
    role: HelperRole,
    handle: &H,
    steps: Vec<Result<Option<HelperExit>, SpawnError>>,
    first_error: &mut Option<SpawnError>,
) -> HelperOutcome {
    let mut exit = None;
    let mut errors = Vec::new();
    for step in steps {
        match step {
            Ok(Some(status)) => exit = Some(status),
            Ok(None) => {}
            Err(e) => {
                errors.push(e.to_string());
                first_error.get_or_insert(e);
            }
        }
    }
    HelperOutcome {
        role,
        program: handle.program().to_string(),
        pid: handle.pid(),
        exit,
        error: (!errors.is_empty()).then(|| errors.join("; ")),
    }
}

struct Running<H> {
    params: SessionParams,
    affinity: H,
    counter: H,
    started: Instant,
}

/// Owns the helper processes of at most one measurement at a time
pub struct Orchestrator<L: Launcher> {
    launcher: L,
    running: Option<Running<L::Handle>>,
}

impl<L: Launcher> Orchestrator<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            launcher,
            running: None,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Launch the affinity helper, then the counter helper
    pub fn begin_session(&mut self, params: SessionParams) -> Result<(), OrchestratorError> {
        if let Some(running) = &self.running {
            return Err(OrchestratorError::AlreadyRunning(running.params.target_pid));
        }

        let mut affinity = self.launcher.launch(&affinity_command(&params))?;

        let counter = match self.launcher.launch(&counter_command(&params)) {
            Ok(counter) => counter,
            Err(e) => {
                // Reap the affinity helper so it does not linger as a zombie
                if let Err(wait_err) = affinity.wait() {
                    warn!("failed to reap affinity helper: {wait_err}");
                }
                return Err(e.into());
            }
        };

        info!(
            target_pid = params.target_pid,
            cpus = params.cores.cpus().len(),
            affinity_pid = affinity.pid(),
            counter_pid = counter.pid(),
            "measurement started"
        );

        self.running = Some(Running {
            params,
            affinity,
            counter,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Stop the counter helper, wait for its output, and reap both helpers
    ///
    /// Both helpers are waited for even when a step fails. The first failure
    /// comes back as [`OrchestratorError::Cleanup`] carrying the full report.
    pub fn end_session(&mut self) -> Result<SessionReport, OrchestratorError> {
        let mut running = self.running.take().ok_or(OrchestratorError::NotRunning)?;
        let window = running.started.elapsed();

        let interrupted = running.counter.interrupt().map(|()| None);
        let counter_exit = running.counter.wait().map(Some);
        let affinity_exit = running.affinity.wait().map(Some);

        let mut first_error = None;
        let counter = collect(
            HelperRole::Counter,
            &running.counter,
            vec![interrupted, counter_exit],
            &mut first_error,
        );
        let affinity = collect(
            HelperRole::Affinity,
            &running.affinity,
            vec![affinity_exit],
            &mut first_error,
        );

        debug!(
            counter_exit = %counter.exit_label(),
            affinity_exit = %affinity.exit_label(),
            "helpers finished"
        );

        let report = SessionReport {
            target_pid: running.params.target_pid,
            backend: running.params.backend,
            output_file: running.params.output_file,
            window,
            helpers: vec![affinity, counter],
        };

        for helper in report.helpers.iter().filter(|h| !h.succeeded()) {
            warn!(program = %helper.program, exit = %helper.exit_label(), "helper did not succeed");
        }

        match first_error {
            None => Ok(report),
            Some(source) => Err(OrchestratorError::Cleanup {
                report: Box::new(report),
                source,
            }),
        }
    }
}
