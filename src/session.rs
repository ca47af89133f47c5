//! Profiling session state machine
//!
//! ```text
//! Unarmed --arm()--> Armed --entry hook--> Active --return hook--> Finished
//! ```
//!
//! No other transitions exist. Arming reads the configuration, resolves the
//! target function and installs an entry hook; any failure leaves the
//! session `Unarmed` with nothing installed. The first entry hit reads the
//! call's return address, installs a one-shot hook there and starts the
//! helper processes before the target continues into the function body.
//! Later entry hits while `Active` (recursion, repeated calls) are ignored.
//! The return hook ends the measurement.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EnvSource, TmaConfig};
use crate::hooks::{
    self, HookError, HookHandler, HookHit, HookId, HookKind, InstrumentationBackend,
    StartupStatus,
};
use crate::orchestrator::{Orchestrator, OrchestratorError, SessionParams, SessionReport};
use crate::resolver::{AddressResolution, ResolveError, TargetFunction};
use crate::spawn::Launcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unarmed,
    Armed,
    Active,
    Finished,
}

/// Inputs that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Arm,
    EntryHit,
    ReturnHit,
}

impl SessionState {
    /// The transition table
    pub fn next(self, event: SessionEvent) -> Result<SessionState, SessionError> {
        use SessionEvent::{Arm, EntryHit, ReturnHit};
        use SessionState::{Active, Armed, Finished, Unarmed};

        match (self, event) {
            (Unarmed, Arm) => Ok(Armed),
            (Armed, EntryHit) => Ok(Active),
            (Active, ReturnHit) => Ok(Finished),
            (from, event) => Err(SessionError::InvalidTransition { from, event }),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Invalid session transition: {event:?} while {from:?}")]
    InvalidTransition {
        from: SessionState,
        event: SessionEvent,
    },

    #[error("Process {0} already has an active profiling session")]
    AlreadyActive(i32),

    #[error("Target exited with code {code} while the session was {state:?}")]
    TargetExited { code: i32, state: SessionState },
}

fn active_targets() -> &'static Mutex<HashSet<i32>> {
    static ACTIVE: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();
    ACTIVE.get_or_init(Mutex::default)
}

/// Marks a process as being measured; released on drop
#[derive(Debug)]
pub struct ActiveTarget {
    pid: i32,
}

impl ActiveTarget {
    /// Claim `pid`, failing if another session already measures it
    pub fn acquire(pid: i32) -> Result<Self, SessionError> {
        let mut active = active_targets()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(pid) {
            return Err(SessionError::AlreadyActive(pid));
        }
        Ok(Self { pid })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for ActiveTarget {
    fn drop(&mut self) {
        active_targets()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pid);
    }
}

/// One armed target function and the measurement around its first call
pub struct ProfilingSession<L: Launcher, R, E> {
    env: E,
    resolver: R,
    orchestrator: Orchestrator<L>,
    state: SessionState,
    config: Option<TmaConfig>,
    target: Option<TargetFunction>,
    target_pid: Option<i32>,
    entry_hook: Option<HookId>,
    return_hook: Option<HookId>,
    active: Option<ActiveTarget>,
    reentries: u32,
    report: Option<SessionReport>,
}

impl<L, R, E> ProfilingSession<L, R, E>
where
    L: Launcher,
    R: AddressResolution,
    E: EnvSource,
{
    pub fn new(launcher: L, env: E, resolver: R) -> Self {
        Self {
            env,
            resolver,
            orchestrator: Orchestrator::new(launcher),
            state: SessionState::Unarmed,
            config: None,
            target: None,
            target_pid: None,
            entry_hook: None,
            return_hook: None,
            active: None,
            reentries: 0,
            report: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> Option<&TargetFunction> {
        self.target.as_ref()
    }

    pub fn config(&self) -> Option<&TmaConfig> {
        self.config.as_ref()
    }

    /// Entry hits ignored because a measurement was already running
    pub fn reentries(&self) -> u32 {
        self.reentries
    }

    pub fn report(&self) -> Option<&SessionReport> {
        self.report.as_ref()
    }

    pub fn launcher(&self) -> &L {
        self.orchestrator.launcher()
    }

    /// Read the configuration, resolve the target and install its entry hook
    ///
    /// On any failure the session stays `Unarmed` and nothing is installed.
    pub fn arm(&mut self, backend: &mut dyn InstrumentationBackend) -> Result<(), SessionError> {
        let next = self.state.next(SessionEvent::Arm)?;

        let config = TmaConfig::load(&self.env)?;
        let pid = backend.target_pid();

        let mut target = TargetFunction::new(config.function.as_str());
        let addr = self.resolver.resolve(pid, &target.symbol_name)?;
        let hook = backend.register_entry_hook(addr)?;
        target.set_resolved(addr);

        info!(pid, function = %target.symbol_name, hook = %hook, "entry hook armed");

        self.config = Some(config);
        self.target = Some(target);
        self.target_pid = Some(pid);
        self.entry_hook = Some(hook);
        self.state = next;
        Ok(())
    }

    fn on_entry(
        &mut self,
        id: HookId,
        backend: &mut dyn InstrumentationBackend,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Active && self.entry_hook == Some(id) {
            self.reentries += 1;
            debug!(reentries = self.reentries, "entry while active ignored");
            return Ok(());
        }

        let next = self.state.next(SessionEvent::EntryHit)?;
        if self.entry_hook != Some(id) {
            return Err(HookError::UnknownHook(id).into());
        }
        let (Some(config), Some(pid)) = (self.config.as_ref(), self.target_pid) else {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                event: SessionEvent::EntryHit,
            });
        };

        let active = ActiveTarget::acquire(pid)?;
        let ret = backend.return_address()?;
        let return_hook = backend.register_one_shot_hook(ret)?;

        if let Err(e) = self.orchestrator.begin_session(SessionParams::new(pid, config)) {
            if let Err(remove_err) = backend.remove_hook(return_hook) {
                warn!("failed to remove return hook after launch failure: {remove_err}");
            }
            return Err(e.into());
        }

        info!(pid, return_hook = %return_hook, "measurement window opened");
        self.return_hook = Some(return_hook);
        self.active = Some(active);
        self.state = next;
        Ok(())
    }

    fn on_return(&mut self, id: HookId) -> Result<(), SessionError> {
        let next = self.state.next(SessionEvent::ReturnHit)?;
        if self.return_hook != Some(id) {
            return Err(HookError::UnknownHook(id).into());
        }

        // A helper that could not be collected still leaves a report behind
        let (report, cleanup) = match self.orchestrator.end_session() {
            Ok(report) => (report, None),
            Err(OrchestratorError::Cleanup { report, source }) => {
                let kept = (*report).clone();
                (kept, Some(OrchestratorError::Cleanup { report, source }))
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            window_us = u64::try_from(report.window.as_micros()).unwrap_or(u64::MAX),
            reentries = self.reentries,
            "measurement window closed"
        );

        self.return_hook = None;
        self.active = None;
        self.report = Some(report);
        self.state = next;
        match cleanup {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Arm, report startup to the backend, and handle hooks until the window closes
    ///
    /// The backend is released afterwards so the target keeps running.
    pub fn run(
        &mut self,
        backend: &mut dyn InstrumentationBackend,
    ) -> Result<SessionReport, SessionError> {
        if let Err(e) = self.arm(backend) {
            if let Err(startup_err) = backend.startup(&StartupStatus::Failed(e.to_string())) {
                warn!("failed to report startup failure: {startup_err}");
            }
            return Err(e);
        }
        backend.startup(&StartupStatus::Ready)?;

        let outcome = hooks::dispatch(backend, self);
        let released = backend.release();
        outcome?;
        released?;

        self.report
            .clone()
            .ok_or(SessionError::InvalidTransition {
                from: self.state,
                event: SessionEvent::ReturnHit,
            })
    }
}

impl<L, R, E> HookHandler for ProfilingSession<L, R, E>
where
    L: Launcher,
    R: AddressResolution,
    E: EnvSource,
{
    type Error = SessionError;

    fn on_hook(
        &mut self,
        hit: HookHit,
        backend: &mut dyn InstrumentationBackend,
    ) -> Result<bool, SessionError> {
        match hit.kind {
            HookKind::Entry => self.on_entry(hit.id, backend).map(|()| false),
            HookKind::OneShot => self.on_return(hit.id).map(|()| true),
        }
    }

    fn on_exit(&mut self, code: i32) -> Result<(), SessionError> {
        let state = self.state;
        if state == SessionState::Active {
            // Counter tools stop by themselves once the target is gone
            match self.orchestrator.end_session() {
                Ok(report) => self.report = Some(report),
                Err(OrchestratorError::Cleanup { report, source }) => {
                    warn!("failed to collect helpers after target exit: {source}");
                    self.report = Some(*report);
                }
                Err(e) => warn!("failed to collect helpers after target exit: {e}"),
            }
            self.active = None;
        }
        Err(SessionError::TargetExited { code, state })
    }
}
