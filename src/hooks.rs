//! Instrumentation backend capability boundary
//!
//! A backend delivers code-location callbacks inside the target: an entry
//! hook that fires every time control reaches an address, and a one-shot
//! hook that the backend removes as soon as it has fired once. Whether the
//! hooks are implemented with software breakpoints, a binary translation VM,
//! or a rewriting client is invisible to the session.
//!
//! Callbacks run synchronously: while a [`HookHandler`] handles a hit, the
//! target's thread of control is stopped at the hook.

use std::fmt;

use nix::errno::Errno;
use thiserror::Error;
use tracing::trace;

use crate::resolver::CodeAddress;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Cannot place a hook at the requested address: {0}")]
    InvalidAddress(Errno),

    #[error("A hook is already installed at the requested address")]
    AddressInUse,

    #[error("Unknown hook {0}")]
    UnknownHook(HookId),

    #[error("Target is not stopped at a hook")]
    NotStopped,

    #[error("{operation} failed: {source}")]
    Ptrace {
        operation: &'static str,
        #[source]
        source: Errno,
    },

    #[error("Hooks are not supported on this architecture")]
    UnsupportedArchitecture,
}

/// Identifies an installed hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub u32);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Fires every time the address is reached
    Entry,
    /// Removed right after its first firing
    OneShot,
}

/// A hook firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHit {
    pub id: HookId,
    pub kind: HookKind,
}

/// Why the target stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Hook(HookHit),
    /// Target terminated; carries its exit code (128 + signal when killed)
    Exited(i32),
}

/// Outcome of the start/ready handshake with the hosting backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupStatus {
    Ready,
    Failed(String),
}

/// What a backend must provide to the session
pub trait InstrumentationBackend {
    /// Process the hooks live in
    fn target_pid(&self) -> i32;

    /// Install a persistent hook at `addr`
    fn register_entry_hook(&mut self, addr: CodeAddress) -> Result<HookId, HookError>;

    /// Install a hook that is removed after it fires once
    fn register_one_shot_hook(&mut self, addr: CodeAddress) -> Result<HookId, HookError>;

    /// Remove a hook that has not fired yet (one-shot) or at all (entry)
    fn remove_hook(&mut self, id: HookId) -> Result<(), HookError>;

    /// Let the target run until the next hook fires or it exits
    fn resume(&mut self) -> Result<Stop, HookError>;

    /// Return address of the current call, valid while stopped at a function's entry hook
    fn return_address(&self) -> Result<CodeAddress, HookError>;

    /// Report the startup outcome to the host
    fn startup(&mut self, status: &StartupStatus) -> Result<(), HookError>;

    /// Remove every remaining hook and let the target run on its own
    fn release(&mut self) -> Result<(), HookError>;
}

/// Receives hook callbacks from [`dispatch`]
pub trait HookHandler {
    type Error: From<HookError>;

    /// Handle a hit; `Ok(true)` ends the dispatch loop
    fn on_hook(
        &mut self,
        hit: HookHit,
        backend: &mut dyn InstrumentationBackend,
    ) -> Result<bool, Self::Error>;

    /// The target exited before the handler was done
    fn on_exit(&mut self, code: i32) -> Result<(), Self::Error>;
}

/// Drive the backend, calling back into `handler` on every hook hit
///
/// Returns when the handler reports it is done or the target exits.
pub fn dispatch<H: HookHandler>(
    backend: &mut dyn InstrumentationBackend,
    handler: &mut H,
) -> Result<(), H::Error> {
    loop {
        match backend.resume()? {
            Stop::Hook(hit) => {
                trace!(hook = %hit.id, kind = ?hit.kind, "hook fired");
                if handler.on_hook(hit, backend)? {
                    return Ok(());
                }
            }
            Stop::Exited(code) => {
                trace!(code, "target exited");
                return handler.on_exit(code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Replay {
        stops: VecDeque<Stop>,
    }

    impl InstrumentationBackend for Replay {
        fn target_pid(&self) -> i32 {
            1
        }
        fn register_entry_hook(&mut self, _: CodeAddress) -> Result<HookId, HookError> {
            Ok(HookId(0))
        }
        fn register_one_shot_hook(&mut self, _: CodeAddress) -> Result<HookId, HookError> {
            Ok(HookId(1))
        }
        fn remove_hook(&mut self, id: HookId) -> Result<(), HookError> {
            Err(HookError::UnknownHook(id))
        }
        fn resume(&mut self) -> Result<Stop, HookError> {
            self.stops.pop_front().ok_or(HookError::NotStopped)
        }
        fn return_address(&self) -> Result<CodeAddress, HookError> {
            Err(HookError::NotStopped)
        }
        fn startup(&mut self, _: &StartupStatus) -> Result<(), HookError> {
            Ok(())
        }
        fn release(&mut self) -> Result<(), HookError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Counter {
        hits: Vec<HookId>,
        stop_after: usize,
        exit: Option<i32>,
    }

    impl HookHandler for Counter {
        type Error = HookError;

        fn on_hook(
            &mut self,
            hit: HookHit,
            _: &mut dyn InstrumentationBackend,
        ) -> Result<bool, HookError> {
            self.hits.push(hit.id);
            Ok(self.hits.len() == self.stop_after)
        }

        fn on_exit(&mut self, code: i32) -> Result<(), HookError> {
            self.exit = Some(code);
            Ok(())
        }
    }

    fn hit(id: u32) -> Stop {
        Stop::Hook(HookHit {
            id: HookId(id),
            kind: HookKind::Entry,
        })
    }

    #[test]
    fn test_dispatch_stops_when_handler_is_done() {
        let mut backend = Replay {
            stops: VecDeque::from([hit(0), hit(0), hit(1), hit(2)]),
        };
        let mut handler = Counter {
            stop_after: 3,
            ..Default::default()
        };
        dispatch(&mut backend, &mut handler).unwrap();
        assert_eq!(handler.hits, [HookId(0), HookId(0), HookId(1)]);
        assert_eq!(backend.stops.len(), 1);
    }

    #[test]
    fn test_dispatch_reports_exit() {
        let mut backend = Replay {
            stops: VecDeque::from([hit(0), Stop::Exited(3)]),
        };
        let mut handler = Counter {
            stop_after: 10,
            ..Default::default()
        };
        dispatch(&mut backend, &mut handler).unwrap();
        assert_eq!(handler.exit, Some(3));
    }

    #[test]
    fn test_dispatch_propagates_backend_error() {
        let mut backend = Replay {
            stops: VecDeque::new(),
        };
        let mut handler = Counter::default();
        assert!(matches!(
            dispatch(&mut backend, &mut handler),
            Err(HookError::NotStopped)
        ));
    }

    #[test]
    fn test_hook_id_display() {
        assert_eq!(HookId(7).to_string(), "#7");
    }
}
