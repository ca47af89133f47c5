//! Measure a closure in the calling process
//!
//! No hooks are involved: the helpers are started against this process,
//! the closure runs, and the helpers are stopped. The host process keeps
//! running afterwards.

use tracing::info;

use crate::config::TmaConfig;
use crate::orchestrator::{Orchestrator, SessionParams, SessionReport};
use crate::session::{ActiveTarget, SessionError};
use crate::spawn::Launcher;

/// Run `f` inside a measurement window on the current process
///
/// Fails with [`SessionError::AlreadyActive`] if this process is already
/// being measured. If the helpers cannot be started, `f` is not called.
pub fn record_fn<L, T, F>(
    config: &TmaConfig,
    launcher: L,
    f: F,
) -> Result<(T, SessionReport), SessionError>
where
    L: Launcher,
    F: FnOnce() -> T,
{
    let pid = std::process::id() as i32;
    let _active = ActiveTarget::acquire(pid)?;

    let mut orchestrator = Orchestrator::new(launcher);
    orchestrator.begin_session(SessionParams::new(pid, config))?;

    let value = f();

    let report = orchestrator.end_session()?;
    info!(pid, helpers = report.helpers.len(), "recorded closure");
    Ok((value, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreList, CounterBackend, ToolPaths};
    use crate::orchestrator::HelperRole;
    use crate::spawn::{ProcessLauncher, SpawnError};
    use serial_test::serial;
    use std::path::PathBuf;

    fn config(perf: &str) -> TmaConfig {
        TmaConfig {
            function: "unused".to_string(),
            cores: CoreList::parse("0").unwrap(),
            output_file: PathBuf::from("/dev/null"),
            level: "L1".to_string(),
            backend: CounterBackend::PerfStat,
            tools: ToolPaths {
                taskset: PathBuf::from("/bin/true"),
                perf: PathBuf::from(perf),
                python: None,
            },
        }
    }

    #[test]
    #[serial]
    fn test_record_fn_returns_value_and_report() {
        let (value, report) = record_fn(&config("/bin/true"), ProcessLauncher, || 6 * 7).unwrap();
        assert_eq!(value, 42);
        assert_eq!(report.target_pid, std::process::id() as i32);
        assert_eq!(report.helpers[1].role, HelperRole::Counter);
    }

    #[test]
    #[serial]
    fn test_record_fn_does_not_call_closure_when_launch_fails() {
        let mut called = false;
        let err = record_fn(&config("/nonexistent/perf"), ProcessLauncher, || called = true)
            .unwrap_err();
        assert!(!called);
        assert!(matches!(
            err,
            SessionError::Orchestrator(crate::orchestrator::OrchestratorError::Spawn(
                SpawnError::Launch { .. }
            ))
        ));
    }

    #[test]
    #[serial]
    fn test_record_fn_rejects_nested_measurement() {
        let outer = ActiveTarget::acquire(std::process::id() as i32).unwrap();
        let err = record_fn(&config("/bin/true"), ProcessLauncher, || ()).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive(_)));
        drop(outer);
    }
}
