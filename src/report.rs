//! Session report output
//!
//! Text for people, JSON for scripts (`--format json`).

use std::fmt::Write as _;

use serde::Serialize;

use crate::orchestrator::SessionReport;
use crate::session::SessionState;

/// JSON document printed by `--format json`
#[derive(Debug, Clone, Serialize)]
pub struct JsonReport<'a> {
    pub version: &'static str,
    pub format: &'static str,
    pub function: &'a str,
    pub state: SessionState,
    pub all_helpers_succeeded: bool,
    #[serde(flatten)]
    pub session: &'a SessionReport,
}

impl<'a> JsonReport<'a> {
    pub fn new(function: &'a str, state: SessionState, session: &'a SessionReport) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            format: "tmaprobe-json-v1",
            function,
            state,
            all_helpers_succeeded: session.all_helpers_succeeded(),
            session,
        }
    }
}

/// Human-readable summary
pub fn render_text(function: &str, report: &SessionReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "function:    {function}");
    let _ = writeln!(out, "target pid:  {}", report.target_pid);
    let _ = writeln!(out, "window:      {:.3} ms", report.window.as_secs_f64() * 1e3);
    let _ = writeln!(out, "output file: {}", report.output_file.display());
    for helper in &report.helpers {
        let status = if helper.succeeded() { "ok" } else { "FAILED" };
        let _ = writeln!(
            out,
            "  {:<9} {} (pid {}): {} [{status}]",
            format!("{:?}", helper.role).to_lowercase(),
            helper.program,
            helper.pid,
            helper.exit_label()
        );
    }
    out
}

/// Pretty-printed JSON document
pub fn render_json(
    function: &str,
    state: SessionState,
    report: &SessionReport,
) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&JsonReport::new(function, state, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CounterBackend;
    use crate::orchestrator::{HelperOutcome, HelperRole};
    use crate::spawn::HelperExit;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sample() -> SessionReport {
        SessionReport {
            target_pid: 4242,
            backend: CounterBackend::PerfStat,
            output_file: PathBuf::from("/tmp/out.txt"),
            window: Duration::from_micros(1500),
            helpers: vec![
                HelperOutcome {
                    role: HelperRole::Affinity,
                    program: "/usr/bin/taskset".to_string(),
                    pid: 10,
                    exit: Some(HelperExit::Code(0)),
                    error: None,
                },
                HelperOutcome {
                    role: HelperRole::Counter,
                    program: "/usr/bin/perf".to_string(),
                    pid: 11,
                    exit: Some(HelperExit::Signal(libc::SIGINT)),
                    error: None,
                },
            ],
        }
    }

    #[test]
    fn test_render_text() {
        let text = render_text("hot_loop", &sample());
        assert!(text.contains("function:    hot_loop"));
        assert!(text.contains("target pid:  4242"));
        assert!(text.contains("window:      1.500 ms"));
        assert!(text.contains("affinity  /usr/bin/taskset (pid 10): exit code 0 [ok]"));
        assert!(text.contains("counter   /usr/bin/perf (pid 11): signal 2 [ok]"));
    }

    #[test]
    fn test_render_text_flags_failed_helper() {
        let mut report = sample();
        report.helpers[0].exit = Some(HelperExit::Code(1));
        assert!(render_text("f", &report).contains("[FAILED]"));
    }

    #[test]
    fn test_render_helper_that_could_not_be_collected() {
        let mut report = sample();
        report.helpers[1].exit = None;
        report.helpers[1].error = Some("Failed to wait for /usr/bin/perf".to_string());
        let text = render_text("f", &report);
        assert!(text.contains("(pid 11): Failed to wait for /usr/bin/perf [FAILED]"));

        let json = render_json("f", SessionState::Finished, &report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["helpers"][1]["exit"].is_null());
        assert_eq!(value["helpers"][1]["error"], "Failed to wait for /usr/bin/perf");
        assert!(value["helpers"][0].get("error").is_none());
        assert_eq!(value["all_helpers_succeeded"], false);
    }

    #[test]
    fn test_render_json() {
        let json = render_json("hot_loop", SessionState::Finished, &sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["format"], "tmaprobe-json-v1");
        assert_eq!(value["function"], "hot_loop");
        assert_eq!(value["state"], "finished");
        assert_eq!(value["target_pid"], 4242);
        assert_eq!(value["backend"], "perf_stat");
        assert_eq!(value["window_us"], 1500);
        assert_eq!(value["all_helpers_succeeded"], true);
        assert_eq!(value["helpers"][0]["role"], "affinity");
        assert_eq!(value["helpers"][1]["exit"]["signal"], 2);
    }

    #[test]
    fn test_render_json_toplev_backend() {
        let mut report = sample();
        report.backend = CounterBackend::Toplev {
            dir: PathBuf::from("/opt/pmu-tools"),
        };
        let json = render_json("f", SessionState::Finished, &report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["backend"]["toplev"]["dir"], "/opt/pmu-tools");
    }
}
