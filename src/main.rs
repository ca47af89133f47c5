#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("tmaprobe hooks functions with ptrace breakpoints and supports only x86-64 Linux");

use anyhow::{Context, Result};
use clap::Parser;
use tmaprobe::cli::{Cli, OutputFormat};
use tmaprobe::config::ProcessEnv;
use tmaprobe::ptrace_backend::PtraceBackend;
use tmaprobe::report;
use tmaprobe::resolver::ProcResolver;
use tmaprobe::session::{ProfilingSession, SessionError};
use tmaprobe::spawn::ProcessLauncher;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Attach to the PID or launch the command under the tracer
fn open_backend(pid: Option<i32>, command: Option<Vec<String>>) -> Result<PtraceBackend> {
    match (pid, command) {
        (Some(pid), None) => PtraceBackend::attach(pid),
        (None, Some(command)) => PtraceBackend::spawn(&command),
        (Some(_), Some(_)) => {
            anyhow::bail!("Cannot specify both -p PID and command. Choose one.");
        }
        (None, None) => {
            anyhow::bail!("Must specify either -p PID or command. Usage: tmaprobe -p PID or tmaprobe -- COMMAND [ARGS...]");
        }
    }
}

fn print_report(
    format: OutputFormat,
    session: &ProfilingSession<ProcessLauncher, ProcResolver, ProcessEnv>,
) -> Result<()> {
    let Some(report) = session.report() else {
        return Ok(());
    };
    let function = session
        .target()
        .map(|t| t.symbol_name.as_str())
        .unwrap_or_default();

    match format {
        OutputFormat::Text => print!("{}", report::render_text(function, report)),
        OutputFormat::Json => println!(
            "{}",
            report::render_json(function, session.state(), report)
                .context("Failed to serialize report")?
        ),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let mut backend = open_backend(args.pid, args.command)?;

    let resolver = match args.image {
        Some(image) => ProcResolver::with_image(image),
        None => ProcResolver::new(),
    };
    let mut session = ProfilingSession::new(ProcessLauncher, ProcessEnv, resolver);

    let outcome = session.run(&mut backend);
    print_report(args.format, &session)?;

    match outcome {
        Ok(report) => {
            if !report.all_helpers_succeeded() {
                eprintln!(
                    "[tmaprobe: measurement incomplete, see {}]",
                    report.output_file.display()
                );
            }
        }
        // Nothing to forward from a spawned target that is already gone
        Err(SessionError::TargetExited { code, state }) => {
            eprintln!("[tmaprobe: target exited with code {code} before the measurement finished ({state:?})]");
            std::process::exit(code);
        }
        Err(e) => return Err(e).context("Profiling session failed"),
    }

    if backend.is_spawned() {
        let code = backend.wait_for_exit()?;
        std::process::exit(code);
    }

    Ok(())
}
