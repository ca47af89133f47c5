//! Direct call interception with ptrace software breakpoints
//!
//! x86-64 Linux only. Hooks are `int3` instructions patched over the first
//! byte at the hooked address. When one fires, the instruction pointer of
//! the thread that hit it is rewound onto the original instruction, so its
//! registers look as if it had never been hooked. Persistent hooks are
//! stepped over on the next resume and put back.
//!
//! Every thread of the target is traced. Threads present at attach time are
//! attached one by one, and later ones are picked up by `PTRACE_O_TRACECLONE`.
//! Threads run independently: only the thread that hit a hook is held while
//! the hit is handled. A one-shot hook belongs to the thread that was stopped
//! when it was registered; other threads pass through it unreported.
//! Children the target forks inherit the patched text, so their bytes are
//! restored before they are let go.
//!
//! Stops are collected per thread with `waitpid`. The helper tools are our
//! children too, so the loop sleeps on a `SIGCHLD` signalfd instead of
//! waiting on any child, and never reaps them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io::IoSliceMut;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::ptrace::{self, AddressType, Event, Options};
use nix::sys::signal::{self, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, trace, warn};

use crate::hooks::{
    HookError, HookHit, HookId, HookKind, InstrumentationBackend, StartupStatus, Stop,
};
use crate::resolver::CodeAddress;

/// x86 breakpoint instruction
const INT3: u8 = 0xCC;

fn ptrace_err(operation: &'static str) -> impl Fn(Errno) -> HookError {
    move |source| HookError::Ptrace { operation, source }
}

#[derive(Debug)]
struct Breakpoint {
    id: HookId,
    kind: HookKind,
    original: u8,
    /// Only this thread's hits are reported
    owner: Option<Pid>,
}

#[derive(Debug, Default)]
struct Task {
    /// In a ptrace-stop that has not been resumed yet
    stopped: bool,
    /// Auto-attached; its first stop is the attach SIGSTOP
    starting: bool,
    /// Signal to deliver when the thread is resumed
    pending: Option<Signal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Attached to a process someone else started
    Attached,
    /// Our own child, traced since exec
    Spawned,
}

fn trace_options(mode: Mode) -> Options {
    let options = Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC;
    match mode {
        // Never leave a half-instrumented child behind if we die
        Mode::Spawned => options | Options::PTRACE_O_EXITKILL,
        Mode::Attached => options,
    }
}

/// Thread ids listed under `/proc/<pid>/task`
fn thread_ids(pid: Pid) -> std::io::Result<Vec<Pid>> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let name = entry?.file_name();
        if let Some(tid) = name.to_str().and_then(|name| name.parse().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort();
    Ok(tids)
}

fn is_thread_of(pid: Pid, tid: Pid) -> bool {
    Path::new(&format!("/proc/{pid}/task/{tid}")).exists()
}

/// How a SIGTRAP stop relates to our breakpoints
enum Trap {
    Report(Stop),
    /// Ours, but not reported; the thread is already running again
    Absorbed,
    Foreign,
}

/// ptrace-based [`InstrumentationBackend`]
#[derive(Debug)]
pub struct PtraceBackend {
    pid: Pid,
    mode: Mode,
    tasks: BTreeMap<Pid, Task>,
    /// Children forked by the target, awaiting their first stop; `true` when
    /// they share our text with the target
    forks: BTreeMap<Pid, bool>,
    /// Installed hooks by address
    hooks: HashMap<u64, Breakpoint>,
    /// Addresses of removed hooks, for traps that were already in flight
    retired: HashSet<u64>,
    next_id: u32,
    /// Thread held at the last reported hook, and the hook's address
    current: Option<(Pid, u64)>,
    /// Stops of other threads collected while single-stepping one
    deferred: VecDeque<WaitStatus>,
    sigchld: SignalFd,
    exited: bool,
    released: bool,
}

impl PtraceBackend {
    /// Attach to every thread of a running process
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);

        ptrace::attach(pid).context(format!("Failed to attach to PID {pid}"))?;
        let mut backend = Self::new(pid, Mode::Attached)?;

        // Wait for SIGSTOP from PTRACE_ATTACH
        backend
            .await_attach_stop(pid)
            .context("Failed to wait for attach signal")?;

        // Threads keep appearing until every existing one is stopped
        loop {
            let known = &backend.tasks;
            let fresh: Vec<Pid> = thread_ids(pid)
                .context(format!("Failed to list threads of PID {pid}"))?
                .into_iter()
                .filter(|tid| !known.contains_key(tid))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for tid in fresh {
                match ptrace::attach(tid) {
                    Ok(()) => backend
                        .await_attach_stop(tid)
                        .context(format!("Failed to wait for thread {tid}"))?,
                    // Exited since the listing
                    Err(Errno::ESRCH) => continue,
                    Err(e) => {
                        return Err(e).context(format!("Failed to attach to thread {tid}"))
                    }
                }
            }
        }

        for tid in backend.tasks.keys() {
            ptrace::setoptions(*tid, trace_options(Mode::Attached))
                .context("Failed to set ptrace options")?;
        }

        info!(%pid, threads = backend.tasks.len(), "attached to process");
        Ok(backend)
    }

    /// Launch `command` stopped right after exec, traced from its first instruction
    pub fn spawn(command: &[String]) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Command array is empty");
        }

        let program = &command[0];
        let args = &command[1..];

        match unsafe { fork() }.context("Failed to fork")? {
            ForkResult::Parent { child } => {
                // Stop delivered by exec under PTRACE_TRACEME
                match waitpid(child, None).context("Failed to wait for child")? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                    WaitStatus::Exited(_, code) => {
                        anyhow::bail!("Failed to exec {program} (exit code {code})")
                    }
                    other => anyhow::bail!("Unexpected initial stop of {program}: {other:?}"),
                }

                ptrace::setoptions(child, trace_options(Mode::Spawned))
                    .context("Failed to set ptrace options")?;

                let mut backend = Self::new(child, Mode::Spawned)?;
                backend.tasks.insert(
                    child,
                    Task {
                        stopped: true,
                        ..Task::default()
                    },
                );
                info!(pid = %child, %program, "launched traced command");
                Ok(backend)
            }
            ForkResult::Child => {
                // Child: allow tracing and exec target program
                if let Err(e) = ptrace::traceme() {
                    eprintln!("Failed to PTRACE_TRACEME: {e}");
                    std::process::exit(127);
                }

                let err = Command::new(program).args(args).exec();

                // If we get here, exec failed
                eprintln!("Failed to exec {program}: {err}");
                std::process::exit(127);
            }
        }
    }

    fn new(pid: Pid, mode: Mode) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.thread_block().context("Failed to block SIGCHLD")?;
        let sigchld = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)
            .context("Failed to create SIGCHLD signalfd")?;

        Ok(Self {
            pid,
            mode,
            tasks: BTreeMap::new(),
            forks: BTreeMap::new(),
            hooks: HashMap::new(),
            retired: HashSet::new(),
            next_id: 0,
            current: None,
            deferred: VecDeque::new(),
            sigchld,
            exited: false,
            released: false,
        })
    }

    /// Whether the target was launched by this backend
    pub fn is_spawned(&self) -> bool {
        self.mode == Mode::Spawned
    }

    /// Wait for a spawned target to terminate and return its exit code
    ///
    /// Call after [`InstrumentationBackend::release`].
    pub fn wait_for_exit(&mut self) -> Result<i32> {
        if !self.is_spawned() {
            anyhow::bail!("Only a spawned target can be waited for");
        }
        loop {
            match waitpid(self.pid, None).context("Failed to waitpid")? {
                WaitStatus::Exited(_, code) => return Ok(code),
                WaitStatus::Signaled(_, sig, _) => return Ok(128 + sig as i32),
                _ => continue,
            }
        }
    }

    fn await_attach_stop(&mut self, tid: Pid) -> Result<()> {
        let mut pending = None;
        loop {
            match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
                WaitStatus::Stopped(_, sig) => {
                    // Arrived ahead of the attach stop; delivered on resume
                    pending = Some(sig);
                    ptrace::cont(tid, None)?;
                }
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    if tid == self.pid {
                        anyhow::bail!("Process {tid} exited while being attached");
                    }
                    return Ok(());
                }
                _ => ptrace::cont(tid, None)?,
            }
        }
        self.tasks.insert(
            tid,
            Task {
                stopped: true,
                pending,
                ..Task::default()
            },
        );
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), HookError> {
        if self.exited || self.released {
            Err(HookError::NotStopped)
        } else {
            Ok(())
        }
    }

    /// A thread in ptrace-stop, through which text can be read and written
    fn stopped_task(&self) -> Result<Pid, HookError> {
        self.current
            .map(|(tid, _)| tid)
            .or_else(|| {
                self.tasks
                    .iter()
                    .find(|(_, task)| task.stopped)
                    .map(|(tid, _)| *tid)
            })
            .ok_or(HookError::NotStopped)
    }

    /// Replace the byte at `addr`, returning the byte that was there
    fn poke_byte(tid: Pid, addr: u64, byte: u8) -> Result<u8, Errno> {
        let word = ptrace::read(tid, addr as AddressType)?;
        let original = (word & 0xff) as u8;
        let patched = (word & !0xff) | libc::c_long::from(byte);
        ptrace::write(tid, addr as AddressType, patched)?;
        Ok(original)
    }

    fn register(&mut self, addr: CodeAddress, kind: HookKind) -> Result<HookId, HookError> {
        self.ensure_live()?;
        let addr = addr.get();
        if self.hooks.contains_key(&addr) {
            return Err(HookError::AddressInUse);
        }

        let tid = self.stopped_task()?;
        let original = Self::poke_byte(tid, addr, INT3).map_err(HookError::InvalidAddress)?;
        let owner = match kind {
            HookKind::Entry => None,
            HookKind::OneShot => self.current.map(|(tid, _)| tid),
        };
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.insert(
            addr,
            Breakpoint {
                id,
                kind,
                original,
                owner,
            },
        );
        self.retired.remove(&addr);

        trace!(hook = %id, ?kind, ?owner, "breakpoint inserted");
        Ok(id)
    }

    /// Take the hook at `addr` out, writing through the stopped thread `tid`
    fn unhook(&mut self, tid: Pid, addr: u64) -> Result<Option<Breakpoint>, HookError> {
        let Some(bp) = self.hooks.remove(&addr) else {
            return Ok(None);
        };
        Self::poke_byte(tid, addr, bp.original).map_err(HookError::InvalidAddress)?;
        self.retired.insert(addr);
        Ok(Some(bp))
    }

    /// Next status of any traced thread or pending fork
    fn next_event(&mut self) -> Result<WaitStatus, HookError> {
        loop {
            let watched: Vec<Pid> = self
                .tasks
                .keys()
                .chain(self.forks.keys())
                .copied()
                .collect();
            if watched.is_empty() {
                return Err(ptrace_err("waitpid")(Errno::ECHILD));
            }

            for tid in watched {
                match waitpid(tid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => {}
                    Ok(status) => {
                        trace!(?status, "stop");
                        return Ok(status);
                    }
                    Err(Errno::ECHILD) if tid != self.pid => {
                        self.tasks.remove(&tid);
                        self.forks.remove(&tid);
                    }
                    Err(e) => return Err(ptrace_err("waitpid")(e)),
                }
            }

            // Any child changing state raises SIGCHLD
            self.sigchld
                .read_signal()
                .map_err(ptrace_err("signalfd read"))?;
        }
    }

    /// Resume `tid`, delivering `sig` or whatever signal it was holding
    fn cont_task(&mut self, tid: Pid, sig: Option<Signal>) -> Result<(), HookError> {
        let pending = self.tasks.get_mut(&tid).and_then(|task| {
            task.stopped = false;
            task.pending.take()
        });
        match ptrace::cont(tid, sig.or(pending)) {
            // Killed meanwhile; its exit is still to be collected
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ptrace_err("PTRACE_CONT")(e)),
        }
    }

    fn resume_stopped(&mut self) -> Result<(), HookError> {
        let stopped: Vec<Pid> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.stopped)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in stopped {
            self.cont_task(tid, None)?;
        }
        Ok(())
    }

    fn exit_with(&mut self, code: i32) -> Stop {
        self.exited = true;
        self.hooks.clear();
        self.tasks.clear();
        self.deferred.clear();
        self.current = None;
        Stop::Exited(code)
    }

    /// Forget a thread that terminated; the process ends with its leader
    fn task_gone(&mut self, tid: Pid, code: i32) -> Option<Stop> {
        self.tasks.remove(&tid);
        if self.current.is_some_and(|(held, _)| held == tid) {
            self.current = None;
        }
        if tid == self.pid {
            Some(self.exit_with(code))
        } else {
            trace!(%tid, code, "thread exited");
            None
        }
    }

    /// Bookkeeping for a ptrace event stop; returns a newly traced thread
    fn note_event(&mut self, tid: Pid, event: i32) -> Result<Option<Pid>, HookError> {
        let child = || {
            ptrace::getevent(tid)
                .map(|msg| Pid::from_raw(msg as libc::pid_t))
                .map_err(ptrace_err("PTRACE_GETEVENTMSG"))
        };

        if event == Event::PTRACE_EVENT_CLONE as i32 {
            let child = child()?;
            if is_thread_of(self.pid, child) {
                debug!(parent = %tid, thread = %child, "tracing new thread");
                self.tasks.entry(child).or_insert(Task {
                    starting: true,
                    ..Task::default()
                });
                return Ok(Some(child));
            }
            self.forks.insert(child, true);
        } else if event == Event::PTRACE_EVENT_FORK as i32 {
            self.forks.insert(child()?, false);
        } else if event == Event::PTRACE_EVENT_VFORK as i32 {
            self.forks.insert(child()?, true);
        } else if event == Event::PTRACE_EVENT_EXEC as i32 {
            // New image: its text carries none of our hooks and the other threads are gone
            debug!(pid = %self.pid, "target executed a new image");
            let leader = self.pid;
            self.hooks.clear();
            self.retired.clear();
            self.deferred.clear();
            self.current = None;
            self.tasks.retain(|tid, _| *tid == leader);
            self.tasks.entry(leader).or_default();
        }
        Ok(None)
    }

    /// Hand a forked child back to itself with the original text
    fn let_go_fork(&self, child: Pid, shares_text: bool, status: WaitStatus) {
        if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
            return;
        }
        // A vfork child runs on the target's own memory until it execs
        if !shares_text {
            for (addr, bp) in &self.hooks {
                if let Err(e) = Self::poke_byte(child, *addr, bp.original) {
                    warn!(%child, "failed to restore forked child's text: {e}");
                }
            }
        }
        match ptrace::detach(child, None) {
            Ok(()) => debug!(%child, "released forked child"),
            Err(e) => warn!(%child, "failed to detach forked child: {e}"),
        }
    }

    fn on_event(&mut self, status: WaitStatus) -> Result<Option<Stop>, HookError> {
        if let Some(pid) = status.pid() {
            if let Some(shares_text) = self.forks.remove(&pid) {
                self.let_go_fork(pid, shares_text, status);
                return Ok(None);
            }
        }

        match status {
            WaitStatus::Exited(tid, code) => Ok(self.task_gone(tid, code)),
            WaitStatus::Signaled(tid, sig, _) => Ok(self.task_gone(tid, 128 + sig as i32)),
            WaitStatus::PtraceEvent(tid, _, event) => {
                self.note_event(tid, event)?;
                self.cont_task(tid, None)?;
                Ok(None)
            }
            WaitStatus::Stopped(tid, sig) => self.on_signal(tid, sig),
            _ => Ok(None),
        }
    }

    fn on_signal(&mut self, tid: Pid, sig: Signal) -> Result<Option<Stop>, HookError> {
        if sig == Signal::SIGSTOP {
            if let Some(task) = self.tasks.get_mut(&tid).filter(|task| task.starting) {
                task.starting = false;
                self.cont_task(tid, None)?;
                return Ok(None);
            }
        }

        if sig == Signal::SIGTRAP {
            match self.classify_trap(tid)? {
                Trap::Report(stop) => return Ok(Some(stop)),
                Trap::Absorbed => return Ok(None),
                Trap::Foreign => {}
            }
        }

        let job_control = matches!(
            sig,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        );
        if job_control && matches!(ptrace::getsiginfo(tid), Err(Errno::EINVAL)) {
            // Group-stop: restarting must not send the signal again
            self.cont_task(tid, None)?;
            return Ok(None);
        }

        trace!(%tid, ?sig, "forwarding signal to target");
        self.cont_task(tid, Some(sig))?;
        Ok(None)
    }

    /// Rewind `tid` onto the instruction under a breakpoint it just trapped on
    ///
    /// Returns the breakpoint address, or `None` for a trap that is not ours.
    fn rewind_trap(&self, tid: Pid) -> Result<Option<u64>, HookError> {
        let mut regs = ptrace::getregs(tid).map_err(ptrace_err("PTRACE_GETREGS"))?;
        // rip is one past the int3
        let addr = regs.rip.wrapping_sub(1);
        if !self.hooks.contains_key(&addr) && !self.retired.contains(&addr) {
            return Ok(None);
        }
        regs.rip = addr;
        ptrace::setregs(tid, regs).map_err(ptrace_err("PTRACE_SETREGS"))?;
        Ok(Some(addr))
    }

    fn classify_trap(&mut self, tid: Pid) -> Result<Trap, HookError> {
        let Some(addr) = self.rewind_trap(tid)? else {
            return Ok(Trap::Foreign);
        };

        let (hit, owner) = match self.hooks.get(&addr) {
            Some(bp) => (
                HookHit {
                    id: bp.id,
                    kind: bp.kind,
                },
                bp.owner,
            ),
            None => {
                // Removed while the trap was in flight; the original byte is back
                self.cont_task(tid, None)?;
                return Ok(Trap::Absorbed);
            }
        };

        if owner.is_some_and(|owner| owner != tid) {
            // Same return site reached by another thread
            if let Some(stop) = self.step_over(tid, addr)? {
                return Ok(Trap::Report(stop));
            }
            if self.tasks.contains_key(&tid) {
                self.cont_task(tid, None)?;
            }
            return Ok(Trap::Absorbed);
        }

        if hit.kind == HookKind::OneShot {
            self.unhook(tid, addr)?;
        }
        if let Some(task) = self.tasks.get_mut(&tid) {
            task.stopped = true;
        }
        self.current = Some((tid, addr));
        Ok(Trap::Report(Stop::Hook(hit)))
    }

    /// Run the original instruction under the hook at `addr` on `tid`, then re-arm it
    fn step_over(&mut self, tid: Pid, addr: u64) -> Result<Option<Stop>, HookError> {
        let Some(original) = self.hooks.get(&addr).map(|bp| bp.original) else {
            return Ok(None);
        };
        Self::poke_byte(tid, addr, original).map_err(HookError::InvalidAddress)?;

        let stop = self.single_step(tid)?;
        if stop.is_some() || !self.hooks.contains_key(&addr) {
            return Ok(stop);
        }

        if self.tasks.contains_key(&tid) {
            Self::poke_byte(tid, addr, INT3).map_err(HookError::InvalidAddress)?;
        } else if self.hooks.remove(&addr).is_some() {
            // Nothing stopped to write through; the original byte stays
            warn!(%tid, "thread exited while stepping over a hook; hook dropped");
            self.retired.insert(addr);
        }
        Ok(None)
    }

    /// Execute one instruction on `tid`; other threads' stops are deferred
    fn single_step(&mut self, tid: Pid) -> Result<Option<Stop>, HookError> {
        loop {
            ptrace::step(tid, None).map_err(ptrace_err("PTRACE_SINGLESTEP"))?;
            loop {
                let status = self.next_event()?;
                if status.pid() != Some(tid) {
                    match status {
                        WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                            if let Some(stop) = self.on_event(status)? {
                                return Ok(Some(stop));
                            }
                        }
                        _ => {
                            if let Some(task) = status.pid().and_then(|pid| self.tasks.get_mut(&pid))
                            {
                                task.stopped = false;
                            }
                            self.deferred.push_back(status);
                        }
                    }
                    continue;
                }

                match status {
                    WaitStatus::Exited(_, code) => return Ok(self.task_gone(tid, code)),
                    WaitStatus::Signaled(_, sig, _) => {
                        return Ok(self.task_gone(tid, 128 + sig as i32))
                    }
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => return Ok(None),
                    WaitStatus::Stopped(_, sig) => {
                        // Held back until the step is done
                        if let Some(task) = self.tasks.get_mut(&tid) {
                            task.pending = Some(sig);
                        }
                        break;
                    }
                    WaitStatus::PtraceEvent(_, _, event) => {
                        self.note_event(tid, event)?;
                        break;
                    }
                    _ => return Ok(None),
                }
            }
        }
    }

    /// Bring every running thread into a ptrace-stop
    fn stop_all(&mut self) -> Result<(), HookError> {
        // Threads with a deferred stop are held already; settle them first
        for status in std::mem::take(&mut self.deferred) {
            match status {
                WaitStatus::Stopped(tid, sig) => {
                    let ours = sig == Signal::SIGTRAP && self.rewind_trap(tid)?.is_some();
                    if let Some(task) = self.tasks.get_mut(&tid) {
                        let attach_stop = sig == Signal::SIGSTOP && task.starting;
                        if !ours && !attach_stop {
                            task.pending = Some(sig);
                        }
                        task.starting = false;
                        task.stopped = true;
                    }
                }
                WaitStatus::PtraceEvent(tid, _, event) => {
                    self.note_event(tid, event)?;
                    if let Some(task) = self.tasks.get_mut(&tid) {
                        task.stopped = true;
                    }
                }
                other => {
                    self.on_event(other)?;
                }
            }
        }

        let mut waiting: BTreeSet<Pid> = BTreeSet::new();
        for (tid, task) in &self.tasks {
            if task.stopped {
                continue;
            }
            // SAFETY: tgkill only sends a signal; the ids come from /proc and clone events
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    self.pid.as_raw(),
                    tid.as_raw(),
                    libc::SIGSTOP,
                )
            };
            if ret == 0 {
                waiting.insert(*tid);
            } else {
                trace!(%tid, "tgkill failed: {}", Errno::last());
            }
        }

        while !waiting.is_empty() && !self.exited {
            let status = self.next_event()?;
            self.quiesce(status, &mut waiting)?;
        }
        Ok(())
    }

    /// Handle a stop while waiting for threads to take their SIGSTOP
    fn quiesce(&mut self, status: WaitStatus, waiting: &mut BTreeSet<Pid>) -> Result<(), HookError> {
        if let Some(pid) = status.pid() {
            if let Some(shares_text) = self.forks.remove(&pid) {
                self.let_go_fork(pid, shares_text, status);
                return Ok(());
            }
        }

        let cont = |tid: Pid| match ptrace::cont(tid, None) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ptrace_err("PTRACE_CONT")(e)),
        };

        match status {
            WaitStatus::Exited(tid, code) => {
                waiting.remove(&tid);
                self.task_gone(tid, code);
            }
            WaitStatus::Signaled(tid, sig, _) => {
                waiting.remove(&tid);
                self.task_gone(tid, 128 + sig as i32);
            }
            WaitStatus::Stopped(tid, Signal::SIGSTOP) if waiting.contains(&tid) => {
                waiting.remove(&tid);
                if let Some(task) = self.tasks.get_mut(&tid) {
                    task.stopped = true;
                    task.starting = false;
                }
            }
            WaitStatus::Stopped(tid, sig) => {
                // The SIGSTOP is still queued behind this stop
                let ours = sig == Signal::SIGTRAP && self.rewind_trap(tid)?.is_some();
                if !ours {
                    if let Some(task) = self.tasks.get_mut(&tid) {
                        task.pending = Some(sig);
                    }
                }
                cont(tid)?;
            }
            WaitStatus::PtraceEvent(tid, _, event) => {
                if let Some(thread) = self.note_event(tid, event)? {
                    waiting.insert(thread);
                }
                cont(tid)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Read a u64 value from the target's memory
    fn read_u64(&self, addr: u64) -> Result<u64, HookError> {
        let mut buffer = [0u8; 8];
        let mut local_iov = [IoSliceMut::new(&mut buffer)];
        let remote_iov = [RemoteIoVec {
            base: addr as usize,
            len: 8,
        }];

        process_vm_readv(self.pid, &mut local_iov, &remote_iov)
            .map_err(ptrace_err("process_vm_readv"))?;

        Ok(u64::from_ne_bytes(buffer))
    }
}

impl InstrumentationBackend for PtraceBackend {
    fn target_pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn register_entry_hook(&mut self, addr: CodeAddress) -> Result<HookId, HookError> {
        self.register(addr, HookKind::Entry)
    }

    fn register_one_shot_hook(&mut self, addr: CodeAddress) -> Result<HookId, HookError> {
        self.register(addr, HookKind::OneShot)
    }

    fn remove_hook(&mut self, id: HookId) -> Result<(), HookError> {
        let addr = self
            .hooks
            .iter()
            .find(|(_, bp)| bp.id == id)
            .map(|(addr, _)| *addr)
            .ok_or(HookError::UnknownHook(id))?;

        let tid = self.stopped_task()?;
        self.unhook(tid, addr)?;
        trace!(hook = %id, "breakpoint removed");
        Ok(())
    }

    fn resume(&mut self) -> Result<Stop, HookError> {
        self.ensure_live()?;

        if let Some((tid, addr)) = self.current.take() {
            if let Some(stop) = self.step_over(tid, addr)? {
                return Ok(stop);
            }
        }
        while let Some(status) = self.deferred.pop_front() {
            if let Some(stop) = self.on_event(status)? {
                return Ok(stop);
            }
        }
        self.resume_stopped()?;

        loop {
            let status = self.next_event()?;
            if let Some(stop) = self.on_event(status)? {
                return Ok(stop);
            }
        }
    }

    fn return_address(&self) -> Result<CodeAddress, HookError> {
        let (tid, _) = self.current.ok_or(HookError::NotStopped)?;
        let regs = ptrace::getregs(tid).map_err(ptrace_err("PTRACE_GETREGS"))?;
        // At function entry the call instruction has just pushed the return address
        let ret = self.read_u64(regs.rsp)?;
        Ok(CodeAddress::new(ret))
    }

    fn startup(&mut self, status: &StartupStatus) -> Result<(), HookError> {
        match status {
            StartupStatus::Ready => {
                debug!(pid = %self.pid, threads = self.tasks.len(), "startup complete");
                Ok(())
            }
            StartupStatus::Failed(reason) => {
                warn!(pid = %self.pid, %reason, "startup failed");
                match self.mode {
                    Mode::Spawned => {
                        signal::kill(self.pid, Signal::SIGKILL)
                            .map_err(ptrace_err("kill"))?;
                        while !self.exited {
                            let status = self.next_event()?;
                            trace!(?status, "draining killed target");
                            match status {
                                WaitStatus::Exited(tid, code) => {
                                    self.task_gone(tid, code);
                                }
                                WaitStatus::Signaled(tid, sig, _) => {
                                    self.task_gone(tid, 128 + sig as i32);
                                }
                                other => {
                                    if let Some(pid) = other.pid() {
                                        if let Some(shares_text) = self.forks.remove(&pid) {
                                            self.let_go_fork(pid, shares_text, other);
                                        }
                                    }
                                }
                            }
                        }
                        Ok(())
                    }
                    Mode::Attached => self.release(),
                }
            }
        }
    }

    fn release(&mut self) -> Result<(), HookError> {
        if self.exited || self.released {
            return Ok(());
        }
        if self.tasks.is_empty() {
            self.released = true;
            return Ok(());
        }

        self.stop_all()?;
        if self.exited {
            return Ok(());
        }

        let tid = self.stopped_task()?;
        let addrs: Vec<u64> = self.hooks.keys().copied().collect();
        for addr in addrs {
            self.unhook(tid, addr)?;
        }
        self.current = None;

        // Forks still owe their first stop
        for (child, shares_text) in std::mem::take(&mut self.forks) {
            match waitpid(child, Some(WaitPidFlag::__WALL)) {
                Ok(status) => self.let_go_fork(child, shares_text, status),
                Err(e) => warn!(%child, "failed to wait for forked child: {e}"),
            }
        }

        for (tid, task) in std::mem::take(&mut self.tasks) {
            match ptrace::detach(tid, task.pending) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(ptrace_err("PTRACE_DETACH")(e)),
            }
        }
        self.released = true;
        info!(pid = %self.pid, "detached from target");
        Ok(())
    }
}

impl Drop for PtraceBackend {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release target on drop: {e}");
        }
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        if let Err(e) = mask.thread_unblock() {
            warn!("failed to unblock SIGCHLD: {e}");
        }
    }
}
