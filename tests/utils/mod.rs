// Test doubles for driving sessions without launching or tracing processes
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tmaprobe::hooks::{
    HookError, HookHit, HookId, HookKind, InstrumentationBackend, StartupStatus, Stop,
};
use tmaprobe::maps::{parse_maps, ModuleMapping};
use tmaprobe::resolver::{resolve_in, AddressResolution, CodeAddress, ResolveError};
use tmaprobe::spawn::{ChildProcessSpec, HelperExit, HelperHandle, Launcher, SpawnError};
use tmaprobe::symbols::{ElfSymbols, Symbol};

pub const IMAGE: &str = "/opt/app/bin/server";
pub const LOAD_BASE: u64 = 0x5555_0000_0000;
pub const HOT_LOOP_OFFSET: u64 = 0xABC0;
pub const HOT_LOOP_ADDR: u64 = LOAD_BASE + HOT_LOOP_OFFSET;
pub const RETURN_ADDR: u64 = LOAD_BASE + 0x1234;

/// Environment for Scenario A style sessions
pub fn scenario_env() -> HashMap<String, String> {
    env(&[
        ("TMA_FUNCTION", "hot_loop"),
        ("TMA_CORE", "0-1"),
        ("TMA_OUTPUT_FILE", "/tmp/out.txt"),
        ("TMA_LEVEL", "L2"),
    ])
}

pub fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// What happened to the launched helpers, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    Launched(Vec<String>),
    Interrupted(String),
    Waited(String),
}

/// Records launches instead of starting processes
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    pub log: Rc<RefCell<Vec<LaunchEvent>>>,
    /// Programs whose launch fails with NotFound
    pub failing: Vec<String>,
    /// Programs that cannot be signalled (EPERM)
    pub unsignalable: Vec<String>,
    next_pid: u32,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: 1000,
            ..Default::default()
        }
    }

    pub fn failing(program: &str) -> Self {
        Self {
            failing: vec![program.to_string()],
            ..Self::new()
        }
    }

    pub fn unsignalable(program: &str) -> Self {
        Self {
            unsignalable: vec![program.to_string()],
            ..Self::new()
        }
    }

    pub fn events(&self) -> Vec<LaunchEvent> {
        self.log.borrow().clone()
    }

    pub fn launches(&self) -> Vec<Vec<String>> {
        self.log
            .borrow()
            .iter()
            .filter_map(|e| match e {
                LaunchEvent::Launched(argv) => Some(argv.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Launcher for RecordingLauncher {
    type Handle = RecordedHandle;

    fn launch(&mut self, spec: &ChildProcessSpec) -> Result<RecordedHandle, SpawnError> {
        let program = spec.program().ok_or(SpawnError::EmptyArgv)?.to_string();
        if self.failing.contains(&program) {
            return Err(SpawnError::Launch {
                program,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        self.log
            .borrow_mut()
            .push(LaunchEvent::Launched(spec.argv.clone()));
        self.next_pid += 1;
        Ok(RecordedHandle {
            pid: self.next_pid,
            interrupt_fails: self.unsignalable.contains(&program),
            program,
            interrupted: false,
            log: Rc::clone(&self.log),
        })
    }
}

#[derive(Debug)]
pub struct RecordedHandle {
    pid: u32,
    program: String,
    interrupted: bool,
    interrupt_fails: bool,
    log: Rc<RefCell<Vec<LaunchEvent>>>,
}

impl HelperHandle for RecordedHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn program(&self) -> &str {
        &self.program
    }

    fn interrupt(&mut self) -> Result<(), SpawnError> {
        if self.interrupt_fails {
            return Err(SpawnError::Signal {
                program: self.program.clone(),
                pid: self.pid,
                source: nix::errno::Errno::EPERM,
            });
        }
        self.interrupted = true;
        self.log
            .borrow_mut()
            .push(LaunchEvent::Interrupted(self.program.clone()));
        Ok(())
    }

    fn wait(&mut self) -> Result<HelperExit, SpawnError> {
        self.log
            .borrow_mut()
            .push(LaunchEvent::Waited(self.program.clone()));
        Ok(if self.interrupted {
            HelperExit::Signal(libc::SIGINT)
        } else {
            HelperExit::Code(0)
        })
    }
}

/// Resolves against a fixed symbol table and maps snapshot
pub struct SnapshotResolver {
    pub symbols: ElfSymbols,
    pub mappings: Vec<ModuleMapping>,
    pub image: PathBuf,
    pub calls: Cell<u32>,
}

impl SnapshotResolver {
    /// `hot_loop` at offset 0xABC0 in an image loaded at 0x555500000000
    pub fn scenario() -> Self {
        let maps = format!(
            "555500000000-555500001000 r--p 00000000 08:01 42 {IMAGE}\n\
             555500001000-555500010000 r-xp 00001000 08:01 42 {IMAGE}\n\
             555500010000-555500012000 rw-p 00010000 08:01 42 {IMAGE}\n"
        );
        Self {
            symbols: ElfSymbols::from_symbols(vec![
                Symbol::new("main", 0x1100, 64),
                Symbol::new("hot_loop", HOT_LOOP_OFFSET, 256),
            ]),
            mappings: parse_maps(&maps).unwrap(),
            image: PathBuf::from(IMAGE),
            calls: Cell::new(0),
        }
    }
}

impl AddressResolution for SnapshotResolver {
    fn resolve(&self, pid: i32, symbol_name: &str) -> Result<CodeAddress, ResolveError> {
        self.calls.set(self.calls.get() + 1);
        resolve_in(pid, &self.symbols, &self.mappings, Path::new(&self.image), symbol_name)
    }
}

/// One step of the target's scripted execution
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Control reaches this address; fires a hook if one is installed there
    Reach(u64),
    Exit(i32),
}

/// Replays a scripted execution against whatever hooks are installed
pub struct ScriptedBackend {
    pub pid: i32,
    pub script: VecDeque<Step>,
    pub return_address: u64,
    pub hooks: HashMap<u64, (HookId, HookKind)>,
    pub registered: Vec<(HookKind, u64)>,
    pub removed: Vec<HookId>,
    pub startups: Vec<StartupStatus>,
    pub released: bool,
    next_id: u32,
}

impl ScriptedBackend {
    pub fn new(pid: i32, script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            pid,
            script: script.into_iter().collect(),
            return_address: RETURN_ADDR,
            hooks: HashMap::new(),
            registered: Vec::new(),
            removed: Vec::new(),
            startups: Vec::new(),
            released: false,
            next_id: 0,
        }
    }

    fn register(&mut self, addr: CodeAddress, kind: HookKind) -> Result<HookId, HookError> {
        if self.hooks.contains_key(&addr.get()) {
            return Err(HookError::AddressInUse);
        }
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.insert(addr.get(), (id, kind));
        self.registered.push((kind, addr.get()));
        Ok(id)
    }
}

impl InstrumentationBackend for ScriptedBackend {
    fn target_pid(&self) -> i32 {
        self.pid
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
            .find(|(_, (hook, _))| *hook == id)
            .map(|(addr, _)| *addr)
            .ok_or(HookError::UnknownHook(id))?;
        self.hooks.remove(&addr);
        self.removed.push(id);
        Ok(())
    }

    fn resume(&mut self) -> Result<Stop, HookError> {
        while let Some(step) = self.script.pop_front() {
            match step {
                Step::Exit(code) => return Ok(Stop::Exited(code)),
                Step::Reach(addr) => {
                    let Some(&(id, kind)) = self.hooks.get(&addr) else {
                        continue;
                    };
                    if kind == HookKind::OneShot {
                        self.hooks.remove(&addr);
                    }
                    return Ok(Stop::Hook(HookHit { id, kind }));
                }
            }
        }
        Err(HookError::NotStopped)
    }

    fn return_address(&self) -> Result<CodeAddress, HookError> {
        Ok(CodeAddress::new(self.return_address))
    }

    fn startup(&mut self, status: &StartupStatus) -> Result<(), HookError> {
        self.startups.push(status.clone());
        Ok(())
    }

    fn release(&mut self) -> Result<(), HookError> {
        self.hooks.clear();
        self.released = true;
        Ok(())
    }
}
