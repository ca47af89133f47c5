//! tmaprobe - function-scoped top-down microarchitecture analysis
//!
//! Measures exactly the dynamic extent of one call of a named function in a
//! target process. The function is resolved to a runtime address from the
//! image's symbol table and the live memory maps, an entry hook starts the
//! helper tools (`taskset`, then `perf stat` or `toplev.py`) when the
//! function is entered, and a one-shot hook on the call's return address
//! stops the counter tool when it returns.

pub mod cli;
pub mod config;
pub mod hooks;
pub mod maps;
pub mod orchestrator;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace_backend;
pub mod record;
pub mod report;
pub mod resolver;
pub mod session;
pub mod spawn;
pub mod symbols;
