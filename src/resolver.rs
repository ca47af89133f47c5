//! Runtime address resolution for a named function
//!
//! Combines the image's symbol table with the live memory mappings of the
//! process: `address = load_base + symbol.offset`.
//!
//! # Load base selection
//!
//! Among the mappings backed by the image, the one with the lowest start
//! address that is *not* executable is taken as the load base. For
//! position-independent images the first (read-only) segment is mapped at
//! the load bias, which makes it a stable reference point. Images whose
//! executable and non-executable segments carry different biases resolve
//! incorrectly; this layout is not supported.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::maps::{self, ModuleMapping};
use crate::symbols::{ElfSymbols, Symbol};

/// Failure to turn a symbol name into a runtime address
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Image {0} has no usable symbol table (stripped binary?)")]
    SymbolsUnavailable(PathBuf),

    #[error("Symbol '{symbol}' not found in {image}")]
    SymbolNotFound { symbol: String, image: PathBuf },

    #[error("Image {image} is not mapped in process {pid}")]
    ModuleNotMapped { pid: i32, image: PathBuf },

    #[error("Failed to read memory maps of process {pid}: {source}")]
    MapsUnavailable {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed memory map line: {0}")]
    InvalidMapsLine(String),

    #[error("Failed to read image {path}: {source}")]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Absolute runtime address of code in the target
///
/// Knowing it defeats ASLR for the target process, so it formats as a
/// redacted placeholder. Only [`CodeAddress::get`] exposes the value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeAddress(u64);

impl CodeAddress {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CodeAddress(<redacted>)")
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// The function a session watches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFunction {
    pub symbol_name: String,
    resolved: Option<CodeAddress>,
}

impl TargetFunction {
    pub fn new(symbol_name: impl Into<String>) -> Self {
        Self {
            symbol_name: symbol_name.into(),
            resolved: None,
        }
    }

    /// Record the resolved address; only the first call has an effect
    pub fn set_resolved(&mut self, addr: CodeAddress) {
        if self.resolved.is_none() {
            self.resolved = Some(addr);
        }
    }

    pub fn resolved(&self) -> Option<CodeAddress> {
        self.resolved
    }
}

/// Pick the load base of `image` from `mappings`
///
/// Lowest start address among non-executable mappings of the image,
/// independent of the order the mappings are listed in.
pub fn select_load_base(mappings: &[ModuleMapping], image: &Path) -> Option<u64> {
    mappings
        .iter()
        .filter(|m| m.is_backed_by(image) && !m.permissions.execute)
        .map(|m| m.start)
        .min()
}

/// Resolve `symbol_name` against an already-read symbol table and mapping snapshot
///
/// Either both the symbol and the load base are found and the full address
/// is returned, or an error is; nothing is partially computed.
pub fn resolve_in(
    pid: i32,
    symbols: &ElfSymbols,
    mappings: &[ModuleMapping],
    image: &Path,
    symbol_name: &str,
) -> Result<CodeAddress, ResolveError> {
    let symbol: &Symbol = symbols
        .find(symbol_name)
        .ok_or_else(|| ResolveError::SymbolNotFound {
            symbol: symbol_name.to_string(),
            image: image.to_path_buf(),
        })?;

    let base = select_load_base(mappings, image).ok_or_else(|| ResolveError::ModuleNotMapped {
        pid,
        image: image.to_path_buf(),
    })?;

    let addr = base
        .checked_add(symbol.offset)
        .ok_or_else(|| ResolveError::ModuleNotMapped {
            pid,
            image: image.to_path_buf(),
        })?;

    debug!(
        pid,
        symbol = %symbol.unmangled_name,
        size = symbol.size,
        link_base = format_args!("{:#x}", symbols.link_base()),
        "resolved target function"
    );
    Ok(CodeAddress::new(addr))
}

/// Anything that can turn a function name into a runtime address in `pid`
pub trait AddressResolution {
    fn resolve(&self, pid: i32, symbol_name: &str) -> Result<CodeAddress, ResolveError>;
}

/// Resolves against the live process through `/proc`
///
/// The image defaults to the process executable (`/proc/<pid>/exe`).
#[derive(Debug, Clone, Default)]
pub struct ProcResolver {
    image: Option<PathBuf>,
}

impl ProcResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve inside a specific image (e.g. a shared library) instead of the executable
    pub fn with_image(image: impl Into<PathBuf>) -> Self {
        Self {
            image: Some(image.into()),
        }
    }
}

impl AddressResolution for ProcResolver {
    fn resolve(&self, pid: i32, symbol_name: &str) -> Result<CodeAddress, ResolveError> {
        let image = match &self.image {
            Some(image) => image.clone(),
            None => executable_path(pid)?,
        };
        let symbols = ElfSymbols::load(&image)?;
        // Fresh snapshot on every attempt
        let mappings = maps::read_mappings(pid)?;
        resolve_in(pid, &symbols, &mappings, &image, symbol_name)
    }
}

/// Path of the executable backing `pid`
pub fn executable_path(pid: i32) -> Result<PathBuf, ResolveError> {
    let link = PathBuf::from(format!("/proc/{pid}/exe"));
    std::fs::read_link(&link).map_err(|source| ResolveError::ImageUnreadable { path: link, source })
}
