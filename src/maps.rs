//! Live memory mappings of a process
//!
//! Parses `/proc/<pid>/maps` into [`ModuleMapping`] entries. Mappings are
//! always read fresh: load addresses change on every run under ASLR, so a
//! snapshot is only meaningful for the resolution attempt that took it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::resolver::ResolveError;

/// Access permissions of a mapping (the `rwxp` column)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// `s` (shared) instead of `p` (private)
    pub shared: bool,
}

impl Permissions {
    /// Parse the four-character permission field, e.g. `r-xp`
    pub fn parse(field: &str) -> Option<Self> {
        let bytes = field.as_bytes();
        if bytes.len() != 4 {
            return None;
        }
        Some(Self {
            read: bytes[0] == b'r',
            write: bytes[1] == b'w',
            execute: bytes[2] == b'x',
            shared: bytes[3] == b's',
        })
    }
}

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMapping {
    /// Backing file, `None` for anonymous mappings
    pub path: Option<PathBuf>,
    pub start: u64,
    pub end: u64,
    pub permissions: Permissions,
}

impl ModuleMapping {
    /// Whether this mapping is backed by `image`
    pub fn is_backed_by(&self, image: &Path) -> bool {
        self.path.as_deref() == Some(image)
    }

    /// Check if an address falls within this mapping
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Read the current mappings of `pid`
pub fn read_mappings(pid: i32) -> Result<Vec<ModuleMapping>, ResolveError> {
    let maps_path = format!("/proc/{pid}/maps");
    let text = fs::read_to_string(&maps_path)
        .map_err(|source| ResolveError::MapsUnavailable { pid, source })?;

    let mappings = parse_maps(&text)?;
    trace!(pid, count = mappings.len(), "read memory mappings");
    Ok(mappings)
}

/// Parse the text of a maps file, preserving line order
pub fn parse_maps(text: &str) -> Result<Vec<ModuleMapping>, ResolveError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

/// Parse one line: "start-end perms offset dev inode   pathname"
fn parse_line(line: &str) -> Result<ModuleMapping, ResolveError> {
    let invalid = || ResolveError::InvalidMapsLine(line.to_string());

    // The pathname may contain spaces, so peel off the five fixed fields
    // one at a time and keep the remainder verbatim.
    let mut rest = line;
    let mut fields = [""; 5];
    for field in &mut fields {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        *field = &rest[..end];
        rest = &rest[end..];
    }
    let [range, perms, _offset, _dev, _inode] = fields;

    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start = u64::from_str_radix(start, 16).map_err(|_| invalid())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| invalid())?;
    let permissions = Permissions::parse(perms).ok_or_else(invalid)?;

    let path = rest.trim();
    let path = if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    };

    Ok(ModuleMapping {
        path,
        start,
        end,
        permissions,
    })
}
