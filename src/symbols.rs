//! Function symbols of an ELF image
//!
//! Reads `.symtab` (and `.dynsym` as a fallback) with the object crate and
//! demangles Rust and Itanium C++ names so targets can be named the way a
//! human writes them.

use std::fs::File;
use std::path::Path;

use object::{Object, ObjectSymbol, SymbolKind};
use tracing::debug;

use crate::resolver::ResolveError;

/// A function symbol as recorded in the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Raw (possibly mangled) name
    pub name: String,
    /// Demangled name, equal to `name` when it was not mangled
    pub unmangled_name: String,
    /// Address relative to the image's lowest loadable segment
    pub offset: u64,
    pub size: u64,
}

impl Symbol {
    /// Build a symbol, demangling its name
    pub fn new(name: impl Into<String>, offset: u64, size: u64) -> Self {
        let name = name.into();
        let unmangled_name = demangle(&name);
        Self {
            name,
            unmangled_name,
            offset,
            size,
        }
    }

    /// Whether `wanted` names this symbol
    ///
    /// Accepts the raw name, the demangled name, or the demangled name
    /// without its C++ parameter list (`ns::hot_loop` for `ns::hot_loop(int)`).
    pub fn matches(&self, wanted: &str) -> bool {
        self.name == wanted
            || self.unmangled_name == wanted
            || strip_parameters(&self.unmangled_name) == wanted
    }
}

/// Demangle a Rust (legacy or v0) or Itanium C++ symbol
///
/// Names that are not mangled come back unchanged.
pub fn demangle(name: &str) -> String {
    if let Ok(rust) = rustc_demangle::try_demangle(name) {
        // `#` drops the trailing hash
        return format!("{rust:#}");
    }
    if name.starts_with("_Z") {
        if let Ok(cpp) = cpp_demangle::Symbol::new(name) {
            return cpp.to_string();
        }
    }
    name.to_string()
}

fn strip_parameters(unmangled: &str) -> &str {
    match unmangled.find('(') {
        Some(idx) if idx > 0 => &unmangled[..idx],
        _ => unmangled,
    }
}

/// Symbol table of one image
#[derive(Debug, Clone)]
pub struct ElfSymbols {
    symbols: Vec<Symbol>,
    link_base: u64,
}

impl ElfSymbols {
    /// Load every defined function symbol from the image at `path`
    ///
    /// Fails with [`ResolveError::SymbolsUnavailable`] when the image carries
    /// neither a static nor a dynamic symbol table with functions in it
    /// (a stripped binary).
    pub fn load(path: &Path) -> Result<Self, ResolveError> {
        let unreadable = |source: std::io::Error| ResolveError::ImageUnreadable {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(unreadable)?;
        // The image is only read while the map is alive below
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(unreadable)?;
        let object = object::File::parse(&*mmap).map_err(|e| ResolveError::ImageUnreadable {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        // 0 for PIE and shared objects, the fixed link address (0x400000) otherwise
        let link_base = object.relative_address_base();
        let mut symbols: Vec<Symbol> = object
            .symbols()
            .filter_map(|symbol| function_symbol(symbol, link_base))
            .collect();
        let from_symtab = symbols.len();
        symbols.extend(
            object
                .dynamic_symbols()
                .filter_map(|symbol| function_symbol(symbol, link_base)),
        );

        debug!(
            image = %path.display(),
            link_base = format_args!("{link_base:#x}"),
            symtab = from_symtab,
            dynsym = symbols.len() - from_symtab,
            "loaded function symbols"
        );

        if symbols.is_empty() {
            return Err(ResolveError::SymbolsUnavailable(path.to_path_buf()));
        }
        Ok(Self { symbols, link_base })
    }

    /// Wrap an already-built symbol list of a position-independent image
    pub fn from_symbols(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            link_base: 0,
        }
    }

    /// Virtual address the image was linked at
    pub fn link_base(&self) -> u64 {
        self.link_base
    }

    /// First symbol named `wanted`, in table order
    pub fn find(&self, wanted: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|symbol| symbol.matches(wanted))
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Offset of a linked address from the image's link base
///
/// The load base found in `/proc/<pid>/maps` is where the lowest segment
/// landed, so symbol addresses are rebased onto that segment.
fn image_offset(address: u64, link_base: u64) -> Option<u64> {
    address.checked_sub(link_base)
}

fn function_symbol<'data, S: ObjectSymbol<'data>>(symbol: S, link_base: u64) -> Option<Symbol> {
    if symbol.kind() != SymbolKind::Text || !symbol.is_definition() || symbol.address() == 0 {
        return None;
    }
    let name = symbol.name().ok()?;
    if name.is_empty() {
        return None;
    }
    let offset = image_offset(symbol.address(), link_base)?;
    Some(Symbol::new(name, offset, symbol.size()))
}
