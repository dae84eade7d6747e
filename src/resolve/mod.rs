//! Symbol resolution for replacement modules
//!
//! The engine never decides where a redirected import should point; it asks a
//! [`SymbolResolver`]. Resolvers return plain addresses, so anything that can
//! map a name or ordinal to code works: a table fixed up by hand, a library
//! the OS loader brought in, or a module placed in memory by a custom loader
//! behind the [`ModuleLoader`] contract.

use std::collections::HashMap;
use thiserror::Error;

use crate::pe::ImportBinding;

#[cfg(target_os = "windows")]
use std::ffi::CString;
#[cfg(target_os = "windows")]
use windows::{
    core::PCSTR,
    Win32::Foundation::{GetLastError, HMODULE},
    Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA},
};

/// Errors that can occur while obtaining a resolver
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load library {name}: error code {code}")]
    LibraryLoad { name: String, code: u32 },

    #[error("Rejected module image: {0}")]
    InvalidModule(String),
}

/// Result type for resolver operations
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Maps an import binding to a callable address in a replacement module.
///
/// A returned address must belong to code with exactly the calling convention
/// and signature of the symbol it replaces; the engine only moves pointers and
/// cannot compensate for a mismatch. Resolution must not write to the target
/// module, and a miss is `None`, never a panic.
pub trait SymbolResolver {
    fn resolve(&self, binding: &ImportBinding) -> Option<usize>;
}

impl<F> SymbolResolver for F
where
    F: Fn(&ImportBinding) -> Option<usize>,
{
    fn resolve(&self, binding: &ImportBinding) -> Option<usize> {
        self(binding)
    }
}

/// Contract for loaders that place a replacement image in memory themselves.
///
/// The loaded module must stay resident for as long as any import slot points
/// into it; dropping it while a patched module is live turns every redirected
/// slot into a dangling code pointer. Keeping the returned resolver alive (a
/// `RedirectSession` pins it) is the way to honor that.
pub trait ModuleLoader {
    type Module: SymbolResolver;

    /// Map `image` into the current process and make its exports resolvable
    fn load(&self, image: &[u8]) -> Result<Self::Module>;
}

/// Fixed name and ordinal tables, assembled by hand.
///
/// Name lookup is exact and case-sensitive, the way export tables are.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    names: HashMap<String, usize>,
    ordinals: HashMap<u16, usize>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str, address: usize) -> Self {
        self.names.insert(name.to_string(), address);
        self
    }

    pub fn with_ordinal(mut self, ordinal: u16, address: usize) -> Self {
        self.ordinals.insert(ordinal, address);
        self
    }

    pub fn len(&self) -> usize {
        self.names.len() + self.ordinals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.ordinals.is_empty()
    }
}

impl SymbolResolver for StaticResolver {
    fn resolve(&self, binding: &ImportBinding) -> Option<usize> {
        match binding {
            ImportBinding::Name { name, .. } => self.names.get(name).copied(),
            ImportBinding::Ordinal(ordinal) => self.ordinals.get(ordinal).copied(),
        }
    }
}

/// Resolver over a library brought in through the OS loader.
///
/// The handle is deliberately never freed. Redirected slots keep pointing into
/// the library after the resolver is gone, so unloading it would leave the
/// patched module calling into unmapped pages.
#[cfg(target_os = "windows")]
pub struct LibraryResolver {
    module: HMODULE,
    name: String,
}

#[cfg(target_os = "windows")]
impl LibraryResolver {
    /// Load `name` (a module name or path) and resolve through its exports
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| ResolveError::InvalidModule(format!("Library name contains NUL: {}", name)))?;

        let module = unsafe { LoadLibraryA(PCSTR::from_raw(c_name.as_ptr() as *const u8)) }
            .map_err(|_| ResolveError::LibraryLoad {
                name: name.to_string(),
                code: unsafe { GetLastError().0 },
            })?;

        Ok(LibraryResolver {
            module,
            name: name.to_string(),
        })
    }

    /// Wrap a module handle that is already loaded and will stay loaded
    pub fn from_handle(module: HMODULE, name: &str) -> Self {
        LibraryResolver {
            module,
            name: name.to_string(),
        }
    }

    pub fn handle(&self) -> HMODULE {
        self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(target_os = "windows")]
impl SymbolResolver for LibraryResolver {
    fn resolve(&self, binding: &ImportBinding) -> Option<usize> {
        let proc = match binding {
            ImportBinding::Name { name, .. } => {
                let c_name = CString::new(name.as_str()).ok()?;
                unsafe { GetProcAddress(self.module, PCSTR::from_raw(c_name.as_ptr() as *const u8)) }
            }
            // An ordinal lookup passes the ordinal in the low word of the
            // name pointer, the loader's own convention.
            ImportBinding::Ordinal(ordinal) => unsafe {
                GetProcAddress(self.module, PCSTR::from_raw(*ordinal as usize as *const u8))
            },
        };
        proc.map(|f| f as usize)
    }
}
