//! The redirection engine
//!
//! [`RedirectSession::patch_imports`] walks a module's import descriptors,
//! matches one provider library by name, resolves every binding through the
//! caller's [`SymbolResolver`], and rewrites the matching address-table slots
//! under protection save/restore. Single bad entries are recorded and walked
//! past; only an image that fails validation aborts the walk.
//!
//! A session is the serialization boundary: `patch_imports` takes `&mut self`,
//! so two walks over the same module cannot interleave through one session.
//! The session also remembers every slot it has patched, keyed by module base.
//! That record is what makes a second walk over a lookup-table-less descriptor
//! work: once patched, those slots hold code addresses instead of bindings,
//! and the binding has to come from the session instead of from memory. The
//! resolvers that supplied addresses are kept pinned for the session's
//! lifetime, since the patched module now calls into whatever they resolved.

mod patcher;
mod report;

pub use patcher::{patch_slot, MemoryProtection, NoProtection, PatchError};
#[cfg(target_os = "windows")]
pub use patcher::VirtualProtection;
pub use report::{Outcome, RedirectionReport};

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::pe::{ImportBinding, ImportDescriptors, ModuleView, PeError, ThunkSite};
use crate::resolve::SymbolResolver;

/// Errors that abort a redirection walk
#[derive(Error, Debug)]
pub enum RedirectError {
    #[error("Invalid target image: {0}")]
    InvalidImage(#[from] PeError),
}

/// Result type for redirection operations
pub type Result<T> = std::result::Result<T, RedirectError>;

/// One slot a session has patched
#[derive(Debug, Clone)]
pub struct PatchedSlot {
    /// RVA of the rewritten address-table slot
    pub slot_rva: u32,
    /// Provider library the slot imported from
    pub library: String,
    /// What the slot was bound to before the rewrite
    pub binding: ImportBinding,
    /// Address the slot now holds
    pub redirected_to: usize,
}

struct PatchedModule {
    resolvers: Vec<Arc<dyn SymbolResolver>>,
    slots: HashMap<u32, PatchedSlot>,
}

impl PatchedModule {
    fn new() -> Self {
        PatchedModule {
            resolvers: Vec::new(),
            slots: HashMap::new(),
        }
    }
}

/// Bookkeeping for every module patched through one protection adapter
pub struct RedirectSession<P: MemoryProtection> {
    protection: P,
    modules: HashMap<usize, PatchedModule>,
}

#[cfg(target_os = "windows")]
impl RedirectSession<VirtualProtection> {
    /// Session writing through `VirtualProtect`
    pub fn new() -> Self {
        Self::with_protection(VirtualProtection)
    }
}

#[cfg(target_os = "windows")]
impl Default for RedirectSession<VirtualProtection> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MemoryProtection> RedirectSession<P> {
    /// Session writing through the given protection adapter
    pub fn with_protection(protection: P) -> Self {
        RedirectSession {
            protection,
            modules: HashMap::new(),
        }
    }

    /// Redirect every import the target takes from `provider` to the address
    /// the resolver supplies for it.
    ///
    /// Per-entry failures (unresolved bindings, refused protection changes)
    /// are recorded in the report and do not stop the walk. The call fails
    /// only when the image does not validate. Running it again over the same
    /// module is safe and re-resolves the same bindings.
    pub fn patch_imports(
        &mut self,
        view: &ModuleView<'_>,
        provider: &str,
        resolver: Arc<dyn SymbolResolver>,
    ) -> Result<RedirectionReport> {
        let mut report = RedirectionReport::new(provider);

        let directory = match view.import_directory()? {
            Some(directory) => directory,
            None => {
                debug!("Module at 0x{:x} has no import directory", view.base());
                return Ok(report);
            }
        };
        debug!(
            "Import directory at RVA 0x{:08x} ({} bytes)",
            directory.virtual_address, directory.size
        );

        for library in ImportDescriptors::new(view, directory) {
            if !library.matches(provider) {
                debug!("Skipping imports from {}", library.library);
                report.record(Outcome::SkippedLibrary {
                    library: library.library,
                });
                continue;
            }

            debug!(
                "Walking {} imports (lookup table present: {})",
                library.library,
                library.descriptor.has_lookup_table()
            );
            for site in library.thunks(view) {
                self.redirect_site(view, &library.library, site, resolver.as_ref(), &mut report);
            }
        }

        if report.redirected() > 0 {
            self.pin_resolver(view.base(), resolver);
        }
        debug!("{}", report);
        Ok(report)
    }

    /// Whether this session has patched any slot of the module at `module_base`
    pub fn is_patched(&self, module_base: usize) -> bool {
        self.modules.contains_key(&module_base)
    }

    /// Slots this session has patched in the module at `module_base`
    pub fn patched_slots(&self, module_base: usize) -> impl Iterator<Item = &PatchedSlot> {
        self.modules
            .get(&module_base)
            .into_iter()
            .flat_map(|module| module.slots.values())
    }

    /// Number of resolvers kept alive for the module at `module_base`
    pub fn pinned_resolvers(&self, module_base: usize) -> usize {
        self.modules
            .get(&module_base)
            .map(|module| module.resolvers.len())
            .unwrap_or(0)
    }

    fn redirect_site(
        &mut self,
        view: &ModuleView<'_>,
        library: &str,
        site: ThunkSite,
        resolver: &dyn SymbolResolver,
        report: &mut RedirectionReport,
    ) {
        let base = view.base();

        // A patched slot with no lookup table no longer decodes from memory;
        // an earlier walk recorded what it was bound to.
        let recorded = self
            .modules
            .get(&base)
            .and_then(|module| module.slots.get(&site.slot_rva))
            .map(|slot| slot.binding.clone());

        let binding = match recorded.or(site.binding) {
            Some(binding) => binding,
            None => {
                warn!(
                    "Import slot at RVA 0x{:08x} does not decode (value 0x{:x})",
                    site.slot_rva, site.binding_value
                );
                report.record(Outcome::Unresolved {
                    binding: None,
                    slot_rva: site.slot_rva,
                    thunk_value: site.binding_value,
                });
                return;
            }
        };

        let new_address = match resolver.resolve(&binding) {
            Some(address) => address,
            None => {
                warn!("No replacement address for {}!{}", library, binding);
                report.record(Outcome::Unresolved {
                    binding: Some(binding),
                    slot_rva: site.slot_rva,
                    thunk_value: site.binding_value,
                });
                return;
            }
        };

        let slot_address = match view.slot_address(site.slot_rva) {
            Ok(address) => address,
            Err(e) => {
                warn!("Cannot locate slot for {}!{}: {}", library, binding, e);
                report.record(Outcome::Unresolved {
                    binding: Some(binding),
                    slot_rva: site.slot_rva,
                    thunk_value: site.binding_value,
                });
                return;
            }
        };

        match patch_slot(&self.protection, slot_address, new_address) {
            Ok(restored) => {
                info!(
                    "Redirected {}!{}: 0x{:x} -> 0x{:x}",
                    library, binding, site.slot_value, new_address
                );
                let slot = PatchedSlot {
                    slot_rva: site.slot_rva,
                    library: library.to_string(),
                    binding: binding.clone(),
                    redirected_to: new_address,
                };
                self.modules
                    .entry(base)
                    .or_insert_with(PatchedModule::new)
                    .slots
                    .insert(site.slot_rva, slot);
                report.record(Outcome::Redirected {
                    binding,
                    slot_rva: site.slot_rva,
                    old_address: site.slot_value,
                    new_address,
                    restored,
                });
            }
            Err(PatchError::ProtectionChangeFailed { code, .. }) => {
                warn!(
                    "Protection change refused for {}!{} at RVA 0x{:08x} (code {})",
                    library, binding, site.slot_rva, code
                );
                report.record(Outcome::ProtectionFailed {
                    binding,
                    slot_rva: site.slot_rva,
                    code,
                });
            }
        }
    }

    fn pin_resolver(&mut self, base: usize, resolver: Arc<dyn SymbolResolver>) {
        if let Some(module) = self.modules.get_mut(&base) {
            if !module
                .resolvers
                .iter()
                .any(|pinned| Arc::ptr_eq(pinned, &resolver))
            {
                module.resolvers.push(resolver);
            }
        }
    }
}
