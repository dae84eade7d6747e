//! Import table walking
//!
//! The walk is lazy and reads through a [`ModuleView`]: descriptors come out
//! of [`ImportDescriptors`], and each descriptor's thunk pair is enumerated by
//! [`Thunks`]. Bindings are decoded into owned values at the moment a slot is
//! visited, before anything writes to that slot. When a descriptor has no
//! import lookup table the address table doubles as the binding source, so
//! the snapshot-then-patch ordering is what keeps a walk re-runnable.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use std::fmt;

use crate::pe::view::{DataDirectory, ModuleView};
use crate::pe::{PeError, Result};

/// Size of one thunk slot: pointer width of the host process
pub const THUNK_SIZE: usize = std::mem::size_of::<usize>();

/// High bit of a thunk value, marking an import by ordinal
pub const ORDINAL_FLAG: usize = 1 << (usize::BITS - 1);

/// Longest accepted import or library name, terminator included
pub const IMPORT_NAME_LIMIT: usize = 256;

/// Raw import descriptor record
#[derive(Debug, Clone, Copy)]
pub struct ImportDescriptor {
    /// RVA of the import lookup table, zero when the linker omitted it
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    /// RVA of the provider library's name
    pub name: u32,
    /// RVA of the import address table
    pub first_thunk: u32,
}

impl ImportDescriptor {
    /// Size of an import descriptor record in bytes
    pub const SIZE: usize = 20;

    /// Decode one descriptor record
    pub fn from_bytes(data: [u8; Self::SIZE]) -> Self {
        ImportDescriptor {
            original_first_thunk: LittleEndian::read_u32(&data[0..4]),
            time_date_stamp: LittleEndian::read_u32(&data[4..8]),
            forwarder_chain: LittleEndian::read_u32(&data[8..12]),
            name: LittleEndian::read_u32(&data[12..16]),
            first_thunk: LittleEndian::read_u32(&data[16..20]),
        }
    }

    /// The all-zero record that terminates the descriptor array
    pub fn is_terminator(&self) -> bool {
        self.original_first_thunk == 0
            && self.time_date_stamp == 0
            && self.forwarder_chain == 0
            && self.name == 0
            && self.first_thunk == 0
    }

    /// A walkable descriptor names its library and has an address table
    pub fn is_valid(&self) -> bool {
        self.name != 0 && self.first_thunk != 0
    }

    /// Whether a separate import lookup table is present
    pub fn has_lookup_table(&self) -> bool {
        self.original_first_thunk != 0
    }

    /// RVA of the table bindings are decoded from: the lookup table when
    /// present, otherwise the address table itself.
    pub fn binding_table(&self) -> u32 {
        if self.original_first_thunk != 0 {
            self.original_first_thunk
        } else {
            self.first_thunk
        }
    }
}

/// What an import slot is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportBinding {
    /// Import by name, with the linker's hint
    Name { hint: u16, name: String },
    /// Import by ordinal
    Ordinal(u16),
}

impl ImportBinding {
    /// Decode a non-zero thunk value into a binding.
    ///
    /// A set high bit selects an ordinal, taken from the low 16 bits; the
    /// flagged bits in between are ignored, as the loader ignores them.
    /// Anything else is an RVA to a hint/name record.
    pub fn decode(view: &ModuleView<'_>, value: usize) -> Result<Self> {
        if value & ORDINAL_FLAG != 0 {
            return Ok(ImportBinding::Ordinal((value & 0xFFFF) as u16));
        }

        let rva = u32::try_from(value).map_err(|_| PeError::BadThunk { value })?;
        let hint = view
            .read_u16_at_rva(rva)
            .map_err(|_| PeError::BadImportName { rva })?;
        let name = view.read_string_at_rva(rva + 2, IMPORT_NAME_LIMIT)?;
        if name.is_empty() {
            return Err(PeError::BadImportName { rva });
        }

        Ok(ImportBinding::Name { hint, name })
    }
}

impl fmt::Display for ImportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportBinding::Name { name, .. } => write!(f, "{}", name),
            ImportBinding::Ordinal(ordinal) => write!(f, "Ordinal#{}", ordinal),
        }
    }
}

/// One import descriptor paired with its decoded library name
#[derive(Debug, Clone)]
pub struct LibraryImports {
    /// Provider library the descriptor binds against
    pub library: String,
    /// The raw descriptor record
    pub descriptor: ImportDescriptor,
}

impl LibraryImports {
    /// Case-insensitive match against a provider library name, the way the
    /// loader treats module names.
    pub fn matches(&self, provider: &str) -> bool {
        self.library.eq_ignore_ascii_case(provider)
    }

    /// Walk this descriptor's thunk pair
    pub fn thunks<'v, 'a>(&self, view: &'v ModuleView<'a>) -> Thunks<'v, 'a> {
        Thunks::new(view, &self.descriptor)
    }
}

/// Iterator over the import descriptor array.
///
/// Stops at the all-zero terminator, at the end of the directory's declared
/// size, or at the first descriptor that cannot be read. A descriptor whose
/// library name does not decode is skipped with a warning; the array itself
/// keeps being walked.
pub struct ImportDescriptors<'v, 'a> {
    view: &'v ModuleView<'a>,
    next_rva: u32,
    remaining: usize,
    done: bool,
}

impl<'v, 'a> ImportDescriptors<'v, 'a> {
    pub fn new(view: &'v ModuleView<'a>, directory: DataDirectory) -> Self {
        ImportDescriptors {
            view,
            next_rva: directory.virtual_address,
            remaining: directory.size as usize / ImportDescriptor::SIZE,
            done: !directory.is_present(),
        }
    }
}

impl<'v, 'a> Iterator for ImportDescriptors<'v, 'a> {
    type Item = LibraryImports;

    fn next(&mut self) -> Option<LibraryImports> {
        loop {
            if self.done || self.remaining == 0 {
                self.done = true;
                return None;
            }

            let mut record = [0u8; ImportDescriptor::SIZE];
            if let Err(e) = self.view.read_bytes_at_rva(self.next_rva, &mut record) {
                warn!(
                    "Import descriptor array runs off the image at RVA 0x{:08x}: {}",
                    self.next_rva, e
                );
                self.done = true;
                return None;
            }
            let descriptor = ImportDescriptor::from_bytes(record);

            if descriptor.is_terminator() {
                self.done = true;
                return None;
            }

            self.next_rva += ImportDescriptor::SIZE as u32;
            self.remaining -= 1;

            if !descriptor.is_valid() {
                warn!(
                    "Stopping at malformed import descriptor (name RVA 0x{:08x}, IAT RVA 0x{:08x})",
                    descriptor.name, descriptor.first_thunk
                );
                self.done = true;
                return None;
            }

            match self.view.read_string_at_rva(descriptor.name, IMPORT_NAME_LIMIT) {
                Ok(library) => return Some(LibraryImports { library, descriptor }),
                Err(e) => {
                    warn!("Skipping import descriptor with unreadable library name: {}", e);
                    continue;
                }
            }
        }
    }
}

/// One visited import slot, with its binding snapshotted before any write
#[derive(Debug, Clone)]
pub struct ThunkSite {
    /// RVA of the address-table slot a patch would overwrite
    pub slot_rva: u32,
    /// Value the slot held when visited
    pub slot_value: usize,
    /// Raw value of the binding table entry; equals `slot_value` when the
    /// descriptor has no lookup table
    pub binding_value: usize,
    /// Decoded binding, `None` when the entry does not decode
    pub binding: Option<ImportBinding>,
}

/// Iterator over one descriptor's thunk pair.
///
/// The binding table and the address table advance in lockstep. The read that
/// checks for the zero terminator is the same read the binding is decoded
/// from, so a slot is never reinterpreted after it has been overwritten.
pub struct Thunks<'v, 'a> {
    view: &'v ModuleView<'a>,
    binding_rva: u32,
    slot_rva: u32,
    done: bool,
}

impl<'v, 'a> Thunks<'v, 'a> {
    pub fn new(view: &'v ModuleView<'a>, descriptor: &ImportDescriptor) -> Self {
        Thunks {
            view,
            binding_rva: descriptor.binding_table(),
            slot_rva: descriptor.first_thunk,
            done: descriptor.first_thunk == 0,
        }
    }
}

impl<'v, 'a> Iterator for Thunks<'v, 'a> {
    type Item = ThunkSite;

    fn next(&mut self) -> Option<ThunkSite> {
        if self.done {
            return None;
        }

        let binding_value = match self.view.read_ptr_at_rva(self.binding_rva) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Thunk table runs off the image at RVA 0x{:08x}, ending walk: {}",
                    self.binding_rva, e
                );
                self.done = true;
                return None;
            }
        };
        if binding_value == 0 {
            self.done = true;
            return None;
        }

        let slot_value = if self.binding_rva == self.slot_rva {
            binding_value
        } else {
            match self.view.read_ptr_at_rva(self.slot_rva) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "Address table runs off the image at RVA 0x{:08x}, ending walk: {}",
                        self.slot_rva, e
                    );
                    self.done = true;
                    return None;
                }
            }
        };

        let binding = match ImportBinding::decode(self.view, binding_value) {
            Ok(binding) => Some(binding),
            Err(e) => {
                debug!(
                    "Thunk at RVA 0x{:08x} does not decode: {}",
                    self.slot_rva, e
                );
                None
            }
        };

        let site = ThunkSite {
            slot_rva: self.slot_rva,
            slot_value,
            binding_value,
            binding,
        };

        self.binding_rva += THUNK_SIZE as u32;
        self.slot_rva += THUNK_SIZE as u32;

        Some(site)
    }
}
