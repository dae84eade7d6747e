//! Synthetic PE images for exercising walks and patches without a real module.
//!
//! Images are laid out the way a loaded module is (RVA == offset), with the
//! section table describing the same identity mapping, so one image serves
//! both the in-memory walk and the on-disk inspection path.

#![allow(dead_code)]

use iatswap::pe::{ModuleView, ORDINAL_FLAG, THUNK_SIZE};

const E_LFANEW: usize = 0x80;
const DESCRIPTORS_RVA: usize = 0x400;
const DESCRIPTOR_SIZE: usize = 20;

/// One import entry of a synthetic library
#[derive(Debug, Clone, Copy)]
pub enum Entry {
    /// Import by name; the hint is derived from the entry's position
    Name(&'static str),
    /// Import by ordinal
    Ordinal(u16),
    /// Raw thunk value written verbatim, for malformed entries
    Raw(usize),
}

struct LibraryPlan {
    name: &'static str,
    entries: Vec<Entry>,
    with_lookup_table: bool,
}

/// Builds a minimal but well-formed image around an import table
pub struct ImageBuilder {
    libraries: Vec<LibraryPlan>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            libraries: Vec::new(),
        }
    }

    /// Add a library whose descriptor carries a separate lookup table; its
    /// address table starts out holding fake loader-resolved addresses.
    pub fn library(mut self, name: &'static str, entries: &[Entry]) -> Self {
        self.libraries.push(LibraryPlan {
            name,
            entries: entries.to_vec(),
            with_lookup_table: true,
        });
        self
    }

    /// Add a library without a lookup table: its address table doubles as the
    /// binding source, the way some linkers emit it.
    pub fn library_without_lookup_table(mut self, name: &'static str, entries: &[Entry]) -> Self {
        self.libraries.push(LibraryPlan {
            name,
            entries: entries.to_vec(),
            with_lookup_table: false,
        });
        self
    }

    pub fn build(self) -> TestImage {
        let optional = E_LFANEW + 4 + 20;

        #[cfg(target_pointer_width = "64")]
        let (magic, machine, optional_size): (u16, u16, u16) = (0x20B, 0x8664, 240);
        #[cfg(target_pointer_width = "32")]
        let (magic, machine, optional_size): (u16, u16, u16) = (0x10B, 0x014C, 224);

        let descriptors_size = (self.libraries.len() + 1) * DESCRIPTOR_SIZE;
        let mut cursor = DESCRIPTORS_RVA + descriptors_size;

        // Library name strings
        let mut library_name_rvas = Vec::new();
        for lib in &self.libraries {
            library_name_rvas.push(cursor);
            cursor += lib.name.len() + 1;
        }

        // Hint/name records, each two-aligned
        let mut name_record_rvas: Vec<Vec<Option<usize>>> = Vec::new();
        for lib in &self.libraries {
            let mut rvas = Vec::new();
            for entry in &lib.entries {
                if let Entry::Name(name) = entry {
                    cursor = (cursor + 1) & !1;
                    rvas.push(Some(cursor));
                    cursor += 2 + name.len() + 1;
                } else {
                    rvas.push(None);
                }
            }
            name_record_rvas.push(rvas);
        }

        // Thunk tables, pointer-aligned, each with a zero terminator slot
        cursor = (cursor + THUNK_SIZE - 1) & !(THUNK_SIZE - 1);
        let mut lookup_rvas = Vec::new();
        let mut address_rvas = Vec::new();
        for lib in &self.libraries {
            let table = (lib.entries.len() + 1) * THUNK_SIZE;
            if lib.with_lookup_table {
                lookup_rvas.push(Some(cursor));
                cursor += table;
            } else {
                lookup_rvas.push(None);
            }
            address_rvas.push(cursor);
            cursor += table;
        }

        let total = (cursor + 0xF) & !0xF;
        let mut bytes = vec![0u8; total];

        // DOS header
        bytes[0] = b'M';
        bytes[1] = b'Z';
        put_u32(&mut bytes, 0x3C, E_LFANEW as u32);

        // NT signature and file header
        put_u32(&mut bytes, E_LFANEW, 0x0000_4550);
        put_u16(&mut bytes, E_LFANEW + 4, machine);
        put_u16(&mut bytes, E_LFANEW + 6, 1);
        put_u16(&mut bytes, E_LFANEW + 20, optional_size);
        put_u16(&mut bytes, E_LFANEW + 22, 0x0022);

        // Optional header
        put_u16(&mut bytes, optional, magic);
        put_u32(&mut bytes, optional + 32, 0x200); // section alignment
        put_u32(&mut bytes, optional + 36, 0x200); // file alignment
        put_u32(&mut bytes, optional + 56, total as u32); // SizeOfImage
        put_u32(&mut bytes, optional + 60, DESCRIPTORS_RVA as u32); // SizeOfHeaders
        put_u16(&mut bytes, optional + 68, 3); // console subsystem

        let (count_offset, dirs_offset) = if magic == 0x20B { (108, 112) } else { (92, 96) };
        put_u32(&mut bytes, optional + count_offset, 16);
        if !self.libraries.is_empty() {
            put_u32(&mut bytes, optional + dirs_offset + 8, DESCRIPTORS_RVA as u32);
            put_u32(&mut bytes, optional + dirs_offset + 12, descriptors_size as u32);
        }

        // One section describing the data region identically in both layouts
        let section = optional + optional_size as usize;
        bytes[section..section + 6].copy_from_slice(b".idata");
        put_u32(&mut bytes, section + 8, (total - DESCRIPTORS_RVA) as u32);
        put_u32(&mut bytes, section + 12, DESCRIPTORS_RVA as u32);
        put_u32(&mut bytes, section + 16, (total - DESCRIPTORS_RVA) as u32);
        put_u32(&mut bytes, section + 20, DESCRIPTORS_RVA as u32);
        put_u32(&mut bytes, section + 36, 0xC000_0040);

        // Import descriptors; the terminator record stays all zeros
        for (i, _) in self.libraries.iter().enumerate() {
            let record = DESCRIPTORS_RVA + i * DESCRIPTOR_SIZE;
            if let Some(lookup) = lookup_rvas[i] {
                put_u32(&mut bytes, record, lookup as u32);
            }
            put_u32(&mut bytes, record + 12, library_name_rvas[i] as u32);
            put_u32(&mut bytes, record + 16, address_rvas[i] as u32);
        }

        // Library names
        for (i, lib) in self.libraries.iter().enumerate() {
            let at = library_name_rvas[i];
            bytes[at..at + lib.name.len()].copy_from_slice(lib.name.as_bytes());
        }

        // Hint/name records
        for (i, lib) in self.libraries.iter().enumerate() {
            for (j, entry) in lib.entries.iter().enumerate() {
                if let (Entry::Name(name), Some(at)) = (entry, name_record_rvas[i][j]) {
                    put_u16(&mut bytes, at, (0x10 + j) as u16);
                    bytes[at + 2..at + 2 + name.len()].copy_from_slice(name.as_bytes());
                }
            }
        }

        // Thunk tables. Standalone address tables get unique fake addresses,
        // as if the loader had already resolved them.
        let mut fake_address = 0x7100_0000usize;
        let mut libraries = Vec::new();
        for (i, lib) in self.libraries.iter().enumerate() {
            let mut initial = Vec::new();
            for (j, entry) in lib.entries.iter().enumerate() {
                let binding_value = match entry {
                    Entry::Name(_) => name_record_rvas[i][j].unwrap(),
                    Entry::Ordinal(ordinal) => ORDINAL_FLAG | *ordinal as usize,
                    Entry::Raw(value) => *value,
                };
                let slot = address_rvas[i] + j * THUNK_SIZE;
                if let Some(lookup) = lookup_rvas[i] {
                    put_ptr(&mut bytes, lookup + j * THUNK_SIZE, binding_value);
                    fake_address += 0x10;
                    put_ptr(&mut bytes, slot, fake_address);
                    initial.push(fake_address);
                } else {
                    put_ptr(&mut bytes, slot, binding_value);
                    initial.push(binding_value);
                }
            }
            libraries.push(BuiltLibrary {
                address_rva: address_rvas[i] as u32,
                initial,
            });
        }

        TestImage { bytes, libraries }
    }
}

struct BuiltLibrary {
    address_rva: u32,
    initial: Vec<usize>,
}

/// A built image plus where its address-table slots ended up
pub struct TestImage {
    pub bytes: Vec<u8>,
    libraries: Vec<BuiltLibrary>,
}

impl TestImage {
    /// View over the image memory. The view (and anything patching through
    /// it) must be dropped before the image is read back.
    pub fn view(&mut self) -> ModuleView<'_> {
        // SAFETY: the buffer outlives the returned view, whose lifetime is
        // tied to this mutable borrow; no other reference aliases it.
        unsafe { ModuleView::from_raw_parts(self.bytes.as_mut_ptr(), self.bytes.len()) }
    }

    /// RVA of one address-table slot
    pub fn slot_rva(&self, library: usize, entry: usize) -> u32 {
        self.libraries[library].address_rva + (entry * THUNK_SIZE) as u32
    }

    /// Current value of one address-table slot
    pub fn slot_value(&self, library: usize, entry: usize) -> usize {
        let at = self.slot_rva(library, entry) as usize;
        let mut buf = [0u8; THUNK_SIZE];
        buf.copy_from_slice(&self.bytes[at..at + THUNK_SIZE]);
        usize::from_le_bytes(buf)
    }

    /// Value a slot held when the image was built
    pub fn initial_value(&self, library: usize, entry: usize) -> usize {
        self.libraries[library].initial[entry]
    }

    pub fn corrupt_dos_signature(&mut self) {
        self.bytes[0] = 0;
    }

    pub fn corrupt_nt_signature(&mut self) {
        self.bytes[E_LFANEW] = b'X';
    }
}

fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_ptr(bytes: &mut [u8], at: usize, value: usize) {
    bytes[at..at + THUNK_SIZE].copy_from_slice(&value.to_le_bytes());
}
