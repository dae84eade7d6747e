//! Bounds-checked views over PE images
//!
//! `ModuleView` is the only way the rest of the crate touches image memory:
//! every read names an RVA, is translated to an offset for the view's layout,
//! and is validated against the view's extent before the dereference happens.
//! A failed check comes back as a decode error instead of a wild read.
//!
//! Two layouts are supported. A *virtual* layout is what a loaded module looks
//! like: RVAs are offsets from the base address. A *file* layout is the on-disk
//! arrangement, where RVAs must be translated through the section table.

use byteorder::{ByteOrder, LittleEndian};
use std::ffi::c_void;
use std::marker::PhantomData;

use crate::pe::{PeError, Result, SectionExtent, THUNK_SIZE};

/// Index of the import directory in the optional header's directory array
pub const IMPORT_DIRECTORY_INDEX: usize = 1;

const DOS_MAGIC: u16 = 0x5A4D; // 'MZ'
const NT_SIGNATURE: u32 = 0x0000_4550; // 'PE\0\0'
const E_LFANEW_OFFSET: usize = 0x3C;
const FILE_HEADER_SIZE: usize = 20;

const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

// Optional-header field offsets shared by PE32 and PE32+.
const SIZE_OF_IMAGE_OFFSET: usize = 56;

// Highest e_lfanew worth chasing when the image extent is not yet known;
// anything beyond this is treated as a corrupt header rather than followed.
const E_LFANEW_LIMIT: usize = 0x10000;

/// One (virtual address, size) pair from the optional header's directory array
#[derive(Debug, Clone, Copy)]
pub struct DataDirectory {
    /// RVA of the table the directory points at
    pub virtual_address: u32,
    /// Size of the table in bytes
    pub size: u32,
}

impl DataDirectory {
    /// Check if this data directory is present (has a non-zero address and size)
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

#[derive(Debug)]
enum Layout {
    /// RVA equals offset from base (loaded images, synthetic in-memory images)
    Virtual,
    /// RVAs translate through the section table (on-disk images)
    File(Vec<SectionExtent>),
}

/// Read-only interpretation of a PE image over a known extent of memory.
///
/// The view never writes; patching goes through `redirect` with slot addresses
/// computed by [`ModuleView::slot_address`].
#[derive(Debug)]
pub struct ModuleView<'a> {
    base: *const u8,
    len: usize,
    layout: Layout,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> ModuleView<'a> {
    /// Build a view over `len` bytes of mapped image memory at `base`.
    ///
    /// No validation happens here; signatures are checked on the first header
    /// access. The caller chooses the lifetime.
    ///
    /// # Safety
    /// `base..base+len` must stay mapped and readable for the view's lifetime,
    /// and nothing may hold a Rust reference to that memory while the view (or
    /// a patcher aimed at it) is in use.
    pub unsafe fn from_raw_parts<'b>(base: *const u8, len: usize) -> ModuleView<'b> {
        ModuleView {
            base,
            len,
            layout: Layout::Virtual,
            _marker: PhantomData,
        }
    }

    /// Build a view over a loaded module given only its base address,
    /// discovering the extent from the header's `SizeOfImage`.
    ///
    /// # Safety
    /// `base` must point at the start of a mapped PE image belonging to the
    /// current process (an `HMODULE` qualifies). The header region is read
    /// before the extent is known, which is what makes this unsafe even
    /// beyond the mapping requirement.
    pub unsafe fn from_module(base: *const c_void) -> Result<ModuleView<'static>> {
        let p = base as *const u8;

        // SAFETY: the caller attests the header region is mapped.
        let read_u16 = |offset: usize| -> u16 {
            let mut buf = [0u8; 2];
            unsafe { std::ptr::copy_nonoverlapping(p.add(offset), buf.as_mut_ptr(), 2) };
            LittleEndian::read_u16(&buf)
        };
        let read_u32 = |offset: usize| -> u32 {
            let mut buf = [0u8; 4];
            unsafe { std::ptr::copy_nonoverlapping(p.add(offset), buf.as_mut_ptr(), 4) };
            LittleEndian::read_u32(&buf)
        };

        if read_u16(0) != DOS_MAGIC {
            return Err(PeError::InvalidSignature);
        }
        let e_lfanew = read_u32(E_LFANEW_OFFSET) as usize;
        if e_lfanew == 0 || e_lfanew > E_LFANEW_LIMIT {
            return Err(PeError::InvalidSignature);
        }
        if read_u32(e_lfanew) != NT_SIGNATURE {
            return Err(PeError::InvalidSignature);
        }

        let size_of_image = read_u32(e_lfanew + 4 + FILE_HEADER_SIZE + SIZE_OF_IMAGE_OFFSET) as usize;
        if size_of_image <= e_lfanew {
            return Err(PeError::InvalidSignature);
        }

        Ok(Self::from_raw_parts(p, size_of_image))
    }

    /// View a byte slice laid out the way a loaded image is (RVA == offset).
    pub fn from_image_bytes(data: &'a [u8]) -> ModuleView<'a> {
        ModuleView {
            base: data.as_ptr(),
            len: data.len(),
            layout: Layout::Virtual,
            _marker: PhantomData,
        }
    }

    /// View the raw bytes of an on-disk PE file, translating RVAs through the
    /// section table. Validates both signatures and parses the section headers
    /// up front.
    pub fn from_file_bytes(data: &'a [u8]) -> Result<ModuleView<'a>> {
        let mut view = ModuleView {
            base: data.as_ptr(),
            len: data.len(),
            layout: Layout::Virtual,
            _marker: PhantomData,
        };

        let nt = view.nt_offset()?;
        let number_of_sections = view.read_u16_at_offset(nt + 6)? as usize;
        let size_of_optional_header = view.read_u16_at_offset(nt + 20)? as usize;
        let first_section = nt + 4 + FILE_HEADER_SIZE + size_of_optional_header;

        let mut sections = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let mut buf = [0u8; SectionExtent::SIZE];
            view.read_bytes_at_offset(first_section + i * SectionExtent::SIZE, &mut buf)?;
            sections.push(SectionExtent::parse(&buf)?);
        }

        view.layout = Layout::File(sections);
        Ok(view)
    }

    /// Base address of the viewed memory
    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// Extent of the viewed memory in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Translate an RVA to an offset into the view.
    ///
    /// Virtual layouts are the identity map. File layouts go through the
    /// section table, with RVAs below the first section (the header region)
    /// mapping identically.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        match &self.layout {
            Layout::Virtual => Ok(rva as usize),
            Layout::File(sections) => {
                for section in sections {
                    if section.contains_rva(rva) {
                        return Ok(section.rva_to_offset(rva) as usize);
                    }
                }
                let header_limit = sections
                    .iter()
                    .map(|s| s.virtual_address)
                    .min()
                    .unwrap_or(u32::MAX);
                if rva < header_limit {
                    Ok(rva as usize)
                } else {
                    Err(PeError::UnmappedRva { rva })
                }
            }
        }
    }

    /// Absolute address of the byte an RVA names, for a protected write.
    pub fn slot_address(&self, rva: u32) -> Result<usize> {
        Ok(self.base as usize + self.rva_to_offset(rva)?)
    }

    /// Copy `buf.len()` bytes starting at `rva` into `buf`.
    pub fn read_bytes_at_rva(&self, rva: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.rva_to_offset(rva)?;
        self.read_bytes_at_offset(offset, buf)
    }

    pub fn read_u16_at_rva(&self, rva: u32) -> Result<u16> {
        let offset = self.rva_to_offset(rva)?;
        self.read_u16_at_offset(offset)
    }

    pub fn read_u32_at_rva(&self, rva: u32) -> Result<u32> {
        let offset = self.rva_to_offset(rva)?;
        self.read_u32_at_offset(offset)
    }

    /// Read one pointer-sized little-endian value (a thunk slot).
    pub fn read_ptr_at_rva(&self, rva: u32) -> Result<usize> {
        let offset = self.rva_to_offset(rva)?;
        let mut buf = [0u8; THUNK_SIZE];
        self.read_bytes_at_offset(offset, &mut buf)?;
        Ok(LittleEndian::read_uint(&buf, THUNK_SIZE) as usize)
    }

    /// Read a NUL-terminated ASCII string of at most `limit` bytes at `rva`.
    ///
    /// Any failure along the way (unmapped RVA, missing terminator within the
    /// limit, non-text bytes) comes back as `BadImportName` carrying the RVA,
    /// so a single malformed name never aborts a walk.
    pub fn read_string_at_rva(&self, rva: u32, limit: usize) -> Result<String> {
        let start = self
            .rva_to_offset(rva)
            .map_err(|_| PeError::BadImportName { rva })?;

        let mut bytes = Vec::new();
        loop {
            if bytes.len() >= limit {
                return Err(PeError::BadImportName { rva });
            }
            let mut byte = [0u8; 1];
            self.read_bytes_at_offset(start + bytes.len(), &mut byte)
                .map_err(|_| PeError::BadImportName { rva })?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }

        String::from_utf8(bytes).map_err(|_| PeError::BadImportName { rva })
    }

    /// Locate the import directory, validating the DOS and NT signatures on
    /// the way. `Ok(None)` is the valid no-imports case.
    pub fn import_directory(&self) -> Result<Option<DataDirectory>> {
        self.data_directory(IMPORT_DIRECTORY_INDEX)
    }

    /// Read one entry of the optional header's data-directory array.
    ///
    /// Returns `Ok(None)` when the array is shorter than `index` or the entry
    /// is zero. Images whose optional-header magic does not match the host
    /// pointer width are rejected with `Unsupported`: their thunk tables
    /// cannot be walked at the native width.
    pub fn data_directory(&self, index: usize) -> Result<Option<DataDirectory>> {
        let nt = self.nt_offset()?;
        let optional = nt + 4 + FILE_HEADER_SIZE;

        let magic = self.read_u16_at_offset(optional)?;
        let (count_offset, directories_offset) = match magic {
            PE32_MAGIC => {
                if THUNK_SIZE != 4 {
                    return Err(PeError::Unsupported(
                        "PE32 image in a 64-bit process".to_string(),
                    ));
                }
                (92, 96)
            }
            PE32_PLUS_MAGIC => {
                if THUNK_SIZE != 8 {
                    return Err(PeError::Unsupported(
                        "PE32+ image in a 32-bit process".to_string(),
                    ));
                }
                (108, 112)
            }
            other => {
                return Err(PeError::Unsupported(format!(
                    "Unknown optional header magic: 0x{:x}",
                    other
                )))
            }
        };

        let count = self.read_u32_at_offset(optional + count_offset)? as usize;
        if index >= count {
            return Ok(None);
        }

        let entry = optional + directories_offset + index * 8;
        let virtual_address = self.read_u32_at_offset(entry)?;
        let size = self.read_u32_at_offset(entry + 4)?;

        let directory = DataDirectory {
            virtual_address,
            size,
        };
        if directory.is_present() {
            Ok(Some(directory))
        } else {
            Ok(None)
        }
    }

    /// Validate 'MZ' and 'PE\0\0' and return the offset of the NT headers.
    fn nt_offset(&self) -> Result<usize> {
        if self.read_u16_at_offset(0)? != DOS_MAGIC {
            return Err(PeError::InvalidSignature);
        }
        let e_lfanew = self.read_u32_at_offset(E_LFANEW_OFFSET)? as usize;
        if self.read_u32_at_offset(e_lfanew)? != NT_SIGNATURE {
            return Err(PeError::InvalidSignature);
        }
        Ok(e_lfanew)
    }

    fn read_bytes_at_offset(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len())
            .ok_or(PeError::OutOfBounds {
                offset,
                len: buf.len(),
                size: self.len,
            })?;
        if end > self.len {
            return Err(PeError::OutOfBounds {
                offset,
                len: buf.len(),
                size: self.len,
            });
        }
        // SAFETY: the range was checked against the extent the constructor
        // attested, and the copy materializes an owned value, so no reference
        // into the (possibly concurrently patched) image outlives this call.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn read_u16_at_offset(&self, offset: usize) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes_at_offset(offset, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    fn read_u32_at_offset(&self, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes_at_offset(offset, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }
}
