//! PE image interpretation for live modules and on-disk files
//!
//! Everything in this module reads through bounds-checked views; nothing here
//! ever writes to an image. Patching lives in `redirect`.

mod import;
mod section;
mod view;

pub use import::{
    ImportBinding, ImportDescriptor, ImportDescriptors, LibraryImports, ThunkSite, Thunks,
    IMPORT_NAME_LIMIT, ORDINAL_FLAG, THUNK_SIZE,
};
pub use section::SectionExtent;
pub use view::{DataDirectory, ModuleView, IMPORT_DIRECTORY_INDEX};

use std::io;
use thiserror::Error;

/// Errors that can occur when interpreting a PE image
#[derive(Error, Debug)]
pub enum PeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid PE signature")]
    InvalidSignature,

    #[error("Read of {len} bytes at offset 0x{offset:x} is outside the image (size 0x{size:x})")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("RVA 0x{rva:08x} is not mapped by any section")]
    UnmappedRva { rva: u32 },

    #[error("Malformed import name at RVA 0x{rva:08x}")]
    BadImportName { rva: u32 },

    #[error("Thunk value 0x{value:x} does not decode to an import binding")]
    BadThunk { value: usize },

    #[error("Unsupported PE feature: {0}")]
    Unsupported(String),
}

/// Result type for PE operations
pub type Result<T> = std::result::Result<T, PeError>;
