//! Protected pointer writes into image memory
//!
//! IAT pages are usually mapped read-only once the loader has finished with
//! them, so every write goes through a [`MemoryProtection`] adapter: make the
//! slot writable, store the new pointer, put the old protection back. The two
//! protection changes fail differently on purpose. If the first change fails
//! the slot is untouched and the write is abandoned; if the restore fails the
//! new value is already committed and stays, and the caller is told the page
//! was left writable.

use log::warn;
use thiserror::Error;

use crate::pe::THUNK_SIZE;

#[cfg(target_os = "windows")]
use windows::Win32::Foundation::GetLastError;
#[cfg(target_os = "windows")]
use windows::Win32::System::Memory::{
    VirtualProtect, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
};

/// Errors that can occur while patching a slot
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Protection change failed at 0x{address:x} (code {code})")]
    ProtectionChangeFailed { address: usize, code: u32 },
}

/// Result type for patch operations
pub type Result<T> = std::result::Result<T, PatchError>;

/// Page protection control around a slot write
pub trait MemoryProtection {
    /// Make `len` bytes at `address` writable, returning an opaque token for
    /// the prior protection state.
    fn make_writable(&self, address: usize, len: usize) -> Result<u32>;

    /// Reinstate a protection state previously returned by `make_writable`.
    fn restore(&self, address: usize, len: usize, previous: u32) -> Result<()>;
}

/// Adapter for memory that is already writable: private test buffers, or
/// images mapped read-write by a custom loader.
#[derive(Debug, Default)]
pub struct NoProtection;

impl MemoryProtection for NoProtection {
    fn make_writable(&self, _address: usize, _len: usize) -> Result<u32> {
        Ok(0)
    }

    fn restore(&self, _address: usize, _len: usize, _previous: u32) -> Result<()> {
        Ok(())
    }
}

/// Page protection through `VirtualProtect`
#[cfg(target_os = "windows")]
#[derive(Debug, Default)]
pub struct VirtualProtection;

#[cfg(target_os = "windows")]
impl MemoryProtection for VirtualProtection {
    fn make_writable(&self, address: usize, len: usize) -> Result<u32> {
        let mut previous = PAGE_PROTECTION_FLAGS::default();
        let ok = unsafe {
            VirtualProtect(
                address as *const std::ffi::c_void,
                len,
                PAGE_READWRITE,
                &mut previous,
            )
        };
        if !ok.as_bool() {
            return Err(PatchError::ProtectionChangeFailed {
                address,
                code: unsafe { GetLastError().0 },
            });
        }
        Ok(previous.0)
    }

    fn restore(&self, address: usize, len: usize, previous: u32) -> Result<()> {
        let mut discarded = PAGE_PROTECTION_FLAGS::default();
        let ok = unsafe {
            VirtualProtect(
                address as *const std::ffi::c_void,
                len,
                PAGE_PROTECTION_FLAGS(previous),
                &mut discarded,
            )
        };
        if !ok.as_bool() {
            return Err(PatchError::ProtectionChangeFailed {
                address,
                code: unsafe { GetLastError().0 },
            });
        }
        Ok(())
    }
}

/// Overwrite one pointer-sized slot under protection save and restore.
///
/// Returns whether the prior protection was reinstated. A restore failure is
/// not an error: the new value is committed by then, so the slot is reported
/// patched and the page stays writable.
///
/// The store is a single volatile pointer-width write to a pointer-aligned
/// slot, so code calling through the table observes either the old or the new
/// address, never a torn value.
pub fn patch_slot<P: MemoryProtection + ?Sized>(
    protection: &P,
    slot_address: usize,
    value: usize,
) -> Result<bool> {
    let previous = protection.make_writable(slot_address, THUNK_SIZE)?;

    // SAFETY: the engine derived `slot_address` from a view whose extent the
    // caller attested, and IAT slots are pointer-aligned by format. No Rust
    // reference aliases the slot during the walk.
    unsafe {
        std::ptr::write_volatile(slot_address as *mut usize, value);
    }

    match protection.restore(slot_address, THUNK_SIZE, previous) {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(
                "Slot 0x{:x} patched but protection was not restored: {}",
                slot_address, e
            );
            Ok(false)
        }
    }
}
