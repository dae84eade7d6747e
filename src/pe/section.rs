//! Section table records, used to translate RVAs for file-layout images

use byteorder::{ByteOrder, LittleEndian};

use crate::pe::{PeError, Result};

/// Where one section lives in virtual address space and in the file
#[derive(Debug, Clone)]
pub struct SectionExtent {
    /// Section name (8 bytes, NUL padded)
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

impl SectionExtent {
    /// Size of a section header record in bytes
    pub const SIZE: usize = 40;

    /// Parse one section header record from a byte slice
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(PeError::OutOfBounds {
                offset: 0,
                len: Self::SIZE,
                size: data.len(),
            });
        }

        let mut name = [0u8; 8];
        name.copy_from_slice(&data[0..8]);

        Ok(SectionExtent {
            name,
            virtual_size: LittleEndian::read_u32(&data[8..12]),
            virtual_address: LittleEndian::read_u32(&data[12..16]),
            size_of_raw_data: LittleEndian::read_u32(&data[16..20]),
            pointer_to_raw_data: LittleEndian::read_u32(&data[20..24]),
        })
    }

    /// Get the section name as a string
    pub fn get_name(&self) -> String {
        self.name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as char)
            .collect()
    }

    /// Whether `rva` falls inside this section's virtual span
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva < self.virtual_address.wrapping_add(self.virtual_size)
    }

    /// Translate an RVA inside this section to its file offset.
    /// Only meaningful when `contains_rva` holds.
    pub fn rva_to_offset(&self, rva: u32) -> u32 {
        rva - self.virtual_address + self.pointer_to_raw_data
    }
}
