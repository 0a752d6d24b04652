//! Export table lookups.
//!
//! Ordinal lookups index the function table directly. Name lookups go through
//! a name-sorted index of the export name table, built once per module and
//! binary-searched afterwards.

use alloc::vec::Vec;
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::NonNull;

use log::trace;

use crate::image::ImageView;
use crate::windows::{IMAGE_DATA_DIRECTORY, IMAGE_EXPORT_DIRECTORY};

/// One entry of the sorted name index: where the name lives in the image and
/// which slot of the function table it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportName {
    name_rva: u32,
    name_len: u32,
    index: u16,
}

impl ExportName {
    fn name<'a>(&self, image: &'a ImageView) -> &'a [u8] {
        image
            .bytes(self.name_rva as usize, self.name_len as usize)
            .unwrap_or(&[])
    }
}

/// The export directory of a mapped image.
#[derive(Debug, Clone, Copy)]
pub struct ExportDirectory {
    image: ImageView,
    directory: IMAGE_DATA_DIRECTORY,
    exports: IMAGE_EXPORT_DIRECTORY,
}

impl ExportDirectory {
    /// Returns `None` when the image exports nothing.
    pub fn locate(image: &ImageView, directory: IMAGE_DATA_DIRECTORY) -> Option<Self> {
        if directory.Size == 0 {
            return None;
        }
        let exports: IMAGE_EXPORT_DIRECTORY = image.read(directory.VirtualAddress as usize).ok()?;
        if exports.NumberOfNames == 0 || exports.NumberOfFunctions == 0 {
            return None;
        }
        Some(Self {
            image: *image,
            directory,
            exports,
        })
    }

    pub fn by_ordinal(&self, ordinal: u16) -> Option<NonNull<c_void>> {
        let index = u32::from(ordinal).checked_sub(self.exports.Base)?;
        self.function(index)
    }

    /// Looks `name` up in `index`, which must come from [`Self::name_index`]
    /// on the same image.
    pub fn by_name(&self, index: &[ExportName], name: &[u8]) -> Option<NonNull<c_void>> {
        let found = index
            .binary_search_by(|entry| entry.name(&self.image).cmp(name))
            .ok()?;
        self.function(u32::from(index[found].index))
    }

    /// Builds the name index from the export name and ordinal tables, sorted
    /// by name bytes. Entries whose name does not resolve inside the image are
    /// left out.
    pub fn name_index(&self) -> Vec<ExportName> {
        let names = self.exports.AddressOfNames as usize;
        let ordinals = self.exports.AddressOfNameOrdinals as usize;

        let mut index: Vec<ExportName> = (0..self.exports.NumberOfNames as usize)
            .filter_map(|i| {
                let name_rva: u32 = self.image.read(names + i * size_of::<u32>()).ok()?;
                let index: u16 = self.image.read(ordinals + i * size_of::<u16>()).ok()?;
                let name = self.image.cstr(name_rva as usize).ok()?;
                Some(ExportName {
                    name_rva,
                    name_len: name.to_bytes().len() as u32,
                    index,
                })
            })
            .collect();

        index.sort_unstable_by(|a, b| a.name(&self.image).cmp(b.name(&self.image)));
        trace!("built export name index ({} names)", index.len());
        index
    }

    /// Address stored in slot `index` of the function table. Empty slots and
    /// forwarders (whose RVA points back into the export directory) are not
    /// callable.
    fn function(&self, index: u32) -> Option<NonNull<c_void>> {
        if index >= self.exports.NumberOfFunctions {
            return None;
        }

        let slot = self.exports.AddressOfFunctions as usize + index as usize * size_of::<u32>();
        let rva: u32 = self.image.read(slot).ok()?;
        let start = self.directory.VirtualAddress;
        if rva == 0 || (start..start.saturating_add(self.directory.Size)).contains(&rva) {
            return None;
        }

        let address = self.image.address(rva as usize, 0).ok()?;
        NonNull::new(address as *mut c_void)
    }
}
