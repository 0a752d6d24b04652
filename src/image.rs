use core::ffi::CStr;
use core::mem::size_of;
use core::ptr;

use crate::error::{Error, Result};

/// A bounds-checked window over the mapped image.
///
/// All structure walks (sections, relocations, imports, exports, resources)
/// go through this view using RVAs, so a hostile image can at worst produce an
/// [`Error::OutOfBounds`] instead of reading or writing outside its region.
#[derive(Debug, Clone, Copy)]
pub struct ImageView {
    base: usize,
    size: usize,
}

impl ImageView {
    /// # Safety
    ///
    /// `base..base + size` must be a region owned by the caller for as long as
    /// the view (or anything borrowed from it) is used.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Absolute address of `rva`, checking that `len` bytes fit there.
    pub fn address(&self, rva: usize, len: usize) -> Result<usize> {
        match rva.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.base + rva),
            _ => Err(Error::OutOfBounds { rva, size: len }),
        }
    }

    /// Converts an absolute address inside the image back to an RVA.
    pub fn rva_of(&self, address: usize) -> Result<usize> {
        let rva = address.wrapping_sub(self.base);
        if rva < self.size {
            Ok(rva)
        } else {
            Err(Error::OutOfBounds { rva, size: 0 })
        }
    }

    pub fn read<T: Copy>(&self, rva: usize) -> Result<T> {
        let address = self.address(rva, size_of::<T>())?;
        Ok(unsafe { ptr::read_unaligned(address as *const T) })
    }

    pub fn write<T: Copy>(&self, rva: usize, value: T) -> Result<()> {
        let address = self.address(rva, size_of::<T>())?;
        unsafe { ptr::write_unaligned(address as *mut T, value) };
        Ok(())
    }

    pub fn bytes(&self, rva: usize, len: usize) -> Result<&[u8]> {
        let address = self.address(rva, len)?;
        Ok(unsafe { core::slice::from_raw_parts(address as *const u8, len) })
    }

    /// Reads `len` UTF-16 code units. The data may be unaligned.
    pub fn wide(&self, rva: usize, len: usize) -> Result<alloc::vec::Vec<u16>> {
        let bytes = self.bytes(rva, len * 2)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub fn copy_from(&self, rva: usize, data: &[u8]) -> Result<()> {
        let address = self.address(rva, data.len())?;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len()) };
        Ok(())
    }

    pub fn fill_zero(&self, rva: usize, len: usize) -> Result<()> {
        let address = self.address(rva, len)?;
        unsafe { ptr::write_bytes(address as *mut u8, 0, len) };
        Ok(())
    }

    /// The NUL-terminated string starting at `rva`; the terminator must lie
    /// inside the image.
    pub fn cstr(&self, rva: usize) -> Result<&CStr> {
        let tail = self.bytes(rva, self.size.saturating_sub(rva))?;
        CStr::from_bytes_until_nul(tail).map_err(|_| Error::OutOfBounds {
            rva,
            size: tail.len(),
        })
    }
}
