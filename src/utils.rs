use core::mem::size_of;
use core::ptr;

use crate::error::{Error, Result};
use crate::windows::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_ARM64, IMAGE_FILE_MACHINE_ARMNT,
    IMAGE_FILE_MACHINE_I386, IMAGE_FILE_MACHINE_UNKNOWN,
};

/// Machine type of the running process. Images for any other machine are
/// rejected by the validator.
pub const HOST_MACHINE: u16 = if cfg!(target_arch = "x86_64") {
    IMAGE_FILE_MACHINE_AMD64
} else if cfg!(target_arch = "x86") {
    IMAGE_FILE_MACHINE_I386
} else if cfg!(target_arch = "aarch64") {
    IMAGE_FILE_MACHINE_ARM64
} else if cfg!(target_arch = "arm") {
    IMAGE_FILE_MACHINE_ARMNT
} else {
    IMAGE_FILE_MACHINE_UNKNOWN
};

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    value.wrapping_add(alignment - 1) & !(alignment - 1)
}

/// Reads a `T` at `offset` in `buffer`, failing instead of reading past its end.
///
/// `T` must be one of the plain `#[repr(C)]` structures from `windows.rs` (or a
/// primitive integer), for which every bit pattern is valid.
pub fn read_struct<T: Copy>(buffer: &[u8], offset: usize) -> Result<T> {
    let needed = offset.checked_add(size_of::<T>()).ok_or(Error::TooSmall {
        needed: usize::MAX,
        available: buffer.len(),
    })?;
    if needed > buffer.len() {
        return Err(Error::TooSmall {
            needed,
            available: buffer.len(),
        });
    }
    Ok(unsafe { ptr::read_unaligned(buffer.as_ptr().add(offset) as *const T) })
}

/// Case-insensitive comparison of two UTF-16 strings over ASCII letters,
/// looking at no more than the shorter length. Equal prefixes compare equal.
pub fn wide_prefix_cmp(a: &[u16], b: &[u16]) -> core::cmp::Ordering {
    let fold = |c: u16| {
        if (b'A' as u16..=b'Z' as u16).contains(&c) {
            c + 0x20
        } else {
            c
        }
    };
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| fold(x).cmp(&fold(y)))
        .find(|ord| ord.is_ne())
        .unwrap_or(core::cmp::Ordering::Equal)
}
