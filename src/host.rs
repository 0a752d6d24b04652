//! The operating-system capabilities the loader consumes.
//!
//! The loader never calls the OS directly. Memory management and dependency
//! resolution go through a [`Host`] value handed to
//! [`MemoryModule::load_with`](crate::MemoryModule::load_with), which lets a
//! caller sandbox, instrument, or fully replace them (for example resolving
//! dependencies from another in-memory store). [`WindowsHost`] routes
//! everything to kernel32.

use core::ffi::{c_void, CStr};
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::windows::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_CNT_UNINITIALIZED_DATA,
    IMAGE_SCN_MEM_DISCARDABLE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_NOT_CACHED, IMAGE_SCN_MEM_READ,
    IMAGE_SCN_MEM_WRITE, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE,
    PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_NOCACHE,
    PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};

bitflags! {
    /// What an [`Host::alloc`] call should do with the range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationType: u32 {
        const COMMIT = MEM_COMMIT;
        const RESERVE = MEM_RESERVE;
    }
}

bitflags! {
    /// What an [`Host::free`] call should do with the range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FreeType: u32 {
        const DECOMMIT = MEM_DECOMMIT;
        const RELEASE = MEM_RELEASE;
    }
}

bitflags! {
    /// Page protection constants, bit-compatible with `PAGE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageProtection: u32 {
        const NOACCESS = PAGE_NOACCESS;
        const READONLY = PAGE_READONLY;
        const READWRITE = PAGE_READWRITE;
        const WRITECOPY = PAGE_WRITECOPY;
        const EXECUTE = PAGE_EXECUTE;
        const EXECUTE_READ = PAGE_EXECUTE_READ;
        const EXECUTE_READWRITE = PAGE_EXECUTE_READWRITE;
        const EXECUTE_WRITECOPY = PAGE_EXECUTE_WRITECOPY;
        const NOCACHE = PAGE_NOCACHE;
    }
}

bitflags! {
    /// The section characteristics the loader cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CNT_CODE = IMAGE_SCN_CNT_CODE;
        const CNT_INITIALIZED_DATA = IMAGE_SCN_CNT_INITIALIZED_DATA;
        const CNT_UNINITIALIZED_DATA = IMAGE_SCN_CNT_UNINITIALIZED_DATA;
        const MEM_DISCARDABLE = IMAGE_SCN_MEM_DISCARDABLE;
        const MEM_NOT_CACHED = IMAGE_SCN_MEM_NOT_CACHED;
        const MEM_EXECUTE = IMAGE_SCN_MEM_EXECUTE;
        const MEM_READ = IMAGE_SCN_MEM_READ;
        const MEM_WRITE = IMAGE_SCN_MEM_WRITE;

        const _ = !0;
    }
}

/// An opaque handle to a dependency loaded through [`Host::load_library`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ModuleHandle(NonNull<c_void>);

// Module handles identify process-wide objects; they are never dereferenced by
// the loader.
unsafe impl Send for ModuleHandle {}
unsafe impl Sync for ModuleHandle {}

impl ModuleHandle {
    pub fn new(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHandle({:p})", self.0)
    }
}

/// How an imported function is named in a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol<'a> {
    Name(&'a CStr),
    Ordinal(u16),
}

impl fmt::Display for Symbol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Name(name) => write!(f, "{}", name.to_string_lossy()),
            Symbol::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

/// Memory and dynamic-linking capabilities used while loading and unloading.
///
/// No internal locking is applied around these calls. Modules loaded on
/// different threads may share a host only if its implementation is itself
/// safe for concurrent use.
///
/// # Safety
///
/// A successful [`alloc`](Host::alloc) must return memory that is readable and
/// writable for the whole requested range and stays valid until it is passed
/// back to [`free`](Host::free) with [`FreeType::RELEASE`]. The loader writes
/// the image into that memory and executes code from it.
pub unsafe trait Host {
    /// Granularity used for alignment and for deciding which pages may be
    /// decommitted.
    fn page_size(&self) -> usize;

    /// Reserves and/or commits `size` bytes at `address` (or anywhere, when
    /// `address` is null).
    fn alloc(
        &self,
        address: *mut c_void,
        size: usize,
        allocation: AllocationType,
        protection: PageProtection,
    ) -> Option<NonNull<c_void>>;

    /// Releases a region (`size` is 0) or decommits a range.
    ///
    /// # Safety
    ///
    /// `address` must come from this host's `alloc`.
    unsafe fn free(&self, address: *mut c_void, size: usize, free_type: FreeType) -> bool;

    /// Changes the protection of a committed range.
    ///
    /// # Safety
    ///
    /// The range must lie inside memory returned by this host's `alloc`.
    unsafe fn protect(&self, address: *mut c_void, size: usize, protection: PageProtection) -> bool;

    /// Loads a dependency by name.
    fn load_library(&self, name: &CStr) -> Option<ModuleHandle>;

    /// Resolves a symbol exported by a dependency.
    fn get_proc_address(&self, module: ModuleHandle, symbol: Symbol<'_>) -> Option<NonNull<c_void>>;

    /// Unloads a dependency obtained from `load_library`.
    fn free_library(&self, module: ModuleHandle);

    /// Language substituted when a resource lookup asks for
    /// [`DEFAULT_LANGUAGE`](crate::DEFAULT_LANGUAGE).
    fn default_language(&self) -> u16 {
        0
    }
}

/// The default host: kernel32's virtual-memory and library functions.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsHost;

#[cfg(windows)]
unsafe impl Host for WindowsHost {
    fn page_size(&self) -> usize {
        let mut info = core::mem::MaybeUninit::<crate::windows::SYSTEM_INFO>::zeroed();
        unsafe {
            crate::windows::GetNativeSystemInfo(info.as_mut_ptr());
            info.assume_init().dwPageSize as usize
        }
    }

    fn alloc(
        &self,
        address: *mut c_void,
        size: usize,
        allocation: AllocationType,
        protection: PageProtection,
    ) -> Option<NonNull<c_void>> {
        let ptr = unsafe {
            crate::windows::VirtualAlloc(address, size, allocation.bits(), protection.bits())
        };
        NonNull::new(ptr)
    }

    unsafe fn free(&self, address: *mut c_void, size: usize, free_type: FreeType) -> bool {
        crate::windows::VirtualFree(address, size, free_type.bits()) != 0
    }

    unsafe fn protect(
        &self,
        address: *mut c_void,
        size: usize,
        protection: PageProtection,
    ) -> bool {
        let mut old_protect = 0;
        crate::windows::VirtualProtect(address, size, protection.bits(), &mut old_protect) != 0
    }

    fn load_library(&self, name: &CStr) -> Option<ModuleHandle> {
        ModuleHandle::new(unsafe { crate::windows::LoadLibraryA(name.as_ptr() as *const u8) })
    }

    fn get_proc_address(
        &self,
        module: ModuleHandle,
        symbol: Symbol<'_>,
    ) -> Option<NonNull<c_void>> {
        let name = match symbol {
            Symbol::Name(name) => name.as_ptr() as *const u8,
            // MAKEINTRESOURCE-style ordinal: a "pointer" below 64K
            Symbol::Ordinal(ordinal) => ordinal as usize as *const u8,
        };
        NonNull::new(unsafe { crate::windows::GetProcAddress(module.as_ptr(), name) })
    }

    fn free_library(&self, module: ModuleHandle) {
        unsafe {
            crate::windows::FreeLibrary(module.as_ptr());
        }
    }

    fn default_language(&self) -> u16 {
        // LANGIDFROMLCID
        unsafe { crate::windows::GetThreadLocale() as u16 }
    }
}
