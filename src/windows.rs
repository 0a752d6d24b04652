#![allow(non_snake_case, non_camel_case_types)]

use core::ffi::c_void;

// --- Type aliases ---
pub type VIRTUAL_ALLOCATION_TYPE = u32;
pub type VIRTUAL_FREE_TYPE = u32;
pub type PAGE_PROTECTION_FLAGS = u32;
pub type BOOL = i32;
pub type HMODULE = *mut c_void;

// --- Memory allocation constants ---
pub const MEM_COMMIT: VIRTUAL_ALLOCATION_TYPE = 0x1000;
pub const MEM_RESERVE: VIRTUAL_ALLOCATION_TYPE = 0x2000;
pub const MEM_DECOMMIT: VIRTUAL_FREE_TYPE = 0x4000;
pub const MEM_RELEASE: VIRTUAL_FREE_TYPE = 0x8000;

// --- Page protection constants ---
pub const PAGE_NOACCESS: PAGE_PROTECTION_FLAGS = 0x01;
pub const PAGE_READONLY: PAGE_PROTECTION_FLAGS = 0x02;
pub const PAGE_READWRITE: PAGE_PROTECTION_FLAGS = 0x04;
pub const PAGE_WRITECOPY: PAGE_PROTECTION_FLAGS = 0x08;
pub const PAGE_EXECUTE: PAGE_PROTECTION_FLAGS = 0x10;
pub const PAGE_EXECUTE_READ: PAGE_PROTECTION_FLAGS = 0x20;
pub const PAGE_EXECUTE_READWRITE: PAGE_PROTECTION_FLAGS = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: PAGE_PROTECTION_FLAGS = 0x80;
pub const PAGE_NOCACHE: PAGE_PROTECTION_FLAGS = 0x200;

// --- PE directory entry indices ---
pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

// --- Relocation types ---
pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

// --- Signatures ---
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"

// --- PE optional header magic ---
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x010B;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x020B;

// --- Machine types ---
pub const IMAGE_FILE_MACHINE_UNKNOWN: u16 = 0x0000;
pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
pub const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01C4;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;

// --- File characteristics ---
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
pub const IMAGE_FILE_DLL: u16 = 0x2000;

// --- Section characteristics ---
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
pub const IMAGE_SCN_MEM_NOT_CACHED: u32 = 0x0400_0000;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

// --- Ordinal import flags ---
pub const IMAGE_ORDINAL_FLAG64: u64 = 1 << 63;
pub const IMAGE_ORDINAL_FLAG32: u32 = 1 << 31;

// --- Resource directory flags ---
pub const IMAGE_RESOURCE_NAME_IS_STRING: u32 = 0x8000_0000;
pub const IMAGE_RESOURCE_DATA_IS_DIRECTORY: u32 = 0x8000_0000;

// --- Entry point reasons ---
pub const DLL_PROCESS_DETACH: u32 = 0;
pub const DLL_PROCESS_ATTACH: u32 = 1;

pub type DllEntryProc = unsafe extern "system" fn(
    hinstDLL: *mut c_void,
    fdwReason: u32,
    lpReserved: *mut c_void,
) -> BOOL;

pub type ExeEntryProc = unsafe extern "system" fn() -> i32;

pub type PIMAGE_TLS_CALLBACK =
    unsafe extern "system" fn(DllHandle: *mut c_void, Reason: u32, Reserved: *mut c_void);

#[cfg(windows)]
#[link(name = "kernel32")]
extern "system" {
    pub fn VirtualAlloc(
        lpaddress: *const c_void,
        dwsize: usize,
        flallocationtype: VIRTUAL_ALLOCATION_TYPE,
        flprotect: PAGE_PROTECTION_FLAGS,
    ) -> *mut c_void;

    pub fn VirtualFree(
        lpaddress: *mut c_void,
        dwsize: usize,
        dwfreetype: VIRTUAL_FREE_TYPE,
    ) -> BOOL;

    pub fn VirtualProtect(
        lpaddress: *const c_void,
        dwsize: usize,
        flnewprotect: PAGE_PROTECTION_FLAGS,
        lpfloldprotect: *mut PAGE_PROTECTION_FLAGS,
    ) -> BOOL;

    pub fn LoadLibraryA(lplibfilename: *const u8) -> HMODULE;

    pub fn GetProcAddress(hmodule: HMODULE, lpprocname: *const u8) -> *mut c_void;

    pub fn FreeLibrary(hlibmodule: HMODULE) -> BOOL;

    pub fn GetNativeSystemInfo(lpsysteminfo: *mut SYSTEM_INFO);

    pub fn GetThreadLocale() -> u32;
}

#[cfg(windows)]
#[repr(C)]
pub struct SYSTEM_INFO {
    pub wProcessorArchitecture: u16,
    pub wReserved: u16,
    pub dwPageSize: u32,
    pub lpMinimumApplicationAddress: *mut c_void,
    pub lpMaximumApplicationAddress: *mut c_void,
    pub dwActiveProcessorMask: usize,
    pub dwNumberOfProcessors: u32,
    pub dwProcessorType: u32,
    pub dwAllocationGranularity: u32,
    pub wProcessorLevel: u16,
    pub wProcessorRevision: u16,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_DATA_DIRECTORY {
    pub VirtualAddress: u32,
    pub Size: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_DOS_HEADER {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: i32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_FILE_HEADER {
    pub Machine: u16,
    pub NumberOfSections: u16,
    pub TimeDateStamp: u32,
    pub PointerToSymbolTable: u32,
    pub NumberOfSymbols: u32,
    pub SizeOfOptionalHeader: u16,
    pub Characteristics: u16,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_OPTIONAL_HEADER32 {
    pub Magic: u16,
    pub MajorLinkerVersion: u8,
    pub MinorLinkerVersion: u8,
    pub SizeOfCode: u32,
    pub SizeOfInitializedData: u32,
    pub SizeOfUninitializedData: u32,
    pub AddressOfEntryPoint: u32,
    pub BaseOfCode: u32,
    pub BaseOfData: u32,
    pub ImageBase: u32,
    pub SectionAlignment: u32,
    pub FileAlignment: u32,
    pub MajorOperatingSystemVersion: u16,
    pub MinorOperatingSystemVersion: u16,
    pub MajorImageVersion: u16,
    pub MinorImageVersion: u16,
    pub MajorSubsystemVersion: u16,
    pub MinorSubsystemVersion: u16,
    pub Win32VersionValue: u32,
    pub SizeOfImage: u32,
    pub SizeOfHeaders: u32,
    pub CheckSum: u32,
    pub Subsystem: u16,
    pub DllCharacteristics: u16,
    pub SizeOfStackReserve: u32,
    pub SizeOfStackCommit: u32,
    pub SizeOfHeapReserve: u32,
    pub SizeOfHeapCommit: u32,
    pub LoaderFlags: u32,
    pub NumberOfRvaAndSizes: u32,
    pub DataDirectory: [IMAGE_DATA_DIRECTORY; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_OPTIONAL_HEADER64 {
    pub Magic: u16,
    pub MajorLinkerVersion: u8,
    pub MinorLinkerVersion: u8,
    pub SizeOfCode: u32,
    pub SizeOfInitializedData: u32,
    pub SizeOfUninitializedData: u32,
    pub AddressOfEntryPoint: u32,
    pub BaseOfCode: u32,
    pub ImageBase: u64,
    pub SectionAlignment: u32,
    pub FileAlignment: u32,
    pub MajorOperatingSystemVersion: u16,
    pub MinorOperatingSystemVersion: u16,
    pub MajorImageVersion: u16,
    pub MinorImageVersion: u16,
    pub MajorSubsystemVersion: u16,
    pub MinorSubsystemVersion: u16,
    pub Win32VersionValue: u32,
    pub SizeOfImage: u32,
    pub SizeOfHeaders: u32,
    pub CheckSum: u32,
    pub Subsystem: u16,
    pub DllCharacteristics: u16,
    pub SizeOfStackReserve: u64,
    pub SizeOfStackCommit: u64,
    pub SizeOfHeapReserve: u64,
    pub SizeOfHeapCommit: u64,
    pub LoaderFlags: u32,
    pub NumberOfRvaAndSizes: u32,
    pub DataDirectory: [IMAGE_DATA_DIRECTORY; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_NT_HEADERS32 {
    pub Signature: u32,
    pub FileHeader: IMAGE_FILE_HEADER,
    pub OptionalHeader: IMAGE_OPTIONAL_HEADER32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_NT_HEADERS64 {
    pub Signature: u32,
    pub FileHeader: IMAGE_FILE_HEADER,
    pub OptionalHeader: IMAGE_OPTIONAL_HEADER64,
}

// The loader only maps images of the host's own bitness, so the native
// layouts are picked at compile time.
#[cfg(target_pointer_width = "64")]
mod native {
    use super::*;

    pub type IMAGE_NT_HEADERS = IMAGE_NT_HEADERS64;
    pub type IMAGE_OPTIONAL_HEADER = IMAGE_OPTIONAL_HEADER64;
    pub type IMAGE_TLS_DIRECTORY = IMAGE_TLS_DIRECTORY64;
    pub const IMAGE_NT_OPTIONAL_HDR_MAGIC: u16 = IMAGE_NT_OPTIONAL_HDR64_MAGIC;
    pub const IMAGE_ORDINAL_FLAG: usize = IMAGE_ORDINAL_FLAG64 as usize;
}

#[cfg(target_pointer_width = "32")]
mod native {
    use super::*;

    pub type IMAGE_NT_HEADERS = IMAGE_NT_HEADERS32;
    pub type IMAGE_OPTIONAL_HEADER = IMAGE_OPTIONAL_HEADER32;
    pub type IMAGE_TLS_DIRECTORY = IMAGE_TLS_DIRECTORY32;
    pub const IMAGE_NT_OPTIONAL_HDR_MAGIC: u16 = IMAGE_NT_OPTIONAL_HDR32_MAGIC;
    pub const IMAGE_ORDINAL_FLAG: usize = IMAGE_ORDINAL_FLAG32 as usize;
}

pub use native::*;

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_SECTION_HEADER {
    pub Name: [u8; 8],
    pub VirtualSize: u32,
    pub VirtualAddress: u32,
    pub SizeOfRawData: u32,
    pub PointerToRawData: u32,
    pub PointerToRelocations: u32,
    pub PointerToLinenumbers: u32,
    pub NumberOfRelocations: u16,
    pub NumberOfLinenumbers: u16,
    pub Characteristics: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_BASE_RELOCATION {
    pub VirtualAddress: u32,
    pub SizeOfBlock: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_IMPORT_DESCRIPTOR {
    pub OriginalFirstThunk: u32,
    pub TimeDateStamp: u32,
    pub ForwarderChain: u32,
    pub Name: u32,
    pub FirstThunk: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_TLS_DIRECTORY32 {
    pub StartAddressOfRawData: u32,
    pub EndAddressOfRawData: u32,
    pub AddressOfIndex: u32,
    pub AddressOfCallBacks: u32,
    pub SizeOfZeroFill: u32,
    pub Characteristics: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_TLS_DIRECTORY64 {
    pub StartAddressOfRawData: u64,
    pub EndAddressOfRawData: u64,
    pub AddressOfIndex: u64,
    pub AddressOfCallBacks: u64,
    pub SizeOfZeroFill: u32,
    pub Characteristics: u32,
}

// ============================================================================
// Export table
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_EXPORT_DIRECTORY {
    pub Characteristics: u32,
    pub TimeDateStamp: u32,
    pub MajorVersion: u16,
    pub MinorVersion: u16,
    pub Name: u32,
    pub Base: u32,
    pub NumberOfFunctions: u32,
    pub NumberOfNames: u32,
    pub AddressOfFunctions: u32,
    pub AddressOfNames: u32,
    pub AddressOfNameOrdinals: u32,
}

// ============================================================================
// Resource directory
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_RESOURCE_DIRECTORY {
    pub Characteristics: u32,
    pub TimeDateStamp: u32,
    pub MajorVersion: u16,
    pub MinorVersion: u16,
    pub NumberOfNamedEntries: u16,
    pub NumberOfIdEntries: u16,
}

/// `Name` holds either an ID in the low 16 bits or, with the high bit set,
/// the offset of an `IMAGE_RESOURCE_DIR_STRING_U` from the resource root.
/// `OffsetToData` points at a subdirectory when its high bit is set and at an
/// `IMAGE_RESOURCE_DATA_ENTRY` otherwise.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_RESOURCE_DIRECTORY_ENTRY {
    pub Name: u32,
    pub OffsetToData: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IMAGE_RESOURCE_DATA_ENTRY {
    pub OffsetToData: u32,
    pub Size: u32,
    pub CodePage: u32,
    pub Reserved: u32,
}
