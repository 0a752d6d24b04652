use alloc::string::ToString;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::mem::size_of;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::host::{
    AllocationType, FreeType, Host, ModuleHandle, PageProtection, SectionFlags, Symbol,
};
use crate::image::ImageView;
use crate::utils::{align_down, align_up, read_struct, HOST_MACHINE};
use crate::windows::{
    DLL_PROCESS_ATTACH, IMAGE_BASE_RELOCATION, IMAGE_DATA_DIRECTORY,
    IMAGE_DIRECTORY_ENTRY_BASERELOC, IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_DIRECTORY_ENTRY_TLS,
    IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE, IMAGE_FILE_DLL, IMAGE_FILE_HEADER,
    IMAGE_IMPORT_DESCRIPTOR, IMAGE_NT_HEADERS, IMAGE_NT_OPTIONAL_HDR_MAGIC, IMAGE_NT_SIGNATURE,
    IMAGE_NUMBEROF_DIRECTORY_ENTRIES, IMAGE_ORDINAL_FLAG, IMAGE_REL_BASED_ABSOLUTE,
    IMAGE_REL_BASED_HIGHLOW, IMAGE_SECTION_HEADER, IMAGE_TLS_DIRECTORY, PIMAGE_TLS_CALLBACK,
};
#[cfg(target_pointer_width = "64")]
use crate::windows::IMAGE_REL_BASED_DIR64;

// ---------------------------------------------------------------------------
// Header parsing
// ---------------------------------------------------------------------------

/// The parsed NT headers and section table of an image.
#[derive(Debug, Clone)]
pub struct ImageHeaders {
    /// Offset of the NT headers (`e_lfanew`).
    pub nt_offset: usize,
    pub nt: IMAGE_NT_HEADERS,
    pub sections: Vec<IMAGE_SECTION_HEADER>,
}

impl ImageHeaders {
    /// Parses the headers of an image laid out in `buffer`, checking the
    /// signatures and that every structure fits.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        let (nt_offset, nt) = read_nt_headers(buffer)?;
        let sections = read_section_table(buffer, nt_offset, &nt.FileHeader)?;
        Ok(Self {
            nt_offset,
            nt,
            sections,
        })
    }

    pub fn data_directory(&self, index: usize) -> IMAGE_DATA_DIRECTORY {
        if index >= IMAGE_NUMBEROF_DIRECTORY_ENTRIES {
            return IMAGE_DATA_DIRECTORY::default();
        }
        self.nt.OptionalHeader.DataDirectory[index]
    }

    pub fn image_base(&self) -> usize {
        self.nt.OptionalHeader.ImageBase as usize
    }

    pub fn section_alignment(&self) -> usize {
        self.nt.OptionalHeader.SectionAlignment as usize
    }

    pub fn size_of_image(&self) -> usize {
        self.nt.OptionalHeader.SizeOfImage as usize
    }

    pub fn size_of_headers(&self) -> usize {
        self.nt.OptionalHeader.SizeOfHeaders as usize
    }

    pub fn entry_point_rva(&self) -> usize {
        self.nt.OptionalHeader.AddressOfEntryPoint as usize
    }

    pub fn is_dll(&self) -> bool {
        self.nt.FileHeader.Characteristics & IMAGE_FILE_DLL != 0
    }
}

fn read_nt_headers(buffer: &[u8]) -> Result<(usize, IMAGE_NT_HEADERS)> {
    let dos: IMAGE_DOS_HEADER = read_struct(buffer, 0)?;
    if dos.e_magic != IMAGE_DOS_SIGNATURE {
        return Err(Error::InvalidDosSignature);
    }

    let nt_offset = usize::try_from(dos.e_lfanew).map_err(|_| Error::InvalidNtSignature)?;
    let nt: IMAGE_NT_HEADERS = read_struct(buffer, nt_offset)?;
    if nt.Signature != IMAGE_NT_SIGNATURE {
        return Err(Error::InvalidNtSignature);
    }
    Ok((nt_offset, nt))
}

/// The section table follows the optional header; its declared size is used
/// rather than the structure size so non-standard headers still work.
fn read_section_table(
    buffer: &[u8],
    nt_offset: usize,
    file_header: &IMAGE_FILE_HEADER,
) -> Result<Vec<IMAGE_SECTION_HEADER>> {
    let first = nt_offset
        + size_of::<u32>()
        + size_of::<IMAGE_FILE_HEADER>()
        + file_header.SizeOfOptionalHeader as usize;

    (0..file_header.NumberOfSections as usize)
        .map(|i| read_struct(buffer, first + i * size_of::<IMAGE_SECTION_HEADER>()))
        .collect()
}

/// Checks that `buffer` holds an image this process can map.
///
/// Nothing is allocated here; every rejection happens before the host sees a
/// single call.
pub fn validate(buffer: &[u8], page_size: usize) -> Result<ImageHeaders> {
    let (nt_offset, nt) = read_nt_headers(buffer)?;

    if nt.FileHeader.Machine != HOST_MACHINE {
        return Err(Error::MachineMismatch {
            expected: HOST_MACHINE,
            found: nt.FileHeader.Machine,
        });
    }
    if nt.OptionalHeader.Magic != IMAGE_NT_OPTIONAL_HDR_MAGIC {
        return Err(Error::InvalidOptionalHeader(nt.OptionalHeader.Magic));
    }

    let section_alignment = nt.OptionalHeader.SectionAlignment;
    if section_alignment & 1 != 0 {
        return Err(Error::InvalidSectionAlignment(section_alignment));
    }

    let sections = read_section_table(buffer, nt_offset, &nt.FileHeader)?;
    let headers = ImageHeaders {
        nt_offset,
        nt,
        sections,
    };

    // Sections without raw data still occupy one alignment unit of
    // uninitialized memory.
    let mut last_section_end = 0usize;
    for section in &headers.sections {
        let extent = match section.SizeOfRawData {
            0 => section_alignment,
            raw => raw,
        };
        let end = (section.VirtualAddress as usize).saturating_add(extent as usize);
        last_section_end = last_section_end.max(end);

        if section.SizeOfRawData != 0 {
            raw_range(buffer, section)?;
        }
    }

    let aligned_image_size = align_up(headers.size_of_image(), page_size);
    if aligned_image_size != align_up(last_section_end, page_size) {
        return Err(Error::ImageSizeMismatch {
            declared: aligned_image_size,
            sections_end: last_section_end,
        });
    }

    if headers.size_of_headers() > buffer.len() {
        return Err(Error::TooSmall {
            needed: headers.size_of_headers(),
            available: buffer.len(),
        });
    }

    Ok(headers)
}

/// The raw bytes of a section in the source buffer.
fn raw_range<'a>(buffer: &'a [u8], section: &IMAGE_SECTION_HEADER) -> Result<&'a [u8]> {
    let offset = section.PointerToRawData as usize;
    let size = section.SizeOfRawData as usize;
    offset
        .checked_add(size)
        .and_then(|end| buffer.get(offset..end))
        .ok_or(Error::TruncatedSection { offset, size })
}

// ---------------------------------------------------------------------------
// Image allocation
// ---------------------------------------------------------------------------

/// Whether `[start, start + size)` touches two different 4GiB segments.
#[inline]
pub fn crosses_4gb_boundary(start: usize, size: usize) -> bool {
    (start as u64 >> 32) < ((start as u64).wrapping_add(size as u64) >> 32)
}

/// Reserves and commits the whole image, first at its preferred base and then
/// anywhere.
///
/// On 64-bit hosts a region straddling a 4GiB boundary is kept (so the same
/// address is not handed out again) and returned in the second element; those
/// regions have to be released together with the image.
pub fn allocate_image<H: Host>(
    host: &H,
    preferred_base: usize,
    size: usize,
) -> Result<(usize, Vec<usize>)> {
    let commit = AllocationType::RESERVE | AllocationType::COMMIT;
    let protection = PageProtection::READWRITE;
    let reserve = |address: usize| host.alloc(address as *mut c_void, size, commit, protection);
    let mut code = reserve(preferred_base)
        .or_else(|| reserve(0))
        .ok_or(Error::Allocation { size })?
        .as_ptr() as usize;

    #[allow(unused_mut)]
    let mut blocked = Vec::new();

    #[cfg(target_pointer_width = "64")]
    while crosses_4gb_boundary(code, size) {
        trace!("{:#x}+{:#x} crosses a 4GiB boundary", code, size);
        blocked.push(code);

        match reserve(0) {
            Some(next) => code = next.as_ptr() as usize,
            None => {
                release_blocked(host, &mut blocked);
                return Err(Error::Allocation { size });
            }
        }
    }

    Ok((code, blocked))
}

/// Releases every region set aside by [`allocate_image`].
pub fn release_blocked<H: Host>(host: &H, blocked: &mut Vec<usize>) {
    for address in blocked.drain(..) {
        unsafe { host.free(address as *mut c_void, 0, FreeType::RELEASE) };
    }
}

// ---------------------------------------------------------------------------
// Section writing
// ---------------------------------------------------------------------------

/// Copies the header block to the start of the image and points its
/// `ImageBase` at the actual load address. Returns the headers re-read from
/// the copy, which is what every later stage works on.
pub fn copy_headers<H: Host>(
    host: &H,
    image: &ImageView,
    buffer: &[u8],
    size_of_headers: usize,
) -> Result<ImageHeaders> {
    commit(host, image, 0, size_of_headers)?;
    image.copy_from(0, &buffer[..size_of_headers])?;

    let mut headers = ImageHeaders::parse(image.bytes(0, size_of_headers)?)?;
    headers.nt.OptionalHeader.ImageBase = image.base() as _;
    image.write(headers.nt_offset, headers.nt)?;
    Ok(headers)
}

/// Writes each section of the source buffer into the image.
///
/// Every section is committed read-write here; final protections are applied
/// by [`finalize_sections`].
pub fn copy_sections<H: Host>(
    host: &H,
    image: &ImageView,
    buffer: &[u8],
    headers: &ImageHeaders,
) -> Result<()> {
    for section in &headers.sections {
        let rva = section.VirtualAddress as usize;

        if section.SizeOfRawData == 0 {
            // No data in the file, but the section may still define
            // uninitialized data.
            let size = headers.section_alignment();
            if size > 0 {
                commit(host, image, rva, size)?;
                image.fill_zero(rva, size)?;
            }
            continue;
        }

        let data = raw_range(buffer, section)?;
        commit(host, image, rva, data.len())?;
        image.copy_from(rva, data)?;
    }
    Ok(())
}

fn commit<H: Host>(host: &H, image: &ImageView, rva: usize, size: usize) -> Result<()> {
    let address = image.address(rva, size)?;
    host.alloc(
        address as *mut c_void,
        size,
        AllocationType::COMMIT,
        PageProtection::READWRITE,
    )
    .map(|_| ())
    .ok_or(Error::Commit { rva, size })
}

// ---------------------------------------------------------------------------
// Base relocations
// ---------------------------------------------------------------------------

/// Adds `delta` to every absolute address listed in the relocation directory.
///
/// An image that has to move but has no relocation directory cannot be
/// loaded.
pub fn perform_base_relocation(
    image: &ImageView,
    headers: &ImageHeaders,
    delta: isize,
) -> Result<()> {
    let directory = headers.data_directory(IMAGE_DIRECTORY_ENTRY_BASERELOC);
    if directory.Size == 0 {
        return if delta == 0 {
            Ok(())
        } else {
            Err(Error::NotRelocatable)
        };
    }

    let header_size = size_of::<IMAGE_BASE_RELOCATION>();
    let mut offset = directory.VirtualAddress as usize;
    let end = offset.saturating_add(directory.Size as usize);
    let mut patched = 0usize;

    while offset.saturating_add(header_size) <= end {
        let block: IMAGE_BASE_RELOCATION = image.read(offset)?;
        if block.VirtualAddress == 0 {
            break;
        }

        let block_size = block.SizeOfBlock as usize;
        if block_size < header_size {
            return Err(Error::OutOfBounds {
                rva: offset,
                size: block_size,
            });
        }

        let page = block.VirtualAddress as usize;
        for i in 0..(block_size - header_size) / 2 {
            let entry: u16 = image.read(offset + header_size + i * 2)?;
            // The upper 4 bits are the type, the lower 12 the offset in the page.
            let target = page + (entry & 0x0FFF) as usize;

            match entry >> 12 {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_HIGHLOW => {
                    let value: u32 = image.read(target)?;
                    image.write(target, value.wrapping_add(delta as u32))?;
                    patched += 1;
                }
                #[cfg(target_pointer_width = "64")]
                IMAGE_REL_BASED_DIR64 => {
                    let value: u64 = image.read(target)?;
                    image.write(target, value.wrapping_add(delta as u64))?;
                    patched += 1;
                }
                _ => {}
            }
        }

        offset += block_size;
    }

    debug!("applied {} relocations (delta {:#x})", patched, delta);
    Ok(())
}

// ---------------------------------------------------------------------------
// Import table resolution
// ---------------------------------------------------------------------------

/// Loads every dependency named in the import directory and fills in the
/// import address table.
///
/// Each successfully bound dependency is appended to `modules`. When a
/// dependency or one of its symbols cannot be resolved, the handle just
/// obtained is released here and the error is returned; handles bound
/// earlier stay in `modules` for the caller's teardown.
pub fn build_import_table<H: Host>(
    host: &H,
    image: &ImageView,
    headers: &ImageHeaders,
    modules: &mut Vec<ModuleHandle>,
) -> Result<()> {
    let directory = headers.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT);
    if directory.Size == 0 {
        return Ok(());
    }

    let mut descriptor_rva = directory.VirtualAddress as usize;
    loop {
        let descriptor: IMAGE_IMPORT_DESCRIPTOR = image.read(descriptor_rva)?;
        if descriptor.Name == 0 {
            break;
        }

        let name = image.cstr(descriptor.Name as usize)?;
        let handle = host
            .load_library(name)
            .ok_or_else(|| Error::LibraryNotFound(name.to_string_lossy().into_owned()))?;
        debug!("loaded dependency {:?} as {:?}", name, handle);

        if let Err(err) = bind_thunks(host, image, &descriptor, handle) {
            host.free_library(handle);
            return Err(err);
        }
        modules.push(handle);

        descriptor_rva += size_of::<IMAGE_IMPORT_DESCRIPTOR>();
    }
    Ok(())
}

fn bind_thunks<H: Host>(
    host: &H,
    image: &ImageView,
    descriptor: &IMAGE_IMPORT_DESCRIPTOR,
    handle: ModuleHandle,
) -> Result<()> {
    // Without a hint table the bound thunks double as the name table.
    let mut thunk_ref = match descriptor.OriginalFirstThunk {
        0 => descriptor.FirstThunk,
        oft => oft,
    } as usize;
    let mut func_ref = descriptor.FirstThunk as usize;

    loop {
        let thunk: usize = image.read(thunk_ref)?;
        if thunk == 0 {
            break;
        }

        let symbol = if thunk & IMAGE_ORDINAL_FLAG != 0 {
            Symbol::Ordinal((thunk & 0xFFFF) as u16)
        } else {
            // IMAGE_IMPORT_BY_NAME: a u16 hint followed by the name
            Symbol::Name(image.cstr(thunk + 2)?)
        };

        let address = host.get_proc_address(handle, symbol).ok_or_else(|| {
            let library = image
                .cstr(descriptor.Name as usize)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            Error::SymbolNotFound {
                library,
                symbol: symbol.to_string(),
            }
        })?;
        image.write(func_ref, address.as_ptr() as usize)?;

        thunk_ref += size_of::<usize>();
        func_ref += size_of::<usize>();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-section memory protections
// ---------------------------------------------------------------------------

// Indexed by [executable][readable][writeable].
const PROTECTION_FLAGS: [[[PageProtection; 2]; 2]; 2] = [
    [
        [PageProtection::NOACCESS, PageProtection::WRITECOPY],
        [PageProtection::READONLY, PageProtection::READWRITE],
    ],
    [
        [PageProtection::EXECUTE, PageProtection::EXECUTE_WRITECOPY],
        [PageProtection::EXECUTE_READ, PageProtection::EXECUTE_READWRITE],
    ],
];

/// Page protection for a section with the given characteristics.
pub fn protection_for(characteristics: SectionFlags) -> PageProtection {
    let executable = characteristics.contains(SectionFlags::MEM_EXECUTE) as usize;
    let readable = characteristics.contains(SectionFlags::MEM_READ) as usize;
    let writeable = characteristics.contains(SectionFlags::MEM_WRITE) as usize;

    let mut protection = PROTECTION_FLAGS[executable][readable][writeable];
    if characteristics.contains(SectionFlags::MEM_NOT_CACHED) {
        protection |= PageProtection::NOCACHE;
    }
    protection
}

/// Size a section occupies in memory: its raw size, or the image-wide
/// initialized/uninitialized data size for sections without raw data.
pub fn real_section_size(headers: &ImageHeaders, section: &IMAGE_SECTION_HEADER) -> usize {
    if section.SizeOfRawData != 0 {
        return section.SizeOfRawData as usize;
    }

    let flags = SectionFlags::from_bits_retain(section.Characteristics);
    let optional = &headers.nt.OptionalHeader;
    if flags.contains(SectionFlags::CNT_INITIALIZED_DATA) {
        optional.SizeOfInitializedData as usize
    } else if flags.contains(SectionFlags::CNT_UNINITIALIZED_DATA) {
        optional.SizeOfUninitializedData as usize
    } else {
        0
    }
}

/// A run of sections sharing memory pages, finalized as one unit.
#[derive(Debug, Clone, Copy)]
struct SectionRun {
    rva: usize,
    aligned_rva: usize,
    size: usize,
    characteristics: SectionFlags,
    last: bool,
}

/// Applies final page protections and decommits discardable sections.
pub fn finalize_sections<H: Host>(
    host: &H,
    image: &ImageView,
    headers: &ImageHeaders,
    page_size: usize,
) -> Result<()> {
    let Some((first, rest)) = headers.sections.split_first() else {
        return Ok(());
    };

    // RVAs and absolute addresses share page alignment because the image base
    // is page aligned.
    let mut run = SectionRun {
        rva: first.VirtualAddress as usize,
        aligned_rva: align_down(first.VirtualAddress as usize, page_size),
        size: real_section_size(headers, first),
        characteristics: SectionFlags::from_bits_retain(first.Characteristics),
        last: false,
    };

    let discardable = SectionFlags::MEM_DISCARDABLE;
    for section in rest {
        let rva = section.VirtualAddress as usize;
        let aligned_rva = align_down(rva, page_size);
        let size = real_section_size(headers, section);
        let characteristics = SectionFlags::from_bits_retain(section.Characteristics);

        if run.aligned_rva == aligned_rva || run.rva + run.size > aligned_rva {
            // Shares a page with the previous run; it stays discardable only
            // if every section in it is.
            if characteristics.contains(discardable) && run.characteristics.contains(discardable) {
                run.characteristics |= characteristics;
            } else {
                run.characteristics = (run.characteristics | characteristics) - discardable;
            }
            run.size = (rva + size).saturating_sub(run.rva);
            continue;
        }

        finalize_section(host, image, headers, page_size, &run)?;
        run = SectionRun {
            rva,
            aligned_rva,
            size,
            characteristics,
            last: false,
        };
    }

    run.last = true;
    finalize_section(host, image, headers, page_size, &run)
}

fn finalize_section<H: Host>(
    host: &H,
    image: &ImageView,
    headers: &ImageHeaders,
    page_size: usize,
    run: &SectionRun,
) -> Result<()> {
    let size = run.size.min(image.size().saturating_sub(run.rva));
    if size == 0 {
        return Ok(());
    }
    let address = (image.base() + run.rva) as *mut c_void;
    let flags = run.characteristics;

    if flags.contains(SectionFlags::MEM_DISCARDABLE) {
        // Only whole pages may be decommitted.
        if run.rva == run.aligned_rva
            && (run.last || headers.section_alignment() == page_size || size % page_size == 0)
        {
            trace!("decommitting rva {:#x} (+{:#x})", run.rva, size);
            unsafe { host.free(address, size, FreeType::DECOMMIT) };
        }
        return Ok(());
    }

    let protection = protection_for(flags);
    trace!("protecting rva {:#x} as {:?}", run.rva, protection);
    if !unsafe { host.protect(address, size, protection) } {
        return Err(Error::Protection { rva: run.rva, size });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TLS (Thread Local Storage) callbacks
// ---------------------------------------------------------------------------

/// Runs the TLS callbacks with `DLL_PROCESS_ATTACH`, in array order. Must run
/// before the entry point. TLS directory fields hold absolute addresses,
/// already relocated.
///
/// The whole callback array is checked against the image before the first
/// callback runs.
pub fn execute_tls(image: &ImageView, headers: &ImageHeaders) -> Result<()> {
    let directory = headers.data_directory(IMAGE_DIRECTORY_ENTRY_TLS);
    if directory.VirtualAddress == 0 {
        return Ok(());
    }

    let tls: IMAGE_TLS_DIRECTORY = image.read(directory.VirtualAddress as usize)?;
    if tls.AddressOfCallBacks == 0 {
        return Ok(());
    }

    let mut callbacks = Vec::new();
    let mut slot = image.rva_of(tls.AddressOfCallBacks as usize)?;
    loop {
        let callback: usize = image.read(slot)?;
        if callback == 0 {
            break;
        }
        image.rva_of(callback)?;
        callbacks.push(callback);
        slot += size_of::<usize>();
    }

    let base = image.base() as *mut c_void;
    for callback in callbacks {
        trace!("running TLS callback at {:#x}", callback);
        unsafe {
            let callback: PIMAGE_TLS_CALLBACK = core::mem::transmute(callback);
            callback(base, DLL_PROCESS_ATTACH, core::ptr::null_mut());
        }
    }
    Ok(())
}
