#![no_std]

//! Loads PE images (DLLs and executables) straight from memory.
//!
//! [`MemoryModule`] does what the OS loader does for a file on disk: it checks
//! the headers, maps the sections, applies base relocations, binds imports,
//! sets page protections, runs TLS callbacks and calls `DllMain`. Exports and
//! resources of the loaded image can then be queried, and the image is torn
//! down again when the module is dropped.
//!
//! Only images matching the architecture of the running process are accepted:
//! PE32 on 32-bit targets, PE32+ on 64-bit ones.
//!
//! Every memory and dependency operation goes through a [`Host`]. On Windows
//! [`MemoryModule::load`] uses [`WindowsHost`]; [`MemoryModule::load_with`]
//! accepts any other implementation.

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod error;
pub mod export;
pub mod host;
pub mod image;
pub mod pelib;
pub mod resource;
pub mod utils;
pub mod windows;


use alloc::string::String;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::ptr::NonNull;

use log::{debug, warn};
use spin::Once;

pub use error::{Error, Result};
pub use host::{AllocationType, FreeType, Host, ModuleHandle, PageProtection, SectionFlags, Symbol};
pub use resource::*;

#[cfg(windows)]
pub use host::WindowsHost;

use export::{ExportDirectory, ExportName};
use image::ImageView;
use pelib::ImageHeaders;
use utils::align_up;
use windows::{
    DllEntryProc, ExeEntryProc, DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH,
    IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DIRECTORY_ENTRY_RESOURCE,
};

/// A PE image mapped from memory.
///
/// Dropping the module (or calling [`unload`](MemoryModule::unload)) sends
/// `DLL_PROCESS_DETACH` to an initialized library, releases its dependencies
/// and frees the image.
pub struct MemoryModule<H: Host> {
    host: H,
    image: Option<ImageView>,
    headers: ImageHeaders,
    modules: Vec<ModuleHandle>,
    initialized: bool,
    is_dll: bool,
    is_relocated: bool,
    exe_entry: Option<ExeEntryProc>,
    page_size: usize,
    name_exports: Once<Vec<ExportName>>,
    blocked: Vec<usize>,
}

#[cfg(windows)]
impl MemoryModule<WindowsHost> {
    /// Loads an image using the process's own memory manager and loader for
    /// dependencies.
    ///
    /// # Safety
    ///
    /// This runs the image's TLS callbacks and `DllMain`, which is arbitrary
    /// code from `data`.
    pub unsafe fn load(data: &[u8]) -> Result<Self> {
        Self::load_with(data, WindowsHost)
    }
}

impl<H: Host> MemoryModule<H> {
    /// Loads an image, routing every memory and dependency operation through
    /// `host`.
    ///
    /// Format errors, and a page size that is not a power of two, are reported
    /// before `host` is asked for memory. A failure in a later stage unloads
    /// whatever was set up so far before returning.
    ///
    /// # Safety
    ///
    /// This runs the image's TLS callbacks and `DllMain`, which is arbitrary
    /// code from `data`.
    pub unsafe fn load_with(data: &[u8], host: H) -> Result<Self> {
        let page_size = host.page_size();
        if !page_size.is_power_of_two() {
            return Err(Error::InvalidPageSize(page_size));
        }
        let original = pelib::validate(data, page_size)?;

        let image_size = align_up(original.size_of_image(), page_size);
        let (code_base, blocked) = pelib::allocate_image(&host, original.image_base(), image_size)?;
        debug!(
            "allocated {:#x} bytes at {:#x} (preferred {:#x}, {} blocked)",
            image_size,
            code_base,
            original.image_base(),
            blocked.len()
        );

        let image = ImageView::new(code_base, image_size);
        let mut module = MemoryModule {
            host,
            image: Some(image),
            headers: original.clone(),
            modules: Vec::new(),
            initialized: false,
            is_dll: original.is_dll(),
            is_relocated: false,
            exe_entry: None,
            page_size,
            name_exports: Once::new(),
            blocked,
        };

        // On error `module` is dropped here, which unloads it.
        if let Err(err) = module.map(data, &image, &original) {
            warn!("loading failed, rolling back: {}", err);
            return Err(err);
        }
        Ok(module)
    }

    fn map(&mut self, data: &[u8], image: &ImageView, original: &ImageHeaders) -> Result<()> {
        self.headers = pelib::copy_headers(&self.host, image, data, original.size_of_headers())?;
        pelib::copy_sections(&self.host, image, data, &self.headers)?;

        let delta = image.base().wrapping_sub(original.image_base()) as isize;
        if delta != 0 {
            pelib::perform_base_relocation(image, &self.headers, delta)?;
        }
        self.is_relocated = true;

        pelib::build_import_table(&self.host, image, &self.headers, &mut self.modules)?;
        debug!("bound {} dependencies", self.modules.len());

        pelib::finalize_sections(&self.host, image, &self.headers, self.page_size)?;
        pelib::execute_tls(image, &self.headers)?;
        self.run_entry_point(image)
    }

    fn run_entry_point(&mut self, image: &ImageView) -> Result<()> {
        let rva = self.headers.entry_point_rva();
        if rva == 0 {
            return Ok(());
        }
        let address = image.address(rva, 1)?;

        if self.is_dll {
            debug!("calling DllMain at {:#x}", address);
            let entry: DllEntryProc = unsafe { core::mem::transmute(address) };
            let base = image.base() as *mut c_void;
            let ok = unsafe { entry(base, DLL_PROCESS_ATTACH, core::ptr::null_mut()) };
            if ok == 0 {
                return Err(Error::EntryPointFailed);
            }
            self.initialized = true;
        } else {
            let entry: ExeEntryProc = unsafe { core::mem::transmute(address) };
            self.exe_entry = Some(entry);
        }
        Ok(())
    }

    fn exports(&self) -> Option<ExportDirectory> {
        let image = self.image.as_ref()?;
        let directory = self.headers.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT);
        ExportDirectory::locate(image, directory)
    }

    /// Address of the function exported under `name`.
    pub fn get_proc_address(&self, name: &str) -> Option<NonNull<c_void>> {
        let exports = self.exports()?;
        let index = self.name_exports.call_once(|| exports.name_index());
        exports.by_name(index, name.as_bytes())
    }

    /// Address of the function exported under `ordinal`.
    pub fn get_proc_address_by_ordinal(&self, ordinal: u16) -> Option<NonNull<c_void>> {
        self.exports()?.by_ordinal(ordinal)
    }

    /// Runs the entry point of an executable image and returns its exit code.
    ///
    /// Fails with [`Error::NotExecutable`], [`Error::NoEntryPoint`] or
    /// [`Error::NotRelocated`] when there is nothing that can be run.
    ///
    /// # Safety
    ///
    /// Runs arbitrary code from the image.
    pub unsafe fn call_entry_point(&self) -> Result<i32> {
        if self.is_dll {
            return Err(Error::NotExecutable);
        }
        let entry = self.exe_entry.ok_or(Error::NoEntryPoint)?;
        if !self.is_relocated {
            return Err(Error::NotRelocated);
        }
        Ok(entry())
    }

    fn resources(&self) -> Option<ResourceDirectory> {
        let image = self.image.as_ref()?;
        let directory = self.headers.data_directory(IMAGE_DIRECTORY_ENTRY_RESOURCE);
        ResourceDirectory::locate(image, directory)
    }

    fn language(&self, language: u16) -> u16 {
        if language == DEFAULT_LANGUAGE {
            self.host.default_language()
        } else {
            language
        }
    }

    /// Finds a resource in the host's default language.
    pub fn find_resource<'a>(
        &self,
        name: impl Into<ResourceId<'a>>,
        kind: impl Into<ResourceId<'a>>,
    ) -> Option<Resource> {
        self.find_resource_ex(name, kind, DEFAULT_LANGUAGE)
    }

    /// Finds a resource by name, type and language. A missing language falls
    /// back to another translation of the same resource.
    pub fn find_resource_ex<'a>(
        &self,
        name: impl Into<ResourceId<'a>>,
        kind: impl Into<ResourceId<'a>>,
        language: u16,
    ) -> Option<Resource> {
        let resources = self.resources()?;
        resources.find(name.into(), kind.into(), self.language(language))
    }

    pub fn sizeof_resource(&self, resource: &Resource) -> usize {
        resource.size()
    }

    /// The bytes of a resource found on this module.
    pub fn load_resource(&self, resource: &Resource) -> Option<&[u8]> {
        let image = self.image.as_ref()?;
        image.bytes(resource.rva(), resource.size()).ok()
    }

    /// String `id` from the string table, in the host's default language.
    pub fn load_string(&self, id: u16) -> Option<String> {
        self.load_string_ex(id, DEFAULT_LANGUAGE)
    }

    pub fn load_string_ex(&self, id: u16, language: u16) -> Option<String> {
        self.resources()?.load_string(id, self.language(language))
    }

    /// Address the image was mapped at, `None` once unloaded.
    pub fn code_base(&self) -> Option<NonNull<c_void>> {
        self.image
            .as_ref()
            .and_then(|image| NonNull::new(image.base() as *mut c_void))
    }

    pub fn image_size(&self) -> usize {
        self.image.as_ref().map_or(0, ImageView::size)
    }

    pub fn is_dll(&self) -> bool {
        self.is_dll
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_relocated(&self) -> bool {
        self.is_relocated
    }

    /// Dependencies bound while resolving imports, in load order.
    pub fn dependencies(&self) -> &[ModuleHandle] {
        &self.modules
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Tears the module down. Calling it again does nothing.
    ///
    /// An initialized library is sent `DLL_PROCESS_DETACH` first, then every
    /// dependency is released, then the image, then any regions set aside
    /// while allocating. A failing step does not stop the later ones.
    pub fn unload(&mut self) {
        if self.initialized {
            if let Some(image) = &self.image {
                let rva = self.headers.entry_point_rva();
                if let Ok(address) = image.address(rva, 1) {
                    debug!("calling DllMain(DLL_PROCESS_DETACH) at {:#x}", address);
                    let base = image.base() as *mut c_void;
                    unsafe {
                        let entry: DllEntryProc = core::mem::transmute(address);
                        entry(base, DLL_PROCESS_DETACH, core::ptr::null_mut());
                    }
                }
            }
            self.initialized = false;
        }

        for module in self.modules.drain(..) {
            self.host.free_library(module);
        }
        self.modules = Vec::new();

        if let Some(image) = self.image.take() {
            let base = image.base();
            debug!("releasing image at {:#x}", base);
            if !unsafe { self.host.free(base as *mut c_void, 0, FreeType::RELEASE) } {
                warn!("could not release image at {:#x}", base);
            }
        }

        pelib::release_blocked(&self.host, &mut self.blocked);

        self.exe_entry = None;
        self.is_relocated = false;
        self.name_exports = Once::new();
    }
}

impl<H: Host> Drop for MemoryModule<H> {
    fn drop(&mut self) {
        self.unload();
    }
}

impl<H: Host> core::fmt::Debug for MemoryModule<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryModule")
            .field("code_base", &self.image.as_ref().map(ImageView::base))
            .field("image_size", &self.image_size())
            .field("dependencies", &self.modules)
            .field("is_dll", &self.is_dll)
            .field("initialized", &self.initialized)
            .field("is_relocated", &self.is_relocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pelib::crosses_4gb_boundary;
    use crate::test::*;
    use crate::windows::*;
    use alloc::vec;
    use core::mem::size_of;

    const TEXT: u32 = IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;
    const RDATA: u32 = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;
    const DATA: u32 = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
    const RELOC: u32 =
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_DISCARDABLE;

    #[cfg(target_pointer_width = "64")]
    const NATIVE_RELOCATION: u16 = IMAGE_REL_BASED_DIR64;
    #[cfg(target_pointer_width = "32")]
    const NATIVE_RELOCATION: u16 = IMAGE_REL_BASED_HIGHLOW;

    const ARENA: usize = 0x10000;

    const HOST_MACHINE_IS_X86: bool = crate::utils::HOST_MACHINE == IMAGE_FILE_MACHINE_I386;

    /// A host whose arena sits at the image's preferred base.
    fn in_place() -> (RecordingHost, ImageBuilder) {
        let (host, base) = RecordingHost::with_arena(ARENA);
        let mut builder = ImageBuilder::new();
        builder.image_base = base;
        (host, builder)
    }

    fn load(data: &[u8], host: &RecordingHost) -> Result<MemoryModule<RecordingHost>> {
        unsafe { MemoryModule::load_with(data, host.clone()) }
    }

    fn base_of(module: &MemoryModule<RecordingHost>) -> usize {
        module.code_base().unwrap().as_ptr() as usize
    }

    /// Appends a section holding data directory `index`; `blob` gets the RVA
    /// it will be placed at.
    fn add_directory(
        builder: &mut ImageBuilder,
        index: usize,
        blob: impl FnOnce(u32) -> Vec<u8>,
    ) -> u32 {
        let (name, characteristics) = match index {
            IMAGE_DIRECTORY_ENTRY_EXPORT => (".edata", RDATA),
            IMAGE_DIRECTORY_ENTRY_IMPORT => (".idata", DATA),
            IMAGE_DIRECTORY_ENTRY_RESOURCE => (".rsrc", RDATA),
            IMAGE_DIRECTORY_ENTRY_BASERELOC => (".reloc", RELOC),
            _ => (".tls", DATA),
        };
        let rva = builder.next_rva();
        let bytes = blob(rva);
        builder.directory(index, rva, bytes.len());
        builder.section(name.as_bytes(), characteristics, bytes);
        rva
    }

    /// An image with one pointer-sized, one 32-bit and one untouched slot in
    /// `.data`, plus relocations for the first two.
    fn relocatable(builder: &mut ImageBuilder) -> u32 {
        let data_rva = builder.next_rva();
        let mut data = vec![0u8; 0x20];
        put(&mut data, 0, builder.image_base + data_rva as usize + 0x18);
        put(&mut data, 0x10, 0x1111_1111u32);
        put(&mut data, 0x18, 0xAAAA_AAAAu32);
        builder.section(b".data", DATA, data);

        let entries = [
            (NATIVE_RELOCATION << 12),
            (IMAGE_REL_BASED_HIGHLOW << 12) | 0x10,
            (IMAGE_REL_BASED_ABSOLUTE << 12),
            (7 << 12) | 0x18,
        ];
        add_directory(builder, IMAGE_DIRECTORY_ENTRY_BASERELOC, |_| {
            relocation_block(data_rva, &entries)
        });
        data_rva
    }

    #[test]
    fn exports_resolve_by_name_and_ordinal() {
        let (host, mut builder) = in_place();
        let text = builder.section(b".text", TEXT, vec![0xC3; 0x40]);
        add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_EXPORT, |rva| {
            let functions = [text, text + 0x10, text + 0x20];
            let names = [("Run", 1), ("Init", 0), ("Stop", 2)];
            export_blob(rva, 1, &functions, &names)
        });

        let module = load(&builder.build(), &host).unwrap();
        let base = base_of(&module);
        assert_eq!(base, builder.image_base);
        assert!(module.is_dll());
        assert!(module.is_relocated());
        assert!(!module.is_initialized());

        let init = module.get_proc_address("Init").unwrap();
        assert_eq!(init.as_ptr() as usize, base + text as usize);
        assert_eq!(module.get_proc_address_by_ordinal(1), Some(init));
        assert_eq!(
            module.get_proc_address("Stop").unwrap().as_ptr() as usize,
            base + text as usize + 0x20
        );
        let stop = module.get_proc_address("Stop");
        assert_eq!(module.get_proc_address_by_ordinal(3), stop);
        assert_eq!(module.get_proc_address("Missing"), None);
        assert_eq!(module.get_proc_address_by_ordinal(0), None);
        assert_eq!(module.get_proc_address_by_ordinal(4), None);
    }

    #[test]
    fn exports_are_shared_across_threads() {
        let (host, mut builder) = in_place();
        let text = builder.section(b".text", TEXT, vec![0xC3; 0x400]);
        let names: Vec<String> = (0..200)
            .map(|i| alloc::format!("export_{}", 199 - i))
            .collect();
        let functions: Vec<u32> = (0..200).map(|i| text + i * 4).collect();
        let pairs: Vec<(&str, u16)> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i as u16))
            .collect();
        add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_EXPORT, |rva| {
            export_blob(rva, 1, &functions, &pairs)
        });

        let module = load(&builder.build(), &host).unwrap();
        let base = base_of(&module);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for (i, name) in names.iter().enumerate() {
                        let address = module.get_proc_address(name).unwrap();
                        assert_eq!(address.as_ptr() as usize, base + text as usize + i * 4);
                    }
                });
            }
        });
    }

    #[test]
    fn relocates_when_preferred_base_is_taken() {
        let host = RecordingHost::new();
        let mut builder = ImageBuilder::new();
        let data = relocatable(&mut builder) as usize;

        let module = load(&builder.build(), &host).unwrap();
        let base = base_of(&module);
        assert_ne!(base, PREFERRED_BASE);
        let delta = base.wrapping_sub(PREFERRED_BASE);

        let image = module.image.unwrap();
        assert_eq!(
            image.read::<usize>(data).unwrap(),
            (PREFERRED_BASE + data + 0x18).wrapping_add(delta)
        );
        assert_eq!(image.read::<usize>(data).unwrap(), base + data + 0x18);
        assert_eq!(
            image.read::<u32>(data + 0x10).unwrap(),
            0x1111_1111u32.wrapping_add(delta as u32)
        );
        assert_eq!(image.read::<u32>(data + 0x18).unwrap(), 0xAAAA_AAAA);

        // The mapped headers describe where the image actually lives.
        assert_eq!(module.headers.image_base(), base);
        let nt: IMAGE_NT_HEADERS = image.read(module.headers.nt_offset).unwrap();
        assert_eq!(nt.OptionalHeader.ImageBase as usize, base);
    }

    #[test]
    fn image_without_relocations_must_load_in_place() {
        let host = RecordingHost::new();
        let mut builder = ImageBuilder::new();
        builder.section(b".text", TEXT, vec![0xC3; 0x10]);

        let err = load(&builder.build(), &host).unwrap_err();
        assert_eq!(err, Error::NotRelocatable);
        assert_eq!(host.live_regions(), 0);
        let log = host.log();
        assert_eq!(log.releases.len(), 1);
        assert_eq!(log.bad_frees, 0);

        let (host, mut builder) = in_place();
        builder.section(b".text", TEXT, vec![0xC3; 0x10]);
        assert!(load(&builder.build(), &host).is_ok());
    }

    #[test]
    fn imports_bind_names_and_ordinals() {
        for hint_table in [true, false] {
            let (host, mut builder) = in_place();
            host.library(
                "KERNEL32.dll",
                &[("Sleep", 0x5000_1000), ("#7", 0x5000_2000)],
            );
            host.library("user32.dll", &[("MessageBoxA", 0x6000_1000)]);

            let kernel32: &[Import] = &[Import::Name("Sleep"), Import::Ordinal(7)];
            let user32: &[Import] = &[Import::Name("MessageBoxA")];
            let mut tables = Vec::new();
            add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_IMPORT, |rva| {
                let libraries = [("kernel32.dll", kernel32), ("USER32.dll", user32)];
                let blob = import_blob(rva, &libraries, hint_table);
                tables = blob.first_thunks;
                blob.bytes
            });

            let module = load(&builder.build(), &host).unwrap();
            let image = module.image.unwrap();
            let thunk = |table: u32, slot: usize| {
                let offset = table as usize + slot * size_of::<usize>();
                image.read::<usize>(offset).unwrap()
            };
            assert_eq!(thunk(tables[0], 0), 0x5000_1000);
            assert_eq!(thunk(tables[0], 1), 0x5000_2000);
            assert_eq!(thunk(tables[0], 2), 0);
            assert_eq!(thunk(tables[1], 0), 0x6000_1000);
            assert_eq!(module.dependencies().len(), 2);

            drop(module);
            let log = host.log();
            assert_eq!(log.loaded, ["kernel32.dll", "USER32.dll"]);
            assert_eq!(log.freed, ["KERNEL32.dll", "user32.dll"]);
        }
    }

    #[test]
    fn missing_library_releases_earlier_dependencies() {
        let (host, mut builder) = in_place();
        host.library("kernel32.dll", &[("Sleep", 0x1000)]);

        let kernel32: &[Import] = &[Import::Name("Sleep")];
        let missing: &[Import] = &[Import::Name("Foo")];
        add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_IMPORT, |rva| {
            let libraries = [("kernel32.dll", kernel32), ("missing.dll", missing)];
            import_blob(rva, &libraries, true).bytes
        });

        let err = load(&builder.build(), &host).unwrap_err();
        assert_eq!(err, Error::LibraryNotFound("missing.dll".into()));

        let log = host.log();
        assert_eq!(log.loaded, ["kernel32.dll"]);
        assert_eq!(log.freed, ["kernel32.dll"]);
        assert_eq!(log.releases.len(), 1);
        assert_eq!(host.live_regions(), 0);
    }

    #[test]
    fn missing_symbol_releases_its_library_once() {
        let (host, mut builder) = in_place();
        host.library("kernel32.dll", &[("Sleep", 0x1000)]);
        host.library("user32.dll", &[]);

        let kernel32: &[Import] = &[Import::Name("Sleep")];
        let user32: &[Import] = &[Import::Ordinal(9)];
        add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_IMPORT, |rva| {
            let libraries = [("kernel32.dll", kernel32), ("user32.dll", user32)];
            import_blob(rva, &libraries, true).bytes
        });

        let err = load(&builder.build(), &host).unwrap_err();
        assert_eq!(
            err,
            Error::SymbolNotFound {
                library: "user32.dll".into(),
                symbol: "#9".into()
            }
        );

        // The failing library goes first, the bound one during teardown.
        let log = host.log();
        assert_eq!(log.freed, ["user32.dll", "kernel32.dll"]);
        assert_eq!(host.live_regions(), 0);
    }

    #[test]
    fn sections_get_final_protections() {
        let (host, mut builder) = in_place();
        let text = builder.section(b".text", TEXT, vec![0xC3; 0x10]) as usize;
        let rdata = builder.section(b".rdata", RDATA, vec![1; 0x10]) as usize;
        let uncached = DATA | IMAGE_SCN_MEM_NOT_CACHED;
        let data = builder.section(b".data", uncached, vec![2; 0x10]) as usize;
        let bss = builder.bss(
            b".bss",
            IMAGE_SCN_CNT_UNINITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        ) as usize;
        builder.size_of_uninitialized_data = 0x800;
        let discard = builder.section(b".discard", RELOC, vec![3; 0x10]) as usize;

        let module = load(&builder.build(), &host).unwrap();
        let base = base_of(&module);
        let log = host.log();

        let uncached = PageProtection::READWRITE | PageProtection::NOCACHE;
        assert_eq!(
            log.protects,
            vec![
                (base + text, 0x10, PageProtection::EXECUTE_READ),
                (base + rdata, 0x10, PageProtection::READONLY),
                (base + data, 0x10, uncached),
                (base + bss, 0x800, PageProtection::READWRITE),
            ]
        );
        assert_eq!(log.decommits, vec![(base + discard, 0x10)]);
        assert!(log.commits.contains(&(base + bss, PAGE_SIZE)));

        let image = module.image.unwrap();
        assert_eq!(image.bytes(data, 0x10).unwrap(), &[2; 0x10]);
        let zeroed = image.bytes(bss, PAGE_SIZE).unwrap();
        assert!(zeroed.iter().all(|&b| b == 0));
    }

    #[test]
    fn protection_failure_rolls_back() {
        let (host, mut builder) = in_place();
        let text = builder.section(b".text", TEXT, vec![0xC3; 0x10]) as usize;
        host.fail_protect();

        let err = load(&builder.build(), &host).unwrap_err();
        assert_eq!(
            err,
            Error::Protection {
                rva: text,
                size: 0x10
            }
        );
        assert_eq!(host.live_regions(), 0);
        assert_eq!(host.log().releases, [builder.image_base]);
    }

    #[test]
    fn resources_and_strings() {
        let (host, mut builder) = in_place();
        host.set_language(1031);
        let block = string_block(&[(1, "hello")]);
        add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_RESOURCE, |rva| {
            resource_blob(
                rva,
                &[
                    (Key::Id(RT_RCDATA), Key::Name("CONFIG"), 1033, b"english".as_slice()),
                    (Key::Id(RT_RCDATA), Key::Name("CONFIG"), 1031, b"deutsch".as_slice()),
                    (Key::Id(RT_STRING), Key::Id(1), 1033, block.as_slice()),
                ],
            )
        });

        let module = load(&builder.build(), &host).unwrap();

        let resource = module.find_resource("config", RT_RCDATA).unwrap();
        assert_eq!(module.load_resource(&resource), Some(b"deutsch".as_slice()));
        assert_eq!(module.sizeof_resource(&resource), 7);

        let english = module.find_resource_ex("CONFIG", "#10", 1033).unwrap();
        assert_eq!(module.load_resource(&english), Some(b"english".as_slice()));

        let fallback = module.find_resource_ex("CONFIG", RT_RCDATA, 2057).unwrap();
        assert_eq!(fallback, resource);

        assert_eq!(module.load_string(1).as_deref(), Some("hello"));
        assert_eq!(module.load_string_ex(1, 1033).as_deref(), Some("hello"));
        assert_eq!(module.load_string(2), None);
        assert_eq!(module.find_resource("OTHER", RT_RCDATA), None);
        assert_eq!(module.find_resource(1u16, RT_ICON), None);
    }

    #[test]
    fn unload_is_idempotent() {
        let (host, mut builder) = in_place();
        host.library("kernel32.dll", &[("Sleep", 0x1000)]);
        let kernel32: &[Import] = &[Import::Name("Sleep")];
        add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_IMPORT, |rva| {
            import_blob(rva, &[("kernel32.dll", kernel32)], true).bytes
        });

        let mut module = load(&builder.build(), &host).unwrap();
        module.unload();
        assert!(module.code_base().is_none());
        assert_eq!(module.image_size(), 0);
        assert!(module.dependencies().is_empty());
        assert_eq!(module.get_proc_address("Sleep"), None);
        assert!(module.find_resource(1u16, RT_RCDATA).is_none());

        module.unload();
        drop(module);

        let log = host.log();
        assert_eq!(log.releases, [builder.image_base]);
        assert_eq!(log.freed, ["kernel32.dll"]);
        assert_eq!(log.bad_frees, 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn regions_across_4gb_boundaries_are_kept_until_unload() {
        let host = RecordingHost::new();
        host.straddle(3);
        let mut builder = ImageBuilder::new();
        relocatable(&mut builder);

        let module = load(&builder.build(), &host).unwrap();
        let base = base_of(&module);
        assert!(!crosses_4gb_boundary(base, module.image_size()));

        let log = host.log();
        assert!(log.reserves.len() >= 5);
        assert!(log.releases.is_empty());
        assert!(module.blocked.len() >= 3);

        drop(module);
        let log = host.log();
        for fake in [0xFFFF_F000usize, 0x1_FFFF_F000, 0x2_FFFF_F000] {
            assert!(log.releases.contains(&fake), "{:#x} not released", fake);
        }
        // Every successful reservation (all but the preferred-base attempt) is
        // released exactly once.
        assert_eq!(log.releases.len(), log.reserves.len() - 1);
        assert_eq!(log.bad_frees, 0);
        assert_eq!(host.live_regions(), 0);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let host = RecordingHost::new();
        host.fail_reserve();
        let mut builder = ImageBuilder::new();
        builder.section(b".text", TEXT, vec![0xC3; 0x10]);

        assert_eq!(
            load(&builder.build(), &host).unwrap_err(),
            Error::Allocation { size: 0x2000 }
        );
        assert_eq!(host.log().reserves.len(), 2);
        assert_eq!(host.live_regions(), 0);
    }

    #[test]
    fn malformed_images_never_reach_the_host() {
        let host = RecordingHost::new();
        let mut builder = ImageBuilder::new();
        relocatable(&mut builder);
        let good = builder.build();

        let mut bad_dos = good.clone();
        bad_dos[1] = 0;
        let mut bad_nt = good.clone();
        bad_nt[0x40] = b'N';
        let mut wrong_machine = ImageBuilder::new();
        wrong_machine.machine = if HOST_MACHINE_IS_X86 {
            IMAGE_FILE_MACHINE_AMD64
        } else {
            IMAGE_FILE_MACHINE_I386
        };
        relocatable(&mut wrong_machine);

        assert!(matches!(load(&good[..10], &host), Err(Error::TooSmall { .. })));
        assert!(matches!(load(&good[..0x100], &host), Err(Error::TooSmall { .. })));
        let err = load(&bad_dos, &host).unwrap_err();
        assert_eq!(err, Error::InvalidDosSignature);
        let err = load(&bad_nt, &host).unwrap_err();
        assert_eq!(err, Error::InvalidNtSignature);
        assert!(matches!(
            load(&wrong_machine.build(), &host),
            Err(Error::MachineMismatch { .. })
        ));
        assert!(matches!(
            load(&good[..good.len() - 4], &host),
            Err(Error::TruncatedSection { .. })
        ));

        let log = host.log();
        assert!(log.reserves.is_empty());
        assert!(log.commits.is_empty());
        assert!(log.loaded.is_empty());

        assert!(load(&good, &host).is_ok());
    }

    #[test]
    fn entry_point_misuse_is_an_error() {
        let (host, mut builder) = in_place();
        builder.section(b".text", TEXT, vec![0xC3; 0x10]);
        let module = load(&builder.build(), &host).unwrap();
        let result = unsafe { module.call_entry_point() };
        assert_eq!(result, Err(Error::NotExecutable));

        let (host, mut builder) = in_place();
        builder.characteristics = IMAGE_FILE_EXECUTABLE_IMAGE;
        builder.section(b".text", TEXT, vec![0xC3; 0x10]);
        let module = load(&builder.build(), &host).unwrap();
        assert!(!module.is_dll());
        let result = unsafe { module.call_entry_point() };
        assert_eq!(result, Err(Error::NoEntryPoint));
    }

    #[test]
    fn entry_point_outside_the_image_fails_before_running() {
        let (host, mut builder) = in_place();
        builder.section(b".text", TEXT, vec![0xC3; 0x10]);
        builder.entry_point = 0x10_0000;

        assert!(matches!(
            load(&builder.build(), &host),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(host.live_regions(), 0);
    }

    #[test]
    fn tls_callbacks_are_checked_against_the_image() {
        let tls = |callback: usize| {
            let (host, mut builder) = in_place();
            let image_base = builder.image_base;
            add_directory(&mut builder, IMAGE_DIRECTORY_ENTRY_TLS, |rva| {
                let header = size_of::<IMAGE_TLS_DIRECTORY>();
                let callbacks = rva as usize + header;
                let mut blob = vec![0u8; header + 2 * size_of::<usize>()];
                put(
                    &mut blob,
                    0,
                    IMAGE_TLS_DIRECTORY {
                        AddressOfCallBacks: (image_base + callbacks) as _,
                        ..Default::default()
                    },
                );
                put(&mut blob, header, callback);
                blob
            });
            let result = load(&builder.build(), &host).map(|_| ());
            (result, host)
        };

        let (result, _) = tls(0);
        assert!(result.is_ok());

        let (result, host) = tls(0x10);
        assert!(matches!(result, Err(Error::OutOfBounds { .. })));
        assert_eq!(host.live_regions(), 0);
    }

    #[test]
    fn debug_output_names_the_module() {
        let (host, mut builder) = in_place();
        builder.section(b".text", TEXT, vec![0xC3; 0x10]);
        let module = load(&builder.build(), &host).unwrap();
        let text = alloc::format!("{:?}", module);
        assert!(text.starts_with("MemoryModule"));
        assert!(text.contains("is_dll: true"));
    }

    #[test]
    fn page_size_must_be_a_power_of_two() {
        let mut builder = ImageBuilder::new();
        relocatable(&mut builder);
        let image = builder.build();

        for page_size in [0, 0x1800] {
            let host = RecordingHost::new();
            host.set_page_size(page_size);
            assert_eq!(
                load(&image, &host).unwrap_err(),
                Error::InvalidPageSize(page_size)
            );
            assert!(host.log().reserves.is_empty());
        }
    }

    /// Images whose code jumps straight into the recorders below, so calls
    /// into the image can be observed in order.
    #[cfg(target_arch = "x86_64")]
    mod image_code {
        use super::*;
        use crate::test::{put, trampoline, ImageBuilder, RecordingHost};
        use crate::windows::{
            DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, IMAGE_DIRECTORY_ENTRY_TLS,
            IMAGE_FILE_EXECUTABLE_IMAGE, IMAGE_TLS_DIRECTORY,
        };
        use alloc::vec;
        use core::cell::RefCell;
        use core::ffi::c_void;
        use core::mem::size_of;

        std::thread_local! {
            static CALLS: RefCell<Vec<(&'static str, u32)>> = RefCell::new(Vec::new());
        }

        fn record(name: &'static str, reason: u32) {
            CALLS.with(|calls| calls.borrow_mut().push((name, reason)));
        }

        fn calls() -> Vec<(&'static str, u32)> {
            CALLS.with(|calls| calls.borrow().clone())
        }

        extern "system" fn first_callback(_: *mut c_void, reason: u32, _: *mut c_void) {
            record("tls 1", reason);
        }

        extern "system" fn second_callback(_: *mut c_void, reason: u32, _: *mut c_void) {
            record("tls 2", reason);
        }

        extern "system" fn dll_main(_: *mut c_void, reason: u32, _: *mut c_void) -> i32 {
            record("DllMain", reason);
            1
        }

        extern "system" fn failing_dll_main(_: *mut c_void, reason: u32, _: *mut c_void) -> i32 {
            record("DllMain", reason);
            0
        }

        extern "system" fn exe_main() -> i32 {
            record("main", 0);
            42
        }

        /// An image in an executable arena whose `.text` holds one trampoline
        /// per target, 16 bytes apart. Returns the trampolines' addresses.
        fn with_code(targets: &[usize]) -> (RecordingHost, ImageBuilder, Vec<usize>) {
            CALLS.with(|calls| calls.borrow_mut().clear());

            let (host, base) = RecordingHost::with_executable_arena(ARENA);
            let mut builder = ImageBuilder::new();
            builder.image_base = base;

            let mut code = vec![0xCC; targets.len() * 0x10];
            for (i, target) in targets.iter().enumerate() {
                let stub = trampoline(*target);
                code[i * 0x10..i * 0x10 + stub.len()].copy_from_slice(&stub);
            }
            let text = builder.section(b".text", TEXT, code) as usize;
            let first = base + text;
            let stubs = (0..targets.len()).map(|i| first + i * 0x10).collect();
            (host, builder, stubs)
        }

        fn entry_point(builder: &mut ImageBuilder, address: usize) {
            builder.entry_point = (address - builder.image_base) as u32;
        }

        fn tls_directory(builder: &mut ImageBuilder, callbacks: &[usize]) {
            let image_base = builder.image_base;
            add_directory(builder, IMAGE_DIRECTORY_ENTRY_TLS, |rva| {
                let header = size_of::<IMAGE_TLS_DIRECTORY>();
                let mut blob = vec![0u8; header + (callbacks.len() + 1) * size_of::<usize>()];
                put(
                    &mut blob,
                    0,
                    IMAGE_TLS_DIRECTORY {
                        AddressOfCallBacks: (image_base + rva as usize + header) as _,
                        ..Default::default()
                    },
                );
                for (i, callback) in callbacks.iter().enumerate() {
                    put(&mut blob, header + i * size_of::<usize>(), *callback);
                }
                blob
            });
        }

        #[test]
        fn tls_callbacks_run_in_order_before_dll_main() {
            let (host, mut builder, stubs) = with_code(&[
                first_callback as usize,
                second_callback as usize,
                dll_main as usize,
            ]);
            tls_directory(&mut builder, &[stubs[0], stubs[1]]);
            entry_point(&mut builder, stubs[2]);

            let mut module = load(&builder.build(), &host).unwrap();
            assert!(module.is_initialized());
            assert_eq!(
                calls(),
                [
                    ("tls 1", DLL_PROCESS_ATTACH),
                    ("tls 2", DLL_PROCESS_ATTACH),
                    ("DllMain", DLL_PROCESS_ATTACH),
                ]
            );

            module.unload();
            assert!(!module.is_initialized());
            module.unload();
            drop(module);

            assert_eq!(&calls()[3..], &[("DllMain", DLL_PROCESS_DETACH)]);
            assert_eq!(host.log().releases, [builder.image_base]);
        }

        #[test]
        fn failing_dll_main_tears_the_image_down() {
            let (host, mut builder, stubs) = with_code(&[failing_dll_main as usize]);
            entry_point(&mut builder, stubs[0]);

            assert_eq!(
                load(&builder.build(), &host).unwrap_err(),
                Error::EntryPointFailed
            );
            // Never initialized, so never detached.
            assert_eq!(calls(), [("DllMain", DLL_PROCESS_ATTACH)]);
            assert_eq!(host.log().releases, [builder.image_base]);
            assert_eq!(host.live_regions(), 0);
        }

        #[test]
        fn callbacks_outside_the_image_stop_the_load_before_any_runs() {
            let (host, mut builder, stubs) =
                with_code(&[first_callback as usize, dll_main as usize]);
            tls_directory(&mut builder, &[stubs[0], 0x10]);
            entry_point(&mut builder, stubs[1]);

            assert!(matches!(
                load(&builder.build(), &host),
                Err(Error::OutOfBounds { .. })
            ));
            assert!(calls().is_empty());
            assert_eq!(host.live_regions(), 0);
        }

        #[test]
        fn executable_entry_point_runs_on_request() {
            let (host, mut builder, stubs) = with_code(&[exe_main as usize]);
            builder.characteristics = IMAGE_FILE_EXECUTABLE_IMAGE;
            entry_point(&mut builder, stubs[0]);

            let module = load(&builder.build(), &host).unwrap();
            assert!(calls().is_empty());
            assert_eq!(unsafe { module.call_entry_point() }, Ok(42));
            assert_eq!(calls(), [("main", 0)]);
        }
    }
}
