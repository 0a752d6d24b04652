//! Resource directory lookups.
//!
//! Resources form a three-level tree (type, name, language). Every level lists
//! its string-named entries first, sorted by name, then its numeric entries in
//! ascending order, so each level is searched with a binary search.

use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::mem::size_of;

use crate::image::ImageView;
use crate::utils::wide_prefix_cmp;
use crate::windows::{
    IMAGE_DATA_DIRECTORY, IMAGE_RESOURCE_DATA_ENTRY, IMAGE_RESOURCE_DIRECTORY,
    IMAGE_RESOURCE_DIRECTORY_ENTRY,
};

/// Language value that selects the host's default language.
pub const DEFAULT_LANGUAGE: u16 = 0;

// Predefined resource types.
pub const RT_CURSOR: u16 = 1;
pub const RT_BITMAP: u16 = 2;
pub const RT_ICON: u16 = 3;
pub const RT_MENU: u16 = 4;
pub const RT_DIALOG: u16 = 5;
pub const RT_STRING: u16 = 6;
pub const RT_FONTDIR: u16 = 7;
pub const RT_FONT: u16 = 8;
pub const RT_ACCELERATOR: u16 = 9;
pub const RT_RCDATA: u16 = 10;
pub const RT_MESSAGETABLE: u16 = 11;
pub const RT_GROUP_CURSOR: u16 = 12;
pub const RT_GROUP_ICON: u16 = 14;
pub const RT_VERSION: u16 = 16;
pub const RT_DLGINCLUDE: u16 = 17;
pub const RT_PLUGPLAY: u16 = 19;
pub const RT_VXD: u16 = 20;
pub const RT_ANICURSOR: u16 = 21;
pub const RT_ANIICON: u16 = 22;
pub const RT_HTML: u16 = 23;
pub const RT_MANIFEST: u16 = 24;

const OFFSET_MASK: u32 = 0x7FFF_FFFF;

/// Key of one level of the resource tree.
///
/// A name of the form `#123` is looked up as the numeric id 123.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceId<'a> {
    Id(u16),
    Name(&'a str),
}

impl From<u16> for ResourceId<'_> {
    fn from(id: u16) -> Self {
        ResourceId::Id(id)
    }
}

impl<'a> From<&'a str> for ResourceId<'a> {
    fn from(name: &'a str) -> Self {
        ResourceId::Name(name)
    }
}

impl ResourceId<'_> {
    fn normalize(self) -> Self {
        match self {
            ResourceId::Name(name) => match name.strip_prefix('#') {
                Some(digits) if is_decimal(digits) => {
                    digits.parse().map(ResourceId::Id).unwrap_or(self)
                }
                _ => self,
            },
            id => id,
        }
    }
}

fn is_decimal(digits: &str) -> bool {
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// A located resource: the data entry at the leaf of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    rva: u32,
    size: u32,
    code_page: u32,
}

impl Resource {
    /// RVA of the resource data.
    pub fn rva(&self) -> usize {
        self.rva as usize
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn code_page(&self) -> u32 {
        self.code_page
    }
}

/// The resource directory of a mapped image.
#[derive(Debug, Clone, Copy)]
pub struct ResourceDirectory {
    image: ImageView,
    root: usize,
}

impl ResourceDirectory {
    /// Returns `None` when the image has no resources.
    pub fn locate(image: &ImageView, directory: IMAGE_DATA_DIRECTORY) -> Option<Self> {
        if directory.Size == 0 {
            return None;
        }
        Some(Self {
            image: *image,
            root: directory.VirtualAddress as usize,
        })
    }

    /// Walks type, name and language. When the language is missing but the
    /// name has other translations, the first numbered one is returned.
    pub fn find(
        &self,
        name: ResourceId<'_>,
        kind: ResourceId<'_>,
        language: u16,
    ) -> Option<Resource> {
        let by_type = self.search_entry(self.root, kind)?;
        let names = self.subdirectory(&by_type);

        let by_name = self.search_entry(names, name)?;
        let languages = self.subdirectory(&by_name);

        let leaf = match self.search_entry(languages, ResourceId::Id(language)) {
            Some(entry) => entry,
            None => {
                let directory: IMAGE_RESOURCE_DIRECTORY = self.image.read(languages).ok()?;
                if directory.NumberOfIdEntries == 0 {
                    return None;
                }
                self.entry(languages, directory.NumberOfNamedEntries as usize)?
            }
        };

        let data: IMAGE_RESOURCE_DATA_ENTRY = self.image.read(self.subdirectory(&leaf)).ok()?;
        Some(Resource {
            rva: data.OffsetToData,
            size: data.Size,
            code_page: data.CodePage,
        })
    }

    /// Reads string `id` from the string table in `language`.
    ///
    /// Strings are stored in blocks of 16 under [`RT_STRING`]; block `n`
    /// (starting at 1) holds ids `(n - 1) * 16` to `n * 16 - 1` as
    /// length-prefixed UTF-16 records. An empty record means the string does
    /// not exist.
    pub fn load_string(&self, id: u16, language: u16) -> Option<String> {
        let block = self.find(
            ResourceId::Id((id >> 4) + 1),
            ResourceId::Id(RT_STRING),
            language,
        )?;
        let end = block.rva().checked_add(block.size())?;

        let mut offset = block.rva();
        for _ in 0..(id & 0x0F) {
            let len: u16 = self.image.read(offset).ok()?;
            offset += (len as usize + 1) * size_of::<u16>();
        }

        let len: u16 = self.image.read(offset).ok()?;
        let start = offset + size_of::<u16>();
        if len == 0 || start + len as usize * size_of::<u16>() > end {
            return None;
        }
        let text = self.image.wide(start, len as usize).ok()?;
        Some(String::from_utf16_lossy(&text))
    }

    fn subdirectory(&self, entry: &IMAGE_RESOURCE_DIRECTORY_ENTRY) -> usize {
        self.root + (entry.OffsetToData & OFFSET_MASK) as usize
    }

    fn entry(&self, directory: usize, index: usize) -> Option<IMAGE_RESOURCE_DIRECTORY_ENTRY> {
        let offset = directory
            + size_of::<IMAGE_RESOURCE_DIRECTORY>()
            + index * size_of::<IMAGE_RESOURCE_DIRECTORY_ENTRY>();
        self.image.read(offset).ok()
    }

    /// `IMAGE_RESOURCE_DIR_STRING_U`: a u16 length then that many UTF-16 units.
    fn entry_name(&self, entry: &IMAGE_RESOURCE_DIRECTORY_ENTRY) -> Option<Vec<u16>> {
        let offset = self.root + (entry.Name & OFFSET_MASK) as usize;
        let len: u16 = self.image.read(offset).ok()?;
        let start = offset + size_of::<u16>();
        self.image.wide(start, len as usize).ok()
    }

    fn search_entry(
        &self,
        directory: usize,
        key: ResourceId<'_>,
    ) -> Option<IMAGE_RESOURCE_DIRECTORY_ENTRY> {
        let header: IMAGE_RESOURCE_DIRECTORY = self.image.read(directory).ok()?;
        let named = header.NumberOfNamedEntries as usize;
        let ids = header.NumberOfIdEntries as usize;

        match key.normalize() {
            ResourceId::Id(id) => self.bisect(directory, named, named + ids, |entry| {
                Some(id.cmp(&(entry.Name as u16)))
            }),
            ResourceId::Name(name) => {
                let key: Vec<u16> = name.encode_utf16().collect();
                self.bisect(directory, 0, named, |entry| {
                    let name = self.entry_name(entry)?;
                    let prefix = wide_prefix_cmp(&key, &name);
                    Some(prefix.then(key.len().cmp(&name.len())))
                })
            }
        }
    }

    /// Binary search over entries `start..end`; `compare` orders the key
    /// against an entry, `None` aborts the search.
    fn bisect<F>(
        &self,
        directory: usize,
        mut start: usize,
        mut end: usize,
        compare: F,
    ) -> Option<IMAGE_RESOURCE_DIRECTORY_ENTRY>
    where
        F: Fn(&IMAGE_RESOURCE_DIRECTORY_ENTRY) -> Option<Ordering>,
    {
        while start < end {
            let middle = start + (end - start) / 2;
            let entry = self.entry(directory, middle)?;
            match compare(&entry)? {
                Ordering::Less => end = middle,
                Ordering::Greater => start = middle + 1,
                Ordering::Equal => return Some(entry),
            }
        }
        None
    }
}
