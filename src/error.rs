use alloc::string::String;

use thiserror::Error;

/// Everything that can go wrong while mapping an image or using a mapped one.
///
/// Format errors are reported before anything is allocated. Every error raised
/// after the image region exists has already been rolled back by the time the
/// caller sees it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Format errors
    /// The buffer ends before a structure the loader has to read.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    TooSmall { needed: usize, available: usize },

    /// The DOS header does not start with `MZ`.
    #[error("invalid DOS signature")]
    InvalidDosSignature,

    /// The NT headers do not start with `PE\0\0`.
    #[error("invalid NT signature")]
    InvalidNtSignature,

    /// The optional header magic does not match the host's pointer width.
    #[error("invalid optional header magic: 0x{0:04X}")]
    InvalidOptionalHeader(u16),

    /// The image targets another architecture than the running process.
    #[error("machine mismatch: expected 0x{expected:04X}, found 0x{found:04X}")]
    MachineMismatch { expected: u16, found: u16 },

    /// Section alignment is not a multiple of two.
    #[error("unsupported section alignment: {0}")]
    InvalidSectionAlignment(u32),

    /// `SizeOfImage` disagrees with the extent of the section table.
    #[error("image size 0x{declared:X} does not match end of sections 0x{sections_end:X}")]
    ImageSizeMismatch {
        declared: usize,
        sections_end: usize,
    },

    /// A section declares raw data past the end of the buffer.
    #[error("section raw data 0x{offset:X}+0x{size:X} exceeds the buffer")]
    TruncatedSection { offset: usize, size: usize },

    /// A structure referenced by the image lies outside the mapped region.
    #[error("rva 0x{rva:X} (+{size}) is outside the image")]
    OutOfBounds { rva: usize, size: usize },

    // Allocation errors
    /// The host reports a page size that is not a power of two.
    #[error("invalid page size: {0}")]
    InvalidPageSize(usize),

    /// The host refused to reserve the image region.
    #[error("could not reserve {size} bytes for the image")]
    Allocation { size: usize },

    /// The host refused to commit part of the image region.
    #[error("could not commit 0x{size:X} bytes at rva 0x{rva:X}")]
    Commit { rva: usize, size: usize },

    // Relocation errors
    /// The image has to move but carries no relocation data.
    #[error("image cannot be relocated: no base relocation directory")]
    NotRelocatable,

    // Dependency errors
    /// A dependent module could not be loaded.
    #[error("could not load dependency {0}")]
    LibraryNotFound(String),

    /// A dependent module does not export a required symbol.
    #[error("{library} does not export {symbol}")]
    SymbolNotFound { library: String, symbol: String },

    // Protection errors
    /// The host refused to change page protection.
    #[error("could not protect 0x{size:X} bytes at rva 0x{rva:X}")]
    Protection { rva: usize, size: usize },

    // Entry point errors
    /// `DllMain` returned `FALSE` for `DLL_PROCESS_ATTACH`.
    #[error("entry point reported initialization failure")]
    EntryPointFailed,

    // Invalid invocation
    /// The module is a library, not an executable.
    #[error("module is not an executable image")]
    NotExecutable,

    /// The image declares no entry point.
    #[error("module has no entry point")]
    NoEntryPoint,

    /// The image was never successfully relocated.
    #[error("module was not relocated")]
    NotRelocated,
}

pub type Result<T> = core::result::Result<T, Error>;
