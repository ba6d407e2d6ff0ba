//! Crate-wide error type.
//!
//! Mirrors the teacher library's `error.rs` shape: one flat enum, each
//! variant carrying a human-readable message, `Display` formatting a
//! one-line diagnostic, and `std::error::Error` chaining through to the
//! underlying I/O or ptrace failure where one exists.

use std::borrow::Cow;
use std::fmt::{self, Debug, Display};

#[derive(Debug)]
pub enum Error {
    /// Failed to open/read/write a `/proc` entry, patch file, or binary file.
    Io {
        msg: Cow<'static, str>,
        source: Option<std::io::Error>,
    },
    /// The patch or target ELF is malformed (headers out of file range, bad magic, ...).
    MalformedElf { msg: Cow<'static, str> },
    /// None of the five resolver tiers produced an address for a patch symbol.
    SymbolUnresolved { symbol: String },
    /// A relocation's computed value does not fit the field the relocation type encodes.
    RelocOverflow { msg: Cow<'static, str> },
    /// A relocation type is not implemented for the target architecture.
    RelocUnsupported { r_type: usize },
    /// More than `JMP_TABLE_MAX_ENTRY` jump-table entries were needed by one patch.
    JmpTableFull,
    /// A remote `mmap`/`mprotect`/`munmap` returned an errno in `[-4095, -1]`.
    MemoryMap { msg: Cow<'static, str>, errno: i64 },
    /// No VM hole within `MAX_DISTANCE` of the target's executable segment was found.
    NoPatchRegion,
    /// A thread's PC or a return address on its stack falls inside a danger range.
    ActiveFunction { function: String },
    /// No executable VMA whose basename begins with `libc` was found in the target.
    LibcNotFound,
    /// (riscv64 only) `|new_addr - old_addr| >= 2^31`.
    JumpRangeExceeded { delta: i64 },
    /// A patch apply was requested for a UUID that is already present in the target.
    AlreadyApplied { uuid: String },
    /// A patch removal/info lookup named a UUID with no matching region in the target.
    NotFound { uuid: String },
    /// Section type repurposed for scratch use (e.g. `SHN_COMMON`) is not supported.
    Unsupported { msg: Cow<'static, str> },
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { msg, .. } => write!(f, "I/O error: {msg}"),
            Error::MalformedElf { msg } => write!(f, "malformed ELF: {msg}"),
            Error::SymbolUnresolved { symbol } => {
                write!(f, "could not resolve symbol `{symbol}` in target")
            }
            Error::RelocOverflow { msg } => write!(f, "relocation overflow: {msg}"),
            Error::RelocUnsupported { r_type } => {
                write!(f, "unsupported relocation type {r_type}")
            }
            Error::JmpTableFull => write!(f, "jump table exceeded its maximum entry count"),
            Error::MemoryMap { msg, errno } => {
                write!(f, "remote memory operation failed: {msg} (errno {errno})")
            }
            Error::NoPatchRegion => {
                write!(f, "no VM hole within range of the target's code was found")
            }
            Error::ActiveFunction { function } => write!(
                f,
                "function `{function}` is active on a thread's stack; refusing to patch"
            ),
            Error::LibcNotFound => write!(f, "no libc mapping found in target process"),
            Error::JumpRangeExceeded { delta } => {
                write!(f, "trampoline jump range exceeded (delta = {delta:#x})")
            }
            Error::AlreadyApplied { uuid } => write!(f, "patch {uuid} is already applied"),
            Error::NotFound { uuid } => write!(f, "no applied patch with uuid {uuid}"),
            Error::Unsupported { msg } => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => source.as_ref().map(|e| e as _),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            msg: Cow::Owned(err.to_string()),
            source: Some(err),
        }
    }
}

impl From<nix::Error> for Error {
    #[cold]
    fn from(err: nix::Error) -> Self {
        Error::Io {
            msg: Cow::Owned(err.to_string()),
            source: Some(std::io::Error::from(err)),
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io {
        msg: msg.into(),
        source: None,
    }
}

#[cold]
#[inline(never)]
pub(crate) fn malformed_elf(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::MalformedElf { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn reloc_overflow(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::RelocOverflow { msg: msg.into() }
}

/// Translate a syscall return value in the kernel's negative-errno convention
/// (see `spec.md` §4.D / `MAX_ERRNO`) into a [`Error::MemoryMap`].
pub(crate) fn memory_map_error(op: &'static str, ret: i64) -> Error {
    Error::MemoryMap {
        msg: Cow::Borrowed(op),
        errno: -ret,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
