//! ELF analysis for both the patch object (§4.A) and the loaded target
//! (§4.B).
//!
//! The teacher (`elf_loader`) reimplements header/section parsing over raw
//! pointers because it is `no_std` and loads ELF images it then executes
//! in-process. This tool only ever *reads* ELF files once, up front, from
//! disk, so it uses the `elf` crate's safe `ElfBytes` view directly instead
//! of re-deriving that plumbing — same dependency the teacher already
//! carries, used at its public-API layer rather than its internal one.

mod patch;
mod target;

pub use patch::{PatchFuncRecord, PatchObject};
pub use target::TargetObject;

use crate::error::{malformed_elf, Result};
use elf::endian::AnyEndian;
use elf::ElfBytes;

pub(crate) type Elf<'d> = ElfBytes<'d, AnyEndian>;

pub(crate) fn parse(data: &[u8]) -> Result<Elf<'_>> {
    ElfBytes::<AnyEndian>::minimal_parse(data)
        .map_err(|e| malformed_elf(format!("ELF parse error: {e}")))
}
