//! The patch `ET_REL` object (§3 `PatchObject`, §4.A).

use super::{parse, Elf};
use crate::error::{malformed_elf, Result};
use elf::abi::SHT_SYMTAB;
use elf::section::SectionHeader;
use elf::string_table::StringTable;
use elf::symbol::SymbolTable;
use std::ffi::CStr;
use std::path::Path;

pub const UPATCH_FUNCS_SECTION: &str = ".upatch.funcs";
pub const UPATCH_STRINGS_SECTION: &str = ".upatch.strings";

/// One `.upatch.funcs` record. `name_ptr` is an offset into
/// `.upatch.strings`, resolved to a name at load time (§6).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PatchFuncRecord {
    pub new_addr: u64,
    pub new_size: u64,
    pub old_addr: u64,
    pub old_size: u64,
    pub sympos: u64,
    pub name_ptr: u64,
}

pub const PATCH_FUNC_RECORD_SIZE: usize = std::mem::size_of::<PatchFuncRecord>();

/// One resolved entry: a [`PatchFuncRecord`] plus its function name.
#[derive(Debug, Clone)]
pub struct PatchFuncEntry {
    pub record: PatchFuncRecord,
    pub name: String,
}

pub struct PatchObject {
    path: std::path::PathBuf,
    data: Vec<u8>,
    funcs_section: Option<SectionHeader>,
    strings_section: Option<SectionHeader>,
}

impl PatchObject {
    /// Parse the relocatable patch object at `path` (§4.A).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        let elf = parse(&data)?;
        if elf.ehdr.e_type != elf::abi::ET_REL {
            return Err(malformed_elf("patch object is not ET_REL"));
        }

        let shdrs = elf
            .section_headers()
            .ok_or_else(|| malformed_elf("patch object has no section headers"))?;

        let mut funcs_section = None;
        let mut strings_section = None;
        let shstrtab = elf
            .section_headers_with_strtab()
            .map_err(|e| malformed_elf(format!("section header string table: {e}")))?
            .1
            .ok_or_else(|| malformed_elf("patch object has no section header string table"))?;
        for shdr in shdrs.iter() {
            let name = shstrtab
                .get(shdr.sh_name as usize)
                .map_err(|e| malformed_elf(format!("bad section name: {e}")))?;
            match name {
                UPATCH_FUNCS_SECTION => funcs_section = Some(shdr),
                UPATCH_STRINGS_SECTION => strings_section = Some(shdr),
                _ => {}
            }
        }

        if let Some(funcs) = &funcs_section {
            if funcs.sh_size == 0 || funcs.sh_size % PATCH_FUNC_RECORD_SIZE as u64 != 0 {
                return Err(malformed_elf(format!(
                    "{UPATCH_FUNCS_SECTION} size {} is not a positive multiple of {PATCH_FUNC_RECORD_SIZE}",
                    funcs.sh_size
                )));
            }
        }

        log::debug!(
            "parsed patch object {:?}: {} sections, funcs={}, strings={}",
            path,
            shdrs.len(),
            funcs_section.is_some(),
            strings_section.is_some(),
        );

        Ok(Self {
            path,
            data,
            funcs_section,
            strings_section,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn elf(&self) -> Elf<'_> {
        // Re-parsing a validated, already-in-memory buffer cannot fail.
        parse(&self.data).expect("patch object was already validated")
    }

    /// First `SHT_SYMTAB` section's symbol/string table pair, per §4.A.
    pub fn symtab(&self) -> Result<Option<(SymbolTable<'_, elf::endian::AnyEndian>, StringTable<'_>)>> {
        let elf = self.elf();
        let shdrs = elf
            .section_headers()
            .ok_or_else(|| malformed_elf("patch object has no section headers"))?;
        for shdr in shdrs.iter() {
            if shdr.sh_type == SHT_SYMTAB {
                let (symtab, strtab) = elf
                    .symbol_table()
                    .map_err(|e| malformed_elf(format!("symtab: {e}")))?
                    .ok_or_else(|| malformed_elf("SHT_SYMTAB section has no linked strtab"))?;
                return Ok(Some((symtab, strtab)));
            }
        }
        Ok(None)
    }

    /// Read and resolve every `.upatch.funcs` record against `.upatch.strings`.
    pub fn func_entries(&self) -> Result<Vec<PatchFuncEntry>> {
        let (Some(funcs), Some(strings)) = (&self.funcs_section, &self.strings_section) else {
            return Ok(Vec::new());
        };
        let funcs_bytes = self.section_bytes(funcs)?;
        let strings_bytes = self.section_bytes(strings)?;

        let count = funcs_bytes.len() / PATCH_FUNC_RECORD_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let chunk = &funcs_bytes[i * PATCH_FUNC_RECORD_SIZE..(i + 1) * PATCH_FUNC_RECORD_SIZE];
            let record = PatchFuncRecord {
                new_addr: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                new_size: u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
                old_addr: u64::from_le_bytes(chunk[16..24].try_into().unwrap()),
                old_size: u64::from_le_bytes(chunk[24..32].try_into().unwrap()),
                sympos: u64::from_le_bytes(chunk[32..40].try_into().unwrap()),
                name_ptr: u64::from_le_bytes(chunk[40..48].try_into().unwrap()),
            };
            let name = read_cstr_at(strings_bytes, record.name_ptr as usize)?;
            out.push(PatchFuncEntry { record, name });
        }
        Ok(out)
    }

    fn section_bytes(&self, shdr: &SectionHeader) -> Result<&[u8]> {
        let start = shdr.sh_offset as usize;
        let end = start
            .checked_add(shdr.sh_size as usize)
            .ok_or_else(|| malformed_elf("section extends past end of file"))?;
        self.data
            .get(start..end)
            .ok_or_else(|| malformed_elf("section offset/size out of file bounds"))
    }
}

fn read_cstr_at(bytes: &[u8], offset: usize) -> Result<String> {
    let tail = bytes
        .get(offset..)
        .ok_or_else(|| malformed_elf("name_ptr out of .upatch.strings bounds"))?;
    let cstr = CStr::from_bytes_until_nul(tail)
        .map_err(|_| malformed_elf("unterminated string in .upatch.strings"))?;
    Ok(cstr.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_is_48_bytes() {
        assert_eq!(PATCH_FUNC_RECORD_SIZE, 48);
    }
}
