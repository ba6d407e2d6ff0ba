//! The loaded target binary (§3 `TargetObject`, §4.B).

use super::{parse, Elf};
use crate::error::{malformed_elf, Result};
use elf::abi::{DF_1_PIE, DT_FLAGS_1, ET_DYN, ET_EXEC, PT_TLS};
use elf::string_table::StringTable;
use elf::symbol::SymbolTable;
use std::path::Path;

/// A `PT_TLS` segment's shape, needed to build TLS jump-table entries (§4.F).
#[derive(Debug, Clone, Copy)]
pub struct TlsSegment {
    pub memsz: u64,
    pub align: u64,
}

pub struct TargetObject {
    path: std::path::PathBuf,
    data: Vec<u8>,
    is_pie: bool,
    tls: Option<TlsSegment>,
    /// Address-space bias at which the binary is mapped in the live
    /// process: `0` for a fixed `ET_EXEC`, discovered from `/proc/<pid>/maps`
    /// for `ET_DYN` (§4.C). Filled in by [`TargetObject::with_load_bias`]
    /// once the process has been attached.
    load_bias: u64,
}

impl TargetObject {
    /// Parse the on-disk target binary (§4.B). `ET_EXEC` and `ET_DYN` (PIE)
    /// are both accepted; anything else is rejected.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        let elf = parse(&data)?;

        let is_pie = match elf.ehdr.e_type {
            ET_EXEC => false,
            ET_DYN => true,
            other => {
                return Err(malformed_elf(format!(
                    "target is e_type {other}, expected ET_EXEC or ET_DYN"
                )))
            }
        };

        // A PIE executable still carries DF_1_PIE in its dynamic section;
        // a plain shared library (ET_DYN without it) isn't a valid patch
        // target since it has no process of its own to attach to, but this
        // tool is only ever pointed at the main executable so we don't
        // second-guess that here.
        let _ = DF_1_PIE;
        let _ = DT_FLAGS_1;

        let mut tls = None;
        if let Some(segments) = elf.segments() {
            for phdr in segments.iter() {
                if phdr.p_type == PT_TLS {
                    tls = Some(TlsSegment {
                        memsz: phdr.p_memsz,
                        align: phdr.p_align.max(1),
                    });
                    break;
                }
            }
        }

        log::debug!(
            "parsed target object {:?}: pie={}, tls={}",
            path,
            is_pie,
            tls.is_some()
        );

        Ok(Self {
            path,
            data,
            is_pie,
            tls,
            load_bias: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn elf(&self) -> Elf<'_> {
        parse(&self.data).expect("target object was already validated")
    }

    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    pub fn tls(&self) -> Option<TlsSegment> {
        self.tls
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// Record the load bias discovered from the live process's first
    /// executable mapping (§4.C): `0` for `ET_EXEC`, `map_start` for `ET_DYN`.
    pub fn set_load_bias(&mut self, bias: u64) {
        debug_assert!(self.is_pie || bias == 0, "ET_EXEC must load at bias 0");
        self.load_bias = bias;
    }

    /// Translate a file-relative (`p_vaddr`-space) address into the live
    /// process's address space.
    pub fn runtime_addr(&self, file_addr: u64) -> u64 {
        file_addr + self.load_bias
    }

    pub fn dynsym(&self) -> Result<Option<(SymbolTable<'_, elf::endian::AnyEndian>, StringTable<'_>)>> {
        self.elf()
            .dynamic_symbol_table()
            .map_err(|e| malformed_elf(format!(".dynsym: {e}")))
    }

    pub fn symtab(&self) -> Result<Option<(SymbolTable<'_, elf::endian::AnyEndian>, StringTable<'_>)>> {
        self.elf()
            .symbol_table()
            .map_err(|e| malformed_elf(format!(".symtab: {e}")))
    }

    /// `.rela.dyn` entries, first resolver tier (§4.E).
    pub fn rela_dyn(&self) -> Result<Vec<elf::relocation::Rela>> {
        self.section_relas(".rela.dyn")
    }

    /// `.rela.plt` entries, second resolver tier (§4.E).
    pub fn rela_plt(&self) -> Result<Vec<elf::relocation::Rela>> {
        self.section_relas(".rela.plt")
    }

    fn section_relas(&self, name: &str) -> Result<Vec<elf::relocation::Rela>> {
        let elf = self.elf();
        let Some(shdr) = elf
            .section_header_by_name(name)
            .map_err(|e| malformed_elf(format!("{name}: {e}")))?
        else {
            return Ok(Vec::new());
        };
        let relas = elf
            .section_data_as_relas(&shdr)
            .map_err(|e| malformed_elf(format!("{name} relocations: {e}")))?;
        Ok(relas.collect())
    }
}
