//! Per-patch jump table and `RELA` relocation application (§4.F).

use crate::arch::{self, Arch, JmpKind, JMP_TABLE_MAX_ENTRY};
use crate::error::{Error, Result};
use crate::resolve::Resolved;
use elf::relocation::Rela;
use std::collections::HashMap;

/// Contiguous array of fixed-size PLT/GOT-style thunks placed at the head of
/// the patch's text (§3 `JmpTable`, §4.F). Allocated sequentially; overflow
/// past [`JMP_TABLE_MAX_ENTRY`] is a hard error (testable property 4).
pub struct JmpTable {
    arch: Arch,
    entries: Vec<Vec<u8>>,
}

impl JmpTable {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_size(&self) -> usize {
        self.arch.jmp_table_entry_size()
    }

    pub fn total_size(&self) -> usize {
        self.entries.len() * self.entry_size()
    }

    /// Append one entry, returning its index. `remote_base` is the
    /// not-yet-known final remote address of this table; callers resolve
    /// each entry's own remote address as `remote_base + index * entry_size`
    /// once layout has placed the table.
    pub fn push(&mut self, kind: JmpKind, target: u64, tls: Option<(u64, u64)>) -> Result<usize> {
        if self.entries.len() >= JMP_TABLE_MAX_ENTRY {
            return Err(Error::JmpTableFull);
        }
        let bytes = arch::build_jmp_entry(self.arch, kind, target, tls);
        debug_assert_eq!(bytes.len(), self.entry_size());
        self.entries.push(bytes);
        Ok(self.entries.len() - 1)
    }

    /// Concatenated entry bytes, in allocation order, ready to prepend to text.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.entries.iter().flatten().copied().collect()
    }

    pub fn remote_addr(&self, table_base: u64, index: usize) -> u64 {
        table_base + (index * self.entry_size()) as u64
    }
}

/// One relocation to apply, already carrying the resolved symbol address and
/// addend (§4.F step 3 — resolution is §4.E's job, this module only encodes).
pub struct PendingReloc {
    pub r_offset: u64,
    pub r_type: u32,
    pub resolved: Resolved,
    pub addend: i64,
}

/// Apply every relocation of one patch section into its staging buffer.
///
/// `section_staging`/`section_remote` are the staging (local) and target
/// (remote) base addresses of the section being relocated — the
/// `PlacedSection` pair from `SPEC_FULL.md` §3, replacing the teacher's
/// `sh_addr`/`sh_addralign` scratch-field reuse. `jmp_table` receives any
/// thunks the resolver's `ViaJumpTable` results require; `jmp_table_remote`
/// is the table's own remote base, needed once it has been placed.
pub fn apply_section_relocations(
    arch: Arch,
    relocs: &[PendingReloc],
    section_staging: usize,
    section_remote: u64,
    jmp_table: &mut JmpTable,
    jmp_table_remote: u64,
) -> Result<()> {
    for reloc in relocs {
        let loc = (section_staging + reloc.r_offset as usize) as *mut u8;
        let uloc = section_remote + reloc.r_offset;

        let value = match (arch::needs_jmp_table(arch, reloc.r_type), reloc.resolved) {
            (Some(kind), Resolved::ViaJumpTable { target, .. }) => {
                let idx = jmp_table.push(kind, target, None)?;
                jmp_table.remote_addr(jmp_table_remote, idx) as i64 + reloc.addend
            }
            (Some(kind), Resolved::Direct(addr)) => {
                let idx = jmp_table.push(kind, addr, None)?;
                jmp_table.remote_addr(jmp_table_remote, idx) as i64 + reloc.addend
            }
            (None, resolved) => resolved.target_addr() as i64 + reloc.addend,
        };

        arch::apply_reloc(arch, reloc.r_type, loc, uloc, value)?;
    }
    Ok(())
}

/// Group a section's `Rela` entries by `r_sym`, for resolving each
/// referenced symbol once even if it's used by multiple relocations.
pub fn group_by_symbol(relas: &[Rela]) -> HashMap<u32, Vec<&Rela>> {
    let mut map: HashMap<u32, Vec<&Rela>> = HashMap::new();
    for rela in relas {
        map.entry(rela.r_sym).or_default().push(rela);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_table_bound_is_enforced() {
        let mut table = JmpTable::new(Arch::X86_64);
        for _ in 0..JMP_TABLE_MAX_ENTRY {
            table.push(JmpKind::Plt, 0x1000, None).unwrap();
        }
        assert_eq!(table.len(), JMP_TABLE_MAX_ENTRY);
        let err = table.push(JmpKind::Plt, 0x1000, None).unwrap_err();
        assert!(matches!(err, Error::JmpTableFull));
    }

    #[test]
    fn entry_bytes_concatenate_in_order() {
        let mut table = JmpTable::new(Arch::X86_64);
        table.push(JmpKind::Plt, 0x1000, None).unwrap();
        table.push(JmpKind::Got, 0x2000, None).unwrap();
        assert_eq!(table.as_bytes().len(), 2 * table.entry_size());
    }
}
