//! Symbol resolution for the patch's undefined symbols (§4.E).

use crate::arch::{Arch, JmpKind, SHN_LIVEPATCH};
use crate::elf_model::TargetObject;
use crate::error::{Error, Result};
use elf::abi::{SHN_ABS, SHN_COMMON, SHN_UNDEF, STT_FUNC, STT_TLS};

/// Strip an `@version`/`@@version` suffix a dynamic symbol name may carry.
pub fn strip_version(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

/// Where a resolved symbol's address came from, and whether it needs a
/// jump-table thunk installed before relocations can reference it (§4.E/§4.F).
#[derive(Debug, Clone, Copy)]
pub enum Resolved {
    /// Address usable directly in a relocation, no jump-table entry needed
    /// (tier 4/5: `.symtab`/patch-internal).
    Direct(u64),
    /// Needs a `JmpTable` entry of the given kind installed for `target`.
    ViaJumpTable { target: u64, kind: JmpKind },
}

impl Resolved {
    pub fn target_addr(self) -> u64 {
        match self {
            Resolved::Direct(a) => a,
            Resolved::ViaJumpTable { target, .. } => target,
        }
    }
}

/// Resolve one `SHN_UNDEF` patch symbol against the five tiers of §4.E, in
/// order, accepting the first nonzero result.
pub fn resolve_external(
    name: &str,
    patch_st_value: u64,
    target: &TargetObject,
    load_bias: u64,
) -> Result<Resolved> {
    let name = strip_version(name);

    // Tier 1: `.rela.dyn`.
    if let Some((dynsym, dynstr)) = target.dynsym()? {
        for rela in target.rela_dyn()? {
            let sym_idx = (rela.r_sym) as usize;
            let matches = if sym_idx == 0 {
                rela.r_addend as u64 == patch_st_value
            } else {
                dynsym
                    .get(sym_idx)
                    .ok()
                    .and_then(|s| dynstr.get(s.st_name as usize).ok())
                    .map(|n| strip_version(n) == name)
                    .unwrap_or(false)
            };
            if matches {
                let addr = load_bias + rela.r_offset;
                return Ok(Resolved::ViaJumpTable {
                    target: addr,
                    kind: JmpKind::Got,
                });
            }
        }

        // Tier 2: `.rela.plt`, restricted to function/TLS dynsym entries.
        for rela in target.rela_plt()? {
            let sym_idx = rela.r_sym as usize;
            if sym_idx == 0 {
                continue;
            }
            let Ok(sym) = dynsym.get(sym_idx) else {
                continue;
            };
            if sym.st_symtype() != STT_FUNC && sym.st_symtype() != STT_TLS {
                continue;
            }
            let Ok(sym_name) = dynstr.get(sym.st_name as usize) else {
                continue;
            };
            if strip_version(sym_name) == name {
                let addr = load_bias + rela.r_offset;
                return Ok(Resolved::ViaJumpTable {
                    target: addr,
                    kind: JmpKind::Plt,
                });
            }
        }

        // Tier 3: `.dynsym` direct.
        for sym in dynsym.iter() {
            if sym.st_value == 0 || sym.st_shndx as i32 == SHN_UNDEF {
                continue;
            }
            let Ok(sym_name) = dynstr.get(sym.st_name as usize) else {
                continue;
            };
            if strip_version(sym_name) == name {
                return Ok(Resolved::ViaJumpTable {
                    target: load_bias + sym.st_value,
                    kind: JmpKind::Got,
                });
            }
        }
    }

    // Tier 4: `.symtab` direct.
    if let Some((symtab, strtab)) = target.symtab()? {
        for sym in symtab.iter() {
            if sym.st_shndx as i32 == SHN_UNDEF {
                continue;
            }
            let Ok(sym_name) = strtab.get(sym.st_name as usize) else {
                continue;
            };
            if sym_name == name {
                return Ok(Resolved::Direct(load_bias + sym.st_value));
            }
        }
    }

    // Tier 5: the patch's own symbol table entry.
    if patch_st_value != 0 {
        return Ok(Resolved::Direct(load_bias + patch_st_value));
    }

    Err(Error::SymbolUnresolved {
        symbol: name.to_string(),
    })
}

/// How a patch-local (defined, non-`SHN_UNDEF`) symbol's `st_shndx` maps to
/// an address, per the special `st_shndx` handling in §4.E. `section_remote`
/// looks up the target-side (remote) base address of one of the patch's own
/// sections by index, once layout has assigned it (`PlacedSection::remote`).
pub fn resolve_local(
    st_shndx: u16,
    st_value: u64,
    load_bias: u64,
    section_remote: impl Fn(u16) -> Option<u64>,
) -> Result<u64> {
    match st_shndx as i32 {
        SHN_ABS => Ok(st_value),
        SHN_COMMON => Err(Error::Unsupported {
            msg: "SHN_COMMON symbols are not supported".into(),
        }),
        _ if st_shndx == SHN_LIVEPATCH => Ok(load_bias + st_value),
        shndx => {
            let base = section_remote(shndx as u16).ok_or_else(|| Error::MalformedElf {
                msg: format!("symbol references unknown section index {shndx}").into(),
            })?;
            Ok(base + st_value)
        }
    }
}

/// Placeholder used by relocation dispatch when an architecture needs to
/// know which host this binary runs as (§4.F depends on the patcher's own
/// compiled architecture, not the target's).
pub fn host_arch() -> Arch {
    Arch::host()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_version_suffix() {
        assert_eq!(strip_version("memcpy@GLIBC_2.14"), "memcpy");
        assert_eq!(strip_version("puts"), "puts");
    }

    #[test]
    fn resolve_local_shn_abs_ignores_bias() {
        let addr = resolve_local(SHN_ABS as u16, 0x1234, 0x7f0000000000, |_| None).unwrap();
        assert_eq!(addr, 0x1234);
    }

    #[test]
    fn resolve_local_shn_common_is_unsupported() {
        let err = resolve_local(SHN_COMMON as u16, 0, 0, |_| None).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn resolve_local_livepatch_offsets_by_bias() {
        let addr = resolve_local(SHN_LIVEPATCH, 0x100, 0x7f0000000000, |_| None).unwrap();
        assert_eq!(addr, 0x7f0000000100);
    }
}
