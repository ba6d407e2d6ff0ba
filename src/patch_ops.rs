//! Top-level `patch`/`unpatch`/`info` orchestration.
//!
//! Threads the pipeline described by `spec.md`'s data-flow line for each
//! operation: `A,B → E → F ← G ← C ← D ; F → I ← H` for patch, and
//! `C → D → H → I (reverse) → G (munmap)` for unpatch.

use crate::arch::{self, Arch};
use crate::elf_model::{PatchObject, TargetObject};
use crate::error::{Error, Result};
use crate::layout::{self, PlacedSection};
use crate::process::object_file::AppliedPatch;
use crate::process::Process;
use crate::relocation::{JmpTable, PendingReloc};
use crate::resolve::{self, Resolved};
use crate::stack_check::{self, Mode};
use crate::trampoline::{self, PatchFuncSpec, UndoJournal};
use elf::abi::SHN_UNDEF;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    Actived,
    Removed,
}

#[derive(Debug, Clone)]
pub struct InfoReport {
    pub uuid: String,
    pub status: PatchStatus,
    pub changed_func_num: u32,
    pub func_names: Vec<String>,
}

fn arch() -> Arch {
    Arch::host()
}

fn load_bias_for(process: &Process, target: &TargetObject) -> Result<u64> {
    if !target.is_pie() {
        return Ok(0);
    }
    let inode_vma = process
        .areas()
        .iter()
        .find(|a| a.inode != 0)
        .ok_or(Error::NoPatchRegion)?;
    let min_vaddr = target
        .elf()
        .segments()
        .into_iter()
        .flatten()
        .filter(|p| p.p_type == elf::abi::PT_LOAD)
        .map(|p| p.p_vaddr)
        .min()
        .unwrap_or(0);
    Ok(inode_vma.start.saturating_sub(min_vaddr))
}

fn find_applied(process: &Process, uuid: &str) -> Option<AppliedPatch> {
    process
        .objects()
        .iter()
        .filter_map(|o| o.applied_patch.as_ref())
        .find(|p| p.uuid == uuid)
        .cloned()
}

/// Apply `upatch_path` to the running `pid`, redirecting the functions it
/// describes toward their replacements (§4, full pipeline).
pub fn patch(pid: i32, upatch_path: &Path, binary_path: &Path, uuid: &str) -> Result<()> {
    let arch = arch();
    let patch = PatchObject::load(upatch_path)?;
    let mut target = TargetObject::load(binary_path)?;

    let mut process = Process::attach(pid, arch.origin_insn_len(), arch_trampoline_len(arch))?;
    process.check_binary_matches(binary_path)?;

    if find_applied(&process, uuid).is_some() {
        return Err(Error::AlreadyApplied {
            uuid: uuid.to_string(),
        });
    }

    let bias = load_bias_for(&process, &target)?;
    target.set_load_bias(bias);

    let func_entries = patch.func_entries()?;
    log::info!("patch {uuid}: {} functions to redirect", func_entries.len());

    // §4.G: compute layout twice — once to size a conservative jump table,
    // once more after the resolver has grown it to its real length.
    let provisional = layout::compute(&patch, 0)?;
    let mut jmp_table = JmpTable::new(arch);
    let elf = patch.elf();
    let shdrs = elf.section_headers().ok_or_else(|| Error::MalformedElf {
        msg: "patch object has no section headers".into(),
    })?;
    let (symtab, strtab) = patch.symtab()?.ok_or_else(|| Error::MalformedElf {
        msg: "patch object has no symbol table".into(),
    })?;

    // Resolve every undefined symbol once, growing the jump table as needed.
    let mut resolved_by_sym: Vec<Option<Resolved>> = vec![None; symtab.len()];
    for (idx, sym) in symtab.iter().enumerate() {
        if sym.st_shndx as i32 != SHN_UNDEF {
            continue;
        }
        let name = strtab
            .get(sym.st_name as usize)
            .map_err(|e| Error::MalformedElf {
                msg: format!("patch symbol name: {e}").into(),
            })?;
        if name.is_empty() {
            continue;
        }
        let resolved = resolve::resolve_external(name, sym.st_value, &target, bias)?;
        resolved_by_sym[idx] = Some(resolved);
    }

    let layout = layout::compute(&patch, jmp_table.total_size().max(provisional.jmp_table_offset))?;
    let hole_addr = layout::find_hole(process.holes(), process.areas(), layout.total_size as u64)?;

    let region_len = layout.total_size as u64;
    let staging = vec![0u8; layout.total_size];
    let mut staging = staging;

    let table_remote = hole_addr;
    let mut placed: std::collections::HashMap<usize, PlacedSection> = layout.sections.clone();
    for section in placed.values_mut() {
        section.remote = hole_addr + section.staging as u64;
    }

    // Resolve patch-local symbols (ordinary section-relative defs, SHN_ABS,
    // SHN_LIVEPATCH) now that every section's remote address is known — the
    // overwhelming majority of symbols a relocatable patch object relocates
    // against are defined within the same object, not SHN_UNDEF.
    for (idx, sym) in symtab.iter().enumerate() {
        if sym.st_shndx as i32 == SHN_UNDEF {
            continue;
        }
        let addr = resolve::resolve_local(sym.st_shndx, sym.st_value, bias, |shndx| {
            placed.get(&(shndx as usize)).map(|s| s.remote)
        })?;
        resolved_by_sym[idx] = Some(Resolved::Direct(addr));
    }

    // Copy section content into the staging buffer (§4.G "Copy & fix").
    for (idx, shdr) in shdrs.iter().enumerate() {
        let Some(section) = placed.get(&idx) else {
            continue;
        };
        if section.is_nobits {
            continue;
        }
        let start = shdr.sh_offset as usize;
        let end = start + shdr.sh_size as usize;
        let bytes = patch
            .data()
            .get(start..end)
            .ok_or_else(|| Error::MalformedElf {
                msg: "section content out of file bounds".into(),
            })?;
        staging[section.staging..section.staging + bytes.len()].copy_from_slice(bytes);
    }

    // Apply every relocation section (`.rela.<name>`) against its target section.
    for (idx, shdr) in shdrs.iter().enumerate() {
        if shdr.sh_type != elf::abi::SHT_RELA {
            continue;
        }
        let target_idx = shdr.sh_info as usize;
        let Some(target_section) = placed.get(&target_idx).copied() else {
            continue;
        };
        let relas: Vec<_> = elf
            .section_data_as_relas(&shdr)
            .map_err(|e| Error::MalformedElf {
                msg: format!("relocation section: {e}").into(),
            })?
            .collect();

        let mut pending = Vec::with_capacity(relas.len());
        for rela in &relas {
            let resolved = resolved_by_sym[rela.r_sym as usize].ok_or_else(|| {
                Error::SymbolUnresolved {
                    symbol: format!("symtab index {}", rela.r_sym),
                }
            })?;
            pending.push(PendingReloc {
                r_offset: rela.r_offset,
                r_type: rela.r_type,
                resolved,
                addend: rela.r_addend,
            });
        }

        let staging_base = staging.as_mut_ptr() as usize + target_section.staging;
        crate::relocation::apply_section_relocations(
            arch,
            &pending,
            staging_base,
            target_section.remote,
            &mut jmp_table,
            table_remote,
        )?;
    }

    if jmp_table.len() > arch::JMP_TABLE_MAX_ENTRY {
        return Err(Error::JmpTableFull);
    }
    staging[..jmp_table.total_size()].copy_from_slice(&jmp_table.as_bytes());

    // §4.H: stack safety before any trampoline is written.
    let specs: Vec<PatchFuncSpec> = func_entries
        .iter()
        .map(|e| PatchFuncSpec {
            name: e.name.clone(),
            old_addr: target.runtime_addr(e.record.old_addr),
            new_addr: hole_addr + e.record.new_addr, // new_addr is patch-relative per §6
            old_size: e.record.old_size,
            new_size: e.record.new_size,
        })
        .collect();
    let danger = stack_check::danger_ranges(
        &specs
            .iter()
            .map(|s| (s.old_addr, s.old_size, s.new_addr, s.new_size))
            .collect::<Vec<_>>(),
        Mode::Active,
    );
    let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
    stack_check::check_with_retry(&mut process, &danger, &names)?;

    // §4.G "Allocation": remote mmap, then write the staging buffer, then
    // fix protections per region; §4.I installs the trampolines last so a
    // failure there still leaves the region allocated (reported via `info`).
    let mem = process.mem();
    crate::ptrace_driver::remote_syscall::mmap_remote(
        process.pid(),
        mem,
        arch,
        process.libc_base(),
        hole_addr,
        region_len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
    )?;
    process.write_mem(hole_addr, &staging)?;

    // One `mprotect_remote` call per region (§4.G "Post"): a single call over
    // the whole range would leave `rw` non-writable and, since every region
    // would then share one protection, would stop the kernel from splitting
    // the mapping into separate VMAs — so the info block at the tail would
    // never start its own VMA for `AppliedPatch`'s scanner to find.
    let ro_offset = layout.text_size;
    let ro_after_init_offset = layout.text_size + layout.ro_size;
    let regions: [(&str, usize, usize); 5] = [
        ("text", 0, layout.text_size),
        ("ro", ro_offset, layout.ro_size),
        ("ro_after_init", ro_after_init_offset, layout.ro_after_init_size),
        ("rw", layout.rw_offset, layout.tail_offset.saturating_sub(layout.rw_offset)),
        ("tail", layout.tail_offset, layout.total_size.saturating_sub(layout.tail_offset)),
    ];
    for (name, offset, len) in regions {
        if len == 0 {
            continue;
        }
        crate::ptrace_driver::remote_syscall::mprotect_remote(
            process.pid(),
            mem,
            arch,
            process.libc_base(),
            hole_addr + offset as u64,
            len as u64,
            layout::final_prot(name),
        )?;
    }

    let mut journal = UndoJournal::default();
    let installed = match trampoline::install_all(&process, arch, &specs, &mut journal) {
        Ok(funcs) => funcs,
        Err(e) => {
            let _ = crate::ptrace_driver::remote_syscall::munmap_remote(
                process.pid(),
                mem,
                arch,
                process.libc_base(),
                hole_addr,
                region_len,
            );
            process.detach()?;
            return Err(e);
        }
    };

    let applied = AppliedPatch {
        uuid: uuid.to_string(),
        start: hole_addr,
        end: hole_addr + region_len,
        changed_func_num: installed.len() as u32,
        funcs: installed,
    };
    let info_bytes = applied.to_bytes(arch.origin_insn_len(), arch_trampoline_len(arch));
    process.write_mem(hole_addr + layout.info_offset as u64, &info_bytes)?;

    process.detach()?;
    log::info!("patch {uuid} applied at {hole_addr:#x}");
    Ok(())
}

/// Remove a previously applied patch (§4.I "Unpatch is the reverse").
pub fn unpatch(pid: i32, binary_path: &Path, uuid: &str) -> Result<()> {
    let arch = arch();
    let mut process = Process::attach(pid, arch.origin_insn_len(), arch_trampoline_len(arch))?;
    process.check_binary_matches(binary_path)?;

    let applied = find_applied(&process, uuid).ok_or_else(|| Error::NotFound {
        uuid: uuid.to_string(),
    })?;

    let danger = stack_check::danger_ranges(
        &applied
            .funcs
            .iter()
            .map(|f| (f.old_addr, f.old_size, f.new_addr, f.new_size))
            .collect::<Vec<_>>(),
        Mode::Deactive,
    );
    let names: Vec<String> = applied.funcs.iter().map(|f| f.name.clone()).collect();
    stack_check::check_with_retry(&mut process, &danger, &names)?;

    trampoline::restore_all(&process, &applied.funcs)?;

    let mem = process.mem();
    crate::ptrace_driver::remote_syscall::munmap_remote(
        process.pid(),
        mem,
        arch,
        process.libc_base(),
        applied.start,
        applied.end - applied.start,
    )?;

    process.detach()?;
    log::info!("patch {uuid} removed");
    Ok(())
}

/// Report the status of `uuid` in the running target (§6 `info` subcommand).
pub fn info(pid: i32, binary_path: &Path, uuid: &str) -> Result<InfoReport> {
    let arch = arch();
    let process = Process::attach(pid, arch.origin_insn_len(), arch_trampoline_len(arch))?;
    process.check_binary_matches(binary_path)?;

    let report = match find_applied(&process, uuid) {
        Some(applied) => InfoReport {
            uuid: applied.uuid.clone(),
            status: PatchStatus::Actived,
            changed_func_num: applied.changed_func_num,
            func_names: applied.funcs.iter().map(|f| f.name.clone()).collect(),
        },
        None => InfoReport {
            uuid: uuid.to_string(),
            status: PatchStatus::Removed,
            changed_func_num: 0,
            func_names: Vec::new(),
        },
    };

    process.detach()?;
    Ok(report)
}

fn arch_trampoline_len(arch: Arch) -> usize {
    match arch {
        Arch::X86_64 => 14,
        Arch::Aarch64 => 16,
        Arch::Riscv64 => 8,
    }
}
