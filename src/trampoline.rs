//! Trampoline installation and rollback (§4.I).

use crate::arch::{self, Arch};
use crate::error::Result;
use crate::process::object_file::PatchFunc;
use crate::process::Process;

/// One function this apply is about to redirect.
pub struct PatchFuncSpec {
    pub name: String,
    pub old_addr: u64,
    pub new_addr: u64,
    pub old_size: u64,
    pub new_size: u64,
}

/// Per-operation undo journal (`SPEC_FULL.md` §7/§9): every write this apply
/// makes to the target is recorded here before it happens, so any later
/// failure can replay it in reverse.
#[derive(Default)]
pub struct UndoJournal {
    writes: Vec<(u64, Vec<u8>)>,
}

impl UndoJournal {
    pub fn record(&mut self, addr: u64, original_bytes: Vec<u8>) {
        self.writes.push((addr, original_bytes));
    }

    /// Replay every recorded write in reverse order, restoring the target
    /// to its pre-apply state.
    pub fn rollback(&self, process: &Process) -> Result<()> {
        for (addr, bytes) in self.writes.iter().rev() {
            process.write_mem(*addr, bytes)?;
        }
        Ok(())
    }
}

/// Write one trampoline over `spec.old_addr`, journaling the original bytes
/// first (§4.I steps 1–3). On any write failure, `journal` is not rolled
/// back here — the caller (`patch_ops::apply`) owns that decision so it can
/// also undo earlier allocation steps.
pub fn install_one(
    process: &Process,
    arch: Arch,
    spec: &PatchFuncSpec,
    journal: &mut UndoJournal,
) -> Result<PatchFunc> {
    let origin_len = arch.origin_insn_len();
    let saved = process.read_mem(spec.old_addr, origin_len)?;
    journal.record(spec.old_addr, saved.clone());

    let (trampoline, _slot_offset) = arch::build_trampoline(arch, spec.old_addr, spec.new_addr)?;
    process.write_mem(spec.old_addr, &trampoline)?;

    Ok(PatchFunc {
        name: spec.name.clone(),
        old_addr: spec.old_addr,
        new_addr: spec.new_addr,
        old_size: spec.old_size,
        new_size: spec.new_size,
        old_insn: saved,
        new_insn: trampoline,
    })
}

/// Install every function's trampoline; on the first failure, roll back
/// every trampoline already written in this call before propagating the
/// error (§4.I "Rollback").
pub fn install_all(
    process: &Process,
    arch: Arch,
    specs: &[PatchFuncSpec],
    journal: &mut UndoJournal,
) -> Result<Vec<PatchFunc>> {
    let mut installed = Vec::with_capacity(specs.len());
    for spec in specs {
        match install_one(process, arch, spec, journal) {
            Ok(func) => installed.push(func),
            Err(e) => {
                journal.rollback(process)?;
                return Err(e);
            }
        }
    }
    Ok(installed)
}

/// Unpatch: write every function's saved original bytes back (§4.I "Unpatch
/// is the reverse"). The caller `munmap`s the patch region afterward.
pub fn restore_all(process: &Process, funcs: &[PatchFunc]) -> Result<()> {
    for func in funcs {
        process.write_mem(func.old_addr, &func.old_insn)?;
    }
    Ok(())
}
