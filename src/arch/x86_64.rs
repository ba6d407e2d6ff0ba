//! x86-64 trampoline, jump-table, and static-relocation encoding.
//!
//! Grounded in the teacher's `arch/x86_64.rs` (`PLT_ENTRY`/`dl_runtime_resolve`
//! shape and its `R_X86_64_*` dispatch in `StaticReloc::relocate`) but
//! retargeted from "lazily-bound dynamic-link PLT" to "hot-patch trampoline
//! and jump-table thunk", since this program never needs lazy binding —
//! every patch symbol is resolved once, eagerly, before any code runs.

use super::{Error, JmpKind, Result};
use elf::abi::*;

/// `syscall; int3` — the remote-syscall stub executed at `libc_base` (§4.D).
pub const SYSCALL_STUB: &[u8] = &[0x0f, 0x05, 0xcc];

/// `jmp [rip+0]` (6 bytes) followed by the 8-byte absolute target.
/// Total length equals [`super::Arch::origin_insn_len`] for x86-64 (14 bytes).
pub fn build_trampoline(new_addr: u64) -> (Vec<u8>, Option<usize>) {
    let mut bytes = Vec::with_capacity(14);
    bytes.extend_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    bytes.extend_from_slice(&new_addr.to_le_bytes());
    (bytes, Some(6))
}

pub fn build_jmp_entry(kind: JmpKind, target: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; 16];
    match kind {
        JmpKind::Plt => {
            // jmp [rip+2]; nop; nop; <addr>
            bytes[0..6].copy_from_slice(&[0xff, 0x25, 0x02, 0x00, 0x00, 0x00]);
            bytes[6] = 0x90;
            bytes[7] = 0x90;
            bytes[8..16].copy_from_slice(&target.to_le_bytes());
        }
        JmpKind::Got => {
            // raw data slot: [value, tls/unused]
            bytes[0..8].copy_from_slice(&target.to_le_bytes());
        }
    }
    bytes
}

pub fn needs_jmp_table(r_type: u32) -> Option<JmpKind> {
    match r_type {
        R_X86_64_PLT32 => Some(JmpKind::Plt),
        R_X86_64_GOTPCREL => Some(JmpKind::Got),
        _ => None,
    }
}

/// Apply one `R_X86_64_*` relocation.
///
/// `loc` is the staging-side byte address of the field to patch, `uloc` the
/// corresponding address the field will have once copied into the target
/// (used for the PC-relative subtraction), and `value` is
/// `sym.st_value + addend`, already resolved absolute in the target.
pub fn apply_reloc(r_type: u32, loc: *mut u8, uloc: u64, value: i64) -> Result<()> {
    match r_type {
        R_X86_64_64 => {
            unsafe { loc.cast::<u64>().write_unaligned(value as u64) };
        }
        R_X86_64_32 => {
            let v = u32::try_from(value).map_err(|_| {
                super::reloc_overflow_err("R_X86_64_32: value does not fit in u32")
            })?;
            unsafe { loc.cast::<u32>().write_unaligned(v) };
        }
        R_X86_64_32S => {
            let v = i32::try_from(value).map_err(|_| {
                super::reloc_overflow_err("R_X86_64_32S: value does not fit in i32")
            })?;
            unsafe { loc.cast::<i32>().write_unaligned(v) };
        }
        // PLT32/GOTPCREL reference a jump-table thunk co-located with the
        // patch by the resolver (§4.F.5), so by the time we get here `value`
        // is always within i32 range of `uloc`; PC32 is the plain case.
        R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOTPCREL => {
            let rel = value - uloc as i64;
            let v = i32::try_from(rel).map_err(|_| {
                super::reloc_overflow_err("R_X86_64_PC32: PC-relative value out of i32 range")
            })?;
            unsafe { loc.cast::<i32>().write_unaligned(v) };
        }
        other => return Err(Error::reloc_unsupported(other)),
    }
    Ok(())
}
