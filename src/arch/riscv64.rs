//! Riscv64 trampoline, jump-table, and static-relocation encoding.
//!
//! As with aarch64, the teacher only implements `R_RISCV_64`/`RELATIVE`/
//! `JUMP_SLOT`-class dynamic relocations; the GCC static relocations a
//! patch object carries (`R_RISCV_CALL`, `R_RISCV_BRANCH`) are enrichment
//! over the RISC-V ELF psABI, reusing the `elf::abi` constants the teacher
//! already depends on.

use super::{Error, JmpKind, Result};
use elf::abi::*;

/// `ecall; ebreak` — the remote-syscall stub executed at `libc_base`.
pub const SYSCALL_STUB: &[u8] = &[0x73, 0x00, 0x00, 0x00, 0x73, 0x00, 0x10, 0x00];

const T6: u32 = 31;

fn auipc(rd: u32, imm20: i32) -> u32 {
    ((imm20 as u32) << 12) | (rd << 7) | 0x17
}

fn jalr(rd: u32, rs1: u32, imm12: i32) -> u32 {
    (((imm12 as u32) & 0xfff) << 20) | (rs1 << 15) | (rd << 7) | 0x67
}

fn ld(rd: u32, rs1: u32, imm12: i32) -> u32 {
    (((imm12 as u32) & 0xfff) << 20) | (rs1 << 15) | (0b011 << 12) | (rd << 7) | 0x03
}

/// Split a PC-relative delta into `(auipc hi20, {jalr,ld,...} lo12)` using
/// the standard add-then-shift rounding so the low instruction's
/// sign-extended 12-bit immediate recombines exactly to `delta`.
fn hi_lo(delta: i64) -> (i32, i32) {
    let hi = (delta.wrapping_add(0x800)) >> 12;
    let lo = delta - (hi << 12);
    (hi as i32, lo as i32)
}

/// `auipc t6, hi20(new-old) ; jalr x0, lo12(new-old)(t6)` (8 bytes). Unlike
/// x86-64/aarch64 this trampoline carries no separate absolute-address slot
/// (§4.I): the jump target is entirely encoded in the two instruction
/// words, so [`None`] is returned for the address-slot offset. The saved
/// origin length is still 16 bytes (bytes 8..16 of the original prologue
/// are left untouched but still backed up for rollback).
pub fn build_trampoline(old_addr: u64, new_addr: u64) -> Result<(Vec<u8>, Option<usize>)> {
    let delta = new_addr as i64 - old_addr as i64;
    if !(-(1i64 << 31)..(1i64 << 31)).contains(&delta) {
        return Err(Error::JumpRangeExceeded { delta });
    }
    let (hi, lo) = hi_lo(delta);
    let mut bytes = Vec::with_capacity(8);
    bytes.extend_from_slice(&auipc(T6, hi).to_le_bytes());
    bytes.extend_from_slice(&jalr(0, T6, lo).to_le_bytes());
    Ok((bytes, None))
}

/// `auipc t6,0 ; ld t6,16(t6) ; jr t6 ; <undef>` + two 8-byte data words,
/// data layout mirrored from aarch64 (§4.F).
pub fn build_jmp_entry(kind: JmpKind, target: u64, tls: Option<(u64, u64)>) -> Vec<u8> {
    let mut bytes = vec![0u8; 32];
    bytes[0..4].copy_from_slice(&auipc(T6, 0).to_le_bytes());
    bytes[4..8].copy_from_slice(&ld(T6, T6, 16).to_le_bytes());
    bytes[8..12].copy_from_slice(&jalr(0, T6, 0).to_le_bytes()); // jr t6
    bytes[12..16].copy_from_slice(&0u32.to_le_bytes()); // <undef>
    match kind {
        JmpKind::Plt => {
            bytes[16..24].copy_from_slice(&target.to_le_bytes());
            bytes[24..32].copy_from_slice(&0u64.to_le_bytes());
        }
        JmpKind::Got => {
            // See the open question recorded in `DESIGN.md`: the source
            // reuses a slot with sentinel 0xffffffff for non-TLS entries.
            let (word0, word1) = match tls {
                Some((module_id, offset)) => (module_id, offset),
                None => (target, 0xffff_ffffu64),
            };
            bytes[16..24].copy_from_slice(&word0.to_le_bytes());
            bytes[24..32].copy_from_slice(&word1.to_le_bytes());
        }
    }
    bytes
}

pub fn needs_jmp_table(r_type: u32) -> Option<JmpKind> {
    match r_type {
        R_RISCV_CALL | R_RISCV_CALL_PLT => Some(JmpKind::Plt),
        _ => None,
    }
}

pub fn apply_reloc(r_type: u32, loc: *mut u8, uloc: u64, value: i64) -> Result<()> {
    match r_type {
        R_RISCV_64 => {
            unsafe { loc.cast::<u64>().write_unaligned(value as u64) };
        }
        R_RISCV_32 => {
            let v = u32::try_from(value)
                .map_err(|_| super::reloc_overflow_err("R_RISCV_32: value does not fit in u32"))?;
            unsafe { loc.cast::<u32>().write_unaligned(v) };
        }
        R_RISCV_BRANCH => {
            let val = value - uloc as i64;
            if !(-4096..=4094).contains(&val) {
                return Err(super::reloc_overflow_err(
                    "R_RISCV_BRANCH: branch target exceeds +-4KiB range",
                ));
            }
            let imm12 = ((val >> 12) & 0x1) as u32;
            let imm11 = ((val >> 11) & 0x1) as u32;
            let imm10_5 = ((val >> 5) & 0x3f) as u32;
            let imm4_1 = ((val >> 1) & 0xf) as u32;
            let existing = unsafe { loc.cast::<u32>().read_unaligned() };
            let cleared = existing & !((1 << 31) | (0x3f << 25) | (0xf << 8) | (1 << 7));
            let new =
                cleared | (imm12 << 31) | (imm10_5 << 25) | (imm4_1 << 8) | (imm11 << 7);
            unsafe { loc.cast::<u32>().write_unaligned(new) };
        }
        R_RISCV_CALL | R_RISCV_CALL_PLT => {
            let delta = value - uloc as i64;
            if !(-(1i64 << 31)..(1i64 << 31)).contains(&delta) {
                return Err(Error::JumpRangeExceeded { delta });
            }
            let (hi, lo) = hi_lo(delta);
            let existing_auipc = unsafe { loc.cast::<u32>().read_unaligned() };
            let rd = (existing_auipc >> 7) & 0x1f;
            let existing_jalr = unsafe { loc.add(4).cast::<u32>().read_unaligned() };
            let jalr_rd = (existing_jalr >> 7) & 0x1f;
            unsafe {
                loc.cast::<u32>().write_unaligned(auipc(rd, hi));
                loc.add(4)
                    .cast::<u32>()
                    .write_unaligned(jalr(jalr_rd, rd, lo));
            }
        }
        other => return Err(Error::reloc_unsupported(other)),
    }
    Ok(())
}
