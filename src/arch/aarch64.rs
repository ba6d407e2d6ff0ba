//! AArch64 trampoline, jump-table, and static-relocation encoding.
//!
//! The teacher's `arch/aarch64.rs` only covers the dynamic-linker
//! relocations (`R_AARCH64_ABS64`/`GLOB_DAT`/`RELATIVE`/`JUMP_SLOT`) needed
//! to load a `.so`; its static-relocation dispatch (`arch/mod.rs`'s
//! `StaticRelocator`) is aliased to `DummyRelocator` with `todo!()` bodies
//! for every non-x86_64 target, since the teacher never links a
//! relocatable `.o` on aarch64. The GCC-emitted relocations a patch object
//! actually needs (`ADR_PREL_PG_HI21`, `ADD_ABS_LO12_NC`, `CALL26`) are
//! enrichment drawn from the AArch64 ELF psABI, using the same `elf::abi`
//! constant set the teacher already depends on.

use super::{Error, JmpKind, Result};
use elf::abi::*;

/// `svc #0; brk #0` — the remote-syscall stub executed at `libc_base`.
pub const SYSCALL_STUB: &[u8] = &[0x01, 0x00, 0x00, 0xd4, 0x00, 0x00, 0x20, 0xd4];

/// `ldr x17, #8 ; br x17` (8 bytes) followed by the 8-byte absolute target.
/// Total length equals [`super::Arch::origin_insn_len`] for aarch64 (16 bytes).
pub fn build_trampoline(new_addr: u64) -> (Vec<u8>, Option<usize>) {
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&ldr_literal(17, 8).to_le_bytes());
    bytes.extend_from_slice(&br(17).to_le_bytes());
    bytes.extend_from_slice(&new_addr.to_le_bytes());
    (bytes, Some(8))
}

fn ldr_literal(rt: u32, byte_offset: i32) -> u32 {
    let imm19 = ((byte_offset / 4) as u32) & 0x7ffff;
    0x5800_0000 | (imm19 << 5) | rt
}

fn br(rn: u32) -> u32 {
    0xd61f_0000 | (rn << 5)
}

/// `ldr x16, [pc,#24]; ldr x17, [pc,#12]; br x17; brk #0` + two 8-byte data
/// words. x17 carries the jump target, x16 an auxiliary context value (see
/// the jump-table data-layout note below).
pub fn build_jmp_entry(kind: JmpKind, target: u64, tls: Option<(u64, u64)>) -> Vec<u8> {
    let mut bytes = vec![0u8; 32];
    bytes[0..4].copy_from_slice(&ldr_literal(16, 24).to_le_bytes());
    bytes[4..8].copy_from_slice(&ldr_literal(17, 12).to_le_bytes());
    bytes[8..12].copy_from_slice(&br(17).to_le_bytes());
    bytes[12..16].copy_from_slice(&0xd420_0000u32.to_le_bytes()); // brk #0, never reached
    match kind {
        JmpKind::Plt => {
            bytes[16..24].copy_from_slice(&target.to_le_bytes());
            bytes[24..32].copy_from_slice(&0u64.to_le_bytes());
        }
        JmpKind::Got => {
            // Open question (spec.md §9): the original reuses one address
            // slot with a sentinel 0xffffffff for non-TLS GOT entries; we
            // resolve it here as "word1 holds the TLS offset when `tls` is
            // `Some`, else the sentinel marking this slot as a plain value".
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
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => Some(JmpKind::Plt),
        R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC => Some(JmpKind::Got),
        _ => None,
    }
}

pub fn apply_reloc(r_type: u32, loc: *mut u8, uloc: u64, value: i64) -> Result<()> {
    match r_type {
        R_AARCH64_ABS64 => {
            unsafe { loc.cast::<u64>().write_unaligned(value as u64) };
        }
        R_AARCH64_PREL32 => {
            let rel = value - uloc as i64;
            let v = i32::try_from(rel)
                .map_err(|_| super::reloc_overflow_err("R_AARCH64_PREL32 out of i32 range"))?;
            unsafe { loc.cast::<i32>().write_unaligned(v) };
        }
        R_AARCH64_ADR_PREL_PG_HI21 => {
            let page_delta = page(value as u64) as i64 - page(uloc) as i64;
            // psABI: the page delta must fit a signed 33-bit range.
            if !(-(1i64 << 32)..(1i64 << 32)).contains(&page_delta) {
                return Err(super::reloc_overflow_err(
                    "R_AARCH64_ADR_PREL_PG_HI21 page delta exceeds 33-bit range",
                ));
            }
            let imm = page_delta >> 12;
            let immlo = (imm as u32) & 0x3;
            let immhi = ((imm >> 2) as u32) & 0x7ffff;
            let existing = unsafe { loc.cast::<u32>().read_unaligned() };
            let cleared = existing & !((0x3 << 29) | (0x7ffff << 5));
            let new = cleared | (immlo << 29) | (immhi << 5);
            unsafe { loc.cast::<u32>().write_unaligned(new) };
        }
        R_AARCH64_ADD_ABS_LO12_NC => {
            let lo12 = (value as u64) & 0xfff;
            let existing = unsafe { loc.cast::<u32>().read_unaligned() };
            let cleared = existing & !(0xfff << 10);
            let new = cleared | ((lo12 as u32) << 10);
            unsafe { loc.cast::<u32>().write_unaligned(new) };
        }
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
            let rel = value - uloc as i64;
            if rel % 4 != 0 {
                return Err(super::reloc_overflow_err("CALL26/JUMP26 target misaligned"));
            }
            let imm26 = rel >> 2;
            if !(-(1i64 << 25)..(1i64 << 25)).contains(&imm26) {
                return Err(super::reloc_overflow_err("CALL26/JUMP26 offset exceeds 26 bits"));
            }
            let existing = unsafe { loc.cast::<u32>().read_unaligned() };
            let cleared = existing & !0x03ff_ffff;
            let new = cleared | (imm26 as u32 & 0x03ff_ffff);
            unsafe { loc.cast::<u32>().write_unaligned(new) };
        }
        other => return Err(Error::reloc_unsupported(other)),
    }
    Ok(())
}

fn page(addr: u64) -> u64 {
    addr & !0xfff
}
