//! CPU-architecture dispatch.
//!
//! The teacher (`elf_loader`) picks its architecture at compile time with
//! `cfg_if!` over `target_arch`, duplicating one module per ISA. Per the
//! redesign guidance this crate instead models the three supported
//! architectures as a runtime `enum` with match-dispatched per-variant
//! logic: trampoline bytes, relocation application, and syscall-stub
//! encoding are pure data computations that don't need inline assembly or
//! `#[cfg(target_arch)]` gating, and keeping them reachable on any host lets
//! the riscv64 overflow math (testable property 8) run in unit tests on
//! whatever CI happens to build this crate on.
//!
//! `Arch::host()` is the one place compile-time `cfg` enters: it names which
//! variant this *binary* was built for, which is also the only variant it
//! can actually `ptrace` a target with (the remote syscall stub is real
//! machine code executed by the physical CPU).

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

use crate::error::{malformed_elf, reloc_overflow, Error, Result};

pub(crate) fn reloc_overflow_err(msg: &'static str) -> Error {
    reloc_overflow(msg)
}

/// `SHN_LIVEPATCH`: custom section index meaning "already resolved, offset by load bias".
pub const SHN_LIVEPATCH: u16 = 0xff20;

pub const JMP_TABLE_MAX_ENTRY: usize = 100;
/// `2^32`, per `spec.md` §6.
pub const MAX_DISTANCE: u64 = 1 << 32;
pub const STACK_CHECK_RETRY_TIMES: u32 = 3;
pub const MAX_ATTACH_ATTEMPTS: u32 = 3;
/// Syscall return values in `[-MAX_ERRNO, -1]` are negative errno, not data.
pub const MAX_ERRNO: i64 = 4095;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

#[inline]
pub const fn page_align_up(x: usize) -> usize {
    (x + PAGE_SIZE - 1) & PAGE_MASK
}

#[inline]
pub const fn page_align_down(x: usize) -> usize {
    x & PAGE_MASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    /// The architecture this binary was compiled for — the only one it can
    /// actually attach a live `ptrace` target on.
    pub const fn host() -> Arch {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                Arch::X86_64
            } else if #[cfg(target_arch = "aarch64")] {
                Arch::Aarch64
            } else if #[cfg(target_arch = "riscv64")] {
                Arch::Riscv64
            } else {
                compile_error!("upatch-manage only supports x86_64, aarch64 and riscv64 targets")
            }
        }
    }

    pub fn from_elf_machine(e_machine: u16) -> Result<Arch> {
        match e_machine {
            elf::abi::EM_X86_64 => Ok(Arch::X86_64),
            elf::abi::EM_AARCH64 => Ok(Arch::Aarch64),
            elf::abi::EM_RISCV => Ok(Arch::Riscv64),
            other => Err(malformed_elf(format!("unsupported e_machine {other}"))),
        }
    }

    pub fn elf_machine(self) -> u16 {
        match self {
            Arch::X86_64 => elf::abi::EM_X86_64,
            Arch::Aarch64 => elf::abi::EM_AARCH64,
            Arch::Riscv64 => elf::abi::EM_RISCV,
        }
    }

    /// Bytes overwritten at the head of a patched function (origin-insn length, §4.I).
    pub const fn origin_insn_len(self) -> usize {
        match self {
            Arch::X86_64 => 14,
            Arch::Aarch64 => 16,
            Arch::Riscv64 => 16,
        }
    }

    /// Size in bytes of one jump-table entry (§4.F).
    pub const fn jmp_table_entry_size(self) -> usize {
        match self {
            Arch::X86_64 => 16,
            Arch::Aarch64 => 32,
            Arch::Riscv64 => 32,
        }
    }
}

/// General-purpose register snapshot, one per architecture's `ptrace`
/// `GETREGS`/`SETREGS` ABI. Only the fields the remote-syscall and
/// stack-walk machinery need are modeled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub pc: u64,
    pub sp: u64,
    /// Syscall number register, then up to 6 arguments, in ABI order.
    pub syscall: [u64; 7],
}

impl Registers {
    pub fn set_syscall(&mut self, nr: u64, args: [u64; 6]) {
        self.syscall[0] = nr;
        self.syscall[1..].copy_from_slice(&args);
    }

    /// Return-value register after the syscall stub traps back.
    pub fn syscall_ret(self) -> i64 {
        self.syscall[0] as i64
    }
}

/// Two-instruction `syscall; trap` sequence executed at `libc_base` to
/// perform one remote syscall (§4.D).
pub fn syscall_stub(arch: Arch) -> &'static [u8] {
    match arch {
        Arch::X86_64 => x86_64::SYSCALL_STUB,
        Arch::Aarch64 => aarch64::SYSCALL_STUB,
        Arch::Riscv64 => riscv64::SYSCALL_STUB,
    }
}

/// Build the trampoline bytes written over a patched function's prologue
/// (§4.I). Returns `(bytes, abs_addr_offset)` where `abs_addr_offset` is the
/// byte offset within `old_addr` at which the absolute `new_addr` slot is
/// written, if the encoding uses one separate from the instruction bytes.
pub fn build_trampoline(
    arch: Arch,
    old_addr: u64,
    new_addr: u64,
) -> Result<(Vec<u8>, Option<usize>)> {
    match arch {
        Arch::X86_64 => Ok(x86_64::build_trampoline(new_addr)),
        Arch::Aarch64 => Ok(aarch64::build_trampoline(new_addr)),
        Arch::Riscv64 => riscv64::build_trampoline(old_addr, new_addr),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JmpKind {
    /// PLT-style far-jump thunk for a call to an external function.
    Plt,
    /// GOT-style indirect data slot (including TLS `(module_id, offset)` pairs).
    Got,
}

/// Encode one jump-table entry (§4.F). `tls` carries `(module_id, offset)`
/// for `JmpKind::Got` TLS slots; otherwise `target` is the resolved address.
pub fn build_jmp_entry(arch: Arch, kind: JmpKind, target: u64, tls: Option<(u64, u64)>) -> Vec<u8> {
    match arch {
        Arch::X86_64 => x86_64::build_jmp_entry(kind, target),
        Arch::Aarch64 => aarch64::build_jmp_entry(kind, target, tls),
        Arch::Riscv64 => riscv64::build_jmp_entry(kind, target, tls),
    }
}

/// Apply one `RELA` relocation into the staging buffer. `loc` is the
/// staging-side address of the relocation's target byte, `uloc` the
/// corresponding target-side (remote) address — see `PlacedSection` in
/// `SPEC_FULL.md` §3.
pub fn apply_reloc(
    arch: Arch,
    r_type: u32,
    loc: *mut u8,
    uloc: u64,
    value: i64,
) -> Result<()> {
    match arch {
        Arch::X86_64 => x86_64::apply_reloc(r_type, loc, uloc, value),
        Arch::Aarch64 => aarch64::apply_reloc(r_type, loc, uloc, value),
        Arch::Riscv64 => riscv64::apply_reloc(r_type, loc, uloc, value),
    }
}

/// Whether a relocation type must be routed through a jump-table thunk
/// because its encoded range cannot reach the symbol directly (§4.F.5).
pub fn needs_jmp_table(arch: Arch, r_type: u32) -> Option<JmpKind> {
    match arch {
        Arch::X86_64 => x86_64::needs_jmp_table(r_type),
        Arch::Aarch64 => aarch64::needs_jmp_table(r_type),
        Arch::Riscv64 => riscv64::needs_jmp_table(r_type),
    }
}

impl Error {
    pub(crate) fn reloc_unsupported(r_type: u32) -> Error {
        Error::RelocUnsupported {
            r_type: r_type as usize,
        }
    }
}
