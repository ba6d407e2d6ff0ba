//! Executing one syscall inside the target by hijacking a thread's
//! registers and running a two-instruction stub at `libc_base` (§4.D).

use super::{cont_and_wait, get_regs, set_regs, MemIo};
use crate::arch::{self, Arch, MAX_ERRNO};
use crate::error::{memory_map_error, Result};
use nix::unistd::Pid;

/// Run one remote syscall on `pid`'s first attached thread, using `libc_base`
/// as scratch space for the stub. Restores the thread's registers and the
/// overwritten bytes before returning, whether or not the call succeeded.
pub fn exec_remote(
    pid: Pid,
    mem: &MemIo,
    arch: Arch,
    libc_base: u64,
    nr: u64,
    args: [u64; 6],
) -> Result<i64> {
    let stub = arch::syscall_stub(arch);
    let saved_regs = get_regs(pid)?;
    let saved_bytes = mem.read(libc_base, stub.len())?;

    mem.write(libc_base, stub)?;

    let mut regs = saved_regs;
    regs.pc = libc_base;
    regs.sp = saved_regs.sp;
    regs.set_syscall(nr, args);
    set_regs(pid, &regs)?;

    let result = (|| -> Result<i64> {
        cont_and_wait(pid)?;
        let after = get_regs(pid)?;
        Ok(after.syscall_ret())
    })();

    // Restore regardless of whether the call above succeeded.
    mem.write(libc_base, &saved_bytes)?;
    set_regs(pid, &saved_regs)?;

    let ret = result?;
    if (-MAX_ERRNO..0).contains(&ret) {
        return Err(memory_map_error("remote syscall", ret));
    }
    Ok(ret)
}

pub fn mmap_remote(
    pid: Pid,
    mem: &MemIo,
    arch: Arch,
    libc_base: u64,
    addr: u64,
    len: u64,
    prot: i32,
    flags: i32,
) -> Result<u64> {
    let nr = mmap_nr(arch);
    let ret = exec_remote(
        pid,
        mem,
        arch,
        libc_base,
        nr,
        [addr, len, prot as u64, flags as u64, u64::MAX, 0],
    )?;
    Ok(ret as u64)
}

pub fn mprotect_remote(
    pid: Pid,
    mem: &MemIo,
    arch: Arch,
    libc_base: u64,
    addr: u64,
    len: u64,
    prot: i32,
) -> Result<()> {
    let nr = mprotect_nr(arch);
    exec_remote(pid, mem, arch, libc_base, nr, [addr, len, prot as u64, 0, 0, 0])?;
    Ok(())
}

pub fn munmap_remote(
    pid: Pid,
    mem: &MemIo,
    arch: Arch,
    libc_base: u64,
    addr: u64,
    len: u64,
) -> Result<()> {
    let nr = munmap_nr(arch);
    exec_remote(pid, mem, arch, libc_base, nr, [addr, len, 0, 0, 0, 0])?;
    Ok(())
}

fn mmap_nr(arch: Arch) -> u64 {
    match arch {
        Arch::X86_64 => libc::SYS_mmap as u64,
        Arch::Aarch64 => libc::SYS_mmap as u64,
        Arch::Riscv64 => libc::SYS_mmap as u64,
    }
}

fn mprotect_nr(arch: Arch) -> u64 {
    match arch {
        Arch::X86_64 => libc::SYS_mprotect as u64,
        Arch::Aarch64 => libc::SYS_mprotect as u64,
        Arch::Riscv64 => libc::SYS_mprotect as u64,
    }
}

fn munmap_nr(arch: Arch) -> u64 {
    match arch {
        Arch::X86_64 => libc::SYS_munmap as u64,
        Arch::Aarch64 => libc::SYS_munmap as u64,
        Arch::Riscv64 => libc::SYS_munmap as u64,
    }
}
