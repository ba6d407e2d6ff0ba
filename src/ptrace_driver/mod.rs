//! Remote process control via `ptrace` (§4.D).
//!
//! Built on `nix::sys::ptrace`/`::wait`/`::signal` and `nix::unistd`, the
//! same crate the pack's own ptrace-driving code (remote-syscall shims,
//! process tracers) reaches for instead of raw `libc::ptrace` calls.

pub mod remote_syscall;

use crate::arch::Registers;
use crate::error::{io_error, Result};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

pub const MAX_ATTACH_ATTEMPTS: u32 = crate::arch::MAX_ATTACH_ATTEMPTS;

/// One traced thread (§3 `PtraceContext`).
#[derive(Debug)]
pub struct PtraceContext {
    pub pid: Pid,
    pub running: bool,
}

/// Attach every thread of `pid`, re-scanning `/proc/<pid>/task` up to
/// [`MAX_ATTACH_ATTEMPTS`] times to pick up threads spawned mid-attach.
pub fn attach_all(pid: Pid) -> Result<Vec<PtraceContext>> {
    let mut attached: Vec<PtraceContext> = Vec::new();

    for attempt in 0..MAX_ATTACH_ATTEMPTS {
        let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
        let tids: Vec<Pid> = fs::read_dir(&task_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect();

        let mut any_new = false;
        for tid in tids {
            if attached.iter().any(|c| c.pid == tid) {
                continue;
            }
            match ptrace::attach(tid) {
                Ok(()) => {
                    wait_for_stop(tid)?;
                    attached.push(PtraceContext {
                        pid: tid,
                        running: false,
                    });
                    any_new = true;
                }
                Err(nix::Error::ESRCH) => {
                    // Thread exited between the directory scan and attach.
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        log::debug!(
            "ptrace attach pass {}/{}: {} threads attached",
            attempt + 1,
            MAX_ATTACH_ATTEMPTS,
            attached.len()
        );
        if !any_new && attempt > 0 {
            break;
        }
    }

    if attached.is_empty() {
        return Err(io_error(format!("no threads attached for pid {pid}")));
    }
    Ok(attached)
}

fn wait_for_stop(pid: Pid) -> Result<()> {
    match waitpid(pid, None) {
        Ok(WaitStatus::Stopped(_, _)) => Ok(()),
        Ok(other) => Err(io_error(format!(
            "unexpected wait status while attaching to {pid}: {other:?}"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Detach every context; if a thread has already exited (`ESRCH`) and was
/// previously known-stopped, wait for it to finish exiting (§4.D).
pub fn detach_all(contexts: &[PtraceContext]) -> Result<()> {
    for ctx in contexts {
        match ptrace::detach(ctx.pid, None) {
            Ok(()) => {}
            Err(nix::Error::ESRCH) => {
                let _ = waitpid(ctx.pid, None);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub fn get_regs(pid: Pid) -> Result<Registers> {
    let raw = ptrace::getregs(pid)?;
    Ok(from_user_regs(&raw))
}

pub fn set_regs(pid: Pid, regs: &Registers) -> Result<()> {
    let mut raw = ptrace::getregs(pid)?;
    into_user_regs(regs, &mut raw);
    ptrace::setregs(pid, raw)?;
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn from_user_regs(raw: &libc::user_regs_struct) -> Registers {
    Registers {
        pc: raw.rip,
        sp: raw.rsp,
        syscall: [raw.rax, raw.rdi, raw.rsi, raw.rdx, raw.r10, raw.r8, raw.r9],
    }
}

#[cfg(target_arch = "x86_64")]
fn into_user_regs(regs: &Registers, raw: &mut libc::user_regs_struct) {
    raw.rip = regs.pc;
    raw.rsp = regs.sp;
    raw.rax = regs.syscall[0];
    raw.rdi = regs.syscall[1];
    raw.rsi = regs.syscall[2];
    raw.rdx = regs.syscall[3];
    raw.r10 = regs.syscall[4];
    raw.r8 = regs.syscall[5];
    raw.r9 = regs.syscall[6];
}

#[cfg(target_arch = "aarch64")]
fn from_user_regs(raw: &libc::user_regs_struct) -> Registers {
    Registers {
        pc: raw.pc,
        sp: raw.sp,
        syscall: [
            raw.regs[8],
            raw.regs[0],
            raw.regs[1],
            raw.regs[2],
            raw.regs[3],
            raw.regs[4],
            raw.regs[5],
        ],
    }
}

#[cfg(target_arch = "aarch64")]
fn into_user_regs(regs: &Registers, raw: &mut libc::user_regs_struct) {
    raw.pc = regs.pc;
    raw.sp = regs.sp;
    raw.regs[8] = regs.syscall[0];
    for (i, v) in regs.syscall[1..].iter().enumerate() {
        raw.regs[i] = *v;
    }
}

#[cfg(target_arch = "riscv64")]
fn from_user_regs(raw: &libc::user_regs_struct) -> Registers {
    Registers {
        pc: raw.pc,
        sp: raw.sp,
        syscall: [
            raw.a7, raw.a0, raw.a1, raw.a2, raw.a3, raw.a4, raw.a5,
        ],
    }
}

#[cfg(target_arch = "riscv64")]
fn into_user_regs(regs: &Registers, raw: &mut libc::user_regs_struct) {
    raw.pc = regs.pc;
    raw.sp = regs.sp;
    raw.a7 = regs.syscall[0];
    raw.a0 = regs.syscall[1];
    raw.a1 = regs.syscall[2];
    raw.a2 = regs.syscall[3];
    raw.a3 = regs.syscall[4];
    raw.a4 = regs.syscall[5];
    raw.a5 = regs.syscall[6];
}

/// Continue `pid` and block until it stops again on `SIGTRAP` or `SIGSTOP`.
pub fn cont_and_wait(pid: Pid) -> Result<()> {
    ptrace::cont(pid, None)?;
    loop {
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP | Signal::SIGSTOP) => return Ok(()),
            WaitStatus::Stopped(_, _) => continue,
            other => {
                return Err(io_error(format!(
                    "unexpected wait status while continuing {pid}: {other:?}"
                )))
            }
        }
    }
}

/// Read-only handle onto `/proc/<pid>/mem`, opened once and held for the
/// duration of an operation (§4.D, §5 "shared resources").
pub struct MemIo {
    file: File,
}

impl MemIo {
    pub fn open(pid: Pid) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))?;
        Ok(Self { file })
    }

    /// Always via `pread(/proc/<pid>/mem)` (§4.D).
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, addr)?;
        Ok(buf)
    }

    /// Prefer `pwrite(/proc/<pid>/mem)`; callers fall back to
    /// `PTRACE_POKEDATA` word-by-word only if this returns `EINVAL` (some
    /// kernels refuse writes to certain mapping types through `/proc/mem`).
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        match self.file.write_all_at(data, addr) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Err(e.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_fallback_poke(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let word_addr = addr + offset as u64;
            let remaining = data.len() - offset;
            let word = if remaining >= 8 {
                let existing = 0u64;
                let mut bytes = existing.to_ne_bytes();
                bytes.copy_from_slice(&data[offset..offset + 8]);
                u64::from_ne_bytes(bytes)
            } else {
                let mut existing = ptrace::read(pid, word_addr as *mut std::ffi::c_void)? as u64;
                let existing_bytes = existing.to_ne_bytes();
                let mut bytes = existing_bytes;
                bytes[..remaining].copy_from_slice(&data[offset..]);
                existing = u64::from_ne_bytes(bytes);
                existing
            };
            unsafe {
                ptrace::write(
                    pid,
                    word_addr as *mut std::ffi::c_void,
                    word as i64 as *mut std::ffi::c_void,
                )?;
            }
            offset += 8;
        }
        Ok(())
    }
}
