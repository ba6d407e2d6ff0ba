//! The live target process view (§3 `Process`, §4.C).

pub mod maps;
pub mod object_file;

use crate::error::{io_error, Result};
use crate::ptrace_driver::{self, MemIo, PtraceContext};
use maps::{ProtFlags, VmArea, VmHole};
use nix::unistd::Pid;
use object_file::ObjectFile;
use std::fs;

pub struct Process {
    pid: Pid,
    /// Held open for the whole operation as an advisory lock against task
    /// teardown (§5 "shared resources"); never read again after attach.
    _maps_lock: fs::File,
    mem: MemIo,
    areas: Vec<VmArea>,
    holes: Vec<VmHole>,
    objects: Vec<ObjectFile>,
    contexts: Vec<PtraceContext>,
    libc_base: u64,
    exe_path: String,
    cmdline: String,
}

impl Process {
    /// Attach to every thread of `pid` and build the initial VMA/hole/object
    /// view (§4.C, §4.D). `origin_insn_len`/`trampoline_len` come from the
    /// architecture the CLI was built for (§4.F) and are needed to parse any
    /// patch regions already present.
    pub fn attach(pid: i32, origin_insn_len: usize, trampoline_len: usize) -> Result<Self> {
        let pid = Pid::from_raw(pid);

        let maps_lock = fs::File::open(format!("/proc/{pid}/maps"))?;
        let maps_text = fs::read_to_string(format!("/proc/{pid}/maps"))?;
        let (areas, holes) = maps::parse(&maps_text, crate::arch::PAGE_SIZE as u64)?;

        let exe_path = fs::read_link(format!("/proc/{pid}/exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cmdline = fs::read_to_string(format!("/proc/{pid}/cmdline"))
            .unwrap_or_default()
            .replace('\0', " ")
            .trim()
            .to_string();

        let libc_base = areas
            .iter()
            .find(|a| a.prot.contains(ProtFlags::EXEC) && a.basename().is_some_and(|b| b.starts_with("libc")))
            .map(|a| a.start)
            .ok_or(crate::error::Error::LibcNotFound)?;

        let contexts = ptrace_driver::attach_all(pid)?;
        let mem = MemIo::open(pid)?;

        let objects = object_file::group(&areas, origin_insn_len, trampoline_len, |addr, len| {
            mem.read(addr, len)
        })?;

        log::info!(
            "attached to pid {pid}: {} threads, {} vmas, {} holes, {} objects, libc_base={:#x}",
            contexts.len(),
            areas.len(),
            holes.len(),
            objects.len(),
            libc_base,
        );

        Ok(Self {
            pid,
            _maps_lock: maps_lock,
            mem,
            areas,
            holes,
            objects,
            contexts,
            libc_base,
            exe_path,
            cmdline,
        })
    }

    /// Validate that `binary_path` is the inode actually mapped as `/proc/<pid>/exe`
    /// before any ptrace call is made (§4.C additions).
    pub fn check_binary_matches(&self, binary_path: &std::path::Path) -> Result<()> {
        let expected = fs::canonicalize(binary_path)?;
        let actual = fs::canonicalize(&self.exe_path)?;
        if expected != actual {
            return Err(io_error(format!(
                "--binary {} does not match the process's mapped executable {}",
                expected.display(),
                actual.display()
            )));
        }
        Ok(())
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn areas(&self) -> &[VmArea] {
        &self.areas
    }

    pub fn holes(&self) -> &[VmHole] {
        &self.holes
    }

    pub fn holes_mut(&mut self) -> &mut Vec<VmHole> {
        &mut self.holes
    }

    pub fn objects(&self) -> &[ObjectFile] {
        &self.objects
    }

    pub fn contexts(&self) -> &[PtraceContext] {
        &self.contexts
    }

    pub fn libc_base(&self) -> u64 {
        self.libc_base
    }

    pub fn exe_path(&self) -> &str {
        &self.exe_path
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn mem(&self) -> &MemIo {
        &self.mem
    }

    pub fn read_mem(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.mem.read(addr, len)
    }

    pub fn write_mem(&self, addr: u64, data: &[u8]) -> Result<()> {
        match self.mem.write(addr, data) {
            Ok(()) => Ok(()),
            Err(_) => self.mem.write_fallback_poke(self.pid, addr, data),
        }
    }

    /// Find the already-loaded object matching `(dev, inode)`, used to locate
    /// the target binary's own mapping among `self.objects()` (§4.B/§4.C).
    pub fn find_object_by_inode(&self, dev: (u32, u32), inode: u64) -> Option<&ObjectFile> {
        self.objects.iter().find(|o| {
            matches!(o.key, object_file::ObjectKey::Inode { dev: d, inode: i } if d == dev && i == inode)
        })
    }

    /// Re-read `/proc/<pid>/maps` and rebuild holes/objects, e.g. after a
    /// remote `mmap`/`munmap` changed the address space (§4.G).
    pub fn rescan(&mut self, origin_insn_len: usize, trampoline_len: usize) -> Result<()> {
        let maps_text = fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        let (areas, holes) = maps::parse(&maps_text, crate::arch::PAGE_SIZE as u64)?;
        let mem = &self.mem;
        let objects = object_file::group(&areas, origin_insn_len, trampoline_len, |addr, len| {
            mem.read(addr, len)
        })?;
        self.areas = areas;
        self.holes = holes;
        self.objects = objects;
        Ok(())
    }

    /// Detach every thread (§4.D). Consumes `self` since no further ptrace
    /// calls are valid afterward.
    pub fn detach(self) -> Result<()> {
        ptrace_driver::detach_all(&self.contexts)
    }

    /// Detach every thread without consuming `self` (§4.H retry): the target
    /// is free to run again until [`Process::attach_threads`] freezes it.
    pub fn detach_threads(&mut self) -> Result<()> {
        ptrace_driver::detach_all(&self.contexts)
    }

    /// Re-attach every thread after [`Process::detach_threads`] (§4.H retry).
    pub fn attach_threads(&mut self) -> Result<()> {
        self.contexts = ptrace_driver::attach_all(self.pid)?;
        Ok(())
    }
}
