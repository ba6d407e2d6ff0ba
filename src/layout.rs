//! Patch layout computation and VM-hole placement (§4.G).

use crate::arch::{page_align_up, MAX_DISTANCE, PAGE_SIZE};
use crate::elf_model::PatchObject;
use crate::error::{Error, Result};
use crate::process::maps::{ProtFlags, VmArea, VmHole};
use elf::abi::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS};
use std::collections::HashMap;

/// Explicit replacement for the teacher's `sh_addr`/`sh_addralign`
/// scratch-field reuse (`SPEC_FULL.md` §3): the staging-side (local) and
/// remote (target-side) addresses one `SHF_ALLOC` section was placed at.
#[derive(Debug, Clone, Copy)]
pub struct PlacedSection {
    pub staging: usize,
    pub remote: u64,
    pub len: u64,
    pub is_nobits: bool,
}

#[derive(Debug, Default)]
pub struct Layout {
    pub jmp_table_offset: usize,
    pub text_size: usize,
    pub ro_size: usize,
    pub ro_after_init_size: usize,
    pub rw_offset: usize,
    pub tail_offset: usize,
    pub symtab_offset: usize,
    pub info_offset: usize,
    pub total_size: usize,
    /// Keyed by section header index within the patch object.
    pub sections: HashMap<usize, PlacedSection>,
}

/// `RO_AFTER_INIT` has no stable cross-distro ELF section-flag constant in
/// the `elf` crate's `abi` module; GCC/glibc define it with bit `0x0020` in
/// the section's custom flags for this pipeline's patch objects.
const SHF_RO_AFTER_INIT: u64 = 0x0020;

/// Compute the five-pass contiguous layout (§4.G) for every `SHF_ALLOC`
/// section of `patch`, reserving `jmp_table_len` bytes ahead of text.
pub fn compute(patch: &PatchObject, jmp_table_len: usize) -> Result<Layout> {
    let elf = patch.elf();
    let shdrs = elf
        .section_headers()
        .ok_or_else(|| Error::MalformedElf {
            msg: "patch object has no section headers".into(),
        })?;

    let mut layout = Layout::default();
    let mut offset = page_align_up(jmp_table_len);
    layout.jmp_table_offset = 0;

    // Passes in priority order: (predicate, pass name for logging).
    let passes: [(fn(u64) -> bool, &str); 5] = [
        (
            |f| f & (SHF_ALLOC | SHF_EXECINSTR) == (SHF_ALLOC | SHF_EXECINSTR),
            "text",
        ),
        (|f| f & SHF_ALLOC != 0 && f & SHF_WRITE == 0, "rodata"),
        (
            |f| f & (SHF_RO_AFTER_INIT | SHF_ALLOC) == (SHF_RO_AFTER_INIT | SHF_ALLOC),
            "ro_after_init",
        ),
        (|f| f & (SHF_ALLOC | SHF_WRITE) == (SHF_ALLOC | SHF_WRITE), "rw"),
        (|f| f & SHF_ALLOC != 0, "remaining"),
    ];

    let mut placed: Vec<bool> = vec![false; shdrs.len()];
    for (pass_idx, (pred, name)) in passes.iter().enumerate() {
        let pass_start = offset;
        for (idx, shdr) in shdrs.iter().enumerate() {
            if placed[idx] || shdr.sh_flags & SHF_ALLOC == 0 || !pred(shdr.sh_flags) {
                continue;
            }
            let align = shdr.sh_addralign.max(1) as usize;
            offset = (offset + align - 1) & !(align - 1);
            layout.sections.insert(
                idx,
                PlacedSection {
                    staging: offset,
                    remote: 0, // filled in once a hole is chosen
                    len: shdr.sh_size,
                    is_nobits: shdr.sh_type == SHT_NOBITS,
                },
            );
            offset += shdr.sh_size as usize;
            placed[idx] = true;
        }
        offset = page_align_up(offset);
        log::debug!("layout pass {pass_idx} ({name}): ends at offset {offset:#x}");
        match pass_idx {
            0 => layout.text_size = offset - layout.jmp_table_offset,
            1 => layout.ro_size = offset - pass_start,
            2 => layout.ro_after_init_size = offset - pass_start,
            3 => layout.rw_offset = pass_start,
            4 => layout.tail_offset = pass_start,
            _ => unreachable!(),
        }
    }

    // `.symtab`/`.strtab` are never copied into the remote region (they
    // aren't `SHF_ALLOC`), so the info block must start immediately after
    // the tail pass with no gap — object_file::group's scan depends on the
    // info block's magic bytes landing exactly at a VMA's start address.
    layout.symtab_offset = offset;
    layout.info_offset = offset;
    layout.total_size = page_align_up(offset + 4096); // info block upper bound, refined once func count is known

    Ok(layout)
}

/// Scan `holes` outward from the hole preceding `anchor_areas`' code, per
/// §4.G "Placement": a hole is acceptable once its page-aligned start, plus
/// `size`, plus one guard page on each side (Design Notes §9's explicit
/// minimum — holes smaller than this are rejected rather than left to
/// undefined splitting behavior), lies within `MAX_DISTANCE` of some
/// executable VMA of the target.
pub fn find_hole(holes: &[VmHole], areas: &[VmArea], size: u64) -> Result<u64> {
    let guard = PAGE_SIZE as u64;
    let exec_areas: Vec<&VmArea> = areas.iter().filter(|a| a.prot.contains(ProtFlags::EXEC)).collect();
    if exec_areas.is_empty() {
        return Err(Error::NoPatchRegion);
    }

    for hole in holes {
        if hole.len() < size + 2 * guard {
            continue;
        }
        let start = page_align_up(hole.start as usize) as u64;
        let end = start + size;
        if end + guard > hole.end {
            continue;
        }
        for vma in &exec_areas {
            let within = |a: u64, b: u64| a.abs_diff(b) <= MAX_DISTANCE;
            if within(start, vma.start) || within(end, vma.end) {
                return Ok(start);
            }
        }
    }
    Err(Error::NoPatchRegion)
}

/// Split `hole` around a newly placed `[placed_start, placed_start+len)`
/// region, shrinking by one guard page on each side (§3 VmHole invariant).
/// Returns `(left_remainder, right_remainder)`; either side can be `None`
/// if it would be empty or smaller than one guard page.
pub fn split_hole(hole: VmHole, placed_start: u64, placed_len: u64) -> (Option<VmHole>, Option<VmHole>) {
    let guard = PAGE_SIZE as u64;
    let left = if placed_start > hole.start + guard {
        Some(VmHole {
            start: hole.start,
            end: placed_start - guard,
        })
    } else {
        None
    };
    let placed_end = placed_start + placed_len;
    let right = if hole.end > placed_end + guard {
        Some(VmHole {
            start: placed_end + guard,
            end: hole.end,
        })
    } else {
        None
    };
    (left, right)
}

/// Final protection flags per region kind (§4.G "Post").
pub fn final_prot(region: &str) -> i32 {
    match region {
        "text" => libc::PROT_READ | libc::PROT_EXEC,
        "ro" | "ro_after_init" | "tail" | "info" => libc::PROT_READ,
        "rw" => libc::PROT_READ | libc::PROT_WRITE,
        other => unreachable!("unknown layout region {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(start: u64, end: u64, exec: bool) -> VmArea {
        VmArea {
            start,
            end,
            prot: if exec { ProtFlags::READ | ProtFlags::EXEC } else { ProtFlags::READ },
            shared: false,
            offset: 0,
            dev: (0, 0),
            inode: 1,
            path: Some("/bin/x".to_string()),
        }
    }

    #[test]
    fn finds_hole_within_distance() {
        let areas = vec![area(0x400000, 0x401000, true)];
        let holes = vec![VmHole {
            start: 0x500000,
            end: 0x600000,
        }];
        let addr = find_hole(&holes, &areas, 0x1000).unwrap();
        assert!(addr >= 0x500000 && addr < 0x600000);
    }

    #[test]
    fn rejects_hole_too_far_away() {
        let areas = vec![area(0x400000, 0x401000, true)];
        let far = 0x400000u64 + MAX_DISTANCE * 2;
        let holes = vec![VmHole {
            start: far,
            end: far + 0x10000,
        }];
        assert!(find_hole(&holes, &areas, 0x1000).is_err());
    }

    #[test]
    fn rejects_hole_smaller_than_guard_minimum() {
        let areas = vec![area(0x400000, 0x401000, true)];
        let holes = vec![VmHole {
            start: 0x500000,
            end: 0x500000 + PAGE_SIZE as u64, // too small once size+2*guard required
        }];
        assert!(find_hole(&holes, &areas, 0x1000).is_err());
    }
}
