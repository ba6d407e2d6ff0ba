//! `/proc/<pid>/maps` parsing: VMAs and the holes between them (§4.C).

use crate::error::{malformed_elf, Result};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const EXEC  = 0b100;
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmArea {
    pub start: u64,
    pub end: u64,
    pub prot: ProtFlags,
    pub shared: bool,
    pub offset: u64,
    pub dev: (u32, u32),
    pub inode: u64,
    /// Full pathname field (§4.C additions), `None` for anonymous mappings.
    pub path: Option<String>,
}

impl VmArea {
    pub fn is_anonymous(&self) -> bool {
        self.path.is_none()
    }

    /// `/proc/<pid>/maps` basename, used to find `libc_base` and to group
    /// VMAs by originating library when no inode match is available.
    pub fn basename(&self) -> Option<&str> {
        self.path
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
    }
}

/// A gap between two consecutive VMAs, shrunk by one guard page on each side
/// (§3 invariant, Design Notes §9 "vm_hole_split" minimum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmHole {
    pub start: u64,
    pub end: u64,
}

impl VmHole {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse the full text of `/proc/<pid>/maps` into its VMAs and the VmHoles
/// between consecutive VMAs whose gap exceeds two guard pages (§4.C,
/// testable property 3). Anonymous VMAs get `path = None`; everything else
/// keeps the full pathname field, not just its basename (§4.C additions).
pub fn parse(text: &str, page_size: u64) -> Result<(Vec<VmArea>, Vec<VmHole>)> {
    let mut areas = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        areas.push(parse_line(line).map_err(|e| {
            malformed_elf(format!("/proc/<pid>/maps line {}: {e}", lineno + 1))
        })?);
    }
    areas.sort_by_key(|a| a.start);

    let guard = page_size;
    let mut holes = Vec::new();
    for pair in areas.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let gap = b.start.saturating_sub(a.end);
        if gap > 2 * guard {
            holes.push(VmHole {
                start: a.end + guard,
                end: b.start - guard,
            });
        }
    }
    Ok((areas, holes))
}

fn parse_line(line: &str) -> std::result::Result<VmArea, String> {
    let mut fields = line.splitn(6, ' ').filter(|f| !f.is_empty());
    let range = fields.next().ok_or("missing address range")?;
    let perms = fields.next().ok_or("missing perms")?;
    let offset = fields.next().ok_or("missing offset")?;
    let dev = fields.next().ok_or("missing dev")?;
    let inode = fields.next().ok_or("missing inode")?;
    let rest = fields.next().unwrap_or("").trim_start();

    let (start_s, end_s) = range.split_once('-').ok_or("bad address range")?;
    let start = u64::from_str_radix(start_s, 16).map_err(|e| e.to_string())?;
    let end = u64::from_str_radix(end_s, 16).map_err(|e| e.to_string())?;

    let mut prot = ProtFlags::empty();
    let perm_bytes = perms.as_bytes();
    if perm_bytes.first() == Some(&b'r') {
        prot |= ProtFlags::READ;
    }
    if perm_bytes.get(1) == Some(&b'w') {
        prot |= ProtFlags::WRITE;
    }
    if perm_bytes.get(2) == Some(&b'x') {
        prot |= ProtFlags::EXEC;
    }
    let shared = perm_bytes.get(3) == Some(&b's');

    let offset = u64::from_str_radix(offset, 16).map_err(|e| e.to_string())?;

    let (maj, min) = dev.split_once(':').ok_or("bad dev field")?;
    let dev = (
        u32::from_str_radix(maj, 16).map_err(|e| e.to_string())?,
        u32::from_str_radix(min, 16).map_err(|e| e.to_string())?,
    );
    let inode: u64 = inode.parse().map_err(|_| "bad inode field".to_string())?;

    let path = if rest.is_empty() || inode == 0 && !rest.starts_with('/') {
        None
    } else {
        Some(rest.to_string())
    };

    Ok(VmArea {
        start,
        end,
        prot,
        shared,
        offset,
        dev,
        inode,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
00400000-00401000 r-xp 00000000 08:01 131 /usr/bin/cat
00600000-00601000 rw-p 00000000 08:01 131 /usr/bin/cat
7f0000000000-7f0000021000 r-xp 00000000 08:01 9001 /usr/lib/libc.so.6
7fffaaaa0000-7fffaaaa1000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn parses_all_lines() {
        let (areas, _) = parse(SAMPLE, 0x1000).unwrap();
        assert_eq!(areas.len(), 4);
        assert_eq!(areas[0].start, 0x00400000);
        assert!(areas[0].prot.contains(ProtFlags::EXEC));
        assert_eq!(areas[0].path.as_deref(), Some("/usr/bin/cat"));
    }

    #[test]
    fn finds_hole_between_large_gap() {
        let (_, holes) = parse(SAMPLE, 0x1000).unwrap();
        // gap between 0x601000 and 0x7f0000000000 is enormous.
        assert_eq!(holes.len(), 1);
        assert_eq!(holes[0].start, 0x601000 + 0x1000);
        assert_eq!(holes[0].end, 0x7f0000000000 - 0x1000);
    }

    #[test]
    fn idempotent_scan() {
        let (a1, h1) = parse(SAMPLE, 0x1000).unwrap();
        let (a2, h2) = parse(SAMPLE, 0x1000).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(h1, h2);
    }

    #[test]
    fn no_hole_for_small_gap() {
        let text = "\
00400000-00401000 r-xp 00000000 08:01 131 /usr/bin/cat
00402000-00403000 rw-p 00000000 08:01 131 /usr/bin/cat
";
        let (_, holes) = parse(text, 0x1000).unwrap();
        assert!(holes.is_empty());
    }
}
