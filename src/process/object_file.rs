//! Object-file grouping and the in-target info block (§3, §4.C, §6).
//!
//! `ObjectFile` groups VMAs that map the same `(dev,inode)` (or the same
//! anonymous label) into one entity; `AppliedPatch`/`PatchFunc` are
//! reconstructed by reading the `"UPATCH\0"`-prefixed info block a prior
//! `patch` call left in the target's memory.

use super::maps::VmArea;
use crate::error::{malformed_elf, Result};
use std::collections::BTreeMap;

pub const INFO_MAGIC: &[u8; 7] = b"UPATCH\0";
const UUID_FIELD_LEN: usize = 41;
/// `magic(7) + id(41) + size(8) + start(8) + end(8) + changed_func_num(4)`.
pub const INFO_HEADER_LEN: usize = 7 + UUID_FIELD_LEN + 8 + 8 + 8 + 4;

#[derive(Debug, Clone)]
pub struct InfoHeader {
    pub id: String,
    pub size: u64,
    pub start: u64,
    pub end: u64,
    pub changed_func_num: u32,
}

impl InfoHeader {
    pub fn to_bytes(&self) -> [u8; INFO_HEADER_LEN] {
        let mut buf = [0u8; INFO_HEADER_LEN];
        buf[0..7].copy_from_slice(INFO_MAGIC);
        let id_bytes = self.id.as_bytes();
        let n = id_bytes.len().min(UUID_FIELD_LEN - 1);
        buf[7..7 + n].copy_from_slice(&id_bytes[..n]);
        let mut off = 7 + UUID_FIELD_LEN;
        buf[off..off + 8].copy_from_slice(&self.size.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.start.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.end.to_le_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.changed_func_num.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < INFO_HEADER_LEN || &buf[0..7] != INFO_MAGIC {
            return Err(malformed_elf("info block magic mismatch"));
        }
        let id_bytes = &buf[7..7 + UUID_FIELD_LEN];
        let nul = id_bytes.iter().position(|&b| b == 0).unwrap_or(id_bytes.len());
        let id = String::from_utf8_lossy(&id_bytes[..nul]).into_owned();
        let mut off = 7 + UUID_FIELD_LEN;
        let size = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let start = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let end = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let changed_func_num = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(Self {
            id,
            size,
            start,
            end,
            changed_func_num,
        })
    }
}

/// One replaced function, as recorded in the info block (§3 `PatchFunc`).
#[derive(Debug, Clone)]
pub struct PatchFunc {
    pub name: String,
    pub old_addr: u64,
    pub new_addr: u64,
    pub old_size: u64,
    pub new_size: u64,
    /// Saved original prologue bytes, length = `Arch::origin_insn_len()`.
    pub old_insn: Vec<u8>,
    /// The trampoline bytes written over `old_addr` (§4.I).
    pub new_insn: Vec<u8>,
}

/// A previously-applied patch, reconstructed from a memory scan (§3, §4.C).
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    pub uuid: String,
    pub start: u64,
    pub end: u64,
    pub changed_func_num: u32,
    pub funcs: Vec<PatchFunc>,
}

impl AppliedPatch {
    /// Parse an `AppliedPatch` out of the bytes of one anonymous VMA that
    /// begins with [`INFO_MAGIC`] (§4.C). `bytes` must cover at least the
    /// info header, the name blob, and the fixed-size func records;
    /// `origin_insn_len`/`trampoline_len` come from the architecture that
    /// produced the patch (recoverable from the running binary's own arch).
    pub fn parse(bytes: &[u8], origin_insn_len: usize, trampoline_len: usize) -> Result<Self> {
        let header = InfoHeader::from_bytes(bytes)?;
        let mut off = INFO_HEADER_LEN;

        let mut names = Vec::with_capacity(header.changed_func_num as usize);
        for _ in 0..header.changed_func_num {
            let tail = bytes
                .get(off..)
                .ok_or_else(|| malformed_elf("info block truncated in name blob"))?;
            let nul = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| malformed_elf("unterminated name in info block"))?;
            names.push(String::from_utf8_lossy(&tail[..nul]).into_owned());
            off += nul + 1;
        }

        let record_len = 8 * 4 + origin_insn_len + trampoline_len;
        let mut funcs = Vec::with_capacity(header.changed_func_num as usize);
        for name in names {
            let rec = bytes
                .get(off..off + record_len)
                .ok_or_else(|| malformed_elf("info block truncated in func records"))?;
            let old_addr = u64::from_le_bytes(rec[0..8].try_into().unwrap());
            let new_addr = u64::from_le_bytes(rec[8..16].try_into().unwrap());
            let old_size = u64::from_le_bytes(rec[16..24].try_into().unwrap());
            let new_size = u64::from_le_bytes(rec[24..32].try_into().unwrap());
            let old_insn = rec[32..32 + origin_insn_len].to_vec();
            let new_insn = rec[32 + origin_insn_len..record_len].to_vec();
            funcs.push(PatchFunc {
                name,
                old_addr,
                new_addr,
                old_size,
                new_size,
                old_insn,
                new_insn,
            });
            off += record_len;
        }

        Ok(Self {
            uuid: header.id,
            start: header.start,
            end: header.end,
            changed_func_num: header.changed_func_num,
            funcs,
        })
    }

    /// Serialize back into the wire layout described in `spec.md` §6.
    pub fn to_bytes(&self, origin_insn_len: usize, trampoline_len: usize) -> Vec<u8> {
        let names_len: usize = self.funcs.iter().map(|f| f.name.len() + 1).sum();
        let record_len = 8 * 4 + origin_insn_len + trampoline_len;
        let mut out = Vec::with_capacity(INFO_HEADER_LEN + names_len + record_len * self.funcs.len());

        let header = InfoHeader {
            id: self.uuid.clone(),
            size: (INFO_HEADER_LEN + names_len + record_len * self.funcs.len()) as u64,
            start: self.start,
            end: self.end,
            changed_func_num: self.changed_func_num,
        };
        out.extend_from_slice(&header.to_bytes());
        for f in &self.funcs {
            out.extend_from_slice(f.name.as_bytes());
            out.push(0);
        }
        for f in &self.funcs {
            out.extend_from_slice(&f.old_addr.to_le_bytes());
            out.extend_from_slice(&f.new_addr.to_le_bytes());
            out.extend_from_slice(&f.old_size.to_le_bytes());
            out.extend_from_slice(&f.new_size.to_le_bytes());
            let mut old_insn = f.old_insn.clone();
            old_insn.resize(origin_insn_len, 0);
            out.extend_from_slice(&old_insn);
            let mut new_insn = f.new_insn.clone();
            new_insn.resize(trampoline_len, 0);
            out.extend_from_slice(&new_insn);
        }
        out
    }
}

/// What one group of same-origin VMAs represents (§3 `ObjectFile`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKey {
    Inode { dev: (u32, u32), inode: u64 },
    Named(String),
    Anonymous(usize),
}

#[derive(Debug, Clone)]
pub struct ObjectFile {
    pub key: ObjectKey,
    pub is_patch: bool,
    pub is_elf: bool,
    pub vmas: Vec<VmArea>,
    pub applied_patch: Option<AppliedPatch>,
}

/// Group `areas` into [`ObjectFile`]s by `(dev,inode)` (or by name for
/// anonymous mappings, per §4.C), detecting already-applied patches via
/// `read_prefix`, a callback reading up to `len` bytes of target memory
/// starting at a VMA's `start` (backed by `/proc/<pid>/mem` in production,
/// a synthetic byte slice in tests).
pub fn group(
    areas: &[VmArea],
    origin_insn_len: usize,
    trampoline_len: usize,
    mut read_prefix: impl FnMut(u64, usize) -> Result<Vec<u8>>,
) -> Result<Vec<ObjectFile>> {
    let mut by_key: BTreeMap<ObjectKey, ObjectFile> = BTreeMap::new();
    let mut anon_counter = 0usize;

    for area in areas {
        let key = if area.inode != 0 {
            ObjectKey::Inode {
                dev: area.dev,
                inode: area.inode,
            }
        } else if let Some(path) = &area.path {
            ObjectKey::Named(path.clone())
        } else {
            anon_counter += 1;
            ObjectKey::Anonymous(anon_counter)
        };

        let entry = by_key.entry(key.clone()).or_insert_with(|| ObjectFile {
            key: key.clone(),
            is_patch: false,
            is_elf: false,
            vmas: Vec::new(),
            applied_patch: None,
        });

        if area.is_anonymous() && area.prot.contains(super::maps::ProtFlags::READ) {
            let prefix = read_prefix(area.start, INFO_HEADER_LEN.max(7))?;
            if prefix.len() >= 7 && &prefix[0..7] == INFO_MAGIC {
                entry.is_patch = true;
                let full = read_prefix(area.start, (area.end - area.start) as usize)?;
                entry.applied_patch =
                    Some(AppliedPatch::parse(&full, origin_insn_len, trampoline_len)?);
            }
        }
        if !entry.is_patch {
            let magic = read_prefix(area.start, 4).unwrap_or_default();
            if magic.len() == 4 && magic == [0x7f, b'E', b'L', b'F'] {
                entry.is_elf = true;
            }
        }

        entry.vmas.push(area.clone());
    }

    Ok(by_key.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_patch() -> AppliedPatch {
        AppliedPatch {
            uuid: "f".repeat(40),
            start: 0x7f0000000000,
            end: 0x7f0000010000,
            changed_func_num: 1,
            funcs: vec![PatchFunc {
                name: "do_work".to_string(),
                old_addr: 0x401000,
                new_addr: 0x7f0000000100,
                old_size: 32,
                new_size: 48,
                old_insn: vec![0x90; 14],
                new_insn: vec![0xff; 14],
            }],
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let patch = sample_patch();
        let bytes = patch.to_bytes(14, 14);
        let parsed = AppliedPatch::parse(&bytes, 14, 14).unwrap();
        assert_eq!(parsed.uuid, patch.uuid);
        assert_eq!(parsed.funcs.len(), 1);
        assert_eq!(parsed.funcs[0].name, "do_work");
        assert_eq!(parsed.funcs[0].old_addr, 0x401000);
    }
}
