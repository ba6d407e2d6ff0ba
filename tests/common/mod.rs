#![allow(dead_code)]

//! Shared fixture-building helpers for the integration tests, mirroring the
//! teacher's own `tests/common/mod.rs`. Where the teacher loads real `.so`
//! files built by its `gen_relocs`/`gen-elf` tools, these tests need a
//! dynamic-symbol-table-bearing target ELF small enough to hand-encode
//! directly at the byte level — the resolver (`spec.md` §4.E) only ever
//! reads `.dynsym`/`.dynstr`/`.rela.dyn`/`.rela.plt`/`.symtab`, so a minimal
//! buffer carrying exactly those sections exercises it faithfully.

use std::io::Write;
use std::path::PathBuf;

pub fn get_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("upatch_manage_test_{}_{}", std::process::id(), name));
    p
}

pub fn write_temp_file(name: &str, bytes: &[u8]) -> PathBuf {
    let path = get_path(name);
    let mut f = std::fs::File::create(&path).expect("create temp fixture file");
    f.write_all(bytes).expect("write temp fixture file");
    path
}

const SHT_NULL: u32 = 0;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_DYNSYM: u32 = 11;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;

fn elf64_sym(name_off: u32, info: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&name_off.to_le_bytes());
    buf.push(info);
    buf.push(0); // st_other
    buf.extend_from_slice(&shndx.to_le_bytes());
    buf.extend_from_slice(&value.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf
}

fn elf64_rela(r_offset: u64, r_sym: u32, r_type: u32, r_addend: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&r_offset.to_le_bytes());
    let r_info = ((r_sym as u64) << 32) | r_type as u64;
    buf.extend_from_slice(&r_info.to_le_bytes());
    buf.extend_from_slice(&r_addend.to_le_bytes());
    buf
}

fn shdr(
    name_off: u32,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&name_off.to_le_bytes());
    buf.extend_from_slice(&sh_type.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&link.to_le_bytes());
    buf.extend_from_slice(&info.to_le_bytes());
    buf.extend_from_slice(&addralign.to_le_bytes());
    buf.extend_from_slice(&entsize.to_le_bytes());
    buf
}

/// One symbol the synthetic target exposes via `.dynsym`, optionally paired
/// with a `.rela.dyn`/`.rela.plt` entry pointing at it (resolver tiers 1–3).
pub struct DynSymSpec {
    pub name: &'static str,
    pub value: u64,
    pub is_func: bool,
}

pub enum RelaKind {
    Dyn,
    Plt,
}

/// Build a minimal `ET_DYN` ELF carrying only `.dynsym`/`.dynstr` and,
/// optionally, one `.rela.dyn` or `.rela.plt` entry referencing `syms[0]`
/// (resolver tiers 1–3, §4.E).
pub fn build_dyn_target(syms: &[DynSymSpec], rela: Option<(RelaKind, u32)>) -> Vec<u8> {
    // .dynstr: leading NUL + each symbol name, NUL-terminated.
    let mut dynstr = vec![0u8];
    let mut name_offsets = Vec::with_capacity(syms.len());
    for s in syms {
        name_offsets.push(dynstr.len() as u32);
        dynstr.extend_from_slice(s.name.as_bytes());
        dynstr.push(0);
    }

    // .dynsym: index 0 is the mandatory null symbol.
    let mut dynsym = elf64_sym(0, 0, 0, 0, 0);
    for (s, &name_off) in syms.iter().zip(&name_offsets) {
        let stt = if s.is_func { 2 } else { 1 }; // STT_FUNC : STT_OBJECT
        let info = (1 << 4) | stt; // STB_GLOBAL
        dynsym.extend(elf64_sym(name_off, info, 1, s.value, 8));
    }

    let rela_bytes = rela
        .as_ref()
        .map(|(_, sym_idx)| elf64_rela(0x1000, *sym_idx, 1 /* R_X86_64_64 */, 0))
        .unwrap_or_default();
    let rela_name = match rela {
        Some((RelaKind::Dyn, _)) => ".rela.dyn",
        Some((RelaKind::Plt, _)) => ".rela.plt",
        None => "",
    };

    let mut shstrtab = vec![0u8];
    let push_name = |tab: &mut Vec<u8>, s: &str| -> u32 {
        let off = tab.len() as u32;
        tab.extend_from_slice(s.as_bytes());
        tab.push(0);
        off
    };
    let dynsym_name = push_name(&mut shstrtab, ".dynsym");
    let dynstr_name = push_name(&mut shstrtab, ".dynstr");
    let rela_name_off = if rela_name.is_empty() {
        0
    } else {
        push_name(&mut shstrtab, rela_name)
    };
    let shstrtab_name = push_name(&mut shstrtab, ".shstrtab");

    const EHDR_LEN: u64 = 64;
    let dynsym_off = EHDR_LEN;
    let dynstr_off = dynsym_off + dynsym.len() as u64;
    let rela_off = dynstr_off + dynstr.len() as u64;
    let shstrtab_off = rela_off + rela_bytes.len() as u64;
    let shdr_off = shstrtab_off + shstrtab.len() as u64;

    let nsections: u16 = if rela_name.is_empty() { 4 } else { 5 };

    let mut buf = Vec::new();
    // e_ident
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    buf.extend_from_slice(&ET_DYN.to_le_bytes());
    buf.extend_from_slice(&EM_X86_64.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes()); // e_version
    buf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    buf.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    buf.extend_from_slice(&shdr_off.to_le_bytes()); // e_shoff
    buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    buf.extend_from_slice(&(EHDR_LEN as u16).to_le_bytes()); // e_ehsize
    buf.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    buf.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    buf.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    buf.extend_from_slice(&nsections.to_le_bytes()); // e_shnum
    buf.extend_from_slice(&(nsections - 1).to_le_bytes()); // e_shstrndx
    assert_eq!(buf.len() as u64, EHDR_LEN);

    buf.extend_from_slice(&dynsym);
    buf.extend_from_slice(&dynstr);
    buf.extend_from_slice(&rela_bytes);
    buf.extend_from_slice(&shstrtab);

    buf.extend(shdr(0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0));
    buf.extend(shdr(
        dynsym_name,
        SHT_DYNSYM,
        0x2, // SHF_ALLOC
        dynsym_off,
        dynsym.len() as u64,
        2, // sh_link -> .dynstr section index
        1,
        8,
        24,
    ));
    buf.extend(shdr(
        dynstr_name,
        SHT_STRTAB,
        0x2,
        dynstr_off,
        dynstr.len() as u64,
        0,
        0,
        1,
        0,
    ));
    if !rela_name.is_empty() {
        buf.extend(shdr(
            rela_name_off,
            SHT_RELA,
            0x2,
            rela_off,
            rela_bytes.len() as u64,
            1, // sh_link -> .dynsym
            0,
            8,
            24,
        ));
    }
    buf.extend(shdr(
        shstrtab_name,
        SHT_STRTAB,
        0,
        shstrtab_off,
        shstrtab.len() as u64,
        0,
        0,
        1,
        0,
    ));

    buf
}

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB_TY: u32 = 2;
const SHT_STRTAB_TY: u32 = 3;
const ET_REL: u16 = 1;
const SHF_ALLOC_EXEC: u64 = 0x6; // SHF_ALLOC | SHF_EXECINSTR

/// Hand-encode a minimal `ET_REL` patch object carrying exactly one redirected
/// function, with no undefined symbols to resolve: `.text` holds `stub`
/// (the replacement body), `.upatch.funcs` holds one record pointing at
/// `old_addr`/`old_size` (read from the live target's own symbol table by
/// the caller), and `.symtab` carries only the mandatory null entry.
pub fn build_patch_object(old_addr: u64, old_size: u64, stub: &[u8]) -> Vec<u8> {
    let text = stub.to_vec();

    // "greet" sits right after the leading NUL, at offset 1.
    let mut upatch_strings = vec![0u8];
    upatch_strings.extend_from_slice(b"greet\0");

    let mut upatch_funcs = Vec::with_capacity(48);
    upatch_funcs.extend_from_slice(&0u64.to_le_bytes()); // new_addr: patch-relative, text is placed first
    upatch_funcs.extend_from_slice(&(text.len() as u64).to_le_bytes()); // new_size
    upatch_funcs.extend_from_slice(&old_addr.to_le_bytes());
    upatch_funcs.extend_from_slice(&old_size.to_le_bytes());
    upatch_funcs.extend_from_slice(&0u64.to_le_bytes()); // sympos
    upatch_funcs.extend_from_slice(&1u64.to_le_bytes()); // name_ptr: "greet" at offset 1

    let symtab = elf64_sym(0, 0, 0, 0, 0); // mandatory null symbol only
    let strtab = vec![0u8];

    let mut shstrtab = vec![0u8];
    let mut push_name = |tab: &mut Vec<u8>, s: &str| -> u32 {
        let off = tab.len() as u32;
        tab.extend_from_slice(s.as_bytes());
        tab.push(0);
        off
    };
    let text_name = push_name(&mut shstrtab, ".text");
    let funcs_name = push_name(&mut shstrtab, ".upatch.funcs");
    let strings_name = push_name(&mut shstrtab, ".upatch.strings");
    let symtab_name = push_name(&mut shstrtab, ".symtab");
    let strtab_name = push_name(&mut shstrtab, ".strtab");
    let shstrtab_name = push_name(&mut shstrtab, ".shstrtab");

    const EHDR_LEN: u64 = 64;
    let text_off = EHDR_LEN;
    let funcs_off = text_off + text.len() as u64;
    let strings_off = funcs_off + upatch_funcs.len() as u64;
    let symtab_off = strings_off + upatch_strings.len() as u64;
    let strtab_off = symtab_off + symtab.len() as u64;
    let shstrtab_off = strtab_off + strtab.len() as u64;
    let shdr_off = shstrtab_off + shstrtab.len() as u64;

    let nsections: u16 = 7; // null, text, funcs, strings, symtab, strtab, shstrtab

    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    buf.extend_from_slice(&ET_REL.to_le_bytes());
    buf.extend_from_slice(&EM_X86_64.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    buf.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    buf.extend_from_slice(&shdr_off.to_le_bytes()); // e_shoff
    buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    buf.extend_from_slice(&(EHDR_LEN as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    buf.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    buf.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    buf.extend_from_slice(&nsections.to_le_bytes());
    buf.extend_from_slice(&(nsections - 1).to_le_bytes()); // e_shstrndx
    assert_eq!(buf.len() as u64, EHDR_LEN);

    buf.extend_from_slice(&text);
    buf.extend_from_slice(&upatch_funcs);
    buf.extend_from_slice(&upatch_strings);
    buf.extend_from_slice(&symtab);
    buf.extend_from_slice(&strtab);
    buf.extend_from_slice(&shstrtab);

    buf.extend(shdr(0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0));
    buf.extend(shdr(
        text_name,
        SHT_PROGBITS,
        SHF_ALLOC_EXEC,
        text_off,
        text.len() as u64,
        0,
        0,
        16,
        0,
    ));
    buf.extend(shdr(
        funcs_name,
        SHT_PROGBITS,
        0,
        funcs_off,
        upatch_funcs.len() as u64,
        0,
        0,
        8,
        48,
    ));
    buf.extend(shdr(
        strings_name,
        SHT_PROGBITS,
        0,
        strings_off,
        upatch_strings.len() as u64,
        0,
        0,
        1,
        0,
    ));
    buf.extend(shdr(
        symtab_name,
        SHT_SYMTAB_TY,
        0,
        symtab_off,
        symtab.len() as u64,
        5, // sh_link -> .strtab section index
        1, // sh_info: one local symbol (the null entry)
        8,
        24,
    ));
    buf.extend(shdr(
        strtab_name,
        SHT_STRTAB_TY,
        0,
        strtab_off,
        strtab.len() as u64,
        0,
        0,
        1,
        0,
    ));
    buf.extend(shdr(
        shstrtab_name,
        SHT_STRTAB_TY,
        0,
        shstrtab_off,
        shstrtab.len() as u64,
        0,
        0,
        1,
        0,
    ));

    buf
}

pub fn sample_maps_text() -> String {
    "\
00400000-00401000 r-xp 00000000 08:01 131 /usr/bin/target
00600000-00601000 rw-p 00000000 08:01 131 /usr/bin/target
7f1111110000-7f1111131000 r-xp 00000000 08:01 9001 /usr/lib/libc.so.6
7fffaaaa0000-7fffaaaa1000 rw-p 00000000 00:00 0 [stack]
"
    .to_string()
}
