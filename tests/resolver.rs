mod common;

use common::{build_dyn_target, write_temp_file, DynSymSpec, RelaKind};
use upatch_manage::elf_model::TargetObject;
use upatch_manage::resolve::{resolve_external, Resolved};

#[test]
fn tier_three_dynsym_direct_is_used_when_no_rela_present() {
    let bytes = build_dyn_target(
        &[DynSymSpec {
            name: "foo_exported",
            value: 0x2000,
            is_func: true,
        }],
        None,
    );
    let path = write_temp_file("resolver_tier3", &bytes);
    let target = TargetObject::load(&path).unwrap();

    let resolved = resolve_external("foo_exported", 0, &target, 0x1000_0000).unwrap();
    match resolved {
        Resolved::ViaJumpTable { target, .. } => assert_eq!(target, 0x1000_0000 + 0x2000),
        Resolved::Direct(_) => panic!("tier 3 must install a GOT-style jump-table entry"),
    }
}

#[test]
fn tier_one_rela_dyn_is_preferred_when_present() {
    let bytes = build_dyn_target(
        &[DynSymSpec {
            name: "foo_exported",
            value: 0x2000,
            is_func: true,
        }],
        Some((RelaKind::Dyn, 1)),
    );
    let path = write_temp_file("resolver_tier1", &bytes);
    let target = TargetObject::load(&path).unwrap();

    let resolved = resolve_external("foo_exported", 0, &target, 0).unwrap();
    // The synthetic .rela.dyn entry's r_offset is 0x1000 (see `common`), distinct
    // from the dynsym's own st_value (0x2000) — this proves tier 1 answered first.
    match resolved {
        Resolved::ViaJumpTable { target, .. } => assert_eq!(target, 0x1000),
        Resolved::Direct(_) => panic!("tier 1 must install a GOT-style jump-table entry"),
    }
}

#[test]
fn unresolved_symbol_falls_through_to_patch_local_tier() {
    let bytes = build_dyn_target(&[], None);
    let path = write_temp_file("resolver_tier5", &bytes);
    let target = TargetObject::load(&path).unwrap();

    let resolved = resolve_external("nowhere", 0x500, &target, 0x1000).unwrap();
    match resolved {
        Resolved::Direct(addr) => assert_eq!(addr, 0x1500),
        Resolved::ViaJumpTable { .. } => panic!("tier 5 is a direct address, no thunk"),
    }
}

#[test]
fn truly_unresolvable_symbol_is_an_error() {
    let bytes = build_dyn_target(&[], None);
    let path = write_temp_file("resolver_none", &bytes);
    let target = TargetObject::load(&path).unwrap();

    let err = resolve_external("nowhere", 0, &target, 0).unwrap_err();
    assert!(matches!(err, upatch_manage::error::Error::SymbolUnresolved { .. }));
}
