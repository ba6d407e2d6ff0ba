use elf::abi::R_RISCV_BRANCH;
use upatch_manage::arch::{apply_reloc, Arch};
use upatch_manage::relocation::JmpTable;

#[test]
fn riscv_branch_overflow_at_4096_fails() {
    let mut word = [0u32; 1];
    let loc = word.as_mut_ptr() as *mut u8;
    let err = apply_reloc(Arch::Riscv64, R_RISCV_BRANCH, loc, 0, 4096).unwrap_err();
    assert!(matches!(err, upatch_manage::error::Error::RelocOverflow { .. }));
}

#[test]
fn riscv_branch_within_range_at_4094_succeeds_and_encodes_bits() {
    let mut word = [0u32; 1];
    let loc = word.as_mut_ptr() as *mut u8;
    apply_reloc(Arch::Riscv64, R_RISCV_BRANCH, loc, 0, 4094).expect("4094 is in range");

    let encoded = word[0];
    let imm12 = (encoded >> 31) & 1;
    let imm11 = (encoded >> 7) & 1;
    let imm10_5 = (encoded >> 25) & 0x3f;
    let imm4_1 = (encoded >> 8) & 0xf;
    let decoded =
        ((imm12 as i64) << 12) | ((imm11 as i64) << 11) | ((imm10_5 as i64) << 5) | ((imm4_1 as i64) << 1);
    // Sign-extend from bit 12.
    let decoded = (decoded << 51) >> 51;
    assert_eq!(decoded, 4094);
}

#[test]
fn jump_table_bound_is_one_hundred() {
    let mut table = JmpTable::new(Arch::X86_64);
    for _ in 0..100 {
        table
            .push(upatch_manage::arch::JmpKind::Plt, 0x1000, None)
            .unwrap();
    }
    assert!(table
        .push(upatch_manage::arch::JmpKind::Plt, 0x1000, None)
        .is_err());
}
