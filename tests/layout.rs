mod common;

use upatch_manage::arch::MAX_DISTANCE;
use upatch_manage::layout::find_hole;
use upatch_manage::process::maps::{parse, ProtFlags, VmArea, VmHole};

#[test]
fn accepts_hole_within_max_distance_of_executable_vma() {
    let (areas, _) = parse(&common::sample_maps_text(), 0x1000).unwrap();
    let holes = vec![VmHole {
        start: 0x700000,
        end: 0x710000,
    }];
    let addr = find_hole(&holes, &areas, 0x2000).unwrap();
    assert!(addr >= 0x700000 && addr < 0x710000);
}

#[test]
fn rejects_hole_beyond_max_distance() {
    let areas = vec![VmArea {
        start: 0x400000,
        end: 0x401000,
        prot: ProtFlags::READ | ProtFlags::EXEC,
        shared: false,
        offset: 0,
        dev: (8, 1),
        inode: 1,
        path: Some("/usr/bin/target".to_string()),
    }];
    let far = 0x400000u64 + MAX_DISTANCE + 0x10000;
    let holes = vec![VmHole {
        start: far,
        end: far + 0x10000,
    }];
    assert!(find_hole(&holes, &areas, 0x1000).is_err());
}

#[test]
fn reach_property_holds_for_chosen_hole() {
    let areas = vec![VmArea {
        start: 0x400000,
        end: 0x401000,
        prot: ProtFlags::READ | ProtFlags::EXEC,
        shared: false,
        offset: 0,
        dev: (8, 1),
        inode: 1,
        path: Some("/usr/bin/target".to_string()),
    }];
    let holes = vec![VmHole {
        start: 0x500000,
        end: 0x510000,
    }];
    let size = 0x2000u64;
    let addr = find_hole(&holes, &areas, size).unwrap();
    assert!(addr.abs_diff(areas[0].start) <= MAX_DISTANCE);
}
