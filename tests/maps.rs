mod common;

use upatch_manage::process::maps::{parse, ProtFlags};

#[test]
fn idempotent_scan_of_same_text() {
    let text = common::sample_maps_text();
    let (a1, h1) = parse(&text, 0x1000).unwrap();
    let (a2, h2) = parse(&text, 0x1000).unwrap();
    assert_eq!(a1, a2);
    assert_eq!(h1, h2);
}

#[test]
fn hole_coverage_matches_large_gaps_only() {
    let text = common::sample_maps_text();
    let (areas, holes) = parse(&text, 0x1000).unwrap();

    for pair in areas.windows(2) {
        let gap = pair[1].start.saturating_sub(pair[0].end);
        let expects_hole = gap > 2 * 0x1000;
        let has_hole = holes
            .iter()
            .any(|h| h.start == pair[0].end + 0x1000 && h.end == pair[1].start - 0x1000);
        assert_eq!(expects_hole, has_hole, "pair {:?}", pair);
    }
}

#[test]
fn libc_vma_is_discoverable_by_basename() {
    let text = common::sample_maps_text();
    let (areas, _) = parse(&text, 0x1000).unwrap();
    let libc = areas
        .iter()
        .find(|a| a.prot.contains(ProtFlags::EXEC) && a.basename().is_some_and(|b| b.starts_with("libc")));
    assert!(libc.is_some());
}
