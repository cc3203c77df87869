use dosdis_core::addr::Address;
use dosdis_core::image::{BinaryImage, ByteKind};
use dosdis_core::object::fixup::{
    Fixup, FixupCollection, FixupLocationType, FixupMode, FixupReferent, FixupTarget, FrameSpec,
};

#[test]
fn version_is_nonempty() {
    assert!(!dosdis_core::version().is_empty());
}

#[test]
fn address_display_and_wraparound() {
    let a = Address::new(3, 0xFFFE);
    assert_eq!(format!("{a}"), "seg003:FFFE");
    assert_eq!(a.wrapping_add(4), Address::new(3, 0x0002));
    assert!(!Address::INVALID.is_valid());
    assert_eq!(format!("{}", Address::INVALID), "(invalid)");
}

fn offset_fixup(start: u16) -> Fixup {
    Fixup {
        start,
        location: FixupLocationType::Offset,
        mode: FixupMode::SegmentRelative,
        target: FixupTarget { referent: FixupReferent::Segment(0), displacement: 0 },
        frame: FrameSpec::UseTarget,
    }
}

#[test]
fn fixup_collection_keeps_order_and_rejects_overlap() {
    let mut fixups = FixupCollection::new();
    fixups.insert(offset_fixup(10)).unwrap();
    fixups.insert(offset_fixup(2)).unwrap();
    fixups.insert(offset_fixup(6)).unwrap();

    let starts: Vec<u16> = fixups.iter().map(|f| f.start).collect();
    assert_eq!(starts, vec![2, 6, 10]);

    // [9, 11) intersects the fixup at [10, 12).
    let err = fixups.insert(offset_fixup(9)).unwrap_err();
    assert_eq!(err.existing.start, 10);
    assert_eq!(fixups.len(), 3);

    assert_eq!(fixups.at(6).unwrap().start, 6);
    assert!(fixups.at(7).is_none());
    assert_eq!(fixups.covering(7).unwrap().start, 6);
    assert!(fixups.covering(8).is_none());
    assert_eq!(fixups.in_range(2, 10).len(), 2);
}

#[test]
fn classification_is_monotonic() {
    let mut image = BinaryImage::with_buffer(vec![0u8; 16]);
    image.add_segment("seg", 0, 16, 0..16, None);
    let at = Address::new(0, 4);

    image.classify(at, 3, ByteKind::Code).unwrap();
    assert!(image.attr(at).unwrap().is_code_lead());
    assert!(!image.attr(at.wrapping_add(1)).unwrap().is_lead);

    // Reclassifying any byte of the unit fails and changes nothing.
    let conflict = image.classify(at.wrapping_add(1), 1, ByteKind::Data).unwrap_err();
    assert_eq!(conflict.existing, ByteKind::Code);
    assert!(conflict.mid_unit);
    assert_eq!(image.attr(at.wrapping_add(1)).unwrap().kind, ByteKind::Code);
}

#[test]
fn classify_rejects_units_that_leave_the_segment() {
    let mut image = BinaryImage::with_buffer(vec![0u8; 8]);
    image.add_segment("seg", 0, 8, 0..8, None);
    // A 4-byte unit starting at offset 6 runs past the bounds.
    assert!(image.classify(Address::new(0, 6), 4, ByteKind::Code).is_err());
    // Nothing was half-marked.
    assert!(image.attr(Address::new(0, 6)).unwrap().is_unknown());
}

#[test]
fn coverage_growth_clamps_overlapping_neighbour() {
    // Two segments alias one buffer 16 bytes apart; the first segment's
    // bounds initially reach across the second's base.
    let mut image = BinaryImage::with_buffer(vec![0u8; 48]);
    image.add_segment("a", 0, 32, 0..32, Some(0));
    image.add_segment("b", 16, 32, 0..32, Some(1));

    let clamps = image.classify(Address::new(1, 0), 2, ByteKind::Code).unwrap();
    assert_eq!(clamps.len(), 1);
    assert_eq!(clamps[0].seg, 0);
    assert_eq!(clamps[0].new_end, 16);
    assert!(!clamps[0].conflict);
    assert_eq!(image.segment(0).unwrap().bounds.end, 16);

    // Offsets of segment `a` past the clamp no longer name bytes.
    assert!(image.attr(Address::new(0, 20)).is_none());
}

#[test]
fn conflicting_clamp_is_reported_but_not_applied() {
    let mut image = BinaryImage::with_buffer(vec![0u8; 48]);
    image.add_segment("a", 0, 32, 0..32, Some(0));
    image.add_segment("b", 16, 32, 0..32, Some(1));

    // Segment `a` has already analyzed past the would-be clamp point.
    image.classify(Address::new(0, 26), 2, ByteKind::Code).unwrap();
    let clamps = image.classify(Address::new(1, 8), 2, ByteKind::Code).unwrap();
    let clamp = clamps.iter().find(|c| c.seg == 0).expect("clamp for segment a");
    assert!(clamp.conflict);
    // Bounds stay where they were.
    assert_eq!(image.segment(0).unwrap().bounds.end, 32);
}
