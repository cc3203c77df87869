use dosdis_core::addr::Address;
use dosdis_core::analysis::library::analyze_library;
use dosdis_core::analysis::AnalysisOptions;
use dosdis_core::image::Image;
use dosdis_core::object::{LibraryImage, ObjectLibrary};
use dosdis_core::omf::library::parse_library;
use dosdis_core::omf::{
    EXTDEF, FIXUPP, LEDATA, LIBEND, LIBHDR, LNAMES, MODEND, PUBDEF, SEGDEF, THEADR,
};
use dosdis_core::xref::XRefType;

fn rec(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![kind];
    out.extend_from_slice(&((payload.len() as u16 + 1).to_le_bytes()));
    out.extend_from_slice(payload);
    out.push(0);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = vec![s.len() as u8];
    out.extend_from_slice(s.as_bytes());
    out
}

/// One module: a public `symbol` at offset 0 of a CODE segment holding
/// `code`, plus the given externals and one optional FIXUPP payload.
fn module(
    name: &str,
    symbol: &str,
    code: &[u8],
    externals: &[&str],
    fixupp: Option<&[u8]>,
) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend(rec(THEADR, &cstr(name)));
    let mut lnames = cstr("");
    lnames.extend(cstr("CODE"));
    lnames.extend(cstr("_TEXT"));
    bytes.extend(rec(LNAMES, &lnames));
    let mut segdef = vec![0x48];
    segdef.extend_from_slice(&(code.len() as u16).to_le_bytes());
    segdef.extend_from_slice(&[3, 2, 1]);
    bytes.extend(rec(SEGDEF, &segdef));

    let mut pubdef = vec![0, 1];
    pubdef.extend(cstr(symbol));
    pubdef.extend_from_slice(&[0x00, 0x00, 0x00]);
    bytes.extend(rec(PUBDEF, &pubdef));

    for ext in externals {
        let mut extdef = cstr(ext);
        extdef.push(0);
        bytes.extend(rec(EXTDEF, &extdef));
    }

    let mut ledata = vec![1, 0x00, 0x00];
    ledata.extend_from_slice(code);
    bytes.extend(rec(LEDATA, &ledata));
    if let Some(payload) = fixupp {
        bytes.extend(rec(FIXUPP, payload));
    }
    bytes.extend(rec(MODEND, &[0x00]));
    bytes
}

fn paged_library(modules: &[Vec<u8>]) -> Vec<u8> {
    const PAGE: usize = 16;
    let mut bytes = rec(LIBHDR, &[0u8; PAGE - 4]);
    for module in modules {
        bytes.extend_from_slice(module);
        while bytes.len() % PAGE != 0 {
            bytes.push(0);
        }
    }
    bytes.extend(rec(LIBEND, &[]));
    bytes
}

fn analyzed(modules: &[Vec<u8>]) -> LibraryImage {
    let parsed = parse_library(&paged_library(modules)).unwrap();
    let mut image = LibraryImage::build(ObjectLibrary::build(parsed).unwrap());
    analyze_library(&mut image, AnalysisOptions::default()).unwrap();
    image
}

// Self-relative Offset fixup at data offset 1 against external 1.
const CALL_FIXUP: &[u8] = &[0x84, 0x01, 0x56, 0x01];

#[test]
fn cross_module_call_resolves_through_the_fixup() {
    let lib = analyzed(&[
        // call _foo; ret -- the encoded displacement is a placeholder.
        module("hello", "_main", &[0xE8, 0x00, 0x00, 0xC3], &["_foo"], Some(CALL_FIXUP)),
        module("foo", "_foo", &[0xC3], &[], None),
    ]);

    let entries = lib.code_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], (Address::new(0, 0), "_main".to_string()));
    assert_eq!(entries[1], (Address::new(1, 0), "_foo".to_string()));

    let image = lib.image();
    // The call decoded, its immediate carries the external's name, and the
    // edge lands on the callee despite the zero displacement.
    let call = &image.instructions[&Address::new(0, 0)];
    assert_eq!(call.ops[0].tag.as_deref(), Some("_foo"));
    assert!(image
        .xrefs
        .iter()
        .any(|x| x.kind == XRefType::NearCall
            && x.source == Address::new(0, 0)
            && x.target == Address::new(1, 0)));

    // Both entry points are procedures under their public names.
    assert_eq!(image.procedures[&Address::new(0, 0)].name, "_main");
    assert_eq!(image.procedures[&Address::new(1, 0)].name, "_foo");
    assert!(image.errors.is_empty());
}

#[test]
fn unresolved_external_call_is_tagged_but_not_followed() {
    let lib = analyzed(&[module(
        "lone",
        "_main",
        &[0xE8, 0x00, 0x00, 0xC3],
        &["_missing"],
        Some(CALL_FIXUP),
    )]);

    let image = lib.image();
    let call = &image.instructions[&Address::new(0, 0)];
    assert_eq!(call.ops[0].tag.as_deref(), Some("_missing"));
    // The edge is recorded with an invalid target; analysis still reaches
    // the ret behind the call.
    assert!(image
        .xrefs
        .iter()
        .any(|x| x.kind == XRefType::NearCall && !x.target.is_valid()));
    assert!(image.instructions.contains_key(&Address::new(0, 3)));
}

#[test]
fn misaligned_fixup_is_discarded_but_decoding_continues() {
    // mov ax, imm16; ret -- but the fixup starts at +2, one byte into the
    // immediate field. The fixup is reported and dropped; the instruction
    // keeps its classification with the operand untagged.
    let lib = analyzed(&[module(
        "bad",
        "_main",
        &[0xB8, 0x34, 0x12, 0xC3],
        &["_x"],
        Some(&[0x84, 0x02, 0x56, 0x01]),
    )]);

    let image = lib.image();
    let mov = &image.instructions[&Address::new(0, 0)];
    assert!(mov.ops.iter().all(|o| o.tag.is_none()));
    assert!(image.instructions.contains_key(&Address::new(0, 3)));
    assert!(image.errors.iter().any(|d| d.text.contains("line up")));
}

#[test]
fn fixup_at_the_entry_byte_vetoes_decoding() {
    // Segment-relative Offset fixup right at the public symbol: the bytes
    // are patched data, not code.
    let lib = analyzed(&[module(
        "table",
        "_vec",
        &[0x00, 0x00, 0xC3],
        &[],
        Some(&[0xC4, 0x00, 0x54, 0x01]),
    )]);

    let image = lib.image();
    assert!(image.instructions.is_empty());
    assert!(image.errors.iter().any(|d| d.text.contains("instruction start")));
}

#[test]
fn fp_emulator_opcode_patch_is_let_through() {
    // The FP emulator patches the leading int pair of the instruction via a
    // fixup against its well-known externals; that must not veto decoding.
    let lib = analyzed(&[module(
        "fp",
        "_calc",
        &[0xCD, 0x3D, 0x90, 0xC3], // int 3Dh; nop; ret
        &["FIDRQQ"],
        Some(&[0xC4, 0x00, 0x56, 0x01]),
    )]);

    let image = lib.image();
    assert!(image.instructions.contains_key(&Address::new(0, 0)));
    assert!(image.instructions.contains_key(&Address::new(0, 3)));
    assert!(image.errors.is_empty());
}

#[test]
fn segment_names_label_addresses() {
    let lib = analyzed(&[module("one", "_a", &[0xC3], &[], None)]);
    assert_eq!(lib.format_address(Address::new(0, 0x12)), "_TEXT:0012");
}
