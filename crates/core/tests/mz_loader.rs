use dosdis_core::error::LoadError;
use dosdis_core::mz::{MzFile, HEADER_LEN, PARAGRAPH};

/// Build a minimal MZ file around `image`, with the relocation table packed
/// right after the fixed header fields.
fn build_mz(image: &[u8], relocs: &[(u16, u16)], init_cs: u16, init_ip: u16) -> Vec<u8> {
    let reloc_bytes = relocs.len() * 4;
    let header_size = (HEADER_LEN + reloc_bytes).div_ceil(PARAGRAPH) * PARAGRAPH;
    let file_size = header_size + image.len();

    let mut bytes = vec![0u8; header_size];
    let mut word = |at: usize, v: u16| bytes[at..at + 2].copy_from_slice(&v.to_le_bytes());
    word(0, u16::from_le_bytes(*b"MZ"));
    word(2, (file_size % 512) as u16); // last page size
    word(4, file_size.div_ceil(512) as u16); // page count
    word(6, relocs.len() as u16);
    word(8, (header_size / PARAGRAPH) as u16);
    word(20, init_ip);
    word(22, init_cs);
    word(24, HEADER_LEN as u16); // relocation table offset
    for (i, (off, seg)) in relocs.iter().enumerate() {
        word(HEADER_LEN + i * 4, *off);
        word(HEADER_LEN + i * 4 + 2, *seg);
    }
    bytes.extend_from_slice(image);
    bytes
}

#[test]
fn loads_minimal_executable() {
    let image = [0xB8, 0x34, 0x12, 0xC3];
    let file = MzFile::load(&build_mz(&image, &[], 0, 0)).unwrap();
    assert_eq!(file.image(), &image);
    assert_eq!(file.entry_point(), (0, 0));
    assert!(file.relocs.is_empty());
    assert!(!file.is_relocated());
}

#[test]
fn loads_file_filling_its_last_page_exactly() {
    // 32-byte header + 480 image bytes = exactly one 512-byte page, so the
    // header declares page_count 1 with last_page_size 0.
    let mut image = vec![0u8; 480];
    image[0] = 0xC3;
    let bytes = build_mz(&image, &[], 0, 0);
    assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 0);
    assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1);

    let file = MzFile::load(&bytes).unwrap();
    assert_eq!(file.image().len(), 480);
    assert!(file.relocs.is_empty());
}

#[test]
fn accepts_zm_signature() {
    let mut bytes = build_mz(&[0xC3], &[], 0, 0);
    bytes[0..2].copy_from_slice(b"ZM");
    assert!(MzFile::load(&bytes).is_ok());
}

#[test]
fn rejects_bad_signature() {
    let mut bytes = build_mz(&[0xC3], &[], 0, 0);
    bytes[0..2].copy_from_slice(b"PE");
    assert!(matches!(MzFile::load(&bytes), Err(LoadError::BadSignature(_))));
}

#[test]
fn rejects_truncated_header() {
    let bytes = build_mz(&[0xC3], &[], 0, 0);
    assert!(matches!(MzFile::load(&bytes[..20]), Err(LoadError::HeaderTruncated(20))));
}

#[test]
fn rejects_zero_page_count() {
    let mut bytes = build_mz(&[0xC3], &[], 0, 0);
    bytes[4..6].copy_from_slice(&0u16.to_le_bytes());
    assert!(matches!(MzFile::load(&bytes), Err(LoadError::ZeroPageCount)));
}

#[test]
fn rejects_declared_size_past_end_of_stream() {
    let mut bytes = build_mz(&[0xC3], &[], 0, 0);
    bytes[4..6].copy_from_slice(&9u16.to_le_bytes()); // 9 pages we do not have
    assert!(matches!(MzFile::load(&bytes), Err(LoadError::FileSizeOverrun { .. })));
}

#[test]
fn rejects_header_smaller_than_fixed_fields() {
    let mut bytes = build_mz(&[0xC3], &[], 0, 0);
    bytes[8..10].copy_from_slice(&1u16.to_le_bytes()); // 16 bytes < 28
    assert!(matches!(MzFile::load(&bytes), Err(LoadError::BadHeaderSize(16))));
}

#[test]
fn rejects_relocation_table_outside_header() {
    let mut bytes = build_mz(&[0xC3], &[(0, 0)], 0, 0);
    // Point the table past the header area.
    bytes[24..26].copy_from_slice(&0x200u16.to_le_bytes());
    assert!(matches!(MzFile::load(&bytes), Err(LoadError::BadRelocTable { .. })));
}

#[test]
fn last_page_size_shortens_the_declared_size() {
    // One page declared, 36 bytes used: declared size must be exactly 36.
    let bytes = build_mz(&[0xC3, 0x90, 0x90, 0x90], &[], 0, 0);
    let file = MzFile::load(&bytes).unwrap();
    assert_eq!(file.header.declared_file_size(), bytes.len());
}

#[test]
fn relocation_patches_words_once() {
    // Word at linear 2 holds frame 0x0001.
    let image = [0x90, 0x90, 0x01, 0x00];
    let mut file = MzFile::load(&build_mz(&image, &[(2, 0)], 0x0001, 0)).unwrap();

    file.relocate(0x100).unwrap();
    assert!(file.is_relocated());
    let patched = u16::from_le_bytes([file.image()[2], file.image()[3]]);
    assert_eq!(patched, 0x0101);
    assert_eq!(file.header.init_cs, 0x0101);

    assert!(matches!(file.relocate(0x100), Err(LoadError::AlreadyRelocated)));
}
