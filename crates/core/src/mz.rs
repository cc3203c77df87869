//! MZ executable loader.
//!
//! Parses the fixed 28-byte DOS executable header, validates its structural
//! invariants, and loads the relocation table and raw image. Relocation is a
//! separate, explicit, at-most-once operation.

use serde::Serialize;

use crate::error::LoadError;

pub const PARAGRAPH: usize = 16;
pub const PAGE: usize = 512;
pub const HEADER_LEN: usize = 28;

const SIG_MZ: u16 = u16::from_le_bytes(*b"MZ");
const SIG_ZM: u16 = u16::from_le_bytes(*b"ZM");

/// The fixed MZ header fields, in file order.
#[derive(Debug, Clone, Serialize)]
pub struct MzHeader {
    pub signature: u16,
    pub last_page_size: u16,
    pub page_count: u16,
    pub reloc_count: u16,
    /// Header size in paragraphs.
    pub header_paragraphs: u16,
    pub min_alloc: u16,
    pub max_alloc: u16,
    pub init_ss: u16,
    pub init_sp: u16,
    pub checksum: u16,
    pub init_ip: u16,
    pub init_cs: u16,
    pub reloc_table_offset: u16,
    pub overlay: u16,
}

impl MzHeader {
    fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_LEN {
            return Err(LoadError::HeaderTruncated(bytes.len()));
        }
        let word = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Ok(Self {
            signature: word(0),
            last_page_size: word(2),
            page_count: word(4),
            reloc_count: word(6),
            header_paragraphs: word(8),
            min_alloc: word(10),
            max_alloc: word(12),
            init_ss: word(14),
            init_sp: word(16),
            checksum: word(18),
            init_ip: word(20),
            init_cs: word(22),
            reloc_table_offset: word(24),
            overlay: word(26),
        })
    }

    /// Total file size declared by the page fields.
    pub fn declared_file_size(&self) -> usize {
        let full = self.page_count as usize * PAGE;
        if self.last_page_size > 0 {
            full - (PAGE - self.last_page_size as usize)
        } else {
            full
        }
    }

    pub fn header_size(&self) -> usize {
        self.header_paragraphs as usize * PARAGRAPH
    }
}

/// One relocation table entry: the far location of a word to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelocationEntry {
    pub offset: u16,
    pub segment: u16,
}

impl RelocationEntry {
    /// Linear position of the patched word within the load image.
    pub fn linear(&self) -> usize {
        self.segment as usize * PARAGRAPH + self.offset as usize
    }
}

/// A loaded MZ executable: validated header, relocation table, raw image.
#[derive(Debug)]
pub struct MzFile {
    pub header: MzHeader,
    pub relocs: Vec<RelocationEntry>,
    image: Vec<u8>,
    relocated: Option<u16>,
}

impl MzFile {
    /// Parse and validate a whole MZ file.
    ///
    /// Every structural invariant violation fails the load with an error
    /// naming the offending field; nothing is analyzed after a bad header.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        let header = MzHeader::parse(bytes)?;

        if header.signature != SIG_MZ && header.signature != SIG_ZM {
            return Err(LoadError::BadSignature(header.signature));
        }
        if header.page_count == 0 {
            return Err(LoadError::ZeroPageCount);
        }

        let file_size = header.declared_file_size();
        if file_size > bytes.len() {
            return Err(LoadError::FileSizeOverrun { declared: file_size, actual: bytes.len() });
        }

        let header_size = header.header_size();
        if header_size < HEADER_LEN || header_size > file_size {
            return Err(LoadError::BadHeaderSize(header_size));
        }

        let reloc_start = header.reloc_table_offset as usize;
        let reloc_end = reloc_start + header.reloc_count as usize * 4;
        if header.reloc_count > 0 && (reloc_start < HEADER_LEN || reloc_end > header_size) {
            return Err(LoadError::BadRelocTable { start: reloc_start, end: reloc_end });
        }

        let mut relocs = Vec::with_capacity(header.reloc_count as usize);
        for i in 0..header.reloc_count as usize {
            let at = reloc_start + i * 4;
            let offset = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
            let segment = u16::from_le_bytes([bytes[at + 2], bytes[at + 3]]);
            relocs.push(RelocationEntry { offset, segment });
        }

        let image = bytes[header_size..file_size].to_vec();
        log::debug!(
            "loaded MZ image: {} bytes, {} relocations, entry {:04X}:{:04X}",
            image.len(),
            relocs.len(),
            header.init_cs,
            header.init_ip
        );

        Ok(Self { header, relocs, image, relocated: None })
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Program entry as a relative far pointer (CS:IP before relocation).
    pub fn entry_point(&self) -> (u16, u16) {
        (self.header.init_cs, self.header.init_ip)
    }

    /// Initial stack as a relative far pointer (SS:SP before relocation).
    pub fn stack_pointer(&self) -> (u16, u16) {
        (self.header.init_ss, self.header.init_sp)
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated.is_some()
    }

    /// Relocate the image to `base`: adds `base` to CS, SS, and the word at
    /// every relocation-table location. Applying twice is an error.
    pub fn relocate(&mut self, base: u16) -> Result<(), LoadError> {
        if self.relocated.is_some() {
            return Err(LoadError::AlreadyRelocated);
        }
        for reloc in &self.relocs {
            let at = reloc.linear();
            if at + 1 < self.image.len() {
                let word = u16::from_le_bytes([self.image[at], self.image[at + 1]]);
                let patched = word.wrapping_add(base);
                self.image[at..at + 2].copy_from_slice(&patched.to_le_bytes());
            }
        }
        self.header.init_cs = self.header.init_cs.wrapping_add(base);
        self.header.init_ss = self.header.init_ss.wrapping_add(base);
        self.relocated = Some(base);
        Ok(())
    }
}
