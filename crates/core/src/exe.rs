//! Executable assembly: MZ image plus inferred segmentation.
//!
//! An MZ file does not declare its segments. The loader recovers an
//! approximate segment layout from the set of distinct frame values the
//! binary itself references: the entry-point CS plus the word at every
//! relocation-table location (those words are raw paragraph frames by
//! definition — that is what the relocator patches). Sorting the set and
//! assigning dense ids gives the image's segment table; bounds are then
//! tightened as analysis observes real coverage.

use crate::addr::Address;
use crate::error::LoadError;
use crate::image::{BinaryImage, Image};
use crate::mz::{MzFile, PARAGRAPH};

/// Sorted distinct frame values; the index of a frame is its segment id.
#[derive(Debug, Clone, Default)]
pub struct FrameMap {
    frames: Vec<u16>,
}

impl FrameMap {
    fn new(mut frames: Vec<u16>) -> Self {
        frames.sort_unstable();
        frames.dedup();
        Self { frames }
    }

    /// Dense segment id for a raw frame value, if the frame was referenced
    /// anywhere in the binary.
    pub fn segment_for_frame(&self, frame: u16) -> Option<u16> {
        self.frames.binary_search(&frame).ok().map(|i| i as u16)
    }

    /// The stored frame of a segment id.
    pub fn frame_of(&self, seg: u16) -> Option<u16> {
        self.frames.get(seg as usize).copied()
    }

    pub fn frames(&self) -> &[u16] {
        &self.frames
    }

    /// Map a (frame, offset) far pointer to an address, or `INVALID` when
    /// the frame was never referenced by a relocation.
    pub fn map(&self, frame: u16, off: u16) -> Address {
        match self.segment_for_frame(frame) {
            Some(seg) => Address::new(seg, off),
            None => Address::INVALID,
        }
    }
}

/// The analyzed image of an MZ executable.
#[derive(Debug)]
pub struct ExecutableImage {
    image: BinaryImage,
    frames: FrameMap,
    /// Sorted linear positions of relocated words within the image.
    reloc_sites: Vec<usize>,
}

impl ExecutableImage {
    pub fn frames(&self) -> &FrameMap {
        &self.frames
    }

    pub fn image_mut(&mut self) -> &mut BinaryImage {
        &mut self.image
    }

    /// True if the word at `addr` is patched by the relocation table.
    ///
    /// Relocatable words hold segment frames, so they are data by
    /// construction and never valid instruction lead bytes.
    pub fn is_address_relocatable(&self, addr: Address) -> bool {
        match self.image.linear(addr) {
            Some(lin) => self.reloc_sites.binary_search(&lin).is_ok(),
            None => false,
        }
    }
}

impl Image for ExecutableImage {
    fn image(&self) -> &BinaryImage {
        &self.image
    }

    fn format_address(&self, addr: Address) -> String {
        match self.frames.frame_of(addr.seg) {
            Some(frame) => format!("{:04X}:{:04X}", frame, addr.off),
            None => format!("{}", addr),
        }
    }
}

/// A loaded, segment-inferred MZ executable ready for analysis.
#[derive(Debug)]
pub struct Executable {
    pub file: MzFile,
    pub image: ExecutableImage,
    /// Program entry mapped into the inferred segment table.
    pub entry: Address,
}

impl Executable {
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        let file = MzFile::load(bytes)?;
        let image_bytes = file.image().to_vec();

        // Collect every distinct frame the binary references.
        let (entry_cs, entry_ip) = file.entry_point();
        let mut frames = vec![entry_cs];
        for reloc in &file.relocs {
            let at = reloc.linear();
            if at + 1 < image_bytes.len() {
                frames.push(u16::from_le_bytes([image_bytes[at], image_bytes[at + 1]]));
            }
        }
        let frames = FrameMap::new(frames);

        let mut reloc_sites: Vec<usize> = file.relocs.iter().map(|r| r.linear()).collect();
        reloc_sites.sort_unstable();
        reloc_sites.dedup();

        let image_len = image_bytes.len();
        let mut image = BinaryImage::with_buffer(image_bytes);
        let all = frames.frames().to_vec();
        for (i, &frame) in all.iter().enumerate() {
            let base = frame as usize * PARAGRAPH;
            // Upper bound: image end, 64K, or 16 bytes past the next frame
            // (frames may overlap by up to 15 bytes of paragraph slack).
            let mut cap = image_len.saturating_sub(base).min(0x10000);
            if let Some(&next) = all.get(i + 1) {
                let slack_cap = (next as usize - frame as usize) * PARAGRAPH + PARAGRAPH;
                cap = cap.min(slack_cap);
            }
            image.add_segment(
                format!("seg_{:04X}", frame),
                base,
                cap as u32,
                0..cap as u32,
                Some(frame),
            );
        }

        let entry_seg = frames
            .segment_for_frame(entry_cs)
            .expect("entry frame is in the frame set by construction");
        let entry = Address::new(entry_seg, entry_ip);

        log::info!(
            "executable: {} inferred segments, entry {:04X}:{:04X}",
            frames.frames().len(),
            entry_cs,
            entry_ip
        );

        Ok(Self { file, image: ExecutableImage { image, frames, reloc_sites }, entry })
    }
}
