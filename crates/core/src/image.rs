//! Binary image substrate: per-byte classification over a segment table.
//!
//! Both image variants (executable and library) share one representation: a
//! flat byte buffer, a parallel attribute array, and a table of segments
//! mapping (seg, off) addresses onto the buffer. Executable segments alias
//! overlapping spans of a single load image; library segments are laid out
//! back to back, one span per logical segment.
//!
//! Classification is monotonic: a byte goes `Unknown -> Code` or
//! `Unknown -> Data` exactly once and never back. The attribute array
//! therefore doubles as the analyzer's visited set.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::addr::Address;
use crate::dec::Inst;
use crate::diag::DiagnosticList;
use crate::xref::{XRef, XRefType};

/// Classification of one analyzed byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteKind {
    Unknown,
    Code,
    Data,
}

/// Per-byte attributes: classification plus the lead-byte flag that marks
/// the first byte of a multi-byte code or data unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteAttr {
    pub kind: ByteKind,
    pub is_lead: bool,
}

impl Default for ByteAttr {
    fn default() -> Self {
        Self { kind: ByteKind::Unknown, is_lead: false }
    }
}

impl ByteAttr {
    pub fn is_unknown(&self) -> bool {
        self.kind == ByteKind::Unknown
    }

    pub fn is_code_lead(&self) -> bool {
        self.kind == ByteKind::Code && self.is_lead
    }
}

/// One entry of the image's segment table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSegment {
    /// Dense id; equals this segment's index in the table.
    pub id: u16,
    pub name: String,
    /// Linear base of offset 0 within the image buffer.
    pub base: usize,
    /// Segment byte length as loaded.
    pub len: u32,
    /// Valid offset range. Starts wide and is tightened as overlap with
    /// neighbouring segments is discovered.
    pub bounds: Range<u32>,
    /// Observed analyzed range; grows monotonically, never set back.
    pub coverage: Option<Range<u32>>,
    /// Paragraph-aligned raw segment value (executables only).
    pub frame: Option<u16>,
}

impl ImageSegment {
    pub fn contains_offset(&self, off: u32) -> bool {
        off >= self.bounds.start && off < self.bounds.end
    }
}

/// A clamp applied to (or refused for) a neighbouring segment's bounds when
/// another segment's coverage grew into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentClamp {
    pub seg: u16,
    pub old_end: u32,
    pub new_end: u32,
    /// True when the clamp would cut into bytes that segment has already
    /// analyzed; the clamp is not applied in that case.
    pub conflict: bool,
}

/// A classification attempt hit a byte that is already code or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyConflict {
    pub at: Address,
    pub existing: ByteKind,
    pub mid_unit: bool,
}

/// A basic block of discovered code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub start: Address,
    /// Block length in bytes.
    pub len: u16,
    pub successors: Vec<BlockEdge>,
}

/// Successor edge of a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEdge {
    pub target: Address,
    pub kind: BlockEdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockEdgeKind {
    Fallthrough,
    Jump(XRefType),
}

/// A discovered procedure: entry point plus the blocks it absorbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    pub entry: Address,
    /// Assigned in the post-analysis naming pass.
    pub name: String,
    pub blocks: Vec<Address>,
    /// Total size of the owned blocks in bytes.
    pub size: u32,
}

/// The shared analyzed-image state both assembly variants populate.
#[derive(Debug)]
pub struct BinaryImage {
    bytes: Vec<u8>,
    attrs: Vec<ByteAttr>,
    segments: Vec<ImageSegment>,
    pub instructions: BTreeMap<Address, Inst>,
    pub basic_blocks: BTreeMap<Address, BasicBlock>,
    pub procedures: BTreeMap<Address, Procedure>,
    pub xrefs: Vec<XRef>,
    pub errors: DiagnosticList,
}

impl BinaryImage {
    /// An image over one shared buffer (executable case). Segments are added
    /// afterwards and may alias overlapping spans of the buffer.
    pub fn with_buffer(bytes: Vec<u8>) -> Self {
        let attrs = vec![ByteAttr::default(); bytes.len()];
        Self {
            bytes,
            attrs,
            segments: Vec::new(),
            instructions: BTreeMap::new(),
            basic_blocks: BTreeMap::new(),
            procedures: BTreeMap::new(),
            xrefs: Vec::new(),
            errors: DiagnosticList::new(),
        }
    }

    /// An empty image; segments bring their own bytes (library case).
    pub fn empty() -> Self {
        Self::with_buffer(Vec::new())
    }

    /// Add a segment aliasing `base..base+len` of the existing buffer.
    pub fn add_segment(
        &mut self,
        name: impl Into<String>,
        base: usize,
        len: u32,
        bounds: Range<u32>,
        frame: Option<u16>,
    ) -> u16 {
        let id = self.segments.len() as u16;
        self.segments.push(ImageSegment {
            id,
            name: name.into(),
            base,
            len,
            bounds,
            coverage: None,
            frame,
        });
        id
    }

    /// Append a segment together with its bytes (library case).
    pub fn push_segment_bytes(&mut self, name: impl Into<String>, data: &[u8]) -> u16 {
        let base = self.bytes.len();
        self.bytes.extend_from_slice(data);
        self.attrs.resize(self.bytes.len(), ByteAttr::default());
        let len = data.len() as u32;
        self.add_segment(name, base, len, 0..len, None)
    }

    pub fn segments(&self) -> &[ImageSegment] {
        &self.segments
    }

    pub fn segment(&self, id: u16) -> Option<&ImageSegment> {
        self.segments.get(id as usize)
    }

    /// Map an address onto the flat buffer; `None` if the address does not
    /// name a loaded byte inside its segment's current bounds.
    pub fn linear(&self, addr: Address) -> Option<usize> {
        if !addr.is_valid() {
            return None;
        }
        let seg = self.segments.get(addr.seg as usize)?;
        let off = addr.off as u32;
        if !seg.contains_offset(off) {
            return None;
        }
        let lin = seg.base + off as usize;
        if lin < self.bytes.len() {
            Some(lin)
        } else {
            None
        }
    }

    pub fn is_valid_address(&self, addr: Address) -> bool {
        self.linear(addr).is_some()
    }

    pub fn byte(&self, addr: Address) -> Option<u8> {
        self.linear(addr).map(|i| self.bytes[i])
    }

    /// Contiguous byte run starting at `addr`, clipped to the segment's
    /// bounds and the buffer.
    pub fn get_bytes(&self, addr: Address, count: usize) -> Option<&[u8]> {
        let start = self.linear(addr)?;
        let seg = &self.segments[addr.seg as usize];
        let seg_end = seg.base + seg.bounds.end as usize;
        let end = (start + count).min(seg_end).min(self.bytes.len());
        Some(&self.bytes[start..end])
    }

    pub fn word(&self, addr: Address) -> Option<u16> {
        let b = self.get_bytes(addr, 2)?;
        if b.len() < 2 {
            return None;
        }
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn attr(&self, addr: Address) -> Option<ByteAttr> {
        self.linear(addr).map(|i| self.attrs[i])
    }

    /// Classify `len` bytes starting at `addr` as one code or data unit
    /// (lead byte first, continuation bytes after).
    ///
    /// Fails without modifying anything if any byte is out of bounds or
    /// already classified; classification is monotonic.
    pub fn classify(
        &mut self,
        addr: Address,
        len: u16,
        kind: ByteKind,
    ) -> Result<Vec<SegmentClamp>, ClassifyConflict> {
        debug_assert!(len > 0);
        // Validate the whole unit first so a conflict leaves no half-marked
        // unit behind.
        for i in 0..len {
            let at = addr.wrapping_add(i);
            match self.attr(at) {
                Some(a) if a.is_unknown() => {}
                Some(a) => {
                    return Err(ClassifyConflict {
                        at,
                        existing: a.kind,
                        mid_unit: !a.is_lead,
                    })
                }
                None => {
                    return Err(ClassifyConflict {
                        at,
                        existing: ByteKind::Unknown,
                        mid_unit: false,
                    })
                }
            }
        }
        for i in 0..len {
            let at = addr.wrapping_add(i);
            let lin = self.linear(at).expect("validated above");
            self.attrs[lin] = ByteAttr { kind, is_lead: i == 0 };
        }
        Ok(self.extend_coverage(addr.seg, addr.off as u32, addr.off as u32 + len as u32))
    }

    /// Grow a segment's observed coverage and tighten neighbouring bounds
    /// that the new coverage proves to be overlap slack.
    fn extend_coverage(&mut self, seg_id: u16, lo: u32, hi: u32) -> Vec<SegmentClamp> {
        let (seg_base, cov_start) = {
            let seg = &mut self.segments[seg_id as usize];
            let cov = match &mut seg.coverage {
                Some(c) => {
                    c.start = c.start.min(lo);
                    c.end = c.end.max(hi);
                    c.clone()
                }
                None => {
                    seg.coverage = Some(lo..hi);
                    lo..hi
                }
            };
            (seg.base, cov.start)
        };

        // Any earlier segment whose bounds still reach past the start of the
        // observed coverage is overlapping paragraph slack; cut it back.
        let cov_lin = seg_base + cov_start as usize;
        let mut clamps = Vec::new();
        for other in &mut self.segments {
            if other.id == seg_id || other.base >= seg_base {
                continue;
            }
            let other_end = other.base + other.bounds.end as usize;
            if other_end <= cov_lin {
                continue;
            }
            let new_end = (cov_lin - other.base) as u32;
            let conflict = other
                .coverage
                .as_ref()
                .map(|c| c.end > new_end)
                .unwrap_or(false);
            clamps.push(SegmentClamp {
                seg: other.id,
                old_end: other.bounds.end,
                new_end,
                conflict,
            });
            if !conflict {
                other.bounds.end = new_end;
            }
        }
        clamps
    }
}

/// Read-only view of an analyzed image, as handed to frontends.
pub trait Image {
    fn image(&self) -> &BinaryImage;

    /// Render an address the way this image variant labels locations
    /// (frame:offset for executables, segment-name:offset for libraries).
    fn format_address(&self, addr: Address) -> String;
}
