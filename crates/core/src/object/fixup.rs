//! Fixups: symbolic patch instructions recovered from FIXUPP records.
//!
//! A fixup says "the bytes at [start, start+len) hold a reference to this
//! target". The analyzer uses them in the opposite direction from a linker:
//! instead of patching bytes, it recovers the symbolic operand a raw byte
//! range stands for.

use serde::{Deserialize, Serialize};

/// What a fixup patches, and therefore how many bytes it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupLocationType {
    /// Low 8 bits of an offset.
    LowByte,
    /// 16-bit offset.
    Offset,
    /// 16-bit segment base.
    Base,
    /// 32-bit far pointer (offset then base).
    Pointer,
}

impl FixupLocationType {
    pub fn len(&self) -> u16 {
        match self {
            FixupLocationType::LowByte => 1,
            FixupLocationType::Offset | FixupLocationType::Base => 2,
            FixupLocationType::Pointer => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupMode {
    SelfRelative,
    SegmentRelative,
}

/// What a fixup target refers to, in module-local terms.
///
/// Indices are module-local table positions (0-based), not final library
/// ids: a fixup can reference a segment before library-wide ids exist, and
/// the indirection is resolved when the object model is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupReferent {
    Segment(usize),
    Group(usize),
    External(usize),
    AbsoluteFrame(u16),
}

/// Symbolic fixup target: referent plus byte displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixupTarget {
    pub referent: FixupReferent,
    pub displacement: u32,
}

/// Which frame the fixed-up value is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSpec {
    Segment(usize),
    Group(usize),
    External(usize),
    Absolute(u16),
    /// Frame of the data record the fixup patches.
    UseLocation,
    /// Frame of the fixup's own target.
    UseTarget,
}

/// One fixup owned by a logical segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixup {
    /// Start offset within the owning segment.
    pub start: u16,
    pub location: FixupLocationType,
    pub mode: FixupMode,
    pub target: FixupTarget,
    pub frame: FrameSpec,
}

impl Fixup {
    pub fn len(&self) -> u16 {
        self.location.len()
    }

    /// One past the last patched offset.
    pub fn end(&self) -> u32 {
        self.start as u32 + self.len() as u32
    }
}

/// Insertion failed: the new fixup overlaps an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupOverlap {
    pub rejected: Fixup,
    pub existing: Fixup,
}

/// Ordered, non-overlapping fixups of one logical segment.
///
/// Invariant: items are sorted by start offset and no two ranges intersect.
/// Insertion rejects an overlapping fixup instead of corrupting the order;
/// the caller decides whether that is a warning or an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixupCollection {
    items: Vec<Fixup>,
}

impl FixupCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fixup: Fixup) -> Result<(), FixupOverlap> {
        let at = self.items.partition_point(|f| f.start < fixup.start);
        if let Some(prev) = at.checked_sub(1).and_then(|i| self.items.get(i)) {
            if prev.end() > fixup.start as u32 {
                return Err(FixupOverlap { rejected: fixup, existing: *prev });
            }
        }
        if let Some(next) = self.items.get(at) {
            if (next.start as u32) < fixup.end() {
                return Err(FixupOverlap { rejected: fixup, existing: *next });
            }
        }
        self.items.insert(at, fixup);
        Ok(())
    }

    /// The fixup starting exactly at `offset`.
    pub fn at(&self, offset: u16) -> Option<&Fixup> {
        self.items
            .binary_search_by_key(&offset, |f| f.start)
            .ok()
            .map(|i| &self.items[i])
    }

    /// The fixup whose range covers `offset`, if any.
    pub fn covering(&self, offset: u16) -> Option<&Fixup> {
        let at = self.items.partition_point(|f| f.start <= offset);
        let candidate = at.checked_sub(1).map(|i| &self.items[i])?;
        if (offset as u32) < candidate.end() {
            Some(candidate)
        } else {
            None
        }
    }

    /// All fixups starting within [start, end).
    pub fn in_range(&self, start: u16, end: u32) -> &[Fixup] {
        let lo = self.items.partition_point(|f| (f.start as u32) < start as u32);
        let hi = self.items.partition_point(|f| (f.start as u32) < end);
        &self.items[lo..hi]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fixup> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
