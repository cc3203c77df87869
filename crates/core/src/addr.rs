//! Segmented addresses over dense segment ids.
//!
//! An [`Address`] names a byte as (segment, offset), where `seg` is an index
//! into the owning image's segment table rather than a raw 8086 segment
//! register value. Raw paragraph "frames" found in binaries are mapped to
//! dense ids at load time; see `exe::FrameMap`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A (segment-id, offset) pair identifying one byte of a binary image.
///
/// Ordering is lexicographic on (seg, off), which matches the order segments
/// are laid out in the segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub seg: u16,
    pub off: u16,
}

impl Address {
    /// Sentinel for targets that could not be resolved (e.g. indirect jumps).
    pub const INVALID: Address = Address { seg: u16::MAX, off: u16::MAX };

    pub fn new(seg: u16, off: u16) -> Self {
        Self { seg, off }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Same segment, offset advanced with 16-bit wraparound.
    ///
    /// 8086 near control transfers wrap within the segment, so offset
    /// arithmetic must never widen past 16 bits.
    pub fn wrapping_add(&self, delta: u16) -> Self {
        Self { seg: self.seg, off: self.off.wrapping_add(delta) }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "seg{:03}:{:04X}", self.seg, self.off)
        } else {
            write!(f, "(invalid)")
        }
    }
}
