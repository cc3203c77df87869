//! Control-flow cross-references.
//!
//! An [`XRef`] is one discovered edge from a flow instruction to its target.
//! The analyzer's worklist is a queue of these; the finished set is kept on
//! the image so frontends can render incoming/outgoing references.

use serde::{Deserialize, Serialize};

use crate::addr::Address;

/// The instruction kind that produced a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XRefType {
    /// Entry point supplied by the caller (program entry, public symbol).
    UserSpecified,
    ConditionalJump,
    NearJump,
    FarJump,
    NearCall,
    FarCall,
    /// `jmp word ptr cs:[reg+disp]` through an in-segment jump table.
    NearIndexedJump,
}

impl XRefType {
    /// Call-like edges start procedures; jump-like edges stay inside one.
    pub fn is_call(&self) -> bool {
        matches!(self, XRefType::NearCall | XRefType::FarCall | XRefType::UserSpecified)
    }
}

/// A discovered control-flow edge.
///
/// `target` may be [`Address::INVALID`] for indirect transfers the analyzer
/// refuses to guess at, and for indexed jumps whose table is still being
/// walked (in which case `data_location` points at the next table entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XRef {
    pub source: Address,
    pub target: Address,
    pub kind: XRefType,
    /// For `NearIndexedJump`: the jump-table entry this edge came through.
    pub data_location: Option<Address>,
}

impl XRef {
    pub fn new(source: Address, target: Address, kind: XRefType) -> Self {
        Self { source, target, kind, data_location: None }
    }
}
