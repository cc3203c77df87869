//! Per-record-kind OMF parsing.
//!
//! Parsing is stateful across the records of one module: LNAMES entries,
//! segment/group/external definitions, and fixup threads are all referenced
//! by later records through 1-based indices into the running
//! [`RecordContext`]. The context is an explicit struct threaded through
//! every record-parse call; it lives exactly as long as one module scan.

use crate::error::LoadError;
use crate::object::fixup::{
    Fixup, FixupLocationType, FixupMode, FixupReferent, FixupTarget, FrameSpec,
};

use super::{RawRecord, RecordReader};
use super::{
    ALIAS, COMDEF, COMENT, EXTDEF, FIXUPP, FIXUPP32, GRPDEF, LEDATA, LEDATA32, LEXTDEF, LHEADR,
    LIBEND, LIDATA, LIDATA32, LNAMES, LPUBDEF, LPUBDEF32, MODEND, MODEND32, PUBDEF, PUBDEF32,
    SEGDEF, SEGDEF32, THEADR,
};

/// Expanded LIDATA must not balloon past this; anything larger is treated
/// as a malformed record rather than an allocation request.
const MAX_LIDATA_EXPANSION: usize = 1 << 20;

/// Segment definition from SEGDEF.
#[derive(Debug, Clone)]
pub struct SegDef {
    pub name: String,
    pub class: String,
    pub overlay: String,
    pub length: u32,
    pub alignment: u8,
    pub combination: u8,
    pub use32: bool,
    /// Absolute segments carry an explicit frame.
    pub abs_frame: Option<u16>,
}

/// Group definition from GRPDEF; member indices are module-local (0-based).
#[derive(Debug, Clone)]
pub struct GrpDef {
    pub name: String,
    pub seg_indexes: Vec<usize>,
}

/// One public name from PUBDEF/LPUBDEF.
#[derive(Debug, Clone)]
pub struct PubSym {
    pub name: String,
    /// Module-local segment index; `None` for absolute publics.
    pub seg: Option<usize>,
    pub group: Option<usize>,
    /// Explicit frame for absolute publics.
    pub frame: u16,
    pub offset: u32,
    pub type_index: usize,
    pub local: bool,
}

/// One external name from EXTDEF/LEXTDEF.
#[derive(Debug, Clone)]
pub struct ExtSym {
    pub name: String,
    pub type_index: usize,
}

/// Communal symbol from COMDEF.
#[derive(Debug, Clone)]
pub struct ComSym {
    pub name: String,
    pub is_far: bool,
    pub elem_size: u32,
    pub elem_count: u32,
}

/// COMENT record: class plus raw payload.
#[derive(Debug, Clone)]
pub struct CommentDef {
    pub flags: u8,
    pub class: u8,
    pub text: Vec<u8>,
}

/// ALIAS record: alias name and its substitute.
#[derive(Debug, Clone)]
pub struct AliasDef {
    pub alias: String,
    pub substitute: String,
}

/// One enumerated/iterated data record, expanded to plain bytes, with the
/// fixups of the FIXUPP record(s) that followed it.
#[derive(Debug, Clone)]
pub struct DataBlock {
    /// Module-local segment index (0-based).
    pub seg: usize,
    /// Offset of the first byte within the segment.
    pub offset: u32,
    pub bytes: Vec<u8>,
    pub fixups: Vec<Fixup>,
}

/// Running per-module parse state.
///
/// All lookups are 1-based as encoded; index 0 or past-the-end is a hard
/// format error because every later consumer would silently mis-resolve.
#[derive(Debug, Default)]
pub struct RecordContext {
    pub lnames: Vec<String>,
    pub segdefs: Vec<SegDef>,
    pub grpdefs: Vec<GrpDef>,
    pub extnames: Vec<ExtSym>,
    frame_threads: [Option<FrameSpec>; 4],
    target_threads: [Option<(u8, usize)>; 4],
}

impl RecordContext {
    fn lname(&self, index: usize) -> Result<String, LoadError> {
        if index == 0 {
            return Ok(String::new());
        }
        self.lnames
            .get(index - 1)
            .cloned()
            .ok_or(LoadError::IndexOutOfRange { table: "LNAMES", index })
    }

    fn check_index(len: usize, table: &'static str, index: usize) -> Result<usize, LoadError> {
        if index == 0 || index > len {
            Err(LoadError::IndexOutOfRange { table, index })
        } else {
            Ok(index - 1)
        }
    }

    /// Resolve a fixup target method + index pair against the context
    /// tables. Methods 0..=2 index segments/groups/externals (1-based);
    /// method 3 is an absolute frame number.
    pub fn resolve_fixup_referent(
        &self,
        method: u8,
        datum: usize,
    ) -> Result<FixupReferent, LoadError> {
        match method & 3 {
            0 => Self::check_index(self.segdefs.len(), "SEGDEF", datum).map(FixupReferent::Segment),
            1 => Self::check_index(self.grpdefs.len(), "GRPDEF", datum).map(FixupReferent::Group),
            2 => {
                Self::check_index(self.extnames.len(), "EXTDEF", datum).map(FixupReferent::External)
            }
            _ => Ok(FixupReferent::AbsoluteFrame(datum as u16)),
        }
    }

    fn resolve_frame(&self, method: u8, datum: usize) -> Result<FrameSpec, LoadError> {
        match method {
            0 => Self::check_index(self.segdefs.len(), "SEGDEF", datum).map(FrameSpec::Segment),
            1 => Self::check_index(self.grpdefs.len(), "GRPDEF", datum).map(FrameSpec::Group),
            2 => Self::check_index(self.extnames.len(), "EXTDEF", datum).map(FrameSpec::External),
            3 => Ok(FrameSpec::Absolute(datum as u16)),
            4 => Ok(FrameSpec::UseLocation),
            5 => Ok(FrameSpec::UseTarget),
            other => Err(LoadError::malformed(FIXUPP, format!("bad frame method {other}"))),
        }
    }
}

/// Everything recovered from one object module's record scan.
#[derive(Debug, Default)]
pub struct ParsedModule {
    /// Source name from THEADR/LHEADR.
    pub name: String,
    pub context: RecordContext,
    pub publics: Vec<PubSym>,
    pub comdefs: Vec<ComSym>,
    pub comments: Vec<CommentDef>,
    pub aliases: Vec<AliasDef>,
    pub data: Vec<DataBlock>,
    pub is_main: bool,
    /// Type tags of records we did not recognize (vendor extensions).
    pub unknown_records: Vec<u8>,
}

/// Result of scanning for one module.
#[derive(Debug)]
pub enum ModuleScan {
    /// A complete module ending in MODEND; `next` is the position after it.
    Module(Box<ParsedModule>, usize),
    /// The scan hit the library-end record first: dictionary-only trailer.
    LibraryEnd,
}

/// Scan one object module starting at `pos`.
pub fn parse_module(bytes: &[u8], mut pos: usize) -> Result<ModuleScan, LoadError> {
    let mut module = ParsedModule::default();
    let mut first = true;
    // Index into `module.data` of the record a FIXUPP applies to.
    let mut last_data: Option<usize> = None;

    loop {
        let rec = RawRecord::read(bytes, pos)?;
        if first && rec.kind == LIBEND {
            return Ok(ModuleScan::LibraryEnd);
        }
        first = false;
        pos = rec.next_pos();
        let mut r = RecordReader::new(&rec);

        match rec.kind {
            THEADR | LHEADR => {
                module.name = r.counted_string()?;
            }
            LNAMES => {
                while !r.at_end() {
                    module.context.lnames.push(r.counted_string()?);
                }
            }
            SEGDEF | SEGDEF32 => {
                parse_segdef(&mut r, &mut module.context)?;
            }
            GRPDEF => {
                parse_grpdef(&mut r, &mut module.context)?;
            }
            EXTDEF | LEXTDEF => {
                while !r.at_end() {
                    let name = r.counted_string()?;
                    let type_index = r.index()?;
                    module.context.extnames.push(ExtSym { name, type_index });
                }
            }
            PUBDEF | PUBDEF32 | LPUBDEF | LPUBDEF32 => {
                let local = rec.kind == LPUBDEF || rec.kind == LPUBDEF32;
                parse_pubdef(&mut r, &mut module, local)?;
            }
            COMDEF => {
                parse_comdef(&mut r, &mut module)?;
            }
            COMENT => {
                let flags = r.byte()?;
                let class = r.byte()?;
                module.comments.push(CommentDef { flags, class, text: r.rest().to_vec() });
            }
            ALIAS => {
                while !r.at_end() {
                    let alias = r.counted_string()?;
                    let substitute = r.counted_string()?;
                    module.aliases.push(AliasDef { alias, substitute });
                }
            }
            LEDATA | LEDATA32 => {
                let seg_index = r.index()?;
                let seg =
                    RecordContext::check_index(module.context.segdefs.len(), "SEGDEF", seg_index)?;
                let offset = r.length()?;
                let data = r.rest().to_vec();
                module.data.push(DataBlock { seg, offset, bytes: data, fixups: Vec::new() });
                last_data = Some(module.data.len() - 1);
            }
            LIDATA | LIDATA32 => {
                let seg_index = r.index()?;
                let seg =
                    RecordContext::check_index(module.context.segdefs.len(), "SEGDEF", seg_index)?;
                let offset = r.length()?;
                let mut expanded = Vec::new();
                while !r.at_end() {
                    expand_lidata_block(&mut r, &mut expanded)?;
                }
                module.data.push(DataBlock { seg, offset, bytes: expanded, fixups: Vec::new() });
                last_data = Some(module.data.len() - 1);
            }
            FIXUPP | FIXUPP32 => {
                parse_fixupp(&mut r, &mut module, last_data)?;
            }
            MODEND | MODEND32 => {
                let mod_type = r.byte()?;
                module.is_main = mod_type & 0x80 != 0;
                // A start address may follow; it matters to a loader, not to
                // this analyzer, so the remainder is not interpreted.
                return Ok(ModuleScan::Module(Box::new(module), pos));
            }
            other => {
                log::debug!("skipping unrecognized OMF record {other:#04X} at {:#X}", rec.pos);
                module.unknown_records.push(other);
            }
        }
    }
}

fn parse_segdef(r: &mut RecordReader, ctx: &mut RecordContext) -> Result<(), LoadError> {
    let attr = r.byte()?;
    let alignment = attr >> 5;
    let combination = (attr >> 2) & 7;
    let big = attr & 0x02 != 0;
    let use32 = attr & 0x01 != 0;

    let abs_frame = if alignment == 0 {
        let frame = r.word()?;
        let _offset = r.byte()?;
        Some(frame)
    } else {
        None
    };

    let mut length = r.length()?;
    if big {
        length = 0x1_0000;
    }

    let name_index = r.index()?;
    let class_index = r.index()?;
    let overlay_index = r.index()?;

    ctx.segdefs.push(SegDef {
        name: ctx.lname(name_index)?,
        class: ctx.lname(class_index)?,
        overlay: ctx.lname(overlay_index)?,
        length,
        alignment,
        combination,
        use32,
        abs_frame,
    });
    Ok(())
}

fn parse_grpdef(r: &mut RecordReader, ctx: &mut RecordContext) -> Result<(), LoadError> {
    let name_index = r.index()?;
    let name = ctx.lname(name_index)?;
    let mut seg_indexes = Vec::new();
    while !r.at_end() {
        let kind = r.byte()?;
        if kind != 0xFF {
            return Err(LoadError::malformed(GRPDEF, format!("bad member type {kind:#04X}")));
        }
        let index = r.index()?;
        seg_indexes.push(RecordContext::check_index(ctx.segdefs.len(), "SEGDEF", index)?);
    }
    ctx.grpdefs.push(GrpDef { name, seg_indexes });
    Ok(())
}

fn parse_pubdef(r: &mut RecordReader, module: &mut ParsedModule, local: bool) -> Result<(), LoadError> {
    let group_index = r.index()?;
    let seg_index = r.index()?;

    let group = if group_index == 0 {
        None
    } else {
        Some(RecordContext::check_index(module.context.grpdefs.len(), "GRPDEF", group_index)?)
    };
    let (seg, frame) = if seg_index == 0 {
        // Absolute public: an explicit frame word follows.
        (None, r.word()?)
    } else {
        let seg =
            RecordContext::check_index(module.context.segdefs.len(), "SEGDEF", seg_index)?;
        (Some(seg), 0)
    };

    while !r.at_end() {
        let name = r.counted_string()?;
        let offset = r.length()?;
        let type_index = r.index()?;
        module.publics.push(PubSym { name, seg, group, frame, offset, type_index, local });
    }
    Ok(())
}

fn parse_comdef(r: &mut RecordReader, module: &mut ParsedModule) -> Result<(), LoadError> {
    while !r.at_end() {
        let name = r.counted_string()?;
        let type_index = r.index()?;
        let data_type = r.byte()?;
        let (is_far, elem_size, elem_count) = match data_type {
            0x61 => {
                // FAR: element count then element size.
                let count = r.communal_length()?;
                let size = r.communal_length()?;
                (true, size, count)
            }
            0x62 => (false, r.communal_length()?, 1),
            other => {
                return Err(LoadError::malformed(
                    COMDEF,
                    format!("bad communal data type {other:#04X}"),
                ))
            }
        };
        // Communal names share the external-name index space.
        module.context.extnames.push(ExtSym { name: name.clone(), type_index });
        module.comdefs.push(ComSym { name, is_far, elem_size, elem_count });
    }
    Ok(())
}

fn expand_lidata_block(r: &mut RecordReader, out: &mut Vec<u8>) -> Result<(), LoadError> {
    let repeat = r.length()? as usize;
    let block_count = r.word()? as usize;

    let content: Vec<u8> = if block_count == 0 {
        let n = r.byte()? as usize;
        let mut bytes = Vec::with_capacity(n);
        for _ in 0..n {
            bytes.push(r.byte()?);
        }
        bytes
    } else {
        let mut nested = Vec::new();
        for _ in 0..block_count {
            expand_lidata_block(r, &mut nested)?;
        }
        nested
    };

    let total = repeat.checked_mul(content.len()).unwrap_or(usize::MAX);
    if out.len() + total > MAX_LIDATA_EXPANSION {
        return Err(LoadError::malformed(LIDATA, "iterated data expands beyond limit"));
    }
    for _ in 0..repeat {
        out.extend_from_slice(&content);
    }
    Ok(())
}

fn parse_fixupp(
    r: &mut RecordReader,
    module: &mut ParsedModule,
    last_data: Option<usize>,
) -> Result<(), LoadError> {
    while !r.at_end() {
        let first = r.byte()?;
        if first & 0x80 == 0 {
            // THREAD subrecord: cache a frame or target spec for reuse.
            let is_frame = first & 0x40 != 0;
            let method = (first >> 2) & 7;
            let slot = (first & 3) as usize;
            if is_frame {
                let datum = match method {
                    0..=2 => r.index()?,
                    3 => r.word()? as usize,
                    _ => 0,
                };
                module.context.frame_threads[slot] =
                    Some(module.context.resolve_frame(method, datum)?);
            } else {
                let method = method & 3;
                let datum = match method {
                    0..=2 => r.index()?,
                    _ => r.word()? as usize,
                };
                // Validate eagerly so a bad thread fails at definition site.
                module.context.resolve_fixup_referent(method, datum)?;
                module.context.target_threads[slot] = Some((method, datum));
            }
            continue;
        }

        // FIXUP subrecord. It patches the most recent data record, so one
        // must exist before anything else is resolved.
        let data_index = last_data.ok_or(LoadError::OrphanFixupp)?;
        let second = r.byte()?;
        let mode =
            if first & 0x40 != 0 { FixupMode::SegmentRelative } else { FixupMode::SelfRelative };
        let location = match (first >> 2) & 0xF {
            0 => FixupLocationType::LowByte,
            1 | 5 => FixupLocationType::Offset,
            2 => FixupLocationType::Base,
            3 => FixupLocationType::Pointer,
            other => {
                return Err(LoadError::malformed(FIXUPP, format!("bad location type {other}")))
            }
        };
        let data_offset = ((first as u32 & 3) << 8) | second as u32;

        let fixdata = r.byte()?;
        let frame = if fixdata & 0x80 != 0 {
            let slot = ((fixdata >> 4) & 3) as usize;
            module.context.frame_threads[slot]
                .ok_or_else(|| LoadError::malformed(FIXUPP, "frame thread not defined"))?
        } else {
            let method = (fixdata >> 4) & 7;
            let datum = match method {
                0..=2 => r.index()?,
                3 => r.word()? as usize,
                _ => 0,
            };
            module.context.resolve_frame(method, datum)?
        };

        let (target_method, target_datum) = if fixdata & 0x08 != 0 {
            let slot = (fixdata & 3) as usize;
            module.context.target_threads[slot]
                .ok_or_else(|| LoadError::malformed(FIXUPP, "target thread not defined"))?
        } else {
            let method = fixdata & 3;
            let datum = match method {
                0..=2 => r.index()?,
                _ => r.word()? as usize,
            };
            (method, datum)
        };
        let referent = module.context.resolve_fixup_referent(target_method, target_datum)?;

        // P bit clear: an explicit target displacement follows.
        let displacement = if fixdata & 0x04 == 0 { r.length()? } else { 0 };

        let block = &mut module.data[data_index];
        let start = block.offset + data_offset;
        if start > u16::MAX as u32 {
            return Err(LoadError::malformed(FIXUPP, "fixup offset beyond 64K segment"));
        }
        block.fixups.push(Fixup {
            start: start as u16,
            location,
            mode,
            target: FixupTarget { referent, displacement },
            frame,
        });
    }
    Ok(())
}
