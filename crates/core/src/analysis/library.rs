//! Library-specific analysis: fixup-driven resolution.
//!
//! In an object library the encoded branch displacements are meaningless
//! placeholders; the fixups attached to each logical segment carry the real
//! targets. Every fixup inside an instruction must line up with one of its
//! patchable operand fields, with one historical exception: the Microsoft
//! floating-point emulator patches instruction *opcodes* through fixups
//! against a fixed set of well-known externals, so those are let through.

use crate::addr::Address;
use crate::dec::{DecodeError, Flow, Inst};
use crate::image::Image;
use crate::object::fixup::{Fixup, FixupLocationType, FixupMode, FixupReferent};
use crate::object::LibraryImage;

use super::{AnalysisOptions, AnalysisSubject, Analyzer, Annotation};

/// Externals the MS floating-point emulator resolves by patching the two
/// leading opcode bytes (an `int` pair) of the instruction itself.
const FP_EMULATOR_EXTERNALS: &[&str] = &[
    "FIARQQ", "FICRQQ", "FIDRQQ", "FIERQQ", "FISRQQ", "FIWRQQ", "FIJRQQ", "FJARQQ", "FJCRQQ",
    "FJSRQQ",
];

fn is_fp_emulator_fixup(image: &LibraryImage, seg: u16, fixup: &Fixup) -> bool {
    image
        .external_name(seg, fixup.target.referent)
        .is_some_and(|name| FP_EMULATOR_EXTERNALS.contains(&name))
}

impl AnalysisSubject for LibraryImage {
    fn image_mut(&mut self) -> &mut crate::image::BinaryImage {
        LibraryImage::image_mut(self)
    }

    /// A fixup starting exactly at the would-be lead byte means the bytes
    /// hold a patched value, not an instruction, unless it is one of the
    /// FP-emulator opcode patches.
    fn check_lead(&self, at: Address) -> Result<(), String> {
        let Some(fixups) = self.fixups_of(at.seg) else { return Ok(()) };
        match fixups.at(at.off) {
            Some(f) if is_fp_emulator_fixup(self, at.seg, f) => Ok(()),
            Some(f) => Err(format!(
                "{:?} fixup at the instruction start marks these bytes as data",
                f.location
            )),
            None => Ok(()),
        }
    }

    /// Match every fixup inside the instruction against its patchable
    /// operand fields, attach symbolic tags, and recover the real branch
    /// target from self-relative offset and far-pointer fixups. A fixup
    /// matching no field is reported and discarded; the instruction stands.
    fn annotate(&self, at: Address, bytes: &[u8], inst: &mut Inst) -> Annotation {
        let mut out = Annotation::default();
        let Some(fixups) = self.fixups_of(at.seg) else { return out };
        let Some(origin) = self.origin(at.seg) else { return out };

        let spans = inst.fixable_spans(bytes, at.off);
        let end = at.off as u32 + inst.len as u32;

        for fixup in fixups.in_range(at.off, end) {
            let rel = (fixup.start - at.off) as u8;
            if rel == 0 && is_fp_emulator_fixup(self, at.seg, fixup) {
                continue;
            }
            let Some(span) = spans.iter().find(|s| s.start == rel && s.len() as u16 == fixup.len())
            else {
                out.broken_fixups.push(format!(
                    "fixup at byte +{rel} does not line up with an operand field, discarded"
                ));
                continue;
            };

            inst.ops[span.op].tag = Some(self.describe_target(origin.module, fixup));

            let is_branch_offset = fixup.mode == FixupMode::SelfRelative
                && fixup.location == FixupLocationType::Offset
                && matches!(
                    inst.flow,
                    Flow::NearJump(_) | Flow::NearCall(_) | Flow::ConditionalJump(_)
                );
            let is_far_pointer = fixup.location == FixupLocationType::Pointer
                && matches!(inst.flow, Flow::FarJump(..) | Flow::FarCall(..));
            if is_branch_offset || is_far_pointer {
                out.flow_target = Some(
                    self.resolve_target(origin.module, &fixup.target)
                        .unwrap_or(Address::INVALID),
                );
            }
        }
        out
    }

    /// Encoded far frames in an object file are placeholders; without a
    /// matching pointer fixup there is nothing to resolve against.
    fn resolve_far(&self, _frame: u16, _offset: u16) -> Address {
        Address::INVALID
    }
}

impl LibraryImage {
    /// Human-readable rendering of a fixup target for operand tags,
    /// e.g. `_printf`, `_TEXT+0x12`.
    fn describe_target(&self, module: usize, fixup: &Fixup) -> String {
        let library = self.library();
        let base = match fixup.target.referent {
            FixupReferent::External(ei) => library.modules[module]
                .externals
                .get(ei)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| format!("ext_{ei}")),
            FixupReferent::Segment(si) => library.modules[module]
                .segments
                .get(si)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| format!("seg_{si}")),
            FixupReferent::Group(gi) => library.modules[module]
                .groups
                .get(gi)
                .map(|g| g.name.clone())
                .unwrap_or_else(|| format!("grp_{gi}")),
            FixupReferent::AbsoluteFrame(frame) => format!("{frame:04X}h"),
        };
        if fixup.target.displacement != 0 {
            format!("{base}+{:#X}", fixup.target.displacement)
        } else {
            base
        }
    }
}

/// Analyze every module of a library: seed at each public symbol placed in
/// a code-class segment, drain the worklist, then name the procedures.
pub fn analyze_library(
    lib: &mut LibraryImage,
    options: AnalysisOptions,
) -> Result<(), DecodeError> {
    let entries = lib.code_entries();
    {
        let mut analyzer = Analyzer::new(lib, options)?;
        for (addr, _) in &entries {
            analyzer.enqueue_entry(*addr);
        }
        analyzer.run();
    }

    let names: Vec<(Address, String)> = Image::image(lib)
        .procedures
        .keys()
        .map(|&a| {
            let name = lib
                .symbol_at(a)
                .map(str::to_string)
                .unwrap_or_else(|| format!("sub_{:03}_{:04X}", a.seg, a.off));
            (a, name)
        })
        .collect();
    for (a, name) in names {
        if let Some(p) = lib.image_mut().procedures.get_mut(&a) {
            p.name = name;
        }
    }

    log::info!(
        "library analysis finished: {} entry points, {} instructions, {} procedures",
        entries.len(),
        Image::image(lib).instructions.len(),
        Image::image(lib).procedures.len()
    );
    Ok(())
}
