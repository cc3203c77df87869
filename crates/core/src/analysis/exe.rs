//! Executable-specific analysis: relocation-driven resolution.

use crate::addr::Address;
use crate::dec::{DecodeError, Inst, Operand};
use crate::exe::{Executable, ExecutableImage};
use crate::image::Image;

use super::{AnalysisOptions, AnalysisSubject, Analyzer, Annotation};

impl AnalysisSubject for ExecutableImage {
    fn image_mut(&mut self) -> &mut crate::image::BinaryImage {
        ExecutableImage::image_mut(self)
    }

    /// A word patched by the relocation table holds a segment frame, so a
    /// relocation site covering the lead byte rules out an instruction.
    fn check_lead(&self, at: Address) -> Result<(), String> {
        let prev = Address::new(at.seg, at.off.wrapping_sub(1));
        if self.is_address_relocatable(at) || self.is_address_relocatable(prev) {
            Err("relocated word covers the instruction start".to_string())
        } else {
            Ok(())
        }
    }

    /// Tag operand fields that relocation proves to hold segment frames.
    fn annotate(&self, at: Address, bytes: &[u8], inst: &mut Inst) -> Annotation {
        for span in inst.fixable_spans(bytes, at.off) {
            // For a ptr16:16 field the patched word is the frame half, the
            // trailing two bytes.
            let word_at = match inst.ops[span.op].op {
                Operand::FarPtr { .. } => at.wrapping_add(span.start as u16 + 2),
                _ => at.wrapping_add(span.start as u16),
            };
            if !self.is_address_relocatable(word_at) {
                continue;
            }
            if let Some(frame) = Image::image(self).word(word_at) {
                inst.ops[span.op].tag = Some(format!("seg_{frame:04X}"));
            }
        }
        Annotation::default()
    }

    fn resolve_far(&self, frame: u16, offset: u16) -> Address {
        self.frames().map(frame, offset)
    }
}

/// Run the whole analysis of a loaded executable: seed at the program
/// entry, drain the worklist, then name the discovered procedures.
pub fn analyze_executable(
    exe: &mut Executable,
    options: AnalysisOptions,
) -> Result<(), DecodeError> {
    let entry = exe.entry;
    {
        let mut analyzer = Analyzer::new(&mut exe.image, options)?;
        analyzer.enqueue_entry(entry);
        analyzer.run();
    }
    name_procedures(&mut exe.image, entry);
    log::info!(
        "analysis finished: {} instructions, {} procedures, {} diagnostics",
        Image::image(&exe.image).instructions.len(),
        Image::image(&exe.image).procedures.len(),
        Image::image(&exe.image).errors.len()
    );
    Ok(())
}

/// The entry procedure is `start`; everything else is named after its
/// five-hex-digit linear address.
fn name_procedures(image: &mut ExecutableImage, entry: Address) {
    let names: Vec<(Address, String)> = Image::image(image)
        .procedures
        .keys()
        .map(|&a| {
            let name = if a == entry {
                "start".to_string()
            } else {
                let frame = image.frames().frame_of(a.seg).unwrap_or(0) as u32;
                format!("sub_{:05X}", frame * 16 + a.off as u32)
            };
            (a, name)
        })
        .collect();
    for (a, name) in names {
        if let Some(p) = image.image_mut().procedures.get_mut(&a) {
            p.name = name;
        }
    }
}
