//! Instruction decoder seam.
//!
//! The analysis engine does not know how x86 bytes are decoded; it consumes
//! the [`Inst`] form produced here. Decoding itself is delegated to capstone
//! in 16-bit mode. Everything downstream (flow classification, operand
//! kinds, fixable operand spans) is derived once, at decode time, so the
//! engine can match on closed enums instead of poking at capstone details.

use capstone::arch::x86::{X86Insn, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use capstone::{Capstone, InsnGroupId, InsnGroupType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder initialization failed: {0}")]
    Init(String),
    #[error("no instruction could be decoded")]
    NoInstruction,
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Falls through to the next instruction.
    Sequential,
    /// RET/RETF/IRET/HLT: execution does not continue past this point.
    Terminal,
    /// Near jump with a relative target resolved to an in-segment offset.
    NearJump(u16),
    /// Conditional jump: taken target offset; fall-through is implicit.
    ConditionalJump(u16),
    /// Near call with a relative target.
    NearCall(u16),
    /// Far jump through a ptr16:16 operand (frame, offset).
    FarJump(u16, u16),
    /// Far call through a ptr16:16 operand (frame, offset).
    FarCall(u16, u16),
    /// Jump through a register or memory operand.
    IndirectJump,
    /// Call through a register or memory operand.
    IndirectCall,
}

/// Decoded operand, reduced to what the analysis engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(String),
    /// Immediate value; `size` is the operand width in bytes.
    Imm { value: i64, size: u8 },
    /// Memory reference. Register names are capstone's lowercase spellings.
    Mem {
        seg: Option<String>,
        base: Option<String>,
        index: Option<String>,
        disp: i64,
        size: u8,
    },
    /// ptr16:16 far pointer operand (frame, offset).
    FarPtr { frame: u16, offset: u16 },
}

/// An operand plus the symbolic tag a fixup may attach to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedOperand {
    pub op: Operand,
    /// Symbolic target attached by fixup matching, e.g. `_printf+2`.
    pub tag: Option<String>,
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Inst {
    /// Instruction length in bytes. Always at least 1.
    pub len: u8,
    /// Raw instruction id (capstone `X86Insn` value).
    pub id: u32,
    /// Rendered mnemonic + operands, for listings.
    pub text: String,
    pub flow: Flow,
    pub ops: Vec<TaggedOperand>,
}

/// A byte range within an instruction that holds a patchable operand field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixableSpan {
    /// Index into [`Inst::ops`] of the operand the field encodes.
    pub op: usize,
    pub start: u8,
    pub end: u8,
}

impl FixableSpan {
    pub fn len(&self) -> u8 {
        self.end - self.start
    }
}

impl Inst {
    /// Byte ranges (within the instruction) of 16-bit operand fields that a
    /// fixup may legitimately patch, in left-to-right operand order. `ip`
    /// is the in-segment offset the instruction was decoded at.
    ///
    /// Capstone does not expose encoded-field offsets, so the spans are
    /// recovered by scanning the encoded bytes for the little-endian field
    /// value, resuming after the previously found span. Relative branch
    /// immediates are converted back to their encoded displacement before
    /// the scan. A field encoded in a shorter form (disp8, rel8) yields no
    /// span.
    pub fn fixable_spans(&self, bytes: &[u8], ip: u16) -> Vec<FixableSpan> {
        let relative = matches!(
            self.flow,
            Flow::NearJump(_) | Flow::ConditionalJump(_) | Flow::NearCall(_)
        );
        let mut spans = Vec::new();
        let mut from = 1usize; // never inside the leading opcode byte
        for (oi, op) in self.ops.iter().enumerate() {
            match &op.op {
                Operand::FarPtr { .. } => {
                    // ptr16:16 is always the trailing 4 bytes.
                    if self.len >= 4 {
                        spans.push(FixableSpan { op: oi, start: self.len - 4, end: self.len });
                        from = self.len as usize;
                    }
                }
                Operand::Imm { value, size: 2 } => {
                    // Capstone resolves relative branches to their absolute
                    // target; the encoded bytes hold the displacement.
                    let field = if relative {
                        (*value as u16).wrapping_sub(ip.wrapping_add(self.len as u16))
                    } else {
                        *value as u16
                    };
                    if let Some(at) = find_word(bytes, from, field) {
                        spans.push(FixableSpan { op: oi, start: at as u8, end: at as u8 + 2 });
                        from = at + 2;
                    }
                }
                Operand::Mem { disp, .. } => {
                    if let Some(at) = find_word(bytes, from, *disp as u16) {
                        spans.push(FixableSpan { op: oi, start: at as u8, end: at as u8 + 2 });
                        from = at + 2;
                    }
                }
                _ => {}
            }
        }
        spans
    }

    /// True for memory operands of the shape `[cs:base+disp16]` with no
    /// index register: the near indexed jump-table pattern.
    pub fn is_cs_indexed_mem(&self) -> Option<u16> {
        if self.ops.len() != 1 {
            return None;
        }
        match &self.ops[0].op {
            Operand::Mem { seg: Some(seg), base: Some(_), index: None, disp, .. }
                if seg == "cs" && *disp >= 0 && *disp <= 0xFFFF =>
            {
                Some(*disp as u16)
            }
            _ => None,
        }
    }
}

fn find_word(bytes: &[u8], from: usize, value: u16) -> Option<usize> {
    let le = value.to_le_bytes();
    if bytes.len() < 2 {
        return None;
    }
    (from..=bytes.len().saturating_sub(2)).find(|&i| bytes[i] == le[0] && bytes[i + 1] == le[1])
}

/// Capstone-backed 16-bit x86 decoder.
pub struct Decoder {
    cs: Capstone,
}

impl Decoder {
    pub fn new() -> Result<Self, DecodeError> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode16)
            .detail(true)
            .build()
            .map_err(|e| DecodeError::Init(e.to_string()))?;
        Ok(Self { cs })
    }

    /// Decode exactly one instruction from `bytes`, treating the first byte
    /// as sitting at in-segment offset `ip`.
    ///
    /// Relative branch targets are resolved against `ip` (with 16-bit
    /// wraparound) before they reach the caller.
    pub fn decode_one(&self, bytes: &[u8], ip: u16) -> Result<Inst, DecodeError> {
        let insns = self
            .cs
            .disasm_count(bytes, ip as u64, 1)
            .map_err(|_| DecodeError::NoInstruction)?;
        let i = insns.iter().next().ok_or(DecodeError::NoInstruction)?;

        let detail = self.cs.insn_detail(&i).map_err(|_| DecodeError::NoInstruction)?;
        let mut ops = self.convert_operands(&detail);
        let flow = classify_flow(i.id().0, &detail, &ops);

        // A ptr16:16 operand surfaces from capstone as two immediates
        // (segment, then offset). Fold them back into one far pointer so the
        // engine and the fixup matcher see a single 4-byte field.
        if let Flow::FarJump(frame, offset) | Flow::FarCall(frame, offset) = flow {
            ops = vec![TaggedOperand { op: Operand::FarPtr { frame, offset }, tag: None }];
        }

        let text = format!("{} {}", i.mnemonic().unwrap_or(""), i.op_str().unwrap_or(""))
            .trim()
            .to_string();

        Ok(Inst { len: i.bytes().len() as u8, id: i.id().0, text, flow, ops })
    }

    fn convert_operands(&self, detail: &capstone::InsnDetail) -> Vec<TaggedOperand> {
        let arch_detail = detail.arch_detail();
        let raw = arch_detail.operands();
        let mut ops = Vec::with_capacity(raw.len());
        for op in &raw {
            let ArchOperand::X86Operand(x) = op else { continue };
            let converted = match &x.op_type {
                X86OperandType::Reg(r) => {
                    Operand::Reg(self.cs.reg_name(*r).unwrap_or_default())
                }
                X86OperandType::Imm(v) => Operand::Imm { value: *v, size: x.size },
                X86OperandType::Mem(m) => {
                    let name = |r: RegId| {
                        if r == RegId::INVALID_REG {
                            None
                        } else {
                            self.cs.reg_name(r)
                        }
                    };
                    Operand::Mem {
                        seg: name(m.segment()),
                        base: name(m.base()),
                        index: name(m.index()),
                        disp: m.disp(),
                        size: x.size,
                    }
                }
                X86OperandType::Invalid => continue,
            };
            ops.push(TaggedOperand { op: converted, tag: None });
        }
        ops
    }
}

fn has_group(detail: &capstone::InsnDetail, group: InsnGroupType::Type) -> bool {
    detail.groups().iter().any(|g| *g == InsnGroupId(group as u8))
}

fn is_conditional(id: u32) -> bool {
    const CONDITIONAL: &[X86Insn] = &[
        X86Insn::X86_INS_JAE,
        X86Insn::X86_INS_JA,
        X86Insn::X86_INS_JBE,
        X86Insn::X86_INS_JB,
        X86Insn::X86_INS_JCXZ,
        X86Insn::X86_INS_JECXZ,
        X86Insn::X86_INS_JE,
        X86Insn::X86_INS_JGE,
        X86Insn::X86_INS_JG,
        X86Insn::X86_INS_JLE,
        X86Insn::X86_INS_JL,
        X86Insn::X86_INS_JNE,
        X86Insn::X86_INS_JNO,
        X86Insn::X86_INS_JNP,
        X86Insn::X86_INS_JNS,
        X86Insn::X86_INS_JO,
        X86Insn::X86_INS_JP,
        X86Insn::X86_INS_JS,
        X86Insn::X86_INS_LOOP,
        X86Insn::X86_INS_LOOPE,
        X86Insn::X86_INS_LOOPNE,
    ];
    CONDITIONAL.iter().any(|c| *c as u32 == id)
}

fn is_terminal(id: u32) -> bool {
    id == X86Insn::X86_INS_RET as u32
        || id == X86Insn::X86_INS_RETF as u32
        || id == X86Insn::X86_INS_IRET as u32
        || id == X86Insn::X86_INS_HLT as u32
}

fn classify_flow(id: u32, detail: &capstone::InsnDetail, ops: &[TaggedOperand]) -> Flow {
    if is_terminal(id) {
        return Flow::Terminal;
    }

    let far = id == X86Insn::X86_INS_LJMP as u32 || id == X86Insn::X86_INS_LCALL as u32;
    if far {
        // ptr16:16 form decodes as two immediates: segment frame, offset.
        if let (
            Some(TaggedOperand { op: Operand::Imm { value: frame, .. }, .. }),
            Some(TaggedOperand { op: Operand::Imm { value: offset, .. }, .. }),
        ) = (ops.first(), ops.get(1))
        {
            let frame = *frame as u16;
            let offset = *offset as u16;
            return if id == X86Insn::X86_INS_LCALL as u32 {
                Flow::FarCall(frame, offset)
            } else {
                Flow::FarJump(frame, offset)
            };
        }
        // ljmp/lcall through an m16:16 memory operand.
        return if id == X86Insn::X86_INS_LCALL as u32 {
            Flow::IndirectCall
        } else {
            Flow::IndirectJump
        };
    }

    let is_call = has_group(detail, InsnGroupType::CS_GRP_CALL);
    let is_jump = has_group(detail, InsnGroupType::CS_GRP_JUMP) || is_conditional(id);
    if !is_call && !is_jump {
        return Flow::Sequential;
    }

    // Relative forms carry a resolved immediate target; everything else is
    // an indirect transfer through a register or memory.
    let target = ops.first().and_then(|o| match o.op {
        Operand::Imm { value, .. } => Some((value as u64 & 0xFFFF) as u16),
        _ => None,
    });

    match (is_call, target) {
        (true, Some(t)) => Flow::NearCall(t),
        (true, None) => Flow::IndirectCall,
        (false, Some(t)) => {
            if is_conditional(id) {
                Flow::ConditionalJump(t)
            } else {
                Flow::NearJump(t)
            }
        }
        (false, None) => Flow::IndirectJump,
    }
}
