//! Worklist-driven control-flow analysis.
//!
//! The engine pops discovered control-flow edges off a queue and decodes a
//! run of instructions at each new target, classifying bytes as it goes.
//! Classification is the visited set: a target whose lead byte is already
//! code ends the run immediately, so every byte is decoded at most once and
//! the worklist terminates on any input.
//!
//! What differs between an executable and an object library — how branch
//! targets are resolved, what vetoes a decode, where symbolic operand tags
//! come from — is behind [`AnalysisSubject`]. The engine itself never looks
//! at relocation tables or fixups.

pub mod exe;
pub mod library;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::addr::Address;
use crate::dec::{DecodeError, Decoder, Flow, Inst};
use crate::image::{BasicBlock, BlockEdge, BlockEdgeKind, ByteKind, Image, Procedure};
use crate::xref::{XRef, XRefType};

/// Tunables for one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Upper bound on entries walked per indexed jump table.
    pub max_jump_table_entries: usize,
    /// Fetch window for a single instruction, in bytes.
    pub max_instruction_len: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self { max_jump_table_entries: 1024, max_instruction_len: 16 }
    }
}

/// What [`AnalysisSubject::annotate`] learned about one instruction.
#[derive(Debug, Default)]
pub struct Annotation {
    /// Real flow target recovered from relocation or fixup knowledge, where
    /// the encoded bytes hold a placeholder.
    pub flow_target: Option<Address>,
    /// Fixups that could not be matched to an operand field. Reported as
    /// diagnostics; the instruction itself stands.
    pub broken_fixups: Vec<String>,
}

/// The format-specific half of an analysis: resolution and annotation
/// driven by relocation or fixup knowledge.
pub trait AnalysisSubject: crate::image::Image {
    fn image_mut(&mut self) -> &mut crate::image::BinaryImage;

    /// Veto decoding at `at` before any bytes are touched. The returned
    /// message becomes an error diagnostic and the branch is abandoned.
    fn check_lead(&self, at: Address) -> Result<(), String>;

    /// Inspect a freshly decoded instruction: attach symbolic operand tags,
    /// recover the real flow target where relocation or fixup knowledge
    /// names one the encoded bytes cannot, and report fixups that do not
    /// line up with any operand field.
    fn annotate(&self, at: Address, bytes: &[u8], inst: &mut Inst) -> Annotation;

    /// Map a ptr16:16 transfer to an image address; `INVALID` when the
    /// frame does not correspond to a known segment.
    fn resolve_far(&self, frame: u16, offset: u16) -> Address;
}

/// The worklist engine, generic over the two assembly kinds.
pub struct Analyzer<'a, S: AnalysisSubject> {
    subject: &'a mut S,
    decoder: Decoder,
    options: AnalysisOptions,
    queue: VecDeque<XRef>,
    /// Entries walked so far per jump-table source instruction.
    table_walked: HashMap<Address, usize>,
}

impl<'a, S: AnalysisSubject> Analyzer<'a, S> {
    pub fn new(subject: &'a mut S, options: AnalysisOptions) -> Result<Self, DecodeError> {
        Ok(Self {
            subject,
            decoder: Decoder::new()?,
            options,
            queue: VecDeque::new(),
            table_walked: HashMap::new(),
        })
    }

    /// Seed the worklist with a caller-supplied entry point.
    pub fn enqueue_entry(&mut self, target: Address) {
        self.emit(XRef::new(Address::INVALID, target, XRefType::UserSpecified), true);
    }

    /// Drain the worklist, then derive basic blocks and procedures from the
    /// discovered instructions and edges.
    pub fn run(&mut self) {
        while let Some(xref) = self.queue.pop_front() {
            if xref.kind == XRefType::NearIndexedJump && !xref.target.is_valid() {
                self.walk_table_entry(xref);
            } else {
                self.decode_run(xref);
            }
        }
        self.build_basic_blocks();
        self.build_procedures();
    }

    /// Record a discovered edge and queue its target for decoding.
    /// Placeholder edges for pending jump-table entries are queued without
    /// being recorded.
    fn emit(&mut self, xref: XRef, record: bool) {
        if record {
            self.subject.image_mut().xrefs.push(xref);
        }
        if xref.target.is_valid() || xref.kind == XRefType::NearIndexedJump {
            self.queue.push_back(xref);
        }
    }

    fn emit_unresolved(&mut self, source: Address, kind: XRefType, note: &str) {
        self.subject.image_mut().xrefs.push(XRef::new(source, Address::INVALID, kind));
        self.subject.image_mut().errors.message(source, note.to_string());
    }

    /// Decode instructions from `xref.target` until the run ends: any
    /// branch, already-analyzed code, or an error. Calls queue their
    /// targets and keep decoding at the fall-through; a conditional jump
    /// ends the run and queues both arms, taken edge first.
    fn decode_run(&mut self, xref: XRef) {
        let mut ip = xref.target;
        loop {
            let attr = match self.subject.image().attr(ip) {
                Some(a) => a,
                None => {
                    self.subject
                        .image_mut()
                        .errors
                        .error(ip, "branch target is outside the loaded image");
                    return;
                }
            };
            match attr.kind {
                ByteKind::Code if attr.is_lead => return,
                ByteKind::Code => {
                    self.subject
                        .image_mut()
                        .errors
                        .error(ip, "control transfer into the middle of an instruction");
                    return;
                }
                ByteKind::Data => {
                    self.subject.image_mut().errors.error(ip, "control transfer into data");
                    return;
                }
                ByteKind::Unknown => {}
            }

            if let Err(msg) = self.subject.check_lead(ip) {
                self.subject.image_mut().errors.error(ip, msg);
                return;
            }

            let buf: Vec<u8> =
                match self.subject.image().get_bytes(ip, self.options.max_instruction_len) {
                    Some(b) if !b.is_empty() => b.to_vec(),
                    _ => {
                        self.subject.image_mut().errors.error(ip, "no bytes at decode position");
                        return;
                    }
                };
            let mut inst = match self.decoder.decode_one(&buf, ip.off) {
                Ok(i) => i,
                Err(e) => {
                    self.subject
                        .image_mut()
                        .errors
                        .error(ip, format!("undecodable instruction: {e}"));
                    return;
                }
            };

            let len = inst.len;
            let annotation = self.subject.annotate(ip, &buf[..len as usize], &mut inst);
            for note in annotation.broken_fixups {
                self.subject.image_mut().errors.error(ip, note);
            }
            let override_target = annotation.flow_target;

            match self.subject.image_mut().classify(ip, len as u16, ByteKind::Code) {
                Ok(clamps) => {
                    for clamp in clamps.into_iter().filter(|c| c.conflict) {
                        self.subject.image_mut().errors.warning(
                            ip,
                            format!(
                                "segment {} overlap unresolvable: bounds end {:#X} vs observed coverage past {:#X}",
                                clamp.seg, clamp.old_end, clamp.new_end
                            ),
                        );
                    }
                }
                Err(conflict) => {
                    self.subject.image_mut().errors.error(
                        ip,
                        format!(
                            "instruction overlaps already-classified {:?} byte at {}",
                            conflict.existing, conflict.at
                        ),
                    );
                    return;
                }
            }

            let flow = inst.flow;
            let table_disp = inst.is_cs_indexed_mem();
            self.subject.image_mut().instructions.insert(ip, inst);
            let next = ip.wrapping_add(len as u16);

            match flow {
                Flow::Sequential => ip = next,
                Flow::Terminal => return,
                Flow::NearJump(t) => {
                    let target = override_target.unwrap_or(Address::new(ip.seg, t));
                    self.emit(XRef::new(ip, target, XRefType::NearJump), true);
                    return;
                }
                Flow::ConditionalJump(t) => {
                    let target = override_target.unwrap_or(Address::new(ip.seg, t));
                    self.emit(XRef::new(ip, target, XRefType::ConditionalJump), true);
                    // The fall-through is the lower-priority arm: queued
                    // behind the taken edge, not decoded inline, so the
                    // taken side claims contested bytes first.
                    self.queue.push_back(XRef::new(ip, next, XRefType::ConditionalJump));
                    return;
                }
                Flow::NearCall(t) => {
                    let target = override_target.unwrap_or(Address::new(ip.seg, t));
                    self.emit(XRef::new(ip, target, XRefType::NearCall), true);
                    ip = next;
                }
                Flow::FarJump(frame, off) => {
                    let target =
                        override_target.unwrap_or_else(|| self.subject.resolve_far(frame, off));
                    if !target.is_valid() {
                        self.subject.image_mut().errors.warning(
                            ip,
                            format!("far jump to unmapped frame {frame:04X}:{off:04X}"),
                        );
                    }
                    self.emit(XRef::new(ip, target, XRefType::FarJump), true);
                    return;
                }
                Flow::FarCall(frame, off) => {
                    let target =
                        override_target.unwrap_or_else(|| self.subject.resolve_far(frame, off));
                    if !target.is_valid() {
                        self.subject.image_mut().errors.warning(
                            ip,
                            format!("far call to unmapped frame {frame:04X}:{off:04X}"),
                        );
                    }
                    self.emit(XRef::new(ip, target, XRefType::FarCall), true);
                    ip = next;
                }
                Flow::IndirectJump => {
                    if let Some(disp) = table_disp {
                        // Walk the jump table one entry at a time.
                        self.queue.push_back(XRef {
                            source: ip,
                            target: Address::INVALID,
                            kind: XRefType::NearIndexedJump,
                            data_location: Some(Address::new(ip.seg, disp)),
                        });
                    } else {
                        self.emit_unresolved(
                            ip,
                            XRefType::NearJump,
                            "indirect jump target not recoverable statically",
                        );
                    }
                    return;
                }
                Flow::IndirectCall => {
                    self.emit_unresolved(
                        ip,
                        XRefType::NearCall,
                        "indirect call target not recoverable statically",
                    );
                    ip = next;
                }
            }
        }
    }

    /// Process one pending jump-table entry and, if it looks live, queue
    /// both its branch target and the next table slot.
    ///
    /// The walk stops conservatively: at the first slot already claimed by
    /// other analysis, at a slot whose value does not name decodable bytes,
    /// and at the per-table entry cap.
    fn walk_table_entry(&mut self, xref: XRef) {
        let Some(entry_at) = xref.data_location else { return };

        let walked = self.table_walked.entry(xref.source).or_insert(0);
        if *walked >= self.options.max_jump_table_entries {
            self.subject
                .image_mut()
                .errors
                .message(xref.source, "jump table walk stopped at entry limit");
            return;
        }
        *walked += 1;

        let image = self.subject.image();
        let both_unknown = image.attr(entry_at).is_some_and(|a| a.is_unknown())
            && image.attr(entry_at.wrapping_add(1)).is_some_and(|a| a.is_unknown());
        if !both_unknown {
            return;
        }
        let Some(word) = image.word(entry_at) else { return };
        let target = Address::new(xref.source.seg, word);
        let plausible = image.attr(target).is_some_and(|a| a.is_unknown() || a.is_code_lead());
        if !plausible {
            return;
        }

        if self.subject.image_mut().classify(entry_at, 2, ByteKind::Data).is_err() {
            return;
        }

        self.emit(
            XRef {
                source: xref.source,
                target,
                kind: XRefType::NearIndexedJump,
                data_location: Some(entry_at),
            },
            true,
        );
        self.queue.push_back(XRef {
            source: xref.source,
            target: Address::INVALID,
            kind: XRefType::NearIndexedJump,
            data_location: Some(entry_at.wrapping_add(2)),
        });
    }

    /// Partition the decoded instructions into maximal straight-line blocks.
    fn build_basic_blocks(&mut self) {
        let blocks = {
            let image = self.subject.image();

            let mut leaders: BTreeSet<Address> = BTreeSet::new();
            let mut jump_edges: HashMap<Address, Vec<XRef>> = HashMap::new();
            for x in &image.xrefs {
                if x.target.is_valid() && image.instructions.contains_key(&x.target) {
                    leaders.insert(x.target);
                    if x.source.is_valid() && !x.kind.is_call() {
                        jump_edges.entry(x.source).or_default().push(*x);
                    }
                }
            }

            let successors_of = |addr: Address, len: u8, flow: Flow| -> Vec<BlockEdge> {
                let mut out = Vec::new();
                let next = addr.wrapping_add(len as u16);
                let falls = matches!(
                    flow,
                    Flow::Sequential
                        | Flow::NearCall(_)
                        | Flow::FarCall(..)
                        | Flow::IndirectCall
                        | Flow::ConditionalJump(_)
                );
                if falls && image.instructions.contains_key(&next) {
                    out.push(BlockEdge { target: next, kind: BlockEdgeKind::Fallthrough });
                }
                if let Some(edges) = jump_edges.get(&addr) {
                    for e in edges {
                        out.push(BlockEdge { target: e.target, kind: BlockEdgeKind::Jump(e.kind) });
                    }
                }
                out
            };

            let close = |blocks: &mut BTreeMap<Address, BasicBlock>,
                         start: Address,
                         last: (Address, u8, Flow)| {
                let (last_addr, last_len, last_flow) = last;
                let len = last_addr.off.wrapping_sub(start.off).wrapping_add(last_len as u16);
                blocks.insert(
                    start,
                    BasicBlock {
                        start,
                        len,
                        successors: successors_of(last_addr, last_len, last_flow),
                    },
                );
            };

            let mut blocks: BTreeMap<Address, BasicBlock> = BTreeMap::new();
            let mut start: Option<Address> = None;
            let mut last: Option<(Address, u8, Flow)> = None;
            for (&addr, inst) in &image.instructions {
                let contiguous = last
                    .map(|(a, l, f)| {
                        addr == a.wrapping_add(l as u16)
                            && matches!(
                                f,
                                Flow::Sequential
                                    | Flow::NearCall(_)
                                    | Flow::FarCall(..)
                                    | Flow::IndirectCall
                            )
                    })
                    .unwrap_or(false);
                if let Some(s) = start {
                    if !contiguous || leaders.contains(&addr) {
                        close(&mut blocks, s, last.expect("open block has a last instruction"));
                        start = Some(addr);
                    }
                } else {
                    start = Some(addr);
                }
                last = Some((addr, inst.len, inst.flow));
            }
            if let (Some(s), Some(l)) = (start, last) {
                close(&mut blocks, s, l);
            }
            blocks
        };
        self.subject.image_mut().basic_blocks = blocks;
    }

    /// Group blocks into procedures seeded at call targets and entry
    /// points, following intra-procedure edges. Another procedure's entry
    /// bounds the walk, so a tail jump into a called routine never absorbs
    /// it; a non-entry block reachable from two procedures stays with
    /// whichever claimed it first.
    fn build_procedures(&mut self) {
        let procedures = {
            let image = self.subject.image();

            let mut seeds: Vec<Address> = image
                .xrefs
                .iter()
                .filter(|x| x.kind.is_call() && x.target.is_valid())
                .map(|x| x.target)
                .filter(|t| image.basic_blocks.contains_key(t))
                .collect();
            seeds.sort();
            seeds.dedup();
            let seed_set: HashSet<Address> = seeds.iter().copied().collect();

            let mut claimed: HashSet<Address> = HashSet::new();
            let mut procedures: BTreeMap<Address, Procedure> = BTreeMap::new();
            for seed in seeds {
                let mut owned = Vec::new();
                let mut size = 0u32;
                let mut pending = vec![seed];
                while let Some(at) = pending.pop() {
                    if !claimed.insert(at) {
                        continue;
                    }
                    let Some(block) = image.basic_blocks.get(&at) else { continue };
                    owned.push(at);
                    size += block.len as u32;
                    for edge in &block.successors {
                        if edge.target != seed && seed_set.contains(&edge.target) {
                            continue;
                        }
                        pending.push(edge.target);
                    }
                }
                owned.sort();
                procedures.insert(
                    seed,
                    Procedure { entry: seed, name: String::new(), blocks: owned, size },
                );
            }
            procedures
        };
        self.subject.image_mut().procedures = procedures;
    }
}
