//! Object model: modules, logical segments, and symbols assembled from
//! parsed OMF records.
//!
//! Identity is two-phase. Record parsing can only speak in module-local
//! table indices; this layer keeps those indices in the model and assigns
//! library-wide dense segment ids only when the [`LibraryImage`] is built,
//! so every cross-module reference resolves through an explicit indirection
//! instead of a guessed global numbering.

pub mod fixup;

use std::collections::HashMap;

use crate::addr::Address;
use crate::diag::DiagnosticList;
use crate::error::LoadError;
use crate::image::{BinaryImage, Image};
use crate::omf::library::ParsedLibrary;
use crate::omf::record::ParsedModule;
use crate::omf::{FIXUPP, LEDATA};

use self::fixup::{FixupCollection, FixupReferent, FixupTarget};

/// One contiguous, named chunk of code or data within a module.
#[derive(Debug, Clone)]
pub struct LogicalSegment {
    pub name: String,
    pub class: String,
    /// Segment contents; gaps never covered by a data record stay zero.
    pub bytes: Vec<u8>,
    pub fixups: FixupCollection,
}

impl LogicalSegment {
    /// Code segments conventionally carry the CODE class name.
    pub fn is_code(&self) -> bool {
        self.class.to_ascii_uppercase().contains("CODE")
    }
}

/// A named collection of segments addressed through one frame.
#[derive(Debug, Clone)]
pub struct SegmentGroup {
    pub name: String,
    /// Module-local segment indices.
    pub segments: Vec<usize>,
}

/// A name this module defines, with its location.
#[derive(Debug, Clone)]
pub struct DefinedSymbol {
    pub name: String,
    /// Module-local segment index; `None` for absolute symbols.
    pub seg: Option<usize>,
    pub offset: u32,
    /// Explicit frame for absolute symbols.
    pub frame: u16,
    pub local: bool,
}

/// Where a resolved external points: a public in another (or the same)
/// module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolDef {
    pub module: usize,
    pub public: usize,
}

/// A name this module imports.
#[derive(Debug, Clone)]
pub struct ExternalSymbol {
    pub name: String,
    pub resolved: Option<SymbolDef>,
}

/// ALIAS record: a second name for an existing public.
#[derive(Debug, Clone)]
pub struct SymbolAlias {
    pub alias: String,
    pub substitute: String,
}

/// One object module of a library.
#[derive(Debug, Default)]
pub struct ObjectModule {
    pub name: String,
    pub segments: Vec<LogicalSegment>,
    pub groups: Vec<SegmentGroup>,
    pub publics: Vec<DefinedSymbol>,
    pub externals: Vec<ExternalSymbol>,
    pub aliases: Vec<SymbolAlias>,
    pub is_main: bool,
}

impl ObjectModule {
    fn build(parsed: ParsedModule, diags: &mut DiagnosticList) -> Result<Self, LoadError> {
        let mut segments: Vec<LogicalSegment> = parsed
            .context
            .segdefs
            .iter()
            .map(|s| LogicalSegment {
                name: s.name.clone(),
                class: s.class.clone(),
                bytes: vec![0; s.length as usize],
                fixups: FixupCollection::new(),
            })
            .collect();

        for block in &parsed.data {
            let seg = &mut segments[block.seg];
            let start = block.offset as usize;
            let end = start + block.bytes.len();
            if end > seg.bytes.len() {
                return Err(LoadError::malformed(
                    LEDATA,
                    format!(
                        "data [{start:#X}, {end:#X}) beyond segment '{}' length {:#X}",
                        seg.name,
                        seg.bytes.len()
                    ),
                ));
            }
            seg.bytes[start..end].copy_from_slice(&block.bytes);
            for fixup in &block.fixups {
                if let Err(overlap) = seg.fixups.insert(*fixup) {
                    diags.warning(
                        Address::INVALID,
                        format!(
                            "module '{}': fixup at {}:{:#06X} overlaps one at {:#06X}, dropped",
                            parsed.name, seg.name, overlap.rejected.start, overlap.existing.start
                        ),
                    );
                }
            }
        }

        let groups = parsed
            .context
            .grpdefs
            .iter()
            .map(|g| SegmentGroup { name: g.name.clone(), segments: g.seg_indexes.clone() })
            .collect();

        let publics = parsed
            .publics
            .iter()
            .map(|p| DefinedSymbol {
                name: p.name.clone(),
                seg: p.seg,
                offset: p.offset,
                frame: p.frame,
                local: p.local,
            })
            .collect();

        let externals = parsed
            .context
            .extnames
            .iter()
            .map(|e| ExternalSymbol { name: e.name.clone(), resolved: None })
            .collect();

        let aliases = parsed
            .aliases
            .iter()
            .map(|a| SymbolAlias { alias: a.alias.clone(), substitute: a.substitute.clone() })
            .collect();

        // FIXUPP subrecords must land inside the data they patch.
        for seg in &segments {
            for f in seg.fixups.iter() {
                if f.end() > seg.bytes.len() as u32 {
                    return Err(LoadError::malformed(
                        FIXUPP,
                        format!("fixup at {:#06X} runs past segment '{}'", f.start, seg.name),
                    ));
                }
            }
        }

        Ok(Self {
            name: parsed.name,
            segments,
            groups,
            publics,
            externals,
            aliases,
            is_main: parsed.is_main,
        })
    }
}

/// All modules of a library (or the single module of a .obj), with symbols
/// resolved across module boundaries.
#[derive(Debug, Default)]
pub struct ObjectLibrary {
    pub modules: Vec<ObjectModule>,
    /// Library page size; `None` for a bare object file.
    pub page_size: Option<usize>,
    pub diagnostics: DiagnosticList,
}

impl ObjectLibrary {
    pub fn build(parsed: ParsedLibrary) -> Result<Self, LoadError> {
        let mut diagnostics = DiagnosticList::new();
        let mut modules = Vec::with_capacity(parsed.modules.len());
        for m in parsed.modules {
            modules.push(ObjectModule::build(m, &mut diagnostics)?);
        }
        let mut library = Self { modules, page_size: parsed.page_size, diagnostics };
        library.resolve_all_symbols();
        Ok(library)
    }

    /// Link externals to publics by name across the whole library.
    ///
    /// Pass one collects every non-local public; a duplicate name is
    /// reported as a warning and the later definition wins, matching what a
    /// permissive linker would do. Pass two binds each external to the
    /// surviving definition; names with no definition stay unresolved.
    fn resolve_all_symbols(&mut self) {
        let mut defs: HashMap<String, SymbolDef> = HashMap::new();
        for (mi, module) in self.modules.iter().enumerate() {
            for (pi, public) in module.publics.iter().enumerate() {
                if public.local {
                    continue;
                }
                let def = SymbolDef { module: mi, public: pi };
                if let Some(prev) = defs.insert(public.name.clone(), def) {
                    self.diagnostics.warning(
                        Address::INVALID,
                        format!(
                            "symbol '{}' defined in both '{}' and '{}'; using the latter",
                            public.name, self.modules[prev.module].name, module.name
                        ),
                    );
                }
            }
        }

        let mut unresolved = 0usize;
        for module in &mut self.modules {
            for ext in &mut module.externals {
                ext.resolved = defs.get(&ext.name).copied();
                if ext.resolved.is_none() {
                    unresolved += 1;
                }
            }
        }
        if unresolved > 0 {
            log::debug!("{unresolved} external references have no definition in this library");
        }
    }

    /// Distinct external names that no module defines.
    pub fn unresolved_symbols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .modules
            .iter()
            .flat_map(|m| m.externals.iter())
            .filter(|e| e.resolved.is_none())
            .map(|e| e.name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn module_named(&self, name: &str) -> Option<&ObjectModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// Provenance of one image segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOrigin {
    pub module: usize,
    /// Module-local segment index.
    pub seg: usize,
}

/// The analyzable image of an object library: every logical segment laid
/// out back to back under a dense library-wide id.
#[derive(Debug)]
pub struct LibraryImage {
    library: ObjectLibrary,
    image: BinaryImage,
    origins: Vec<SegmentOrigin>,
    /// Per-image-segment fixups, indexed by segment id.
    fixups: Vec<FixupCollection>,
    /// Module-local segment index -> image segment id, per module.
    global_ids: Vec<Vec<u16>>,
}

impl LibraryImage {
    pub fn build(library: ObjectLibrary) -> Self {
        let mut image = BinaryImage::empty();
        let mut origins = Vec::new();
        let mut fixups = Vec::new();
        let mut global_ids = Vec::with_capacity(library.modules.len());

        for (mi, module) in library.modules.iter().enumerate() {
            let mut ids = Vec::with_capacity(module.segments.len());
            for (si, seg) in module.segments.iter().enumerate() {
                let id = image.push_segment_bytes(seg.name.clone(), &seg.bytes);
                origins.push(SegmentOrigin { module: mi, seg: si });
                fixups.push(seg.fixups.clone());
                ids.push(id);
            }
            global_ids.push(ids);
        }

        Self { library, image, origins, fixups, global_ids }
    }

    pub fn library(&self) -> &ObjectLibrary {
        &self.library
    }

    pub fn image_mut(&mut self) -> &mut BinaryImage {
        &mut self.image
    }

    pub fn origin(&self, seg: u16) -> Option<SegmentOrigin> {
        self.origins.get(seg as usize).copied()
    }

    pub fn fixups_of(&self, seg: u16) -> Option<&FixupCollection> {
        self.fixups.get(seg as usize)
    }

    /// Image segment id of a module-local segment index.
    pub fn segment_id(&self, module: usize, seg: usize) -> Option<u16> {
        self.global_ids.get(module)?.get(seg).copied()
    }

    /// Address of one of a module's publics, if it names a loaded byte.
    pub fn address_of_public(&self, def: SymbolDef) -> Option<Address> {
        let module = self.library.modules.get(def.module)?;
        let public = module.publics.get(def.public)?;
        let seg = self.segment_id(def.module, public.seg?)?;
        Some(Address::new(seg, public.offset as u16))
    }

    /// Resolve a fixup target raised in `module` to an image address.
    ///
    /// Returns `None` for targets the image cannot place: unresolved
    /// externals, absolute frames, and externals bound to absolute symbols.
    pub fn resolve_target(&self, module: usize, target: &FixupTarget) -> Option<Address> {
        let base = match target.referent {
            FixupReferent::Segment(si) => {
                Address::new(self.segment_id(module, si)?, 0)
            }
            FixupReferent::Group(gi) => {
                // A group reference resolves through its first member.
                let group = self.library.modules.get(module)?.groups.get(gi)?;
                Address::new(self.segment_id(module, *group.segments.first()?)?, 0)
            }
            FixupReferent::External(ei) => {
                let ext = self.library.modules.get(module)?.externals.get(ei)?;
                self.address_of_public(ext.resolved?)?
            }
            FixupReferent::AbsoluteFrame(_) => return None,
        };
        Some(base.wrapping_add(target.displacement as u16))
    }

    /// Name of the external a fixup in `seg` refers to, if its referent is
    /// an external symbol.
    pub fn external_name(&self, seg: u16, referent: FixupReferent) -> Option<&str> {
        let origin = self.origin(seg)?;
        match referent {
            FixupReferent::External(ei) => Some(
                self.library
                    .modules
                    .get(origin.module)?
                    .externals
                    .get(ei)?
                    .name
                    .as_str(),
            ),
            _ => None,
        }
    }

    /// Every non-local public placed in a code-class segment, with its
    /// address: the analysis entry points of a library.
    pub fn code_entries(&self) -> Vec<(Address, String)> {
        let mut entries = Vec::new();
        for (mi, module) in self.library.modules.iter().enumerate() {
            for public in &module.publics {
                let Some(si) = public.seg else { continue };
                if !module.segments[si].is_code() {
                    continue;
                }
                if let Some(id) = self.segment_id(mi, si) {
                    entries.push((Address::new(id, public.offset as u16), public.name.clone()));
                }
            }
        }
        entries.sort_by_key(|(a, _)| *a);
        entries
    }

    /// The defined symbol whose location is exactly `addr`, if any.
    pub fn symbol_at(&self, addr: Address) -> Option<&str> {
        let origin = self.origin(addr.seg)?;
        let module = &self.library.modules[origin.module];
        module
            .publics
            .iter()
            .find(|p| p.seg == Some(origin.seg) && p.offset == addr.off as u32)
            .map(|p| p.name.as_str())
    }
}

impl Image for LibraryImage {
    fn image(&self) -> &BinaryImage {
        &self.image
    }

    fn format_address(&self, addr: Address) -> String {
        match self.image.segment(addr.seg) {
            Some(seg) => format!("{}:{:04X}", seg.name, addr.off),
            None => format!("{}", addr),
        }
    }
}
