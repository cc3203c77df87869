use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use dosdis_core::Assembly;

/// Read and load a binary of either supported format.
pub fn load_assembly(path: &Path) -> Result<Assembly> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read binary: {}", path.display()))?;
    Assembly::load(&bytes).with_context(|| format!("Failed to load {}", path.display()))
}

pub fn format_kind(assembly: &Assembly) -> &'static str {
    match assembly {
        Assembly::Executable(_) => "MZ executable",
        Assembly::Library(_) => "OMF object library",
    }
}

/// Container-level report: what the file declares, before any analysis.
pub fn info_report(assembly: &Assembly) -> Value {
    match assembly {
        Assembly::Executable(exe) => {
            let (cs, ip) = exe.file.entry_point();
            let (ss, sp) = exe.file.stack_pointer();
            json!({
                "format": "mz",
                "header": exe.file.header,
                "image_size": exe.file.image().len(),
                "relocations": exe.file.relocs.len(),
                "entry": format!("{cs:04X}:{ip:04X}"),
                "stack": format!("{ss:04X}:{sp:04X}"),
                "inferred_segments": exe.image.frames().frames().iter()
                    .map(|f| format!("{f:04X}"))
                    .collect::<Vec<_>>(),
            })
        }
        Assembly::Library(lib) => {
            let library = lib.library();
            json!({
                "format": "omf",
                "page_size": library.page_size,
                "modules": library.modules.iter().map(|m| json!({
                    "name": m.name,
                    "segments": m.segments.iter().map(|s| json!({
                        "name": s.name,
                        "class": s.class,
                        "size": s.bytes.len(),
                        "fixups": s.fixups.len(),
                    })).collect::<Vec<_>>(),
                    "publics": m.publics.len(),
                    "externals": m.externals.len(),
                })).collect::<Vec<_>>(),
            })
        }
    }
}

/// Post-analysis report: procedures, edge and instruction counts, and
/// everything the analyzer could not understand.
pub fn analysis_report(assembly: &Assembly) -> Value {
    let image = assembly.image();
    json!({
        "instructions": image.instructions.len(),
        "basic_blocks": image.basic_blocks.len(),
        "xrefs": image.xrefs.len(),
        "procedures": image.procedures.values().map(|p| json!({
            "name": p.name,
            "entry": assembly.format_address(p.entry),
            "size": p.size,
            "blocks": p.blocks.len(),
        })).collect::<Vec<_>>(),
        "diagnostics": image.errors.iter().map(|d| json!({
            "addr": assembly.format_address(d.addr),
            "category": d.category,
            "text": d.text,
        })).collect::<Vec<_>>(),
    })
}

/// Symbol tables of an object library: publics per module, plus externals
/// nothing in the library defines.
pub fn symbols_report(assembly: &Assembly) -> Result<Value> {
    let Assembly::Library(lib) = assembly else {
        anyhow::bail!("symbol tables are only available for OMF object libraries");
    };
    let library = lib.library();
    Ok(json!({
        "modules": library.modules.iter().map(|m| json!({
            "name": m.name,
            "publics": m.publics.iter().map(|p| json!({
                "name": p.name,
                "segment": p.seg.map(|si| m.segments[si].name.clone()),
                "offset": p.offset,
                "local": p.local,
            })).collect::<Vec<_>>(),
            "externals": m.externals.iter().map(|e| json!({
                "name": e.name,
                "resolved": e.resolved.map(|d| library.modules[d.module].name.clone()),
            })).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
        "unresolved": library.unresolved_symbols(),
    }))
}

/// Render the instruction listing, one line per decoded instruction with
/// any symbolic operand tags appended.
pub fn render_listing(assembly: &Assembly) -> Vec<String> {
    let image = assembly.image();
    image
        .instructions
        .iter()
        .map(|(addr, inst)| {
            let tags: Vec<&str> =
                inst.ops.iter().filter_map(|o| o.tag.as_deref()).collect();
            if tags.is_empty() {
                format!("{}  {}", assembly.format_address(*addr), inst.text)
            } else {
                format!(
                    "{}  {}  ; {}",
                    assembly.format_address(*addr),
                    inst.text,
                    tags.join(", ")
                )
            }
        })
        .collect()
}
