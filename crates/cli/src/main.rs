use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use dosdis::{analysis_report, format_kind, info_report, load_assembly, render_listing, symbols_report};
use dosdis_core::analysis::AnalysisOptions;

/// Static analyzer for 16-bit DOS binaries.
///
/// This CLI is a thin wrapper around `dosdis-core` (exposed in code as
/// `dosdis_core`). All substantive logic lives in the library so it can be
/// tested thoroughly and reused from other frontends.
#[derive(Parser, Debug)]
#[command(
    name = "dosdis",
    version,
    about = "Static analyzer for MZ executables and OMF object libraries",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show container-level information without analyzing anything.
    Info {
        /// Path to the .exe, .obj, or .lib file.
        file: PathBuf,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Disassemble all statically reachable code and report procedures,
    /// cross-references, and diagnostics.
    Analyze {
        /// Path to the .exe, .obj, or .lib file.
        file: PathBuf,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Print the full instruction listing after the summary.
        #[arg(long, default_value_t = false)]
        listing: bool,

        /// Cap on entries walked per indexed jump table.
        #[arg(long)]
        max_table_entries: Option<usize>,
    },

    /// List public and external symbols of an OMF object library, including
    /// externals nothing in the library defines.
    Symbols {
        /// Path to the .obj or .lib file.
        file: PathBuf,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Info { file, json } => info_command(&file, json)?,
        Command::Analyze { file, json, listing, max_table_entries } => {
            analyze_command(&file, json, listing, max_table_entries)?
        }
        Command::Symbols { file, json } => symbols_command(&file, json)?,
    }

    Ok(())
}

/// Show what the container declares: header fields, segments, modules.
fn info_command(file: &PathBuf, json: bool) -> Result<()> {
    let assembly = load_assembly(file)?;
    let report = info_report(&assembly);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}: {}", file.display(), format_kind(&assembly));
    match &assembly {
        dosdis_core::Assembly::Executable(exe) => {
            println!("  Image size: {} bytes", exe.file.image().len());
            println!("  Relocations: {}", exe.file.relocs.len());
            let (cs, ip) = exe.file.entry_point();
            println!("  Entry: {cs:04X}:{ip:04X}");
            let frames = exe.image.frames().frames();
            println!("  Inferred segments ({}):", frames.len());
            for frame in frames {
                println!("    - {frame:04X}");
            }
        }
        dosdis_core::Assembly::Library(lib) => {
            let library = lib.library();
            if let Some(page) = library.page_size {
                println!("  Page size: {page}");
            }
            println!("  Modules ({}):", library.modules.len());
            for module in &library.modules {
                println!(
                    "    - {} ({} segments, {} publics, {} externals)",
                    module.name,
                    module.segments.len(),
                    module.publics.len(),
                    module.externals.len()
                );
            }
        }
    }
    Ok(())
}

/// Run the full analysis and report what was discovered.
fn analyze_command(
    file: &PathBuf,
    json: bool,
    listing: bool,
    max_table_entries: Option<usize>,
) -> Result<()> {
    let mut assembly = load_assembly(file)?;

    let mut options = AnalysisOptions::default();
    if let Some(cap) = max_table_entries {
        options.max_jump_table_entries = cap;
    }
    assembly.analyze(options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&analysis_report(&assembly))?);
        return Ok(());
    }

    let image = assembly.image();
    println!("{}: {}", file.display(), format_kind(&assembly));
    println!(
        "  {} instructions, {} basic blocks, {} xrefs",
        image.instructions.len(),
        image.basic_blocks.len(),
        image.xrefs.len()
    );

    println!("Procedures ({}):", image.procedures.len());
    for proc in image.procedures.values() {
        println!(
            "  - {} at {} ({} bytes, {} blocks)",
            proc.name,
            assembly.format_address(proc.entry),
            proc.size,
            proc.blocks.len()
        );
    }

    if !image.errors.is_empty() {
        println!("Diagnostics ({}):", image.errors.len());
        for diag in &image.errors {
            println!("  {diag}");
        }
    }

    if listing {
        println!("Listing:");
        for line in render_listing(&assembly) {
            println!("  {line}");
        }
    }
    Ok(())
}

/// List the symbol tables of an object library.
fn symbols_command(file: &PathBuf, json: bool) -> Result<()> {
    let assembly = load_assembly(file)?;
    let report = symbols_report(&assembly)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let dosdis_core::Assembly::Library(lib) = &assembly else { unreachable!() };
    let library = lib.library();
    for module in &library.modules {
        println!("{}:", module.name);
        for public in &module.publics {
            let seg = public
                .seg
                .map(|si| module.segments[si].name.clone())
                .unwrap_or_else(|| "<abs>".to_string());
            let local = if public.local { " (local)" } else { "" };
            println!("  pub {} = {}:{:04X}{}", public.name, seg, public.offset, local);
        }
        for ext in &module.externals {
            match &ext.resolved {
                Some(def) => {
                    println!("  ext {} -> {}", ext.name, library.modules[def.module].name)
                }
                None => println!("  ext {} (unresolved)", ext.name),
            }
        }
    }

    let unresolved = library.unresolved_symbols();
    if !unresolved.is_empty() {
        println!("Unresolved externals ({}):", unresolved.len());
        for name in unresolved {
            println!("  - {name}");
        }
    }
    Ok(())
}
