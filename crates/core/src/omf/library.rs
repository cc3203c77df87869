//! OMF library (.lib) scanning.
//!
//! A library is a LIBHDR record followed by object modules, each starting
//! on a page boundary, terminated by LIBEND. The page size is encoded as
//! the total size of the LIBHDR record itself. A bare object file (.obj)
//! is the degenerate case: a single module with no library framing.

use crate::error::LoadError;

use super::record::{parse_module, ModuleScan, ParsedModule};
use super::{RawRecord, LHEADR, LIBHDR, THEADR};

/// All modules recovered from a library or object file.
#[derive(Debug, Default)]
pub struct ParsedLibrary {
    pub modules: Vec<ParsedModule>,
    /// Page size of the library framing; `None` for a bare object file.
    pub page_size: Option<usize>,
}

/// Parse a .lib or .obj byte stream into its object modules.
///
/// The symbol dictionary that follows LIBEND is ignored: it is a lookup
/// accelerator, and the analyzer rebuilds symbol tables from the module
/// records themselves.
pub fn parse_library(bytes: &[u8]) -> Result<ParsedLibrary, LoadError> {
    if bytes.is_empty() {
        return Err(LoadError::UnexpectedEof);
    }
    match bytes[0] {
        LIBHDR => parse_paged(bytes),
        THEADR | LHEADR => parse_bare(bytes),
        other => Err(LoadError::BadSignature(other as u16)),
    }
}

fn parse_bare(bytes: &[u8]) -> Result<ParsedLibrary, LoadError> {
    match parse_module(bytes, 0)? {
        ModuleScan::Module(module, _) => {
            Ok(ParsedLibrary { modules: vec![*module], page_size: None })
        }
        ModuleScan::LibraryEnd => Err(LoadError::malformed(THEADR, "object file has no module")),
    }
}

fn parse_paged(bytes: &[u8]) -> Result<ParsedLibrary, LoadError> {
    let header = RawRecord::read(bytes, 0)?;
    let page_size = header.total_len;
    if !page_size.is_power_of_two() || !(16..=32768).contains(&page_size) {
        return Err(LoadError::BadPageSize(page_size));
    }

    let mut library = ParsedLibrary { modules: Vec::new(), page_size: Some(page_size) };
    let mut pos = page_size;
    loop {
        if pos >= bytes.len() {
            return Err(LoadError::UnexpectedEof);
        }
        match parse_module(bytes, pos)? {
            ModuleScan::Module(module, next) => {
                log::debug!(
                    "module '{}' at {pos:#X}: {} segments, {} publics",
                    module.name,
                    module.context.segdefs.len(),
                    module.publics.len()
                );
                library.modules.push(*module);
                // The next module starts on the following page boundary.
                pos = next.div_ceil(page_size) * page_size;
            }
            ModuleScan::LibraryEnd => break,
        }
    }
    log::info!("library: {} modules, page size {page_size}", library.modules.len());
    Ok(library)
}
