//! dosdis-core
//!
//! Core library for static analysis of 16-bit DOS binaries: MZ executables
//! and OMF object files/libraries.
//!
//! The pipeline is load -> model -> analyze. Loading validates the container
//! format and fails fast on structural errors; analysis walks control flow
//! from the entry points, classifies every reached byte as code or data, and
//! records what it could not understand as diagnostics instead of aborting.
//!
//! All substantive logic lives here so it is fully testable and reusable
//! from multiple frontends.

pub mod addr;
pub mod analysis;
pub mod dec;
pub mod diag;
pub mod error;
pub mod exe;
pub mod image;
pub mod mz;
pub mod object;
pub mod omf;
pub mod xref;

use analysis::AnalysisOptions;
use error::LoadError;
use exe::Executable;
use image::{BinaryImage, Image};
use object::{LibraryImage, ObjectLibrary};

/// A loaded binary of either supported container format.
#[derive(Debug)]
pub enum Assembly {
    Executable(Executable),
    Library(LibraryImage),
}

impl Assembly {
    /// Sniff the container format and load accordingly: MZ/ZM signatures
    /// mean an executable, a module-header (THEADR/LHEADR) or
    /// library-header record byte means an OMF stream.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        match bytes {
            [b'M', b'Z', ..] | [b'Z', b'M', ..] => {
                Ok(Assembly::Executable(Executable::load(bytes)?))
            }
            [omf::THEADR, ..] | [omf::LHEADR, ..] | [omf::LIBHDR, ..] => {
                let parsed = omf::library::parse_library(bytes)?;
                let library = ObjectLibrary::build(parsed)?;
                Ok(Assembly::Library(LibraryImage::build(library)))
            }
            _ => Err(LoadError::UnknownFormat),
        }
    }

    /// Run the full control-flow analysis appropriate for the format.
    pub fn analyze(&mut self, options: AnalysisOptions) -> Result<(), LoadError> {
        match self {
            Assembly::Executable(exe) => analysis::exe::analyze_executable(exe, options)?,
            Assembly::Library(lib) => analysis::library::analyze_library(lib, options)?,
        }
        Ok(())
    }

    /// The analyzed image, format-independent.
    pub fn image(&self) -> &BinaryImage {
        match self {
            Assembly::Executable(exe) => exe.image.image(),
            Assembly::Library(lib) => lib.image(),
        }
    }

    /// Render an address the way this assembly labels locations.
    pub fn format_address(&self, addr: addr::Address) -> String {
        match self {
            Assembly::Executable(exe) => exe.image.format_address(addr),
            Assembly::Library(lib) => lib.format_address(addr),
        }
    }
}

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
