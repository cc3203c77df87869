//! Diagnostics accumulated during analysis.
//!
//! Analysis never aborts on a bad instruction or a broken fixup; it records a
//! [`Diagnostic`] against the offending address and abandons only the branch
//! that reached it. Loading fails fast on structural errors; analysis
//! degrades gracefully. Frontends read the finished list off the image.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::addr::Address;

/// Severity of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    Message,
    Warning,
    Error,
}

/// One thing the analyzer could not fully understand, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub addr: Address,
    pub category: DiagnosticCategory,
    pub text: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.category {
            DiagnosticCategory::Message => "note",
            DiagnosticCategory::Warning => "warning",
            DiagnosticCategory::Error => "error",
        };
        write!(f, "{}: {}: {}", self.addr, tag, self.text)
    }
}

/// Append-only diagnostic collection owned by an image or library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticList {
    items: Vec<Diagnostic>,
}

impl DiagnosticList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: Address, category: DiagnosticCategory, text: impl Into<String>) {
        let diag = Diagnostic { addr, category, text: text.into() };
        match category {
            DiagnosticCategory::Warning | DiagnosticCategory::Error => {
                log::warn!("{diag}");
            }
            DiagnosticCategory::Message => log::debug!("{diag}"),
        }
        self.items.push(diag);
    }

    pub fn message(&mut self, addr: Address, text: impl Into<String>) {
        self.add(addr, DiagnosticCategory::Message, text);
    }

    pub fn warning(&mut self, addr: Address, text: impl Into<String>) {
        self.add(addr, DiagnosticCategory::Warning, text);
    }

    pub fn error(&mut self, addr: Address, text: impl Into<String>) {
        self.add(addr, DiagnosticCategory::Error, text);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.items
    }
}

impl<'a> IntoIterator for &'a DiagnosticList {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
