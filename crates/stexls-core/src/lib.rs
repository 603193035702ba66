//! Shared types for stexls crates.
//!
//! This crate holds the two vocabularies every other layer speaks:
//! source locations (`Position`, `Range`, `Location`) and diagnostics
//! (`Diagnostic`, `Diagnostics`). Both serialize into object files, so
//! they carry no references into any parse tree.

mod diagnostics;
mod location;

pub use diagnostics::{
    Diagnostic, DiagnosticRelatedInformation, DiagnosticSeverity, DiagnosticTag, Diagnostics,
};
pub use location::{Location, Position, Range};
