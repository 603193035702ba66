//! stexls - language server and batch linter for the sTeX dialect.
//!
//! sTeX is a LaTeX macro dialect for semantically marked-up
//! mathematical documents, organized into modules, language bindings,
//! symbol definitions and cross-module references spread over a tree of
//! MathHub repositories. This crate compiles each `.tex` file into a
//! cached object (symbol table, dependencies, references, diagnostics),
//! links objects across the workspace with visibility and cycle
//! checks, validates references, and serves the result both as a batch
//! linter and over LSP.
//!
//! The pipeline:
//! `source text -> latex tree -> intermediate tree -> object -> linked
//! object -> diagnostics`.

pub mod commands;
pub mod compiler;
pub mod completion;
pub mod config;
pub mod latex;
pub mod linker;
pub mod linter;
pub mod mathhub;
pub mod parse;
pub mod serve;
pub mod symbols;
pub mod trefier;
pub mod workspace;
