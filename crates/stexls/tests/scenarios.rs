//! End-to-end scenarios over MathHub-shaped workspaces on disk.

use std::path::{Path, PathBuf};
use stexls::linter::Linter;
use stexls::workspace::Workspace;
use stexls_core::{DiagnosticSeverity, DiagnosticTag};
use tempfile::TempDir;

/// Builds a workspace root with the given `repo/source`-relative files.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let path = dir.path().join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative).canonicalize().unwrap()
    }

    fn linter(&self) -> Linter {
        let workspace = Workspace::new(self.root());
        Linter::new(workspace, self.root().join(".stexls").join("objects"))
    }
}

#[test]
fn scenario_binding_references_signature_symbol() {
    let fixture = Fixture::new(&[
        (
            "repo/source/M.tex",
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        ),
        (
            "repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\trefi{value}\\end{mhmodnl}",
        ),
    ]);
    let mut linter = fixture.linter();
    let files = linter.workspace.files();
    assert_eq!(files.len(), 2);
    let results = linter.lint_batch(&files, None);
    for result in &results {
        assert_eq!(
            result.diagnostics().count(),
            0,
            "{}: {:?}",
            result.file().display(),
            result.object.diagnostics
        );
    }
    // the binding's trefi resolved against the signature
    let binding = fixture.path("repo/source/M.en.tex");
    let linked = linter.linked_object(&binding).unwrap();
    let reference = linked
        .references
        .iter()
        .find(|r| r.name == vec!["M".to_string(), "value".to_string()])
        .unwrap();
    let path: Vec<&str> = reference.name.iter().map(String::as_str).collect();
    let resolved = linked.symbol_table.lookup(reference.scope, &path);
    assert_eq!(resolved.len(), 1);
    assert!(matches!(
        &linked.symbol_table.get(resolved[0]).kind,
        stexls::symbols::SymbolKind::Def {
            def_type: stexls::symbols::DefType::Sym,
            ..
        }
    ));
}

#[test]
fn scenario_module_filename_mismatch() {
    let fixture = Fixture::new(&[(
        "repo/source/M.tex",
        "\\begin{modsig}{Other}\\end{modsig}",
    )]);
    let mut linter = fixture.linter();
    let files = linter.workspace.files();
    let results = linter.lint_batch(&files, None);
    assert_eq!(results.len(), 1);
    let diagnostics: Vec<_> = results[0].diagnostics().collect();
    assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
    let mismatch = diagnostics[0];
    assert_eq!(mismatch.code, "filename-mismatch-check");
    assert_eq!(mismatch.severity, DiagnosticSeverity::Warning);
    // anchored at the "Other" token
    assert_eq!(mismatch.range.start.line, 0);
    assert_eq!(mismatch.range.start.character, 15);
    assert_eq!(mismatch.range.end.character, 20);
}

#[test]
fn scenario_cycle_between_two_signatures() {
    let fixture = Fixture::new(&[
        (
            "repo/source/A.tex",
            "\\begin{modsig}{A}\\gimport{B}\\end{modsig}",
        ),
        (
            "repo/source/B.tex",
            "\\begin{modsig}{B}\\gimport{A}\\end{modsig}",
        ),
    ]);
    for file in ["repo/source/A.tex", "repo/source/B.tex"] {
        let mut linter = fixture.linter();
        let result = linter.lint(&fixture.path(file), None);
        let cyclic: Vec<_> = result
            .diagnostics()
            .filter(|d| d.code == "cyclic-dependency-check")
            .collect();
        assert_eq!(cyclic.len(), 1, "{file}: {:?}", result.object.diagnostics);
    }
}

#[test]
fn scenario_deprecated_repos_argument() {
    let fixture = Fixture::new(&[
        (
            "repo/source/use.tex",
            "\\begin{module}[id=use]\\importmhmodule[repos=smglom/numbers,dir=d]{mod}\\end{module}",
        ),
        (
            "smglom/numbers/source/d/mod.tex",
            "\\begin{module}[id=mod]\\end{module}",
        ),
    ]);
    let mut linter = fixture.linter();
    let result = linter.lint(&fixture.path("repo/source/use.tex"), None);
    let deprecation: Vec<_> = result
        .diagnostics()
        .filter(|d| d.code == "repos-deprecation-check")
        .collect();
    assert_eq!(deprecation.len(), 1, "{:?}", result.object.diagnostics);
    assert_eq!(deprecation[0].severity, DiagnosticSeverity::Warning);
    assert_eq!(deprecation[0].tags, vec![DiagnosticTag::Deprecated]);
}

#[test]
fn scenario_mtref_without_questionmark() {
    let fixture = Fixture::new(&[
        (
            "repo/source/M.tex",
            "\\begin{modsig}{M}\\symi{x}\\end{modsig}",
        ),
        (
            "repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\mtrefi{x}\\end{mhmodnl}",
        ),
    ]);
    let mut linter = fixture.linter();
    let files = linter.workspace.files();
    let results = linter.lint_batch(&files, None);
    let binding = results
        .iter()
        .find(|r| r.file().ends_with("M.en.tex"))
        .unwrap();
    let deprecation: Vec<_> = binding
        .diagnostics()
        .filter(|d| d.code == "mtref-deprecation-check")
        .collect();
    assert_eq!(deprecation.len(), 1);
    assert_eq!(deprecation[0].severity, DiagnosticSeverity::Warning);
    assert_eq!(deprecation[0].tags, vec![DiagnosticTag::Deprecated]);
    let questionmark: Vec<_> = binding
        .diagnostics()
        .filter(|d| d.code == "mtref-questionmark-check")
        .collect();
    assert_eq!(questionmark.len(), 1);
    assert_eq!(questionmark[0].severity, DiagnosticSeverity::Error);
}

#[test]
fn scenario_undefined_symbol_with_suggestions() {
    let fixture = Fixture::new(&[
        (
            "repo/source/M.tex",
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        ),
        (
            "repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\trefi[M?valu]{valu}\\end{mhmodnl}",
        ),
    ]);
    let mut linter = fixture.linter();
    let files = linter.workspace.files();
    let results = linter.lint_batch(&files, None);
    let binding = results
        .iter()
        .find(|r| r.file().ends_with("M.en.tex"))
        .unwrap();
    let undefined: Vec<_> = binding
        .diagnostics()
        .filter(|d| d.code == "undefined-symbol")
        .collect();
    assert_eq!(undefined.len(), 1, "{:?}", binding.object.diagnostics);
    assert_eq!(undefined[0].severity, DiagnosticSeverity::Error);
    assert!(undefined[0].message.contains("Did you mean"));
    // related information points at M.value's definition
    let signature = fixture.path("repo/source/M.tex");
    assert!(undefined[0]
        .related_information
        .iter()
        .any(|related| related.location.path == signature));
}

#[test]
fn lint_is_stable_across_cache_reload() {
    let fixture = Fixture::new(&[
        (
            "repo/source/M.tex",
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        ),
        (
            "repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\trefi{value}\\end{mhmodnl}",
        ),
    ]);
    // first run compiles and populates the cache
    let mut linter = fixture.linter();
    let files = linter.workspace.files();
    let first: Vec<usize> = linter
        .lint_batch(&files, None)
        .iter()
        .map(|r| r.diagnostics().count())
        .collect();
    // second linter loads every object from the cache
    let mut linter = fixture.linter();
    let second: Vec<usize> = linter
        .lint_batch(&files, None)
        .iter()
        .map(|r| r.diagnostics().count())
        .collect();
    assert_eq!(first, second);
}

#[test]
fn open_buffer_overrides_disk_content() {
    let fixture = Fixture::new(&[
        (
            "repo/source/M.tex",
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        ),
        (
            "repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\trefi{value}\\end{mhmodnl}",
        ),
    ]);
    let mut linter = fixture.linter();
    let files = linter.workspace.files();
    linter.lint_batch(&files, None);
    // the user deletes the symbol in the (unsaved) signature buffer
    let signature = fixture.path("repo/source/M.tex");
    linter
        .workspace
        .open_file(signature, "\\begin{modsig}{M}\\end{modsig}".to_string());
    let binding = fixture.path("repo/source/M.en.tex");
    let result = linter.lint(&binding, None);
    let undefined: Vec<_> = result
        .diagnostics()
        .filter(|d| d.code == "undefined-symbol")
        .collect();
    assert_eq!(undefined.len(), 1, "{:?}", result.object.diagnostics);
}
