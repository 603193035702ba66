//! The batch linter driver.
//!
//! Owns the workspace, the compiler and the object buffers; compiles
//! files (cache-aware, in parallel), links them against a module-index
//! snapshot, validates references and renders messages. The language
//! server shares the definition/reference queries implemented here.

use crate::compiler::{Compiler, StexObject};
use crate::latex;
use crate::linker::{self, LinkPass, ModuleIndex};
use crate::trefier::{self, TagModel};
use crate::workspace::Workspace;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stexls_core::{Diagnostic, DiagnosticSeverity, Location, Position, Range};

/// The outcome of linting one file: its linked object.
pub struct LintingResult {
    pub object: StexObject,
}

impl LintingResult {
    pub fn file(&self) -> &Path {
        &self.object.file
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.object.diagnostics.iter()
    }

    /// Renders diagnostics up to `level` using a `{variable}` template.
    /// Supported variables: uri, file, filename, relative_file, line,
    /// column, severity, code, message.
    pub fn format_messages(&self, template: &str, level: DiagnosticSeverity) -> Vec<String> {
        let file = &self.object.file;
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let uri = format!("file://{}", file.display());
        let relative_file = std::env::current_dir()
            .ok()
            .and_then(|cwd| file.strip_prefix(cwd).ok())
            .unwrap_or(file.as_path())
            .to_path_buf();
        self.object
            .diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity <= level)
            .map(|diagnostic| {
                template
                    .replace("{uri}", &uri)
                    .replace("{file}", &file.display().to_string())
                    .replace("{filename}", &filename)
                    .replace("{relative_file}", &relative_file.display().to_string())
                    .replace("{line}", &(diagnostic.range.start.line + 1).to_string())
                    .replace("{column}", &(diagnostic.range.start.character + 1).to_string())
                    .replace("{severity}", diagnostic.severity.as_str())
                    .replace("{code}", &diagnostic.code)
                    .replace("{message}", &diagnostic.message)
            })
            .collect()
    }
}

pub struct Linter {
    pub workspace: Workspace,
    compiler: Compiler,
    /// Compiled but unlinked objects.
    unlinked: HashMap<PathBuf, Arc<StexObject>>,
    /// Linked objects of previously linted files.
    linked: HashMap<PathBuf, StexObject>,
    /// Symbol locations referenced by any previously validated batch.
    referenced: HashSet<Location>,
    /// Files larger than this are linted shallowly.
    max_lint_file_size_kb: u64,
    /// Files larger than this are not given to the tag model.
    max_trefier_file_size_kb: u64,
}

impl Linter {
    pub fn new(workspace: Workspace, outdir: PathBuf) -> Self {
        let compiler = Compiler::new(workspace.root().to_path_buf(), outdir);
        Self {
            workspace,
            compiler,
            unlinked: HashMap::new(),
            linked: HashMap::new(),
            referenced: HashSet::new(),
            max_lint_file_size_kb: 100,
            max_trefier_file_size_kb: 50,
        }
    }

    pub fn with_size_limits(mut self, lint_kb: u64, trefier_kb: u64) -> Self {
        self.max_lint_file_size_kb = lint_kb;
        self.max_trefier_file_size_kb = trefier_kb;
        self
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Compiles (or loads from cache) every file in the workspace on
    /// the rayon pool. Returns the files that produced objects.
    pub fn compile_workspace(&mut self) -> Vec<PathBuf> {
        let files = self.workspace.files();
        let jobs: Vec<(PathBuf, Option<String>)> = files
            .into_iter()
            .map(|file| {
                let buffered = self
                    .workspace
                    .is_open(&file)
                    .then(|| self.workspace.read_file(&file))
                    .flatten();
                (file, buffered)
            })
            .collect();
        let compiler = &self.compiler;
        let objects: Vec<Option<StexObject>> = jobs
            .par_iter()
            .map(|(file, content)| {
                compiler
                    .compile_or_load(file, content.as_deref(), false)
                    .ok()
            })
            .collect();
        let mut compiled = Vec::new();
        for object in objects.into_iter().flatten() {
            compiled.push(object.file.clone());
            self.unlinked.insert(object.file.clone(), Arc::new(object));
        }
        compiled
    }

    /// Compiles `file` and the transitive closure of its dependencies
    /// into the unlinked buffer.
    pub fn compile_related(&mut self, file: &Path) {
        let mut queue = VecDeque::from([file.to_path_buf()]);
        let mut visited = HashSet::new();
        while let Some(file) = queue.pop_front() {
            if !visited.insert(file.clone()) {
                continue;
            }
            let buffered = self
                .workspace
                .is_open(&file)
                .then(|| self.workspace.read_file(&file))
                .flatten();
            let Ok(object) = self
                .compiler
                .compile_or_load(&file, buffered.as_deref(), false)
            else {
                continue;
            };
            for dep in &object.dependencies {
                if !visited.contains(&dep.file_hint) {
                    queue.push_back(dep.file_hint.clone());
                }
            }
            self.unlinked.insert(file, Arc::new(object));
        }
    }

    /// Snapshot of all compiled objects, for one link pass.
    pub fn module_index(&self) -> ModuleIndex {
        let mut index = ModuleIndex::new();
        for object in self.unlinked.values() {
            index.insert(object.clone());
        }
        index
    }

    /// Lints one file. Equivalent to a one-element batch.
    pub fn lint(&mut self, file: &Path, model: Option<&dyn TagModel>) -> LintingResult {
        self.lint_batch(std::slice::from_ref(&file.to_path_buf()), model)
            .pop()
            .unwrap_or(LintingResult {
                object: StexObject::new(file.to_path_buf(), Range::default()),
            })
    }

    /// Compiles, links and validates a set of files as one batch.
    /// Never-referenced checks see the whole batch plus everything
    /// linked before, so a definition referenced by a sibling file is
    /// not flagged.
    pub fn lint_batch(
        &mut self,
        files: &[PathBuf],
        model: Option<&dyn TagModel>,
    ) -> Vec<LintingResult> {
        let mut targets = Vec::new();
        for file in files {
            if self.file_size_kb(file) > self.max_lint_file_size_kb {
                // Too large: publish only what the file alone provides.
                self.compile_related(file);
                if let Some(object) = self.unlinked.get(file) {
                    self.linked.insert(file.clone(), (**object).clone());
                }
                continue;
            }
            self.compile_related(file);
            targets.push(file.clone());
        }
        let index = self.module_index();
        let mut pass = LinkPass::new(&index);
        let mut links: Vec<(Arc<StexObject>, StexObject)> = Vec::new();
        for file in &targets {
            let Some(origin) = self.unlinked.get(file).cloned() else {
                continue;
            };
            let linked = pass.link(&origin);
            links.push((origin, linked));
        }
        linker::validate_references_with(&mut links, self.referenced.clone());
        for (_, linked) in &links {
            self.collect_referenced(linked);
        }
        if let Some(model) = model {
            for (origin, linked) in &mut links {
                self.apply_trefier(model, origin, linked);
            }
        }
        links
            .into_iter()
            .map(|(origin, linked)| {
                self.linked.insert(origin.file.clone(), linked.clone());
                LintingResult { object: linked }
            })
            .collect()
    }

    /// Remembers which symbol locations this link's references resolve
    /// to, for never-referenced checks of later batches.
    fn collect_referenced(&mut self, linked: &StexObject) {
        for reference in &linked.references {
            let path: Vec<&str> = reference.name.iter().map(String::as_str).collect();
            for id in linked.symbol_table.lookup(reference.scope, &path) {
                self.referenced
                    .insert(linked.symbol_table.get(id).location.clone());
            }
        }
    }

    fn apply_trefier(&self, model: &dyn TagModel, origin: &Arc<StexObject>, linked: &mut StexObject) {
        if self.file_size_kb(&origin.file) > self.max_trefier_file_size_kb {
            return;
        }
        let Some(content) = self.workspace.read_file(&origin.file) else {
            return;
        };
        let tree = latex::parse(origin.file.clone(), &content);
        let tags = model.predict(&origin.file, &content);
        trefier::apply_tags(&tree, &tags, &mut linked.diagnostics);
    }

    fn file_size_kb(&self, file: &Path) -> u64 {
        file.metadata().map(|m| m.len() / 1024).unwrap_or(0)
    }

    pub fn linked_object(&self, file: &Path) -> Option<&StexObject> {
        self.linked.get(file)
    }

    pub fn unlinked_object(&self, file: &Path) -> Option<&Arc<StexObject>> {
        self.unlinked.get(file)
    }

    pub fn linked_objects(&self) -> impl Iterator<Item = &StexObject> {
        self.linked.values()
    }

    /// The definition locations of whatever is under the cursor: the
    /// smallest enclosing reference or symbol-defining range wins.
    pub fn definitions(&self, file: &Path, position: Position) -> Vec<(Range, Location)> {
        let Some(linked) = self.linked.get(file) else {
            return Vec::new();
        };
        let mut candidates: Vec<(Range, Location)> = Vec::new();
        for (_, symbol) in linked.symbol_table.iter() {
            if symbol.location.path == file && symbol.location.range.contains(position) {
                candidates.push((symbol.location.range, symbol.location.clone()));
            }
        }
        for reference in &linked.references {
            if !reference.range.contains(position) {
                continue;
            }
            let path: Vec<&str> = reference.name.iter().map(String::as_str).collect();
            for id in linked.symbol_table.lookup(reference.scope, &path) {
                candidates.push((
                    reference.range,
                    linked.symbol_table.get(id).location.clone(),
                ));
            }
        }
        let Some(smallest) = candidates
            .iter()
            .map(|(range, _)| range_size(*range))
            .min()
        else {
            return Vec::new();
        };
        candidates
            .into_iter()
            .filter(|(range, _)| range_size(*range) == smallest)
            .collect()
    }

    /// Every reference, across all linked objects, whose resolved
    /// symbol is defined under the cursor. Includes the definitions.
    pub fn references(&self, file: &Path, position: Position) -> Vec<Location> {
        let definitions: HashSet<Location> = self
            .definitions(file, position)
            .into_iter()
            .map(|(_, location)| location)
            .collect();
        if definitions.is_empty() {
            return Vec::new();
        }
        let mut results: Vec<Location> = Vec::new();
        for linked in self.linked.values() {
            for reference in &linked.references {
                let path: Vec<&str> = reference.name.iter().map(String::as_str).collect();
                let resolved = linked.symbol_table.lookup(reference.scope, &path);
                if resolved
                    .iter()
                    .any(|&id| definitions.contains(&linked.symbol_table.get(id).location))
                {
                    results.push(Location::new(linked.file.clone(), reference.range));
                }
            }
        }
        results.extend(definitions);
        results.sort_by(|a, b| (&a.path, a.range).cmp(&(&b.path, b.range)));
        results.dedup();
        results
    }
}

fn range_size(range: Range) -> (u32, u32) {
    (
        range.end.line - range.start.line,
        if range.start.line == range.end.line {
            range.end.character.saturating_sub(range.start.character)
        } else {
            range.end.character
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Linter) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("repo").join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(
            source.join("M.tex"),
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        )
        .unwrap();
        std::fs::write(
            source.join("M.en.tex"),
            "\\begin{mhmodnl}{M}{en}\\trefi{value}\\end{mhmodnl}",
        )
        .unwrap();
        let workspace = Workspace::new(dir.path());
        let outdir = dir.path().join(".stexls").join("objects");
        let linter = Linter::new(workspace, outdir);
        (dir, linter)
    }

    #[test]
    fn test_lint_clean_workspace() {
        let (dir, mut linter) = fixture();
        let files = linter.workspace.files();
        let results = linter.lint_batch(&files, None);
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(
                result.diagnostics().count(),
                0,
                "{}: {:?}",
                result.file().display(),
                result.object.diagnostics
            );
        }
        drop(dir);
    }

    #[test]
    fn test_compile_workspace_uses_cache() {
        let (_dir, mut linter) = fixture();
        let compiled = linter.compile_workspace();
        assert_eq!(compiled.len(), 2);
        for file in &compiled {
            assert!(!linter.compiler.recompilation_required(file));
        }
    }

    #[test]
    fn test_format_messages() {
        let (dir, mut linter) = fixture();
        let bad = dir.path().join("repo").join("source").join("X.tex");
        std::fs::write(&bad, "\\begin{modsig}{NotX}\\end{modsig}").unwrap();
        let result = linter.lint(&bad, None);
        let messages = result.format_messages(
            "{filename}:{line}:{column} {severity} - {message} ({code})",
            DiagnosticSeverity::Information,
        );
        // filename mismatch and never-referenced module do not apply;
        // expect exactly the mismatch warning
        assert!(
            messages
                .iter()
                .any(|m| m.starts_with("X.tex:1:16 warning")),
            "{messages:?}"
        );
    }

    #[test]
    fn test_severity_threshold_filters() {
        let (dir, mut linter) = fixture();
        let bad = dir.path().join("repo").join("source").join("X.tex");
        std::fs::write(&bad, "\\begin{modsig}{NotX}\\end{modsig}").unwrap();
        let result = linter.lint(&bad, None);
        let errors_only =
            result.format_messages("{message}", DiagnosticSeverity::Error);
        assert!(errors_only.is_empty(), "{errors_only:?}");
    }

    #[test]
    fn test_definitions_at_reference() {
        let (dir, mut linter) = fixture();
        let files = linter.workspace.files();
        linter.lint_batch(&files, None);
        let binding = dir
            .path()
            .join("repo")
            .join("source")
            .join("M.en.tex");
        // cursor inside \trefi{value}
        let definitions = linter.definitions(&binding, Position::new(0, 25));
        assert!(!definitions.is_empty());
        assert!(definitions
            .iter()
            .all(|(_, location)| location.path.ends_with("M.tex")));
    }

    #[test]
    fn test_references_from_definition() {
        let (dir, mut linter) = fixture();
        let files = linter.workspace.files();
        linter.lint_batch(&files, None);
        let signature = dir.path().join("repo").join("source").join("M.tex");
        // cursor on \symi{value}
        let references = linter.references(&signature, Position::new(0, 23));
        // the trefi in the binding plus the definition itself
        assert!(
            references
                .iter()
                .any(|location| location.path.ends_with("M.en.tex")),
            "{references:?}"
        );
        assert!(references
            .iter()
            .any(|location| location.path.ends_with("M.tex")));
    }
}
