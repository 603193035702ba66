//! The workspace-level linker.
//!
//! Resolves a file's transitive module imports into one linked object:
//! build-order resolution with cycle detection, symbol materialization
//! through the import protocol, and post-link reference validation
//! with fuzzy suggestions.

use crate::compiler::{Dependency, Reference, ReferenceType, StexObject};
use crate::symbols::{ModuleType, SymbolId, SymbolKind, SymbolTable};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stexls_core::{Diagnostics, Location};

/// Snapshot of every compiled module reachable in the workspace,
/// indexed by file. Taken at the start of a link pass; linking is pure
/// given a snapshot.
#[derive(Default, Clone)]
pub struct ModuleIndex {
    objects: HashMap<PathBuf, Arc<StexObject>>,
}

impl ModuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: Arc<StexObject>) {
        self.objects.insert(object.file.clone(), object);
    }

    pub fn get(&self, file: &Path) -> Option<&Arc<StexObject>> {
        self.objects.get(file)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Arc<StexObject>> {
        self.objects.values()
    }

    /// Finds the module a dependency asks for: same name, same module
    /// type, exported by the hinted file.
    fn resolve(&self, dep: &Dependency) -> Option<(&Arc<StexObject>, SymbolId)> {
        let object = self.objects.get(&dep.file_hint)?;
        let (_, _, id) = object
            .exported_modules()
            .find(|(name, module_type, _)| {
                *name == dep.module_name && *module_type == dep.module_type_hint
            })?;
        Some((object, id))
    }

    /// All exported modules in the workspace.
    pub fn all_modules(&self) -> impl Iterator<Item = (&Path, &str, ModuleType, &Location)> {
        self.objects.values().flat_map(|object| {
            object.exported_modules().map(move |(name, module_type, id)| {
                (
                    object.file.as_path(),
                    name,
                    module_type,
                    &object.symbol_table.get(id).location,
                )
            })
        })
    }
}

/// One link pass over a snapshot of the module index. Materialized
/// export tables are memoized for the lifetime of the pass.
pub struct LinkPass<'a> {
    index: &'a ModuleIndex,
    materialized: HashMap<PathBuf, Arc<SymbolTable>>,
}

impl<'a> LinkPass<'a> {
    pub fn new(index: &'a ModuleIndex) -> Self {
        Self {
            index,
            materialized: HashMap::new(),
        }
    }

    /// Computes the build order of `current`: distinct objects,
    /// dependencies before dependents, ending with `current`.
    /// Diagnostics for unresolvable or cyclic imports of the root are
    /// pushed onto `diagnostics`.
    pub fn make_build_order(
        &mut self,
        current: &Arc<StexObject>,
        diagnostics: &mut Diagnostics,
    ) -> Vec<Arc<StexObject>> {
        // The cache is per root so toplevel-only diagnostics are never
        // swallowed by an earlier root's cached order.
        let mut cache: HashMap<PathBuf, Vec<Arc<StexObject>>> = HashMap::new();
        let mut cyclic_stack: Vec<StackEntry> = Vec::new();
        self.warn_multiple_imports(current, diagnostics);
        self.build_order_rec(
            current,
            current,
            diagnostics,
            &mut cache,
            &mut cyclic_stack,
            true,
            false,
        )
    }

    /// A module imported several times in the same file, first import
    /// wins, the rest are flagged.
    fn warn_multiple_imports(&self, current: &Arc<StexObject>, diagnostics: &mut Diagnostics) {
        let mut seen: HashMap<(&str, &Path), &Dependency> = HashMap::new();
        for dep in &current.dependencies {
            let key = (dep.module_name.as_str(), dep.file_hint.as_path());
            match seen.get(&key) {
                Some(first) => {
                    let previous = Location::new(current.file.clone(), first.range);
                    diagnostics.redundant_import(dep.range, &dep.module_name, Some(&previous));
                }
                None => {
                    seen.insert(key, dep);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_order_rec(
        &mut self,
        current: &Arc<StexObject>,
        root: &Arc<StexObject>,
        diagnostics: &mut Diagnostics,
        cache: &mut HashMap<PathBuf, Vec<Arc<StexObject>>>,
        cyclic_stack: &mut Vec<StackEntry>,
        at_toplevel: bool,
        use_on_stack: bool,
    ) -> Vec<Arc<StexObject>> {
        if let Some(cached) = cache.get(&current.file) {
            return cached.clone();
        }
        let mut order: Vec<Arc<StexObject>> = Vec::new();
        for dep in &current.dependencies {
            let Some(object) = self.index.get(&dep.file_hint) else {
                if at_toplevel {
                    diagnostics.file_not_found(dep.range, &dep.file_hint);
                }
                continue;
            };
            if self.index.resolve(dep).is_none() {
                if at_toplevel {
                    diagnostics.undefined_module_not_exported(
                        dep.range,
                        &dep.module_name,
                        &dep.file_hint,
                    );
                }
                continue;
            }
            // Private (use-kind) imports are followed only for the root
            // itself.
            if !dep.export && !at_toplevel {
                continue;
            }
            // Never re-import the root through a use chain.
            if use_on_stack && object.file == root.file {
                continue;
            }
            if cyclic_stack.iter().any(|entry| entry.file == object.file) {
                // The closing edge is diagnosed exactly once, when the
                // cycle closes back on the root.
                if !at_toplevel
                    && cyclic_stack
                        .last()
                        .is_some_and(|entry| entry.file == root.file)
                {
                    if let (Some(start), Some(end)) = (cyclic_stack.first(), cyclic_stack.last()) {
                        diagnostics.cyclic_dependency(
                            start.imported_at.range,
                            &start.module_name,
                            &end.imported_at,
                        );
                    }
                }
                continue;
            }
            cyclic_stack.push(StackEntry {
                file: object.file.clone(),
                module_name: dep.module_name.clone(),
                imported_at: Location::new(current.file.clone(), dep.range),
            });
            let object = object.clone();
            let child_order = self.build_order_rec(
                &object,
                root,
                diagnostics,
                cache,
                cyclic_stack,
                false,
                use_on_stack || !dep.export,
            );
            cyclic_stack.pop();
            // Imports of the child move to the front, duplicates keep
            // their earliest position.
            order.retain(|existing| {
                !child_order
                    .iter()
                    .any(|child| child.file == existing.file)
            });
            let mut merged = child_order;
            merged.extend(order);
            order = merged;
        }
        order.retain(|object| object.file != current.file);
        order.push(current.clone());
        cache.insert(current.file.clone(), order.clone());
        order
    }

    /// The export-closure symbol table of `object`: its own table with
    /// every exported dependency imported into the scope that declared
    /// it.
    fn materialized_table(
        &mut self,
        object: &Arc<StexObject>,
        in_progress: &mut HashSet<PathBuf>,
    ) -> Arc<SymbolTable> {
        if let Some(table) = self.materialized.get(&object.file) {
            return table.clone();
        }
        if !in_progress.insert(object.file.clone()) {
            // Import cycle: fall back to the raw table; the cycle
            // itself is diagnosed by the build order.
            return Arc::new(object.symbol_table.clone());
        }
        let mut table = object.symbol_table.clone();
        let deps: Vec<Dependency> = object
            .dependencies
            .iter()
            .filter(|dep| dep.export)
            .cloned()
            .collect();
        for dep in &deps {
            self.import_dependency(&mut table, dep, in_progress);
        }
        in_progress.remove(&object.file);
        let table = Arc::new(table);
        self.materialized
            .insert(object.file.clone(), table.clone());
        table
    }

    fn import_dependency(
        &mut self,
        table: &mut SymbolTable,
        dep: &Dependency,
        in_progress: &mut HashSet<PathBuf>,
    ) {
        let Some((target, module)) = self.index.resolve(dep) else {
            return;
        };
        let target = target.clone();
        let source = self.materialized_table(&target, in_progress);
        table.import_from(dep.scope, &source, module);
    }

    /// Links one root object: the object's full symbol table plus all
    /// of its imports (exported or not) materialized into their
    /// declaring scopes, with build-order diagnostics attached.
    /// Idempotent for a fixed module index.
    pub fn link(&mut self, object: &Arc<StexObject>) -> StexObject {
        let mut diagnostics = Diagnostics::new();
        let _order = self.make_build_order(object, &mut diagnostics);
        let mut linked = (**object).clone();
        let mut in_progress = HashSet::new();
        in_progress.insert(object.file.clone());
        let deps: Vec<Dependency> = object.dependencies.clone();
        let mut table = object.symbol_table.clone();
        for dep in &deps {
            self.import_dependency(&mut table, dep, &mut in_progress);
        }
        linked.symbol_table = table;
        linked.diagnostics.extend(&diagnostics);
        linked
    }
}

/// Entry of the cyclic-import stack.
struct StackEntry {
    file: PathBuf,
    module_name: String,
    imported_at: Location,
}

/// Validates every reference of every linked object in a batch and
/// reports definitions that are never referenced anywhere in it.
pub fn validate_references(links: &mut [(Arc<StexObject>, StexObject)]) {
    validate_references_with(links, HashSet::new())
}

/// Like [`validate_references`], with locations already known to be
/// referenced (by earlier batches) seeding the never-referenced check.
pub fn validate_references_with(
    links: &mut [(Arc<StexObject>, StexObject)],
    referenced: HashSet<Location>,
) {
    let mut referenced = referenced;
    for (_, linked) in links.iter_mut() {
        let references: Vec<Reference> = linked.references.clone();
        for reference in &references {
            validate_reference(linked, reference, &mut referenced);
        }
    }
    // Definitions of the root set nobody referenced.
    for (origin, linked) in links.iter_mut() {
        for (id, symbol) in origin.symbol_table.iter() {
            if !symbol.kind.is_def() {
                continue;
            }
            if !referenced.contains(&symbol.location) {
                let name = origin.symbol_table.qualified_name(id).join("?");
                linked
                    .diagnostics
                    .never_referenced(symbol.location.range, &name);
            }
        }
    }
}

fn validate_reference(
    linked: &mut StexObject,
    reference: &Reference,
    referenced: &mut HashSet<Location>,
) {
    let path: Vec<&str> = reference.name.iter().map(String::as_str).collect();
    let resolved = linked.symbol_table.lookup(reference.scope, &path);
    let display_name = reference.name.join("?");
    if resolved.is_empty() {
        let suggestions = suggest_similar(&linked.symbol_table, reference);
        linked.diagnostics.undefined_symbol(
            reference.range,
            &display_name,
            Some(&reference.reference_type.format_enum()),
            &suggestions,
        );
        return;
    }
    let binding_lang = linked
        .symbol_table
        .current_binding(reference.scope)
        .and_then(|binding| match &linked.symbol_table.get(binding).kind {
            SymbolKind::Binding { lang } => Some(lang.clone()),
            _ => None,
        });
    let mut actual = ReferenceType::empty();
    let mut noverb_reports: Vec<(Option<String>, Location)> = Vec::new();
    for &id in &resolved {
        let symbol = linked.symbol_table.get(id);
        actual |= ReferenceType::of_symbol(&symbol.kind);
        referenced.insert(symbol.location.clone());
        if let (SymbolKind::Def { noverb, noverbs, .. }, Some(lang)) =
            (&symbol.kind, &binding_lang)
        {
            if *noverb {
                noverb_reports.push((None, symbol.location.clone()));
            }
            if noverbs.contains(lang) {
                noverb_reports.push((Some(lang.clone()), symbol.location.clone()));
            }
        }
    }
    if !reference.reference_type.intersects(actual) {
        linked.diagnostics.reference_type_check(
            reference.range,
            &reference.reference_type.format_enum(),
            &actual.format_enum(),
        );
    }
    for (lang, location) in noverb_reports {
        linked.diagnostics.referenced_noverb(
            reference.range,
            &display_name,
            lang.as_deref(),
            &location,
        );
    }
}

/// Up to three close matches for an unresolved reference, drawn from
/// the linked table and filtered by the expected symbol kind.
fn suggest_similar(table: &SymbolTable, reference: &Reference) -> Vec<(String, Location)> {
    use nucleo_matcher::pattern::{AtomKind, CaseMatching, Normalization, Pattern};
    use nucleo_matcher::{Config, Matcher, Utf32Str};

    let expected = reference.reference_type;
    let wants_definition = expected.intersects(ReferenceType::ANY_DEFINITION);
    let wants_module = expected.intersects(ReferenceType::MODULE | ReferenceType::MODSIG);
    let query = reference.name.join("?");
    let mut matcher = Matcher::new(Config::DEFAULT);
    let pattern = Pattern::new(
        &query,
        CaseMatching::Ignore,
        Normalization::Smart,
        AtomKind::Fuzzy,
    );
    let mut scored: Vec<(u32, String, Location)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (id, symbol) in table.iter() {
        let relevant = match &symbol.kind {
            SymbolKind::Def { .. } => wants_definition,
            SymbolKind::Module { .. } => wants_module,
            _ => false,
        };
        if !relevant {
            continue;
        }
        let qualified = table.qualified_name(id);
        let candidate = qualified
            .iter()
            .rev()
            .take(2)
            .rev()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("?");
        if candidate.is_empty() || !seen.insert(candidate.clone()) {
            continue;
        }
        let mut buffer = Vec::new();
        let haystack = Utf32Str::new(&candidate, &mut buffer);
        if let Some(score) = pattern.score(haystack, &mut matcher) {
            scored.push((score, candidate, symbol.location.clone()));
        }
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(3)
        .map(|(_, name, location)| (name, location))
        .collect()
}
