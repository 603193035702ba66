//! The object compiler.
//!
//! Turns one source file into one [`StexObject`]: a symbol table
//! fragment, the module dependencies the file declares, the references
//! it makes, and the diagnostics found on the way. Objects are cached
//! on disk under `outdir/sha1(parent_dir)/<filename>.stexobj` and
//! reloaded while the source is unchanged.

use crate::mathhub;
use crate::parse::{self, DefiInfo, NodeId, ParsedFile, TreeKind, TrefiInfo};
use crate::symbols::{
    AccessModifier, DefType, ModuleType, SymbolId, SymbolKind, SymbolTable,
};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io;
use std::path::{Path, PathBuf};
use stexls_core::{Diagnostics, Location, Position, Range};

/// Bump when the on-disk object layout changes; readers delete and
/// recompile on mismatch.
const STEXOBJ_VERSION: u32 = 2;

bitflags! {
    /// Expected type of the symbol a reference points to. Flags may be
    /// or-ed together for disjunctive expectations. Serde impls come
    /// from the bitflags `serde` feature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReferenceType: u16 {
        const BINDING = 1;
        const MODULE = 1 << 1;
        const MODSIG = 1 << 2;
        const VIEWSIG = 1 << 3;
        const VIEWMOD = 1 << 4;
        const DEF = 1 << 5;
        const DREF = 1 << 6;
        const SYMDEF = 1 << 7;
        const SYM = 1 << 8;
        const ANY_DEFINITION = Self::DEF.bits()
            | Self::DREF.bits()
            | Self::SYMDEF.bits()
            | Self::SYM.bits();
    }
}

impl ReferenceType {
    /// The reference type a resolved symbol satisfies.
    pub fn of_symbol(kind: &SymbolKind) -> ReferenceType {
        match kind {
            SymbolKind::Module {
                module_type: ModuleType::Modsig,
            } => ReferenceType::MODSIG,
            SymbolKind::Module {
                module_type: ModuleType::Module,
            } => ReferenceType::MODULE,
            SymbolKind::Binding { .. } => ReferenceType::BINDING,
            SymbolKind::Def { def_type, .. } => match def_type {
                DefType::Def => ReferenceType::DEF,
                DefType::Dref => ReferenceType::DREF,
                DefType::Symdef => ReferenceType::SYMDEF,
                DefType::Sym => ReferenceType::SYM,
            },
            SymbolKind::Root | SymbolKind::Scope => ReferenceType::empty(),
        }
    }

    /// Formats as `"def", "dref" or "sym"` for messages.
    pub fn format_enum(self) -> String {
        const NAMES: [(ReferenceType, &str); 9] = [
            (ReferenceType::BINDING, "binding"),
            (ReferenceType::MODULE, "module"),
            (ReferenceType::MODSIG, "modsig"),
            (ReferenceType::VIEWSIG, "viewsig"),
            (ReferenceType::VIEWMOD, "viewmod"),
            (ReferenceType::DEF, "def"),
            (ReferenceType::DREF, "dref"),
            (ReferenceType::SYMDEF, "symdef"),
            (ReferenceType::SYM, "sym"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        match names.len() {
            0 => "\"undefined\"".to_string(),
            1 => format!("\"{}\"", names[0]),
            n => format!(
                "{} or \"{}\"",
                names[..n - 1]
                    .iter()
                    .map(|name| format!("\"{name}\""))
                    .collect::<Vec<_>>()
                    .join(", "),
                names[n - 1]
            ),
        }
    }
}

/// An import edge: the data needed to resolve a module dependency at
/// link time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Range the import statement spans.
    pub range: Range,
    /// Symbol the imported module's symbols are added under.
    pub scope: SymbolId,
    pub module_name: String,
    /// Expected module type of the resolved symbol.
    pub module_type_hint: ModuleType,
    /// File the module is expected to be defined in or exported by.
    pub file_hint: PathBuf,
    /// `import`-kind statements re-export; `use`-kind do not.
    pub export: bool,
}

impl Dependency {
    /// Two dependencies are the same import when they name the same
    /// module and the new one's scope is the other's or a descendant.
    fn is_same_import(&self, other: &Dependency, table: &SymbolTable) -> bool {
        self.module_name == other.module_name
            && (self.scope == other.scope || table.is_parent_of(self.scope, other.scope))
    }
}

/// A by-name reference to a symbol, resolved after linking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub range: Range,
    /// Scope the lookup starts from.
    pub scope: SymbolId,
    pub name: Vec<String>,
    pub reference_type: ReferenceType,
}

/// The compiled form of one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StexObject {
    pub file: PathBuf,
    pub symbol_table: SymbolTable,
    pub dependencies: Vec<Dependency>,
    pub references: Vec<Reference>,
    pub diagnostics: Diagnostics,
}

impl StexObject {
    pub fn new(file: PathBuf, whole_file: Range) -> Self {
        let location = Location::new(file.clone(), whole_file);
        Self {
            file,
            symbol_table: SymbolTable::new(location),
            dependencies: Vec::new(),
            references: Vec::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    /// Registers a dependency unless the same import already exists in
    /// the same or an enclosing scope, which is a redundant-import
    /// warning instead.
    pub fn add_dependency(&mut self, dep: Dependency) {
        for existing in &self.dependencies {
            if existing.is_same_import(&dep, &self.symbol_table) {
                let previous = Location::new(self.file.clone(), existing.range);
                self.diagnostics
                    .redundant_import(dep.range, &dep.module_name, Some(&previous));
                return;
            }
        }
        self.dependencies.push(dep);
    }

    pub fn add_reference(&mut self, reference: Reference) {
        self.references.push(reference);
    }

    /// Module symbols this file exports: public modules at the table
    /// root.
    pub fn exported_modules(&self) -> impl Iterator<Item = (&str, ModuleType, SymbolId)> {
        self.symbol_table
            .get(self.symbol_table.root())
            .children
            .values()
            .flatten()
            .filter_map(|&id| {
                let symbol = self.symbol_table.get(id);
                match symbol.kind {
                    SymbolKind::Module { module_type }
                        if symbol.access == AccessModifier::Public =>
                    {
                        Some((symbol.name.as_str(), module_type, id))
                    }
                    _ => None,
                }
            })
    }

    /// Human-readable object dump used by `lint --verbose`.
    pub fn format(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "File: \"{}\"", self.file.display());
        let _ = writeln!(out, "Dependencies:");
        if self.dependencies.is_empty() {
            let _ = writeln!(out, "  No dependencies.");
        }
        for dep in &self.dependencies {
            let export = if dep.export { "public" } else { "private" };
            let _ = writeln!(
                out,
                "  {}:{}: {export} import {} \"{}\" from \"{}\"",
                dep.range.start.line + 1,
                dep.range.start.character + 1,
                dep.module_type_hint.as_str(),
                dep.module_name,
                dep.file_hint.display()
            );
        }
        let _ = writeln!(out, "References:");
        if self.references.is_empty() {
            let _ = writeln!(out, "  No references.");
        }
        for reference in &self.references {
            let _ = writeln!(
                out,
                "  {}:{}: {} of type {}",
                reference.range.start.line + 1,
                reference.range.start.character + 1,
                reference.name.join("?"),
                reference.reference_type.format_enum()
            );
        }
        let _ = writeln!(out, "Diagnostics:");
        if self.diagnostics.is_empty() {
            let _ = writeln!(out, "  No diagnostics.");
        }
        for diagnostic in &self.diagnostics {
            let _ = writeln!(
                out,
                "  {}:{}: {} - {} ({})",
                diagnostic.range.start.line + 1,
                diagnostic.range.start.character + 1,
                diagnostic.severity.as_str(),
                diagnostic.message,
                diagnostic.code
            );
        }
        let _ = writeln!(out, "Symbol Table:");
        for (id, symbol) in self.symbol_table.iter() {
            let depth = self.symbol_table.qualified_name(id).len();
            let _ = writeln!(
                out,
                "{}> {} ({:?})",
                "-".repeat(depth),
                symbol.name,
                symbol.access
            );
        }
        out
    }
}

/// Range spanning the entire content.
pub fn whole_file_range(content: &str) -> Range {
    let mut lines = 0u32;
    let mut last_len = 0u32;
    for line in content.split('\n') {
        last_len = line.chars().count() as u32;
        lines += 1;
    }
    Range::new(Position::new(0, 0), Position::new(lines.saturating_sub(1), last_len))
}

pub struct Compiler {
    /// Workspace root imports are resolved against.
    pub root: PathBuf,
    /// Directory object files are cached in.
    pub outdir: PathBuf,
}

impl Compiler {
    pub fn new(root: impl Into<PathBuf>, outdir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            outdir: outdir.into(),
        }
    }

    /// `outdir/sha1(parent_dir)/<filename>.stexobj`.
    pub fn objectfile_path(outdir: &Path, file: &Path) -> PathBuf {
        let parent = file.parent().unwrap_or(file);
        let mut hasher = Sha1::new();
        hasher.update(parent.to_string_lossy().as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        let mut name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".stexobj");
        outdir.join(hash).join(name)
    }

    /// True iff the object file is absent or older than the source.
    pub fn recompilation_required(&self, file: &Path) -> bool {
        let objectfile = Self::objectfile_path(&self.outdir, file);
        let Ok(object_meta) = objectfile.metadata() else {
            return true;
        };
        let (Ok(source_time), Ok(object_time)) = (
            file.metadata().and_then(|m| m.modified()),
            object_meta.modified(),
        ) else {
            return true;
        };
        source_time > object_time
    }

    /// Compiles `content` as `file` without touching the cache.
    /// Deterministic: identical content yields an equal object.
    pub fn compile_source(&self, file: &Path, content: &str) -> StexObject {
        let file = mathhub::normalize(file);
        let parsed = parse::parse(&file, content);
        let mut object = StexObject::new(file.clone(), whole_file_range(content));
        for (location, error) in &parsed.errors {
            object.diagnostics.parser_exception(location.range, error.to_string());
        }
        let mut state = CompileState {
            object: &mut object,
            parsed: &parsed,
            root: &self.root,
        };
        let roots: Vec<NodeId> = parsed.roots.clone();
        for root in roots {
            state.compile_root(root);
        }
        object
    }

    /// Compiles a file, or loads its cached object when the cache is
    /// newer than the source. `content` (an open editor buffer)
    /// overrides disk content and forces recompilation. A corrupt
    /// cache entry is deleted and compilation retried from source.
    pub fn compile_or_load(
        &self,
        file: &Path,
        content: Option<&str>,
        dryrun: bool,
    ) -> io::Result<StexObject> {
        let file = mathhub::normalize(file);
        if !file.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("\"{}\" is not a file.", file.display()),
            ));
        }
        let objectfile = Self::objectfile_path(&self.outdir, &file);
        // Two attempts: a failed cache load deletes the entry, the
        // second round recompiles from source.
        for _ in 0..2 {
            if content.is_some() || self.recompilation_required(&file) {
                let source = match content {
                    Some(content) => content.to_string(),
                    None => std::fs::read_to_string(&file)?,
                };
                let object = self.compile_source(&file, &source);
                if !dryrun {
                    // Cache writes are best effort; failure to store
                    // never fails the compile.
                    if let Some(dir) = objectfile.parent() {
                        let _ = std::fs::create_dir_all(dir);
                    }
                    if let Ok(bytes) = bincode::serialize(&(STEXOBJ_VERSION, &object)) {
                        let _ = std::fs::write(&objectfile, bytes);
                    }
                }
                return Ok(object);
            }
            match Self::load_objectfile(&objectfile) {
                Ok(object) => return Ok(object),
                Err(_) => {
                    let _ = std::fs::remove_file(&objectfile);
                }
            }
        }
        let source = std::fs::read_to_string(&file)?;
        Ok(self.compile_source(&file, &source))
    }

    fn load_objectfile(objectfile: &Path) -> io::Result<StexObject> {
        let bytes = std::fs::read(objectfile)?;
        let (version, object): (u32, StexObject) = bincode::deserialize(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if version != STEXOBJ_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "object file version mismatch",
            ));
        }
        Ok(object)
    }

    pub fn delete_objectfile(&self, file: &Path) {
        let _ = std::fs::remove_file(Self::objectfile_path(&self.outdir, file));
    }
}

/// Walks the intermediate tree with a stack of (node, context symbol)
/// frames and applies the per-variant compile rules.
struct CompileState<'c> {
    object: &'c mut StexObject,
    parsed: &'c ParsedFile,
    root: &'c Path,
}

impl CompileState<'_> {
    fn compile_root(&mut self, root: NodeId) {
        enum Step {
            Visit(NodeId),
            Leave(NodeId),
        }
        let mut context: Vec<(NodeId, SymbolId)> = Vec::new();
        let mut stack = vec![Step::Visit(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Visit(id) => {
                    stack.push(Step::Leave(id));
                    let current = context
                        .last()
                        .map(|(_, symbol)| *symbol)
                        .unwrap_or(self.object.symbol_table.root());
                    if let Some(next) = self.enter(id, current) {
                        context.push((id, next));
                    }
                    for child in self.parsed.node(id).children.iter().rev() {
                        stack.push(Step::Visit(*child));
                    }
                }
                Step::Leave(id) => {
                    if let Some((top, _)) = context.last() {
                        if *top == id {
                            context.pop();
                        }
                    }
                }
            }
        }
    }

    /// Dispatches on the node variant; returns the new context symbol
    /// when the variant opens one.
    fn enter(&mut self, id: NodeId, context: SymbolId) -> Option<SymbolId> {
        let node = self.parsed.node(id);
        let location = node.location.clone();
        match &node.kind {
            TreeKind::Scope { scope_name } => {
                let name = scope_name.text.clone();
                Some(self.object.symbol_table.add_scope(
                    context,
                    &name.to_uppercase(),
                    location,
                ))
            }
            TreeKind::Modsig { name } => self.compile_modsig(context, name.clone(), &location),
            TreeKind::Modnl {
                name,
                lang,
                mh_mode: _,
            } => self.compile_modnl(context, name.clone(), lang.clone(), &location),
            TreeKind::Module { id: module_id } => {
                let (name, name_location) = match module_id {
                    Some(id) => (Some(id.text.clone()), location.with_range(id.range)),
                    None => (None, location.clone()),
                };
                match self.object.symbol_table.add_module(
                    context,
                    ModuleType::Module,
                    name,
                    name_location,
                ) {
                    Ok(symbol) => Some(symbol),
                    Err(error) => {
                        self.object.diagnostics.duplicate_symbol(
                            location.range,
                            module_id.as_ref().map(|t| t.text.as_str()).unwrap_or(""),
                            error.previous_location(),
                        );
                        None
                    }
                }
            }
            TreeKind::View { .. } | TreeKind::ViewSig { .. } => {
                // Views contribute no symbols; they still open an
                // anonymous scope so nothing inside leaks out.
                Some(self.object.symbol_table.add_scope(context, "VIEW", location))
            }
            TreeKind::Defi {
                tokens,
                name_annotation,
                a,
                ..
            } => {
                let info = DefiInfo {
                    tokens,
                    name_annotation: name_annotation.as_ref(),
                    a: *a,
                };
                self.compile_defi(id, context, &info, &location);
                None
            }
            TreeKind::Trefi {
                tokens,
                target_annotation,
                m,
                a,
                drefi,
                ..
            } => {
                let info = TrefiInfo {
                    tokens,
                    target_annotation: target_annotation.as_ref(),
                    a: *a,
                };
                self.compile_trefi(id, context, &info, *m, *drefi, &location);
                None
            }
            TreeKind::Symi { tokens, noverb, .. } => {
                let name = tokens
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join("-");
                let range = Range::big_union(tokens.iter().map(|t| t.range))
                    .unwrap_or(location.range);
                let kind = SymbolKind::Def {
                    def_type: DefType::Sym,
                    noverb: noverb.is_all,
                    noverbs: noverb.langs.clone(),
                };
                if let Err(error) = self.object.symbol_table.add_child(
                    context,
                    name.clone(),
                    location.with_range(range),
                    AccessModifier::Public,
                    kind,
                    false,
                ) {
                    self.object.diagnostics.duplicate_symbol(
                        range,
                        &name,
                        error.previous_location(),
                    );
                }
                None
            }
            TreeKind::Symdef { name, noverb, .. } => {
                let kind = SymbolKind::Def {
                    def_type: DefType::Symdef,
                    noverb: noverb.is_all,
                    noverbs: noverb.langs.clone(),
                };
                let symbol_name = name.text.trim().to_string();
                if let Err(error) = self.object.symbol_table.add_child(
                    context,
                    symbol_name,
                    location.with_range(name.range),
                    AccessModifier::Public,
                    kind,
                    true,
                ) {
                    self.object.diagnostics.invalid_redefinition(
                        name.range,
                        error.previous_location(),
                        error.to_string(),
                    );
                }
                None
            }
            TreeKind::ImportModule {
                module,
                mhrepos,
                repos,
                dir,
                load,
                path,
                export,
                ..
            } => {
                self.compile_importmodule(
                    context,
                    module,
                    mhrepos.as_ref(),
                    repos.as_ref(),
                    dir.as_ref(),
                    load.as_ref(),
                    path.as_ref(),
                    *export,
                    &location,
                );
                None
            }
            TreeKind::GImport {
                module,
                repository,
                export,
                ..
            } => {
                self.compile_gimport(context, module, repository.as_ref(), *export, &location);
                None
            }
            // Recognized, but contribute no symbols in the core.
            TreeKind::GStructure { .. } | TreeKind::Tassign { .. } => None,
        }
    }

    fn compile_modsig(
        &mut self,
        context: SymbolId,
        name: parse::TokenWithLocation,
        location: &Location,
    ) -> Option<SymbolId> {
        let expected = format!("{}.tex", name.text);
        let actual = self
            .object
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if actual != expected {
            self.object
                .diagnostics
                .file_name_mismatch(name.range, &expected, &actual);
        }
        match self.object.symbol_table.add_module(
            context,
            ModuleType::Modsig,
            Some(name.text.clone()),
            location.with_range(name.range),
        ) {
            Ok(symbol) => Some(symbol),
            Err(error) => {
                self.object.diagnostics.duplicate_symbol(
                    name.range,
                    &name.text,
                    error.previous_location(),
                );
                None
            }
        }
    }

    fn compile_modnl(
        &mut self,
        context: SymbolId,
        name: parse::TokenWithLocation,
        lang: parse::TokenWithLocation,
        location: &Location,
    ) -> Option<SymbolId> {
        let expected = format!("{}.{}.tex", name.text, lang.text);
        let actual = self
            .object
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if actual != expected {
            self.object
                .diagnostics
                .file_name_mismatch(name.range, &expected, &actual);
        }
        let binding = match self.object.symbol_table.add_binding(
            context,
            name.text.clone(),
            lang.text.clone(),
            location.with_range(name.range),
        ) {
            Ok(binding) => binding,
            Err(error) => {
                self.object.diagnostics.duplicate_symbol(
                    name.range,
                    &name.text,
                    error.previous_location(),
                );
                return None;
            }
        };
        // The binding depends on the signature file it binds; imported
        // symbols land in the binding scope.
        let file_hint = self
            .object
            .file
            .parent()
            .map(|parent| parent.join(format!("{}.tex", name.text)))
            .unwrap_or_else(|| PathBuf::from(format!("{}.tex", name.text)));
        self.object.add_reference(Reference {
            range: name.range,
            scope: binding,
            name: vec![name.text.clone()],
            reference_type: ReferenceType::MODSIG,
        });
        self.object.add_dependency(Dependency {
            range: name.range,
            scope: binding,
            module_name: name.text,
            module_type_hint: ModuleType::Modsig,
            file_hint,
            export: true,
        });
        Some(binding)
    }

    fn compile_defi(
        &mut self,
        id: NodeId,
        context: SymbolId,
        info: &DefiInfo,
        location: &Location,
    ) {
        let parent_module = self.parsed.find_parent_module_tree(id);
        let in_module_env = parent_module
            .map(|module| matches!(self.parsed.node(module).kind, TreeKind::Module { .. }))
            .unwrap_or(false);
        if in_module_env {
            let kind = SymbolKind::Def {
                def_type: DefType::Def,
                noverb: false,
                noverbs: Default::default(),
            };
            if let Err(error) = self.object.symbol_table.add_child(
                context,
                info.name(),
                location.clone(),
                AccessModifier::Public,
                kind,
                false,
            ) {
                self.object.diagnostics.duplicate_symbol(
                    location.range,
                    &info.name(),
                    error.previous_location(),
                );
            }
            return;
        }
        let Some(module_name) = self.parsed.find_parent_module_name(id) else {
            self.object
                .diagnostics
                .cant_infer_ref_module_outside_module(location.range);
            return;
        };
        self.object.add_reference(Reference {
            range: location.range,
            scope: context,
            name: vec![module_name, info.name()],
            reference_type: ReferenceType::ANY_DEFINITION,
        });
    }

    fn compile_trefi(
        &mut self,
        id: NodeId,
        context: SymbolId,
        info: &TrefiInfo,
        m: bool,
        drefi: bool,
        location: &Location,
    ) {
        if drefi {
            match self.object.symbol_table.current_module(context) {
                Some(module) => {
                    let kind = SymbolKind::Def {
                        def_type: DefType::Dref,
                        noverb: false,
                        noverbs: Default::default(),
                    };
                    if let Err(error) = self.object.symbol_table.add_child(
                        module,
                        info.name(),
                        location.clone(),
                        AccessModifier::Public,
                        kind,
                        true,
                    ) {
                        self.object.diagnostics.invalid_redefinition(
                            location.range,
                            error.previous_location(),
                            error.to_string(),
                        );
                    }
                }
                None => {
                    self.object.diagnostics.semantic_location_check(
                        location.range,
                        "drefi",
                        Some("Parent module symbol not found"),
                    );
                }
            }
        }
        // A drefi's symbol reference expects the dref it defines; a
        // plain trefi accepts any definition kind.
        let symbol_type = if drefi {
            ReferenceType::DREF | ReferenceType::ANY_DEFINITION
        } else {
            ReferenceType::ANY_DEFINITION
        };
        match info.module() {
            Some(module) => {
                self.object.add_reference(Reference {
                    range: module.range,
                    scope: context,
                    name: vec![module.text.trim().to_string()],
                    reference_type: ReferenceType::MODSIG | ReferenceType::MODULE,
                });
                self.object.add_reference(Reference {
                    range: location.range,
                    scope: context,
                    name: vec![module.text.trim().to_string(), info.name()],
                    reference_type: symbol_type,
                });
            }
            None => match self.parsed.find_parent_module_name(id) {
                Some(module_name) => {
                    self.object.add_reference(Reference {
                        range: location.range,
                        scope: context,
                        name: vec![module_name, info.name()],
                        reference_type: symbol_type,
                    });
                }
                None => {
                    self.object
                        .diagnostics
                        .cant_infer_ref_module_outside_module(location.range);
                }
            },
        }
        if m {
            self.object.diagnostics.mtref_deprecated(location.range);
            let has_questionmark = info
                .target_annotation
                .map(|annotation| annotation.text.contains('?'))
                .unwrap_or(false);
            if !has_questionmark {
                self.object
                    .diagnostics
                    .mtref_questionmark_syntax(location.range);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_importmodule(
        &mut self,
        context: SymbolId,
        module: &parse::TokenWithLocation,
        mhrepos: Option<&parse::TokenWithLocation>,
        repos: Option<&parse::TokenWithLocation>,
        dir: Option<&parse::TokenWithLocation>,
        load: Option<&parse::TokenWithLocation>,
        path: Option<&parse::TokenWithLocation>,
        export: bool,
        location: &Location,
    ) {
        let file_hint = parse::importmodule_target(
            self.root,
            &self.object.file,
            mhrepos.map(|t| t.text.trim()),
            path.map(|t| t.text.trim()),
            dir.map(|t| t.text.trim()),
            load.map(|t| t.text.trim()),
            module.text.trim(),
        );
        self.object.add_dependency(Dependency {
            range: location.range,
            scope: context,
            module_name: module.text.trim().to_string(),
            module_type_hint: ModuleType::Module,
            file_hint,
            export,
        });
        self.object.add_reference(Reference {
            range: module.range,
            scope: context,
            name: vec![module.text.trim().to_string()],
            reference_type: ReferenceType::MODULE,
        });
        if let Some(repos) = repos {
            self.object.diagnostics.replace_repos_with_mhrepos(repos.range);
        }
        let current_repo = mathhub::repository_name(self.root, &self.object.file);
        if let (Some(mhrepos), Some(current)) = (mhrepos, &current_repo) {
            if mhrepos.text.trim() == current {
                self.object.diagnostics.redundant_location_argument(
                    mhrepos.range,
                    format!(
                        "Redundant mhrepos key: \"{}\" is the current repository.",
                        mhrepos.text.trim()
                    ),
                );
            }
        }
        if let (Some(path), Some(current)) = (
            path,
            mathhub::source_relative_path(self.root, &self.object.file),
        ) {
            if path.text.trim() == current {
                self.object.diagnostics.redundant_location_argument(
                    path.range,
                    format!(
                        "Redundant path key: \"{}\" is the current path.",
                        path.text.trim()
                    ),
                );
            }
        }
        if let (Some(dir), Some(current)) = (
            dir,
            mathhub::source_relative_dir(self.root, &self.object.file),
        ) {
            if dir.text.trim() == current {
                self.object
                    .diagnostics
                    .is_current_dir(location.range, dir.text.trim());
            }
        }
    }

    fn compile_gimport(
        &mut self,
        context: SymbolId,
        module: &parse::TokenWithLocation,
        repository: Option<&parse::TokenWithLocation>,
        export: bool,
        location: &Location,
    ) {
        let file_hint = parse::gimport_target(
            self.root,
            &self.object.file,
            repository.map(|t| t.text.as_str()),
            &module.text,
        );
        self.object.add_dependency(Dependency {
            range: location.range,
            scope: context,
            module_name: module.text.trim().to_string(),
            module_type_hint: ModuleType::Modsig,
            file_hint,
            export,
        });
        self.object.add_reference(Reference {
            range: location.range,
            scope: context,
            name: vec![module.text.trim().to_string()],
            reference_type: ReferenceType::MODSIG,
        });
        if let (Some(repository), Some(current)) = (
            repository,
            mathhub::repository_name(self.root, &self.object.file),
        ) {
            if repository.text.trim() == current {
                self.object.diagnostics.redundant_location_argument(
                    repository.range,
                    format!(
                        "Redundant repository specified: \"{}\" is the current repository.",
                        repository.text.trim()
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> Compiler {
        Compiler::new("/w", "/tmp/stexls-test-objects")
    }

    fn compile(file: &str, content: &str) -> StexObject {
        compiler().compile_source(Path::new(file), content)
    }

    fn codes(object: &StexObject) -> Vec<&str> {
        object.diagnostics.iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn test_modsig_creates_module_symbol() {
        let object = compile(
            "/w/repo/source/M.tex",
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        );
        assert!(object.diagnostics.is_empty(), "{:?}", object.diagnostics);
        let exported: Vec<_> = object.exported_modules().collect();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].0, "M");
        assert_eq!(exported[0].1, ModuleType::Modsig);
        let module = exported[0].2;
        assert_eq!(object.symbol_table.lookup(module, &["value"]).len(), 1);
    }

    #[test]
    fn test_modsig_filename_mismatch() {
        let object = compile("/w/repo/source/M.tex", "\\begin{modsig}{Other}\\end{modsig}");
        assert_eq!(codes(&object), vec!["filename-mismatch-check"]);
        let diagnostic = object.diagnostics.iter().next().unwrap();
        // anchored at the name token
        assert_eq!(diagnostic.range.start.character, 15);
    }

    #[test]
    fn test_modnl_registers_signature_dependency() {
        let object = compile(
            "/w/repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\trefi{value}\\end{mhmodnl}",
        );
        assert!(object.diagnostics.is_empty(), "{:?}", object.diagnostics);
        assert_eq!(object.dependencies.len(), 1);
        let dep = &object.dependencies[0];
        assert_eq!(dep.module_name, "M");
        assert_eq!(dep.module_type_hint, ModuleType::Modsig);
        assert_eq!(dep.file_hint, PathBuf::from("/w/repo/source/M.tex"));
        assert!(dep.export);
        // one reference to the signature module and one for the trefi
        assert_eq!(object.references.len(), 2);
        assert_eq!(object.references[0].name, vec!["M".to_string()]);
        assert_eq!(
            object.references[1].name,
            vec!["M".to_string(), "value".to_string()]
        );
    }

    #[test]
    fn test_defi_inside_module_env_defines() {
        let object = compile(
            "/w/repo/source/M.tex",
            "\\begin{module}[id=M]\\defi{value}\\end{module}",
        );
        assert!(object.diagnostics.is_empty());
        let module = object.exported_modules().next().unwrap().2;
        let resolved = object.symbol_table.lookup(module, &["value"]);
        assert_eq!(resolved.len(), 1);
        match &object.symbol_table.get(resolved[0]).kind {
            SymbolKind::Def { def_type, .. } => assert_eq!(*def_type, DefType::Def),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_defi_inside_modsig_references() {
        let object = compile(
            "/w/repo/source/M.tex",
            "\\begin{modsig}{M}\\defi{value}\\end{modsig}",
        );
        // inside a modsig, defi only references
        assert_eq!(object.references.len(), 1);
        assert_eq!(
            object.references[0].name,
            vec!["M".to_string(), "value".to_string()]
        );
    }

    #[test]
    fn test_defi_outside_module_cant_infer() {
        let object = compile("/w/repo/source/X.tex", "\\defi{value}");
        assert_eq!(codes(&object), vec!["cannot-infer-referenced-module-outside-module"]);
        assert!(object.references.is_empty());
    }

    #[test]
    fn test_drefi_synthesizes_dref() {
        let object = compile(
            "/w/repo/source/M.tex",
            "\\begin{module}[id=M]\\drefi{value}\\end{module}",
        );
        assert!(object.diagnostics.is_empty(), "{:?}", object.diagnostics);
        let module = object.exported_modules().next().unwrap().2;
        let resolved = object.symbol_table.lookup(module, &["value"]);
        assert_eq!(resolved.len(), 1);
        match &object.symbol_table.get(resolved[0]).kind {
            SymbolKind::Def { def_type, .. } => assert_eq!(*def_type, DefType::Dref),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_mtref_checks() {
        let object = compile(
            "/w/repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\mtrefi{x}\\end{mhmodnl}",
        );
        let codes = codes(&object);
        assert!(codes.contains(&"mtref-deprecation-check"));
        assert!(codes.contains(&"mtref-questionmark-check"));
        // with the ?-syntax the error disappears, the deprecation stays
        let object = compile(
            "/w/repo/source/M.en.tex",
            "\\begin{mhmodnl}{M}{en}\\mtrefi[?x]{x}\\end{mhmodnl}",
        );
        let codes_ok: Vec<&str> = object.diagnostics.iter().map(|d| d.code.as_str()).collect();
        assert!(codes_ok.contains(&"mtref-deprecation-check"));
        assert!(!codes_ok.contains(&"mtref-questionmark-check"));
    }

    #[test]
    fn test_symdef_redefinition_signature() {
        let object = compile(
            "/w/repo/source/M.tex",
            "\\begin{modsig}{M}\\symdef{plus}\\symdef{plus}\\end{modsig}",
        );
        assert!(object.diagnostics.is_empty());
        let object = compile(
            "/w/repo/source/M.tex",
            "\\begin{modsig}{M}\\symdef{plus}\\symdef[noverb]{plus}\\end{modsig}",
        );
        assert_eq!(codes(&object), vec!["invalid-redefinition"]);
    }

    #[test]
    fn test_duplicate_symi() {
        let object = compile(
            "/w/repo/source/M.tex",
            "\\begin{modsig}{M}\\symi{x}\\symi{x}\\end{modsig}",
        );
        assert_eq!(codes(&object), vec!["duplicate-symbol-check"]);
    }

    #[test]
    fn test_gimport_dependency_and_reference() {
        let object = compile(
            "/w/repo/source/A.tex",
            "\\begin{modsig}{A}\\gimport{B}\\end{modsig}",
        );
        assert!(object.diagnostics.is_empty());
        assert_eq!(object.dependencies.len(), 1);
        let dep = &object.dependencies[0];
        assert_eq!(dep.module_name, "B");
        assert_eq!(dep.file_hint, PathBuf::from("/w/repo/source/B.tex"));
        assert_eq!(dep.module_type_hint, ModuleType::Modsig);
        // scope is the enclosing module A
        let module = object.exported_modules().next().unwrap().2;
        assert_eq!(dep.scope, module);
    }

    #[test]
    fn test_gimport_redundant_repository() {
        let object = compile(
            "/w/repo/source/A.tex",
            "\\begin{modsig}{A}\\gimport[repo]{B}\\end{modsig}",
        );
        assert_eq!(codes(&object), vec!["is-current-dir-check"]);
    }

    #[test]
    fn test_duplicate_import_warning() {
        let object = compile(
            "/w/repo/source/A.tex",
            "\\begin{modsig}{A}\\gimport{B}\\gimport{B}\\end{modsig}",
        );
        assert_eq!(codes(&object), vec!["redundant-import-check"]);
        assert_eq!(object.dependencies.len(), 1);
    }

    #[test]
    fn test_repos_deprecation() {
        let object = compile(
            "/w/other/source/A.tex",
            "\\begin{module}[id=A]\\importmhmodule[repos=smglom/x,dir=d]{mod}\\end{module}",
        );
        let codes = codes(&object);
        assert!(codes.contains(&"repos-deprecation-check"), "{codes:?}");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let content = "\\begin{modsig}{M}\\symi{value}\\gimport{B}\\end{modsig}";
        let a = compile("/w/repo/source/M.tex", content);
        let b = compile("/w/repo/source/M.tex", content);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("w");
        let source_dir = root.join("repo").join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        let file = source_dir.join("M.tex");
        std::fs::write(&file, "\\begin{modsig}{M}\\symi{value}\\end{modsig}").unwrap();
        let compiler = Compiler::new(&root, dir.path().join("objects"));
        let compiled = compiler.compile_or_load(&file, None, false).unwrap();
        assert!(!compiler.recompilation_required(&file));
        let loaded = compiler.compile_or_load(&file, None, false).unwrap();
        assert_eq!(compiled, loaded);
    }

    #[test]
    fn test_corrupt_cache_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("w");
        let source_dir = root.join("repo").join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        let file = source_dir.join("M.tex");
        std::fs::write(&file, "\\begin{modsig}{M}\\end{modsig}").unwrap();
        let outdir = dir.path().join("objects");
        let compiler = Compiler::new(&root, &outdir);
        let compiled = compiler.compile_or_load(&file, None, false).unwrap();
        let objectfile = Compiler::objectfile_path(&outdir, &file);
        std::fs::write(&objectfile, b"garbage").unwrap();
        // make sure the mtime check prefers the (corrupt) cache
        let loaded = compiler.compile_or_load(&file, None, false).unwrap();
        assert_eq!(compiled.symbol_table, loaded.symbol_table);
        // the corrupt entry was replaced
        assert!(objectfile.exists());
    }

    #[test]
    fn test_open_buffer_forces_recompilation() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("w");
        let source_dir = root.join("repo").join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        let file = source_dir.join("M.tex");
        std::fs::write(&file, "\\begin{modsig}{M}\\end{modsig}").unwrap();
        let compiler = Compiler::new(&root, dir.path().join("objects"));
        compiler.compile_or_load(&file, None, false).unwrap();
        let buffered = "\\begin{modsig}{M}\\symi{added}\\end{modsig}";
        let object = compiler.compile_or_load(&file, Some(buffered), false).unwrap();
        let module = object.exported_modules().next().unwrap().2;
        assert_eq!(object.symbol_table.lookup(module, &["added"]).len(), 1);
    }

    #[test]
    fn test_objectfile_path_shape() {
        let path = Compiler::objectfile_path(Path::new("/out"), Path::new("/w/repo/source/M.tex"));
        assert!(path.starts_with("/out"));
        assert_eq!(path.file_name().unwrap(), "M.tex.stexobj");
        // 40 hex chars of sha1
        let hash = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_reference_type_format() {
        assert_eq!(ReferenceType::DEF.format_enum(), "\"def\"");
        assert_eq!(
            (ReferenceType::MODULE | ReferenceType::MODSIG).format_enum(),
            "\"module\" or \"modsig\""
        );
        assert_eq!(
            ReferenceType::ANY_DEFINITION.format_enum(),
            "\"def\", \"dref\", \"symdef\" or \"sym\""
        );
    }

    #[test]
    fn test_reference_type_of_symbol() {
        assert_eq!(
            ReferenceType::of_symbol(&SymbolKind::Module {
                module_type: ModuleType::Modsig
            }),
            ReferenceType::MODSIG
        );
        assert!(ReferenceType::ANY_DEFINITION.contains(ReferenceType::of_symbol(
            &SymbolKind::Def {
                def_type: DefType::Sym,
                noverb: false,
                noverbs: Default::default(),
            }
        )));
    }
}
