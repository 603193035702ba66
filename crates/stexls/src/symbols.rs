//! The symbol model.
//!
//! A per-file symbol table is an arena of symbols addressed by integer
//! handles; parent links and child maps are ids, so the ownership graph
//! stays acyclic and the whole table serializes into object files.
//! Scoped lookup and the public-closure import protocol live here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use stexls_core::Location;
use thiserror::Error;

/// Which latex environment created a module symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleType {
    Modsig,
    Module,
}

impl ModuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modsig => "modsig",
            Self::Module => "module",
        }
    }
}

/// Which latex environment created a definition symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefType {
    Def,
    Dref,
    Symdef,
    Sym,
}

impl DefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Def => "def",
            Self::Dref => "dref",
            Self::Symdef => "symdef",
            Self::Sym => "sym",
        }
    }
}

/// Access modifiers, ordered least to most restrictive. The visible
/// access of a symbol is the most restrictive along its parent chain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AccessModifier {
    Public,
    Protected,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolKind {
    /// Synthetic per-file container.
    Root,
    Module {
        module_type: ModuleType,
    },
    /// Language binding for a signature; named after the module.
    Binding {
        lang: String,
    },
    Def {
        def_type: DefType,
        /// The symbol must not be verbalized in any language.
        noverb: bool,
        /// Languages the symbol must not be verbalized in.
        noverbs: BTreeSet<String>,
    },
    /// Anonymous import barrier (frame, omtext, ...).
    Scope,
}

impl SymbolKind {
    pub fn is_module(&self) -> bool {
        matches!(self, SymbolKind::Module { .. })
    }

    pub fn is_def(&self) -> bool {
        matches!(self, SymbolKind::Def { .. })
    }

    /// Modules and bindings stop upward lookup.
    pub fn is_lookup_barrier(&self) -> bool {
        matches!(self, SymbolKind::Module { .. } | SymbolKind::Binding { .. })
    }

    fn same_variant(&self, other: &SymbolKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Handle into a [`SymbolTable`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SymbolId(u32);

impl SymbolId {
    pub const ROOT: SymbolId = SymbolId(0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolData {
    pub name: String,
    pub location: Location,
    pub access: AccessModifier,
    pub kind: SymbolKind,
    pub parent: Option<SymbolId>,
    /// Children keyed by local name. A name maps to a list because some
    /// variants permit alternative redefinitions.
    pub children: BTreeMap<String, Vec<SymbolId>>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SymbolError {
    #[error("Symbol with name \"{name}\" already added")]
    Duplicate { name: String, previous: Location },
    #[error("{message}")]
    InvalidRedefinition { message: String, previous: Location },
}

impl SymbolError {
    pub fn previous_location(&self) -> &Location {
        match self {
            Self::Duplicate { previous, .. } => previous,
            Self::InvalidRedefinition { previous, .. } => previous,
        }
    }
}

/// Arena symbol table rooted at a synthetic `__root__` symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTable {
    symbols: Vec<SymbolData>,
    /// Counter for synthesized names of anonymous modules and scopes.
    anonymous: u32,
}

impl SymbolTable {
    pub fn new(file_location: Location) -> Self {
        Self {
            symbols: vec![SymbolData {
                name: "__root__".to_string(),
                location: file_location,
                access: AccessModifier::Public,
                kind: SymbolKind::Root,
                parent: None,
                children: BTreeMap::new(),
            }],
            anonymous: 0,
        }
    }

    pub fn root(&self) -> SymbolId {
        SymbolId::ROOT
    }

    pub fn get(&self, id: SymbolId) -> &SymbolData {
        &self.symbols[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &SymbolData)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, data)| (SymbolId(i as u32), data))
    }

    /// Synthesizes a name for an anonymous module or scope. Anonymous
    /// symbols are private, so the marker never crosses an import.
    fn anonymous_name(&mut self, hint: &str) -> String {
        let name = format!("__{}#{}__", hint, self.anonymous);
        self.anonymous += 1;
        name
    }

    /// Adds a child symbol under `parent`.
    ///
    /// Duplicate names are rejected unless `alternative` is set, and
    /// alternatives are only accepted when every existing member has
    /// the same variant, the same def type and an identical noverb
    /// signature.
    pub fn add_child(
        &mut self,
        parent: SymbolId,
        name: String,
        location: Location,
        access: AccessModifier,
        kind: SymbolKind,
        alternative: bool,
    ) -> Result<SymbolId, SymbolError> {
        if let Some(existing) = self.get(parent).children.get(&name) {
            if !alternative {
                let previous = self.get(existing[0]).location.clone();
                return Err(SymbolError::Duplicate { name, previous });
            }
            for &prev_id in existing {
                let prev = self.get(prev_id);
                if !prev.kind.same_variant(&kind) {
                    return Err(SymbolError::InvalidRedefinition {
                        message: "Symbol types do not match to previous definition".to_string(),
                        previous: prev.location.clone(),
                    });
                }
                if let (
                    SymbolKind::Def {
                        def_type,
                        noverb,
                        noverbs,
                    },
                    SymbolKind::Def {
                        def_type: prev_def_type,
                        noverb: prev_noverb,
                        noverbs: prev_noverbs,
                    },
                ) = (&kind, &prev.kind)
                {
                    if def_type != prev_def_type {
                        return Err(SymbolError::InvalidRedefinition {
                            message: format!(
                                "Redefinition definition types do not match: {} vs. {}",
                                def_type.as_str(),
                                prev_def_type.as_str()
                            ),
                            previous: prev.location.clone(),
                        });
                    }
                    if noverb != prev_noverb || noverbs != prev_noverbs {
                        return Err(SymbolError::InvalidRedefinition {
                            message:
                                "Redefinition noverb signatures do not match to previous definition"
                                    .to_string(),
                            previous: prev.location.clone(),
                        });
                    }
                }
            }
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(SymbolData {
            name: name.clone(),
            location,
            access,
            kind,
            parent: Some(parent),
            children: BTreeMap::new(),
        });
        self.symbols[parent.0 as usize]
            .children
            .entry(name)
            .or_default()
            .push(id);
        Ok(id)
    }

    /// Adds a module symbol; anonymous modules get a synthesized
    /// private name.
    pub fn add_module(
        &mut self,
        parent: SymbolId,
        module_type: ModuleType,
        name: Option<String>,
        location: Location,
    ) -> Result<SymbolId, SymbolError> {
        let (name, access) = match name {
            Some(name) => (name, AccessModifier::Public),
            None => (self.anonymous_name("MODULE"), AccessModifier::Private),
        };
        self.add_child(
            parent,
            name,
            location,
            access,
            SymbolKind::Module { module_type },
            false,
        )
    }

    pub fn add_binding(
        &mut self,
        parent: SymbolId,
        module: String,
        lang: String,
        location: Location,
    ) -> Result<SymbolId, SymbolError> {
        self.add_child(
            parent,
            module,
            location,
            AccessModifier::Public,
            SymbolKind::Binding { lang },
            false,
        )
    }

    pub fn add_scope(&mut self, parent: SymbolId, hint: &str, location: Location) -> SymbolId {
        let name = self.anonymous_name(hint);
        self.add_child(
            parent,
            name,
            location,
            AccessModifier::Private,
            SymbolKind::Scope,
            false,
        )
        .unwrap_or(SymbolId::ROOT) // synthesized names never collide
    }

    /// The most restrictive access along the parent chain.
    pub fn visible_access(&self, id: SymbolId) -> AccessModifier {
        let symbol = self.get(id);
        match symbol.parent {
            Some(parent) if symbol.access != AccessModifier::Private => {
                symbol.access.max(self.visible_access(parent))
            }
            _ => symbol.access,
        }
    }

    /// Name path from below the root down to the symbol.
    pub fn qualified_name(&self, id: SymbolId) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let symbol = self.get(id);
            if symbol.parent.is_some() {
                names.push(symbol.name.clone());
            }
            current = symbol.parent;
        }
        names.reverse();
        names
    }

    /// First module on the parent chain, including `id` itself.
    pub fn current_module(&self, id: SymbolId) -> Option<SymbolId> {
        let mut current = Some(id);
        while let Some(id) = current {
            if self.get(id).kind.is_module() {
                return Some(id);
            }
            current = self.get(id).parent;
        }
        None
    }

    /// First binding on the parent chain, including `id` itself.
    pub fn current_binding(&self, id: SymbolId) -> Option<SymbolId> {
        let mut current = Some(id);
        while let Some(id) = current {
            if matches!(self.get(id).kind, SymbolKind::Binding { .. }) {
                return Some(id);
            }
            current = self.get(id).parent;
        }
        None
    }

    pub fn is_parent_of(&self, id: SymbolId, other: SymbolId) -> bool {
        let mut current = self.get(other).parent;
        while let Some(parent) = current {
            if parent == id {
                return true;
            }
            current = self.get(parent).parent;
        }
        false
    }

    /// Searches `rest` strictly inside the child sub-trees of `id`;
    /// an empty rest yields `id` itself.
    pub fn find(&self, id: SymbolId, rest: &[&str]) -> Vec<SymbolId> {
        let Some((first, rest)) = rest.split_first() else {
            return vec![id];
        };
        let mut resolved = Vec::new();
        if let Some(children) = self.get(id).children.get(*first) {
            for &child in children {
                resolved.extend(self.find(child, rest));
            }
        }
        resolved
    }

    /// Scoped lookup of a name path starting at `start`.
    ///
    /// Tries the children of `start`, then retries at the parent unless
    /// `start` is a lookup barrier (module or binding). The final
    /// fallback matches `start` itself by name, so a module can
    /// reference its own symbols through its qualified name.
    pub fn lookup(&self, start: SymbolId, name_path: &[&str]) -> Vec<SymbolId> {
        let Some((first, rest)) = name_path.split_first() else {
            return Vec::new();
        };
        let mut resolved = Vec::new();
        if let Some(children) = self.get(start).children.get(*first) {
            for &child in children {
                resolved.extend(self.find(child, rest));
            }
        }
        if resolved.is_empty() {
            let symbol = self.get(start);
            if let (Some(parent), false) = (symbol.parent, symbol.kind.is_lookup_barrier()) {
                return self.lookup(parent, name_path);
            }
            if symbol.name == *first {
                return self.find(start, rest);
            }
        }
        resolved
    }

    /// Copies the module `source_module` of `source` into this table as
    /// a child of `scope`, then recursively re-adds every PUBLIC
    /// descendant: definitions below the module copy, nested public
    /// modules as further imports into `scope`. Re-imports are skipped
    /// silently; signature mismatches surface as link diagnostics, not
    /// here.
    pub fn import_from(&mut self, scope: SymbolId, source: &SymbolTable, source_module: SymbolId) {
        let module = source.get(source_module);
        let copy = match self.add_child(
            scope,
            module.name.clone(),
            module.location.clone(),
            module.access,
            module.kind.clone(),
            false,
        ) {
            Ok(copy) => copy,
            // Already imported into this scope.
            Err(_) => return,
        };
        let children: Vec<(Vec<SymbolId>, bool)> = module
            .children
            .values()
            .map(|alts| (alts.clone(), alts.len() > 1))
            .collect();
        for (alts, is_alternative) in children {
            for child_id in alts {
                let child = source.get(child_id);
                if child.access != AccessModifier::Public {
                    continue;
                }
                match &child.kind {
                    SymbolKind::Module { .. } => {
                        self.import_from(scope, source, child_id);
                    }
                    SymbolKind::Def { .. } => {
                        let _ = self.add_child(
                            copy,
                            child.name.clone(),
                            child.location.clone(),
                            child.access,
                            child.kind.clone(),
                            is_alternative,
                        );
                    }
                    _ => {}
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use stexls_core::{Position, Range};

    fn loc(line: u32) -> Location {
        Location::new(
            "/w/repo/source/M.tex",
            Range::new(Position::new(line, 0), Position::new(line, 10)),
        )
    }

    fn def_kind(def_type: DefType) -> SymbolKind {
        SymbolKind::Def {
            def_type,
            noverb: false,
            noverbs: BTreeSet::new(),
        }
    }

    fn table_with_module() -> (SymbolTable, SymbolId) {
        let mut table = SymbolTable::new(loc(0));
        let module = table
            .add_module(
                SymbolId::ROOT,
                ModuleType::Modsig,
                Some("M".to_string()),
                loc(0),
            )
            .unwrap();
        (table, module)
    }

    #[test]
    fn test_parent_child_consistency() {
        let (table, module) = table_with_module();
        for (id, data) in table.iter() {
            if let Some(parent) = data.parent {
                assert!(table.get(parent).children[&data.name].contains(&id));
            }
        }
        assert_eq!(table.get(module).parent, Some(SymbolId::ROOT));
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let (mut table, module) = table_with_module();
        table
            .add_child(
                module,
                "x".into(),
                loc(1),
                AccessModifier::Public,
                def_kind(DefType::Sym),
                false,
            )
            .unwrap();
        let err = table
            .add_child(
                module,
                "x".into(),
                loc(2),
                AccessModifier::Public,
                def_kind(DefType::Sym),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, SymbolError::Duplicate { .. }));
        assert_eq!(err.previous_location(), &loc(1));
    }

    #[test]
    fn test_alternative_requires_matching_signature() {
        let (mut table, module) = table_with_module();
        table
            .add_child(
                module,
                "x".into(),
                loc(1),
                AccessModifier::Public,
                def_kind(DefType::Symdef),
                false,
            )
            .unwrap();
        // same signature: fine
        table
            .add_child(
                module,
                "x".into(),
                loc(2),
                AccessModifier::Public,
                def_kind(DefType::Symdef),
                true,
            )
            .unwrap();
        // different def type: invalid redefinition
        let err = table
            .add_child(
                module,
                "x".into(),
                loc(3),
                AccessModifier::Public,
                def_kind(DefType::Dref),
                true,
            )
            .unwrap_err();
        assert!(matches!(err, SymbolError::InvalidRedefinition { .. }));
        // different noverb signature: invalid redefinition
        let err = table
            .add_child(
                module,
                "x".into(),
                loc(4),
                AccessModifier::Public,
                SymbolKind::Def {
                    def_type: DefType::Symdef,
                    noverb: true,
                    noverbs: BTreeSet::new(),
                },
                true,
            )
            .unwrap_err();
        assert!(matches!(err, SymbolError::InvalidRedefinition { .. }));
    }

    #[test]
    fn test_noverb_sets_compare_unordered() {
        let (mut table, module) = table_with_module();
        let kind_a = SymbolKind::Def {
            def_type: DefType::Symdef,
            noverb: false,
            noverbs: ["en", "de"].iter().map(|s| s.to_string()).collect(),
        };
        let kind_b = SymbolKind::Def {
            def_type: DefType::Symdef,
            noverb: false,
            noverbs: ["de", "en"].iter().map(|s| s.to_string()).collect(),
        };
        table
            .add_child(module, "x".into(), loc(1), AccessModifier::Public, kind_a, false)
            .unwrap();
        table
            .add_child(module, "x".into(), loc(2), AccessModifier::Public, kind_b, true)
            .unwrap();
    }

    #[test]
    fn test_lookup_finds_in_scope_and_parents() {
        let (mut table, module) = table_with_module();
        let value = table
            .add_child(
                module,
                "value".into(),
                loc(1),
                AccessModifier::Public,
                def_kind(DefType::Sym),
                false,
            )
            .unwrap();
        let scope = table.add_scope(module, "frame", loc(2));
        // from inside the scope, lookup escapes to the module
        assert_eq!(table.lookup(scope, &["value"]), vec![value]);
        // qualified from inside the module resolves through the
        // self-name fallback
        assert_eq!(table.lookup(module, &["M", "value"]), vec![value]);
    }

    #[test]
    fn test_lookup_stops_at_module_barrier() {
        let mut table = SymbolTable::new(loc(0));
        let a = table
            .add_module(SymbolId::ROOT, ModuleType::Modsig, Some("A".into()), loc(0))
            .unwrap();
        let b = table
            .add_module(SymbolId::ROOT, ModuleType::Modsig, Some("B".into()), loc(1))
            .unwrap();
        table
            .add_child(
                b,
                "x".into(),
                loc(2),
                AccessModifier::Public,
                def_kind(DefType::Sym),
                false,
            )
            .unwrap();
        // B.x is not reachable from inside A: lookup must not escape A
        // upward to the root.
        assert!(table.lookup(a, &["B", "x"]).is_empty());
        // but from the root scope it resolves
        assert_eq!(table.lookup(SymbolId::ROOT, &["B", "x"]).len(), 1);
    }

    #[test]
    fn test_visible_access_is_most_restrictive() {
        let mut table = SymbolTable::new(loc(0));
        let module = table
            .add_module(SymbolId::ROOT, ModuleType::Module, None, loc(0))
            .unwrap();
        let def = table
            .add_child(
                module,
                "x".into(),
                loc(1),
                AccessModifier::Public,
                def_kind(DefType::Def),
                false,
            )
            .unwrap();
        // anonymous module is private, so the public def is not visible
        assert_eq!(table.visible_access(def), AccessModifier::Private);
    }

    #[test]
    fn test_import_from_copies_public_closure() {
        let (mut source, module) = table_with_module();
        source
            .add_child(
                module,
                "value".into(),
                loc(1),
                AccessModifier::Public,
                def_kind(DefType::Sym),
                false,
            )
            .unwrap();
        source
            .add_child(
                module,
                "secret".into(),
                loc(2),
                AccessModifier::Private,
                def_kind(DefType::Sym),
                false,
            )
            .unwrap();

        let mut target = SymbolTable::new(loc(0));
        target.import_from(SymbolId::ROOT, &source, module);
        assert_eq!(target.lookup(SymbolId::ROOT, &["M", "value"]).len(), 1);
        assert!(target.lookup(SymbolId::ROOT, &["M", "secret"]).is_empty());
        // re-import is silently skipped
        target.import_from(SymbolId::ROOT, &source, module);
        assert_eq!(target.lookup(SymbolId::ROOT, &["M", "value"]).len(), 1);
    }

    #[test]
    fn test_import_flattens_nested_public_modules() {
        let (mut source, module) = table_with_module();
        let nested = source
            .add_module(module, ModuleType::Modsig, Some("N".into()), loc(3))
            .unwrap();
        source
            .add_child(
                nested,
                "y".into(),
                loc(4),
                AccessModifier::Public,
                def_kind(DefType::Sym),
                false,
            )
            .unwrap();
        let mut target = SymbolTable::new(loc(0));
        target.import_from(SymbolId::ROOT, &source, module);
        assert_eq!(target.lookup(SymbolId::ROOT, &["N", "y"]).len(), 1);
    }

    #[test]
    fn test_qualified_name_excludes_root() {
        let (table, module) = table_with_module();
        assert_eq!(table.qualified_name(module), vec!["M".to_string()]);
        assert!(table.qualified_name(SymbolId::ROOT).is_empty());
    }
}
