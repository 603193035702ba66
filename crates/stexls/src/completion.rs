//! Context-aware completion.
//!
//! A sequence of pattern matchers over the line prefix identifies which
//! sTeX construct the cursor is in; candidates come from the workspace
//! module index or from the linked symbol table. Every item carries a
//! text edit replacing the typed fragment.

use crate::compiler::StexObject;
use crate::linker::ModuleIndex;
use crate::mathhub;
use crate::symbols::{DefType, ModuleType, SymbolKind};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use stexls_core::Position;
use tower_lsp::lsp_types::{
    CompletionItem, CompletionItemKind, CompletionTextEdit, Range as LspRange, TextEdit,
};

static GIMPORT_REPO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\g(use|import)\*?\[(?P<repository>[^\]]*)$").unwrap());
static GIMPORT_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\g(use|import)\*?(\[(?P<repository>[^\]]*)\])?\{(?P<module>[^}]*)$").unwrap()
});
static NAMED_VALUES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<name>\w+)=(?P<value>[^,\]]*)").unwrap());
static UNNAMED_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(?P<env>\w+)\*?[^\]]*[\[,](?P<arg>[^\],=]*)$").unwrap());
static NAMED_ARG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?P<env>\w+)\*?[^\]]*[\[,](?P<arg>\w+)=(?P<value>[^\],]*)$").unwrap()
});
static RARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(?P<env>\w+)\*?(\[[^\]]*\])?\{(?P<value>[^}]*)$").unwrap());
static ENV_IMPORTMODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(use|import)(mh)?module$").unwrap());
static ENV_TREFI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ma]*(t|T|d|D)ref[ivx]+s?$").unwrap());
static ENV_DEFI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ma]*(d|D)ef[ivx]+s?$").unwrap());
static ENV_SYMI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^sym[ivx]+s?$").unwrap());

pub struct CompletionEngine<'a> {
    pub root: &'a Path,
    pub index: &'a ModuleIndex,
}

impl CompletionEngine<'_> {
    /// Completion items for the cursor at `position`; `line` is the
    /// full line the cursor is on. `object` is the unlinked object of
    /// the file, `linked` its linked view when available.
    pub fn completion(
        &self,
        file: &Path,
        object: Option<&StexObject>,
        linked: Option<&StexObject>,
        line: &str,
        position: Position,
    ) -> Vec<CompletionItem> {
        let context: String = line.chars().take(position.character as usize).collect();
        self.complete_gimport(file, &context, position)
            .or_else(|| self.complete_importmodule(file, line, &context, position))
            .or_else(|| self.complete_symi(&context, position))
            .or_else(|| self.complete_symdef(object, &context, position))
            .or_else(|| self.complete_trefi(file, object, linked, &context, position))
            .or_else(|| self.complete_defi(object, linked, &context, position))
            .unwrap_or_default()
    }

    /// Repositories that export signature modules.
    fn signature_repositories(&self) -> BTreeSet<String> {
        self.index
            .all_modules()
            .filter(|(_, _, module_type, _)| *module_type == ModuleType::Modsig)
            .filter_map(|(path, _, _, _)| mathhub::repository_name(self.root, path))
            .collect()
    }

    /// Signature modules importable by gimport: from the given
    /// repository, or from the current file's directory.
    fn signature_modules(&self, file: &Path, repository: Option<&str>) -> BTreeSet<String> {
        self.index
            .all_modules()
            .filter(|(_, _, module_type, _)| *module_type == ModuleType::Modsig)
            .filter(|(path, _, _, _)| match repository {
                Some(repository) if !repository.is_empty() => {
                    mathhub::repository_name(self.root, path).as_deref() == Some(repository)
                }
                _ => path.parent() == file.parent(),
            })
            .map(|(_, name, _, _)| name.to_string())
            .collect()
    }

    fn complete_gimport(
        &self,
        file: &Path,
        context: &str,
        position: Position,
    ) -> Option<Vec<CompletionItem>> {
        if let Some(captures) = GIMPORT_MODULE.captures(context) {
            let repository = captures.name("repository").map(|m| m.as_str());
            let fragment = &captures["module"];
            return Some(items_from_choices(
                fragment,
                self.signature_modules(file, repository),
                CompletionItemKind::MODULE,
                position,
            ));
        }
        if let Some(captures) = GIMPORT_REPO.captures(context) {
            let fragment = &captures["repository"];
            return Some(items_from_choices(
                fragment,
                self.signature_repositories(),
                CompletionItemKind::FOLDER,
                position,
            ));
        }
        None
    }

    fn complete_importmodule(
        &self,
        file: &Path,
        line: &str,
        context: &str,
        position: Position,
    ) -> Option<Vec<CompletionItem>> {
        let named_arguments = |line: &str| -> Vec<(String, String)> {
            NAMED_VALUES
                .captures_iter(line)
                .map(|c| (c["name"].to_string(), c["value"].to_string()))
                .collect()
        };
        if let Some(captures) = NAMED_ARG.captures(context) {
            if ENV_IMPORTMODULE.is_match(&captures["env"]) {
                let named = named_arguments(line);
                let repository = named
                    .iter()
                    .find(|(name, _)| name == "mhrepos" || name == "repos")
                    .map(|(_, value)| value.clone());
                let arg = &captures["arg"];
                let fragment = &captures["value"];
                let choices: BTreeSet<String> = match arg {
                    "mhrepos" | "repos" => self
                        .index
                        .all_modules()
                        .filter(|(_, _, t, _)| *t == ModuleType::Module)
                        .filter_map(|(path, _, _, _)| mathhub::repository_name(self.root, path))
                        .collect(),
                    "dir" => self
                        .module_paths(ModuleType::Module, repository.as_deref(), file)
                        .iter()
                        .map(|path| match path.rsplit_once('/') {
                            Some((dir, _)) => dir.to_string(),
                            None => String::new(),
                        })
                        .filter(|dir| !dir.is_empty())
                        .collect(),
                    "path" => self.module_paths(ModuleType::Module, repository.as_deref(), file),
                    "load" => self
                        .index
                        .all_modules()
                        .filter(|(_, _, t, _)| *t == ModuleType::Module)
                        .map(|(path, _, _, _)| path.display().to_string())
                        .collect(),
                    _ => return Some(Vec::new()),
                };
                let kind = if arg == "path" || arg == "load" {
                    CompletionItemKind::FILE
                } else {
                    CompletionItemKind::FOLDER
                };
                return Some(items_from_choices(fragment, choices, kind, position));
            }
        }
        if let Some(captures) = UNNAMED_ARG.captures(context) {
            if ENV_IMPORTMODULE.is_match(&captures["env"]) {
                let fragment = &captures["arg"];
                let choices = ["mhrepos", "dir", "path", "load"]
                    .into_iter()
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>();
                return Some(items_from_choices(
                    fragment,
                    choices,
                    CompletionItemKind::KEYWORD,
                    position,
                ));
            }
        }
        if let Some(captures) = RARG.captures(context) {
            if ENV_IMPORTMODULE.is_match(&captures["env"]) {
                let fragment = &captures["value"];
                let choices: BTreeSet<String> = self
                    .index
                    .all_modules()
                    .filter(|(_, _, t, _)| *t == ModuleType::Module)
                    .map(|(_, name, _, _)| name.to_string())
                    .collect();
                return Some(items_from_choices(
                    fragment,
                    choices,
                    CompletionItemKind::MODULE,
                    position,
                ));
            }
        }
        None
    }

    /// `path=` arguments of all reachable modules, optionally filtered
    /// by repository; unfiltered ones come from the file's directory.
    fn module_paths(
        &self,
        module_type: ModuleType,
        repository: Option<&str>,
        file: &Path,
    ) -> BTreeSet<String> {
        self.index
            .all_modules()
            .filter(|(_, _, t, _)| *t == module_type)
            .filter(|(path, _, _, _)| match repository {
                Some(repository) => {
                    mathhub::repository_name(self.root, path).as_deref() == Some(repository)
                }
                None => path.parent() == file.parent(),
            })
            .filter_map(|(path, _, _, _)| mathhub::source_relative_path(self.root, path))
            .collect()
    }

    fn complete_symi(&self, context: &str, position: Position) -> Option<Vec<CompletionItem>> {
        let captures = UNNAMED_ARG.captures(context)?;
        if !ENV_SYMI.is_match(&captures["env"]) {
            return None;
        }
        let fragment = &captures["arg"];
        let choices = ["align=", "gfc=", "noverb", "noalign"]
            .into_iter()
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        Some(items_from_choices(
            fragment,
            choices,
            CompletionItemKind::KEYWORD,
            position,
        ))
    }

    fn complete_symdef(
        &self,
        object: Option<&StexObject>,
        context: &str,
        position: Position,
    ) -> Option<Vec<CompletionItem>> {
        if let Some(captures) = UNNAMED_ARG.captures(context) {
            if &captures["env"] == "symdef" {
                let fragment = &captures["arg"];
                let choices = ["name", "gfc=", "assocarg=", "bvars=", "bargs=", "noverb"]
                    .into_iter()
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>();
                return Some(items_from_choices(
                    fragment,
                    choices,
                    CompletionItemKind::KEYWORD,
                    position,
                ));
            }
        }
        let symdef_names = |object: &StexObject| -> BTreeSet<String> {
            object
                .symbol_table
                .iter()
                .filter_map(|(_, symbol)| match &symbol.kind {
                    SymbolKind::Def {
                        def_type: DefType::Symdef,
                        ..
                    } => Some(symbol.name.clone()),
                    _ => None,
                })
                .collect()
        };
        if let Some(captures) = NAMED_ARG.captures(context) {
            if &captures["env"] == "symdef" && &captures["arg"] == "name" {
                let fragment = &captures["value"];
                return Some(items_from_choices(
                    fragment,
                    object.map(symdef_names).unwrap_or_default(),
                    CompletionItemKind::FIELD,
                    position,
                ));
            }
        }
        if let Some(captures) = RARG.captures(context) {
            if &captures["env"] == "symdef" {
                let fragment = &captures["value"];
                return Some(items_from_choices(
                    fragment,
                    object.map(symdef_names).unwrap_or_default(),
                    CompletionItemKind::FIELD,
                    position,
                ));
            }
        }
        None
    }

    fn complete_trefi(
        &self,
        _file: &Path,
        object: Option<&StexObject>,
        linked: Option<&StexObject>,
        context: &str,
        position: Position,
    ) -> Option<Vec<CompletionItem>> {
        let captures = UNNAMED_ARG.captures(context)?;
        if !ENV_TREFI.is_match(&captures["env"]) {
            return None;
        }
        let fragment = &captures["arg"];
        let linked = linked?;
        if let Some((module_part, symbol_fragment)) = fragment.split_once('?') {
            // complete module?symbol: symbols of the target module,
            // noverb ones excluded
            let target_module = if module_part.is_empty() {
                object.and_then(enclosing_module_name)?
            } else {
                module_part.to_string()
            };
            let choices: BTreeSet<String> = linked
                .symbol_table
                .iter()
                .filter_map(|(_, symbol)| match &symbol.kind {
                    SymbolKind::Def { noverb: false, .. } => {
                        let parent = symbol.parent?;
                        (linked.symbol_table.get(parent).name == target_module)
                            .then(|| symbol.name.clone())
                    }
                    _ => None,
                })
                .collect();
            return Some(items_from_choices(
                symbol_fragment,
                choices,
                CompletionItemKind::FIELD,
                position,
            ));
        }
        // complete the module part
        let choices: BTreeSet<String> = linked
            .symbol_table
            .iter()
            .filter_map(|(_, symbol)| match &symbol.kind {
                SymbolKind::Module { .. } => Some(symbol.name.clone()),
                _ => None,
            })
            .filter(|name| !name.starts_with("__"))
            .collect();
        Some(items_from_choices(
            fragment,
            choices,
            CompletionItemKind::MODULE,
            position,
        ))
    }

    fn complete_defi(
        &self,
        object: Option<&StexObject>,
        linked: Option<&StexObject>,
        context: &str,
        position: Position,
    ) -> Option<Vec<CompletionItem>> {
        if let Some(captures) = UNNAMED_ARG.captures(context) {
            if ENV_DEFI.is_match(&captures["env"]) {
                let fragment = &captures["arg"];
                return Some(items_from_choices(
                    fragment,
                    BTreeSet::from(["name".to_string()]),
                    CompletionItemKind::KEYWORD,
                    position,
                ));
            }
        }
        let captures = NAMED_ARG.captures(context)?;
        if !ENV_DEFI.is_match(&captures["env"]) || &captures["arg"] != "name" {
            return None;
        }
        let fragment = &captures["value"];
        let linked = linked?;
        let module = object.and_then(enclosing_module_name)?;
        let choices: BTreeSet<String> = linked
            .symbol_table
            .iter()
            .filter_map(|(_, symbol)| {
                let parent = symbol.parent?;
                (symbol.kind.is_def() && linked.symbol_table.get(parent).name == module)
                    .then(|| symbol.name.clone())
            })
            .collect();
        Some(items_from_choices(
            fragment,
            choices,
            CompletionItemKind::UNIT,
            position,
        ))
    }
}

/// The name of the module or binding the file's content belongs to.
fn enclosing_module_name(object: &StexObject) -> Option<String> {
    let root = object.symbol_table.root();
    object
        .symbol_table
        .get(root)
        .children
        .values()
        .flatten()
        .map(|&id| object.symbol_table.get(id))
        .find(|symbol| {
            matches!(
                symbol.kind,
                SymbolKind::Module { .. } | SymbolKind::Binding { .. }
            ) && !symbol.name.starts_with("__")
        })
        .map(|symbol| symbol.name.clone())
}

/// One item per choice with the given prefix, each replacing the typed
/// fragment.
fn items_from_choices<I: IntoIterator<Item = String>>(
    fragment: &str,
    choices: I,
    kind: CompletionItemKind,
    position: Position,
) -> Vec<CompletionItem> {
    let start = position.translate(0, -(fragment.chars().count() as i32));
    let range = LspRange {
        start: tower_lsp::lsp_types::Position {
            line: start.line,
            character: start.character,
        },
        end: tower_lsp::lsp_types::Position {
            line: position.line,
            character: position.character,
        },
    };
    choices
        .into_iter()
        .filter(|choice| choice.starts_with(fragment))
        .map(|choice| CompletionItem {
            label: choice.clone(),
            kind: Some(kind),
            text_edit: Some(CompletionTextEdit::Edit(TextEdit {
                range,
                new_text: choice,
            })),
            ..Default::default()
        })
        .collect()
}
