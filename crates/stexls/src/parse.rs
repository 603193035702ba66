//! Intermediate parse trees.
//!
//! Filters the generic LaTeX tree down to the sTeX-significant
//! environments and builds a typed tree per file. Recognition is
//! regex-driven over the environment name; each variant checks its
//! argument arity and legality here so the compiler can assume
//! well-formed nodes.

use crate::latex::{self, Environment, LatexTree};
use crate::mathhub;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use stexls_core::{Location, Range};
use thiserror::Error;

/// Argument or structure problem while recognizing an environment.
/// These become parser-exception diagnostics on the environment range.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

/// The text of an argument plus the range it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWithLocation {
    pub text: String,
    pub range: Range,
}

impl TokenWithLocation {
    pub fn new(text: impl Into<String>, range: Range) -> Self {
        Self {
            text: text.into(),
            range,
        }
    }

    fn from_token(token: &latex::Token) -> Self {
        Self::new(token.lexeme.clone(), token.span.range)
    }

    /// Splits the token at a character index; `offset` characters after
    /// the index are dropped from the right half (used to drop the `?`
    /// in `module?symbol`).
    pub fn split(&self, index: usize, offset: usize) -> (TokenWithLocation, TokenWithLocation) {
        let left_text: String = self.text.chars().take(index).collect();
        let right_text: String = self.text.chars().skip(index + offset).collect();
        let (left_range, right_range) = self.range.split(index as u32);
        let right_range = Range::new(
            right_range.start.translate(0, offset as i32),
            right_range.end,
        );
        (
            TokenWithLocation::new(left_text, left_range),
            TokenWithLocation::new(right_text, right_range),
        )
    }
}

/// Decodes the `i`/`ii`/`iii`... arity suffix of defi/trefi/symi names.
pub fn roman_to_int(roman: &str) -> Option<usize> {
    const NUMERALS: [&str; 12] = [
        "i", "ii", "iii", "iv", "v", "vi", "vii", "viii", "ix", "x", "xi", "xii",
    ];
    NUMERALS.iter().position(|n| *n == roman).map(|i| i + 1)
}

/// Languages a symbol must not be verbalized in, or all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Noverb {
    /// Positional `noverb` flag: no language may verbalize the symbol.
    pub is_all: bool,
    /// `noverb={lang,...}` restriction set.
    pub langs: BTreeSet<String>,
}

impl Noverb {
    fn from_env(env: &Environment) -> Self {
        let is_all = env
            .unnamed_oargs()
            .any(|oarg| oarg.value.lexeme.trim() == "noverb");
        let langs = match env.named_oarg("noverb") {
            Some(value) => {
                let text = value.lexeme.trim();
                let inner = text
                    .strip_prefix('{')
                    .and_then(|t| t.strip_suffix('}'))
                    .unwrap_or(text);
                inner
                    .split(',')
                    .map(|lang| lang.trim().to_string())
                    .filter(|lang| !lang.is_empty())
                    .collect()
            }
            None => BTreeSet::new(),
        };
        Self { is_all, langs }
    }
}

/// One recognized sTeX environment.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeKind {
    /// Textual scope (`omtext`, `frame`, ...) forming an import barrier.
    Scope { scope_name: TokenWithLocation },
    Modsig {
        name: TokenWithLocation,
    },
    Modnl {
        name: TokenWithLocation,
        lang: TokenWithLocation,
        mh_mode: bool,
    },
    Module {
        id: Option<TokenWithLocation>,
    },
    View {
        env: String,
        module: Option<TokenWithLocation>,
        lang: Option<TokenWithLocation>,
        source_module: TokenWithLocation,
        target_module: TokenWithLocation,
    },
    ViewSig {
        module: TokenWithLocation,
        source_module: TokenWithLocation,
        target_module: TokenWithLocation,
    },
    Defi {
        tokens: Vec<TokenWithLocation>,
        name_annotation: Option<TokenWithLocation>,
        m: bool,
        a: bool,
        capital: bool,
        i: usize,
        s: bool,
        asterisk: bool,
    },
    Trefi {
        tokens: Vec<TokenWithLocation>,
        target_annotation: Option<TokenWithLocation>,
        m: bool,
        a: bool,
        capital: bool,
        drefi: bool,
        i: usize,
        s: bool,
        asterisk: bool,
    },
    Symi {
        tokens: Vec<TokenWithLocation>,
        noverb: Noverb,
        i: usize,
        asterisk: bool,
    },
    Symdef {
        name: TokenWithLocation,
        noverb: Noverb,
        asterisk: bool,
    },
    ImportModule {
        module: TokenWithLocation,
        mhrepos: Option<TokenWithLocation>,
        repos: Option<TokenWithLocation>,
        dir: Option<TokenWithLocation>,
        load: Option<TokenWithLocation>,
        path: Option<TokenWithLocation>,
        export: bool,
        mh_mode: bool,
        asterisk: bool,
    },
    GImport {
        module: TokenWithLocation,
        repository: Option<TokenWithLocation>,
        export: bool,
        asterisk: bool,
    },
    GStructure {
        mhrepos: Option<TokenWithLocation>,
        module: TokenWithLocation,
    },
    Tassign {
        torv: char,
        source_symbol: TokenWithLocation,
        target_term: TokenWithLocation,
        asterisk: bool,
    },
}

impl TreeKind {
    /// The module name this node provides when acting as the enclosing
    /// module of a defi/trefi. Anonymous modules provide none.
    pub fn module_name(&self) -> Option<&str> {
        match self {
            TreeKind::Modsig { name } => Some(&name.text),
            TreeKind::Modnl { name, .. } => Some(&name.text),
            TreeKind::Module { id } => id.as_ref().map(|id| id.text.as_str()),
            TreeKind::View { module, .. } => module.as_ref().map(|m| m.text.as_str()),
            TreeKind::ViewSig { module, .. } => Some(&module.text),
            _ => None,
        }
    }

    pub fn is_module_tree(&self) -> bool {
        matches!(
            self,
            TreeKind::Modsig { .. }
                | TreeKind::Modnl { .. }
                | TreeKind::Module { .. }
                | TreeKind::View { .. }
                | TreeKind::ViewSig { .. }
        )
    }
}

/// Derived attributes of defi nodes.
pub struct DefiInfo<'a> {
    pub tokens: &'a [TokenWithLocation],
    pub name_annotation: Option<&'a TokenWithLocation>,
    pub a: bool,
}

impl DefiInfo<'_> {
    /// The defined symbol's name: the `name=` override, or the argument
    /// atoms joined with `-` (skipping the leading atom of `adefi`).
    pub fn name(&self) -> String {
        if let Some(annotation) = self.name_annotation {
            return annotation.text.trim().to_string();
        }
        let skip = usize::from(self.a);
        self.tokens
            .iter()
            .skip(skip)
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// Derived attributes of trefi nodes.
pub struct TrefiInfo<'a> {
    pub tokens: &'a [TokenWithLocation],
    pub target_annotation: Option<&'a TokenWithLocation>,
    pub a: bool,
}

impl TrefiInfo<'_> {
    /// The referenced symbol's name: the `?symbol` part of the target
    /// annotation, or else the joined argument atoms.
    pub fn name(&self) -> String {
        if let Some(annotation) = self.target_annotation {
            if let Some(index) = annotation.text.find('?') {
                return annotation.text[index + 1..].trim().to_string();
            }
        }
        let skip = usize::from(self.a);
        self.tokens
            .iter()
            .skip(skip)
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("-")
            .trim()
            .to_string()
    }

    /// The referenced module, when the annotation names one:
    /// `[module?symbol]` and `[module]` do, `[?symbol]` does not.
    pub fn module(&self) -> Option<TokenWithLocation> {
        let annotation = self.target_annotation?;
        match annotation.text.find('?') {
            Some(index) => {
                let char_index = annotation.text[..index].chars().count();
                let (left, _) = annotation.split(char_index, 1);
                if left.text.is_empty() {
                    None
                } else {
                    Some(left)
                }
            }
            None => Some(annotation.clone()),
        }
    }
}

/// Handle into a [`ParsedFile`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Debug)]
pub struct IntermediateNode {
    pub location: Location,
    pub kind: TreeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// The intermediate parse result of one file.
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub path: PathBuf,
    nodes: Vec<IntermediateNode>,
    pub roots: Vec<NodeId>,
    /// Errors raised during parsing, attached to a location.
    pub errors: Vec<(Location, ParseError)>,
}

impl ParsedFile {
    pub fn node(&self, id: NodeId) -> &IntermediateNode {
        &self.nodes[id.0 as usize]
    }

    fn push(&mut self, node: IntermediateNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// First enclosing (ancestor-or-self) Modsig/Modnl/Module/View node.
    pub fn find_parent_module_tree(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node(id);
            if node.kind.is_module_tree() {
                return Some(id);
            }
            current = node.parent;
        }
        None
    }

    /// Name of the first enclosing module, when it has one.
    pub fn find_parent_module_name(&self, id: NodeId) -> Option<String> {
        let module = self.find_parent_module_tree(id)?;
        self.node(module).kind.module_name().map(str::to_string)
    }

    /// Preorder/postorder traversal of one root with an explicit stack.
    pub fn traverse(
        &self,
        root: NodeId,
        enter: &mut dyn FnMut(NodeId, &IntermediateNode),
        exit: &mut dyn FnMut(NodeId, &IntermediateNode),
    ) {
        enum Step {
            Visit(NodeId),
            Leave(NodeId),
        }
        let mut stack = vec![Step::Visit(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Visit(id) => {
                    let node = self.node(id);
                    enter(id, node);
                    stack.push(Step::Leave(id));
                    for child in node.children.iter().rev() {
                        stack.push(Step::Visit(*child));
                    }
                }
                Step::Leave(id) => exit(id, self.node(id)),
            }
        }
    }
}

static SCOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(n?omtext|example|omgroup|frame)$").unwrap());
static MODSIG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^modsig$").unwrap());
static MODNL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(mh)?modnl$").unwrap());
static MODULE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(module\*?|smentry)$").unwrap());
static VIEW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(mhview|gviewnl)$").unwrap());
static VIEWSIG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^gviewsig$").unwrap());
static GSTRUCTURE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^gstructure(\*)?$").unwrap());
static DEFI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([ma]*)(d|D)ef([ivx]+)(s)?(\*)?$").unwrap());
static TREFI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([ma]*)(d|D|t|T)ref([ivx]+)(s)?(\*)?$").unwrap());
static SYMI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^sym([ivx]+)(\*)?$").unwrap());
static SYMDEF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^symdef(\*)?$").unwrap());
static IMPORTMODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(import|use)(mh)?module(\*)?$").unwrap());
static GIMPORT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^g(import|use)(\*)?$").unwrap());
static TASSIGN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([tv])assign(\*?)$").unwrap());

/// Parses `content` as `path` and recognizes the sTeX environments.
/// LaTeX syntax errors and recognition errors both land in `errors`.
pub fn parse(path: &Path, content: &str) -> ParsedFile {
    let tree = latex::parse(path, content);
    from_latex(&tree)
}

/// Recognition over an already-parsed LaTeX tree.
pub fn from_latex(tree: &LatexTree) -> ParsedFile {
    let mut parsed = ParsedFile {
        path: tree.path.clone(),
        ..Default::default()
    };
    for (location, message) in &tree.syntax_errors {
        parsed
            .errors
            .push((location.clone(), ParseError(message.clone())));
    }
    // Stack of entered environments that produced a tree node. The
    // latex node pointer identifies the frame to pop on exit.
    enum Step<'t> {
        Visit(&'t latex::Node),
        Leave(&'t latex::Node),
    }
    let mut env_stack: Vec<(*const latex::Node, NodeId)> = Vec::new();
    let mut walk = vec![Step::Visit(&tree.root)];
    while let Some(step) = walk.pop() {
        match step {
            Step::Visit(node) => {
                if let Some(env) = node.environment() {
                    let location = Location::new(tree.path.clone(), node.span.range);
                    match recognize(env, &location) {
                        Ok(Some(kind)) => {
                            let parent = env_stack.last().map(|(_, id)| *id);
                            let id = parsed.push(IntermediateNode {
                                location,
                                kind,
                                parent,
                                children: Vec::new(),
                            });
                            match parent {
                                Some(parent) => parsed.nodes[parent.0 as usize].children.push(id),
                                None => parsed.roots.push(id),
                            }
                            env_stack.push((node as *const _, id));
                            walk.push(Step::Leave(node));
                        }
                        Ok(None) => {}
                        Err(error) => parsed.errors.push((location, error)),
                    }
                }
                for child in node.children.iter().rev() {
                    walk.push(Step::Visit(child));
                }
            }
            Step::Leave(node) => {
                if let Some((top, _)) = env_stack.last() {
                    if std::ptr::eq(*top, node as *const _) {
                        env_stack.pop();
                    }
                }
            }
        }
    }
    parsed
}

/// Tries each recognition pattern in turn; the first match constructs
/// the node. `Ok(None)` means the environment is not sTeX-significant.
fn recognize(env: &Environment, location: &Location) -> Result<Option<TreeKind>, ParseError> {
    let name = env.name.lexeme.as_str();
    if MODSIG.is_match(name) {
        return recognize_modsig(env).map(Some);
    }
    if let Some(captures) = MODNL.captures(name) {
        return recognize_modnl(env, captures.get(1).is_some()).map(Some);
    }
    if MODULE.is_match(name) {
        return Ok(Some(TreeKind::Module {
            id: env.named_oarg("id").map(TokenWithLocation::from_token),
        }));
    }
    if VIEW.is_match(name) {
        return recognize_view(env, name).map(Some);
    }
    if VIEWSIG.is_match(name) {
        return recognize_viewsig(env).map(Some);
    }
    if GSTRUCTURE.is_match(name) {
        return recognize_gstructure(env).map(Some);
    }
    if SCOPE.is_match(name) {
        return Ok(Some(TreeKind::Scope {
            scope_name: TokenWithLocation::from_token(&env.name),
        }));
    }
    if let Some(captures) = DEFI.captures(name) {
        return recognize_defi(env, &captures).map(Some);
    }
    if let Some(captures) = TREFI.captures(name) {
        return recognize_trefi(env, &captures).map(Some);
    }
    if let Some(captures) = SYMI.captures(name) {
        return recognize_symi(env, &captures).map(Some);
    }
    if let Some(captures) = SYMDEF.captures(name) {
        return recognize_symdef(env, &captures).map(Some);
    }
    if let Some(captures) = IMPORTMODULE.captures(name) {
        return recognize_importmodule(env, &captures, location).map(Some);
    }
    if let Some(captures) = GIMPORT.captures(name) {
        return recognize_gimport(env, &captures).map(Some);
    }
    if let Some(captures) = TASSIGN.captures(name) {
        return recognize_tassign(env, &captures).map(Some);
    }
    Ok(None)
}

fn rarg_tokens(env: &Environment) -> Vec<TokenWithLocation> {
    env.rargs.iter().map(TokenWithLocation::from_token).collect()
}

fn recognize_modsig(env: &Environment) -> Result<TreeKind, ParseError> {
    if env.rargs.len() != 1 {
        return Err(ParseError(
            "Modsig environment missing required argument: {<module name>}".to_string(),
        ));
    }
    Ok(TreeKind::Modsig {
        name: TokenWithLocation::from_token(&env.rargs[0]),
    })
}

fn recognize_modnl(env: &Environment, mh_mode: bool) -> Result<TreeKind, ParseError> {
    if env.rargs.len() != 2 {
        return Err(ParseError(format!(
            "Argument count mismatch (expected 2, found {}).",
            env.rargs.len()
        )));
    }
    Ok(TreeKind::Modnl {
        name: TokenWithLocation::from_token(&env.rargs[0]),
        lang: TokenWithLocation::from_token(&env.rargs[1]),
        mh_mode,
    })
}

fn recognize_view(env: &Environment, name: &str) -> Result<TreeKind, ParseError> {
    let (module, lang) = if name == "gviewnl" {
        if env.rargs.len() < 4 {
            return Err(ParseError(format!(
                "Argument count mismatch: gviewnl requires 4 arguments, found {}.",
                env.rargs.len()
            )));
        }
        for illegal in ["frompath", "topath"] {
            if env.named_oarg(illegal).is_some() {
                return Err(ParseError(format!(
                    "{illegal} argument not allowed in gviewnl."
                )));
            }
        }
        (
            Some(TokenWithLocation::from_token(&env.rargs[0])),
            Some(TokenWithLocation::from_token(&env.rargs[1])),
        )
    } else {
        if env.rargs.len() < 2 {
            return Err(ParseError(format!(
                "Argument count mismatch: mhview requires 2 arguments, found {}.",
                env.rargs.len()
            )));
        }
        (None, None)
    };
    let n = env.rargs.len();
    Ok(TreeKind::View {
        env: name.to_string(),
        module,
        lang,
        source_module: TokenWithLocation::from_token(&env.rargs[n - 2]),
        target_module: TokenWithLocation::from_token(&env.rargs[n - 1]),
    })
}

fn recognize_viewsig(env: &Environment) -> Result<TreeKind, ParseError> {
    if env.rargs.len() < 3 {
        return Err(ParseError(format!(
            "gviewsig requires at least three arguments, found {}.",
            env.rargs.len()
        )));
    }
    Ok(TreeKind::ViewSig {
        module: TokenWithLocation::from_token(&env.rargs[0]),
        source_module: TokenWithLocation::from_token(&env.rargs[1]),
        target_module: TokenWithLocation::from_token(&env.rargs[2]),
    })
}

fn recognize_gstructure(env: &Environment) -> Result<TreeKind, ParseError> {
    if env.rargs.len() != 2 {
        return Err(ParseError(format!(
            "gstructure environment requires 2 arguments but {} found.",
            env.rargs.len()
        )));
    }
    Ok(TreeKind::GStructure {
        mhrepos: env.named_oarg("mhrepos").map(TokenWithLocation::from_token),
        module: TokenWithLocation::from_token(&env.rargs[1]),
    })
}

fn decode_arity(env_name: &str, roman: &str) -> Result<usize, ParseError> {
    roman_to_int(roman).ok_or_else(|| {
        ParseError(format!(
            "Invalid environment (are the roman numerals correct?): {env_name}"
        ))
    })
}

fn recognize_defi(env: &Environment, captures: &regex::Captures) -> Result<TreeKind, ParseError> {
    if env.rargs.is_empty() {
        return Err(ParseError(
            "Argument count mismatch (expected at least 1, found 0).".to_string(),
        ));
    }
    let flags = &captures[1];
    let a = flags.contains('a');
    let i = decode_arity(&env.name.lexeme, &captures[3])?;
    let tokens = rarg_tokens(env);
    if i + usize::from(a) != tokens.len() {
        return Err(ParseError(format!(
            "Defi argument count mismatch: Expected {} vs actual {}.",
            i + usize::from(a),
            tokens.len()
        )));
    }
    Ok(TreeKind::Defi {
        tokens,
        name_annotation: env.named_oarg("name").map(TokenWithLocation::from_token),
        m: flags.contains('m'),
        a,
        capital: &captures[2] == "D",
        i,
        s: captures.get(4).is_some(),
        asterisk: captures.get(5).is_some(),
    })
}

fn recognize_trefi(env: &Environment, captures: &regex::Captures) -> Result<TreeKind, ParseError> {
    if env.rargs.is_empty() {
        return Err(ParseError(
            "Argument count mismatch (expected at least 1, found 0).".to_string(),
        ));
    }
    let unnamed: Vec<_> = env.unnamed_oargs().collect();
    if unnamed.len() > 1 {
        return Err(ParseError(format!(
            "Too many unnamed oargs in trefi: Expected are at most 1, found {}",
            unnamed.len()
        )));
    }
    let flags = &captures[1];
    let a = flags.contains('a');
    let i = decode_arity(&env.name.lexeme, &captures[3])?;
    let tokens = rarg_tokens(env);
    if i + usize::from(a) != tokens.len() {
        return Err(ParseError(format!(
            "Trefi argument count mismatch: Expected {} vs. actual {}.",
            i + usize::from(a),
            tokens.len()
        )));
    }
    let kind_letter = &captures[2];
    Ok(TreeKind::Trefi {
        tokens,
        target_annotation: unnamed
            .first()
            .map(|oarg| TokenWithLocation::from_token(&oarg.value)),
        m: flags.contains('m'),
        a,
        capital: kind_letter == "T" || kind_letter == "D",
        drefi: kind_letter == "d" || kind_letter == "D",
        i,
        s: captures.get(4).is_some(),
        asterisk: captures.get(5).is_some(),
    })
}

fn recognize_symi(env: &Environment, captures: &regex::Captures) -> Result<TreeKind, ParseError> {
    if env.rargs.is_empty() {
        return Err(ParseError(
            "Argument count mismatch (expected at least 1, found 0).".to_string(),
        ));
    }
    let i = decode_arity(&env.name.lexeme, &captures[1])?;
    let tokens = rarg_tokens(env);
    if i != tokens.len() {
        return Err(ParseError(format!(
            "Symi argument count mismatch: Expected {} vs actual {}.",
            i,
            tokens.len()
        )));
    }
    Ok(TreeKind::Symi {
        tokens,
        noverb: Noverb::from_env(env),
        i,
        asterisk: captures.get(2).is_some(),
    })
}

fn recognize_symdef(env: &Environment, captures: &regex::Captures) -> Result<TreeKind, ParseError> {
    if env.rargs.is_empty() {
        return Err(ParseError(
            "Argument count mismatch: At least one argument required.".to_string(),
        ));
    }
    let name = match env.named_oarg("name") {
        Some(name) => TokenWithLocation::from_token(name),
        None => TokenWithLocation::from_token(&env.rargs[0]),
    };
    Ok(TreeKind::Symdef {
        name,
        noverb: Noverb::from_env(env),
        asterisk: captures.get(1).is_some(),
    })
}

fn recognize_importmodule(
    env: &Environment,
    captures: &regex::Captures,
    location: &Location,
) -> Result<TreeKind, ParseError> {
    if env.rargs.len() != 1 {
        return Err(ParseError(format!(
            "Argument count mismatch: Expected exactly 1 argument but found {}",
            env.rargs.len()
        )));
    }
    let named = |key: &str| env.named_oarg(key).map(TokenWithLocation::from_token);
    let mhrepos = named("mhrepos").or_else(|| named("repos"));
    let repos = named("repos");
    let dir = named("dir");
    let path = named("path");
    let load = named("load");
    let mh_mode = captures.get(2).is_some();
    // parents: file -> source dir -> repository -> root at minimum
    if location.path.ancestors().count() <= 4 {
        return Err(ParseError(format!(
            "Unable to compile module with a path depth of less than 4: {}",
            location.path.display()
        )));
    }
    if mh_mode {
        if dir.is_some() && path.is_some() {
            return Err(ParseError(
                "Invalid argument configuration in importmhmodule: \"dir\" and \"path\" must not be specified at the same time.".to_string(),
            ));
        }
        if mhrepos.is_some() && dir.is_none() && path.is_none() {
            return Err(ParseError(
                "Invalid argument configuration in importmhmodule: \"mhrepos\" requires a \"dir\" or \"path\" argument.".to_string(),
            ));
        }
        if load.is_some() {
            return Err(ParseError(
                "Invalid argument configuration in importmhmodule: \"load\" argument must not be specified.".to_string(),
            ));
        }
    } else if mhrepos.is_some() || dir.is_some() || path.is_some() {
        return Err(ParseError(
            "Invalid argument configuration in importmodule: \"mhrepos\", \"dir\" or \"path\" must not be specified.".to_string(),
        ));
    } else if load.is_none() {
        return Err(ParseError(
            "Invalid argument configuration in importmodule: Missing \"load\" argument.".to_string(),
        ));
    }
    Ok(TreeKind::ImportModule {
        module: TokenWithLocation::from_token(&env.rargs[0]),
        mhrepos,
        repos,
        dir,
        path,
        load,
        export: &captures[1] == "import",
        mh_mode,
        asterisk: captures.get(3).is_some(),
    })
}

fn recognize_gimport(env: &Environment, captures: &regex::Captures) -> Result<TreeKind, ParseError> {
    if env.rargs.len() != 1 {
        return Err(ParseError(format!(
            "Argument count mismatch (expected 1, found {}).",
            env.rargs.len()
        )));
    }
    let unnamed: Vec<_> = env.unnamed_oargs().collect();
    if unnamed.len() > 1 {
        return Err(ParseError(format!(
            "Optional argument count mismatch (expected at most 1, found {})",
            unnamed.len()
        )));
    }
    Ok(TreeKind::GImport {
        module: TokenWithLocation::from_token(&env.rargs[0]),
        repository: unnamed
            .first()
            .map(|oarg| TokenWithLocation::from_token(&oarg.value)),
        export: &captures[1] == "import",
        asterisk: captures.get(2).is_some(),
    })
}

fn recognize_tassign(env: &Environment, captures: &regex::Captures) -> Result<TreeKind, ParseError> {
    if env.rargs.len() != 2 {
        return Err(ParseError(format!(
            "Argument count mismatch (expected 2, found {}).",
            env.rargs.len()
        )));
    }
    if !env.oargs.is_empty() {
        return Err(ParseError("Unexpected optional arguments.".to_string()));
    }
    Ok(TreeKind::Tassign {
        torv: captures[1].chars().next().unwrap_or('t'),
        source_symbol: TokenWithLocation::from_token(&env.rargs[0]),
        target_term: TokenWithLocation::from_token(&env.rargs[1]),
        asterisk: !captures[2].is_empty(),
    })
}

/// Resolves the file an importmodule statement points at.
pub fn importmodule_target(
    root: &Path,
    current_file: &Path,
    mhrepos: Option<&str>,
    path: Option<&str>,
    dir: Option<&str>,
    load: Option<&str>,
    module: &str,
) -> PathBuf {
    if let Some(load) = load {
        return mathhub::normalize(&root.join(load).join(format!("{module}.tex")));
    }
    if mhrepos.is_none() && path.is_none() && dir.is_none() {
        // A local import; resolution stays at the current file.
        return mathhub::normalize(current_file);
    }
    let source = match mhrepos {
        Some(repo) => root.join(repo).join("source"),
        None => mathhub::find_source_dir(root, current_file)
            .unwrap_or_else(|| current_file.parent().unwrap_or(root).to_path_buf()),
    };
    let result = if let Some(dir) = dir {
        source.join(dir).join(format!("{module}.tex"))
    } else if let Some(path) = path {
        source.join(format!("{path}.tex"))
    } else {
        source.join(format!("{module}.tex"))
    };
    mathhub::normalize(&result)
}

/// Resolves the file a gimport statement points at.
pub fn gimport_target(
    root: &Path,
    current_file: &Path,
    repository: Option<&str>,
    module: &str,
) -> PathBuf {
    let source = match repository {
        Some(repo) => root.join(repo.trim()).join("source"),
        None => current_file.parent().unwrap_or(root).to_path_buf(),
    };
    mathhub::normalize(&source.join(format!("{}.tex", module.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(content: &str) -> ParsedFile {
        parse(Path::new("/w/repo/source/M.tex"), content)
    }

    fn first_kind(parsed: &ParsedFile) -> &TreeKind {
        &parsed.node(parsed.roots[0]).kind
    }

    #[test]
    fn test_roman_numerals() {
        assert_eq!(roman_to_int("i"), Some(1));
        assert_eq!(roman_to_int("iii"), Some(3));
        assert_eq!(roman_to_int("iv"), Some(4));
        assert_eq!(roman_to_int("x"), Some(10));
        assert_eq!(roman_to_int("q"), None);
    }

    #[test]
    fn test_modsig_requires_name() {
        let parsed = parse_one("\\begin{modsig}\\end{modsig}");
        assert!(parsed.roots.is_empty());
        assert_eq!(parsed.errors.len(), 1);
        assert!(parsed.errors[0].1 .0.contains("Modsig"));
    }

    #[test]
    fn test_modnl_recognition() {
        let parsed = parse(
            Path::new("/w/repo/source/M.en.tex"),
            "\\begin{mhmodnl}{M}{en}\\end{mhmodnl}",
        );
        match first_kind(&parsed) {
            TreeKind::Modnl { name, lang, mh_mode } => {
                assert_eq!(name.text, "M");
                assert_eq!(lang.text, "en");
                assert!(mh_mode);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_defi_argument_count_mismatch() {
        let parsed = parse_one("\\begin{modsig}{M}\\defii{only-one}\\end{modsig}");
        assert_eq!(parsed.errors.len(), 1);
        assert!(parsed.errors[0].1 .0.contains("argument count mismatch"));
    }

    #[test]
    fn test_adefi_takes_extra_argument() {
        let parsed = parse_one("\\begin{modsig}{M}\\adefi{alt}{actual}\\end{modsig}");
        assert!(parsed.errors.is_empty());
        let root = parsed.node(parsed.roots[0]);
        match &parsed.node(root.children[0]).kind {
            TreeKind::Defi { tokens, a, .. } => {
                assert!(a);
                let info = DefiInfo {
                    tokens,
                    name_annotation: None,
                    a: *a,
                };
                assert_eq!(info.name(), "actual");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_defi_name_joins_tokens() {
        let parsed = parse_one("\\begin{modsig}{M}\\defii{prime}{number}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        match &parsed.node(root.children[0]).kind {
            TreeKind::Defi { tokens, a, .. } => {
                let info = DefiInfo {
                    tokens,
                    name_annotation: None,
                    a: *a,
                };
                assert_eq!(info.name(), "prime-number");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_trefi_target_annotation_forms() {
        for (annotation, module, symbol) in [
            ("[M?sym]", Some("M"), "sym"),
            ("[?sym]", None, "sym"),
            ("[M]", Some("M"), "value"),
        ] {
            let content = format!("\\begin{{modsig}}{{X}}\\trefi{annotation}{{value}}\\end{{modsig}}");
            let parsed = parse_one(&content);
            let root = parsed.node(parsed.roots[0]);
            match &parsed.node(root.children[0]).kind {
                TreeKind::Trefi {
                    tokens,
                    target_annotation,
                    a,
                    ..
                } => {
                    let info = TrefiInfo {
                        tokens,
                        target_annotation: target_annotation.as_ref(),
                        a: *a,
                    };
                    assert_eq!(info.module().map(|m| m.text), module.map(str::to_string));
                    assert_eq!(info.name(), symbol);
                }
                other => panic!("unexpected kind: {other:?}"),
            }
        }
    }

    #[test]
    fn test_trefi_drefi_capital_flags() {
        let parsed = parse_one("\\begin{modsig}{M}\\Drefii{a}{b}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        match &parsed.node(root.children[0]).kind {
            TreeKind::Trefi {
                drefi, capital, i, ..
            } => {
                assert!(drefi);
                assert!(capital);
                assert_eq!(*i, 2);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_symi_noverb_langs() {
        let parsed = parse_one("\\begin{modsig}{M}\\symii[noverb={en,de}]{prime}{number}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        match &parsed.node(root.children[0]).kind {
            TreeKind::Symi { noverb, .. } => {
                assert!(!noverb.is_all);
                assert_eq!(
                    noverb.langs,
                    BTreeSet::from(["en".to_string(), "de".to_string()])
                );
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_symdef_name_override() {
        let parsed = parse_one("\\begin{modsig}{M}\\symdef[name=plus]{ignored}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        match &parsed.node(root.children[0]).kind {
            TreeKind::Symdef { name, .. } => assert_eq!(name.text, "plus"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_importmodule_argument_legality() {
        // mh mode forbids load
        let parsed = parse_one("\\begin{module}[id=x]\\importmhmodule[load=y]{mod}\\end{module}");
        assert_eq!(parsed.errors.len(), 1);
        // non-mh mode requires load
        let parsed = parse_one("\\begin{module}[id=x]\\importmodule{mod}\\end{module}");
        assert_eq!(parsed.errors.len(), 1);
        // non-mh mode forbids dir
        let parsed = parse_one("\\begin{module}[id=x]\\importmodule[dir=y,load=z]{mod}\\end{module}");
        assert_eq!(parsed.errors.len(), 1);
        // mh mode with dir and path simultaneously
        let parsed =
            parse_one("\\begin{module}[id=x]\\importmhmodule[dir=a,path=b]{mod}\\end{module}");
        assert_eq!(parsed.errors.len(), 1);
        // legal: mh with mhrepos and dir
        let parsed =
            parse_one("\\begin{module}[id=x]\\importmhmodule[mhrepos=r/s,dir=d]{mod}\\end{module}");
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn test_gimport_repository() {
        let parsed = parse_one("\\begin{modsig}{M}\\gimport[smglom/numbers]{nat}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        match &parsed.node(root.children[0]).kind {
            TreeKind::GImport {
                module,
                repository,
                export,
                ..
            } => {
                assert_eq!(module.text, "nat");
                assert_eq!(repository.as_ref().unwrap().text, "smglom/numbers");
                assert!(export);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_guse_is_not_exported() {
        let parsed = parse_one("\\begin{modsig}{M}\\guse{nat}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        match &parsed.node(root.children[0]).kind {
            TreeKind::GImport { export, .. } => assert!(!export),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_find_parent_module_name() {
        let parsed = parse_one("\\begin{modsig}{M}\\symi{value}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        let symi = root.children[0];
        assert_eq!(parsed.find_parent_module_name(symi), Some("M".to_string()));
        assert_eq!(parsed.find_parent_module_tree(symi), Some(parsed.roots[0]));
    }

    #[test]
    fn test_traverse_order() {
        let parsed = parse_one(
            "\\begin{modsig}{M}\\begin{frame}\\symi{x}\\end{frame}\\gimport{B}\\end{modsig}",
        );
        let mut entered = Vec::new();
        let mut exited = Vec::new();
        parsed.traverse(
            parsed.roots[0],
            &mut |_, node| entered.push(std::mem::discriminant(&node.kind)),
            &mut |_, node| exited.push(std::mem::discriminant(&node.kind)),
        );
        assert_eq!(entered.len(), 4);
        assert_eq!(exited.len(), 4);
        // postorder: the scope closes before the modsig does
        assert_eq!(entered[0], *exited.last().unwrap());
    }

    #[test]
    fn test_scope_recognition() {
        let parsed = parse_one("\\begin{modsig}{M}\\begin{frame}\\symi{x}\\end{frame}\\end{modsig}");
        let root = parsed.node(parsed.roots[0]);
        let frame = parsed.node(root.children[0]);
        assert!(matches!(frame.kind, TreeKind::Scope { .. }));
        assert_eq!(frame.children.len(), 1);
    }

    #[test]
    fn test_importmodule_target_paths() {
        let root = Path::new("/w");
        let file = Path::new("/w/smglom/sets/source/set.tex");
        // load
        assert_eq!(
            importmodule_target(root, file, None, None, None, Some("lib/mod"), "m"),
            PathBuf::from("/w/lib/mod/m.tex")
        );
        // no qualifiers: local import
        assert_eq!(
            importmodule_target(root, file, None, None, None, None, "m"),
            PathBuf::from("/w/smglom/sets/source/set.tex")
        );
        // mhrepos with dir
        assert_eq!(
            importmodule_target(root, file, Some("smglom/numbers"), None, Some("d"), None, "m"),
            PathBuf::from("/w/smglom/numbers/source/d/m.tex")
        );
        // mhrepos with path
        assert_eq!(
            importmodule_target(root, file, Some("smglom/numbers"), Some("p/mod"), None, None, "m"),
            PathBuf::from("/w/smglom/numbers/source/p/mod.tex")
        );
        // dir without mhrepos resolves against the current repository
        assert_eq!(
            importmodule_target(root, file, None, None, Some("d"), None, "m"),
            PathBuf::from("/w/smglom/sets/source/d/m.tex")
        );
    }

    #[test]
    fn test_gimport_target_paths() {
        let root = Path::new("/w");
        let file = Path::new("/w/repo/source/A.tex");
        assert_eq!(
            gimport_target(root, file, Some("smglom/numbers"), "nat"),
            PathBuf::from("/w/smglom/numbers/source/nat.tex")
        );
        assert_eq!(
            gimport_target(root, file, None, "B"),
            PathBuf::from("/w/repo/source/B.tex")
        );
    }
}
