//! LaTeX surface parser.
//!
//! Produces the generic node tree the intermediate parser consumes:
//! environments (`\begin{e}...\end{e}`), inline environments
//! (`\macro[oargs]{rargs}`), groups, math and text tokens. Nothing in
//! here knows about sTeX; the tree only exposes environment names and
//! their optional/required arguments.
//!
//! Syntax errors (unbalanced or unclosed environments, unterminated
//! groups and math) are collected with locations instead of aborting
//! the parse; the remainder of the file is still parsed.

use stexls_core::{Location, Position, Range};

/// Byte offsets into the source plus the equivalent line/character range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub range: Range,
}

impl Span {
    fn new(start: usize, end: usize, range: Range) -> Self {
        Self { start, end, range }
    }
}

/// A leaf carrying the verbatim text of a name or argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub span: Span,
    pub lexeme: String,
}

/// An optional argument, either positional (`[value]`) or named
/// (`[name=value]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OArg {
    pub name: Option<Token>,
    pub value: Token,
}

/// `\begin{name}[oargs]{rargs} body \end{name}` or the inline form
/// `\name[oargs]{rarg}...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Environment name including a trailing `*` when present.
    pub name: Token,
    pub oargs: Vec<OArg>,
    /// Required arguments. Spans cover the text inside the braces.
    pub rargs: Vec<Token>,
    pub inline: bool,
}

impl Environment {
    /// Positional optional arguments, in order.
    pub fn unnamed_oargs(&self) -> impl Iterator<Item = &OArg> {
        self.oargs.iter().filter(|oarg| oarg.name.is_none())
    }

    /// Looks up a named optional argument.
    pub fn named_oarg(&self, name: &str) -> Option<&Token> {
        self.oargs
            .iter()
            .find(|oarg| oarg.name.as_ref().is_some_and(|n| n.lexeme == name))
            .map(|oarg| &oarg.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    /// Plain text run.
    Text,
    /// `$...$`, `$$...$$` or `\[...\]`.
    Math,
    /// Anonymous `{...}` group.
    Group,
    Environment(Environment),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub span: Span,
    pub kind: NodeKind,
    pub children: Vec<Node>,
}

impl Node {
    fn new(span: Span, kind: NodeKind) -> Self {
        Self {
            span,
            kind,
            children: Vec::new(),
        }
    }

    pub fn environment(&self) -> Option<&Environment> {
        match &self.kind {
            NodeKind::Environment(env) => Some(env),
            _ => None,
        }
    }
}

/// The parsed file: node tree, source and syntax errors.
#[derive(Debug)]
pub struct LatexTree {
    pub path: std::path::PathBuf,
    pub root: Node,
    pub syntax_errors: Vec<(Location, String)>,
    source: String,
}

impl LatexTree {
    /// Text of the source covered by a span.
    pub fn text(&self, span: Span) -> &str {
        &self.source[span.start..span.end]
    }

    /// Range spanning the entire source.
    pub fn whole_range(&self) -> Range {
        self.root.span.range
    }

    /// Visits every environment in document order, calling `enter`
    /// preorder and `exit` postorder. Implemented with an explicit
    /// stack so untrusted nesting depth cannot overflow the call stack.
    pub fn walk<'t>(
        &'t self,
        enter: &mut dyn FnMut(&'t Node, &'t Environment),
        exit: &mut dyn FnMut(&'t Node, &'t Environment),
    ) {
        enum Step<'t> {
            Visit(&'t Node),
            Leave(&'t Node),
        }
        let mut stack = vec![Step::Visit(&self.root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Visit(node) => {
                    if let NodeKind::Environment(env) = &node.kind {
                        enter(node, env);
                        stack.push(Step::Leave(node));
                    }
                    for child in node.children.iter().rev() {
                        stack.push(Step::Visit(child));
                    }
                }
                Step::Leave(node) => {
                    if let NodeKind::Environment(env) = &node.kind {
                        exit(node, env);
                    }
                }
            }
        }
    }

    /// Names of the environments enclosing `position`, outermost first.
    pub fn environments_at(&self, position: Position) -> Vec<&str> {
        let mut names = Vec::new();
        let mut node = &self.root;
        loop {
            if let NodeKind::Environment(env) = &node.kind {
                names.push(self.text(env.name.span));
            }
            match node
                .children
                .iter()
                .find(|child| child.span.range.contains(position))
            {
                Some(child) => node = child,
                None => return names,
            }
        }
    }
}

/// Parses `content` as the contents of `path`.
pub fn parse(path: impl Into<std::path::PathBuf>, content: &str) -> LatexTree {
    let mut parser = Parser::new(content);
    let path = path.into();
    let (root, errors) = parser.parse();
    let syntax_errors = errors
        .into_iter()
        .map(|(range, message)| (Location::new(path.clone(), range), message))
        .collect();
    LatexTree {
        path,
        root,
        syntax_errors,
        source: content.to_string(),
    }
}

struct Cursor<'s> {
    source: &'s str,
    offset: usize,
    line: u32,
    character: u32,
}

impl<'s> Cursor<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            source,
            offset: 0,
            line: 0,
            character: 0,
        }
    }

    fn eof(&self) -> bool {
        self.offset >= self.source.len()
    }

    fn peek(&self) -> Option<char> {
        self.source[self.offset..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.character = 0;
        } else {
            self.character += 1;
        }
        Some(c)
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.character)
    }

    /// Skips spaces and tabs but not newlines, so argument lists may be
    /// spaced out on one line without gluing paragraphs together.
    fn skip_inline_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
    }
}

struct Parser<'s> {
    cursor: Cursor<'s>,
    errors: Vec<(Range, String)>,
}

/// Frame of an open `\begin{...}` environment.
struct EnvFrame {
    env: Environment,
    start_offset: usize,
    start: Position,
    children: Vec<Node>,
}

impl<'s> Parser<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            cursor: Cursor::new(source),
            errors: Vec::new(),
        }
    }

    fn span(&self, start_offset: usize, start: Position) -> Span {
        Span::new(
            start_offset,
            self.cursor.offset,
            Range::new(start, self.cursor.position()),
        )
    }

    fn parse(&mut self) -> (Node, Vec<(Range, String)>) {
        let mut stack: Vec<EnvFrame> = Vec::new();
        let mut toplevel: Vec<Node> = Vec::new();
        while !self.cursor.eof() {
            if let Some(node) = self.parse_item(&mut stack) {
                match stack.last_mut() {
                    Some(frame) => frame.children.push(node),
                    None => toplevel.push(node),
                }
            }
        }
        // Anything still open at end of input is unclosed.
        while let Some(frame) = stack.pop() {
            let span = self.span(frame.start_offset, frame.start);
            self.errors.push((
                span.range,
                format!(
                    "Environment not closed: \"{}\"",
                    frame.env.name.lexeme
                ),
            ));
            let mut node = Node::new(span, NodeKind::Environment(frame.env));
            node.children = frame.children;
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => toplevel.push(node),
            }
        }
        let end = self.cursor.position();
        let mut root = Node::new(
            Span::new(
                0,
                self.cursor.offset,
                Range::new(Position::new(0, 0), end),
            ),
            NodeKind::Root,
        );
        root.children = toplevel;
        (root, std::mem::take(&mut self.errors))
    }

    /// Parses one item at the cursor. Returns `None` when the item was
    /// consumed without producing a node (comments, `\end`).
    fn parse_item(&mut self, stack: &mut Vec<EnvFrame>) -> Option<Node> {
        let start_offset = self.cursor.offset;
        let start = self.cursor.position();
        match self.cursor.peek()? {
            '%' => {
                while !matches!(self.cursor.peek(), None | Some('\n')) {
                    self.cursor.bump();
                }
                None
            }
            '$' => Some(self.parse_math(start_offset, start)),
            '{' => Some(self.parse_group(start_offset, start)),
            '}' => {
                // Stray closing brace; consume as text so parsing resumes.
                self.cursor.bump();
                Some(Node::new(self.span(start_offset, start), NodeKind::Text))
            }
            '\\' => self.parse_control_sequence(stack, start_offset, start),
            _ => {
                while !matches!(
                    self.cursor.peek(),
                    None | Some('%' | '$' | '{' | '}' | '\\')
                ) {
                    self.cursor.bump();
                }
                Some(Node::new(self.span(start_offset, start), NodeKind::Text))
            }
        }
    }

    fn parse_math(&mut self, start_offset: usize, start: Position) -> Node {
        self.cursor.bump();
        let display = self.cursor.peek() == Some('$');
        if display {
            self.cursor.bump();
        }
        loop {
            match self.cursor.bump() {
                None => {
                    self.errors
                        .push((self.span(start_offset, start).range, "Unterminated math environment".to_string()));
                    break;
                }
                Some('\\') => {
                    self.cursor.bump();
                }
                Some('$') => {
                    if display {
                        if self.cursor.peek() == Some('$') {
                            self.cursor.bump();
                            break;
                        }
                    } else {
                        break;
                    }
                }
                Some(_) => {}
            }
        }
        Node::new(self.span(start_offset, start), NodeKind::Math)
    }

    fn parse_group(&mut self, start_offset: usize, start: Position) -> Node {
        self.cursor.bump(); // consume '{'
        let inner_offset = self.cursor.offset;
        let inner_start = self.cursor.position();
        let mut children = Vec::new();
        let mut stack = Vec::new();
        loop {
            match self.cursor.peek() {
                None => {
                    self.errors.push((
                        self.span(start_offset, start).range,
                        "Unterminated group".to_string(),
                    ));
                    break;
                }
                Some('}') => {
                    break;
                }
                _ => {
                    if let Some(node) = self.parse_item(&mut stack) {
                        children.push(node);
                    }
                }
            }
        }
        // Environments opened inside the group but not closed before it
        // ends are attached where they began.
        while let Some(frame) = stack.pop() {
            let span = self.span(frame.start_offset, frame.start);
            self.errors.push((
                span.range,
                format!("Environment not closed: \"{}\"", frame.env.name.lexeme),
            ));
            let mut node = Node::new(span, NodeKind::Environment(frame.env));
            node.children = frame.children;
            children.push(node);
        }
        // Span covers the text inside the braces.
        let span = self.span(inner_offset, inner_start);
        self.cursor.bump(); // consume '}'
        let mut node = Node::new(span, NodeKind::Group);
        node.children = children;
        node
    }

    fn parse_control_sequence(
        &mut self,
        stack: &mut Vec<EnvFrame>,
        start_offset: usize,
        start: Position,
    ) -> Option<Node> {
        self.cursor.bump(); // consume '\'
        if self.cursor.peek() == Some('[') {
            // \[ ... \] display math
            self.cursor.bump();
            loop {
                match self.cursor.bump() {
                    None => {
                        self.errors.push((
                            self.span(start_offset, start).range,
                            "Unterminated math environment".to_string(),
                        ));
                        break;
                    }
                    Some('\\') if self.cursor.peek() == Some(']') => {
                        self.cursor.bump();
                        break;
                    }
                    Some(_) => {}
                }
            }
            return Some(Node::new(self.span(start_offset, start), NodeKind::Math));
        }
        let name = self.read_macro_name();
        if name.is_empty() {
            // Escaped single character like \% or \\.
            self.cursor.bump();
            return Some(Node::new(self.span(start_offset, start), NodeKind::Text));
        }
        match name.as_str() {
            "begin" => {
                self.begin_environment(stack, start_offset, start);
                None
            }
            "end" => self.end_environment(stack, start_offset, start),
            _ => self.inline_environment(name, start_offset, start),
        }
    }

    fn read_macro_name(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.cursor.peek() {
            if c.is_ascii_alphabetic() || c == '@' {
                name.push(c);
                self.cursor.bump();
            } else {
                break;
            }
        }
        if !name.is_empty() && self.cursor.peek() == Some('*') {
            name.push('*');
            self.cursor.bump();
        }
        name
    }

    /// Reads the `{name}` after `\begin` or `\end`.
    fn read_env_name(&mut self) -> Option<Token> {
        self.cursor.skip_inline_whitespace();
        if self.cursor.peek() != Some('{') {
            return None;
        }
        self.cursor.bump();
        let start_offset = self.cursor.offset;
        let start = self.cursor.position();
        while !matches!(self.cursor.peek(), None | Some('}')) {
            self.cursor.bump();
        }
        let span = self.span(start_offset, start);
        let lexeme = self.cursor.source[span.start..span.end].trim().to_string();
        self.cursor.bump(); // consume '}'
        Some(Token { span, lexeme })
    }

    fn begin_environment(&mut self, stack: &mut Vec<EnvFrame>, start_offset: usize, start: Position) {
        let Some(name) = self.read_env_name() else {
            self.errors.push((
                self.span(start_offset, start).range,
                "Missing environment name after \\begin".to_string(),
            ));
            return;
        };
        let (oargs, rargs) = self.parse_arguments();
        stack.push(EnvFrame {
            env: Environment {
                name,
                oargs,
                rargs,
                inline: false,
            },
            start_offset,
            start,
            children: Vec::new(),
        });
    }

    fn end_environment(
        &mut self,
        stack: &mut Vec<EnvFrame>,
        start_offset: usize,
        start: Position,
    ) -> Option<Node> {
        let name = self.read_env_name();
        let Some(frame) = stack.pop() else {
            self.errors.push((
                self.span(start_offset, start).range,
                format!(
                    "Unbalanced \\end{{{}}} without matching \\begin",
                    name.map(|n| n.lexeme).unwrap_or_default()
                ),
            ));
            return None;
        };
        if let Some(name) = &name {
            if name.lexeme != frame.env.name.lexeme {
                self.errors.push((
                    Range::new(frame.start, self.cursor.position()),
                    format!(
                        "Environment unbalanced: Expected {} entered ({}) found {} ({})",
                        frame.env.name.lexeme,
                        frame.start.format(),
                        name.lexeme,
                        start.format()
                    ),
                ));
            }
        }
        let span = self.span(frame.start_offset, frame.start);
        let mut node = Node::new(span, NodeKind::Environment(frame.env));
        node.children = frame.children;
        Some(node)
    }

    /// `\macro[oargs]{rarg}...` becomes an inline environment; a bare
    /// macro with no arguments is plain text.
    fn inline_environment(
        &mut self,
        name: String,
        start_offset: usize,
        start: Position,
    ) -> Option<Node> {
        let name_span = Span::new(
            start_offset + 1,
            start_offset + 1 + name.len(),
            Range::new(
                start.translate(0, 1),
                start.translate(0, 1 + name.chars().count() as i32),
            ),
        );
        let (oargs, rargs) = self.parse_arguments();
        if oargs.is_empty() && rargs.is_empty() {
            return Some(Node::new(self.span(start_offset, start), NodeKind::Text));
        }
        let env = Environment {
            name: Token {
                span: name_span,
                lexeme: name,
            },
            oargs,
            rargs,
            inline: true,
        };
        Some(Node::new(
            self.span(start_offset, start),
            NodeKind::Environment(env),
        ))
    }

    /// Parses a run of `[...]` and `{...}` argument lists.
    fn parse_arguments(&mut self) -> (Vec<OArg>, Vec<Token>) {
        let mut oargs = Vec::new();
        let mut rargs = Vec::new();
        loop {
            self.cursor.skip_inline_whitespace();
            match self.cursor.peek() {
                Some('[') if rargs.is_empty() => self.parse_oargs(&mut oargs),
                Some('{') => rargs.push(self.parse_rarg()),
                _ => break,
            }
        }
        (oargs, rargs)
    }

    /// `[a,b=c,...]` with brace-aware splitting at top-level commas.
    fn parse_oargs(&mut self, oargs: &mut Vec<OArg>) {
        self.cursor.bump(); // consume '['
        loop {
            self.cursor.skip_inline_whitespace();
            if matches!(self.cursor.peek(), None | Some(']')) {
                break;
            }
            let item_offset = self.cursor.offset;
            let item_start = self.cursor.position();
            let mut depth = 0usize;
            let mut eq_offset: Option<(usize, Position)> = None;
            loop {
                match self.cursor.peek() {
                    None => break,
                    Some(',') | Some(']') if depth == 0 => break,
                    Some('{') => {
                        depth += 1;
                        self.cursor.bump();
                    }
                    Some('}') => {
                        depth = depth.saturating_sub(1);
                        self.cursor.bump();
                    }
                    Some('=') if depth == 0 && eq_offset.is_none() => {
                        eq_offset = Some((self.cursor.offset, self.cursor.position()));
                        self.cursor.bump();
                    }
                    Some(_) => {
                        self.cursor.bump();
                    }
                }
            }
            let item_span = self.span(item_offset, item_start);
            let item_text = &self.cursor.source[item_span.start..item_span.end];
            match eq_offset {
                Some((eq, eq_pos)) => {
                    let name_span = Span::new(item_span.start, eq, Range::new(item_start, eq_pos));
                    let name_text = self.cursor.source[name_span.start..name_span.end].to_string();
                    let value_span = Span::new(
                        eq + 1,
                        item_span.end,
                        Range::new(eq_pos.translate(0, 1), item_span.range.end),
                    );
                    let value_text =
                        self.cursor.source[value_span.start..value_span.end].to_string();
                    oargs.push(OArg {
                        name: Some(Token {
                            span: name_span,
                            lexeme: name_text.trim().to_string(),
                        }),
                        value: Token {
                            span: value_span,
                            lexeme: value_text,
                        },
                    });
                }
                None => {
                    oargs.push(OArg {
                        name: None,
                        value: Token {
                            span: item_span,
                            lexeme: item_text.to_string(),
                        },
                    });
                }
            }
            if self.cursor.peek() == Some(',') {
                self.cursor.bump();
            } else {
                break;
            }
        }
        if self.cursor.peek() == Some(']') {
            self.cursor.bump();
        }
    }

    /// `{...}` with brace balancing. The token spans the inside.
    fn parse_rarg(&mut self) -> Token {
        self.cursor.bump(); // consume '{'
        let start_offset = self.cursor.offset;
        let start = self.cursor.position();
        let mut depth = 0usize;
        loop {
            match self.cursor.peek() {
                None => {
                    self.errors.push((
                        Range::new(start, self.cursor.position()),
                        "Unterminated argument group".to_string(),
                    ));
                    break;
                }
                Some('{') => {
                    depth += 1;
                    self.cursor.bump();
                }
                Some('}') => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    self.cursor.bump();
                }
                Some('\\') => {
                    self.cursor.bump();
                    self.cursor.bump();
                }
                Some(_) => {
                    self.cursor.bump();
                }
            }
        }
        let span = self.span(start_offset, start);
        let lexeme = self.cursor.source[span.start..span.end].to_string();
        self.cursor.bump(); // consume '}'
        Token { span, lexeme }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environments(tree: &LatexTree) -> Vec<(String, bool)> {
        let mut found = Vec::new();
        tree.walk(
            &mut |_, env| found.push((env.name.lexeme.clone(), env.inline)),
            &mut |_, _| {},
        );
        found
    }

    #[test]
    fn test_parse_begin_end_environment() {
        let tree = parse("/w/M.tex", "\\begin{modsig}{M}\\end{modsig}");
        assert!(tree.syntax_errors.is_empty());
        let envs = environments(&tree);
        assert_eq!(envs, vec![("modsig".to_string(), false)]);
        let root_env = tree.root.children[0].environment().unwrap();
        assert_eq!(root_env.rargs.len(), 1);
        assert_eq!(root_env.rargs[0].lexeme, "M");
    }

    #[test]
    fn test_parse_inline_environment_with_args() {
        let tree = parse("/w/x.tex", "\\trefi[M?value]{text}");
        let env = tree.root.children[0].environment().unwrap();
        assert!(env.inline);
        assert_eq!(env.name.lexeme, "trefi");
        assert_eq!(env.oargs.len(), 1);
        assert!(env.oargs[0].name.is_none());
        assert_eq!(env.oargs[0].value.lexeme, "M?value");
        assert_eq!(env.rargs[0].lexeme, "text");
    }

    #[test]
    fn test_named_oargs() {
        let tree = parse("/w/x.tex", "\\importmhmodule[mhrepos=smglom/sets,path=mod]{mod}");
        let env = tree.root.children[0].environment().unwrap();
        assert_eq!(env.named_oarg("mhrepos").unwrap().lexeme, "smglom/sets");
        assert_eq!(env.named_oarg("path").unwrap().lexeme, "mod");
        assert!(env.named_oarg("dir").is_none());
    }

    #[test]
    fn test_nested_environments_walk_order() {
        let tree = parse(
            "/w/x.tex",
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        );
        let envs = environments(&tree);
        assert_eq!(
            envs,
            vec![("modsig".to_string(), false), ("symi".to_string(), true)]
        );
    }

    #[test]
    fn test_star_kept_in_name() {
        let tree = parse("/w/x.tex", "\\symdef*{plus}");
        let env = tree.root.children[0].environment().unwrap();
        assert_eq!(env.name.lexeme, "symdef*");
    }

    #[test]
    fn test_unbalanced_environment_reports_error() {
        let tree = parse("/w/x.tex", "\\begin{modsig}{M}\\end{module}");
        assert_eq!(tree.syntax_errors.len(), 1);
        assert!(tree.syntax_errors[0].1.contains("unbalanced"));
    }

    #[test]
    fn test_unclosed_environment_reports_error() {
        let tree = parse("/w/x.tex", "\\begin{modsig}{M}");
        assert_eq!(tree.syntax_errors.len(), 1);
        assert!(tree.syntax_errors[0].1.contains("not closed"));
        // the partial environment is still in the tree
        assert_eq!(environments(&tree).len(), 1);
    }

    #[test]
    fn test_comments_and_math_are_skipped() {
        let tree = parse(
            "/w/x.tex",
            "% \\symi{ignored}\ntext $\\defi{ignored}$ \\symi{real}",
        );
        let envs = environments(&tree);
        assert_eq!(envs, vec![("symi".to_string(), true)]);
    }

    #[test]
    fn test_ranges_are_zero_indexed() {
        let tree = parse("/w/x.tex", "line one\n\\symi{value}");
        let env_node = &tree.root.children[1];
        assert_eq!(env_node.span.range.start, Position::new(1, 0));
        let env = env_node.environment().unwrap();
        assert_eq!(env.rargs[0].span.range.start, Position::new(1, 6));
        assert_eq!(env.rargs[0].span.range.end, Position::new(1, 11));
    }

    #[test]
    fn test_environments_at_position() {
        let tree = parse(
            "/w/x.tex",
            "\\begin{modsig}{M}\\symi{value}\\end{modsig}",
        );
        let names = tree.environments_at(Position::new(0, 24));
        assert_eq!(names, vec!["modsig", "symi"]);
    }

    #[test]
    fn test_multibyte_text() {
        let tree = parse("/w/x.tex", "üöä \\symi{wert}");
        let env = tree.root.children[1].environment().unwrap();
        assert_eq!(env.rargs[0].lexeme, "wert");
        assert_eq!(env.rargs[0].span.range.start.character, 10);
    }
}
