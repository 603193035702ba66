//! Diagnostic types and the uniform issue taxonomy.
//!
//! Every subsystem that can fail reports through [`Diagnostics`], one
//! constructor method per issue kind. The numeric severity and tag
//! values match the LSP wire encoding.

use crate::location::{Location, Range};
use serde::{Deserialize, Serialize};

/// Severity levels, ordered most severe first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "information",
            Self::Hint => "hint",
        }
    }

    /// Parses common spellings used on the lint command line.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "error" | "e" => Some(Self::Error),
            "warning" | "warn" | "w" => Some(Self::Warning),
            "information" | "info" | "i" => Some(Self::Information),
            "hint" | "h" => Some(Self::Hint),
            _ => None,
        }
    }
}

/// Extra metadata a client may use to render a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticTag {
    Unnecessary = 1,
    Deprecated = 2,
}

/// A pointer to related code, e.g. the previous definition in a
/// duplicate-symbol report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRelatedInformation {
    pub location: Location,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    pub message: String,
    pub severity: DiagnosticSeverity,
    /// Stable short code identifying the issue kind.
    pub code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<DiagnosticTag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_information: Vec<DiagnosticRelatedInformation>,
}

impl Diagnostic {
    fn new(range: Range, message: impl Into<String>, severity: DiagnosticSeverity, code: &str) -> Self {
        Self {
            range,
            message: message.into(),
            severity,
            code: code.to_string(),
            tags: Vec::new(),
            related_information: Vec::new(),
        }
    }

    fn with_tag(mut self, tag: DiagnosticTag) -> Self {
        self.tags.push(tag);
        self
    }

    fn with_related(mut self, location: Location, message: impl Into<String>) -> Self {
        self.related_information.push(DiagnosticRelatedInformation {
            location,
            message: message.into(),
        });
        self
    }
}

/// Formats `["a", "b", "c"]` as `"a", "b" or "c"`.
pub(crate) fn format_enumeration<'a, I: IntoIterator<Item = &'a str>>(items: I, last: &str) -> String {
    let items: Vec<String> = items.into_iter().map(|s| format!("\"{s}\"")).collect();
    match items.len() {
        0 => String::new(),
        1 => items.into_iter().next().unwrap_or_default(),
        n => format!("{} {last} {}", items[..n - 1].join(", "), items[n - 1]),
    }
}

/// Accumulator for the diagnostics of one file or one linked object.
///
/// Stable codes, messages, severities and tags for each issue kind live
/// here so they are uniform no matter which subsystem reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    diagnostics: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Merges another accumulator into this one.
    pub fn extend(&mut self, other: &Diagnostics) {
        self.diagnostics.extend(other.diagnostics.iter().cloned());
    }

    pub fn error_count(&self) -> usize {
        self.iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.iter()
            .filter(|d| d.severity == DiagnosticSeverity::Warning)
            .count()
    }

    /// An exception raised while parsing the file.
    pub fn parser_exception(&mut self, range: Range, message: impl Into<String>) {
        self.push(Diagnostic::new(
            range,
            message,
            DiagnosticSeverity::Error,
            "parser-exception",
        ));
    }

    /// A module dictates the name of the file it lives in and the
    /// actual filename disagrees.
    pub fn file_name_mismatch(&mut self, range: Range, expected: &str, actual: &str) {
        self.push(Diagnostic::new(
            range,
            format!("Expected the file name \"{expected}\", but found \"{actual}\""),
            DiagnosticSeverity::Warning,
            "filename-mismatch-check",
        ));
    }

    pub fn duplicate_symbol(&mut self, range: Range, name: &str, previous: &Location) {
        self.push(
            Diagnostic::new(
                range,
                format!("Symbol \"{name}\" previously defined at \"{}\"", previous.format_link()),
                DiagnosticSeverity::Error,
                "duplicate-symbol-check",
            )
            .with_related(previous.clone(), "Previous definition"),
        );
    }

    /// A referencing macro is used outside of any module, so the
    /// referenced module cannot be inferred.
    pub fn cant_infer_ref_module_outside_module(&mut self, range: Range) {
        self.push(Diagnostic::new(
            range,
            "Cannot infer what module is referenced outside of any module",
            DiagnosticSeverity::Error,
            "cannot-infer-referenced-module-outside-module",
        ));
    }

    pub fn mtref_deprecated(&mut self, range: Range) {
        self.push(
            Diagnostic::new(
                range,
                "\"mtref\" environments are deprecated",
                DiagnosticSeverity::Warning,
                "mtref-deprecation-check",
            )
            .with_tag(DiagnosticTag::Deprecated),
        );
    }

    pub fn mtref_questionmark_syntax(&mut self, range: Range) {
        self.push(Diagnostic::new(
            range,
            "Invalid \"mtref\" environment: Target symbol must be clarified by using \"?<symbol>\" syntax.",
            DiagnosticSeverity::Error,
            "mtref-questionmark-check",
        ));
    }

    /// Redefinition is allowed for this symbol kind, but the signatures
    /// disagree.
    pub fn invalid_redefinition(&mut self, range: Range, previous: &Location, info: impl Into<String>) {
        self.push(
            Diagnostic::new(range, info, DiagnosticSeverity::Error, "invalid-redefinition")
                .with_related(previous.clone(), "Previous definition"),
        );
    }

    pub fn replace_repos_with_mhrepos(&mut self, range: Range) {
        self.push(
            Diagnostic::new(
                range,
                "Argument \"repos\" is deprecated and should be replaced with \"mhrepos\".",
                DiagnosticSeverity::Warning,
                "repos-deprecation-check",
            )
            .with_tag(DiagnosticTag::Deprecated),
        );
    }

    /// A path-like argument names the place the file already is.
    pub fn is_current_dir(&mut self, range: Range, dir: &str) {
        self.redundant_location_argument(range, format!("Already located inside directory \"{dir}\""));
    }

    /// A repository/path/dir argument repeats the file's own location.
    pub fn redundant_location_argument(&mut self, range: Range, message: impl Into<String>) {
        self.push(
            Diagnostic::new(
                range,
                message,
                DiagnosticSeverity::Warning,
                "is-current-dir-check",
            )
            .with_tag(DiagnosticTag::Unnecessary),
        );
    }

    /// Should be impossible: an import resolved to multiple modules.
    pub fn unique_dependency_name(&mut self, range: Range, module_name: &str, file: &std::path::Path) {
        self.push(Diagnostic::new(
            range,
            format!("Module \"{module_name}\" not unique in \"{}\"", file.display()),
            DiagnosticSeverity::Error,
            "unique-dependency-name-check",
        ));
    }

    pub fn undefined_module_not_exported(&mut self, range: Range, module_name: &str, file: &std::path::Path) {
        self.push(Diagnostic::new(
            range,
            format!(
                "Undefined module \"{module_name}\" symbol not exported from file: \"{}\"",
                file.display()
            ),
            DiagnosticSeverity::Error,
            "undefined-module-not-exported",
        ));
    }

    pub fn cyclic_dependency(&mut self, range: Range, module_name: &str, imported_at: &Location) {
        self.push(
            Diagnostic::new(
                range,
                format!("Cyclic dependency created at import of \"{module_name}\""),
                DiagnosticSeverity::Error,
                "cyclic-dependency-check",
            )
            .with_related(imported_at.clone(), "Imported at"),
        );
    }

    pub fn file_not_found(&mut self, range: Range, file: &std::path::Path) {
        self.push(Diagnostic::new(
            range,
            format!("File not found: \"{}\"", file.display()),
            DiagnosticSeverity::Error,
            "file-not-found",
        ));
    }

    /// Unresolved reference, optionally with similar symbols the author
    /// may have meant.
    pub fn undefined_symbol(
        &mut self,
        range: Range,
        symbol_name: &str,
        expected: Option<&str>,
        similar: &[(String, Location)],
    ) {
        let mut message = match expected {
            Some(expected) => format!("Undefined symbol \"{symbol_name}\" of type {expected}"),
            None => format!("Undefined symbol \"{symbol_name}\""),
        };
        if !similar.is_empty() {
            let names = format_enumeration(similar.iter().map(|(name, _)| name.as_str()), "or");
            message.push_str(&format!(": Did you mean {names}?"));
        }
        let mut diagnostic =
            Diagnostic::new(range, message, DiagnosticSeverity::Error, "undefined-symbol");
        for (name, location) in similar {
            diagnostic = diagnostic.with_related(location.clone(), format!("Related symbol: {name}"));
        }
        self.push(diagnostic);
    }

    pub fn reference_type_check(&mut self, range: Range, expected: &str, actual: &str) {
        self.push(Diagnostic::new(
            range,
            format!(
                "Expected symbol type is {expected} but the resolved symbol is of type {actual}"
            ),
            DiagnosticSeverity::Error,
            "reference-type-check",
        ));
    }

    pub fn redundant_import(&mut self, range: Range, module_name: &str, previously_at: Option<&Location>) {
        let mut diagnostic = Diagnostic::new(
            range,
            format!("Redundant import of module \"{module_name}\""),
            DiagnosticSeverity::Warning,
            "redundant-import-check",
        )
        .with_tag(DiagnosticTag::Unnecessary);
        if let Some(previous) = previously_at {
            diagnostic = diagnostic.with_related(previous.clone(), "Previously imported here");
        }
        self.push(diagnostic);
    }

    /// A reference to a symbol whose definition forbids verbalization,
    /// globally or for the referencing binding's language.
    pub fn referenced_noverb(
        &mut self,
        range: Range,
        symbol_name: &str,
        lang: Option<&str>,
        defined_at: &Location,
    ) {
        let message = match lang {
            Some(lang) => {
                format!("Symbol \"{symbol_name}\" is marked as noverb for the language \"{lang}\"")
            }
            None => format!("Symbol \"{symbol_name}\" is marked as noverb"),
        };
        self.push(
            Diagnostic::new(range, message, DiagnosticSeverity::Warning, "referenced-noverb-symbol")
                .with_related(defined_at.clone(), "Referenced symbol"),
        );
    }

    pub fn never_referenced(&mut self, range: Range, symbol_name: &str) {
        self.push(Diagnostic::new(
            range,
            format!("Symbol never referenced: {symbol_name}"),
            DiagnosticSeverity::Warning,
            "never-referenced-symbol",
        ));
    }

    /// Hint produced by the trefier tag model.
    pub fn trefier_tag(&mut self, range: Range, token: &str, label: f32) {
        self.push(Diagnostic::new(
            range,
            format!("Label for \"{token}\": {label:.2}"),
            DiagnosticSeverity::Information,
            "generic-trefier-tag-hint",
        ));
    }

    /// An environment was used somewhere it makes no semantic sense.
    pub fn semantic_location_check(&mut self, range: Range, env_name: &str, extra: Option<&str>) {
        let message = match extra {
            Some(extra) => format!("Invalid location for {env_name}: {extra}"),
            None => format!("Invalid location for {env_name}"),
        };
        self.push(Diagnostic::new(
            range,
            message,
            DiagnosticSeverity::Error,
            "location-check",
        ));
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Position;

    fn range() -> Range {
        Range::new(Position::new(1, 2), Position::new(1, 8))
    }

    #[test]
    fn test_severity_order() {
        assert!(DiagnosticSeverity::Error < DiagnosticSeverity::Warning);
        assert!(DiagnosticSeverity::Warning < DiagnosticSeverity::Information);
        assert_eq!(DiagnosticSeverity::parse("warn"), Some(DiagnosticSeverity::Warning));
    }

    #[test]
    fn test_deprecation_carries_tag() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.replace_repos_with_mhrepos(range());
        diagnostics.mtref_deprecated(range());
        for diagnostic in &diagnostics {
            assert_eq!(diagnostic.tags, vec![DiagnosticTag::Deprecated]);
            assert_eq!(diagnostic.severity, DiagnosticSeverity::Warning);
        }
    }

    #[test]
    fn test_undefined_symbol_with_suggestions() {
        let mut diagnostics = Diagnostics::new();
        let location = Location::new("/w/M.tex", range());
        diagnostics.undefined_symbol(
            range(),
            "valu",
            Some("\"def\""),
            &[("M?value".to_string(), location.clone())],
        );
        let diagnostic = diagnostics.iter().next().unwrap();
        assert!(diagnostic.message.contains("Did you mean \"M?value\"?"));
        assert_eq!(diagnostic.related_information[0].location, location);
        assert_eq!(diagnostic.code, "undefined-symbol");
    }

    #[test]
    fn test_format_enumeration() {
        assert_eq!(format_enumeration(["a"], "or"), "\"a\"");
        assert_eq!(format_enumeration(["a", "b"], "or"), "\"a\" or \"b\"");
        assert_eq!(
            format_enumeration(["a", "b", "c"], "or"),
            "\"a\", \"b\" or \"c\""
        );
    }

    #[test]
    fn test_counts() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.file_not_found(range(), std::path::Path::new("/w/x.tex"));
        diagnostics.is_current_dir(range(), "demo");
        assert_eq!(diagnostics.error_count(), 1);
        assert_eq!(diagnostics.warning_count(), 1);
    }
}
