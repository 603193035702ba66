//! Boundary to the ML "trefier" tagger.
//!
//! The tagger itself is an external collaborator; this module only
//! defines the pure-function interface and turns its predictions into
//! hint diagnostics. Tokens already inside sTeX macros are skipped,
//! the model has nothing to add there.

use crate::latex::LatexTree;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use stexls_core::{Diagnostics, Range};

/// One predicted tag: a token and the probability it should be marked
/// up as a definition or reference.
#[derive(Debug, Clone)]
pub struct Tag {
    pub range: Range,
    pub token: String,
    pub label: f32,
}

/// A tag model is a pure function from file content to tags.
pub trait TagModel: Send + Sync {
    fn predict(&self, file: &Path, content: &str) -> Vec<Tag>;
}

/// Environments whose contents are already semantically marked up.
static MARKED_UP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([ma]*(Tr|tr|D|d|Dr|dr)ef[ivx]+s?\*?|gimport\*?|(import|use)(mh)?module\*?|(sym|var)def\*?|sym[ivx]+\*?|[tv]assign|libinput|\$)$",
    )
    .unwrap()
});

/// Emits a hint diagnostic for every plausible tag that is not already
/// inside a marked-up environment.
pub fn apply_tags(tree: &LatexTree, tags: &[Tag], diagnostics: &mut Diagnostics) {
    for tag in tags {
        if !(0.0..=1.0).contains(&tag.label) {
            continue;
        }
        if tag.label < 0.5 {
            continue;
        }
        let enclosing = tree.environments_at(tag.range.start);
        if enclosing.iter().any(|name| MARKED_UP.is_match(name)) {
            continue;
        }
        diagnostics.trefier_tag(tag.range, &tag.token, tag.label);
    }
}
