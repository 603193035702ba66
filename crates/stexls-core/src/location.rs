//! Positions, ranges and locations in source files.
//!
//! Lines and characters are zero-indexed, matching the LSP wire format,
//! so conversions at the server boundary are mechanical.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A zero-indexed (line, character) pair, ordered lexicographically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }

    /// Copy of this position with line and character offset by the
    /// given amounts, clamped at zero.
    pub fn translate(self, lines: i32, characters: i32) -> Position {
        Position {
            line: (self.line as i64 + lines as i64).max(0) as u32,
            character: (self.character as i64 + characters as i64).max(0) as u32,
        }
    }

    pub fn is_before(self, other: Position) -> bool {
        self < other
    }

    pub fn is_after(self, other: Position) -> bool {
        self > other
    }

    /// One-indexed "line X, column Y" display form.
    pub fn format(self) -> String {
        format!("line {}, column {}", self.line + 1, self.character + 1)
    }
}

/// An ordered pair of positions with `start <= end`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// An empty range anchored at a single position.
    pub fn empty(at: Position) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_empty(self) -> bool {
        self.start == self.end
    }

    pub fn is_single_line(self) -> bool {
        self.start.line == self.end.line
    }

    /// Both endpoints are inclusive, like the reveal behavior of an
    /// editor selection.
    pub fn contains(self, position: Position) -> bool {
        self.start <= position && position <= self.end
    }

    pub fn contains_range(self, other: Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest range containing both inputs.
    pub fn union(self, other: Range) -> Range {
        Range {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Splits at a character offset measured from `start`.
    ///
    /// The split point is clamped to the range: an index past the end
    /// yields the original range and an empty range anchored at `end`.
    pub fn split(self, index: u32) -> (Range, Range) {
        let split = Position {
            line: self.start.line,
            character: self.start.character + index,
        };
        if self.end < split {
            return (self, Range::empty(self.end));
        }
        (
            Range {
                start: self.start,
                end: split,
            },
            Range {
                start: split,
                end: self.end,
            },
        )
    }

    /// Translates start and end by the given line and character offsets.
    pub fn translate(self, lines: i32, characters: i32) -> Range {
        Range {
            start: self.start.translate(lines, characters),
            end: self.end.translate(lines, characters),
        }
    }

    /// Smallest range containing all inputs. `None` for an empty input.
    pub fn big_union<I: IntoIterator<Item = Range>>(ranges: I) -> Option<Range> {
        ranges.into_iter().reduce(Range::union)
    }
}

/// A range within a specific file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub path: PathBuf,
    pub range: Range,
}

impl Location {
    pub fn new(path: impl Into<PathBuf>, range: Range) -> Self {
        Self {
            path: path.into(),
            range,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, other: &Location) -> bool {
        self.path == other.path && self.range.contains_range(other.range)
    }

    /// Copy of this location with the range replaced.
    pub fn with_range(&self, range: Range) -> Location {
        Location {
            path: self.path.clone(),
            range,
        }
    }

    /// "file:line:column" display form used in related-information
    /// messages.
    pub fn format_link(&self) -> String {
        format!(
            "{}:{}:{}",
            self.path.display(),
            self.range.start.line + 1,
            self.range.start.character + 1
        )
    }
}
