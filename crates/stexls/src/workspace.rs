//! Workspace state: the file set under a root and the open, possibly
//! unsaved editor buffers that override disk content.

use crate::mathhub;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stexls_core::Location;
use walkdir::WalkDir;

pub struct Workspace {
    root: PathBuf,
    open_files: HashMap<PathBuf, String>,
    /// A file is included when it matches ANY of these.
    include: Vec<Regex>,
    /// A file is excluded when it matches ANY of these.
    ignore: Vec<Regex>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: mathhub::normalize(&root.into()),
            open_files: HashMap::new(),
            include: Vec::new(),
            ignore: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_include(&mut self, patterns: Vec<Regex>) {
        self.include = patterns;
    }

    pub fn set_ignore(&mut self, patterns: Vec<Regex>) {
        self.ignore = patterns;
    }

    /// All `.tex` files under the root, include patterns OR-ed, ignore
    /// patterns AND-ed out.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|extension| extension == "tex")
            })
            .map(|entry| entry.into_path())
            .filter(|path| {
                let text = path.to_string_lossy();
                (self.include.is_empty() || self.include.iter().any(|p| p.is_match(&text)))
                    && !self.ignore.iter().any(|p| p.is_match(&text))
            })
            .collect();
        files.sort();
        files
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.open_files.contains_key(path)
    }

    pub fn open_files(&self) -> impl Iterator<Item = &Path> {
        self.open_files.keys().map(PathBuf::as_path)
    }

    pub fn open_file(&mut self, path: PathBuf, text: String) {
        self.open_files.insert(path, text);
    }

    /// Full-content update of an open buffer. Updating a file that is
    /// not open opens it.
    pub fn update_file(&mut self, path: PathBuf, text: String) {
        self.open_files.insert(path, text);
    }

    pub fn close_file(&mut self, path: &Path) -> bool {
        self.open_files.remove(path).is_some()
    }

    /// Buffered content when the file is open, disk content otherwise.
    pub fn read_file(&self, path: &Path) -> Option<String> {
        match self.open_files.get(path) {
            Some(text) => Some(text.clone()),
            None => std::fs::read_to_string(path).ok(),
        }
    }

    /// The exact substring a location spans, from the open buffer or
    /// disk.
    pub fn read_location(&self, location: &Location) -> Option<String> {
        let content = self.read_file(&location.path)?;
        let lines: Vec<&str> = content.split('\n').collect();
        let range = location.range;
        let start_line = lines.get(range.start.line as usize)?;
        if range.start.line == range.end.line {
            return Some(
                start_line
                    .chars()
                    .skip(range.start.character as usize)
                    .take((range.end.character - range.start.character) as usize)
                    .collect(),
            );
        }
        let mut result: String = start_line
            .chars()
            .skip(range.start.character as usize)
            .collect();
        for line in range.start.line + 1..=range.end.line {
            result.push('\n');
            let line_text = lines.get(line as usize)?;
            if line == range.end.line {
                result.extend(line_text.chars().take(range.end.character as usize));
            } else {
                result.push_str(line_text);
            }
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stexls_core::{Position, Range};

    fn fixture() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("repo").join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("M.tex"), "\\begin{modsig}{M}\\end{modsig}").unwrap();
        std::fs::write(source.join("M.en.tex"), "binding").unwrap();
        std::fs::write(source.join("notes.txt"), "not tex").unwrap();
        let workspace = Workspace::new(dir.path());
        (dir, workspace)
    }

    #[test]
    fn test_files_only_tex() {
        let (_dir, workspace) = fixture();
        let files = workspace.files();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() == "tex"));
    }

    #[test]
    fn test_include_or_ignore_and() {
        let (_dir, mut workspace) = fixture();
        workspace.set_include(vec![Regex::new(r"\.en\.tex$").unwrap()]);
        assert_eq!(workspace.files().len(), 1);
        workspace.set_include(vec![]);
        workspace.set_ignore(vec![Regex::new(r"\.en\.tex$").unwrap()]);
        let files = workspace.files();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("M.tex"));
    }

    #[test]
    fn test_open_buffer_overrides_disk() {
        let (dir, mut workspace) = fixture();
        let file = dir.path().join("repo").join("source").join("M.tex");
        assert_eq!(
            workspace.read_file(&file).unwrap(),
            "\\begin{modsig}{M}\\end{modsig}"
        );
        workspace.open_file(file.clone(), "buffered".to_string());
        assert!(workspace.is_open(&file));
        assert_eq!(workspace.read_file(&file).unwrap(), "buffered");
        workspace.close_file(&file);
        assert_eq!(
            workspace.read_file(&file).unwrap(),
            "\\begin{modsig}{M}\\end{modsig}"
        );
    }

    #[test]
    fn test_read_location() {
        let (dir, mut workspace) = fixture();
        let file = dir.path().join("repo").join("source").join("M.tex");
        workspace.open_file(file.clone(), "first line\nsecond line".to_string());
        let location = Location::new(
            file.clone(),
            Range::new(Position::new(1, 7), Position::new(1, 11)),
        );
        assert_eq!(workspace.read_location(&location).unwrap(), "line");
        let location = Location::new(
            file,
            Range::new(Position::new(0, 6), Position::new(1, 6)),
        );
        assert_eq!(workspace.read_location(&location).unwrap(), "line\nsecond");
    }
}
