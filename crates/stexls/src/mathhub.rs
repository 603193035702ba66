//! Path conventions of a MathHub-shaped workspace.
//!
//! Repositories live under `<root>/<repository>/source/**` where the
//! repository identifier may span one or more path components
//! (`smglom/sets`). Import statements address modules relative to this
//! layout; the helpers here derive the pieces from a file path.

use std::path::{Component, Path, PathBuf};

/// Lexically normalizes a path: resolves `.` and `..` without touching
/// the filesystem, so missing files keep a well-formed absolute path
/// for the file-not-found diagnostic at link time.
pub fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push(component.as_os_str());
                }
            }
            _ => result.push(component.as_os_str()),
        }
    }
    result
}

/// The `<root>/<repository>/source` directory containing `file`:
/// the nearest ancestor directory named `source` that still lies under
/// `root`.
pub fn find_source_dir(root: &Path, file: &Path) -> Option<PathBuf> {
    file.ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(root) && *dir != root)
        .find(|dir| dir.file_name().is_some_and(|name| name == "source"))
        .map(Path::to_path_buf)
}

/// Repository identifier of `file` relative to `root`, e.g.
/// `smglom/sets`. `None` when the file does not follow the
/// `<root>/<repository>/source/**` layout.
pub fn repository_name(root: &Path, file: &Path) -> Option<String> {
    let source = find_source_dir(root, file)?;
    let repository = source.parent()?.strip_prefix(root).ok()?;
    Some(repository.to_string_lossy().replace('\\', "/"))
}

/// The `path=` form of `file`: relative to its source directory,
/// without the `.tex` extension.
pub fn source_relative_path(root: &Path, file: &Path) -> Option<String> {
    let source = find_source_dir(root, file)?;
    let relative = file.strip_prefix(&source).ok()?.with_extension("");
    Some(relative.to_string_lossy().replace('\\', "/"))
}

/// The `dir=` form of `file`: the directory part of
/// [`source_relative_path`].
pub fn source_relative_dir(root: &Path, file: &Path) -> Option<String> {
    let path = source_relative_path(root, file)?;
    match path.rsplit_once('/') {
        Some((dir, _)) => Some(dir.to_string()),
        None => Some(String::new()),
    }
}
