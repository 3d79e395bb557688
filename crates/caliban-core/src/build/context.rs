//! Build context enumeration.
//!
//! The build context is the set of files handed to the external builder. It
//! is enumerated deterministically (sorted relative paths) and honors a
//! `.dockerignore` exclusion list; excluded files are never opened.

use std::path::{Path, PathBuf};

use glob::Pattern;
use walkdir::WalkDir;

use crate::build::error::{RecipeError, RecipeResult};

/// File name of the exclusion list read from the project root.
pub const DOCKERIGNORE_FILE: &str = ".dockerignore";

/// Exclusion rules parsed from a `.dockerignore` file.
///
/// Each non-comment line is a glob pattern matched against paths relative to
/// the context root. A pattern with no slash also matches by file name in
/// any directory, and a trailing slash excludes a whole subtree.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<Pattern>,
    name_patterns: Vec<Pattern>,
    dir_prefixes: Vec<String>,
}

impl ExclusionList {
    /// Loads the exclusion list from a context root. A missing file yields
    /// the empty list.
    pub fn load(root: &Path) -> RecipeResult<Self> {
        let path = root.join(DOCKERIGNORE_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Self::parse(&text)
    }

    /// Parses exclusion rules from text.
    pub fn parse(text: &str) -> RecipeResult<Self> {
        let mut list = Self::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(dir) = trimmed.strip_suffix('/') {
                list.dir_prefixes.push(dir.to_string());
                continue;
            }
            let pattern = Pattern::new(trimmed).map_err(|e| {
                RecipeError::InvalidExclusion(format!("'{}': {}", trimmed, e))
            })?;
            if !trimmed.contains('/') {
                list.name_patterns.push(pattern.clone());
            }
            list.patterns.push(pattern);
        }
        Ok(list)
    }

    /// Whether a context-relative path is excluded.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        let as_str = relative.to_string_lossy();

        for prefix in &self.dir_prefixes {
            if as_str == *prefix || as_str.starts_with(&format!("{}/", prefix)) {
                return true;
            }
        }
        if self.patterns.iter().any(|p| p.matches(&as_str)) {
            return true;
        }
        if let Some(name) = relative.file_name().map(|n| n.to_string_lossy()) {
            if self.name_patterns.iter().any(|p| p.matches(&name)) {
                return true;
            }
        }
        false
    }
}

/// Manifest of the files shipped to the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Absolute path of the context root.
    pub root: PathBuf,
    /// Context-relative file paths, sorted for determinism.
    pub files: Vec<String>,
}

impl BuildContext {
    /// Enumerates the build context under `root`, honoring its exclusion
    /// list. The `.dockerignore` file itself is excluded from the manifest.
    pub fn enumerate(root: &Path) -> RecipeResult<Self> {
        if !root.is_dir() {
            return Err(RecipeError::MissingDirectory(root.display().to_string()));
        }
        let exclusions = ExclusionList::load(root)?;

        let mut files = Vec::new();
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            e.path()
                .strip_prefix(root)
                .map(|rel| rel.as_os_str().is_empty() || !exclusions.is_excluded(rel))
                .unwrap_or(true)
        }) {
            let entry = entry.map_err(|e| {
                RecipeError::Io(std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_string_lossy()
                .into_owned();
            if relative == DOCKERIGNORE_FILE {
                continue;
            }
            files.push(relative);
        }

        files.sort();
        Ok(Self { root: root.to_path_buf(), files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_enumerate_sorted_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("b.py"));
        touch(&dir.path().join("a.py"));
        touch(&dir.path().join("pkg/mod.py"));

        let context = BuildContext::enumerate(dir.path()).unwrap();
        assert_eq!(context.files, vec!["a.py", "b.py", "pkg/mod.py"]);
    }

    #[test]
    fn test_dockerignore_excludes_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("train.py"));
        touch(&dir.path().join("notes.log"));
        touch(&dir.path().join("data/raw.bin"));
        touch(&dir.path().join("src/deep/cache.log"));
        fs::write(dir.path().join(DOCKERIGNORE_FILE), "*.log\ndata/\n").unwrap();

        let context = BuildContext::enumerate(dir.path()).unwrap();
        assert_eq!(context.files, vec!["train.py"]);
    }

    #[test]
    fn test_missing_root_is_error() {
        let err = BuildContext::enumerate(Path::new("/nonexistent/project")).unwrap_err();
        assert!(matches!(err, RecipeError::MissingDirectory(_)));
    }

    #[test]
    fn test_exclusion_comments_and_blanks() {
        let list = ExclusionList::parse("# comment\n\n*.pyc\n").unwrap();
        assert!(list.is_excluded(Path::new("mod.pyc")));
        assert!(list.is_excluded(Path::new("pkg/mod.pyc")));
        assert!(!list.is_excluded(Path::new("mod.py")));
    }

    #[test]
    fn test_enumerate_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["z.py", "m.py", "a/q.py"] {
            touch(&dir.path().join(name));
        }
        let first = BuildContext::enumerate(dir.path()).unwrap();
        let second = BuildContext::enumerate(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
