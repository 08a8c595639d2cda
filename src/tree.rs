use crate::error::ModloomError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One entry of a package's source tree, relative to the package root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub relative_path: PathBuf,
    pub is_dir: bool,
}

/// Read-only view over one package directory. Enumeration is lazy and never
/// touches anything outside the root.
#[derive(Debug)]
pub struct PackageTree {
    root: PathBuf,
}

impl PackageTree {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ModloomError::not_found(format!(
                "package directory {:?}",
                root
            ))
            .into());
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every descendant of the root, lexicographic by relative path. The
    /// root itself is not reported.
    pub fn entries(&self) -> impl Iterator<Item = Result<TreeEntry>> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_junk_path(entry.path()))
            .filter(|entry| match entry {
                Ok(entry) => entry.depth() > 0,
                Err(_) => true,
            })
            .map(move |entry| {
                let entry = entry.context("walk package tree")?;
                let relative_path = entry
                    .path()
                    .strip_prefix(&self.root)
                    .context("rel path")?
                    .to_path_buf();
                Ok(TreeEntry {
                    relative_path,
                    is_dir: entry.file_type().is_dir(),
                })
            })
    }
}

pub fn is_junk_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
            || part == ".svn"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walks_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/sub")).unwrap();
        fs::write(dir.path().join("b/sub/file.txt"), b"x").unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let tree = PackageTree::open(dir.path()).unwrap();
        let entries: Vec<TreeEntry> = tree.entries().collect::<Result<_>>().unwrap();
        let paths: Vec<&Path> = entries
            .iter()
            .map(|entry| entry.relative_path.as_path())
            .collect();
        assert_eq!(
            paths,
            vec![
                Path::new("a.txt"),
                Path::new("b"),
                Path::new("b/sub"),
                Path::new("b/sub/file.txt"),
            ]
        );
        assert!(entries[1].is_dir);
        assert!(!entries[3].is_dir);
    }

    #[test]
    fn missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = PackageTree::open(&dir.path().join("gone")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModloomError>(),
            Some(ModloomError::NotFound(_))
        ));
    }

    #[test]
    fn skips_junk_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("__MACOSX")).unwrap();
        fs::write(dir.path().join("__MACOSX/junk"), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        let tree = PackageTree::open(dir.path()).unwrap();
        let entries: Vec<TreeEntry> = tree.entries().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, Path::new("keep.txt"));
    }
}
