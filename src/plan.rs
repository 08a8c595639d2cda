use crate::{registry::ResolvedPackage, tree::PackageTree};
use anyhow::Result;
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    path::{Component, Path, PathBuf},
};

/// The winning source for one destination path, with the axes that decided
/// the win kept around for reporting.
#[derive(Debug, Clone)]
pub struct FileChoice {
    pub source: PathBuf,
    pub package_root: PathBuf,
    pub package: String,
    pub order: usize,
    pub priority: i64,
}

/// A destination path claimed as a file by one package and as a directory
/// by another. Resolved by order, surfaced for the user, never fatal.
#[derive(Debug, Clone)]
pub struct ConflictWarning {
    pub relative_path: PathBuf,
    pub file_package: String,
    pub dir_package: String,
    pub file_wins: bool,
}

impl ConflictWarning {
    pub fn message(&self) -> String {
        let (winner, kept) = if self.file_wins {
            (&self.file_package, "file")
        } else {
            (&self.dir_package, "directory")
        };
        format!(
            "{:?} is a file in '{}' but a directory in '{}'; keeping the {} from '{}'",
            self.relative_path, self.file_package, self.dir_package, kept, winner
        )
    }
}

/// Final overlay mapping. Directories are the union across all packages
/// plus every parent of a winning file; files map a relative destination to
/// exactly one source.
#[derive(Debug, Default)]
pub struct DeployPlan {
    pub files: BTreeMap<PathBuf, FileChoice>,
    pub directories: BTreeSet<PathBuf>,
    pub warnings: Vec<ConflictWarning>,
    pub overridden_files: usize,
    pub package_count: usize,
    /// Every contributing package root, kept for the executor's overlap
    /// guard even when a package contributed no files.
    pub package_roots: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone)]
struct DirRecord {
    order: usize,
    package: String,
}

/// Compute the overlay for the given enabled packages, in profile order.
///
/// Later entries win unconditionally over earlier ones; within a single
/// entry, a contribution with a strictly higher priority wins. An exact tie
/// keeps the first record seen.
pub fn build_plan(packages: &[ResolvedPackage]) -> Result<DeployPlan> {
    let mut files: BTreeMap<PathBuf, FileChoice> = BTreeMap::new();
    let mut dirs: BTreeMap<PathBuf, DirRecord> = BTreeMap::new();
    let mut package_roots: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut overridden = 0usize;

    for (order, package) in packages.iter().enumerate() {
        package_roots.insert(package.name.clone(), package.root.clone());
        for contribution in &package.contributions {
            let source_root = join_subpath(&package.root, &contribution.source);
            let dest_prefix = normalize_subpath(&contribution.destination);
            let tree = PackageTree::open(&source_root)?;

            record_dir_chain(&mut dirs, &dest_prefix, order, &package.name);

            for entry in tree.entries() {
                let entry = entry?;
                let dest = dest_prefix.join(&entry.relative_path);
                if entry.is_dir {
                    upsert_dir(&mut dirs, dest, order, &package.name);
                    continue;
                }
                let candidate = FileChoice {
                    source: source_root.join(&entry.relative_path),
                    package_root: package.root.clone(),
                    package: package.name.clone(),
                    order,
                    priority: contribution.priority,
                };
                match files.entry(dest) {
                    Entry::Vacant(slot) => {
                        slot.insert(candidate);
                    }
                    Entry::Occupied(mut slot) => {
                        overridden += 1;
                        let existing = slot.get();
                        let wins = candidate.order > existing.order
                            || (candidate.order == existing.order
                                && candidate.priority > existing.priority);
                        if wins {
                            slot.insert(candidate);
                        }
                    }
                }
            }
        }
    }

    let mut directories = BTreeSet::new();
    let mut warnings = Vec::new();
    for (path, record) in &dirs {
        match files.get(path) {
            Some(choice) => {
                let file_wins = choice.order >= record.order;
                warnings.push(ConflictWarning {
                    relative_path: path.clone(),
                    file_package: choice.package.clone(),
                    dir_package: record.package.clone(),
                    file_wins,
                });
                if !file_wins {
                    directories.insert(path.clone());
                }
            }
            None => {
                directories.insert(path.clone());
            }
        }
    }
    // Drop the losing side entirely: a winning directory evicts the file,
    // a winning file evicts the directory and everything beneath it.
    for warning in &warnings {
        if warning.file_wins {
            let conflicted = &warning.relative_path;
            files.retain(|path, _| path == conflicted || !path.starts_with(conflicted));
            directories.retain(|path| !path.starts_with(conflicted));
        } else {
            files.remove(&warning.relative_path);
        }
    }

    // Winning files may sit under directories no package listed explicitly
    // (FOMOD destination prefixes, mainly).
    let parents: Vec<PathBuf> = files
        .keys()
        .filter_map(|path| path.parent())
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
    for parent in parents {
        let mut current = PathBuf::new();
        for component in parent.components() {
            current.push(component);
            directories.insert(current.clone());
        }
    }

    Ok(DeployPlan {
        files,
        directories,
        warnings,
        overridden_files: overridden,
        package_count: packages.len(),
        package_roots,
    })
}

fn upsert_dir(dirs: &mut BTreeMap<PathBuf, DirRecord>, path: PathBuf, order: usize, package: &str) {
    if path.as_os_str().is_empty() {
        return;
    }
    match dirs.entry(path) {
        Entry::Vacant(slot) => {
            slot.insert(DirRecord {
                order,
                package: package.to_string(),
            });
        }
        Entry::Occupied(mut slot) => {
            if slot.get().order < order {
                slot.insert(DirRecord {
                    order,
                    package: package.to_string(),
                });
            }
        }
    }
}

fn record_dir_chain(
    dirs: &mut BTreeMap<PathBuf, DirRecord>,
    prefix: &Path,
    order: usize,
    package: &str,
) {
    let mut current = PathBuf::new();
    for component in prefix.components() {
        current.push(component);
        upsert_dir(dirs, current.clone(), order, package);
    }
}

/// FOMOD documents use backslash separators and occasionally a leading
/// slash; normalize to a clean relative path.
pub fn normalize_subpath(raw: &str) -> PathBuf {
    let cleaned = raw.replace('\\', "/");
    let mut path = PathBuf::new();
    for component in Path::new(&cleaned).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {}
        }
    }
    path
}

pub fn join_subpath(root: &Path, sub: &str) -> PathBuf {
    let sub = normalize_subpath(sub);
    if sub.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FolderContribution;
    use std::fs;

    fn package(name: &str, root: &Path, contributions: Vec<FolderContribution>) -> ResolvedPackage {
        ResolvedPackage {
            name: name.to_string(),
            root: root.to_path_buf(),
            contributions,
        }
    }

    fn basic(name: &str, root: &Path) -> ResolvedPackage {
        package(name, root, vec![FolderContribution::whole_package()])
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn later_entry_wins_earlier_contributions_merge() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write(&a, "x.txt", "from a");
        write(&a, "dir/a.txt", "from a");
        write(&b, "x.txt", "from b");
        write(&b, "dir/b.txt", "from b");

        let plan = build_plan(&[basic("A", &a), basic("B", &b)]).unwrap();

        assert_eq!(plan.files[Path::new("x.txt")].package, "B");
        assert_eq!(plan.files[Path::new("dir/a.txt")].package, "A");
        assert_eq!(plan.files[Path::new("dir/b.txt")].package, "B");
        assert!(plan.directories.contains(Path::new("dir")));
        assert_eq!(plan.overridden_files, 1);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn priority_breaks_ties_within_one_entry_only() {
        let dir = tempfile::tempdir().unwrap();
        let wizard = dir.path().join("wizard");
        let late = dir.path().join("late");
        write(&wizard, "high/x.txt", "high");
        write(&wizard, "low/x.txt", "low");
        write(&late, "x.txt", "late");

        // Within the entry: priority 5 beats priority 1 even though the
        // low-priority contribution is walked second.
        let plan = build_plan(&[package(
            "Wizard",
            &wizard,
            vec![
                FolderContribution {
                    source: "high".to_string(),
                    destination: String::new(),
                    priority: 5,
                },
                FolderContribution {
                    source: "low".to_string(),
                    destination: String::new(),
                    priority: 1,
                },
            ],
        )])
        .unwrap();
        assert_eq!(plan.files[Path::new("x.txt")].priority, 5);

        // Across entries: profile order dominates regardless of priority.
        let plan = build_plan(&[
            package(
                "Wizard",
                &wizard,
                vec![FolderContribution {
                    source: "high".to_string(),
                    destination: String::new(),
                    priority: 99,
                }],
            ),
            basic("Late", &late),
        ])
        .unwrap();
        assert_eq!(plan.files[Path::new("x.txt")].package, "Late");
    }

    #[test]
    fn exact_tie_keeps_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pkg");
        write(&root, "one/x.txt", "one");
        write(&root, "two/x.txt", "two");

        let plan = build_plan(&[package(
            "Pkg",
            &root,
            vec![
                FolderContribution {
                    source: "one".to_string(),
                    destination: String::new(),
                    priority: 0,
                },
                FolderContribution {
                    source: "two".to_string(),
                    destination: String::new(),
                    priority: 0,
                },
            ],
        )])
        .unwrap();
        assert_eq!(plan.files[Path::new("x.txt")].source, root.join("one/x.txt"));
    }

    #[test]
    fn destination_prefix_lands_contributions_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pkg");
        write(&root, "payload/mesh.bin", "m");

        let plan = build_plan(&[package(
            "Pkg",
            &root,
            vec![FolderContribution {
                source: "payload".to_string(),
                destination: "assets\\meshes".to_string(),
                priority: 0,
            }],
        )])
        .unwrap();
        assert!(plan.files.contains_key(Path::new("assets/meshes/mesh.bin")));
        assert!(plan.directories.contains(Path::new("assets")));
        assert!(plan.directories.contains(Path::new("assets/meshes")));
    }

    #[test]
    fn file_directory_collision_is_warned_and_resolved_by_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write(&a, "thing", "a file named thing");
        write(&b, "thing/inner.txt", "thing is a directory here");

        let plan = build_plan(&[basic("A", &a), basic("B", &b)]).unwrap();
        assert_eq!(plan.warnings.len(), 1);
        let warning = &plan.warnings[0];
        assert_eq!(warning.relative_path, Path::new("thing"));
        assert!(!warning.file_wins);
        assert!(!plan.files.contains_key(Path::new("thing")));
        assert!(plan.directories.contains(Path::new("thing")));

        // Reversed order: the file is later, so it wins, and the losing
        // directory's contents go with it.
        let plan = build_plan(&[basic("B", &b), basic("A", &a)]).unwrap();
        let warning = &plan.warnings[0];
        assert!(warning.file_wins);
        assert!(plan.files.contains_key(Path::new("thing")));
        assert!(!plan.files.contains_key(Path::new("thing/inner.txt")));
        assert!(!plan.directories.contains(Path::new("thing")));
    }

    #[test]
    fn all_order_pairs_resolve_to_later_package() {
        let dir = tempfile::tempdir().unwrap();
        let mut roots = Vec::new();
        for i in 0..4 {
            let root = dir.path().join(format!("pkg{i}"));
            write(&root, "shared.txt", &format!("pkg{i}"));
            roots.push(root);
        }
        let packages: Vec<ResolvedPackage> = roots
            .iter()
            .enumerate()
            .map(|(i, root)| basic(&format!("P{i}"), root))
            .collect();

        for i in 0..packages.len() {
            for j in (i + 1)..packages.len() {
                let plan = build_plan(&[packages[i].clone(), packages[j].clone()]).unwrap();
                assert_eq!(plan.files[Path::new("shared.txt")].package, packages[j].name);
            }
        }
    }
}
