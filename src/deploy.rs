use crate::{error::ModloomError, plan::DeployPlan};
use anyhow::{bail, Context, Result};
use filetime::{set_file_mtime, FileTime};
#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use walkdir::WalkDir;

pub struct DeployReport {
    pub package_count: usize,
    pub file_count: usize,
    pub dir_count: usize,
    pub removed_count: usize,
    pub overridden_files: usize,
    pub link_mode_summary: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkMode {
    Hardlink,
    Copy,
}

impl LinkMode {
    pub fn label(self) -> &'static str {
        match self {
            LinkMode::Hardlink => "hardlink",
            LinkMode::Copy => "copy",
        }
    }
}

/// Decides hardlink vs copy once per package root by comparing filesystem
/// ids against the target, and remembers which modes were actually used.
struct LinkModeCache {
    target_dev: u64,
    modes: HashMap<PathBuf, LinkMode>,
    used: HashSet<LinkMode>,
}

impl LinkModeCache {
    fn new(target: &Path) -> Result<Self> {
        let target_dev = filesystem_id(target)?;
        Ok(Self {
            target_dev,
            modes: HashMap::new(),
            used: HashSet::new(),
        })
    }

    fn mode_for(&mut self, package_root: &Path) -> Result<LinkMode> {
        if let Some(mode) = self.modes.get(package_root) {
            return Ok(*mode);
        }
        let source_dev = filesystem_id(package_root)?;
        let mode = if source_dev == self.target_dev {
            LinkMode::Hardlink
        } else {
            LinkMode::Copy
        };
        self.modes.insert(package_root.to_path_buf(), mode);
        Ok(mode)
    }

    fn record(&mut self, mode: LinkMode) {
        self.used.insert(mode);
    }

    fn summary(&self) -> String {
        match self.used.iter().next() {
            None => "none".to_string(),
            Some(mode) if self.used.len() == 1 => mode.label().to_string(),
            Some(_) => "mixed".to_string(),
        }
    }
}

#[cfg(unix)]
fn filesystem_id(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)
        .with_context(|| format!("stat {:?}", path))?
        .dev())
}

#[cfg(not(unix))]
fn filesystem_id(path: &Path) -> Result<u64> {
    let _ = path;
    Ok(0)
}

/// Remove everything under the target, deepest-first, leaving the target
/// itself present and empty. Returns the number of entries removed.
pub fn clear(target: &Path) -> Result<usize> {
    if !target.exists() {
        fs::create_dir_all(target).context("create target dir")?;
        return Ok(0);
    }
    let mut removed = 0usize;
    for entry in WalkDir::new(target)
        .follow_links(false)
        .min_depth(1)
        .contents_first(true)
    {
        let entry = entry.context("walk target dir")?;
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        result.map_err(|err| ModloomError::deploy(entry.path(), err))?;
        removed += 1;
    }
    Ok(removed)
}

/// Materialize the plan into the target: directories first, then one link
/// or copy per winning file. Existing entries at a destination are removed
/// before placement, so re-running the same plan is idempotent. The first
/// failure aborts; files placed before it stay put.
pub fn deploy(plan: &DeployPlan, target: &Path) -> Result<DeployReport> {
    ensure_plan_disjoint(plan, target)?;
    fs::create_dir_all(target).context("create target dir")?;
    let mut link_modes = LinkModeCache::new(target)?;

    for dir in &plan.directories {
        let path = target.join(dir);
        fs::create_dir_all(&path).map_err(|err| ModloomError::deploy(path.clone(), err))?;
    }

    for (rel, choice) in &plan.files {
        let dest = target.join(rel);
        remove_existing(&dest)?;
        let mode = link_modes.mode_for(&choice.package_root)?;
        let used = place_file(&choice.source, &dest, mode)?;
        link_modes.record(used);
    }

    Ok(DeployReport {
        package_count: plan.package_count,
        file_count: plan.files.len(),
        dir_count: plan.directories.len(),
        removed_count: 0,
        overridden_files: plan.overridden_files,
        link_mode_summary: link_modes.summary(),
        warnings: plan.warnings.iter().map(|warning| warning.message()).collect(),
    })
}

/// The normal commit operation: wipe the target, then deploy fresh.
pub fn commit(plan: &DeployPlan, target: &Path) -> Result<DeployReport> {
    let removed = clear(target)?;
    let mut report = deploy(plan, target)?;
    report.removed_count = removed;
    Ok(report)
}

fn ensure_plan_disjoint(plan: &DeployPlan, target: &Path) -> Result<()> {
    let canonical_target = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
    for (name, root) in &plan.package_roots {
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());
        if canonical_root == canonical_target
            || canonical_root.starts_with(&canonical_target)
            || canonical_target.starts_with(&canonical_root)
        {
            bail!(
                "refusing to deploy: target {:?} overlaps package '{}' at {:?}",
                target,
                name,
                root
            );
        }
    }
    Ok(())
}

fn remove_existing(dest: &Path) -> Result<()> {
    let Ok(meta) = fs::symlink_metadata(dest) else {
        return Ok(());
    };
    let result = if meta.file_type().is_dir() {
        fs::remove_dir_all(dest)
    } else {
        fs::remove_file(dest)
    };
    result.map_err(|err| ModloomError::deploy(dest, err))?;
    Ok(())
}

fn place_file(source: &Path, dest: &Path, mode: LinkMode) -> Result<LinkMode> {
    match mode {
        LinkMode::Hardlink => match fs::hard_link(source, dest) {
            Ok(()) => Ok(LinkMode::Hardlink),
            // The device-id probe can be wrong on bind mounts; fall back.
            Err(err) if is_cross_device(&err) => copy_file(source, dest),
            Err(err) => Err(ModloomError::deploy(dest, err).into()),
        },
        LinkMode::Copy => copy_file(source, dest),
    }
}

fn copy_file(source: &Path, dest: &Path) -> Result<LinkMode> {
    fs::copy(source, dest).map_err(|err| ModloomError::deploy(dest, err))?;
    preserve_mtime(source, dest);
    Ok(LinkMode::Copy)
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    // EXDEV
    err.raw_os_error() == Some(18)
}

#[cfg(not(unix))]
fn is_cross_device(err: &io::Error) -> bool {
    let _ = err;
    false
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, 0);
    let _ = set_file_mtime(dest, mtime);
}
