use crate::{error::ModloomError, source::SourceRef};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const BASE_CONTENT_NAME: &str = "Base content";
pub const DEFAULT_PROFILE: &str = "default";

/// Per-game registry document: the authoritative package list, the named
/// profiles ordering them, and the deployment target. One JSON file per
/// game under the app data dir.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameRegistry {
    pub default_mod_folder: PathBuf,
    pub game_mod_folder: PathBuf,
    pub profiles: BTreeMap<String, Vec<ProfileEntry>>,
    pub mods: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

/// One line in a profile: a package reference plus its enabled flag.
/// Position in the containing vector is the override-priority order;
/// later entries beat earlier ones on path conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileEntry {
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "type", default, skip_serializing_if = "EntryKind::is_basic")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<FomodSelection>,
}

impl ProfileEntry {
    pub fn basic(name: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            enabled,
            kind: EntryKind::Basic,
            options: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Basic,
    Fomod,
}

impl Default for EntryKind {
    fn default() -> Self {
        EntryKind::Basic
    }
}

impl EntryKind {
    pub fn is_basic(&self) -> bool {
        matches!(self, EntryKind::Basic)
    }
}

/// Resolved FOMOD wizard output: group key to the folder contributions the
/// chosen plugin(s) bring in. Opaque to the store, consumed by the planner.
pub type FomodSelection = BTreeMap<String, Vec<FolderContribution>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderContribution {
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub priority: i64,
}

impl FolderContribution {
    /// The implicit whole-package contribution of a basic package.
    pub fn whole_package() -> Self {
        Self {
            source: String::new(),
            destination: String::new(),
            priority: 0,
        }
    }
}

/// Planner input: one enabled entry with its package root resolved against
/// the registry.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub name: String,
    pub root: PathBuf,
    pub contributions: Vec<FolderContribution>,
}

impl GameRegistry {
    pub fn new(default_mod_folder: PathBuf, game_mod_folder: PathBuf) -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), Vec::new());
        Self {
            default_mod_folder,
            game_mod_folder,
            profiles,
            mods: BTreeMap::new(),
            sources: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ModloomError::not_found(format!("registry {:?}", path)).into());
        }
        let raw = fs::read_to_string(path).context("read registry")?;
        let registry: GameRegistry =
            serde_json::from_str(&raw).map_err(|err| ModloomError::Schema {
                path: path.to_path_buf(),
                detail: err.to_string(),
            })?;
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create registry dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize registry")?;
        fs::write(path, raw).context("write registry")?;
        Ok(())
    }

    /// Register a package and append it, disabled, to every profile.
    /// All-or-nothing: the duplicate check happens before any mutation.
    pub fn add_package(
        &mut self,
        name: &str,
        source_path: &Path,
        kind: EntryKind,
        options: Option<FomodSelection>,
    ) -> Result<()> {
        if self.mods.contains_key(name) {
            return Err(ModloomError::DuplicateName(name.to_string()).into());
        }
        self.mods.insert(name.to_string(), source_path.to_path_buf());
        for entries in self.profiles.values_mut() {
            entries.push(ProfileEntry {
                name: name.to_string(),
                enabled: false,
                kind,
                options: options.clone(),
            });
        }
        Ok(())
    }

    pub fn entries(&self, profile: &str) -> Result<&[ProfileEntry]> {
        self.profiles
            .get(profile)
            .map(Vec::as_slice)
            .ok_or_else(|| ModloomError::not_found(format!("profile '{profile}'")).into())
    }

    fn entries_mut(&mut self, profile: &str) -> Result<&mut Vec<ProfileEntry>> {
        self.profiles
            .get_mut(profile)
            .ok_or_else(|| ModloomError::not_found(format!("profile '{profile}'")).into())
    }

    /// Flip the enabled flag of one entry; returns the new value.
    pub fn toggle(&mut self, profile: &str, index: usize) -> Result<bool> {
        let entries = self.entries_mut(profile)?;
        let len = entries.len();
        let entry = entries
            .get_mut(index)
            .ok_or(ModloomError::IndexOutOfRange { index, len })?;
        entry.enabled = !entry.enabled;
        Ok(entry.enabled)
    }

    pub fn set_enabled(&mut self, profile: &str, index: usize, enabled: bool) -> Result<()> {
        let entries = self.entries_mut(profile)?;
        let len = entries.len();
        let entry = entries
            .get_mut(index)
            .ok_or(ModloomError::IndexOutOfRange { index, len })?;
        entry.enabled = enabled;
        Ok(())
    }

    /// Swap the entry with its predecessor. Moving the first entry up is a
    /// silent no-op; an index past the end is an error.
    pub fn move_up(&mut self, profile: &str, index: usize) -> Result<()> {
        let entries = self.entries_mut(profile)?;
        let len = entries.len();
        if index >= len {
            return Err(ModloomError::IndexOutOfRange { index, len }.into());
        }
        if index == 0 {
            return Ok(());
        }
        entries.swap(index, index - 1);
        Ok(())
    }

    /// Swap the entry with its successor. Moving the last entry down is a
    /// silent no-op; an index past the end is an error.
    pub fn move_down(&mut self, profile: &str, index: usize) -> Result<()> {
        let entries = self.entries_mut(profile)?;
        let len = entries.len();
        if index >= len {
            return Err(ModloomError::IndexOutOfRange { index, len }.into());
        }
        if index + 1 == len {
            return Ok(());
        }
        entries.swap(index, index + 1);
        Ok(())
    }

    pub fn create_profile(&mut self, name: &str) -> Result<()> {
        if self.profiles.contains_key(name) {
            return Err(ModloomError::DuplicateName(name.to_string()).into());
        }
        self.profiles.insert(name.to_string(), Vec::new());
        Ok(())
    }

    /// Duplicate an existing profile, entries and enablement included.
    pub fn copy_profile(&mut self, from: &str, to: &str) -> Result<()> {
        if self.profiles.contains_key(to) {
            return Err(ModloomError::DuplicateName(to.to_string()).into());
        }
        let entries = self.entries(from)?.to_vec();
        self.profiles.insert(to.to_string(), entries);
        Ok(())
    }

    /// Package paths may be stored relative to the import root.
    pub fn package_root(&self, name: &str) -> Result<PathBuf> {
        let stored = self
            .mods
            .get(name)
            .ok_or_else(|| ModloomError::not_found(format!("package '{name}' in registry")))?;
        if stored.is_absolute() {
            Ok(stored.clone())
        } else {
            Ok(self.default_mod_folder.join(stored))
        }
    }

    /// Resolve the enabled entries of a profile, in order, into planner
    /// input. A dangling package reference or a missing source directory is
    /// a NotFound error.
    pub fn resolve_enabled(&self, profile: &str) -> Result<Vec<ResolvedPackage>> {
        let mut resolved = Vec::new();
        for entry in self.entries(profile)? {
            if !entry.enabled {
                continue;
            }
            let root = self.package_root(&entry.name)?;
            if !root.is_dir() {
                return Err(ModloomError::not_found(format!(
                    "source directory {:?} for package '{}'",
                    root, entry.name
                ))
                .into());
            }
            let contributions = match (&entry.kind, &entry.options) {
                (EntryKind::Fomod, Some(options)) => options
                    .values()
                    .flat_map(|folders| folders.iter().cloned())
                    .collect(),
                _ => vec![FolderContribution::whole_package()],
            };
            resolved.push(ResolvedPackage {
                name: entry.name.clone(),
                root,
                contributions,
            });
        }
        Ok(resolved)
    }

    /// The deployment target must never overlap a package source; linking a
    /// package into itself would corrupt the registry contents.
    pub fn ensure_target_disjoint(&self) -> Result<()> {
        let target = &self.game_mod_folder;
        for name in self.mods.keys() {
            let root = self.package_root(name)?;
            if root == *target || root.starts_with(target) || target.starts_with(&root) {
                bail!(
                    "deployment target {:?} overlaps package '{}' at {:?}",
                    target,
                    name,
                    root
                );
            }
        }
        Ok(())
    }
}
