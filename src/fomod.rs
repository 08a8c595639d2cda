use crate::{
    error::ModloomError,
    registry::{FolderContribution, FomodSelection},
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::Path};

/// The subset of a FOMOD `ModuleConfig.xml` the engine cares about: the
/// module name and the optional file groups whose chosen plugins contribute
/// folders. Conditional flags, images, and the wizard presentation are
/// collaborator concerns and are ignored here.
#[derive(Debug, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "moduleName")]
    pub module_name: String,
    #[serde(rename = "installSteps", default)]
    pub install_steps: Vec<InstallStepList>,
}

#[derive(Debug, Deserialize)]
pub struct InstallStepList {
    #[serde(rename = "@order", default)]
    pub order: Option<String>,
    #[serde(rename = "installStep", default)]
    pub steps: Vec<InstallStep>,
}

#[derive(Debug, Deserialize)]
pub struct InstallStep {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "optionalFileGroups", default)]
    pub file_groups: Vec<GroupList>,
}

#[derive(Debug, Deserialize)]
pub struct GroupList {
    #[serde(rename = "group", default)]
    pub groups: Vec<Group>,
}

#[derive(Debug, Deserialize)]
pub struct Group {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type", default)]
    pub group_type: Option<String>,
    #[serde(rename = "plugins", default)]
    pub plugin_lists: Vec<PluginList>,
}

#[derive(Debug, Deserialize)]
pub struct PluginList {
    #[serde(rename = "plugin", default)]
    pub plugins: Vec<Plugin>,
}

#[derive(Debug, Deserialize)]
pub struct Plugin {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "files", default)]
    pub files: Vec<Files>,
}

#[derive(Debug, Deserialize)]
pub struct Files {
    #[serde(rename = "folder", default)]
    pub folders: Vec<FolderNode>,
}

#[derive(Debug, Deserialize)]
pub struct FolderNode {
    #[serde(rename = "@source")]
    pub source: String,
    #[serde(rename = "@destination", default)]
    pub destination: String,
    #[serde(rename = "@priority", default)]
    pub priority: i64,
}

impl ModuleConfig {
    /// Read `<package>/fomod/ModuleConfig.xml`.
    pub fn load(package_root: &Path) -> Result<Self> {
        let path = package_root.join("fomod").join("ModuleConfig.xml");
        if !path.exists() {
            return Err(ModloomError::not_found(format!("{:?}", path)).into());
        }
        let raw = fs::read_to_string(&path).context("read ModuleConfig.xml")?;
        let config: ModuleConfig =
            quick_xml::de::from_str(&raw).context("parse ModuleConfig.xml")?;
        Ok(config)
    }

    /// Resolve group choices into the flat contribution map the planner
    /// consumes. `choices` maps group name to plugin name; a group without
    /// an explicit choice takes its first plugin. A choice naming an
    /// unknown group or plugin is a NotFound error.
    pub fn resolve(&self, choices: &BTreeMap<String, String>) -> Result<FomodSelection> {
        let mut selection = FomodSelection::new();
        let mut known_groups = Vec::new();

        for step_list in &self.install_steps {
            for (step_index, step) in step_list.steps.iter().enumerate() {
                for group_list in &step.file_groups {
                    for group in &group_list.groups {
                        known_groups.push(group.name.clone());
                        let plugin = match pick_plugin(group, choices.get(&group.name)) {
                            Some(plugin) => plugin,
                            None => {
                                if let Some(wanted) = choices.get(&group.name) {
                                    return Err(ModloomError::not_found(format!(
                                        "plugin '{}' in group '{}'",
                                        wanted, group.name
                                    ))
                                    .into());
                                }
                                continue;
                            }
                        };
                        let folders: Vec<FolderContribution> = plugin
                            .files
                            .iter()
                            .flat_map(|files| files.folders.iter())
                            .map(|folder| FolderContribution {
                                source: folder.source.clone(),
                                destination: folder.destination.clone(),
                                priority: folder.priority,
                            })
                            .collect();
                        if folders.is_empty() {
                            continue;
                        }
                        let key = format!("{step_index}{}", group.name);
                        selection.entry(key).or_default().extend(folders);
                    }
                }
            }
        }

        for group_name in choices.keys() {
            if !known_groups.iter().any(|known| known == group_name) {
                return Err(
                    ModloomError::not_found(format!("option group '{group_name}'")).into(),
                );
            }
        }

        Ok(selection)
    }
}

fn pick_plugin<'a>(group: &'a Group, wanted: Option<&String>) -> Option<&'a Plugin> {
    let mut plugins = group
        .plugin_lists
        .iter()
        .flat_map(|list| list.plugins.iter());
    match wanted {
        Some(name) => plugins.find(|plugin| plugin.name == *name),
        None => plugins.next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<config>
  <moduleName>Fancy Swords</moduleName>
  <installSteps order="Explicit">
    <installStep name="Choose style">
      <optionalFileGroups order="Explicit">
        <group name="Blade" type="SelectExactlyOne">
          <plugins order="Explicit">
            <plugin name="Steel">
              <description>Plain steel.</description>
              <files>
                <folder source="steel" destination="weapons" priority="1"/>
              </files>
            </plugin>
            <plugin name="Obsidian">
              <description>Dark glass.</description>
              <files>
                <folder source="obsidian" destination="weapons" priority="2"/>
                <folder source="obsidian_fx" destination="effects"/>
              </files>
            </plugin>
          </plugins>
        </group>
        <group name="Extras" type="SelectAny">
          <plugins order="Explicit">
            <plugin name="Scabbards">
              <files>
                <folder source="scabbards" destination=""/>
              </files>
            </plugin>
          </plugins>
        </group>
      </optionalFileGroups>
    </installStep>
  </installSteps>
</config>
"#;

    fn write_sample(root: &Path) {
        let fomod_dir = root.join("fomod");
        fs::create_dir_all(&fomod_dir).unwrap();
        fs::write(fomod_dir.join("ModuleConfig.xml"), SAMPLE).unwrap();
    }

    #[test]
    fn parses_module_config() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path());
        let config = ModuleConfig::load(dir.path()).unwrap();
        assert_eq!(config.module_name, "Fancy Swords");
        let step = &config.install_steps[0].steps[0];
        assert_eq!(step.name, "Choose style");
        assert_eq!(step.file_groups[0].groups.len(), 2);
    }

    #[test]
    fn missing_config_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModuleConfig::load(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModloomError>(),
            Some(ModloomError::NotFound(_))
        ));
    }

    #[test]
    fn resolve_honors_explicit_choice() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path());
        let config = ModuleConfig::load(dir.path()).unwrap();

        let mut choices = BTreeMap::new();
        choices.insert("Blade".to_string(), "Obsidian".to_string());
        let selection = config.resolve(&choices).unwrap();

        let blade = &selection["0Blade"];
        assert_eq!(blade.len(), 2);
        assert_eq!(blade[0].source, "obsidian");
        assert_eq!(blade[0].destination, "weapons");
        assert_eq!(blade[0].priority, 2);
        assert_eq!(blade[1].priority, 0);

        // Unchosen group defaults to its first plugin.
        assert_eq!(selection["0Extras"][0].source, "scabbards");
    }

    #[test]
    fn resolve_rejects_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path());
        let config = ModuleConfig::load(dir.path()).unwrap();

        let mut choices = BTreeMap::new();
        choices.insert("Blade".to_string(), "Mithril".to_string());
        assert!(config.resolve(&choices).is_err());

        let mut choices = BTreeMap::new();
        choices.insert("NoSuchGroup".to_string(), "Steel".to_string());
        assert!(config.resolve(&choices).is_err());
    }
}
