use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

/// App-wide settings: which game and profile were last active. Registry
/// documents themselves live one-per-game under `games/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub last_game: Option<String>,
    #[serde(default)]
    pub last_profile: Option<String>,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }
}

/// What the current invocation operates on. Replaces the original design's
/// ambient globals: every store operation receives this explicitly, and
/// `dirty` decides whether the registry gets rewritten on exit.
#[derive(Debug, Clone)]
pub struct Session {
    pub game: String,
    pub profile: String,
    pub dirty: bool,
}

impl Session {
    pub fn new(game: String, profile: String) -> Self {
        Self {
            game,
            profile,
            dirty: false,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn remember(&self, config: &mut AppConfig) {
        config.last_game = Some(self.game.clone());
        config.last_profile = Some(self.profile.clone());
    }
}

pub fn games_dir() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("games"))
}

pub fn registry_path(game: &str) -> Result<PathBuf> {
    Ok(games_dir()?.join(format!("{game}.json")))
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modloom"))
}
