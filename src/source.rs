use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

const USER_AGENT: &str = "modloom";

/// Persisted source descriptor, stored in the registry's `sources` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    Github {
        repo: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asset: Option<String>,
    },
}

impl SourceRef {
    pub fn label(&self) -> String {
        match self {
            SourceRef::Github { repo, .. } => format!("github:{repo}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseInfo {
    pub version: String,
    pub asset_name: String,
    pub download_url: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// Capability interface over a remote package source. The core only ever
/// sees "latest release" and "download into this directory"; how a variant
/// finds those is its own business.
pub trait RemoteSource {
    fn label(&self) -> String;
    fn resolve_latest(&self) -> Result<ReleaseInfo>;
    fn download(&self, release: &ReleaseInfo, dest_dir: &Path) -> Result<PathBuf>;
}

pub fn connect(source: &SourceRef) -> Box<dyn RemoteSource> {
    match source {
        SourceRef::Github { repo, asset } => Box::new(GithubSource {
            repo: repo.clone(),
            asset: asset.clone(),
        }),
    }
}

pub struct GithubSource {
    repo: String,
    asset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    prerelease: bool,
    assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
    size: Option<u64>,
}

impl RemoteSource for GithubSource {
    fn label(&self) -> String {
        format!("github:{}", self.repo)
    }

    fn resolve_latest(&self) -> Result<ReleaseInfo> {
        let url = format!(
            "https://api.github.com/repos/{}/releases/latest",
            self.repo
        );
        let response = agent(Duration::from_secs(10))
            .get(&url)
            .set("User-Agent", USER_AGENT)
            .call()
            .with_context(|| format!("fetch latest release for {}", self.repo))?;
        let release: Release = response.into_json().context("decode release")?;
        if release.prerelease {
            anyhow::bail!("latest release of {} is a prerelease", self.repo);
        }

        let asset = select_asset(&release.assets, self.asset.as_deref())
            .with_context(|| format!("no matching archive asset in {}", release.tag_name))?;
        let sha256 = fetch_checksums(&release.assets)
            .ok()
            .and_then(|map| map.get(&asset.name).cloned());

        Ok(ReleaseInfo {
            version: release.tag_name.trim_start_matches('v').to_string(),
            asset_name: asset.name.clone(),
            download_url: asset.browser_download_url.clone(),
            size: asset.size,
            sha256,
        })
    }

    fn download(&self, release: &ReleaseInfo, dest_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir).context("create download dir")?;
        let path = dest_dir.join(&release.asset_name);

        if path.exists() {
            if let (Some(expected), Ok(meta)) = (release.size, fs::metadata(&path)) {
                if meta.len() == expected {
                    return Ok(path);
                }
            }
        }

        let response = agent(Duration::from_secs(60))
            .get(&release.download_url)
            .set("User-Agent", USER_AGENT)
            .call()
            .context("download asset")?;
        let mut reader = response.into_reader();
        let mut file = File::create(&path).context("create asset file")?;
        io::copy(&mut reader, &mut file).context("write asset file")?;
        drop(file);

        if let Some(expected) = &release.sha256 {
            verify_sha256(&path, expected)?;
        }
        Ok(path)
    }
}

fn agent(read_timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(read_timeout)
        .timeout_write(read_timeout)
        .build()
}

/// Prefer an asset matching the configured name fragment, otherwise the
/// first archive-looking asset.
fn select_asset<'a>(assets: &'a [Asset], wanted: Option<&str>) -> Option<&'a Asset> {
    if let Some(fragment) = wanted {
        let fragment = fragment.to_lowercase();
        if let Some(asset) = assets
            .iter()
            .find(|asset| asset.name.to_lowercase().contains(&fragment))
        {
            return Some(asset);
        }
    }
    assets.iter().find(|asset| {
        let name = asset.name.to_lowercase();
        name.ends_with(".zip") || name.ends_with(".7z") || name.ends_with(".rar")
    })
}

fn fetch_checksums(assets: &[Asset]) -> Result<HashMap<String, String>> {
    let checksum_asset = assets
        .iter()
        .find(|asset| asset.name == "SHA256SUMS.txt")
        .context("missing SHA256SUMS")?;
    let response = agent(Duration::from_secs(10))
        .get(&checksum_asset.browser_download_url)
        .set("User-Agent", USER_AGENT)
        .call()
        .context("download SHA256SUMS")?;
    let body = response.into_string().context("read SHA256SUMS")?;
    let mut map = HashMap::new();
    for line in body.lines() {
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        map.insert(name.to_string(), hash.to_lowercase());
    }
    Ok(map)
}

fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut file = File::open(path).context("open asset for checksum")?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if actual != expected.to_lowercase() {
        anyhow::bail!("checksum mismatch for {}", path.display());
    }
    Ok(())
}
