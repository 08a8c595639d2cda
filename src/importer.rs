use crate::tree::is_junk_path;
use anyhow::{bail, Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use walkdir::WalkDir;

#[derive(Debug)]
pub struct ImportOutcome {
    pub name: String,
    pub path: PathBuf,
}

/// Import a mod folder or archive into the staging root (the registry's
/// `default_mod_folder`). Archives are extracted through a temp dir so a
/// failed extraction never leaves a half-written package behind.
pub fn import_path(
    path: &Path,
    staging_root: &Path,
    name_override: Option<&str>,
) -> Result<ImportOutcome> {
    if !path.exists() {
        bail!("import source {:?} does not exist", path);
    }

    let name = match name_override {
        Some(name) => name.to_string(),
        None => default_name(path)?,
    };
    let dest = staging_root.join(&name);
    if dest.exists() {
        bail!("import destination {:?} already exists", dest);
    }

    if path.is_dir() {
        copy_dir(path, &dest)?;
        return Ok(ImportOutcome { name, path: dest });
    }

    let temp_dir = make_temp_dir(staging_root, "import")?;
    let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let extracted = if ext.eq_ignore_ascii_case("zip") {
        extract_zip(path, &temp_dir)
    } else if ext.eq_ignore_ascii_case("7z") || ext.eq_ignore_ascii_case("rar") {
        extract_7z(path, &temp_dir)
    } else {
        let _ = fs::remove_dir_all(&temp_dir);
        bail!("unsupported archive type '.{ext}' for {:?}", path);
    };
    if let Err(err) = extracted {
        let _ = fs::remove_dir_all(&temp_dir);
        return Err(err);
    }

    let payload = collapse_single_root(&temp_dir);
    let result = move_or_copy_dir(&payload, &dest);
    let _ = fs::remove_dir_all(&temp_dir);
    result?;
    Ok(ImportOutcome { name, path: dest })
}

fn default_name(path: &Path) -> Result<String> {
    let stem = if path.is_dir() {
        path.file_name()
    } else {
        path.file_stem()
    };
    stem.map(|name| name.to_string_lossy().to_string())
        .context("derive package name from path")
}

/// Archives often wrap everything in a single top-level folder; unwrap one
/// level so the package root is the payload itself.
fn collapse_single_root(dir: &Path) -> PathBuf {
    let Ok(entries) = fs::read_dir(dir) else {
        return dir.to_path_buf();
    };
    let entries: Vec<_> = entries.filter_map(Result::ok).collect();
    if entries.len() == 1 && entries[0].path().is_dir() {
        return entries[0].path();
    }
    dir.to_path_buf()
}

pub fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_junk_path(entry.path()))
    {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source).context("rel path")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).context("create dir")?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create file dir")?;
            }
            fs::copy(entry.path(), &target).context("copy file")?;
            preserve_mtime(entry.path(), &target);
        }
    }
    Ok(())
}

fn move_or_copy_dir(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context("create staging parent")?;
    }
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(_) => copy_dir(source, dest),
    }
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

fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    match extract_with_7z(path, dest) {
        Ok(Some(())) => return Ok(()),
        Ok(None) => {}
        Err(err) => return Err(err),
    }

    let file = fs::File::open(path).context("open zip")?;
    let mut archive = zip::ZipArchive::new(file).context("read zip")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry")?;
        let Some(out_path) = file.enclosed_name() else {
            continue;
        };

        let out_path = dest.join(out_path);
        if file.is_dir() {
            fs::create_dir_all(&out_path).context("create zip dir")?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create zip dir")?;
        }

        let mut out_file = fs::File::create(&out_path).context("write zip entry")?;
        io::copy(&mut file, &mut out_file).context("extract zip entry")?;
        if let Some(dt) = file.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                let mtime = FileTime::from_unix_time(mtime, 0);
                let _ = set_file_mtime(&out_path, mtime);
            }
        }
    }

    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    Some(datetime.unix_timestamp())
}

fn extract_7z(path: &Path, dest: &Path) -> Result<()> {
    match extract_with_7z(path, dest) {
        Ok(Some(())) => Ok(()),
        Ok(None) => sevenz_rust::decompress_file(path, dest)
            .with_context(|| format!("extract 7z archive {path:?}")),
        Err(err) => Err(err),
    }
}

/// A system 7z handles more formats (rar, odd zips) and is faster; fall
/// back to the in-process extractors when it is not installed.
fn extract_with_7z(path: &Path, dest: &Path) -> Result<Option<()>> {
    let mut command = Command::new("7z");
    let output = command
        .arg("x")
        .arg("-y")
        .arg(format!("-o{}", dest.display()))
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("launch 7z"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("7z extraction failed: {}", stderr.trim()));
    }

    Ok(Some(()))
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn make_temp_dir(staging_root: &Path, suffix: &str) -> Result<PathBuf> {
    let temp_root = staging_root.join("tmp");
    fs::create_dir_all(&temp_root).context("create temp root")?;

    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_dir = temp_root.join(format!("{suffix}-{nanos}-{counter}"));
    fs::create_dir_all(&temp_dir).context("create temp dir")?;
    Ok(temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn imports_plain_folder_by_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("My Mod");
        fs::create_dir_all(source.join("data")).unwrap();
        fs::write(source.join("data/file.txt"), b"x").unwrap();
        let staging = dir.path().join("staging");

        let outcome = import_path(&source, &staging, None).unwrap();
        assert_eq!(outcome.name, "My Mod");
        assert!(outcome.path.join("data/file.txt").exists());
        // Source is untouched.
        assert!(source.join("data/file.txt").exists());
    }

    #[test]
    fn rejects_existing_destination_and_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("pkg");
        fs::create_dir_all(&source).unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir_all(staging.join("pkg")).unwrap();
        assert!(import_path(&source, &staging, None).is_err());

        let odd = dir.path().join("mod.tar.xz");
        fs::write(&odd, b"not an archive").unwrap();
        assert!(import_path(&odd, &staging, None).is_err());
    }

    #[test]
    fn imports_zip_and_collapses_single_root() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("wrapped.zip");
        let file = fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options: zip::write::SimpleFileOptions = Default::default();
        writer.add_directory("Wrapped Mod/", options).unwrap();
        writer
            .start_file("Wrapped Mod/readme.txt", options)
            .unwrap();
        writer.write_all(b"hello").unwrap();
        writer
            .start_file("Wrapped Mod/data/asset.bin", options)
            .unwrap();
        writer.write_all(b"bin").unwrap();
        writer.finish().unwrap();

        let staging = dir.path().join("staging");
        let outcome = import_path(&archive_path, &staging, Some("Neat")).unwrap();
        assert_eq!(outcome.name, "Neat");
        assert_eq!(
            fs::read_to_string(outcome.path.join("readme.txt")).unwrap(),
            "hello"
        );
        assert!(outcome.path.join("data/asset.bin").exists());
        // The wrapper directory was unwrapped.
        assert!(!outcome.path.join("Wrapped Mod").exists());
    }

    #[test]
    fn accepts_mixed_case_archive_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("Tidy.Zip");
        let file = fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options: zip::write::SimpleFileOptions = Default::default();
        writer.start_file("readme.txt", options).unwrap();
        writer.write_all(b"hi").unwrap();
        writer.finish().unwrap();

        let staging = dir.path().join("staging");
        let outcome = import_path(&archive_path, &staging, None).unwrap();
        assert_eq!(outcome.name, "Tidy");
        assert!(outcome.path.join("readme.txt").exists());
    }
}
