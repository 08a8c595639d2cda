use crate::{
    config::{AppConfig, Session},
    config, deploy, fomod,
    importer,
    plan::build_plan,
    registry::{EntryKind, GameRegistry, ProfileEntry, BASE_CONTENT_NAME, DEFAULT_PROFILE},
    source::{self, SourceRef},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

struct GlobalOptions {
    format: OutputFormat,
    game: Option<String>,
    profile: Option<String>,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (globals, rest) = split_globals(&args)?;

    let mut words = rest.iter().map(String::as_str);
    let command = words.next().unwrap_or("help");
    let tail: Vec<&str> = words.collect();

    match command {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("modloom v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "games" => run_games(&globals, &tail),
        "profiles" => run_profiles(&globals, &tail),
        "mods" => run_mods(&globals, &tail),
        "sources" => run_sources(&globals, &tail),
        "deploy" => run_deploy(&globals, &tail),
        "clear" => run_clear(&globals),
        "status" => run_status(&globals),
        other => bail!("unknown command '{other}' (try 'modloom help')"),
    }
}

fn split_globals(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut globals = GlobalOptions {
        format: OutputFormat::Text,
        game: None,
        profile: None,
    };
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => globals.format = OutputFormat::Json,
            "--game" => {
                globals.game = Some(
                    iter.next()
                        .context("--game requires a game name")?
                        .clone(),
                );
            }
            "--profile" => {
                globals.profile = Some(
                    iter.next()
                        .context("--profile requires a profile name")?
                        .clone(),
                );
            }
            _ => rest.push(arg.clone()),
        }
    }
    Ok((globals, rest))
}

struct CliContext {
    config: AppConfig,
    session: Session,
    registry: GameRegistry,
    registry_path: PathBuf,
}

impl CliContext {
    fn load(globals: &GlobalOptions) -> Result<Self> {
        let config = AppConfig::load_or_create()?;
        let game = globals
            .game
            .clone()
            .or_else(|| config.last_game.clone())
            .context("no game selected; register one with 'modloom games add' or pass --game")?;
        let registry_path = config::registry_path(&game)?;
        let registry = GameRegistry::load(&registry_path)
            .with_context(|| format!("load game '{game}'"))?;

        let wanted = globals
            .profile
            .clone()
            .or_else(|| config.last_profile.clone());
        let profile = match wanted {
            Some(name) if registry.profiles.contains_key(&name) => name,
            Some(name) if globals.profile.is_some() => bail!("no profile named '{name}'"),
            _ => registry
                .profiles
                .keys()
                .find(|key| key.as_str() == DEFAULT_PROFILE)
                .or_else(|| registry.profiles.keys().next())
                .context("registry has no profiles")?
                .clone(),
        };

        Ok(Self {
            config,
            session: Session::new(game, profile),
            registry,
            registry_path,
        })
    }

    fn finish(mut self) -> Result<()> {
        if self.session.dirty {
            self.registry.save(&self.registry_path)?;
        }
        self.session.remember(&mut self.config);
        self.config.save()
    }
}

fn run_games(globals: &GlobalOptions, args: &[&str]) -> Result<()> {
    match args.first().copied() {
        Some("add") => {
            let name = args.get(1).context("usage: games add <name> <mod-folder>")?;
            let target = args.get(2).context("usage: games add <name> <mod-folder>")?;
            games_add(name, Path::new(target))
        }
        Some("list") | None => games_list(globals),
        Some(other) => bail!("unknown games subcommand '{other}'"),
    }
}

/// Register a game: snapshot whatever is in the target folder right now as
/// the "Base content" package, so a later clear+deploy can always restore
/// the unmodded state.
fn games_add(name: &str, target: &Path) -> Result<()> {
    if !target.is_dir() {
        bail!("game mod folder {:?} does not exist", target);
    }
    let registry_path = config::registry_path(name)?;
    if registry_path.exists() {
        bail!("game '{name}' is already registered");
    }

    let game_folder = target
        .parent()
        .context("game mod folder has no parent")?;
    let staging_root = game_folder.join(".mods");
    fs::create_dir_all(&staging_root).context("create staging root")?;

    let mut registry = GameRegistry::new(staging_root.clone(), target.to_path_buf());

    let has_content = fs::read_dir(target)
        .context("read game mod folder")?
        .next()
        .is_some();
    if has_content {
        let base_content = staging_root.join("base_content");
        importer::copy_dir(target, &base_content)?;
        registry.add_package(BASE_CONTENT_NAME, &base_content, EntryKind::Basic, None)?;
        registry.set_enabled(DEFAULT_PROFILE, 0, true)?;
    }

    registry.save(&registry_path)?;

    let mut config = AppConfig::load_or_create()?;
    config.last_game = Some(name.to_string());
    config.last_profile = Some(DEFAULT_PROFILE.to_string());
    config.save()?;

    println!("Registered game '{name}' deploying to {:?}", target);
    if has_content {
        println!("Snapshotted existing content as '{BASE_CONTENT_NAME}'");
    }
    Ok(())
}

fn games_list(globals: &GlobalOptions) -> Result<()> {
    let games_dir = config::games_dir()?;
    let mut names = Vec::new();
    if games_dir.is_dir() {
        for entry in fs::read_dir(&games_dir).context("read games dir")? {
            let entry = entry.context("read games dir entry")?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().to_string());
                }
            }
        }
    }
    names.sort();

    if globals.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }
    if names.is_empty() {
        println!("No games registered");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn run_profiles(globals: &GlobalOptions, args: &[&str]) -> Result<()> {
    let mut ctx = CliContext::load(globals)?;
    match args.first().copied() {
        Some("list") | None => {
            let rows: Vec<&String> = ctx.registry.profiles.keys().collect();
            if globals.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for name in rows {
                    let marker = if *name == ctx.session.profile { "*" } else { " " };
                    println!("{marker} {name}");
                }
            }
        }
        Some("create") => {
            let name = args.get(1).context("usage: profiles create <name>")?;
            ctx.registry.create_profile(name)?;
            ctx.session.profile = name.to_string();
            ctx.session.mark_dirty();
            println!("Created profile '{name}'");
        }
        Some("copy") => {
            let from = args.get(1).context("usage: profiles copy <from> <to>")?;
            let to = args.get(2).context("usage: profiles copy <from> <to>")?;
            ctx.registry.copy_profile(from, to)?;
            ctx.session.profile = to.to_string();
            ctx.session.mark_dirty();
            println!("Copied profile '{from}' to '{to}'");
        }
        Some("use") => {
            let name = args.get(1).context("usage: profiles use <name>")?;
            if !ctx.registry.profiles.contains_key(*name) {
                bail!("no profile named '{name}'");
            }
            ctx.session.profile = name.to_string();
            println!("Active profile is now '{name}'");
        }
        Some(other) => bail!("unknown profiles subcommand '{other}'"),
    }
    ctx.finish()
}

#[derive(Serialize)]
struct ModRow {
    index: usize,
    enabled: bool,
    name: String,
    kind: String,
    path: String,
}

fn run_mods(globals: &GlobalOptions, args: &[&str]) -> Result<()> {
    let mut ctx = CliContext::load(globals)?;
    match args.first().copied() {
        Some("list") | None => {
            mods_list(globals, &ctx)?;
        }
        Some("add") => {
            let name = args.get(1).context("usage: mods add <name> <folder>")?;
            let folder = args.get(2).context("usage: mods add <name> <folder>")?;
            let path = Path::new(folder);
            if !path.is_dir() {
                bail!("mod folder {:?} does not exist", path);
            }
            ctx.registry
                .add_package(name, path, EntryKind::Basic, None)?;
            ctx.session.mark_dirty();
            println!("Added '{name}'");
        }
        Some("import") => {
            let (path, name) = parse_import_args(&args[1..])?;
            let staging = ctx.registry.default_mod_folder.clone();
            let outcome = importer::import_path(Path::new(path), &staging, name)?;
            ctx.registry
                .add_package(&outcome.name, &outcome.path, EntryKind::Basic, None)?;
            ctx.session.mark_dirty();
            println!("Imported '{}' to {:?}", outcome.name, outcome.path);
        }
        Some("fomod") => {
            mods_fomod(&mut ctx, &args[1..])?;
        }
        Some("toggle") => {
            let index = parse_index(args.get(1), "mods toggle <index>")?;
            let enabled = ctx.registry.toggle(&ctx.session.profile, index)?;
            ctx.session.mark_dirty();
            println!("{}", if enabled { "Enabled" } else { "Disabled" });
        }
        Some("enable") => {
            let index = parse_index(args.get(1), "mods enable <index>")?;
            ctx.registry
                .set_enabled(&ctx.session.profile, index, true)?;
            ctx.session.mark_dirty();
            println!("Enabled");
        }
        Some("disable") => {
            let index = parse_index(args.get(1), "mods disable <index>")?;
            ctx.registry
                .set_enabled(&ctx.session.profile, index, false)?;
            ctx.session.mark_dirty();
            println!("Disabled");
        }
        Some("move-up") => {
            let index = parse_index(args.get(1), "mods move-up <index>")?;
            ctx.registry.move_up(&ctx.session.profile, index)?;
            ctx.session.mark_dirty();
            mods_list(globals, &ctx)?;
        }
        Some("move-down") => {
            let index = parse_index(args.get(1), "mods move-down <index>")?;
            ctx.registry.move_down(&ctx.session.profile, index)?;
            ctx.session.mark_dirty();
            mods_list(globals, &ctx)?;
        }
        Some(other) => bail!("unknown mods subcommand '{other}'"),
    }
    ctx.finish()
}

fn parse_import_args<'a>(args: &[&'a str]) -> Result<(&'a str, Option<&'a str>)> {
    let mut path = None;
    let mut name = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "--name" => name = Some(*iter.next().context("--name requires a value")?),
            value if path.is_none() => path = Some(value),
            other => bail!("unexpected argument '{other}'"),
        }
    }
    Ok((path.context("usage: mods import <path> [--name <name>]")?, name))
}

/// Import a FOMOD package: parse its ModuleConfig.xml, resolve the chosen
/// options into folder contributions, and register the result.
fn mods_fomod(ctx: &mut CliContext, args: &[&str]) -> Result<()> {
    let mut folder = None;
    let mut name = None;
    let mut choices: BTreeMap<String, String> = BTreeMap::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "--name" => name = Some(iter.next().context("--name requires a value")?.to_string()),
            "--choose" => {
                let raw = iter.next().context("--choose requires Group=Plugin")?;
                let (group, plugin) = raw
                    .split_once('=')
                    .context("--choose expects Group=Plugin")?;
                choices.insert(group.to_string(), plugin.to_string());
            }
            value if folder.is_none() => folder = Some(PathBuf::from(value)),
            other => bail!("unexpected argument '{other}'"),
        }
    }
    let folder = folder.context("usage: mods fomod <folder> [--name <name>] [--choose Group=Plugin]")?;

    let module = fomod::ModuleConfig::load(&folder)?;
    let selection = module.resolve(&choices)?;
    let name = name.unwrap_or_else(|| module.module_name.clone());

    ctx.registry
        .add_package(&name, &folder, EntryKind::Fomod, Some(selection))?;
    ctx.session.mark_dirty();
    println!("Added FOMOD package '{name}'");
    Ok(())
}

fn mods_list(globals: &GlobalOptions, ctx: &CliContext) -> Result<()> {
    let entries = ctx.registry.entries(&ctx.session.profile)?;
    let rows: Vec<ModRow> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| ModRow {
            index,
            enabled: entry.enabled,
            name: entry.name.clone(),
            kind: kind_label(entry).to_string(),
            path: ctx
                .registry
                .package_root(&entry.name)
                .map(|path| path.to_string_lossy().to_string())
                .unwrap_or_else(|_| "<dangling>".to_string()),
        })
        .collect();

    if globals.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("Profile '{}' has no mods", ctx.session.profile);
        return Ok(());
    }
    for row in rows {
        let marker = if row.enabled { "x" } else { " " };
        println!("{:>3} [{marker}] {:<30} {:<6} {}", row.index, row.name, row.kind, row.path);
    }
    Ok(())
}

fn kind_label(entry: &ProfileEntry) -> &'static str {
    match entry.kind {
        EntryKind::Basic => "basic",
        EntryKind::Fomod => "fomod",
    }
}

#[derive(Serialize)]
struct DeployRow {
    path: String,
    package: String,
}

fn run_deploy(globals: &GlobalOptions, args: &[&str]) -> Result<()> {
    let dry_run = args.contains(&"--dry-run");
    let ctx = CliContext::load(globals)?;
    ctx.registry.ensure_target_disjoint()?;

    let packages = ctx.registry.resolve_enabled(&ctx.session.profile)?;
    let plan = build_plan(&packages)?;

    for warning in &plan.warnings {
        eprintln!("warning: {}", warning.message());
    }

    if dry_run {
        let rows: Vec<DeployRow> = plan
            .files
            .iter()
            .map(|(path, choice)| DeployRow {
                path: path.to_string_lossy().to_string(),
                package: choice.package.clone(),
            })
            .collect();
        if globals.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            for row in &rows {
                println!("{:<50} <- {}", row.path, row.package);
            }
            println!(
                "{} file(s) from {} package(s), {} conflict warning(s)",
                rows.len(),
                plan.package_count,
                plan.warnings.len()
            );
        }
        return ctx.finish();
    }

    let report = deploy::commit(&plan, &ctx.registry.game_mod_folder)?;
    println!(
        "Deployed {} file(s) in {} dir(s) from {} package(s) ({}; removed {} stale, {} overridden)",
        report.file_count,
        report.dir_count,
        report.package_count,
        report.link_mode_summary,
        report.removed_count,
        report.overridden_files
    );
    ctx.finish()
}

fn run_clear(globals: &GlobalOptions) -> Result<()> {
    let ctx = CliContext::load(globals)?;
    let removed = deploy::clear(&ctx.registry.game_mod_folder)?;
    println!(
        "Removed {removed} entr{} from {:?}",
        if removed == 1 { "y" } else { "ies" },
        ctx.registry.game_mod_folder
    );
    ctx.finish()
}

fn run_status(globals: &GlobalOptions) -> Result<()> {
    let ctx = CliContext::load(globals)?;
    let entries = ctx.registry.entries(&ctx.session.profile)?;
    let enabled = entries.iter().filter(|entry| entry.enabled).count();
    if globals.format == OutputFormat::Json {
        let status = serde_json::json!({
            "game": ctx.session.game,
            "profile": ctx.session.profile,
            "target": ctx.registry.game_mod_folder,
            "mods": entries.len(),
            "enabled": enabled,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Game:    {}", ctx.session.game);
        println!("Profile: {}", ctx.session.profile);
        println!("Target:  {:?}", ctx.registry.game_mod_folder);
        println!("Mods:    {} ({} enabled)", entries.len(), enabled);
    }
    ctx.finish()
}

fn run_sources(globals: &GlobalOptions, args: &[&str]) -> Result<()> {
    let mut ctx = CliContext::load(globals)?;
    match args.first().copied() {
        Some("list") | None => {
            for (index, source) in ctx.registry.sources.iter().enumerate() {
                println!("{index:>3} {}", source.label());
            }
            if ctx.registry.sources.is_empty() {
                println!("No sources configured");
            }
        }
        Some("add") => {
            let repo = args.get(1).context("usage: sources add <owner/repo> [--asset <fragment>]")?;
            let asset = match args.get(2).copied() {
                Some("--asset") => Some(
                    args.get(3)
                        .context("--asset requires a value")?
                        .to_string(),
                ),
                Some(other) => bail!("unexpected argument '{other}'"),
                None => None,
            };
            ctx.registry.sources.push(SourceRef::Github {
                repo: repo.to_string(),
                asset,
            });
            ctx.session.mark_dirty();
            println!("Added source github:{repo}");
        }
        Some("check") => {
            for source_ref in &ctx.registry.sources {
                let remote = source::connect(source_ref);
                match remote.resolve_latest() {
                    Ok(release) => println!(
                        "{}: v{} ({})",
                        remote.label(),
                        release.version,
                        release.asset_name
                    ),
                    Err(err) => eprintln!("{}: {err:#}", remote.label()),
                }
            }
        }
        Some("fetch") => {
            let index = parse_index(args.get(1), "sources fetch <index>")?;
            let source_ref = ctx
                .registry
                .sources
                .get(index)
                .with_context(|| format!("no source at index {index}"))?
                .clone();
            let remote = source::connect(&source_ref);
            let release = remote.resolve_latest()?;
            let downloads = ctx.registry.default_mod_folder.join("downloads");
            let archive = remote.download(&release, &downloads)?;
            println!("Downloaded {:?}", archive);

            let staging = ctx.registry.default_mod_folder.clone();
            let outcome = importer::import_path(&archive, &staging, None)?;
            ctx.registry
                .add_package(&outcome.name, &outcome.path, EntryKind::Basic, None)?;
            ctx.session.mark_dirty();
            println!("Imported '{}' to {:?}", outcome.name, outcome.path);
        }
        Some(other) => bail!("unknown sources subcommand '{other}'"),
    }
    ctx.finish()
}

fn parse_index(raw: Option<&&str>, usage: &str) -> Result<usize> {
    raw.with_context(|| format!("usage: {usage}"))?
        .parse::<usize>()
        .with_context(|| format!("usage: {usage}"))
}

fn print_help() {
    println!("modloom - profile-based mod overlay manager");
    println!();
    println!("Usage: modloom [--game <name>] [--profile <name>] [--json] <command>");
    println!();
    println!("Commands:");
    println!("  games add <name> <mod-folder>    Register a game (snapshots current content)");
    println!("  games list                       List registered games");
    println!("  profiles list|create|copy|use    Manage profiles");
    println!("  mods list                        Show the active profile's mod order");
    println!("  mods add <name> <folder>         Register an extracted mod folder");
    println!("  mods import <path> [--name N]    Import a folder or zip/7z/rar archive");
    println!("  mods fomod <folder> [--choose Group=Plugin]...");
    println!("                                   Register a FOMOD package with chosen options");
    println!("  mods toggle|enable|disable <i>   Change an entry's enabled flag");
    println!("  mods move-up|move-down <i>       Reorder entries (later entries override)");
    println!("  deploy [--dry-run]               Clear the target and link the enabled mods");
    println!("  clear                            Empty the target folder");
    println!("  status                           Show the active game/profile summary");
    println!("  sources list|add|check|fetch     Manage remote package sources");
}
