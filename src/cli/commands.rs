//! Command dispatch
//!
//! Every command builds a [`ServiceContainer`] for the directory of the map
//! it works on, so the map-local config applies.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use clap::CommandFactory;
use clap_complete::generate;
use generational_arena::Index;
use tracing::{debug, instrument};

use crate::application::ApplicationError;
use crate::application::services::{
    current_identity, LoadOutcome, LockManager, LockStatus, MapController, NewNodeMode,
};
use crate::cli::args::{Cli, Commands, ConfigCommands, LockCommands};
use crate::cli::error::{CliError, CliResult};
use crate::cli::output;
use crate::config::{global_config_path, local_config_path, ConversionPolicy, Settings};
use crate::domain::{LockState, TreeNodeConvert};
use crate::infrastructure::di::ServiceContainer;
use crate::infrastructure::prompt::FixedConversionPrompt;
use crate::infrastructure::traits::{FileSystem, RealCommandRunner, RealFileSystem};
use crate::infrastructure::InfraError;
use crate::preferences::Preferences;

pub fn execute_command(cli: &Cli) -> CliResult<()> {
    match &cli.command {
        Some(Commands::Show { file }) => cmd_show(cli, file),
        Some(Commands::Classify { file }) => cmd_classify(cli, file),
        Some(Commands::Migrate { file, output }) => cmd_migrate(cli, file, output.as_deref()),
        Some(Commands::Add {
            file,
            text,
            parent,
            index,
        }) => cmd_add(cli, file, text, parent.as_deref(), *index),
        Some(Commands::Delete { file, id }) => cmd_delete(cli, file, id),
        Some(Commands::Lock { command }) => match command {
            LockCommands::Status { file } => cmd_lock_status(cli, file),
            LockCommands::Clear { file } => cmd_lock_clear(cli, file),
        },
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Show { dir } => cmd_config_show(dir.as_deref()),
            ConfigCommands::Template => {
                output::info(&Settings::template());
                Ok(())
            }
            ConfigCommands::Path => cmd_config_path(),
        },
        Some(Commands::Completion { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        None => Err(CliError::Usage("no command given, see --help".to_string())),
    }
}

// ============================================================
// Container
// ============================================================

/// Policy forced by `--convert` / `--as-is`.
fn forced_policy(cli: &Cli) -> Option<ConversionPolicy> {
    if cli.convert {
        Some(ConversionPolicy::Convert)
    } else if cli.as_is {
        Some(ConversionPolicy::AsIs)
    } else {
        None
    }
}

/// Build the services for working on `file`.
///
/// A forced policy bypasses the stored preferences and is not remembered.
fn container_for(cli: &Cli, file: &Path) -> CliResult<ServiceContainer> {
    let map_dir = file.parent().filter(|d| !d.as_os_str().is_empty());
    let mut settings = Settings::load(map_dir)?;

    let Some(policy) = forced_policy(cli) else {
        return Ok(ServiceContainer::new(settings)?);
    };
    settings.convert_unknown_versions = policy;
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let preferences = Arc::new(Preferences::in_memory(fs.clone(), &settings));
    let identity = current_identity(settings.user_name.as_deref())?;
    Ok(ServiceContainer::with_deps(
        settings,
        fs,
        Arc::new(RealCommandRunner),
        preferences,
        identity,
        Arc::new(FixedConversionPrompt::new(policy == ConversionPolicy::Convert)),
    )?)
}

fn report_notices(outcome: &LoadOutcome) {
    for notice in &outcome.notices {
        if notice.is_informational() {
            output::detail(notice);
        } else {
            output::warning(notice);
        }
    }
}

/// Release the lock a load took for a command that does not keep the map open.
fn release_if_owned(services: &ServiceContainer, outcome: &LoadOutcome) -> CliResult<()> {
    if let (LockState::Owned, Some(file)) = (outcome.map.lock_state(), outcome.map.file()) {
        services.locks.release(file)?;
    }
    Ok(())
}

/// Refuse to edit the error placeholder of a document that did not parse.
fn ensure_parsed(services: &ServiceContainer, outcome: &LoadOutcome, file: &Path) -> CliResult<()> {
    if !outcome.parse_failed() {
        return Ok(());
    }
    release_if_owned(services, outcome)?;
    Err(CliError::Usage(format!(
        "{} could not be parsed, leaving it untouched",
        file.display()
    )))
}

// ============================================================
// Map commands
// ============================================================

#[instrument(skip(cli))]
fn cmd_show(cli: &Cli, file: &Path) -> CliResult<()> {
    let services = container_for(cli, file)?;
    let outcome = services.loader.load(file)?;
    report_notices(&outcome);
    output::header(&format!("{} ({})", outcome.map.title(), outcome.version));
    output::info(&outcome.map.tree().to_tree_string());
    release_if_owned(&services, &outcome)
}

#[instrument(skip(cli))]
fn cmd_classify(cli: &Cli, file: &Path) -> CliResult<()> {
    let services = container_for(cli, file)?;
    if !services.fs.is_file(file) {
        return Err(ApplicationError::FileNotFound(file.to_path_buf()).into());
    }
    let class = services.migrator.classify_file(file)?;
    output::action("version", &class);
    Ok(())
}

#[instrument(skip(cli))]
fn cmd_migrate(cli: &Cli, file: &Path, target: Option<&Path>) -> CliResult<()> {
    let services = container_for(cli, file)?;
    let raw = services
        .fs
        .read(file)
        .map_err(|e| InfraError::io(format!("read {}", file.display()), e))?;
    let migrated = services.migrator.migrate(&raw)?;
    debug!("cmd_migrate: {} -> {} bytes", raw.len(), migrated.len());

    match target {
        Some(path) => {
            services
                .fs
                .write_atomic(path, &migrated)
                .map_err(|e| InfraError::io(format!("write {}", path.display()), e))?;
            output::success(&format!("wrote {}", path.display()));
        }
        None => io::stdout()
            .write_all(&migrated)
            .map_err(|e| InfraError::io("write stdout", e))?,
    }
    Ok(())
}

#[instrument(skip(cli))]
fn cmd_add(
    cli: &Cli,
    file: &Path,
    text: &str,
    parent_id: Option<&str>,
    index: Option<usize>,
) -> CliResult<()> {
    let services = container_for(cli, file)?;
    let outcome = services.loader.load(file)?;
    report_notices(&outcome);
    ensure_parsed(&services, &outcome, file)?;
    let mut controller = services.controller(outcome.map);

    let added = add_node(&mut controller, text, parent_id, index);
    if added.is_err() {
        controller.close(true)?;
    }
    let id = added?;
    if !controller.close(false)? {
        return Err(CliError::Usage(format!("{} was not saved", file.display())));
    }
    output::success(&format!("added {} to {}", id, file.display()));
    Ok(())
}

fn add_node(
    controller: &mut MapController,
    text: &str,
    parent_id: Option<&str>,
    index: Option<usize>,
) -> CliResult<String> {
    let parent = match parent_id {
        Some(id) => find_node(controller, id)?,
        None => controller.map().require_root()?,
    };
    let node = match index {
        Some(i) => controller.add_new_node_at(parent, i, text, None)?,
        None => {
            controller.set_focus(parent)?;
            controller.add_new_node(NewNodeMode::Child, text)?
        }
    };
    Ok(controller.map().data(node)?.id.clone())
}

fn find_node(controller: &MapController, id: &str) -> CliResult<Index> {
    controller
        .map()
        .tree()
        .find_by_id(id)
        .ok_or_else(|| CliError::InvalidArgs(format!("no node with ID {}", id)))
}

#[instrument(skip(cli))]
fn cmd_delete(cli: &Cli, file: &Path, id: &str) -> CliResult<()> {
    let services = container_for(cli, file)?;
    let outcome = services.loader.load(file)?;
    report_notices(&outcome);
    ensure_parsed(&services, &outcome, file)?;
    let mut controller = services.controller(outcome.map);

    let deleted = find_node(&controller, id).and_then(|node| Ok(controller.delete_node(node)?));
    if deleted.is_err() {
        controller.close(true)?;
    }
    let index = deleted?;
    if !controller.close(false)? {
        return Err(CliError::Usage(format!("{} was not saved", file.display())));
    }
    output::success(&format!("deleted {} (was child #{})", id, index));
    Ok(())
}

// ============================================================
// Lock commands
// ============================================================

#[instrument(skip(cli))]
fn cmd_lock_status(cli: &Cli, file: &Path) -> CliResult<()> {
    let services = container_for(cli, file)?;
    let lock_path = LockManager::lock_path_for(file);
    match services.locks.status(file)? {
        LockStatus::Free => output::action("free", &file.display()),
        LockStatus::Owned(r) | LockStatus::HeldBy(r) => {
            output::action("locked", &format!("by {} ({})", r.user, lock_path.display()));
            if let (Some(host), Some(pid)) = (r.host.as_deref(), r.pid) {
                output::detail(&format!("host {} pid {}", host, pid));
            }
            output::detail(&format!("since {}", r.created_at.to_rfc3339()));
        }
        LockStatus::Stale(r) => output::action(
            "stale",
            &format!("left by {} ({})", r.user, lock_path.display()),
        ),
        LockStatus::Unreadable => output::action("unreadable", &lock_path.display()),
    }
    Ok(())
}

/// Remove a stale or unreadable lock by acquiring and releasing it.
#[instrument(skip(cli))]
fn cmd_lock_clear(cli: &Cli, file: &Path) -> CliResult<()> {
    let services = container_for(cli, file)?;
    if let Some(holder) = services.locks.try_to_lock(file)? {
        output::failure(&format!("{} is locked by {}", file.display(), holder));
        return Err(CliError::Usage(format!(
            "lock of {} is held by a live session",
            file.display()
        )));
    }
    if let Some(old) = services.locks.pop_locking_user_of_old_lock() {
        output::success_detail(&format!("removed stale lock of {}", old));
    }
    services.locks.release(file)?;
    output::success(&format!("{} is unlocked", file.display()));
    Ok(())
}

// ============================================================
// Config commands
// ============================================================

fn cmd_config_show(dir: Option<&Path>) -> CliResult<()> {
    let cwd = std::env::current_dir().map_err(|e| InfraError::io("get current dir", e))?;
    let settings = Settings::load(Some(dir.unwrap_or(cwd.as_path())))?;
    output::info(&settings.to_toml()?);
    Ok(())
}

fn cmd_config_path() -> CliResult<()> {
    let cwd = std::env::current_dir().map_err(|e| InfraError::io("get current dir", e))?;
    output::header("Config paths");
    match global_config_path() {
        Some(path) => output::detail(&format!("global: {}", path.display())),
        None => output::detail("global: (no config directory)"),
    }
    output::detail(&format!("local:  {}", local_config_path(&cwd).display()));
    Ok(())
}
