//! tile-depot - A persistent tile pyramid cache.
//!
//! This binary prepares, lists and maintains a tile database.

use clap::Parser;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile_depot::{
    config::{Cli, Command, DeleteArgs, GlobalOptions, ListArgs, PrepareArgs, DEFAULT_PREPARE_SCALES},
    job::JobHandleGroup,
    store::{Database, FileEntry},
    DatabaseCoordinator, FsImageSource, TileError,
};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    if let Err(e) = cli.global.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Prepare(args) => run_prepare(&cli.global, args),
        Command::List(args) => run_list(&cli.global, args),
        Command::Cleanup => run_cleanup(&cli.global),
        Command::Delete(args) => run_delete(&cli.global, args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tile_depot=debug"
    } else {
        "tile_depot=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn start_coordinator(global: &GlobalOptions) -> Result<DatabaseCoordinator, String> {
    let database = Database::open(&global.database_config())
        .map_err(|e| format!("Failed to open database {}: {}", global.database.display(), e))?;

    DatabaseCoordinator::spawn(database, Arc::new(FsImageSource::new()), &global.coordinator_config())
        .map_err(|e| format!("Failed to start coordinator: {}", e))
}

fn shutdown(coordinator: DatabaseCoordinator) {
    coordinator.flush().wait();
    coordinator.stop_thread();
    coordinator.join_thread();
}

/// Plain paths are stored in absolute form so the same file always maps to
/// the same entry.
fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        return url.to_string();
    }
    std::fs::canonicalize(url)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| url.to_string())
}

// =============================================================================
// Prepare Command
// =============================================================================

fn run_prepare(global: &GlobalOptions, args: PrepareArgs) -> Result<(), String> {
    let coordinator = start_coordinator(global)?;

    let (tx, rx) = flume::unbounded();
    for url in &args.urls {
        let url = normalize_url(url);
        let tx = tx.clone();
        let key = url.clone();
        coordinator.request_file(
            url,
            move |result| {
                let _ = tx.send((key, result));
            },
            |_| {},
        );
    }
    drop(tx);

    let generated = Arc::new(AtomicUsize::new(0));
    let mut group = JobHandleGroup::new();
    let mut failed_files = 0;

    for (url, result) in rx.iter() {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                error!(url = %url, "Cannot resolve: {}", e);
                failed_files += 1;
                continue;
            }
        };

        let max_scale = entry.max_scale();
        let min_scale = if args.all {
            0
        } else {
            max_scale.saturating_sub(DEFAULT_PREPARE_SCALES - 1)
        };

        info!(url = %url, size = %entry.size(), min_scale, max_scale, "Preparing");
        let counter = generated.clone();
        group.add(coordinator.request_tiles(&entry, min_scale, max_scale, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }

    group.wait();
    let failed_jobs = group.failed_count();
    shutdown(coordinator);

    println!(
        "Prepared {} file(s), generated {} tile(s)",
        args.urls.len() - failed_files,
        generated.load(Ordering::Relaxed)
    );

    if failed_files > 0 || failed_jobs > 0 {
        return Err(format!(
            "{} file(s) could not be resolved, {} tile job(s) failed",
            failed_files, failed_jobs
        ));
    }
    Ok(())
}

// =============================================================================
// List Command
// =============================================================================

fn fetch_entries(coordinator: &DatabaseCoordinator, patterns: &[String]) -> Result<Vec<FileEntry>, String> {
    let (tx, rx) = flume::unbounded();

    if patterns.is_empty() {
        coordinator.request_all_files(move |result| {
            let _ = tx.send(result);
        });
    } else {
        for pattern in patterns {
            let tx = tx.clone();
            coordinator.request_files_by_pattern(pattern.clone(), move |result| {
                let _ = tx.send(result);
            });
        }
        drop(tx);
    }

    // Patterns may overlap; list every entry once.
    let mut entries = BTreeMap::new();
    for result in rx.iter() {
        let found = result.map_err(|e: TileError| format!("Failed to list files: {}", e))?;
        for entry in found {
            entries.insert(entry.url().to_string(), entry);
        }
    }
    Ok(entries.into_values().collect())
}

fn run_list(global: &GlobalOptions, args: ListArgs) -> Result<(), String> {
    let coordinator = start_coordinator(global)?;
    let entries = fetch_entries(&coordinator, &args.patterns);
    shutdown(coordinator);

    for entry in entries? {
        if args.json {
            let line = serde_json::to_string(&entry).map_err(|e| format!("Failed to encode entry: {}", e))?;
            println!("{}", line);
        } else {
            println!(
                "{:>6}  {:>11}  {:>3}  {}",
                entry.id().get(),
                entry.size().to_string(),
                entry.max_scale(),
                entry.url()
            );
        }
    }
    Ok(())
}

// =============================================================================
// Cleanup Command
// =============================================================================

fn run_cleanup(global: &GlobalOptions) -> Result<(), String> {
    let mut database = Database::open(&global.database_config())
        .map_err(|e| format!("Failed to open database {}: {}", global.database.display(), e))?;

    database.cleanup().map_err(|e| format!("Cleanup failed: {}", e))?;
    info!(path = %global.database.display(), "Database compacted");
    Ok(())
}

// =============================================================================
// Delete Command
// =============================================================================

fn run_delete(global: &GlobalOptions, args: DeleteArgs) -> Result<(), String> {
    let coordinator = start_coordinator(global)?;

    let entries = match fetch_entries(&coordinator, &[]) {
        Ok(entries) => entries,
        Err(e) => {
            shutdown(coordinator);
            return Err(e);
        }
    };

    let mut missing = 0;
    let mut group = JobHandleGroup::new();
    for url in &args.urls {
        let normalized = normalize_url(url);
        let entry = entries
            .iter()
            .find(|entry| entry.url() == normalized || entry.url() == url.as_str());

        match entry {
            Some(entry) => {
                info!(url = entry.url(), "Deleting");
                group.add(coordinator.delete_file_entry(entry.id()));
            }
            None => {
                warn!(url = %url, "Not in the database");
                missing += 1;
            }
        }
    }

    group.wait();
    let failed = group.failed_count();
    shutdown(coordinator);

    println!("Deleted {} file(s)", group.len() - failed);
    if failed > 0 {
        return Err(format!("{} deletion(s) failed", failed));
    }
    if missing > 0 && missing == args.urls.len() {
        return Err("Nothing to delete".to_string());
    }
    Ok(())
}
