use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use clepho_index::logging;
use clepho_index::tasks::JobManager;
use clepho_index::vectors::EntityKind;
use clepho_index::{Config, Library, SearchOptions};

enum Command {
    Status,
    Rebuild(EntityKind),
    Cluster(EntityKind),
    Search {
        query: String,
        limit: Option<usize>,
        category: Option<String>,
    },
    Dedupe(EntityKind),
    Split(EntityKind, i64),
    Cleanup,
}

struct Args {
    config_path: Option<PathBuf>,
    verbose: bool,
    command: Command,
}

fn parse_kind(value: Option<&String>) -> EntityKind {
    let Some(value) = value else {
        eprintln!("Error: expected one of face, pet, image");
        std::process::exit(1);
    };
    match value.parse() {
        Ok(kind) => kind,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut verbose = false;
    let mut limit = None;
    let mut category = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("clepho-index {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--verbose" | "-v" => verbose = true,
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--limit" | "-n" => match args.get(i + 1).and_then(|v| v.parse::<usize>().ok()) {
                Some(n) => {
                    limit = Some(n);
                    i += 1;
                }
                None => {
                    eprintln!("Error: --limit requires a number");
                    std::process::exit(1);
                }
            },
            "--category" => {
                if i + 1 < args.len() {
                    category = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --category requires a value");
                    std::process::exit(1);
                }
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let command = match positional.first().map(String::as_str) {
        None | Some("status") => Command::Status,
        Some("rebuild") => Command::Rebuild(parse_kind(positional.get(1))),
        Some("cluster") => Command::Cluster(parse_kind(positional.get(1))),
        Some("search") => {
            let query = positional[1..].join(" ");
            if query.trim().is_empty() {
                eprintln!("Error: search requires a query");
                std::process::exit(1);
            }
            Command::Search {
                query,
                limit,
                category,
            }
        }
        Some("dedupe") => Command::Dedupe(parse_kind(positional.get(1))),
        Some("split") => {
            let kind = parse_kind(positional.get(1));
            match positional.get(2).and_then(|v| v.parse::<i64>().ok()) {
                Some(id) => Command::Split(kind, id),
                None => {
                    eprintln!("Error: split requires an identity id");
                    std::process::exit(1);
                }
            }
        }
        Some("cleanup") => Command::Cleanup,
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    Args {
        config_path,
        verbose,
        command,
    }
}

fn print_help() {
    println!(
        r#"clepho-index - maintain the clepho embedding indices

USAGE:
    clepho-index [OPTIONS] [COMMAND]

COMMANDS:
    status                  Show index sizes and store consistency (default)
    rebuild <face|pet|image>
                            Rebuild an index from the record store
    cluster <face|pet>      Re-run identity clustering
    search <query...>       Rank photos for a text query
    dedupe <face|pet>       Merge identities that share a cluster label
    split <face|pet> <id>   Re-cluster one identity and split off outliers
    cleanup                 Delete people and pets with no detections

OPTIONS:
    --config, -c PATH   Path to config file
    --limit, -n N       Maximum number of search results
    --category NAME     Only search photos with this object category
    --verbose, -v       Log to stderr
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    CLEPHO_CONFIG       Path to config file (overrides default location)
    CLEPHO_LOG          Log filter (trace, debug, info, warn, error)
"#
    );
}

fn status(library: &Library) -> Result<()> {
    for stats in library.index().stats() {
        let integrity = library.index().check_integrity(stats.kind);
        let report = library.verify(stats.kind)?;
        println!(
            "{:<6} dim={:<5} metric={:?} size={:<7} dirty={}",
            stats.kind, stats.dimension, stats.metric, stats.size, stats.dirty
        );
        match integrity.reason {
            Some(reason) if !integrity.valid => println!("       files: {}", reason),
            _ => println!("       files: ok ({} vectors on disk)", integrity.vector_count),
        }
        if report.is_consistent() {
            println!("       store: {} embedded, in step", report.store_count);
        } else {
            println!(
                "       store: {} embedded, {} missing from index, {} orphaned in index",
                report.store_count,
                report.missing_from_index.len(),
                report.orphaned_in_index.len()
            );
        }
    }
    Ok(())
}

fn run_job(library: &Library, spawn: impl FnOnce(&mut JobManager) -> Result<()>) -> Result<()> {
    let mut jobs = JobManager::new(library.config().clone(), Arc::clone(library.index()));
    spawn(&mut jobs)?;

    let mut failed = false;
    for done in jobs.wait_all() {
        if done.success {
            println!(
                "{}: {} ({:.1}s)",
                done.kind.display_name(),
                done.message,
                done.elapsed.as_secs_f32()
            );
        } else {
            eprintln!("{} failed: {}", done.kind.display_name(), done.message);
            failed = true;
        }
    }
    if failed {
        bail!("job failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = parse_args();

    logging::init(None, args.verbose)?;
    info!("clepho-index {} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(args.config_path.as_deref()).context("Failed to load config")?;
    let library = Library::open(config)?;

    match args.command {
        Command::Status => status(&library)?,
        Command::Rebuild(kind) => run_job(&library, |jobs| jobs.spawn_rebuild(kind).map(|_| ()))?,
        Command::Cluster(kind) => {
            if !kind.has_identities() {
                bail!("{} records are not clustered", kind);
            }
            run_job(&library, |jobs| jobs.spawn_clustering(kind).map(|_| ()))?
        }
        Command::Search {
            query,
            limit,
            category,
        } => {
            let options = SearchOptions {
                limit,
                object_category: category,
                ..SearchOptions::default()
            };
            let results = library.search(&query, None, &options)?;
            if results.is_empty() {
                println!("No matches");
            }
            for result in results {
                let sources: Vec<&str> = result.sources().iter().map(|s| s.as_str()).collect();
                println!("{:>8}  {:.3}  {}", result.photo_id, result.score, sources.join(","));
            }
        }
        Command::Dedupe(kind) => {
            let merges = library.merge_duplicate_identities(kind)?;
            for merge in &merges {
                println!(
                    "{}: merged {:?} into {} ({} detections)",
                    kind, merge.merged, merge.target, merge.detections_moved
                );
            }
            println!("{}: {} duplicate groups", kind, merges.len());
        }
        Command::Split(kind, id) => {
            let report = library.split_identity(kind, id)?;
            println!(
                "{} {}: {:?}, kept {} of {}, new {:?}, detached {}",
                kind,
                id,
                report.status,
                report.kept,
                report.considered,
                report.new_identities,
                report.unassigned
            );
        }
        Command::Cleanup => {
            for kind in [EntityKind::Face, EntityKind::Pet] {
                let removed = library.cleanup_orphaned(kind)?;
                println!("{}: removed {} empty identities", kind, removed.len());
            }
        }
    }

    if !library.pending_repairs().is_empty() {
        library.repair()?;
    }
    let saved = library.save()?;
    info!("Saved {} indices", saved);
    Ok(())
}
