mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;

use advlock::LockStatus;
use manio::ManifestReader;
use phase3::Phase3Config;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Phase3Config> {
    match path {
        Some(path) => {
            let config = Phase3Config::load(path)?;
            tracing::info!("Using config: {}", path.display());
            Ok(config)
        }
        None => Ok(Phase3Config::default()),
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Reconcile {
            changed,
            unchanged,
            manifest_dir,
            global_dir,
        } => {
            let stats = phase3::reconcile(
                ManifestReader::open(&changed),
                ManifestReader::open(&unchanged),
                &manifest_dir,
                &global_dir,
                &config,
            )
            .map_err(|e| anyhow::anyhow!("{e} ({:?})", e.kind()))?;
            println!(
                "{} entries ({} changed, {} unchanged, {} superseded), {} signatures",
                stats.entries,
                stats.from_changed,
                stats.from_unchanged,
                stats.superseded,
                stats.signatures
            );
            println!(
                "local index: {} records from {} hook files; global index: {} records",
                stats.local_hooks,
                stats.hook_files,
                stats.global.written()
            );
        }
        Commands::Merge { a, b, out } => {
            let stats = sparse::merge_sparse_indexes(
                &a,
                b.as_deref(),
                &out,
                config.manifest.sync,
            )
            .with_context(|| format!("merging into {}", out.display()))?;
            println!(
                "{} records ({} from first, {} from second, {} collapsed)",
                stats.written(),
                stats.from_left,
                stats.from_right,
                stats.collapsed
            );
        }
        Commands::LockStatus { path } => match advlock::probe(&path)? {
            LockStatus::Free => println!("free"),
            LockStatus::Held => match advlock::read_holder(&path)? {
                Some(holder) => println!("held by {} (pid {})", holder.name, holder.pid),
                None => println!("held"),
            },
        },
        Commands::Dump { path } => {
            let hooks = sparse::read_index(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            for hook in &hooks {
                let fps: Vec<String> = hook.iter().map(|fp| fp.to_string()).collect();
                println!("{}\t{}", String::from_utf8_lossy(&hook.path), fps.join(" "));
            }
        }
    }
    Ok(())
}
