//! Cradle CLI - inspect filesystem archives the way a run sees them
//!
//! Usage:
//!   cradle ls project.tar.gz           List extracted paths and sizes
//!   cradle ls --json project.tar.gz    Dump the whole filesystem map
//!   cradle cat project.tar.gz /main.py Print one file

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cradle::fs::normalize_path;
use cradle::{FileSystemMap, extract_archive};

/// Cradle - load `.tar.gz` archives into a run's virtual filesystem
#[derive(Parser, Debug)]
#[command(name = "cradle")]
#[command(about = "Inspect archives as seeded Cradle filesystems")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the files an archive seeds
    Ls {
        /// Gzip-compressed tar archive
        archive: PathBuf,
        /// Print the filesystem map as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print one file from an archive
    Cat {
        /// Gzip-compressed tar archive
        archive: PathBuf,
        /// Path inside the archive
        path: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let mut stdout = io::stdout().lock();

    match args.command {
        Command::Ls { archive, json } => {
            let fs = load(&archive)?;
            if json {
                serde_json::to_writer_pretty(&mut stdout, &fs)?;
                writeln!(stdout)?;
            } else {
                for entry in fs.iter() {
                    writeln!(stdout, "{:>10}  {}", entry.content().len(), entry.name())?;
                }
            }
        }
        Command::Cat { archive, path } => {
            let fs = load(&archive)?;
            let path = normalize_path(&path);
            let Some(entry) = fs.get(&path) else {
                bail!("{}: no such file in {}", path, archive.display());
            };
            stdout.write_all(entry.content().as_bytes())?;
        }
    }

    stdout.flush()?;
    Ok(())
}

fn load(archive: &Path) -> Result<FileSystemMap> {
    let bytes =
        std::fs::read(archive).with_context(|| format!("failed to read {}", archive.display()))?;
    let fs = extract_archive(&bytes)
        .with_context(|| format!("failed to extract {}", archive.display()))?;
    tracing::debug!(archive = %archive.display(), files = fs.len(), "loaded archive");
    Ok(fs)
}
