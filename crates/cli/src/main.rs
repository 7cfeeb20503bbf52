//! calltree: build weighted call trees from folded-stack captures and report
//! the hottest functions and modules.

mod output;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, info};

use calltree_core::parsers::{CollapsedOptions, parse_auto};
use calltree_core::{CallTree, FunctionTable, NodeId, StackSample};

/// Ids are handed out from disjoint ranges so merged trees keep a usable index.
const IDS_PER_FILE: NodeId = 1 << 32;

#[derive(Parser, Debug)]
#[command(name = "calltree")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge one or more captures and list the top functions and modules
    Report {
        /// Folded-stack files (`frame;frame;... count`)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Number of functions to list
        #[arg(long, default_value = "20")]
        top: usize,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,

        /// Microseconds represented by one sample count
        #[arg(long, default_value = "1000")]
        interval_us: u64,

        /// Ingestion threads per file
        #[arg(long, default_value = "4")]
        workers: usize,
    },

    /// Print the call tree structure
    Tree {
        file: PathBuf,

        #[arg(long, default_value = "1000")]
        interval_us: u64,
    },

    /// Show every instance of a function and their combined totals
    Function {
        file: PathBuf,

        /// Function name, optionally `module!name`
        name: String,

        /// Print the stack of each instance
        #[arg(long)]
        stacks: bool,

        #[arg(long, default_value = "1000")]
        interval_us: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Report {
            files,
            top,
            json,
            interval_us,
            workers,
        } => {
            let functions = FunctionTable::new();
            let options = collapsed_options(interval_us);
            let mut merged: Option<CallTree> = None;

            for (index, path) in files.iter().enumerate() {
                let samples = load_samples(path, &functions, &options)?;
                let start_id = IDS_PER_FILE * index as NodeId;
                let tree = build_tree(&samples, workers, start_id);
                info!("{}: {tree}", path.display());

                merged = Some(match merged.take() {
                    Some(mut target) => {
                        target.merge_with(tree);
                        target
                    }
                    None => tree,
                });
            }

            let Some(tree) = merged else {
                bail!("no input files");
            };
            if json {
                output::write_json_report(&mut out, &tree, top)?;
            } else {
                output::write_text_report(&mut out, &tree, top)?;
            }
        }
        Commands::Tree { file, interval_us } => {
            let tree = load_tree(&file, interval_us)?;
            write!(out, "{}", tree.print())?;
        }
        Commands::Function {
            file,
            name,
            stacks,
            interval_us,
        } => {
            let tree = load_tree(&file, interval_us)?;
            output::write_function(&mut out, &tree, &name, stacks)?;
        }
    }

    out.flush()?;
    Ok(())
}

fn collapsed_options(interval_us: u64) -> CollapsedOptions {
    CollapsedOptions {
        sample_interval: Duration::from_micros(interval_us),
        ..CollapsedOptions::default()
    }
}

fn load_samples(
    path: &Path,
    functions: &FunctionTable,
    options: &CollapsedOptions,
) -> Result<Vec<StackSample>> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let samples = parse_auto(&data, functions, options)
        .with_context(|| format!("parsing {}", path.display()))?;
    debug!("{}: {} samples", path.display(), samples.len());
    Ok(samples)
}

fn load_tree(path: &Path, interval_us: u64) -> Result<CallTree> {
    let functions = FunctionTable::new();
    let samples = load_samples(path, &functions, &collapsed_options(interval_us))?;
    Ok(build_tree(&samples, 1, 0))
}

/// Ingest `samples` into a fresh tree using `workers` threads.
fn build_tree(samples: &[StackSample], workers: usize, start_id: NodeId) -> CallTree {
    let tree = CallTree::with_start_id(start_id);
    let chunk_size = samples.len().div_ceil(workers.max(1)).max(1);

    std::thread::scope(|scope| {
        for chunk in samples.chunks(chunk_size) {
            let tree = &tree;
            scope.spawn(move || {
                for sample in chunk {
                    tree.ingest(sample);
                }
            });
        }
    });

    debug!("built call tree with {} nodes", tree.node_count());
    tree
}
