use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use related_items::batch::BuildOptions;
use related_items::config::{self, AlgorithmConfig};
use related_items::{ops, CacheManager, InMemoryCatalog, ItemId, SqliteStore, WeightedScorer};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "related",
    version,
    about = "Related-item recommendations with a cached relation store"
)]
struct Cli {
    /// Catalog file: a JSON array of items.
    #[arg(short, long, global = true)]
    catalog: Option<PathBuf>,

    /// SQLite relation store (`:memory:` for a throwaway store).
    #[arg(long, global = true, default_value = "related.db")]
    db: String,

    /// Algorithm config file. Defaults to the usual resolution order.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Related items for one item, computed on a cache miss
    Related {
        id: ItemId,
        /// Override the configured result limit
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Override the configured threshold
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Explain the score between two items
    Score { reference: ItemId, candidate: ItemId },
    /// Cache statistics
    Stats,
    /// Build the relation cache for every published item
    Build {
        #[arg(short, long, default_value_t = related_items::batch::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        /// Keep existing rows and only fill items that are not cached yet
        #[arg(long)]
        resume: bool,
    },
    /// Drop cached relations for the given items, or everything
    Clear {
        ids: Vec<ItemId>,
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
    /// Recompute relations for one item
    Rebuild { id: ItemId },
    /// Show the tokens extracted from a text
    Tokenize { text: String },
    /// Print the effective config
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let algorithm = load_algorithm(cli.config.as_deref());

    let result = match cli.command {
        Commands::Tokenize { text } => Ok(ops::op_tokenize(&text, &algorithm.text)),
        Commands::Config => Ok(ops::op_config(&algorithm)),
        Commands::Score {
            reference,
            candidate,
        } => {
            let catalog = open_catalog(cli.catalog.as_deref());
            ops::op_score(&catalog, reference, candidate, &algorithm)
        }
        command => {
            let manager = open_manager(cli.catalog.as_deref(), &cli.db);
            if let Err(e) = manager.sync_config(&algorithm) {
                fail(&format!("Could not check stored config: {e}"));
            }
            run_cached(&manager, &algorithm, command)
        }
    };

    match result {
        Ok(value) => print_json(&value),
        Err(message) => fail(&message),
    }
}

fn run_cached(
    manager: &CacheManager,
    algorithm: &AlgorithmConfig,
    command: Commands,
) -> Result<Value, String> {
    match command {
        Commands::Related {
            id,
            limit,
            threshold,
        } => {
            let mut config = algorithm.clone();
            if let Some(limit) = limit {
                config.limit = limit;
            }
            if let Some(threshold) = threshold {
                config.threshold = threshold;
            }
            ops::op_related(manager, id, &config)
        }
        Commands::Stats => ops::op_stats(manager),
        Commands::Build { batch_size, resume } => {
            let options = if resume {
                BuildOptions::resume(batch_size)
            } else {
                BuildOptions {
                    batch_size,
                    ..BuildOptions::default()
                }
            };
            Ok(ops::op_build(manager, algorithm, options))
        }
        Commands::Clear { all: true, .. } => ops::op_clear_all(manager),
        Commands::Clear { ids, all: false } => {
            if ids.is_empty() {
                return Err("Nothing to clear. Pass item ids or --all.".into());
            }
            ops::op_clear(manager, &ids)
        }
        Commands::Rebuild { id } => ops::op_rebuild(manager, id, algorithm),
        Commands::Tokenize { .. } | Commands::Config | Commands::Score { .. } => {
            unreachable!("handled without a cache manager")
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_algorithm(path: Option<&Path>) -> AlgorithmConfig {
    match path {
        Some(path) => config::load_config(path).unwrap_or_else(|e| fail(&e.to_string())),
        None => config::default_config(),
    }
}

fn open_catalog(path: Option<&Path>) -> InMemoryCatalog {
    let Some(path) = path else {
        fail("No catalog given. Pass --catalog <file.json>.");
    };
    InMemoryCatalog::load(path).unwrap_or_else(|e| fail(&e.to_string()))
}

fn open_manager(catalog: Option<&Path>, db: &str) -> CacheManager {
    let catalog = open_catalog(catalog);
    let store = SqliteStore::open_or_create(db).unwrap_or_else(|e| fail(&e.to_string()));
    CacheManager::new(
        Arc::new(catalog),
        Arc::new(store),
        Arc::new(WeightedScorer::new()),
    )
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => fail(&format!("Could not serialize output: {e}")),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}
