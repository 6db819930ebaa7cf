use std::io;
use std::path::Path;
use std::sync::Arc;

use abtest_engine::cli::{self, Args, Command};
use abtest_engine::{EngineConfig, ExperimentService, SqliteStorage};
use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "abtest.toml";

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Command::Completions { shell } = args.command {
        cli::print_completions(shell, &mut io::stdout());
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH).to_path_buf());
    let config = EngineConfig::load(Some(&config_path))?;
    init_logging(&config.log_level);

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| Path::new(&config.database_path).to_path_buf());
    tracing::debug!(db = %db_path.display(), "opening database");
    let storage = SqliteStorage::open(&db_path)?;
    let service = ExperimentService::new(Arc::new(storage)).with_config(config);

    let mut stdout = io::stdout().lock();
    if let Err(e) = cli::run(args.command, &service, &mut stdout) {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}
