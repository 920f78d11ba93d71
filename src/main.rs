#[macro_use]
extern crate log;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

use chunkfill::config::{GenerationConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MIXED_RUN_SIZE};
use chunkfill::generate::generate_file;
use chunkfill::pattern::Pattern;
use chunkfill::shutdown::ShutdownCoordinator;
use chunkfill::size_utils::{format_bytes, parse_size};
use chunkfill::validation::validate_all;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Size of the file to generate, e.g. 100MB or 1.5GB
    #[arg(short, long)]
    size: String,

    /// Output file path
    #[arg(short, long)]
    output: PathBuf,

    #[arg(short, long, value_enum, default_value_t = Pattern::Random)]
    pattern: Pattern,

    /// Number of concurrent generator workers [default: CPU count]
    #[arg(short, long)]
    workers: Option<usize>,

    /// Size of the chunk each worker generates at a time
    #[arg(short, long, default_value = DEFAULT_CHUNK_SIZE)]
    chunk_size: String,

    /// Overwrite the output file if it exists
    #[arg(short, long)]
    force: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Also write <output>.manifest.json with per-chunk digests
    #[arg(long)]
    manifest: bool,

    /// Length of each random/zero run for the mixed pattern
    #[arg(long, default_value = DEFAULT_MIXED_RUN_SIZE)]
    mixed_run: String,
}

impl CliArgs {
    fn into_config(self) -> Result<GenerationConfig, Box<dyn Error>> {
        let size = parse_size(&self.size).map_err(|e| format!("size: {e}"))?;
        let chunk_size = parse_size(&self.chunk_size).map_err(|e| format!("chunk_size: {e}"))?;
        let mixed_run = parse_size(&self.mixed_run).map_err(|e| format!("mixed_run: {e}"))?;

        let mut config = GenerationConfig::new(self.output, size);
        config.chunk_size = chunk_size;
        config.pattern = self.pattern;
        config.mixed_run = usize::try_from(mixed_run)?;
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.force = self.force;
        config.verbose = self.verbose;
        config.manifest = self.manifest;
        Ok(config)
    }
}

fn init_logging(verbose: bool, multi: &MultiProgress) -> Result<(), Box<dyn Error>> {
    let level = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let logger = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    LogWrapper::new(multi.clone(), logger).try_init()?;
    log::set_max_level(level);
    Ok(())
}

async fn run(args: CliArgs, multi: MultiProgress) -> Result<ExitCode, Box<dyn Error>> {
    let config = args.into_config()?;
    validate_all(&config).map_err(|e| format!("validation failed: {e}"))?;

    debug!("generating file: {}", config.output.display());
    debug!("size: {} ({} bytes)", format_bytes(config.size), config.size);
    debug!("pattern: {}", config.pattern);
    debug!("workers: {}", config.workers);
    debug!("chunk size: {} ({} bytes)", format_bytes(config.chunk_size), config.chunk_size);

    let coordinator = Arc::new(ShutdownCoordinator::new());
    match generate_file(&config, coordinator, multi).await {
        Ok(summary) => {
            info!(
                "successfully generated {} ({})",
                summary.output.display(),
                format_bytes(summary.written)
            );
            for path in &summary.checksum_files {
                debug!("checksum file: {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_cancelled() => {
            warn!("{e}");
            Ok(ExitCode::from(130))
        }
        Err(e) => {
            error!("{e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = CliArgs::parse();
    let multi = MultiProgress::new();
    init_logging(args.verbose, &multi)?;

    run(args, multi).await
}
