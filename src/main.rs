use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use cubepool::io::ChunkWriter;
use cubepool::{
    run_worker, CancelFile, ChunkData, ChunkError, ChunkId, CommandTemplate, Cube, DiagnosticChannel,
    EngineConfig, FileCube, InterruptSource, LocalExecutor, NeverInterrupt, ProgressMode,
    SharedSink, Verbosity, WorkerArgs,
};

#[derive(Parser, Debug)]
#[command(name = "cubepool")]
#[command(about = "Process a file chunk by chunk on threads or worker processes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy INPUT to OUTPUT chunk by chunk
    Run(RunArgs),

    /// Worker process entry point (spawned by `run --workers`)
    Worker(WorkerCommand),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input file path
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output file path (defaults to input with .out extension)
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Chunk size in bytes
    #[arg(short, long, default_value_t = 1024 * 1024)]
    chunk_size: usize,

    /// Engine settings as JSON; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Run chunks in this many worker processes instead of threads
    #[arg(long)]
    workers: Option<usize>,

    /// Worker command template (defaults to this executable's `worker` subcommand)
    #[arg(long, value_name = "TEMPLATE")]
    command: Option<String>,

    /// Working directory shared with worker processes (defaults to OUTPUT.parts)
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Append diagnostics to this file instead of the terminal
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Include debug diagnostics
    #[arg(long)]
    debug: bool,

    /// Stop starting new chunks once this file exists
    #[arg(long, value_name = "FILE")]
    cancel_file: Option<PathBuf>,

    /// Disable progress bar
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Args, Debug)]
struct WorkerCommand {
    /// Cube document written by the parent
    document: PathBuf,

    /// Index of this worker
    worker: usize,

    /// Total number of workers
    workers: usize,

    /// Shared working directory
    work_dir: PathBuf,

    /// Include debug diagnostics
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Worker(args) => worker(args),
    }
}

fn engine_config(args: &RunArgs, output_path: &Path) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(command) = &args.command {
        config.command = Some(command.parse()?);
    }
    if config.workers > 0 && config.command.is_none() {
        let exe = std::env::current_exe().context("Cannot locate the cubepool executable")?;
        config.command = Some(CommandTemplate::new(exe.to_string_lossy(), ["worker"]));
    }
    if let Some(dir) = &args.work_dir {
        config.work_dir = Some(dir.clone());
    }
    if config.workers > 0 && config.work_dir.is_none() {
        config.work_dir = Some(output_path.with_extension("parts"));
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file.clone();
    }
    if args.debug {
        config.verbosity = Verbosity::Debug;
    }

    config.progress = if args.quiet {
        ProgressMode::None
    } else if std::io::stderr().is_terminal() {
        ProgressMode::Terminal
    } else {
        ProgressMode::Text
    };

    Ok(config)
}

fn run(args: RunArgs) -> Result<()> {
    // Determine output path
    let output_path = args.output.clone().unwrap_or_else(|| {
        let mut path = args.input.clone();
        path.set_extension("out");
        path
    });

    // Validate input
    if !args.input.exists() {
        anyhow::bail!("Input file does not exist: {}", args.input.display());
    }

    if args.input == output_path {
        anyhow::bail!("Input and output files cannot be the same");
    }

    let config = engine_config(&args, &output_path)?;

    println!("Processing {} into {}", args.input.display(), output_path.display());

    let start_time = Instant::now();

    let cube = FileCube::open(&args.input, args.chunk_size)
        .with_context(|| format!("Failed to open input: {}", args.input.display()))?;

    println!(
        "Total chunks: {} ({:.2} MB)",
        cube.chunk_count(),
        cube.len() as f64 / (1024.0 * 1024.0)
    );

    let writer = ChunkWriter::new(&output_path, cube.len() as u64)
        .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;

    let channel = Arc::new(config.channel());
    let interrupt: Arc<dyn InterruptSource> = match &args.cancel_file {
        Some(path) => Arc::new(CancelFile::new(path)),
        None => Arc::new(NeverInterrupt),
    };
    let processor = config.build_processor(Arc::clone(&channel), interrupt)?;

    if config.workers > 0 {
        println!("Using {} worker processes", processor.max_threads());
    } else {
        println!("Using {} worker threads", processor.max_threads());
    }

    let callback = |id: ChunkId, data: ChunkData, sink: &SharedSink| -> Result<(), ChunkError> {
        let _guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_chunk(cube.chunk_offset(id), data.as_bytes())
            .map_err(|source| ChunkError::Io { id, source })
    };
    let result = processor.apply(&cube, &callback);
    let written = writer.finish().context("Failed to finalize output file")?;
    result.context("Chunk processing did not complete")?;

    let elapsed = start_time.elapsed();
    let mb_per_sec = cube.len() as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64();

    println!("\nProcessing completed in {:.2?} ({:.2} MB/s)", elapsed, mb_per_sec);
    if written < cube.chunk_count() as usize {
        println!(
            "Warning: {} of {} chunks failed, see diagnostics",
            cube.chunk_count() as usize - written,
            cube.chunk_count()
        );
    }
    println!("Output file: {}", output_path.display());

    Ok(())
}

fn worker(args: WorkerCommand) -> Result<()> {
    let verbosity = if args.debug {
        Verbosity::Debug
    } else {
        Verbosity::Standard
    };
    let channel = Arc::new(DiagnosticChannel::stderr(verbosity));
    let executor = LocalExecutor::new(1, Arc::clone(&channel))?;

    let worker_args = WorkerArgs {
        document: args.document,
        worker: args.worker,
        workers: args.workers,
        work_dir: args.work_dir,
    };
    let summary = run_worker(&worker_args, executor)
        .with_context(|| format!("Worker {} of {} failed", args.worker, args.workers))?;

    channel.info(format!(
        "worker {} stored {} of {} chunks",
        args.worker, summary.stored, summary.assigned
    ));
    if summary.skipped > 0 {
        channel.info(format!(
            "worker {} stopped early, {} chunks not started",
            args.worker, summary.skipped
        ));
    }
    channel.flush_now();
    Ok(())
}
