use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rayon::prelude::*;

use std::path::{Path, PathBuf};

use sandpix::{Client, Command, Config, OutputFormat, RenderOptions};

#[derive(Parser)]
#[command(name = "sandpix-cli")]
#[command(about = "Re-encode images through an isolated sandpix worker", long_about = None)]
#[command(version)]
struct Args {
    /// Input image files
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Worker executable
    #[arg(short, long, value_name = "PATH", required_unless_present = "config")]
    worker: Option<PathBuf>,

    /// JSON worker configuration (command, timeouts, queue capacity)
    #[arg(short, long, value_name = "FILE", conflicts_with = "worker")]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = FormatArg::Jpeg)]
    format: FormatArg,

    /// Starting JPEG quality (1-100)
    #[arg(long, value_name = "QUALITY")]
    quality: Option<u8>,

    /// Largest acceptable output file, in bytes
    #[arg(long, value_name = "BYTES")]
    max_size: Option<u64>,

    /// Ask for progressive JPEG output
    #[arg(long, default_value_t)]
    progressive: bool,

    /// Verbose output
    #[arg(short, long, default_value_t)]
    verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, default_value_t)]
    quiet: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Jpeg,
    Png,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Jpeg => OutputFormat::Jpeg,
            FormatArg::Png => OutputFormat::Png,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose, args.quiet);

    let options = build_options(&args)?;

    if let Some(missing) = args.inputs.iter().find(|input| !input.exists()) {
        anyhow::bail!("Input file does not exist: {}", missing.display());
    }

    if !args.output_dir.exists() {
        std::fs::create_dir_all(&args.output_dir).context("Failed to create output directory")?;
    }

    let config = worker_config(&args)?;
    let worker = config.command.bin_path.display().to_string();

    let client = Client::new();
    client
        .initialize(config)
        .with_context(|| format!("Failed to start worker `{worker}`"))?;

    let failures = args
        .inputs
        .par_iter()
        .filter_map(|input| {
            convert(&client, input, &args.output_dir, options)
                .map_err(|e| log::error!("{}: {e:#}", input.display()))
                .err()
        })
        .count();

    if client.restarts() > 0 {
        log::warn!("Worker was restarted {} time(s)", client.restarts());
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} images failed", args.inputs.len());
    }

    if !args.quiet {
        log::info!("Converted {} images", args.inputs.len());
    }

    Ok(())
}

fn convert(client: &Client, input: &Path, output_dir: &Path, options: RenderOptions) -> Result<()> {
    let data = std::fs::read(input).context("Failed to read input")?;
    let rendered = client.render_file(&data, options)?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let output_path = output_dir.join(format!("{stem}.{}", options.output_format.extension()));
    std::fs::write(&output_path, &rendered.output).context("Failed to write output file")?;

    match rendered.quality {
        Some(quality) => log::info!(
            "{} ({}) -> {} ({}x{}, {} bytes, quality {quality})",
            input.display(),
            rendered.original_format,
            output_path.display(),
            rendered.width,
            rendered.height,
            rendered.output.len(),
        ),
        None => log::info!(
            "{} ({}) -> {} ({}x{}, {} bytes)",
            input.display(),
            rendered.original_format,
            output_path.display(),
            rendered.width,
            rendered.height,
            rendered.output.len(),
        ),
    }

    Ok(())
}

fn setup_logging(verbose: bool, quiet: bool) {
    if quiet {
        return;
    }

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn worker_config(args: &Args) -> Result<Config> {
    match (&args.config, &args.worker) {
        (Some(path), _) => Config::from_json_file(path)
            .with_context(|| format!("Failed to load config `{}`", path.display())),
        (None, Some(worker)) => Ok(Config::new(Command::new(worker))),
        (None, None) => anyhow::bail!("Either --worker or --config is required"),
    }
}

fn build_options(args: &Args) -> Result<RenderOptions> {
    let mut options = RenderOptions::new(args.format.into()).progressive(args.progressive);

    if let Some(quality) = args.quality {
        if !(1..=100).contains(&quality) {
            anyhow::bail!("Quality must be between 1 and 100");
        }
        if args.format == FormatArg::Png {
            log::warn!("PNG output ignores --quality");
        }
        options = options.quality(quality);
    }

    if let Some(max_size) = args.max_size {
        if max_size == 0 {
            anyhow::bail!("Max size must be greater than zero");
        }
        options = options.max_file_size(max_size);
    }

    Ok(options)
}
