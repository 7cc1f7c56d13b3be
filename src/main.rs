use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process;

use ayb::blockspec::{self, read_count};
use ayb::config::{AybConfig, OutputFormat};
use ayb::input::read_int_txt;
use ayb::model::process_tile;
use ayb::output::{write_calls, write_matrices};

/// Base caller for Illumina-style intensity files.
#[derive(Parser)]
#[command(name = "ayb", version, about)]
struct Cli {
    /// Intensity files (`_int.txt`, optionally gzipped)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Block specification, e.g. `36R` or `3R,2C,2I,3R`
    #[arg(short, long, default_value = "36R")]
    blockstring: String,

    /// Number of base-calling iterations per data block
    #[arg(short, long, default_value = "5")]
    niter: u32,

    /// Quality-score tolerance
    #[arg(short, long, default_value = "1e-5")]
    mu: f64,

    /// Output format
    #[arg(short, long, default_value = "fasta")]
    format: OutputFormat,

    /// Optional crosstalk seed matrix file
    #[arg(long)]
    crosstalk: Option<PathBuf>,

    /// Optional noise seed matrix file
    #[arg(long)]
    noise: Option<PathBuf>,

    /// Optional phasing seed matrix file
    #[arg(long)]
    phasing: Option<PathBuf>,

    /// Directory for output files (defaults to the working directory)
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Also dump the fitted matrices per data block in seed format
    #[arg(long)]
    dump_matrices: bool,
}

fn build_config(cli: &Cli) -> Result<AybConfig, Box<dyn std::error::Error>> {
    let blocks = blockspec::parse_blockspec(&cli.blockstring)?;
    let mut config = AybConfig::new(blocks);
    config.mu = cli.mu;
    config.n_iter = cli.niter;
    config.output_format = cli.format;
    if let Some(path) = &cli.crosstalk {
        config.crosstalk = Some(ayb::config::load_seed_matrix(path)?);
    }
    if let Some(path) = &cli.noise {
        config.noise = Some(ayb::config::load_seed_matrix(path)?);
    }
    if let Some(path) = &cli.phasing {
        config.phasing = Some(ayb::config::load_seed_matrix(path)?);
    }
    config.validate()?;
    Ok(config)
}

fn output_path(dir: &Path, input: &Path, block: usize, nblock: usize, ext: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "calls".to_string());
    let stem = stem.strip_suffix(".txt").unwrap_or(&stem).to_string();
    if nblock > 1 {
        dir.join(format!("{stem}_{}.{ext}", block + 1))
    } else {
        dir.join(format!("{stem}.{ext}"))
    }
}

fn analyse_file(input: &Path, config: &AybConfig, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let want = blockspec::total_cycles(&config.blocks) as usize;
    let tile = read_int_txt(input, want)?;
    let results = process_tile(&tile, config)?;
    let nblock = read_count(&config.blocks);
    let ext = match config.output_format {
        OutputFormat::Fasta => "fasta",
        OutputFormat::Fastq => "fastq",
    };

    let mut failed = 0usize;
    for result in results {
        match result {
            Ok(fit) => {
                let path = output_path(&cli.output_dir, input, fit.block, nblock, ext);
                let mut out = BufWriter::new(File::create(&path)?);
                write_calls(&mut out, &fit, config.output_format)?;
                log::info!("wrote {} clusters to {}", fit.ncluster, path.display());
                if cli.dump_matrices {
                    let path = output_path(&cli.output_dir, input, fit.block, nblock, "matrices");
                    let mut out = BufWriter::new(File::create(&path)?);
                    write_matrices(&mut out, &fit)?;
                }
            }
            Err(e) => {
                failed += 1;
                log::error!("{}: {e}", input.display());
            }
        }
    }
    if failed > 0 {
        log::warn!("{failed} data block(s) failed for {}", input.display());
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };

    let mut had_error = false;
    for input in &cli.inputs {
        if let Err(e) = analyse_file(input, &config, &cli) {
            eprintln!("error: {}: {e}", input.display());
            had_error = true;
        }
    }
    if had_error {
        process::exit(1);
    }
}
