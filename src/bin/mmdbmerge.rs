use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use mmdbmerge::{
    Config, CsvRowWriter, Merger, MmdbRowWriter, OutputFormat, Readers, RowWriter,
};

#[derive(Parser)]
#[command(name = "mmdbmerge")]
#[command(about = "Merge MaxMind MMDB databases and export to CSV or MMDB", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(&cli.config, cli.quiet)
}

fn run(config_path: &Path, quiet: bool) -> Result<()> {
    let start = Instant::now();

    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config '{}'", config_path.display()))?;

    if !quiet {
        println!("Output format: {:?}", config.output.format);
        println!("Output file: {}", config.output.file.display());
        println!("Databases: {}", config.databases.len());
        println!("Data columns: {}", config.columns.len());
        println!("Network columns: {}", config.network.columns.len());
        println!();
        println!("Opening MMDB databases...");
        for db in &config.databases {
            println!("  - {}: {}", db.name, db.path.display());
        }
    }

    let readers = Readers::open(&config.databases).context("failed to open databases")?;

    let writer: Box<dyn RowWriter> = match config.output.format {
        OutputFormat::Csv => {
            let file = File::create(&config.output.file).with_context(|| {
                format!(
                    "failed to create output file '{}'",
                    config.output.file.display()
                )
            })?;
            Box::new(CsvRowWriter::new(BufWriter::new(file), &config)?)
        }
        OutputFormat::Mmdb => {
            // The inputs share one IP version; the merger enforces it.
            let first_db = &config.columns[0].database;
            let reader = readers
                .get(first_db)
                .ok_or_else(|| anyhow!("database '{}' not found", first_db))?;
            let ip_version = reader.metadata().ip_version;
            Box::new(MmdbRowWriter::new(&config, ip_version)?)
        }
    };

    if !quiet {
        println!();
        println!("Merging databases and writing output...");
    }

    let mut merger =
        Merger::new(&readers, &config, writer).context("failed to create merger")?;
    merger.merge().context("merge failed")?;
    merger
        .into_writer()
        .flush()
        .context("failed to flush output")?;

    if !quiet {
        println!();
        println!(
            "Completed in {:.2?}, output written to {}",
            start.elapsed(),
            config.output.file.display()
        );
    }

    Ok(())
}
