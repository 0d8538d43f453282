mod cli_utils;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use mmdb_enrich::{Dataset, MergeStrategy, DEFAULT_INPUT_ROOT, DEFAULT_OUTPUT_ROOT};
use std::path::PathBuf;

use commands::{cmd_convert, cmd_inspect, cmd_lookup};

#[derive(Parser)]
#[command(name = "mmdb-enrich")]
#[command(
    about = "Convert GeoLite2 CSV files into MaxMind DB files with localized names",
    long_about = "mmdb-enrich - GeoLite2 CSV to MMDB converter\n\n\
    Reads the blocks and locations CSV files of each GeoLite2 edition, joins every\n\
    network with the localized names of its geoname id and writes one .mmdb file\n\
    per edition.\n\n\
    Input layout:\n\
      <input>/GeoLite2-ASN/GeoLite2-ASN-Blocks-IPv4.csv, ...-IPv6.csv\n\
      <input>/GeoLite2-Country/GeoLite2-Country-Blocks-IPv4.csv, ...-Locations-<lang>.csv\n\
      <input>/GeoLite2-City/GeoLite2-City-Blocks-IPv4.csv, ...-Locations-<lang>.csv\n\n\
    Examples:\n\
      mmdb-enrich convert\n\
      mmdb-enrich convert --input ./csv --output ./mmdb --dataset country\n\
      mmdb-enrich lookup output/GeoLite2-Country.mmdb 8.8.8.8\n\
      mmdb-enrich inspect output/GeoLite2-City.mmdb --json"
)]
#[command(version)]
struct Cli {
    /// Log debug output (per-file details, skipped files)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert GeoLite2 CSV directories into MMDB files
    Convert {
        /// Directory containing one sub-directory per edition
        #[arg(short, long, default_value = DEFAULT_INPUT_ROOT)]
        input: PathBuf,

        /// Directory the .mmdb files are written to
        #[arg(short, long, default_value = DEFAULT_OUTPUT_ROOT)]
        output: PathBuf,

        /// Edition to convert (asn, country, city). Repeat for several; all by default
        #[arg(short, long = "dataset", value_name = "DATASET", value_parser = parse_dataset)]
        datasets: Vec<Dataset>,

        /// How rows for the same exact network are combined
        #[arg(long, value_enum, default_value = "top-level")]
        merge: MergeArg,

        /// Print conversion statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Look up an IP address in an MMDB file
    Lookup {
        /// Path to the .mmdb file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// IPv4 or IPv6 address
        #[arg(value_name = "IP")]
        ip: String,
    },

    /// Show MMDB metadata
    Inspect {
        /// Path to the .mmdb file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MergeArg {
    /// Overlay top-level keys of the later row
    TopLevel,
    /// Keep only the later row
    Replace,
    /// Merge nested maps recursively
    Deep,
}

impl From<MergeArg> for MergeStrategy {
    fn from(arg: MergeArg) -> Self {
        match arg {
            MergeArg::TopLevel => MergeStrategy::TopLevel,
            MergeArg::Replace => MergeStrategy::Replace,
            MergeArg::Deep => MergeStrategy::Deep,
        }
    }
}

fn parse_dataset(s: &str) -> Result<Dataset, String> {
    s.parse().map_err(|e: mmdb_enrich::EnrichError| e.to_string())
}

fn init_logger(verbose: bool, quiet: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };

    // RUST_LOG still wins when set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .format_timestamp(None)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Convert {
            input,
            output,
            datasets,
            merge,
            json,
        } => cmd_convert(input, output, datasets, merge.into(), json),
        Commands::Lookup { database, ip } => cmd_lookup(database, ip),
        Commands::Inspect { database, json } => cmd_inspect(database, json),
    }
}
