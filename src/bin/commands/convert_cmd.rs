use anyhow::{Context, Result};
use mmdb_enrich::{Converter, Dataset, MergeStrategy};
use std::path::PathBuf;
use std::time::Instant;

use crate::cli_utils::format_bytes;

pub fn cmd_convert(
    input: PathBuf,
    output: PathBuf,
    datasets: Vec<Dataset>,
    strategy: MergeStrategy,
    json_output: bool,
) -> Result<()> {
    let datasets = if datasets.is_empty() {
        Dataset::ALL.to_vec()
    } else {
        datasets
    };

    let converter = Converter::new().with_strategy(strategy);
    let start = Instant::now();
    let mut all_stats = Vec::with_capacity(datasets.len());

    for dataset in datasets {
        let input_dir = input.join(dataset.edition());
        let output_path = output.join(dataset.output_file_name());
        let stats = converter
            .convert_dataset(dataset, &input_dir, &output_path)
            .with_context(|| format!("Failed to convert {}", input_dir.display()))?;
        all_stats.push(stats);
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&all_stats)?);
        return Ok(());
    }

    for stats in &all_stats {
        println!("{}:", stats.dataset.edition());
        if stats.dataset.uses_locales() {
            println!(
                "  Locale files:  {} ({} rows, {} geoname ids)",
                stats.locale_files, stats.locale_rows, stats.geoname_ids
            );
        }
        println!("  Block rows:    {}", stats.block_rows);
        println!("  Networks:      {}", stats.networks);
        println!("  Tree nodes:    {}", stats.node_count);
        println!(
            "  Output:        {} ({})",
            stats.output.display(),
            format_bytes(stats.bytes_written)
        );
    }
    println!("Done in {:.2}s", start.elapsed().as_secs_f64());

    Ok(())
}
