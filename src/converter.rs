//! Dataset conversion
//!
//! Drives one GeoLite2 edition from CSV to MMDB: locale files are read into
//! a [`LocaleIndex`], the IPv4 and then the IPv6 blocks file are assembled
//! row by row into a [`PrefixTree`], and the finished tree is written with
//! [`MmdbWriter`]. Nothing is written unless every row was accepted.

use crate::assembler;
use crate::error::{EnrichError, Result};
use crate::locale::{LocaleIndex, LocaleRow};
use crate::mmdb::MmdbWriter;
use crate::prefix_tree::{MergeStrategy, PrefixTree};
use csv::StringRecord;
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default directory holding one sub-directory per edition
pub const DEFAULT_INPUT_ROOT: &str = "./input";

/// Default directory the `.mmdb` files are written to
pub const DEFAULT_OUTPUT_ROOT: &str = "./output";

/// A GeoLite2 edition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Asn,
    Country,
    City,
}

impl Dataset {
    /// All editions in conversion order
    pub const ALL: [Dataset; 3] = [Dataset::Asn, Dataset::Country, Dataset::City];

    /// Edition name, e.g. `GeoLite2-Country`
    ///
    /// Used as the input directory name, the output file stem and the
    /// `database_type` metadata value.
    pub fn edition(self) -> &'static str {
        match self {
            Dataset::Asn => "GeoLite2-ASN",
            Dataset::Country => "GeoLite2-Country",
            Dataset::City => "GeoLite2-City",
        }
    }

    /// Blocks files in the order they are read: IPv4, then IPv6
    pub fn block_files(self) -> [String; 2] {
        [
            format!("{}-Blocks-IPv4.csv", self.edition()),
            format!("{}-Blocks-IPv6.csv", self.edition()),
        ]
    }

    pub fn output_file_name(self) -> String {
        format!("{}.mmdb", self.edition())
    }

    /// Whether records are joined with locale files
    pub fn uses_locales(self) -> bool {
        !matches!(self, Dataset::Asn)
    }

    fn locale_row(self, record: &StringRecord) -> Result<LocaleRow> {
        match self {
            Dataset::City => LocaleRow::from_city_record(record),
            _ => LocaleRow::from_country_record(record),
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dataset::Asn => "asn",
            Dataset::Country => "country",
            Dataset::City => "city",
        };
        f.write_str(name)
    }
}

impl FromStr for Dataset {
    type Err = EnrichError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asn" | "geolite2-asn" => Ok(Dataset::Asn),
            "country" | "geolite2-country" => Ok(Dataset::Country),
            "city" | "geolite2-city" => Ok(Dataset::City),
            _ => Err(EnrichError::UnknownDataset(format!(
                "{:?} (expected asn, country or city)",
                s
            ))),
        }
    }
}

/// Summary of one converted dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    pub dataset: Dataset,
    pub locale_files: usize,
    pub locale_rows: usize,
    /// Distinct geoname ids in the locale index
    pub geoname_ids: usize,
    pub block_rows: usize,
    /// Distinct networks stored in the tree
    pub networks: usize,
    pub node_count: usize,
    pub bytes_written: usize,
    pub output: PathBuf,
}

/// A dataset read into memory, ready to be written
#[derive(Debug)]
pub struct LoadedDataset {
    pub dataset: Dataset,
    pub tree: PrefixTree,
    pub locales: LocaleIndex,
    pub locale_files: usize,
    pub locale_rows: usize,
    pub block_rows: usize,
}

/// Conversion settings
#[derive(Debug, Clone, Default)]
pub struct Converter {
    strategy: MergeStrategy,
    build_epoch: Option<u64>,
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    /// How rows for the same exact network are combined
    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Fix the `build_epoch` metadata value
    pub fn with_build_epoch(mut self, epoch: u64) -> Self {
        self.build_epoch = Some(epoch);
        self
    }

    /// Read the locale and blocks files of `dataset` from `input_dir`
    pub fn load(&self, dataset: Dataset, input_dir: &Path) -> Result<LoadedDataset> {
        let mut loaded = LoadedDataset {
            dataset,
            tree: PrefixTree::new(),
            locales: LocaleIndex::new(),
            locale_files: 0,
            locale_rows: 0,
            block_rows: 0,
        };

        if dataset.uses_locales() {
            for path in locale_files(input_dir)? {
                let rows = read_csv(&path, |record| {
                    let row = dataset.locale_row(record)?;
                    loaded.locales.ingest(&row);
                    Ok(())
                })?;
                debug!("Read {}. {} locale row(s).", path.display(), rows);
                loaded.locale_files += 1;
                loaded.locale_rows += rows;
            }
        }

        for name in dataset.block_files() {
            let path = input_dir.join(name);
            let rows = read_csv(&path, |record| {
                let (network, value) = assembler::assemble(dataset, record, &loaded.locales)?;
                loaded.tree.insert(network, value, self.strategy)
            })?;
            info!("Read {}. {} value(s).", path.display(), rows);
            loaded.block_rows += rows;
        }

        Ok(loaded)
    }

    /// Convert one dataset directory into an MMDB file at `output_path`
    pub fn convert_dataset(
        &self,
        dataset: Dataset,
        input_dir: &Path,
        output_path: &Path,
    ) -> Result<ConversionStats> {
        let loaded = self.load(dataset, input_dir)?;

        let mut writer =
            MmdbWriter::new(dataset.edition()).with_languages(loaded.locales.languages());
        if let Some(epoch) = self.build_epoch {
            writer = writer.with_build_epoch(epoch);
        }
        let bytes_written = writer.write_to_file(&loaded.tree, output_path)?;
        info!("Wrote {}", output_path.display());

        Ok(ConversionStats {
            dataset,
            locale_files: loaded.locale_files,
            locale_rows: loaded.locale_rows,
            geoname_ids: loaded.locales.len(),
            block_rows: loaded.block_rows,
            networks: loaded.tree.len(),
            node_count: loaded.tree.node_count(),
            bytes_written,
            output: output_path.to_path_buf(),
        })
    }

    /// Convert each dataset from `input_root/<edition>/` to
    /// `output_root/<edition>.mmdb`, stopping at the first failure
    pub fn convert_all(
        &self,
        input_root: &Path,
        output_root: &Path,
        datasets: &[Dataset],
    ) -> Result<Vec<ConversionStats>> {
        datasets
            .iter()
            .map(|&dataset| {
                self.convert_dataset(
                    dataset,
                    &input_root.join(dataset.edition()),
                    &output_root.join(dataset.output_file_name()),
                )
            })
            .collect()
    }
}

/// Convert one dataset with default settings
pub fn convert_dataset(
    dataset: Dataset,
    input_dir: &Path,
    output_path: &Path,
) -> Result<ConversionStats> {
    Converter::new().convert_dataset(dataset, input_dir, output_path)
}

/// Convert several datasets with default settings
pub fn convert_all(
    input_root: &Path,
    output_root: &Path,
    datasets: &[Dataset],
) -> Result<Vec<ConversionStats>> {
    Converter::new().convert_all(input_root, output_root, datasets)
}

/// Locale files in `dir`: every `.csv` that is not a blocks file, sorted by
/// name
pub fn locale_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| EnrichError::Io(format!("failed to read {}: {}", dir.display(), e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.ends_with(".csv") || name.ends_with("-IPv4.csv") || name.ends_with("-IPv6.csv") {
            debug!("Skipping {}", entry.path().display());
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}

/// Feed every data row of a CSV file to `handle`, returning the row count
///
/// The first row is the header. Errors are annotated with the file path.
fn read_csv<F>(path: &Path, mut handle: F) -> Result<usize>
where
    F: FnMut(&StringRecord) -> Result<()>,
{
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| in_file(path, e.into()))?;

    if reader.headers().map_err(|e| in_file(path, e.into()))?.is_empty() {
        return Err(in_file(path, EnrichError::Csv("missing header row".to_string())));
    }

    let mut record = StringRecord::new();
    let mut count = 0;
    while reader
        .read_record(&mut record)
        .map_err(|e| in_file(path, e.into()))?
    {
        handle(&record).map_err(|e| in_file(path, e))?;
        count += 1;
    }
    Ok(count)
}

fn in_file(path: &Path, err: EnrichError) -> EnrichError {
    let at = |msg: String| format!("{}: {}", path.display(), msg);
    match err {
        EnrichError::InvalidNetwork(msg) => EnrichError::InvalidNetwork(at(msg)),
        EnrichError::Io(msg) => EnrichError::Io(at(msg)),
        EnrichError::Csv(msg) => EnrichError::Csv(at(msg)),
        other => other,
    }
}
