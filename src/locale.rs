//! Locale index
//!
//! GeoLite2 ships one locations CSV per language. Every file repeats the same
//! geoname ids with names in its own language, so a [`LocaleRecord`] is
//! created the first time an id is seen and then collects names as the other
//! files are read.

use crate::error::{EnrichError, Result};
use csv::StringRecord;
use log::warn;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Geoname id used when the CSV field is missing or not an integer
pub const UNKNOWN_GEONAME_ID: i32 = -1;

/// Locale code → display name
pub type Names = BTreeMap<String, String>;

/// Parse an integer field, substituting -1 for anything unparseable
pub fn parse_id(field: &str) -> i32 {
    field.trim().parse().unwrap_or(UNKNOWN_GEONAME_ID)
}

/// One decoded row of a locations CSV file
///
/// Country files only fill the continent and country columns; the remaining
/// fields stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocaleRow {
    pub geoname_id: i32,
    pub locale_code: String,
    pub continent_code: String,
    pub continent_name: String,
    pub country_iso_code: String,
    pub country_name: String,
    pub subdivision_1_iso_code: String,
    pub subdivision_1_name: String,
    pub subdivision_2_iso_code: String,
    pub subdivision_2_name: String,
    pub city_name: String,
    pub metro_code: String,
    pub time_zone: String,
    pub is_in_european_union: i32,
}

impl LocaleRow {
    /// Decode a `GeoLite2-Country-Locations-*.csv` row
    ///
    /// Columns: geoname_id, locale_code, continent_code, continent_name,
    /// country_iso_code, country_name, is_in_european_union
    pub fn from_country_record(record: &StringRecord) -> Result<Self> {
        require_columns(record, 7)?;
        Ok(Self {
            geoname_id: parse_id(&record[0]),
            locale_code: record[1].to_string(),
            continent_code: record[2].to_string(),
            continent_name: record[3].to_string(),
            country_iso_code: record[4].to_string(),
            country_name: record[5].to_string(),
            is_in_european_union: parse_id(&record[6]),
            ..Self::default()
        })
    }

    /// Decode a `GeoLite2-City-Locations-*.csv` row
    ///
    /// Columns: geoname_id, locale_code, continent_code, continent_name,
    /// country_iso_code, country_name, subdivision_1_iso_code,
    /// subdivision_1_name, subdivision_2_iso_code, subdivision_2_name,
    /// city_name, metro_code, time_zone, is_in_european_union
    pub fn from_city_record(record: &StringRecord) -> Result<Self> {
        require_columns(record, 14)?;
        Ok(Self {
            geoname_id: parse_id(&record[0]),
            locale_code: record[1].to_string(),
            continent_code: record[2].to_string(),
            continent_name: record[3].to_string(),
            country_iso_code: record[4].to_string(),
            country_name: record[5].to_string(),
            subdivision_1_iso_code: record[6].to_string(),
            subdivision_1_name: record[7].to_string(),
            subdivision_2_iso_code: record[8].to_string(),
            subdivision_2_name: record[9].to_string(),
            city_name: record[10].to_string(),
            metro_code: record[11].to_string(),
            time_zone: record[12].to_string(),
            is_in_european_union: parse_id(&record[13]),
        })
    }
}

fn require_columns(record: &StringRecord, expected: usize) -> Result<()> {
    if record.len() < expected {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        return Err(EnrichError::Csv(format!(
            "line {}: expected {} columns, found {}",
            line,
            expected,
            record.len()
        )));
    }
    Ok(())
}

/// Everything known about one geoname id across all locale files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocaleRecord {
    pub geoname_id: i32,
    pub continent_code: String,
    pub continent_names: Names,
    pub country_iso_code: String,
    pub country_names: Names,
    pub subdivision_1_iso_code: String,
    pub subdivision_1_names: Names,
    pub subdivision_2_iso_code: String,
    pub subdivision_2_names: Names,
    pub city_names: Names,
    pub metro_code: String,
    pub time_zone: String,
    pub is_in_european_union: i32,
}

impl LocaleRecord {
    /// Seed a record from the first row seen for its geoname id
    fn from_first_row(row: &LocaleRow) -> Self {
        Self {
            geoname_id: row.geoname_id,
            continent_code: row.continent_code.clone(),
            country_iso_code: row.country_iso_code.clone(),
            subdivision_1_iso_code: row.subdivision_1_iso_code.clone(),
            subdivision_2_iso_code: row.subdivision_2_iso_code.clone(),
            metro_code: row.metro_code.clone(),
            time_zone: row.time_zone.clone(),
            is_in_european_union: row.is_in_european_union,
            ..Self::default()
        }
    }

    fn add_names(&mut self, row: &LocaleRow) {
        let locale = &row.locale_code;
        self.continent_names
            .insert(locale.clone(), row.continent_name.clone());
        self.country_names
            .insert(locale.clone(), row.country_name.clone());
        self.subdivision_1_names
            .insert(locale.clone(), row.subdivision_1_name.clone());
        self.subdivision_2_names
            .insert(locale.clone(), row.subdivision_2_name.clone());
        self.city_names
            .insert(locale.clone(), row.city_name.clone());
    }
}

/// geoname id → [`LocaleRecord`]
#[derive(Debug, Default)]
pub struct LocaleIndex {
    records: FxHashMap<i32, LocaleRecord>,
    languages: BTreeSet<String>,
    unknown_rows: usize,
    empty: LocaleRecord,
}

impl LocaleIndex {
    pub fn new() -> Self {
        Self {
            empty: LocaleRecord {
                geoname_id: UNKNOWN_GEONAME_ID,
                is_in_european_union: UNKNOWN_GEONAME_ID,
                ..LocaleRecord::default()
            },
            ..Self::default()
        }
    }

    /// Add one locale row
    ///
    /// Rows without a usable geoname id are counted but not stored, so the
    /// unknown id always resolves to the empty record.
    pub fn ingest(&mut self, row: &LocaleRow) {
        if !row.locale_code.is_empty() {
            self.languages.insert(row.locale_code.clone());
        }

        if row.geoname_id == UNKNOWN_GEONAME_ID {
            self.unknown_rows += 1;
            warn!(
                "Skipping {} locale row without a usable geoname_id",
                row.locale_code
            );
            return;
        }

        self.records
            .entry(row.geoname_id)
            .or_insert_with(|| LocaleRecord::from_first_row(row))
            .add_names(row);
    }

    /// Record for `geoname_id`, or an empty record when unknown
    pub fn get(&self, geoname_id: i32) -> &LocaleRecord {
        self.records.get(&geoname_id).unwrap_or(&self.empty)
    }

    pub fn contains(&self, geoname_id: i32) -> bool {
        self.records.contains_key(&geoname_id)
    }

    /// Locale codes seen so far, sorted
    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.languages.iter().map(String::as_str)
    }

    /// Number of distinct geoname ids
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows dropped because their geoname id did not parse
    pub fn unknown_rows(&self) -> usize {
        self.unknown_rows
    }
}
