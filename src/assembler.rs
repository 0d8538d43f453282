//! Record assembly
//!
//! Turns one block CSV row into the network it covers and the nested record
//! stored for it, resolving names through the [`LocaleIndex`] and continent
//! ids through the [`continent`](crate::continent) catalog.
//!
//! Every record of a dataset has the same keys. Values the CSV does not
//! provide are filled with sentinels (-1, -1.0, "").

use crate::continent;
use crate::converter::Dataset;
use crate::data_section::DataValue;
use crate::error::{EnrichError, Result};
use crate::locale::{parse_id, LocaleIndex, LocaleRecord, UNKNOWN_GEONAME_ID};
use crate::network::Network;
use csv::StringRecord;

/// A row of a Country or City blocks file
///
/// Only the first three columns are used; City files carry postal and
/// location columns after them which are not copied into the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoBlockRow {
    pub network: Network,
    pub geoname_id: i32,
    pub registered_country_geoname_id: i32,
}

impl GeoBlockRow {
    pub fn from_record(record: &StringRecord) -> Result<Self> {
        require_columns(record, 3)?;
        Ok(Self {
            network: parse_network(record)?,
            geoname_id: parse_id(&record[1]),
            registered_country_geoname_id: parse_id(&record[2]),
        })
    }
}

/// A row of an ASN blocks file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsnBlockRow {
    pub network: Network,
    /// Kept as text, exactly as it appears in the file
    pub autonomous_system_number: String,
    pub autonomous_system_organization: String,
}

impl AsnBlockRow {
    pub fn from_record(record: &StringRecord) -> Result<Self> {
        require_columns(record, 3)?;
        Ok(Self {
            network: parse_network(record)?,
            autonomous_system_number: record[1].to_string(),
            autonomous_system_organization: record[2].to_string(),
        })
    }
}

/// Decode a block row of `dataset` and build its record
pub fn assemble(
    dataset: Dataset,
    record: &StringRecord,
    locales: &LocaleIndex,
) -> Result<(Network, DataValue)> {
    match dataset {
        Dataset::Asn => {
            let row = AsnBlockRow::from_record(record)?;
            Ok((row.network, asn_record(&row)))
        }
        Dataset::Country => {
            let row = GeoBlockRow::from_record(record)?;
            Ok((row.network, country_record(&row, locales)))
        }
        Dataset::City => {
            let row = GeoBlockRow::from_record(record)?;
            Ok((row.network, city_record(&row, locales)))
        }
    }
}

pub fn asn_record(row: &AsnBlockRow) -> DataValue {
    DataValue::map_from([
        (
            "autonomous_system_number",
            DataValue::from(row.autonomous_system_number.as_str()),
        ),
        (
            "autonomous_system_organization",
            DataValue::from(row.autonomous_system_organization.as_str()),
        ),
    ])
}

pub fn country_record(row: &GeoBlockRow, locales: &LocaleIndex) -> DataValue {
    let locale = locales.get(row.geoname_id);
    DataValue::map_from([
        ("continent", continent_map(locale)),
        ("country", country_map(row.geoname_id, locale)),
        (
            "registered_country",
            registered_country_map(row.registered_country_geoname_id, locales),
        ),
    ])
}

pub fn city_record(row: &GeoBlockRow, locales: &LocaleIndex) -> DataValue {
    let locale = locales.get(row.geoname_id);
    DataValue::map_from([
        (
            "city",
            DataValue::map_from([
                ("geoname_id", DataValue::Int32(row.geoname_id)),
                ("names", DataValue::from(locale.city_names.clone())),
            ]),
        ),
        ("continent", continent_map(locale)),
        // City databases do not carry the country's own geoname id
        ("country", country_map(UNKNOWN_GEONAME_ID, locale)),
        (
            "location",
            DataValue::map_from([
                ("accuracy_radius", DataValue::Int32(-1)),
                ("latitude", DataValue::Float(-1.0)),
                ("longitude", DataValue::Float(-1.0)),
                ("metro_code", DataValue::Int32(-1)),
                ("time_zone", DataValue::from("")),
            ]),
        ),
        ("postal", DataValue::map_from([("code", DataValue::from(""))])),
        (
            "registered_country",
            registered_country_map(row.registered_country_geoname_id, locales),
        ),
        (
            "subdivisions",
            DataValue::Array(vec![DataValue::map_from([
                ("geoname_id", DataValue::Int32(-1)),
                ("iso_code", DataValue::from("")),
                ("names", DataValue::empty_map()),
            ])]),
        ),
    ])
}

fn continent_map(locale: &LocaleRecord) -> DataValue {
    let code = locale.continent_code.as_str();
    DataValue::map_from([
        (
            "geoname_id",
            DataValue::Int32(continent::lookup(code).geoname_id),
        ),
        ("code", DataValue::from(code)),
        ("names", DataValue::from(locale.continent_names.clone())),
    ])
}

fn country_map(geoname_id: i32, locale: &LocaleRecord) -> DataValue {
    DataValue::map_from([
        ("geoname_id", DataValue::Int32(geoname_id)),
        ("iso_code", DataValue::from(locale.country_iso_code.as_str())),
        ("names", DataValue::from(locale.country_names.clone())),
    ])
}

fn registered_country_map(geoname_id: i32, locales: &LocaleIndex) -> DataValue {
    country_map(geoname_id, locales.get(geoname_id))
}

fn parse_network(record: &StringRecord) -> Result<Network> {
    record[0].trim().parse().map_err(|e| match e {
        EnrichError::InvalidNetwork(msg) => {
            EnrichError::InvalidNetwork(format!("line {}: {}", line_of(record), msg))
        }
        other => other,
    })
}

fn require_columns(record: &StringRecord, expected: usize) -> Result<()> {
    if record.len() < expected {
        return Err(EnrichError::Csv(format!(
            "line {}: expected {} columns, found {}",
            line_of(record),
            expected,
            record.len()
        )));
    }
    Ok(())
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locale::LocaleRow;

    fn germany_index() -> LocaleIndex {
        let mut index = LocaleIndex::new();
        for fields in [
            ["1", "en", "EU", "Europe", "DE", "Germany", "1"],
            ["1", "de", "EU", "Europe", "DE", "Deutschland", "1"],
        ] {
            let row = LocaleRow::from_country_record(&StringRecord::from(fields.to_vec())).unwrap();
            index.ingest(&row);
        }
        index
    }

    fn text(value: &DataValue, path: &[&str]) -> String {
        value.get_path(path).and_then(DataValue::as_str).unwrap().to_string()
    }

    fn int(value: &DataValue, path: &[&str]) -> i32 {
        value.get_path(path).and_then(DataValue::as_i32).unwrap()
    }

    #[test]
    fn test_country_record_joins_locales() {
        let index = germany_index();
        let record = StringRecord::from(vec!["10.0.0.0/24", "1", "1"]);
        let (network, value) = assemble(Dataset::Country, &record, &index).unwrap();

        assert_eq!(network.to_string(), "10.0.0.0/24");
        assert_eq!(text(&value, &["country", "iso_code"]), "DE");
        assert_eq!(text(&value, &["country", "names", "en"]), "Germany");
        assert_eq!(text(&value, &["country", "names", "de"]), "Deutschland");
        assert_eq!(int(&value, &["country", "geoname_id"]), 1);
        assert_eq!(text(&value, &["continent", "code"]), "EU");
        assert_eq!(int(&value, &["continent", "geoname_id"]), 6255148);
        assert_eq!(text(&value, &["registered_country", "iso_code"]), "DE");
    }

    #[test]
    fn test_unknown_geoname_falls_back_to_empty() {
        let index = germany_index();
        let record = StringRecord::from(vec!["10.0.0.0/24", "", "999"]);
        let (_, value) = assemble(Dataset::Country, &record, &index).unwrap();

        assert_eq!(int(&value, &["country", "geoname_id"]), -1);
        assert_eq!(text(&value, &["country", "iso_code"]), "");
        assert_eq!(
            value.get_path(&["country", "names"]),
            Some(&DataValue::empty_map())
        );
        assert_eq!(text(&value, &["continent", "code"]), "");
        assert_eq!(int(&value, &["continent", "geoname_id"]), 0);
        assert_eq!(int(&value, &["registered_country", "geoname_id"]), 999);
        assert_eq!(text(&value, &["registered_country", "iso_code"]), "");
    }

    #[test]
    fn test_city_record_shape() {
        let index = germany_index();
        let record = StringRecord::from(vec![
            "2001:db8::/32", "1", "1", "", "0", "0", "10115", "52.5", "13.4", "20",
        ]);
        let (network, value) = assemble(Dataset::City, &record, &index).unwrap();

        assert_eq!(network.to_string(), "2001:db8::/32");
        assert_eq!(int(&value, &["city", "geoname_id"]), 1);
        assert_eq!(int(&value, &["country", "geoname_id"]), -1);
        assert_eq!(text(&value, &["country", "iso_code"]), "DE");
        assert_eq!(int(&value, &["location", "accuracy_radius"]), -1);
        assert_eq!(
            value.get_path(&["location", "latitude"]),
            Some(&DataValue::Float(-1.0))
        );
        assert_eq!(text(&value, &["location", "time_zone"]), "");
        assert_eq!(text(&value, &["postal", "code"]), "");

        let subdivisions = match value.get("subdivisions") {
            Some(DataValue::Array(items)) => items,
            other => panic!("unexpected subdivisions: {:?}", other),
        };
        assert_eq!(subdivisions.len(), 1);
        assert_eq!(int(&subdivisions[0], &["geoname_id"]), -1);

        let keys: Vec<_> = value.as_map().unwrap().keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "city",
                "continent",
                "country",
                "location",
                "postal",
                "registered_country",
                "subdivisions"
            ]
        );
    }

    #[test]
    fn test_asn_record_keeps_number_as_text() {
        let record = StringRecord::from(vec!["1.0.0.0/24", "13335", "CLOUDFLARENET"]);
        let (network, value) = assemble(Dataset::Asn, &record, &LocaleIndex::new()).unwrap();

        assert_eq!(network.to_string(), "1.0.0.0/24");
        assert_eq!(text(&value, &["autonomous_system_number"]), "13335");
        assert_eq!(
            text(&value, &["autonomous_system_organization"]),
            "CLOUDFLARENET"
        );
    }

    #[test]
    fn test_malformed_network_is_fatal() {
        let record = StringRecord::from(vec!["10.0.0.0/33", "1", "1"]);
        let err = assemble(Dataset::Country, &record, &germany_index()).unwrap_err();
        assert!(matches!(err, EnrichError::InvalidNetwork(_)));

        let record = StringRecord::from(vec!["not-a-network", "1", "1"]);
        assert!(matches!(
            assemble(Dataset::Asn, &record, &LocaleIndex::new()),
            Err(EnrichError::InvalidNetwork(_))
        ));
    }

    #[test]
    fn test_short_row_is_csv_error() {
        let record = StringRecord::from(vec!["10.0.0.0/24"]);
        assert!(matches!(
            assemble(Dataset::Country, &record, &LocaleIndex::new()),
            Err(EnrichError::Csv(_))
        ));
    }
}
