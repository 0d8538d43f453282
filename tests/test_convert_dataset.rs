// End-to-end conversion of small GeoLite2-style CSV directories

use mmdb_enrich::converter::{convert_all, convert_dataset, Converter, Dataset};
use mmdb_enrich::data_section::DataValue;
use mmdb_enrich::error::EnrichError;
use mmdb_enrich::mmdb::Database;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tempfile::TempDir;

const COUNTRY_LOCALE_HEADER: &str = "geoname_id,locale_code,continent_code,continent_name,\
country_iso_code,country_name,is_in_european_union";

const COUNTRY_BLOCKS_HEADER: &str = "network,geoname_id,registered_country_geoname_id,\
represented_country_geoname_id,is_anonymous_proxy,is_satellite_provider";

const CITY_LOCALE_HEADER: &str = "geoname_id,locale_code,continent_code,continent_name,\
country_iso_code,country_name,subdivision_1_iso_code,subdivision_1_name,subdivision_2_iso_code,\
subdivision_2_name,city_name,metro_code,time_zone,is_in_european_union";

const CITY_BLOCKS_HEADER: &str = "network,geoname_id,registered_country_geoname_id,\
represented_country_geoname_id,is_anonymous_proxy,is_satellite_provider,postal_code,latitude,\
longitude,accuracy_radius";

const ASN_BLOCKS_HEADER: &str =
    "network,autonomous_system_number,autonomous_system_organization";

fn write_csv(dir: &Path, name: &str, header: &str, rows: &[&str]) {
    fs::create_dir_all(dir).unwrap();
    let mut contents = String::from(header);
    contents.push('\n');
    for row in rows {
        contents.push_str(row);
        contents.push('\n');
    }
    fs::write(dir.join(name), contents).unwrap();
}

fn country_fixture(root: &Path) {
    let dir = root.join("GeoLite2-Country");
    write_csv(
        &dir,
        "GeoLite2-Country-Locations-en.csv",
        COUNTRY_LOCALE_HEADER,
        &[
            "1,en,EU,Europe,DE,Germany,1",
            "2,en,NA,\"North America\",US,\"United States\",0",
        ],
    );
    write_csv(
        &dir,
        "GeoLite2-Country-Locations-de.csv",
        COUNTRY_LOCALE_HEADER,
        &[
            "1,de,EU,Europe,DE,Deutschland,1",
            "2,de,NA,Nordamerika,US,\"Vereinigte Staaten\",0",
        ],
    );
    write_csv(
        &dir,
        "GeoLite2-Country-Blocks-IPv4.csv",
        COUNTRY_BLOCKS_HEADER,
        &[
            "10.0.0.0/24,1,1,,0,0",
            "10.0.0.128/25,2,2,,0,0",
            "192.0.2.0/24,,2,,0,0",
        ],
    );
    write_csv(
        &dir,
        "GeoLite2-Country-Blocks-IPv6.csv",
        COUNTRY_BLOCKS_HEADER,
        &["2001:db8::/32,2,2,,0,0"],
    );
}

fn city_fixture(root: &Path) {
    let dir = root.join("GeoLite2-City");
    write_csv(
        &dir,
        "GeoLite2-City-Locations-en.csv",
        CITY_LOCALE_HEADER,
        &["2950159,en,EU,Europe,DE,Germany,BE,\"Land Berlin\",,,Berlin,,Europe/Berlin,1"],
    );
    write_csv(
        &dir,
        "GeoLite2-City-Blocks-IPv4.csv",
        CITY_BLOCKS_HEADER,
        &["10.1.0.0/16,2950159,2950159,,0,0,10115,52.5200,13.4050,20"],
    );
    write_csv(&dir, "GeoLite2-City-Blocks-IPv6.csv", CITY_BLOCKS_HEADER, &[]);
}

fn asn_fixture(root: &Path) {
    let dir = root.join("GeoLite2-ASN");
    write_csv(
        &dir,
        "GeoLite2-ASN-Blocks-IPv4.csv",
        ASN_BLOCKS_HEADER,
        &["1.0.0.0/24,13335,CLOUDFLARENET"],
    );
    write_csv(
        &dir,
        "GeoLite2-ASN-Blocks-IPv6.csv",
        ASN_BLOCKS_HEADER,
        &["2606:4700::/32,13335,CLOUDFLARENET"],
    );
}

fn lookup(db: &Database, addr: &str) -> DataValue {
    db.lookup(addr.parse().unwrap())
        .unwrap()
        .unwrap_or_else(|| panic!("no record for {}", addr))
        .data
}

fn text<'a>(value: &'a DataValue, path: &[&str]) -> &'a str {
    value
        .get_path(path)
        .and_then(DataValue::as_str)
        .unwrap_or_else(|| panic!("missing {:?}", path))
}

#[test]
fn test_country_locales_are_joined() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    country_fixture(input.path());

    let out_path = output.path().join("GeoLite2-Country.mmdb");
    let stats = convert_dataset(
        Dataset::Country,
        &input.path().join("GeoLite2-Country"),
        &out_path,
    )
    .unwrap();
    assert_eq!(stats.locale_files, 2);
    assert_eq!(stats.locale_rows, 4);
    assert_eq!(stats.geoname_ids, 2);
    assert_eq!(stats.block_rows, 4);
    assert_eq!(stats.networks, 4);

    let db = Database::open(&out_path).unwrap();
    assert_eq!(db.database_type(), Some("GeoLite2-Country"));
    assert_eq!(
        db.metadata().get("languages"),
        Some(&DataValue::Array(vec!["de".into(), "en".into()]))
    );

    let record = lookup(&db, "10.0.0.5");
    assert_eq!(text(&record, &["country", "names", "en"]), "Germany");
    assert_eq!(text(&record, &["country", "names", "de"]), "Deutschland");
    assert_eq!(text(&record, &["country", "iso_code"]), "DE");
    assert_eq!(text(&record, &["continent", "code"]), "EU");
    assert_eq!(
        record.get_path(&["continent", "geoname_id"]),
        Some(&DataValue::Int32(6255148))
    );

    // The nested /25 wins inside the /24
    let record = lookup(&db, "10.0.0.200");
    assert_eq!(text(&record, &["country", "iso_code"]), "US");
    assert_eq!(
        text(&record, &["country", "names", "de"]),
        "Vereinigte Staaten"
    );

    let record = lookup(&db, "2001:db8::1");
    assert_eq!(text(&record, &["continent", "code"]), "NA");
}

#[test]
fn test_missing_geoname_id_uses_sentinels() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    country_fixture(input.path());

    let out_path = output.path().join("country.mmdb");
    convert_dataset(
        Dataset::Country,
        &input.path().join("GeoLite2-Country"),
        &out_path,
    )
    .unwrap();

    let db = Database::open(&out_path).unwrap();
    let record = lookup(&db, "192.0.2.10");
    assert_eq!(
        record.get_path(&["country", "geoname_id"]),
        Some(&DataValue::Int32(-1))
    );
    assert_eq!(
        record.get_path(&["country", "names"]),
        Some(&DataValue::empty_map())
    );
    assert_eq!(
        record.get_path(&["continent", "geoname_id"]),
        Some(&DataValue::Int32(0))
    );
    // Registered country still resolves through the same index
    assert_eq!(text(&record, &["registered_country", "iso_code"]), "US");
}

#[test]
fn test_city_records() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    city_fixture(input.path());

    let out_path = output.path().join("GeoLite2-City.mmdb");
    convert_dataset(Dataset::City, &input.path().join("GeoLite2-City"), &out_path).unwrap();

    let db = Database::open(&out_path).unwrap();
    let record = lookup(&db, "10.1.2.3");
    assert_eq!(text(&record, &["city", "names", "en"]), "Berlin");
    assert_eq!(
        record.get_path(&["city", "geoname_id"]),
        Some(&DataValue::Int32(2950159))
    );
    assert_eq!(
        record.get_path(&["country", "geoname_id"]),
        Some(&DataValue::Int32(-1))
    );
    assert_eq!(text(&record, &["country", "iso_code"]), "DE");
    assert_eq!(
        record.get_path(&["location", "latitude"]),
        Some(&DataValue::Float(-1.0))
    );
    assert_eq!(text(&record, &["postal", "code"]), "");
    assert!(matches!(record.get("subdivisions"), Some(DataValue::Array(items)) if items.len() == 1));
}

#[test]
fn test_asn_records() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    asn_fixture(input.path());

    let out_path = output.path().join("GeoLite2-ASN.mmdb");
    let stats =
        convert_dataset(Dataset::Asn, &input.path().join("GeoLite2-ASN"), &out_path).unwrap();
    assert_eq!(stats.locale_files, 0);
    assert_eq!(stats.block_rows, 2);

    let db = Database::open(&out_path).unwrap();
    for addr in ["1.0.0.1", "2606:4700::1111"] {
        let record = lookup(&db, addr);
        assert_eq!(text(&record, &["autonomous_system_number"]), "13335");
        assert_eq!(
            text(&record, &["autonomous_system_organization"]),
            "CLOUDFLARENET"
        );
    }
    assert!(db.lookup("1.0.1.1".parse().unwrap()).unwrap().is_none());
}

#[test]
fn test_malformed_cidr_writes_nothing() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    country_fixture(input.path());
    write_csv(
        &input.path().join("GeoLite2-Country"),
        "GeoLite2-Country-Blocks-IPv6.csv",
        COUNTRY_BLOCKS_HEADER,
        &["2001:db8::/32,2,2,,0,0", "2001:db8:zz::/48,2,2,,0,0"],
    );

    let out_path = output.path().join("GeoLite2-Country.mmdb");
    let err = convert_dataset(
        Dataset::Country,
        &input.path().join("GeoLite2-Country"),
        &out_path,
    )
    .unwrap_err();

    assert!(matches!(err, EnrichError::InvalidNetwork(_)), "{:?}", err);
    assert!(!out_path.exists());
}

#[test]
fn test_convert_all_writes_each_edition() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    asn_fixture(input.path());
    country_fixture(input.path());
    city_fixture(input.path());

    let stats = convert_all(input.path(), output.path(), &Dataset::ALL).unwrap();
    assert_eq!(
        stats.iter().map(|s| s.dataset).collect::<Vec<_>>(),
        Dataset::ALL.to_vec()
    );

    for name in [
        "GeoLite2-ASN.mmdb",
        "GeoLite2-Country.mmdb",
        "GeoLite2-City.mmdb",
    ] {
        let db = Database::open(&output.path().join(name)).unwrap();
        assert_eq!(
            db.database_type(),
            Some(name.trim_end_matches(".mmdb"))
        );
    }
}

#[test]
fn test_convert_all_stops_at_first_failure() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    asn_fixture(input.path());
    // No Country directory

    let err = convert_all(
        input.path(),
        output.path(),
        &[Dataset::Asn, Dataset::Country, Dataset::City],
    )
    .unwrap_err();
    assert!(matches!(err, EnrichError::Io(_)), "{:?}", err);
    assert!(output.path().join("GeoLite2-ASN.mmdb").exists());
    assert!(!output.path().join("GeoLite2-City.mmdb").exists());
}

#[test]
fn test_written_file_matches_loaded_tree() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    country_fixture(input.path());
    let dir = input.path().join("GeoLite2-Country");

    let converter = Converter::new().with_build_epoch(1_700_000_000);
    let loaded = converter.load(Dataset::Country, &dir).unwrap();
    let out_path = output.path().join("GeoLite2-Country.mmdb");
    converter
        .convert_dataset(Dataset::Country, &dir, &out_path)
        .unwrap();
    let db = Database::open(&out_path).unwrap();

    assert_eq!(
        db.metadata().get("build_epoch"),
        Some(&DataValue::Uint64(1_700_000_000))
    );

    for (network, data) in loaded.tree.entries() {
        let addr: IpAddr = network.addr();
        let hit = db.lookup(addr).unwrap().unwrap();
        assert_eq!(&hit.data, loaded.tree.lookup(addr).unwrap().data);
        assert_eq!(loaded.tree.get(&network), Some(data));
    }
}
