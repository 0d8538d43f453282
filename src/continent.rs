//! Continent catalog
//!
//! GeoLite2 locale rows only carry a two-letter continent code. The catalog
//! maps it to the continent's geoname id and English name.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

/// A continent known to the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continent {
    pub code: &'static str,
    pub geoname_id: i32,
    pub name: &'static str,
}

/// Stand-in for empty or unrecognized continent codes
pub const UNKNOWN_CONTINENT: Continent = Continent {
    code: "",
    geoname_id: 0,
    name: "",
};

const CONTINENTS: [Continent; 7] = [
    Continent { code: "AF", geoname_id: 6255146, name: "Africa" },
    Continent { code: "AN", geoname_id: 6255152, name: "Antarctica" },
    Continent { code: "AS", geoname_id: 6255147, name: "Asia" },
    Continent { code: "NA", geoname_id: 6255149, name: "North America" },
    Continent { code: "EU", geoname_id: 6255148, name: "Europe" },
    Continent { code: "OC", geoname_id: 6255151, name: "Oceania" },
    Continent { code: "SA", geoname_id: 6255150, name: "South America" },
];

static CATALOG: Lazy<FxHashMap<&'static str, Continent>> =
    Lazy::new(|| CONTINENTS.iter().map(|c| (c.code, *c)).collect());

/// Resolve a continent code, falling back to [`UNKNOWN_CONTINENT`]
pub fn lookup(code: &str) -> &'static Continent {
    CATALOG.get(code).unwrap_or(&UNKNOWN_CONTINENT)
}

/// All catalogued continents
pub fn all() -> &'static [Continent] {
    &CONTINENTS
}
