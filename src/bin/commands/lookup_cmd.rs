use anyhow::{Context, Result};
use mmdb_enrich::Database;
use serde_json::json;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::cli_utils::data_value_to_json;

pub fn cmd_lookup(database: PathBuf, ip: String) -> Result<()> {
    let addr: IpAddr = ip
        .trim()
        .parse()
        .with_context(|| format!("Invalid IP address: {}", ip))?;

    let db = Database::open(&database)
        .with_context(|| format!("Failed to load database: {}", database.display()))?;

    let result = db
        .lookup(addr)
        .with_context(|| format!("Lookup failed for: {}", addr))?;

    match result {
        Some(hit) => {
            let output = json!({
                "network": hit.network.to_string(),
                "prefix_len": hit.network.prefix_len(),
                "data": data_value_to_json(&hit.data),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        None => {
            println!("null");
            // Not found: exit code 1, like a failed grep
            std::process::exit(1);
        }
    }
}
