use anyhow::{Context, Result};
use mmdb_enrich::{DataValue, Database};
use serde_json::json;
use std::path::PathBuf;

use crate::cli_utils::{data_value_to_json, format_bytes, join_strings};

pub fn cmd_inspect(database: PathBuf, json_output: bool) -> Result<()> {
    let db = Database::open(&database)
        .with_context(|| format!("Failed to load database: {}", database.display()))?;
    let metadata = db.metadata();

    if json_output {
        let output = json!({
            "file": database.display().to_string(),
            "size": db.size(),
            "node_count": db.node_count(),
            "record_size": db.record_size().bits(),
            "ip_version": db.ip_version(),
            "metadata": data_value_to_json(metadata),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Database:      {}", database.display());
    println!("Type:          {}", db.database_type().unwrap_or("(unknown)"));
    println!("Size:          {}", format_bytes(db.size()));
    println!("IP version:    {}", db.ip_version());
    println!("Tree nodes:    {}", db.node_count());
    println!("Record size:   {} bits", db.record_size().bits());
    println!("Languages:     {}", join_strings(metadata.get("languages")));
    if let Some(epoch) = metadata.get("build_epoch").and_then(DataValue::as_u64) {
        println!("Build epoch:   {}", epoch);
    }
    if let Some(DataValue::Map(descriptions)) = metadata.get("description") {
        println!();
        println!("Description:");
        for (lang, text) in descriptions {
            if let Some(text) = text.as_str() {
                println!("  {}: {}", lang, text);
            }
        }
    }

    Ok(())
}
