use std::{fs, path::Path};

use anyhow::Result;
use host_protocol::{AppState, Command, PluginDescriptor, PortMessage, TabMessage};
use schemars::{schema_for, Schema};
use tracing::info;

/// Write the JSON schemas of the wire types into `out_dir`. Returns the
/// file names written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir)?;
    let schemas: Vec<(&str, Schema)> = vec![
        ("command", schema_for!(Command)),
        ("port-message", schema_for!(PortMessage)),
        ("tab-message", schema_for!(TabMessage)),
        ("plugin-descriptor", schema_for!(PluginDescriptor)),
        ("app-state", schema_for!(AppState)),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, schema) in schemas {
        let filename = format!("{name}.schema.json");
        fs::write(out_dir.join(&filename), serde_json::to_string_pretty(&schema)?)?;
        written.push(filename);
    }
    info!("Wrote {} schemas to {}", written.len(), out_dir.display());
    Ok(written)
}
