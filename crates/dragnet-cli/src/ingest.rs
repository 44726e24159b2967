use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};

use dragnet_core::producer::Entity;

/// How to turn CSV rows into entities.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Column holding the business identifier, matched after normalisation.
    pub key_column: String,
    pub delimiter: u8,
}

/// Read every row of a CSV file as an [`Entity`].
pub fn read_entities(path: &Path, options: &CsvOptions) -> Result<Vec<Entity>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;
    entities_from_reader(file, options)
        .with_context(|| format!("Failed to read CSV: {}", path.display()))
}

/// Header names are trimmed and lowercased; blank cells become `null`.
/// The payload is the whole row as a JSON object.
pub fn entities_from_reader<R: Read>(reader: R, options: &CsvOptions) -> Result<Vec<Entity>> {
    let mut csv = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = csv
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    let key_column = options.key_column.trim().to_lowercase();
    let Some(key_index) = headers.iter().position(|h| *h == key_column) else {
        bail!(
            "Key column '{}' not found; available columns: {}",
            options.key_column,
            headers.join(", ")
        );
    };

    let mut entities = Vec::new();
    for (line, record) in csv.records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV record {}", line + 1))?;

        let mut row = Map::new();
        for (name, cell) in headers.iter().zip(record.iter()) {
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            row.insert(name.clone(), value);
        }
        let key = record.get(key_index).unwrap_or_default().to_string();
        entities.push(Entity::new(key, Value::Object(row)));
    }
    Ok(entities)
}
