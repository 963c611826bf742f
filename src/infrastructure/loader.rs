// Definition loading - JSON documents from disk or memory
use crate::domain::definition::DashboardDefinition;
use crate::domain::error::DashboardError;
use std::path::Path;

/// Deserialize a definition document from a JSON string. Structural
/// validation happens when the definition is compiled at mount.
pub fn parse_definition(json: &str) -> Result<DashboardDefinition, DashboardError> {
    Ok(serde_json::from_str(json)?)
}

/// Read and deserialize a definition document from a file.
pub fn load_definition(path: impl AsRef<Path>) -> Result<DashboardDefinition, DashboardError> {
    let json = std::fs::read_to_string(path)?;
    parse_definition(&json)
}
