// Query result frames and the resolved option values handed to renderers
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A tabular query result: named columns over a grid of rows. This is the
/// typed result set the query backend produces and the shape inline data for
/// static sources is declared in. A column, addressed by name, is what the
/// pipeline dialect calls a series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(fields: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { fields, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Column values for the named field. Rows shorter than the field list
    /// yield nulls rather than truncating the series.
    pub fn series_by_name(&self, name: &str) -> Option<Vec<Value>> {
        let index = self.fields.iter().position(|field| field == name)?;
        Some(self.column(index))
    }

    /// Column name and values at a positional index.
    pub fn series_by_index(&self, index: usize) -> Option<(String, Vec<Value>)> {
        let name = self.fields.get(index)?.clone();
        Some((name, self.column(index)))
    }

    fn column(&self, index: usize) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| row.get(index).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// A visualization option after binding: literals pass through, templates
/// resolve to text, pipelines extract a series, a single point, or the whole
/// frame from a role's current result.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Literal(Value),
    Text(String),
    Series { name: String, values: Vec<Value> },
    Point(Value),
    Frame(Arc<ResultSet>),
}
