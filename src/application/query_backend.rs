// Query backend trait for search-type data source execution
use crate::domain::result::ResultSet;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A fully resolved search request: query text with every token reference
/// substituted, plus the resolved query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: String,
    pub parameters: BTreeMap<String, String>,
}

#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Execute one search and return its tabular result.
    async fn run_query(&self, request: QueryRequest) -> anyhow::Result<ResultSet>;
}
