// REST search backend implementation
use crate::application::query_backend::{QueryBackend, QueryRequest};
use crate::domain::result::ResultSet;
use crate::infrastructure::settings::BackendSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RestSearchBackend {
    endpoint: String,
    auth_token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
    #[serde(default)]
    error: Option<String>,
}

impl RestSearchBackend {
    pub fn new(settings: BackendSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            auth_token: settings.auth_token,
            client,
        })
    }

    fn build_search_url(&self, request: &QueryRequest) -> String {
        let mut url = format!(
            "{}/search?q={}",
            self.endpoint,
            urlencoding::encode(&request.query)
        );
        for (name, value) in &request.parameters {
            url.push_str(&format!(
                "&{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            ));
        }
        url
    }
}

#[async_trait]
impl QueryBackend for RestSearchBackend {
    async fn run_query(&self, request: QueryRequest) -> Result<ResultSet> {
        let url = self.build_search_url(&request);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.auth_token))
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("search failed with status {}: {}", status, body);
        }

        let data = response
            .json::<SearchResponse>()
            .await
            .context("Failed to parse search response")?;

        if let Some(error) = data.error {
            anyhow::bail!("search error: {}", error);
        }

        Ok(normalize_times(ResultSet::new(data.fields, data.rows)))
    }
}

/// RFC3339 strings in a `_time` column become epoch milliseconds, so time
/// series stay plottable however the backend formats timestamps. Cells that
/// do not parse are left alone.
fn normalize_times(mut frame: ResultSet) -> ResultSet {
    let Some(index) = frame.fields.iter().position(|field| field == "_time") else {
        return frame;
    };
    for row in &mut frame.rows {
        let Some(cell) = row.get_mut(index) else {
            continue;
        };
        let Some(text) = cell.as_str() else {
            continue;
        };
        if let Ok(time) = chrono::DateTime::parse_from_rfc3339(text) {
            *cell = Value::from(time.timestamp_millis());
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn backend() -> RestSearchBackend {
        RestSearchBackend::new(BackendSettings {
            endpoint: "http://localhost:8089/".to_string(),
            auth_token: "secret".to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn search_urls_are_encoded() {
        let mut parameters = BTreeMap::new();
        parameters.insert("earliest".to_string(), "-24h@h".to_string());
        parameters.insert("latest".to_string(), "now".to_string());
        let url = backend().build_search_url(&QueryRequest {
            query: "search index=main | head 5".to_string(),
            parameters,
        });
        assert_eq!(
            url,
            "http://localhost:8089/search?q=search%20index%3Dmain%20%7C%20head%205&earliest=-24h%40h&latest=now"
        );
    }

    #[test]
    fn time_columns_normalize_to_epoch_millis() {
        let frame = ResultSet::new(
            vec!["_time".to_string(), "count".to_string()],
            vec![
                vec![json!("2024-05-01T00:00:00Z"), json!(3)],
                vec![json!("not a time"), json!(4)],
            ],
        );
        let normalized = normalize_times(frame);
        assert_eq!(normalized.rows[0][0], json!(1714521600000i64));
        assert_eq!(normalized.rows[1][0], json!("not a time"));
    }

    #[test]
    fn frames_without_a_time_column_pass_through() {
        let frame = ResultSet::new(
            vec!["color".to_string()],
            vec![vec![json!("2024-05-01T00:00:00Z")]],
        );
        let normalized = normalize_times(frame);
        assert_eq!(normalized.rows[0][0], json!("2024-05-01T00:00:00Z"));
    }
}
