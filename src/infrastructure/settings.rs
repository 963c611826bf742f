use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub backend: BackendSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendSettings {
    pub endpoint: String,
    pub auth_token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Load backend settings from `config/backend.*`, with `GLASSPANE_`
/// environment variables overriding file values.
pub fn load_backend_config() -> anyhow::Result<BackendConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/backend"))
        .add_source(config::Environment::with_prefix("GLASSPANE").separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[backend]\nendpoint = \"http://localhost:8089\"\nauth_token = \"secret\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let parsed: BackendConfig = settings.try_deserialize().unwrap();
        assert_eq!(parsed.backend.endpoint, "http://localhost:8089");
        assert_eq!(parsed.backend.timeout_secs, 30);
    }
}
