use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] figment::Error),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
