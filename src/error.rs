#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response shape: {0}")]
    Parse(String),

    #[error("Invalid selection: exchange '{exchange}', account '{account}'")]
    InvalidSelection { exchange: String, account: String },
}

impl From<reqwest::Error> for AggregatorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AggregatorError::Parse(err.to_string())
        } else {
            AggregatorError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AggregatorError {
    fn from(err: serde_json::Error) -> Self {
        AggregatorError::Parse(err.to_string())
    }
}
