use reqwest::header::InvalidHeaderValue;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to create header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("Request failed: {0}")]
    Reqwest(reqwest::Error),
    #[error("URL parsing failed: {0}")]
    Url(#[from] url::ParseError),
    #[error("{action} failed with status: {status}, body: {body}")]
    RequestFailed {
        action: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("Malformed gateway response for {action}: {reason}")]
    MalformedResponse { action: String, reason: String },
    #[error("Gateway did not answer within {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },
    #[error("Gateway rejected the transaction: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
