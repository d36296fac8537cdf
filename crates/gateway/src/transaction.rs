use serde::{Deserialize, Serialize};
use std::fmt::Display;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "XOF")]
    Xof,
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xof => write!(f, "XOF"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub phone: String,
}

impl CustomerInfo {
    /// Splits a free-form full name on its first whitespace run. A single
    /// word is used for both name fields since the gateway requires both.
    pub fn from_full_name(full_name: &str, phone: impl Into<String>) -> Self {
        let full_name = full_name.trim();
        let (first_name, last_name) = full_name
            .split_once(char::is_whitespace)
            .map_or((full_name, full_name), |(first, rest)| {
                (first, rest.trim_start())
            });

        Self {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: None,
            phone: phone.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub order_id: String,
}

/// Body of the transaction creation call. `amount` is in whole currency
/// units; XOF has no minor unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub amount: u64,
    pub description: String,
    pub currency: Currency,
    pub callback_url: Url,
    pub customer: CustomerInfo,
    pub metadata: TransactionMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedTransaction {
    pub transaction_id: String,
    pub hosted_payment_url: Url,
    pub token: String,
}

/// Outcome reported by the gateway when it calls us back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackStatus {
    Approved,
    Canceled,
    Declined,
    Other(String),
}

impl CallbackStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => Self::Approved,
            "canceled" | "cancelled" => Self::Canceled,
            "declined" => Self::Declined,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Approved => "approved",
            Self::Canceled => "canceled",
            Self::Declined => "declined",
            Self::Other(raw) => raw,
        }
    }
}

impl Display for CallbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
