use async_trait::async_trait;
use clap::Parser;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::{
    GatewayError, HostedTransaction, PaymentGateway, SupportedGateway, TransactionRequest,
};

#[derive(Parser, Debug, Clone)]
pub struct GatewayEnv {
    #[clap(long = "gateway-base-url", env, default_value = "https://api.fedapay.com")]
    pub gateway_base_url: String,
    #[clap(long = "gateway-secret-key", env, default_value = "")]
    pub gateway_secret_key: String,
    /// Public URL the gateway redirects to and calls once the customer is done
    #[clap(
        long = "gateway-callback-url",
        env,
        default_value = "http://127.0.0.1:8080/payments/callback"
    )]
    pub gateway_callback_url: Url,
    /// Upper bound on a single transaction creation call
    #[clap(long = "gateway-timeout-secs", env, default_value = "30")]
    pub gateway_timeout_secs: u64,
}

impl GatewayEnv {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransactionResponse {
    transaction_id: Option<String>,
    hosted_payment_url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    env: GatewayEnv,
}

impl HttpGateway {
    pub fn new(env: GatewayEnv) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(env.timeout())
            .build()
            .map_err(GatewayError::Reqwest)?;

        Ok(Self { client, env })
    }

    fn classify(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout {
                timeout_secs: self.env.gateway_timeout_secs,
            }
        } else {
            GatewayError::Reqwest(err)
        }
    }
}

fn parse_hosted_transaction(body: &str) -> Result<HostedTransaction, GatewayError> {
    const ACTION: &str = "create transaction";

    let malformed = |reason: String| GatewayError::MalformedResponse {
        action: ACTION.to_string(),
        reason,
    };

    let response: CreateTransactionResponse =
        serde_json::from_str(body).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let non_empty = |field: Option<String>, name: &str| {
        field
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| malformed(format!("missing {name}")))
    };

    let transaction_id = non_empty(response.transaction_id, "transactionId")?;
    let token = non_empty(response.token, "token")?;
    let hosted_payment_url = non_empty(response.hosted_payment_url, "hostedPaymentUrl")?;
    let hosted_payment_url = Url::parse(&hosted_payment_url)
        .map_err(|e| malformed(format!("invalid hostedPaymentUrl: {e}")))?;

    Ok(HostedTransaction {
        transaction_id,
        hosted_payment_url,
        token,
    })
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<HostedTransaction, GatewayError> {
        let headers = [
            (
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", self.env.gateway_secret_key))?,
            ),
            (header::ACCEPT, HeaderValue::from_str("application/json")?),
        ]
        .into_iter()
        .collect::<HeaderMap>();

        let url = Url::parse(&self.env.gateway_base_url)?.join("v1/transactions")?;
        debug!(%url, amount = request.amount, order_id = %request.metadata.order_id, "Creating gateway transaction");

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            warn!(%status, "Gateway refused transaction creation");
            return Err(GatewayError::RequestFailed {
                action: "create transaction".to_string(),
                status,
                body,
            });
        }

        parse_hosted_transaction(&body)
    }

    fn to_supported_gateway(&self) -> SupportedGateway {
        SupportedGateway::Http
    }
}
