use async_trait::async_trait;
use std::fmt::{Debug, Display};
use std::sync::Arc;

pub mod error;
pub mod http;
pub mod transaction;

pub use error::GatewayError;
pub use http::{GatewayEnv, HttpGateway};
pub use test::TestGateway;
pub use transaction::{
    CallbackStatus, Currency, CustomerInfo, HostedTransaction, TransactionMetadata,
    TransactionRequest,
};

pub type DynGateway = Arc<dyn PaymentGateway>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedGateway {
    Http,
    DryRun,
}

impl Display for SupportedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

/// Hosted-checkout payment provider.
///
/// Implementations open a transaction and hand back the hosted page the
/// customer must be redirected to. The outcome is never returned here: it
/// arrives later through the provider's callback.
#[async_trait]
pub trait PaymentGateway: Debug + Send + Sync + 'static {
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<HostedTransaction, GatewayError>;

    fn to_supported_gateway(&self) -> SupportedGateway;
}
