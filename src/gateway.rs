use async_trait::async_trait;
use ulid::Ulid;

use crate::model::Cents;

/// Opaque payment-provider boundary. The engine only learns success or
/// failure; the provider protocol lives entirely behind this trait. Callers
/// wrap every invocation in a timeout and treat an elapsed deadline as a
/// failure, never as indefinitely pending.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Push `amount` back to the payer for the given refund.
    async fn execute_refund(&self, refund_id: Ulid, amount: Cents) -> Result<(), GatewayError>;
}

#[derive(Debug)]
pub struct GatewayError(pub String);

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gateway error: {}", self.0)
    }
}

impl std::error::Error for GatewayError {}

/// Gateway stub that acknowledges every refund. Used by the daemon when no
/// provider is wired in, and as a base case in tests.
pub struct AcceptAllGateway;

#[async_trait]
impl PaymentGateway for AcceptAllGateway {
    async fn execute_refund(&self, refund_id: Ulid, amount: Cents) -> Result<(), GatewayError> {
        tracing::debug!("gateway accepted refund {refund_id} for {amount}");
        Ok(())
    }
}
