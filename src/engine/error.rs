use ulid::Ulid;

use crate::model::Cents;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A state transition attempted from the wrong state. Benign to the
    /// reconciliation sweeps; a client error to request handlers.
    PreconditionFailed { id: Ulid, state: &'static str },
    SlotUnavailable(Ulid),
    UserHasActiveRental(Ulid),
    RefundExceedsPayment { requested: Cents, refundable: Cents },
    PaymentNotSettled(Ulid),
    GatewayFailure(String),
    LimitExceeded(&'static str),
    /// Transient store failure — safe to retry on the next tick.
    WalError(String),
}

impl EngineError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, EngineError::PreconditionFailed { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::PreconditionFailed { id, state } => {
                write!(f, "transition not allowed for {id} in state {state}")
            }
            EngineError::SlotUnavailable(id) => {
                write!(f, "no free slots on device {id}")
            }
            EngineError::UserHasActiveRental(id) => {
                write!(f, "user {id} already holds an active rental")
            }
            EngineError::RefundExceedsPayment {
                requested,
                refundable,
            } => {
                write!(
                    f,
                    "refund of {requested} exceeds refundable balance {refundable}"
                )
            }
            EngineError::PaymentNotSettled(id) => {
                write!(f, "payment {id} is not in a refundable state")
            }
            EngineError::GatewayFailure(msg) => write!(f, "payment gateway failure: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
