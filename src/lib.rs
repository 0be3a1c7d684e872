pub mod engine;
pub mod gateway;
pub mod model;
pub mod notify;
pub mod observability;
pub mod registry;
pub mod scheduler;
pub mod wal;

pub use engine::{Engine, EngineConfig, EngineError, RentalFilter, SlotReleasePolicy};
pub use scheduler::ReconcilerConfig;
