//! Application layer - Use case services.
//!
//! Services are thin orchestrators that:
//! - Accept domain types as inputs
//! - Use ports (traits) and backends for external dependencies
//! - Return domain types as outputs

mod forwarding_service;

pub use forwarding_service::{ForwardingService, StartOptions, StartOutcome};
