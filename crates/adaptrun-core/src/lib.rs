//! Adaptrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/broker clients
//! - The Kubernetes API
//! - Runtime specifics
//!
//! All types here represent the per-request state threaded through the
//! adaptation pipeline: download, execution, upload, reply.

pub mod context;
pub mod headers;
pub mod ids;

// Re-export commonly used types
pub use context::{AdaptationContext, BrokerEndpoints, ContextSettings, ResourceBounds};
pub use ids::RequestId;
