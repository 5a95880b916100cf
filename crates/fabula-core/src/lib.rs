//! Shared foundation for the Fabula workspace: configuration, error kinds,
//! the event envelope and its typed payloads, identifier newtypes, and the
//! dependency-protection primitives (circuit breaker + health registry).

pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod types;
