//! Provider implementations for Conduit.
//!
//! This crate provides concrete implementations of the `Provider` trait and
//! the registry that maps backend type names to them.
//!
//! # Built-in Providers
//!
//! - **generic**: JSON-over-HTTP backend with bearer authentication
//! - **claude**: the same protocol, flavoured for an AI-assistant service
//! - **mock**: in-process echo for development and tests

pub mod http;
pub mod mock;
pub mod registry;

pub use http::{HttpFlavor, HttpProvider};
pub use mock::MockProvider;
pub use registry::{
    ProviderConstructor, ProviderRegistration, ProviderRegistry, ProviderSummary, RegistryError,
};
