//! Hooks attached to backends.
//!
//! A hook is a stored [`HookDescriptor`] naming a lifecycle point and a
//! fixed [`HookAction`]. The pipeline loads a backend's hooks once per call
//! and hands them to a [`HookRunner`] at each point.

pub mod runner;
pub mod types;

pub use runner::HookRunner;
pub use types::{HookAction, HookDescriptor, HookPoint};
