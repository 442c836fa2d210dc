//! # vmfleet-model
//!
//! Entity types and pure rules for the vmfleet controller.
//!
//! ## Entities
//!
//! - [`Config`]: one per kind of machine; declares how many should exist
//! - [`Vm`]: one per numbered machine slot belonging to a config
//! - [`Project`]: a quota-reporting target
//!
//! ## Rules
//!
//! Everything in this crate is free of I/O:
//! - Desired-amount evaluation against time-windowed schedules
//! - Zone placeholder substitution for instance templates
//! - VM id and hostname synthesis
//! - Deterministic provider idempotency keys

mod attributes;
mod config;
mod error;
mod project;
mod vm;

pub use attributes::*;
pub use config::*;
pub use error::ModelError;
pub use project::Project;
pub use vm::*;
