//! `remitsync-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod identifier;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, WorkItemId};
pub use identifier::TaxIdentifier;
