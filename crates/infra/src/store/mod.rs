//! Pipeline persistence boundary.
//!
//! `InMemoryPipelineStore` serves tests and local runs; `PostgresPipelineStore`
//! is the durable implementation.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryPipelineStore;
pub use postgres::PostgresPipelineStore;
pub use r#trait::{PipelineStore, StoreError};
