//! Infrastructure layer: configuration, persistence, the remote ledger adapter
//! and the reconciliation pipeline itself.

pub mod config;
pub mod external;
pub mod pipeline;
pub mod store;
pub mod testing;

pub use config::{Settings, SettingsError};
pub use external::JsonRpcLedger;
pub use pipeline::{DriverError, DriverHandle, PassOutcome, PassReport, SchedulerDriver};
pub use store::{InMemoryPipelineStore, PipelineStore, PostgresPipelineStore, StoreError};
