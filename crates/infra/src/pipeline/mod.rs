//! The reconciliation pipeline: per-item processing and the driver that
//! schedules passes over batches.

pub mod driver;
pub mod processor;

pub use driver::{
    BatchSummary, BatchTrigger, DriverError, DriverHandle, PassOutcome, PassReport,
    SchedulerDriver,
};
pub use processor::{ItemProcessor, Processed};
