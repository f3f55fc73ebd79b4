//! HTTP surface of the reconciliation service: batch hand-off, trigger
//! endpoints, progress reporting and admin operations.

pub mod app;
