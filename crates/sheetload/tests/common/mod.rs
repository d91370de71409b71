//! Shared test utilities for sheetload integration tests.
//!
//! - `TestService` runs a real `IngestService` on an in-memory database and a
//!   bucket in a temp directory
//! - builders produce CSV and XLSX bytes without fixture files

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{test_config, TestService};
