//! Derived analytics tables built from ingested source tables.

pub mod builder;

pub use builder::{AnalyticsBuilder, AnalyticsSummary, ENTRIES_COLUMN, SOURCE_TABLE_COLUMN, TOTAL_HOURS_COLUMN};
