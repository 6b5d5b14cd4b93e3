//! Consolidated test modules.
//!
//! End-to-end scenarios that drive the retention job through configuration,
//! the cluster schedule and a record store.
