//! Cluster-coordinated purging of stale records.

pub mod cache;
pub mod config;
pub mod observability;
pub mod retention;

#[cfg(test)]
mod tests;
