//! Branch Warden - keeps Gitea branch protection in line with declared policy.
//!
//! Each organization declares, per repository, which branch-name patterns must
//! be protected and with which protection parameters. The service watches
//! branch notifications and bulk-sync requests, works out which branches need
//! protection, and applies it through the Gitea API with bounded concurrency.

pub mod cache;
pub mod config;
pub mod gitea;
pub mod ingest;
pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod types;
pub mod webhooks;

#[cfg(test)]
pub mod test_utils;
