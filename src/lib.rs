//! secret-deployer mounts secrets into deployments that ask for them via labels.
//!
//! The process list-watches deployments into a local cache. Every newly observed
//! deployment is queued by key; workers then check the labels of the cached
//! copy and, for deployments labelled `app=secret-deployer`, mount the secret
//! named by the `secret-name` label into every container of the pod template.
//! An optional `secret-keys` label restricts the mount to a `.`-separated list
//! of keys.
//!
//! Reconciliation is idempotent: the desired volume and mounts are compared with
//! the live object and a write is only issued when they differ. Failed passes,
//! including write conflicts, are retried with per-key exponential backoff.

pub mod config;
pub use config::Config;
pub mod queue;
pub mod reconciler;
mod runner;
pub use runner::{run, run_workers, worker, RunError};
pub mod subscriber;
