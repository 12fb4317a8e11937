//! Controller settings.

use std::{env::var, num::ParseIntError};

use thiserror::Error;

/// Value of the `app` label that opts a workload in.
pub const CONTROLLER_NAME: &str = "secret-deployer";

/// Label that has to equal [`CONTROLLER_NAME`] for a workload to be handled.
pub const OPT_IN_LABEL: &str = "app";
/// Mandatory once opted in: names the secret to mount.
pub const SECRET_NAME_LABEL: &str = "secret-name";
/// Optional: keys of the secret to project, separated by [`SECRET_KEYS_SEPARATOR`].
pub const SECRET_KEYS_LABEL: &str = "secret-keys";
pub const SECRET_KEYS_SEPARATOR: char = '.';

pub const DEFAULT_MOUNT_PATH: &str = "/etc/secret-deployer-data/";
pub const VOLUME_NAME_SUFFIX: &str = "-secret-volume";

pub const WORKERS_ENV: &str = "SECRET_DEPLOYER_WORKERS";
pub const NAMESPACE_ENV: &str = "SECRET_DEPLOYER_NAMESPACE";

#[derive(Debug, Error)]
pub enum Error {
    #[error("{} must be a positive integer: {}", WORKERS_ENV, .0)]
    InvalidWorkers(ParseIntError),
    #[error("{} must be at least 1", WORKERS_ENV)]
    NoWorkers,
}

/// Parameters for [`run`](crate::run) and the [`Reconciler`](crate::reconciler::Reconciler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Value the opt-in label must carry.
    pub identity: String,
    pub mount_path: String,
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Restricts the watch to a single namespace when set.
    pub namespace: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: CONTROLLER_NAME.to_owned(),
            mount_path: DEFAULT_MOUNT_PATH.to_owned(),
            workers: 1,
            namespace: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(workers) = lookup(WORKERS_ENV) {
            config = config.with_workers(workers.trim().parse().map_err(Error::InvalidWorkers)?)?;
        }
        if let Some(namespace) = lookup(NAMESPACE_ENV).filter(|ns| !ns.is_empty()) {
            config = config.with_namespace(namespace);
        }

        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Result<Self, Error> {
        if workers == 0 {
            return Err(Error::NoWorkers);
        }
        self.workers = workers;
        Ok(self)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}
