//! Event source feeding observed objects into the work queue.

use std::{fmt, str::FromStr};

use kube_core::Resource;

use crate::queue::WorkQueue;

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Returns `None` for objects that have not been assigned a name yet.
    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        Some(Self {
            namespace: resource.meta().namespace.clone(),
            name: resource.meta().name.clone()?,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseKeyError {
    #[error("object key is empty")]
    Empty,
    #[error("unexpected key format: {0:?}")]
    Format(String),
}

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(""), None, None) => Err(ParseKeyError::Empty),
            (Some(name), None, None) => Ok(Self {
                namespace: None,
                name: name.to_owned(),
            }),
            (Some(namespace), Some(name), None) if !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(ParseKeyError::Format(s.to_owned())),
        }
    }
}

/// Receives notifications about objects observed by [`observe`].
///
/// Implementations are called inline from the watch task and must not block.
pub trait ResourceEventHandler<K> {
    /// Called once for every object that was not yet known to the store.
    fn on_add(&self, obj: &K);
}

/// Forwards the key of every added object into a [`WorkQueue`].
#[derive(Clone)]
pub struct QueueingHandler {
    queue: WorkQueue<ObjectKey>,
}

impl QueueingHandler {
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self {
        Self { queue }
    }
}

impl<K: Resource> ResourceEventHandler<K> for QueueingHandler {
    fn on_add(&self, obj: &K) {
        match ObjectKey::from_resource(obj) {
            Some(key) => self.queue.add(key),
            None => log::warn!("Ignoring observed object without a name"),
        }
    }
}

pub mod objects;
pub use objects::{objects, observe, SyncSignal};
