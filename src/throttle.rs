//! Two-level admission: a global ceiling plus one ceiling per resource.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("no resources configured")]
    NoResources,
    #[error("semaphore closed")]
    Closed,
}

/// Configured resources and their semaphores.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    names: Vec<String>,
    global: Arc<Semaphore>,
    per_resource: HashMap<String, Arc<Semaphore>>,
}

impl ResourcePool {
    /// `limits` pairs each resource with its own ceiling; zero ceilings count as one.
    pub fn new<I, S>(limits: I, global: usize) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut per_resource = HashMap::new();
        for (name, limit) in limits {
            let name = name.into();
            if per_resource.contains_key(&name) {
                continue;
            }
            per_resource.insert(name.clone(), Arc::new(Semaphore::new(limit.max(1))));
            names.push(name);
        }
        Self {
            names,
            global: Arc::new(Semaphore::new(global.max(1))),
            per_resource,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.per_resource.contains_key(resource)
    }

    /// Resource for the next call: the pinned one when continuing a session,
    /// otherwise a uniformly random configured resource.
    pub fn pick(&self, pinned: Option<&str>) -> Result<String, ThrottleError> {
        if let Some(resource) = pinned {
            return if self.contains(resource) {
                Ok(resource.to_string())
            } else {
                Err(ThrottleError::UnknownResource(resource.to_string()))
            };
        }
        self.names
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ThrottleError::NoResources)
    }

    pub async fn acquire_global(&self) -> Result<OwnedSemaphorePermit, ThrottleError> {
        self.global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ThrottleError::Closed)
    }

    pub async fn acquire(&self, resource: &str) -> Result<OwnedSemaphorePermit, ThrottleError> {
        let sem = self
            .per_resource
            .get(resource)
            .ok_or_else(|| ThrottleError::UnknownResource(resource.to_string()))?;
        sem.clone()
            .acquire_owned()
            .await
            .map_err(|_| ThrottleError::Closed)
    }

    /// Free slots on `resource`, for diagnostics.
    pub fn available(&self, resource: &str) -> Option<usize> {
        self.per_resource.get(resource).map(|s| s.available_permits())
    }

    pub fn global_available(&self) -> usize {
        self.global.available_permits()
    }
}
