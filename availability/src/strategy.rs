//! Registered forwarding paths and how their availability is computed.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug)]
enum PathSet {
    Active(HashSet<String>),
    /// Terminal: nothing registers after the service stopped.
    Stopped,
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First path of an empty set.
    Became,
    Added,
    Duplicate,
    Stopped,
}

/// Names of the paths currently forwarding on this node.
#[derive(Debug)]
pub struct PathRegistry {
    paths: RwLock<PathSet>,
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self {
            paths: RwLock::new(PathSet::Active(HashSet::new())),
        }
    }
}

impl PathRegistry {
    pub fn insert(&self, name: &str) -> Registration {
        match &mut *self.paths.write() {
            PathSet::Stopped => Registration::Stopped,
            PathSet::Active(paths) => {
                let was_empty = paths.is_empty();
                if !paths.insert(name.to_string()) {
                    Registration::Duplicate
                } else if was_empty {
                    Registration::Became
                } else {
                    Registration::Added
                }
            }
        }
    }

    /// Returns true when removing `name` emptied the set.
    pub fn remove(&self, name: &str) -> bool {
        match &mut *self.paths.write() {
            PathSet::Stopped => false,
            PathSet::Active(paths) => paths.remove(name) && paths.is_empty(),
        }
    }

    /// Switches to the stopped sentinel. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let mut paths = self.paths.write();
        if matches!(*paths, PathSet::Stopped) {
            return false;
        }
        *paths = PathSet::Stopped;
        true
    }

    pub fn is_stopped(&self) -> bool {
        matches!(*self.paths.read(), PathSet::Stopped)
    }

    pub fn is_available(&self) -> bool {
        match &*self.paths.read() {
            PathSet::Active(paths) => !paths.is_empty(),
            PathSet::Stopped => false,
        }
    }

    pub fn len(&self) -> usize {
        match &*self.paths.read() {
            PathSet::Active(paths) => paths.len(),
            PathSet::Stopped => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes the aggregate availability a watcher delivers.
#[async_trait]
pub trait AvailabilityStrategy: Send + Sync {
    async fn evaluate(&self, paths: &PathRegistry) -> bool;
}

/// Plain lock-protected read.
#[derive(Debug, Default, Clone, Copy)]
pub struct LockedRead;

#[async_trait]
impl AvailabilityStrategy for LockedRead {
    async fn evaluate(&self, paths: &PathRegistry) -> bool {
        paths.is_available()
    }
}

/// Waits `delay` before reading, widening the window between a path
/// mutation and the value a watcher computes for it.
#[derive(Debug, Clone, Copy)]
pub struct Delayed {
    pub delay: Duration,
}

#[async_trait]
impl AvailabilityStrategy for Delayed {
    async fn evaluate(&self, paths: &PathRegistry) -> bool {
        tokio::time::sleep(self.delay).await;
        paths.is_available()
    }
}
