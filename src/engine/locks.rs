//! Per-group async locks.
//!
//! `GroupLocks` hands out one `tokio::sync::Mutex` per group id.
//! `WriteLocks` bundles the three sets the writers of a group use: entity
//! merges, tree builds and community runs. The builders only take their own
//! set, so extraction and tree building still overlap; purge takes all three.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::error::EngineError;
use super::model::GroupId;

pub type GroupGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct GroupLocks {
    /// group id -> lock
    locks: Mutex<HashMap<GroupId, Arc<AsyncMutex<()>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, group: &GroupId) -> Result<Arc<AsyncMutex<()>>, EngineError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| EngineError::Storage("group locks poisoned".into()))?;
        Ok(locks.entry(group.clone()).or_default().clone())
    }

    /// Wait for the group's lock.
    pub async fn acquire(&self, group: &GroupId) -> Result<GroupGuard, EngineError> {
        Ok(self.handle(group)?.lock_owned().await)
    }

    /// Take the group's lock only if nobody holds it.
    pub fn try_acquire(&self, group: &GroupId) -> Result<Option<GroupGuard>, EngineError> {
        Ok(self.handle(group)?.try_lock_owned().ok())
    }

    /// Forget a group's lock entry after a purge. Holders keep their guard.
    pub fn forget(&self, group: &GroupId) -> Result<(), EngineError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| EngineError::Storage("group locks poisoned".into()))?;
        locks.remove(group);
        Ok(())
    }
}

/// Guards held by a purge; the group is quiescent while they live.
pub struct AllGuards {
    _merges: GroupGuard,
    _trees: GroupGuard,
    _communities: GroupGuard,
}

#[derive(Debug, Default)]
pub struct WriteLocks {
    pub merges: GroupLocks,
    pub trees: GroupLocks,
    pub communities: GroupLocks,
}

impl WriteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for every writer of the group. Always merges, then trees, then
    /// communities; no writer holds more than one set, so this cannot deadlock.
    pub async fn acquire_all(&self, group: &GroupId) -> Result<AllGuards, EngineError> {
        let merges = self.merges.acquire(group).await?;
        let trees = self.trees.acquire(group).await?;
        let communities = self.communities.acquire(group).await?;
        Ok(AllGuards { _merges: merges, _trees: trees, _communities: communities })
    }

    pub fn forget(&self, group: &GroupId) -> Result<(), EngineError> {
        self.merges.forget(group)?;
        self.trees.forget(group)?;
        self.communities.forget(group)
    }
}
