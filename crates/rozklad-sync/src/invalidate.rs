//! Targeted cache invalidation and refresh guards.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rozklad_store::{CacheStore, EntityKind, Storage};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ChangeSet, SyncError};

/// Key of the faculties-with-groups listing.
pub const FACULTIES_KEY: &str = "faculties";

/// Key of one group's two-week timetable.
pub fn timetable_key(group_id: i64) -> String {
    format!("group:{}:timetable", group_id)
}

/// Key of the guard that admits one whole-table refresh of `kind` at a time.
pub fn guard_key(kind: EntityKind) -> String {
    format!("refresh-guard:{}", kind)
}

/// Proof of holding a refresh guard. Hand it back to
/// [`CacheInvalidator::release`] when the run ends.
#[derive(Debug)]
#[must_use = "a guard that is never released blocks its scope until the TTL expires"]
pub struct RefreshGuard {
    key: String,
    token: String,
}

impl RefreshGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Maps committed changes to cache keys and evicts exactly those.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn CacheStore>,
    storage: Arc<dyn Storage>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn CacheStore>, storage: Arc<dyn Storage>) -> Self {
        Self { cache, storage }
    }

    /// The cache keys whose projections depend on what `change` touched.
    pub async fn keys_for(&self, change: &ChangeSet) -> Result<BTreeSet<String>, SyncError> {
        let mut keys = BTreeSet::new();
        if change.is_empty() {
            return Ok(keys);
        }

        match change.kind {
            EntityKind::Faculty => {
                keys.insert(FACULTIES_KEY.to_string());
                keys.extend(change.cascaded_groups.iter().copied().map(timetable_key));
            }
            EntityKind::Group => {
                keys.insert(FACULTIES_KEY.to_string());
                keys.extend(change.changed_ids().map(timetable_key));
            }
            EntityKind::Teacher => {
                let teachers: Vec<i64> = change.changed_ids().collect();
                if !teachers.is_empty() {
                    let groups = self.storage.groups_taught_by(&teachers).await?;
                    keys.extend(groups.into_iter().map(timetable_key));
                }
            }
            EntityKind::Lesson => {
                if let Some(group_id) = change.scope {
                    keys.insert(timetable_key(group_id));
                }
            }
        }

        Ok(keys)
    }

    /// Keys for a whole run's worth of changes.
    pub async fn keys_for_all(&self, changes: &[ChangeSet]) -> Result<Vec<String>, SyncError> {
        let mut keys = BTreeSet::new();
        for change in changes {
            keys.extend(self.keys_for(change).await?);
        }
        Ok(keys.into_iter().collect())
    }

    /// Remove exactly `keys`. Returns how many were live.
    pub async fn invalidate(&self, keys: &[String]) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let removed = self.cache.delete(keys).await;
        info!(keys = ?keys, removed, "invalidated cache keys");
        removed
    }

    /// Invalidate everything a run's changes affect.
    pub async fn invalidate_changes(&self, changes: &[ChangeSet]) -> Result<usize, SyncError> {
        let keys = self.keys_for_all(changes).await?;
        Ok(self.invalidate(&keys).await)
    }

    /// Read-through lookup: return the cached payload or compute, store and
    /// return a fresh one.
    pub async fn get_or_fill<F, Fut, E>(&self, key: &str, ttl: Duration, fill: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(payload) = self.cache.get(key).await {
            debug!(key, "cache hit");
            return Ok(payload);
        }

        debug!(key, "cache miss");
        let payload = fill().await?;
        self.cache.set(key, payload.clone(), ttl).await;
        Ok(payload)
    }

    /// Take the guard for `kind`, held for at most `ttl`.
    pub async fn acquire_guard(
        &self,
        kind: EntityKind,
        ttl: Duration,
    ) -> Result<RefreshGuard, SyncError> {
        let key = guard_key(kind);
        let token = Uuid::new_v4().to_string();

        if self.cache.set_if_absent(&key, token.clone(), ttl).await {
            debug!(%kind, "acquired refresh guard");
            return Ok(RefreshGuard { key, token });
        }

        let retry_after = self.cache.ttl(&key).await.unwrap_or(ttl);
        debug!(%kind, retry_after_secs = retry_after.as_secs(), "refresh guard held");
        Err(SyncError::GuardAlreadyHeld { retry_after })
    }

    /// Release a guard, unless it already expired and someone else took it.
    pub async fn release(&self, guard: RefreshGuard) {
        match self.cache.get(&guard.key).await {
            Some(token) if token == guard.token => {
                self.cache.delete(std::slice::from_ref(&guard.key)).await;
                debug!(key = %guard.key, "released refresh guard");
            }
            Some(_) => warn!(key = %guard.key, "guard expired and was taken over, not releasing"),
            None => warn!(key = %guard.key, "guard expired before release"),
        }
    }
}

/// The kind guards held by one run.
///
/// A kind is taken at most once per run and every guard is held until
/// [`GuardSet::release_all`].
pub struct GuardSet {
    invalidator: CacheInvalidator,
    ttl: Duration,
    held: Mutex<Vec<(EntityKind, RefreshGuard)>>,
}

impl GuardSet {
    pub fn new(invalidator: CacheInvalidator, ttl: Duration) -> Self {
        Self {
            invalidator,
            ttl,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Take the guard for `kind` unless this run already holds it.
    pub async fn hold(&self, kind: EntityKind) -> Result<(), SyncError> {
        let mut held = self.held.lock().await;
        if held.iter().any(|(k, _)| *k == kind) {
            return Ok(());
        }
        let guard = self.invalidator.acquire_guard(kind, self.ttl).await?;
        held.push((kind, guard));
        Ok(())
    }

    /// Take every guard in `kinds`, or none of them.
    pub async fn hold_all(&self, kinds: &[EntityKind]) -> Result<(), SyncError> {
        for &kind in kinds {
            if let Err(e) = self.hold(kind).await {
                let taken = std::mem::take(&mut *self.held.lock().await);
                for (_, guard) in taken {
                    self.invalidator.release(guard).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn holds(&self, kind: EntityKind) -> bool {
        self.held.lock().await.iter().any(|(k, _)| *k == kind)
    }

    pub async fn release_all(self) {
        let GuardSet {
            invalidator, held, ..
        } = self;
        for (_, guard) in held.into_inner() {
            invalidator.release(guard).await;
        }
    }
}
