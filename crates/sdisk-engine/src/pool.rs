//! Bounded pool of mounted disks with least-recently-used eviction
//!
//! Each NBD device and mount is a scarce system resource. The pool keeps at
//! most `capacity` disks mounted; getting one more unmounts whichever
//! member was used longest ago. Recency is ordered by a monotonic counter,
//! the wall clock only feeds the statistics.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use sdisk_common::{DiskError, DiskResult};

use crate::disk::Disk;

struct PoolEntry {
    disk: Arc<Disk>,
    last_accessed: DateTime<Utc>,
    tick: u64,
    access_count: u64,
}

impl PoolEntry {
    fn new(disk: Arc<Disk>, tick: u64) -> Self {
        Self {
            disk,
            last_accessed: Utc::now(),
            tick,
            access_count: 1,
        }
    }

    fn touch(&mut self, tick: u64) {
        self.last_accessed = Utc::now();
        self.tick = tick;
        self.access_count += 1;
    }
}

/// Snapshot of one pool member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolEntryStats {
    pub name: String,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub mount_path: Option<PathBuf>,
}

/// Snapshot of the whole pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub mounted: usize,
    /// Members, least recently used first
    pub entries: Vec<PoolEntryStats>,
}

/// LRU set of mounted disks
pub struct MountPool {
    capacity: usize,
    entries: RwLock<HashMap<String, PoolEntry>>,
    tick: AtomicU64,
}

impl MountPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Mount `disk` as a pool member and mark it most recently used.
    ///
    /// A member that lost its mount is remounted. When the pool is full the
    /// least recently used member is unmounted first; if that fails the pool
    /// is left as it was and the request fails with `ResourceExhausted`.
    pub async fn get(&self, disk: &Arc<Disk>) -> DiskResult<PathBuf> {
        let mut entries = self.entries.write().await;
        let tick = self.next_tick();

        if let Some(entry) = entries.get_mut(disk.name()) {
            entry.touch(tick);
            return match disk.mount_path().await {
                Some(path) => Ok(path),
                None => {
                    debug!("pool member {} lost its mount, remounting", disk.name());
                    disk.mount_direct().await
                }
            };
        }

        if entries.len() >= self.capacity {
            self.evict_lru(&mut entries).await?;
        }
        let path = match disk.mount_path().await {
            Some(path) => path,
            None => disk.mount_direct().await?,
        };
        entries.insert(disk.name().to_string(), PoolEntry::new(disk.clone(), tick));
        debug!("pool: added {} ({}/{})", disk.name(), entries.len(), self.capacity);
        Ok(path)
    }

    async fn evict_lru(&self, entries: &mut HashMap<String, PoolEntry>) -> DiskResult<()> {
        let Some(victim) = entries
            .iter()
            .min_by_key(|(_, e)| e.tick)
            .map(|(name, _)| name.clone())
        else {
            return Ok(());
        };
        let Some(entry) = entries.remove(&victim) else {
            return Ok(());
        };
        if let Err(e) = entry.disk.unmount_direct().await {
            entries.insert(victim.clone(), entry);
            return Err(DiskError::ResourceExhausted(format!(
                "mount pool full ({}) and evicting {victim} failed: {e}",
                self.capacity
            )));
        }
        info!("pool: evicted {victim}");
        Ok(())
    }

    /// Mark `name` as used without remounting
    pub async fn release(&self, name: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.touch(tick);
        }
    }

    /// Unmount `name` and drop it from the pool. Returns whether it was a
    /// member. A failed unmount leaves it in the pool.
    pub async fn evict(&self, name: &str) -> DiskResult<bool> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.remove(name) else {
            return Ok(false);
        };
        if let Err(e) = entry.disk.unmount_direct().await {
            entries.insert(name.to_string(), entry);
            return Err(e);
        }
        debug!("pool: removed {name}");
        Ok(true)
    }

    /// Drop `name` from the pool even if its unmount fails. The system mount
    /// is torn down best-effort and the disk's mount flags are cleared, so
    /// the next get mounts it afresh.
    pub async fn force_remove(&self, name: &str) -> DiskResult<bool> {
        let entry = self.entries.write().await.remove(name);
        match entry {
            Some(entry) => {
                entry.disk.force_detach().await?;
                warn!("pool: force-removed {name}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.read().await;
        let mut members: Vec<(&PoolEntry, PoolEntryStats)> = Vec::with_capacity(entries.len());
        for (name, entry) in entries.iter() {
            members.push((
                entry,
                PoolEntryStats {
                    name: name.clone(),
                    last_accessed: entry.last_accessed,
                    access_count: entry.access_count,
                    mount_path: entry.disk.mount_path().await,
                },
            ));
        }
        members.sort_by_key(|(entry, _)| entry.tick);
        PoolStats {
            capacity: self.capacity,
            mounted: members.len(),
            entries: members.into_iter().map(|(_, s)| s).collect(),
        }
    }

    /// Unmount every member. The first failure is returned after all
    /// members have been tried.
    pub async fn close(&self) -> DiskResult<()> {
        let drained: Vec<PoolEntry> = self.entries.write().await.drain().map(|(_, e)| e).collect();
        let mut first_err = None;
        for entry in drained {
            if let Err(e) = entry.disk.unmount_direct().await {
                warn!("pool: failed to unmount {}: {e}", entry.disk.name());
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdisk_image::ImageTool;

    use crate::testutil::Harness;

    async fn pooled(capacity: usize) -> Harness {
        Harness::builder().pool(capacity).build().await
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let h = pooled(2).await;
        let a = h.manager.create("a", 1).await.unwrap();
        let b = h.manager.create("b", 1).await.unwrap();
        let c = h.manager.create("c", 1).await.unwrap();

        a.mount().await.unwrap();
        b.mount().await.unwrap();
        c.mount().await.unwrap();

        assert!(!a.is_mounted().await);
        assert!(b.is_mounted().await);
        assert!(c.is_mounted().await);
        assert_eq!(h.tool.mounted(), vec!["b", "c"]);
        let stats = h.manager.pool_stats().await.unwrap();
        assert_eq!(stats.mounted, 2);
        let names: Vec<&str> = stats.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_access_refreshes_recency() {
        let h = pooled(2).await;
        let a = h.manager.create("a", 1).await.unwrap();
        let b = h.manager.create("b", 1).await.unwrap();
        let c = h.manager.create("c", 1).await.unwrap();

        a.mount().await.unwrap();
        b.mount().await.unwrap();
        a.mount().await.unwrap();
        c.mount().await.unwrap();

        assert!(a.is_mounted().await);
        assert!(!b.is_mounted().await);
        let stats = h.manager.pool_stats().await.unwrap();
        let a_stats = stats.entries.iter().find(|e| e.name == "a").unwrap();
        assert_eq!(a_stats.access_count, 2);
        assert_eq!(h.tool.mount_calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_eviction_keeps_pool() {
        let h = pooled(1).await;
        let a = h.manager.create("a", 1).await.unwrap();
        let b = h.manager.create("b", 1).await.unwrap();
        a.mount().await.unwrap();
        h.tool.set_busy_unmounts(1);

        let err = b.mount().await.unwrap_err();
        assert!(matches!(err, DiskError::ResourceExhausted(_)));
        assert!(a.is_mounted().await);
        assert!(!b.is_mounted().await);
        assert_eq!(h.manager.pool_stats().await.unwrap().mounted, 1);

        b.mount().await.unwrap();
        assert!(!a.is_mounted().await);
    }

    #[tokio::test]
    async fn test_unmount_leaves_pool() {
        let h = pooled(2).await;
        let a = h.manager.create("a", 1).await.unwrap();
        a.mount().await.unwrap();
        a.unmount().await.unwrap();
        assert_eq!(h.manager.pool_stats().await.unwrap().mounted, 0);
        assert!(h.tool.mounted().is_empty());
    }

    #[tokio::test]
    async fn test_force_remove_then_remount() {
        let h = pooled(2).await;
        let a = h.manager.create("a", 1).await.unwrap();
        a.mount().await.unwrap();
        let pool = h.manager.pool().unwrap();

        assert!(pool.force_remove("a").await.unwrap());
        assert!(!pool.force_remove("a").await.unwrap());
        assert!(!a.is_mounted().await);
        assert!(!pool.contains("a").await);
        assert!(h.tool.mounted().is_empty());

        a.mount().await.unwrap();
        assert!(a.is_mounted().await);
        assert!(pool.contains("a").await);
        assert_eq!(h.tool.mounted(), vec!["a"]);
        assert_eq!(h.tool.mount_calls(), 2);
    }

    #[tokio::test]
    async fn test_force_remove_of_busy_disk_adopts_mount() {
        let h = pooled(2).await;
        let a = h.manager.create("a", 1).await.unwrap();
        let path = a.mount().await.unwrap();
        let pool = h.manager.pool().unwrap();

        h.tool.set_busy_unmounts(1);
        assert!(pool.force_remove("a").await.unwrap());
        assert!(!a.is_mounted().await);
        assert_eq!(h.tool.mounted(), vec!["a"]);

        assert_eq!(a.mount().await.unwrap(), path);
        assert!(a.is_mounted().await);
        assert!(pool.contains("a").await);
        assert_eq!(h.tool.mount_calls(), 1);
        a.unmount().await.unwrap();
        assert!(h.tool.mounted().is_empty());
    }

    #[tokio::test]
    async fn test_release_and_close() {
        let h = pooled(3).await;
        let a = h.manager.create("a", 1).await.unwrap();
        let b = h.manager.create("b", 1).await.unwrap();
        a.mount().await.unwrap();
        b.mount().await.unwrap();
        let pool = h.manager.pool().unwrap();
        pool.release("a").await;
        let stats = pool.stats().await;
        assert_eq!(stats.entries.last().unwrap().name, "a");

        pool.close().await.unwrap();
        assert!(!a.is_mounted().await);
        assert!(!b.is_mounted().await);
        assert_eq!(pool.stats().await.mounted, 0);
    }
}
