//! Persistent state store using redb
//!
//! Records are stored as JSON strings. Every refcount change happens in the
//! same write transaction as the mapping change that causes it, so a layer's
//! refcount always equals the number of mappings naming it.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use sdisk_common::{DiskLayerMapping, DiskRecord, LayerRecord};

use crate::error::{StateError, StateResult};

// ── Table definitions ─────────────────────────────────────────────────────────

/// Disks: name (str) → JSON(DiskRecord)
const DISKS: TableDefinition<&str, &str> = TableDefinition::new("disks");
/// Layers: layer_id (str) → JSON(LayerRecord)
const LAYERS: TableDefinition<&str, &str> = TableDefinition::new("layers");
/// Disk layers: "disk\x00{position:08x}" → layer_id (str)
const DISK_LAYERS: TableDefinition<&str, &str> = TableDefinition::new("disk_layers");

type StrTable<'txn> = redb::Table<'txn, &'static str, &'static str>;

/// A layer whose stored refcount disagrees with its mappings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefcountDrift {
    pub layer_id: String,
    pub stored: u32,
    pub mapped: u32,
}

// ── StateStore ────────────────────────────────────────────────────────────────

/// Durable disk/layer/mapping records backed by redb.
pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let wtx = db.begin_write()?;
        wtx.open_table(DISKS)?;
        wtx.open_table(LAYERS)?;
        wtx.open_table(DISK_LAYERS)?;
        wtx.commit()?;

        Ok(Self { db })
    }

    // ── Disk records ──────────────────────────────────────────────────────────

    /// Insert or replace a disk record.
    pub fn save_disk(&self, record: &DiskRecord) -> StateResult<()> {
        let json = encode(record)?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(DISKS)?
            .insert(record.name.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    pub fn get_disk(&self, name: &str) -> StateResult<Option<DiskRecord>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DISKS)?;
        table.get(name)?.map(|v| decode(v.value())).transpose()
    }

    /// All disk records, ordered by name.
    pub fn list_disks(&self) -> StateResult<Vec<DiskRecord>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DISKS)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    /// Remove a disk record. Mappings are left to [`Self::detach_all_layers`].
    pub fn delete_disk(&self, name: &str) -> StateResult<bool> {
        let wtx = self.db.begin_write()?;
        let removed = wtx.open_table(DISKS)?.remove(name)?.is_some();
        wtx.commit()?;
        Ok(removed)
    }

    /// Apply `f` to a stored disk record and persist the result.
    pub fn update_disk<F>(&self, name: &str, f: F) -> StateResult<DiskRecord>
    where
        F: FnOnce(&mut DiskRecord),
    {
        let wtx = self.db.begin_write()?;
        let record = {
            let mut table = wtx.open_table(DISKS)?;
            let current: Option<String> = table.get(name)?.map(|v| v.value().to_string());
            let mut record: DiskRecord = decode(
                &current.ok_or_else(|| StateError::DiskNotFound(name.to_string()))?,
            )?;
            f(&mut record);
            record.modified_at = Utc::now();
            table.insert(name, encode(&record)?.as_str())?;
            record
        };
        wtx.commit()?;
        Ok(record)
    }

    pub fn update_mount_state(
        &self,
        name: &str,
        is_mounted: bool,
        mount_path: Option<&str>,
    ) -> StateResult<()> {
        self.update_disk(name, |r| {
            r.is_mounted = is_mounted;
            r.mount_path = mount_path.map(str::to_string);
        })?;
        Ok(())
    }

    pub fn update_remote_state(
        &self,
        name: &str,
        in_remote: bool,
        checksum: Option<&str>,
    ) -> StateResult<()> {
        self.update_disk(name, |r| {
            r.in_remote = in_remote;
            r.checksum = checksum.map(str::to_string);
        })?;
        Ok(())
    }

    pub fn set_working_layer(&self, name: &str, layer_id: Option<&str>) -> StateResult<()> {
        self.update_disk(name, |r| r.working_layer_id = layer_id.map(str::to_string))?;
        Ok(())
    }

    // ── Layer records ─────────────────────────────────────────────────────────

    pub fn get_layer(&self, id: &str) -> StateResult<Option<LayerRecord>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(LAYERS)?;
        table.get(id)?.map(|v| decode(v.value())).transpose()
    }

    pub fn list_layers(&self) -> StateResult<Vec<LayerRecord>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(LAYERS)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    /// Update checksum/size/cached_at of an existing layer, keeping its refcount.
    pub fn refresh_layer(&self, id: &str, checksum: &str, size: u64) -> StateResult<LayerRecord> {
        let wtx = self.db.begin_write()?;
        let record = {
            let mut layers = wtx.open_table(LAYERS)?;
            let mut record = load_layer(&layers, id)?;
            record.checksum = checksum.to_string();
            record.size = size;
            record.cached_at = Utc::now();
            layers.insert(id, encode(&record)?.as_str())?;
            record
        };
        wtx.commit()?;
        Ok(record)
    }

    /// Layers no disk references.
    pub fn list_unused_layers(&self) -> StateResult<Vec<LayerRecord>> {
        Ok(self
            .list_layers()?
            .into_iter()
            .filter(|l| l.ref_count == 0)
            .collect())
    }

    /// Remove a layer record only if nothing references it.
    pub fn delete_layer_if_unused(&self, id: &str) -> StateResult<bool> {
        self.with_layers(|layers| {
            let record = match load_layer(&*layers, id) {
                Ok(r) => r,
                Err(StateError::LayerNotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            if record.ref_count > 0 {
                return Ok(false);
            }
            layers.remove(id)?;
            Ok(true)
        })
    }

    // ── Disk ↔ layer mappings ─────────────────────────────────────────────────

    /// Mappings of `disk`, ordered base to top.
    pub fn get_disk_layers(&self, disk: &str) -> StateResult<Vec<DiskLayerMapping>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DISK_LAYERS)?;
        Ok(scan_mappings(&table, disk)?
            .into_iter()
            .map(|(position, layer_id)| DiskLayerMapping {
                disk_name: disk.to_string(),
                layer_id,
                position,
            })
            .collect())
    }

    /// Layer ids of `disk`, ordered base to top.
    pub fn get_disk_layer_ids(&self, disk: &str) -> StateResult<Vec<String>> {
        Ok(self
            .get_disk_layers(disk)?
            .into_iter()
            .map(|m| m.layer_id)
            .collect())
    }

    /// Map an existing layer into `disk` at `position` and take a reference.
    pub fn attach_layer(&self, disk: &str, layer_id: &str, position: u32) -> StateResult<u32> {
        let wtx = self.db.begin_write()?;
        let count = {
            let mut layers = wtx.open_table(LAYERS)?;
            let count = bump_ref(&mut layers, layer_id, 1)?;
            let key = mapping_key(disk, position);
            wtx.open_table(DISK_LAYERS)?
                .insert(key.as_str(), layer_id)?;
            count
        };
        wtx.commit()?;
        debug!("attached {layer_id} to {disk} at {position} (refs={count})");
        Ok(count)
    }

    /// Insert a new layer owned by `disk` at `position` with one reference.
    pub fn register_layer(&self, record: &LayerRecord, disk: &str, position: u32) -> StateResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut layers = wtx.open_table(LAYERS)?;
            if layers.get(record.id.as_str())?.is_some() {
                return Err(StateError::LayerExists(record.id.clone()));
            }
            let record = LayerRecord {
                ref_count: 1,
                ..record.clone()
            };
            layers.insert(record.id.as_str(), encode(&record)?.as_str())?;
            let key = mapping_key(disk, position);
            wtx.open_table(DISK_LAYERS)?
                .insert(key.as_str(), record.id.as_str())?;
        }
        wtx.commit()?;
        debug!("registered {} for {disk} at {position}", record.id);
        Ok(())
    }

    /// Remove the mapping at `position` and drop its reference.
    pub fn detach_layer(&self, disk: &str, position: u32) -> StateResult<Option<String>> {
        let wtx = self.db.begin_write()?;
        let removed = {
            let key = mapping_key(disk, position);
            let removed = wtx
                .open_table(DISK_LAYERS)?
                .remove(key.as_str())?
                .map(|v| v.value().to_string());
            if let Some(id) = &removed {
                bump_ref(&mut wtx.open_table(LAYERS)?, id, -1)?;
            }
            removed
        };
        wtx.commit()?;
        Ok(removed)
    }

    /// Remove every mapping of `disk` and drop one reference per mapping.
    pub fn detach_all_layers(&self, disk: &str) -> StateResult<Vec<String>> {
        let wtx = self.db.begin_write()?;
        let removed = detach_all(&wtx, disk)?;
        wtx.commit()?;
        Ok(removed)
    }

    /// Replace all of `disk`'s layers with a single new base layer.
    pub fn reset_disk_layers(&self, disk: &str, base: &LayerRecord) -> StateResult<Vec<String>> {
        let wtx = self.db.begin_write()?;
        let removed = detach_all(&wtx, disk)?;
        {
            let mut layers = wtx.open_table(LAYERS)?;
            if layers.get(base.id.as_str())?.is_some() {
                return Err(StateError::LayerExists(base.id.clone()));
            }
            let record = LayerRecord {
                ref_count: 1,
                ..base.clone()
            };
            layers.insert(record.id.as_str(), encode(&record)?.as_str())?;
            let key = mapping_key(disk, 0);
            wtx.open_table(DISK_LAYERS)?
                .insert(key.as_str(), record.id.as_str())?;
        }
        wtx.commit()?;
        Ok(removed)
    }

    /// Give `dst` the same ordered layers as `src`, taking a reference on each.
    pub fn copy_disk_layers(&self, src: &str, dst: &str) -> StateResult<usize> {
        let wtx = self.db.begin_write()?;
        let copied = {
            let mut table = wtx.open_table(DISK_LAYERS)?;
            if !scan_mappings(&table, dst)?.is_empty() {
                return Err(StateError::LayerExists(format!("{dst} already has layers")));
            }
            let mappings = scan_mappings(&table, src)?;
            let mut layers = wtx.open_table(LAYERS)?;
            for (position, layer_id) in &mappings {
                bump_ref(&mut layers, layer_id, 1)?;
                let key = mapping_key(dst, *position);
                table.insert(key.as_str(), layer_id.as_str())?;
            }
            mappings.len()
        };
        wtx.commit()?;
        Ok(copied)
    }

    /// Layers whose stored refcount differs from the number of mappings.
    pub fn audit_refcounts(&self) -> StateResult<Vec<RefcountDrift>> {
        let rtx = self.db.begin_read()?;
        let mut mapped = std::collections::HashMap::<String, u32>::new();
        for entry in rtx.open_table(DISK_LAYERS)?.iter()? {
            let (_, value) = entry?;
            *mapped.entry(value.value().to_string()).or_default() += 1;
        }
        let mut drift = Vec::new();
        for entry in rtx.open_table(LAYERS)?.iter()? {
            let (_, value) = entry?;
            let layer: LayerRecord = decode(value.value())?;
            let count = mapped.remove(&layer.id).unwrap_or(0);
            if count != layer.ref_count {
                drift.push(RefcountDrift {
                    layer_id: layer.id,
                    stored: layer.ref_count,
                    mapped: count,
                });
            }
        }
        for (layer_id, count) in mapped {
            drift.push(RefcountDrift {
                layer_id,
                stored: 0,
                mapped: count,
            });
        }
        Ok(drift)
    }

    fn with_layers<T, F>(&self, f: F) -> StateResult<T>
    where
        F: FnOnce(&mut StrTable<'_>) -> StateResult<T>,
    {
        let wtx = self.db.begin_write()?;
        let out = f(&mut wtx.open_table(LAYERS)?)?;
        wtx.commit()?;
        Ok(out)
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn mapping_prefix(disk: &str) -> String {
    format!("{disk}\x00")
}

fn mapping_key(disk: &str, position: u32) -> String {
    format!("{disk}\x00{position:08x}")
}

fn encode<T: Serialize>(value: &T) -> StateResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(json: &str) -> StateResult<T> {
    Ok(serde_json::from_str(json)?)
}

fn load_layer(
    layers: &impl ReadableTable<&'static str, &'static str>,
    id: &str,
) -> StateResult<LayerRecord> {
    let json = layers
        .get(id)?
        .map(|v| v.value().to_string())
        .ok_or_else(|| StateError::LayerNotFound(id.to_string()))?;
    decode(&json)
}

fn bump_ref(layers: &mut StrTable<'_>, id: &str, delta: i64) -> StateResult<u32> {
    let mut record = load_layer(&*layers, id)?;
    let next = i64::from(record.ref_count) + delta;
    if next < 0 {
        warn!("refcount underflow on layer {id}");
    }
    record.ref_count = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
    layers.insert(id, encode(&record)?.as_str())?;
    Ok(record.ref_count)
}

/// `(position, layer_id)` pairs of `disk`, in key order
fn scan_mappings(
    table: &impl ReadableTable<&'static str, &'static str>,
    disk: &str,
) -> StateResult<Vec<(u32, String)>> {
    let prefix = mapping_prefix(disk);
    let mut out = Vec::new();
    for entry in table.range(prefix.as_str()..)? {
        let (key, value) = entry?;
        let Some(position) = key.value().strip_prefix(prefix.as_str()) else {
            break;
        };
        out.push((
            u32::from_str_radix(position, 16).unwrap_or(u32::MAX),
            value.value().to_string(),
        ));
    }
    Ok(out)
}

fn remove_mappings(table: &mut StrTable<'_>, disk: &str) -> StateResult<Vec<String>> {
    let mappings = scan_mappings(&*table, disk)?;
    for (position, _) in &mappings {
        table.remove(mapping_key(disk, *position).as_str())?;
    }
    Ok(mappings.into_iter().map(|(_, id)| id).collect())
}

fn detach_all(wtx: &WriteTransaction, disk: &str) -> StateResult<Vec<String>> {
    let removed = remove_mappings(&mut wtx.open_table(DISK_LAYERS)?, disk)?;
    let mut layers = wtx.open_table(LAYERS)?;
    for id in &removed {
        bump_ref(&mut layers, id, -1)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_disk_roundtrip_and_update() {
        let (_dir, store) = open();
        let record = DiskRecord::new("vol", 10);
        store.save_disk(&record).unwrap();
        assert_eq!(store.get_disk("vol").unwrap(), Some(record));

        store.update_mount_state("vol", true, Some("/mnt/vol")).unwrap();
        store.update_remote_state("vol", true, Some("abc")).unwrap();
        store.set_working_layer("vol", Some("layer-1")).unwrap();
        let updated = store.get_disk("vol").unwrap().unwrap();
        assert!(updated.is_mounted);
        assert_eq!(updated.mount_path.as_deref(), Some("/mnt/vol"));
        assert!(updated.in_remote);
        assert_eq!(updated.checksum.as_deref(), Some("abc"));
        assert_eq!(updated.working_layer_id.as_deref(), Some("layer-1"));

        assert!(matches!(
            store.update_mount_state("missing", false, None),
            Err(StateError::DiskNotFound(_))
        ));
        assert!(store.delete_disk("vol").unwrap());
        assert!(store.get_disk("vol").unwrap().is_none());
    }

    #[test]
    fn test_mappings_are_ordered_and_scoped() {
        let (_dir, store) = open();
        for pos in [2, 0, 10, 1] {
            let id = format!("l{pos}");
            store
                .register_layer(&LayerRecord::new(&id, "c", 1), "a", pos)
                .unwrap();
        }
        store
            .register_layer(&LayerRecord::new("other", "c", 1), "ab", 0)
            .unwrap();

        let ids = store.get_disk_layer_ids("a").unwrap();
        assert_eq!(ids, vec!["l0", "l1", "l2", "l10"]);
        assert_eq!(store.get_disk_layers("a").unwrap()[3].position, 10);
        assert_eq!(store.get_disk_layer_ids("ab").unwrap(), vec!["other"]);

        assert_eq!(store.detach_all_layers("a").unwrap().len(), 4);
        assert!(store.get_disk_layers("a").unwrap().is_empty());
        assert_eq!(store.get_disk_layer_ids("ab").unwrap(), vec!["other"]);
    }

    #[test]
    fn test_refcounts_follow_mappings() {
        let (_dir, store) = open();
        store
            .register_layer(&LayerRecord::new("base", "c0", 100), "a", 0)
            .unwrap();
        store
            .register_layer(&LayerRecord::new("top", "c1", 50), "a", 1)
            .unwrap();
        assert_eq!(store.copy_disk_layers("a", "b").unwrap(), 2);
        assert_eq!(store.get_layer("base").unwrap().unwrap().ref_count, 2);
        assert!(store.audit_refcounts().unwrap().is_empty());

        assert_eq!(store.detach_all_layers("a").unwrap(), vec!["base", "top"]);
        assert_eq!(store.get_layer("top").unwrap().unwrap().ref_count, 1);
        assert!(store.list_unused_layers().unwrap().is_empty());

        store.detach_all_layers("b").unwrap();
        let unused: Vec<String> = store
            .list_unused_layers()
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(unused, vec!["base", "top"]);
        assert!(store.audit_refcounts().unwrap().is_empty());
    }

    #[test]
    fn test_register_duplicate_layer_rejected() {
        let (_dir, store) = open();
        let layer = LayerRecord::new("l", "c", 1);
        store.register_layer(&layer, "a", 0).unwrap();
        assert!(matches!(
            store.register_layer(&layer, "b", 0),
            Err(StateError::LayerExists(_))
        ));
        // failed transaction left no mapping behind
        assert!(store.get_disk_layers("b").unwrap().is_empty());
    }

    #[test]
    fn test_attach_and_detach_single() {
        let (_dir, store) = open();
        store.register_layer(&LayerRecord::new("l", "c", 1), "a", 0).unwrap();
        assert_eq!(store.attach_layer("b", "l", 0).unwrap(), 2);
        assert!(matches!(
            store.attach_layer("b", "missing", 1),
            Err(StateError::LayerNotFound(_))
        ));
        assert_eq!(store.detach_layer("b", 0).unwrap().as_deref(), Some("l"));
        assert_eq!(store.detach_layer("b", 0).unwrap(), None);
        assert_eq!(store.get_layer("l").unwrap().unwrap().ref_count, 1);
    }

    #[test]
    fn test_reset_disk_layers() {
        let (_dir, store) = open();
        store.register_layer(&LayerRecord::new("old0", "c", 1), "a", 0).unwrap();
        store.register_layer(&LayerRecord::new("old1", "c", 1), "a", 1).unwrap();
        let removed = store
            .reset_disk_layers("a", &LayerRecord::new("new", "c", 1))
            .unwrap();
        assert_eq!(removed, vec!["old0", "old1"]);
        assert_eq!(store.get_disk_layer_ids("a").unwrap(), vec!["new"]);
        assert_eq!(store.list_unused_layers().unwrap().len(), 2);
        assert!(store.audit_refcounts().unwrap().is_empty());
    }

    #[test]
    fn test_delete_layer_if_unused() {
        let (_dir, store) = open();
        store.register_layer(&LayerRecord::new("l", "c", 1), "a", 0).unwrap();
        assert!(!store.delete_layer_if_unused("l").unwrap());
        store.attach_layer("b", "l", 0).unwrap();
        store.detach_layer("a", 0).unwrap();
        assert!(!store.delete_layer_if_unused("l").unwrap());
        store.detach_layer("b", 0).unwrap();
        assert_eq!(store.get_layer("l").unwrap().unwrap().ref_count, 0);
        assert!(store.delete_layer_if_unused("l").unwrap());
        assert!(!store.delete_layer_if_unused("l").unwrap());
    }

    #[test]
    fn test_refresh_layer_keeps_refcount() {
        let (_dir, store) = open();
        store.register_layer(&LayerRecord::new("l", "c", 1), "a", 0).unwrap();
        store.attach_layer("b", "l", 0).unwrap();
        let refreshed = store.refresh_layer("l", "c2", 99).unwrap();
        assert_eq!(refreshed.ref_count, 2);
        assert_eq!(refreshed.checksum, "c2");
        assert_eq!(refreshed.size, 99);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.save_disk(&DiskRecord::new("vol", 1)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_disks().unwrap().len(), 1);
    }
}
