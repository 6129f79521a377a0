//! Disk manager: the set of disks on this host
//!
//! The manager owns the disk table and every operation that creates or
//! removes a disk: create, pull, fork and delete. Each of these runs under
//! the table's write lock and either completes or rolls back the files,
//! layer references and records it produced.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use sdisk_common::layout::partial_path;
use sdisk_common::{
    Config, DiskError, DiskInfo, DiskRecord, DiskResult, GIB, LayerGraph, Layout,
    RemoteManifest, ResultExt, new_layer_id, validate_disk_name,
};
use sdisk_image::{ImageTool, QemuImageTool};
use sdisk_remote::RemoteStore;
use sdisk_state::StateStore;

use crate::cache::LayerCache;
use crate::disk::Disk;
use crate::materialize;
use crate::pool::{MountPool, PoolStats};
use crate::rollback::Rollback;
use crate::shared::{Shared, position, remove_dir_if_exists, remove_if_exists};

/// Owner of all disks under one data directory
pub struct Manager {
    shared: Arc<Shared>,
    pool: Option<Arc<MountPool>>,
    disks: RwLock<HashMap<String, Arc<Disk>>>,
}

impl Manager {
    /// Open the data directory with the real image tool and, if configured,
    /// an S3 remote
    pub async fn from_config(config: Config) -> DiskResult<Self> {
        let tool: Arc<dyn ImageTool> = Arc::new(QemuImageTool::new()?);
        let remote = config
            .remote
            .as_ref()
            .map(RemoteStore::from_config)
            .transpose()?;
        Self::new(config, tool, remote).await
    }

    /// Open the data directory and load every disk recorded in it.
    ///
    /// Mount flags left over from a previous process are cleared; nothing
    /// is mounted when a manager starts.
    pub async fn new(
        mut config: Config,
        tool: Arc<dyn ImageTool>,
        remote: Option<RemoteStore>,
    ) -> DiskResult<Self> {
        config.validate()?;
        // backing references and /proc lookups need absolute paths
        config.data_dir = std::path::absolute(&config.data_dir)
            .with_context(|| format!("resolve data_dir {}", config.data_dir.display()))?;
        let layout = Layout::new(&config.data_dir);
        layout.create_dirs().context("create data directories")?;
        let state = Arc::new(StateStore::open(layout.state_db())?);
        let cache = LayerCache::new(layout.clone(), state.clone(), remote.clone(), tool.clone());
        let pool = config
            .pool
            .enabled
            .then(|| Arc::new(MountPool::new(config.pool.max_mounted)));
        let shared = Arc::new(Shared {
            layout,
            config,
            tool,
            state,
            remote,
            cache,
        });

        let manager = Self {
            shared,
            pool,
            disks: RwLock::new(HashMap::new()),
        };
        manager.load_disks().await?;
        Ok(manager)
    }

    async fn load_disks(&self) -> DiskResult<()> {
        let mut disks = self.disks.write().await;
        for record in self.shared.state.list_disks()? {
            let working = self.shared.layout.working_image(&record.name);
            if !tokio::fs::try_exists(&working).await? {
                warn!("skipping {}: working image {} missing", record.name, working.display());
                continue;
            }
            if record.is_mounted {
                debug!("clearing stale mount flag of {}", record.name);
                self.shared
                    .state
                    .update_mount_state(&record.name, false, None)?;
            }
            let disk = self.new_disk(&record.name, record.size_gb);
            disks.insert(record.name, disk);
        }
        info!(
            "loaded {} disk(s) from {}",
            disks.len(),
            self.shared.layout.root().display()
        );
        Ok(())
    }

    fn new_disk(&self, name: &str, size_gb: u64) -> Arc<Disk> {
        let pool: Option<Weak<MountPool>> = self.pool.as_ref().map(Arc::downgrade);
        Disk::new(name, size_gb, self.shared.clone(), pool)
    }

    #[must_use]
    pub fn state(&self) -> &StateStore {
        &self.shared.state
    }

    #[must_use]
    pub fn cache(&self) -> &LayerCache {
        &self.shared.cache
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.shared.layout
    }

    #[must_use]
    pub fn pool(&self) -> Option<&Arc<MountPool>> {
        self.pool.as_ref()
    }

    async fn ensure_absent(&self, disks: &HashMap<String, Arc<Disk>>, name: &str) -> DiskResult<()> {
        let working = self.shared.layout.working_image(name);
        if disks.contains_key(name)
            || self.shared.state.get_disk(name)?.is_some()
            || tokio::fs::try_exists(&working).await?
        {
            return Err(DiskError::DiskExists(name.to_string()));
        }
        Ok(())
    }

    // ── Create / open ─────────────────────────────────────────────────────────

    /// Create an empty disk of `size_gb` gigabytes
    pub async fn create(&self, name: &str, size_gb: u64) -> DiskResult<Arc<Disk>> {
        validate_disk_name(name)?;
        if size_gb == 0 {
            return Err(DiskError::InvalidArgument("disk size must be positive".into()));
        }
        let mut disks = self.disks.write().await;
        self.ensure_absent(&disks, name).await?;

        let mut rb = Rollback::new(format!("create {name}"));
        let result = self.create_inner(name, size_gb, &mut rb).await;
        let disk = rb
            .finish(result)
            .await
            .with_context(|| format!("create {name}"))?;
        disks.insert(name.to_string(), disk.clone());
        info!("created {name} ({size_gb}G)");
        Ok(disk)
    }

    async fn create_inner(&self, name: &str, size_gb: u64, rb: &mut Rollback) -> DiskResult<Arc<Disk>> {
        let shared = &self.shared;
        let id = new_layer_id();
        let base = shared.cache.layer_path(&id);
        rb.remove_file(base.clone());
        shared
            .tool
            .create(&base, size_gb, &shared.config.image)
            .await?;

        let working = shared.layout.working_image(name);
        rb.remove_file(working.clone());
        shared
            .tool
            .create_with_backing(&base, &working, size_gb)
            .await?;

        shared.cache.register(name, 0, &id).await?;
        self.undo_layers(rb, name);

        shared.state.save_disk(&DiskRecord::new(name, size_gb))?;
        Ok(self.new_disk(name, size_gb))
    }

    /// Register an undo that drops every layer reference of `name`
    fn undo_layers(&self, rb: &mut Rollback, name: &str) {
        let state = self.shared.state.clone();
        let name = name.to_string();
        rb.push(format!("detach layers of {name}"), async move {
            for id in state.detach_all_layers(&name)? {
                state.delete_layer_if_unused(&id)?;
            }
            Ok(())
        });
    }

    /// Load a disk that exists locally
    pub async fn open(&self, name: &str) -> DiskResult<Arc<Disk>> {
        let mut disks = self.disks.write().await;
        if let Some(disk) = disks.get(name) {
            return Ok(disk.clone());
        }
        let record = self
            .shared
            .state
            .get_disk(name)?
            .ok_or_else(|| DiskError::DiskNotFound(name.to_string()))?;
        let working = self.shared.layout.working_image(name);
        if !tokio::fs::try_exists(&working).await? {
            return Err(DiskError::DiskNotFound(name.to_string())
                .context(format!("working image {} missing", working.display())));
        }
        let disk = self.new_disk(name, record.size_gb);
        disks.insert(name.to_string(), disk.clone());
        Ok(disk)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Disk>> {
        self.disks.read().await.get(name).cloned()
    }

    /// Every recorded disk, sorted by name. Allocation is 0 for images that
    /// cannot be inspected.
    pub async fn list(&self) -> DiskResult<Vec<DiskInfo>> {
        let records = self.shared.state.list_disks()?;
        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            let working = self.shared.layout.working_image(&record.name);
            let actual = match self.shared.tool.actual_size(&working).await {
                Ok(size) => size,
                Err(e) => {
                    debug!("no allocation for {}: {e}", record.name);
                    0
                }
            };
            infos.push(DiskInfo::from_record(&record, actual));
        }
        Ok(infos)
    }

    // ── Pull ──────────────────────────────────────────────────────────────────

    /// Materialize a disk from the remote store
    pub async fn pull(&self, name: &str) -> DiskResult<Arc<Disk>> {
        validate_disk_name(name)?;
        let mut disks = self.disks.write().await;
        self.ensure_absent(&disks, name).await?;
        let remote = self.shared.remote()?;
        let manifest = match remote.download_metadata(name).await {
            Ok(manifest) => manifest,
            Err(e) if e.is_not_found() => {
                return Err(DiskError::DiskNotFound(name.to_string()).context("not in remote store"));
            }
            Err(e) => return Err(e.context(format!("fetch manifest of {name}"))),
        };
        let ids = LayerGraph::validate_manifest(&manifest)
            .with_context(|| format!("manifest of {name}"))?;

        let mut rb = Rollback::new(format!("pull {name}"));
        let result = if ids.is_empty() {
            self.pull_legacy(name, remote, &manifest, &mut rb).await
        } else {
            self.pull_layers(name, &manifest, &ids, &mut rb).await
        };
        let disk = rb
            .finish(result)
            .await
            .with_context(|| format!("pull {name}"))?;
        disks.insert(name.to_string(), disk.clone());
        info!("pulled {name} ({} layer(s))", ids.len());
        Ok(disk)
    }

    /// A manifest without layers describes a disk stored as one image
    async fn pull_legacy(
        &self,
        name: &str,
        remote: &RemoteStore,
        manifest: &RemoteManifest,
        rb: &mut Rollback,
    ) -> DiskResult<Arc<Disk>> {
        let working = self.shared.layout.working_image(name);
        rb.remove_file(partial_path(&working));
        rb.remove_file(working.clone());
        remote.download_disk(name, &working).await?;
        let checksum = self.shared.tool.checksum(&working).await?;
        let record = DiskRecord {
            created_at: manifest.created,
            in_remote: true,
            checksum: Some(checksum),
            ..DiskRecord::new(name, manifest.size_gb)
        };
        self.shared.state.save_disk(&record)?;
        Ok(self.new_disk(name, manifest.size_gb))
    }

    async fn pull_layers(
        &self,
        name: &str,
        manifest: &RemoteManifest,
        ids: &[String],
        rb: &mut Rollback,
    ) -> DiskResult<Arc<Disk>> {
        let shared = &self.shared;
        self.undo_layers(rb, name);
        for (i, layer) in manifest.layers.iter().enumerate() {
            shared
                .cache
                .get_or_download(name, position(i)?, layer)
                .await?;
        }

        let working = shared.layout.working_image(name);
        rb.remove_dir_all(shared.layout.chain_dir(name));
        rb.remove_file(partial_path(&working));
        rb.remove_file(working.clone());
        let Some(top) = manifest.top() else {
            return Err(DiskError::integrity(format!("manifest of {name} has no top layer")));
        };

        // a small top layer stays open: the working image continues it
        let working_layer_id = if top.size < shared.reuse_threshold() {
            let tmp = partial_path(&working);
            tokio::fs::copy(shared.cache.layer_path(&top.id), &tmp).await?;
            if ids.len() > 1 {
                let below = &ids[..ids.len() - 1];
                let backing = materialize::consolidate(shared, name, below).await?;
                shared.tool.rebase_unsafe(&tmp, Some(&backing)).await?;
            }
            tokio::fs::rename(&tmp, &working).await?;
            Some(top.id.clone())
        } else {
            let backing = materialize::consolidate(shared, name, ids).await?;
            materialize::fresh_working(shared, &working, &backing, manifest.size_gb).await?;
            None
        };
        // layers keep the size they were written at; a later grow lives
        // only in the manifest
        if shared.tool.virtual_size(&working).await? < manifest.size_gb * GIB {
            shared.tool.resize(&working, manifest.size_gb).await?;
        }
        shared.tool.validate_backing_chain(&working).await?;

        let checksum = shared.tool.checksum(&working).await?;
        let record = DiskRecord {
            created_at: manifest.created,
            in_remote: true,
            checksum: Some(checksum),
            working_layer_id,
            ..DiskRecord::new(name, manifest.size_gb)
        };
        shared.state.save_disk(&record)?;
        Ok(self.new_disk(name, manifest.size_gb))
    }

    // ── Fork ──────────────────────────────────────────────────────────────────

    /// Create `new_name` as a copy of `source` that shares its layers.
    ///
    /// The source's working changes are committed into a new shared layer
    /// first, so both disks start from identical content and diverge from
    /// there. The source must be unmounted.
    pub async fn fork(&self, source: &str, new_name: &str) -> DiskResult<Arc<Disk>> {
        validate_disk_name(new_name)?;
        let mut disks = self.disks.write().await;
        self.ensure_absent(&disks, new_name).await?;
        let src = disks
            .get(source)
            .cloned()
            .ok_or_else(|| DiskError::DiskNotFound(source.to_string()))?;

        let mut rb = Rollback::new(format!("fork {source} to {new_name}"));
        let result = self.fork_inner(&src, new_name, &mut rb).await;
        let disk = rb
            .finish(result)
            .await
            .with_context(|| format!("fork {source} to {new_name}"))?;
        disks.insert(new_name.to_string(), disk.clone());
        info!("forked {source} to {new_name}");
        Ok(disk)
    }

    #[allow(clippy::too_many_lines)]
    async fn fork_inner(&self, src: &Disk, new_name: &str, rb: &mut Rollback) -> DiskResult<Arc<Disk>> {
        let shared = &self.shared;
        let source = src.name();
        let st = src.lock_state().await;
        if st.is_mounted() {
            return Err(DiskError::DiskMounted(source.to_string()));
        }
        shared.tool.validate_backing_chain(&st.working_path).await?;
        let mut ids = shared.state.get_disk_layer_ids(source)?;

        // commit the source's working changes as a shared layer
        let commit_id = new_layer_id();
        let blob = shared.cache.layer_path(&commit_id);
        let part = partial_path(&blob);
        rb.remove_file(part.clone());
        rb.remove_file(blob.clone());
        materialize::strip_copy(shared, &st.working_path, &part).await?;
        tokio::fs::rename(&part, &blob).await?;
        let commit_pos = position(ids.len())?;
        shared.cache.register(source, commit_pos, &commit_id).await?;
        {
            let state = shared.state.clone();
            let (source, commit_id) = (source.to_string(), commit_id.clone());
            rb.push(format!("detach {commit_id} from {source}"), async move {
                state.detach_layer(&source, commit_pos)?;
                state.delete_layer_if_unused(&commit_id)?;
                Ok(())
            });
        }
        ids.push(commit_id);

        shared.state.copy_disk_layers(source, new_name)?;
        self.undo_layers(rb, new_name);

        // working image of the new disk
        rb.remove_dir_all(shared.layout.chain_dir(new_name));
        let new_backing = materialize::consolidate(shared, new_name, &ids).await?;
        let new_working = shared.layout.working_image(new_name);
        rb.remove_file(partial_path(&new_working));
        rb.remove_file(new_working.clone());
        materialize::fresh_working(shared, &new_working, &new_backing, st.size_gb).await?;

        // replacement working image of the source, swapped in last
        let src_backing = materialize::consolidate(shared, source, &ids).await?;
        if ids.len() > 1 {
            rb.remove_file(src_backing.clone());
        }
        let src_next = partial_path(&st.working_path);
        rb.remove_file(src_next.clone());
        shared
            .tool
            .create_with_backing(&src_backing, &src_next, st.size_gb)
            .await?;

        let record = DiskRecord::new(new_name, st.size_gb);
        shared.state.save_disk(&record)?;
        {
            let state = shared.state.clone();
            let new_name = new_name.to_string();
            rb.push(format!("delete record of {new_name}"), async move {
                state.delete_disk(&new_name)?;
                Ok(())
            });
        }

        tokio::fs::rename(&src_next, &st.working_path).await?;
        rb.disarm();

        shared.state.set_working_layer(source, None)?;
        materialize::prune_chain_dir(shared, source, Some(src_backing.as_path())).await;
        Ok(self.new_disk(new_name, st.size_gb))
    }

    // ── Delete / maintenance ──────────────────────────────────────────────────

    /// Unmount and remove a disk with all its local files. Layers no other
    /// disk uses are garbage collected.
    pub async fn delete(&self, name: &str) -> DiskResult<()> {
        let mut disks = self.disks.write().await;
        let disk = match disks.get(name) {
            Some(disk) => disk.clone(),
            None => {
                let record = self
                    .shared
                    .state
                    .get_disk(name)?
                    .ok_or_else(|| DiskError::DiskNotFound(name.to_string()))?;
                self.new_disk(name, record.size_gb)
            }
        };
        disk.unmount()
            .await
            .with_context(|| format!("delete {name}"))?;

        let released = self.shared.state.detach_all_layers(name)?;
        debug!("released {} layer reference(s) of {name}", released.len());
        if let Err(e) = self.shared.cache.cleanup_unused_layers().await {
            warn!("layer cleanup after deleting {name} failed: {e}");
        }

        let layout = &self.shared.layout;
        remove_if_exists(&layout.working_image(name)).await?;
        remove_dir_if_exists(&layout.chain_dir(name)).await?;
        if let Err(e) = remove_dir_if_exists(&layout.mount_dir(name)).await {
            warn!("failed to remove mount point of {name}: {e}");
        }
        self.shared.state.delete_disk(name)?;
        disks.remove(name);
        info!("deleted {name}");
        Ok(())
    }

    /// Remove every cached layer no disk references
    pub async fn cleanup_unused_layers(&self) -> DiskResult<usize> {
        self.shared.cache.cleanup_unused_layers().await
    }

    pub async fn pool_stats(&self) -> Option<PoolStats> {
        match &self.pool {
            Some(pool) => Some(pool.stats().await),
            None => None,
        }
    }

    /// Unmount everything and release the image tool. The first failure is
    /// returned after every step has been tried.
    pub async fn close(&self) -> DiskResult<()> {
        let mut first_err: Option<DiskError> = None;
        if let Some(pool) = &self.pool
            && let Err(e) = pool.close().await
        {
            first_err.get_or_insert(e);
        }
        let disks: Vec<Arc<Disk>> = self.disks.read().await.values().cloned().collect();
        for disk in disks {
            if let Err(e) = disk.close().await {
                warn!("failed to close {}: {e}", disk.name());
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.shared.tool.close().await {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Paths of every working image, for diagnostics
    pub async fn working_images(&self) -> Vec<PathBuf> {
        let disks = self.disks.read().await;
        let mut paths: Vec<PathBuf> = disks
            .keys()
            .map(|name| self.shared.layout.working_image(name))
            .collect();
        paths.sort();
        paths
    }
}
