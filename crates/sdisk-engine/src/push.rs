//! Incremental upload of a disk to the remote store
//!
//! The first push uploads the whole disk as a base layer. Later pushes
//! upload only what the working image holds on top of its backing chain,
//! either as a new layer or, while the top layer is still small and owned
//! by this disk alone, by replacing that layer in place. The manifest is
//! uploaded last; until then the remote still describes the previous state.

use chrono::Utc;
use tracing::{debug, info};

use sdisk_common::layout::partial_path;
use sdisk_common::{
    DiskError, DiskRecord, DiskResult, LayerRecord, ManifestLayer, RemoteManifest, ResultExt,
    new_layer_id,
};
use sdisk_remote::RemoteStore;

use crate::disk::{Disk, DiskState};
use crate::materialize;
use crate::rollback::Rollback;
use crate::shared::position;

/// How a push treated the working image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushKind {
    /// Whole disk uploaded as a new base layer
    Base,
    /// Working changes uploaded as a new top layer
    NewLayer,
    /// Working changes replaced the existing top layer
    ReusedLayer,
    /// Nothing new in the working image
    Skipped,
}

/// Result of [`Disk::push`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushOutcome {
    pub kind: PushKind,
    /// Layer written by this push, if any
    pub layer_id: Option<String>,
    /// The working image was folded into its backing and restarted empty
    pub finalized: bool,
}

impl PushOutcome {
    const fn skipped() -> Self {
        Self {
            kind: PushKind::Skipped,
            layer_id: None,
            finalized: false,
        }
    }
}

impl Disk {
    /// Upload local changes to the remote store. The disk must be unmounted.
    pub async fn push(&self) -> DiskResult<PushOutcome> {
        let st = self.lock_state().await;
        if st.is_mounted() {
            return Err(DiskError::DiskMounted(self.name().to_string()));
        }
        let remote = self.shared.remote()?;
        let record = self
            .shared
            .state
            .get_disk(self.name())?
            .ok_or_else(|| DiskError::DiskNotFound(self.name().to_string()))?;
        let manifest = remote
            .try_download_metadata(self.name())
            .await
            .context("fetch manifest")?;

        let mut rb = Rollback::new(format!("push {}", self.name()));
        let result = match manifest {
            Some(manifest) if !manifest.layers.is_empty() => {
                self.push_incremental(&st, remote, &record, manifest, &mut rb)
                    .await
            }
            _ => self.push_base(&st, remote, &record, &mut rb).await,
        };
        rb.finish(result)
            .await
            .with_context(|| format!("push {}", self.name()))
    }

    async fn push_base(
        &self,
        st: &DiskState,
        remote: &RemoteStore,
        record: &DiskRecord,
        rb: &mut Rollback,
    ) -> DiskResult<PushOutcome> {
        let shared = &self.shared;
        let name = self.name();
        let id = new_layer_id();
        let blob = shared.cache.layer_path(&id);
        let part = partial_path(&blob);
        rb.remove_file(part.clone());
        rb.remove_file(blob.clone());

        shared.tool.convert(&st.working_path, &part).await?;
        tokio::fs::rename(&part, &blob).await?;
        let checksum = shared.tool.checksum(&blob).await?;
        let size = shared.tool.actual_size(&blob).await?;

        remote.upload_layer(name, &id, &blob).await?;
        let undo_remote = remote.clone();
        let (undo_name, undo_id) = (name.to_string(), id.clone());
        rb.push(format!("delete remote layer {id}"), async move {
            undo_remote.delete_layer(&undo_name, &undo_id).await
        });

        let mut manifest = RemoteManifest::new(name, st.size_gb, record.created_at);
        manifest.push_layer(ManifestLayer {
            id: id.clone(),
            parent_id: None,
            created: Utc::now(),
            size,
            checksum: checksum.clone(),
            description: "base layer".into(),
        });
        manifest.checksum.clone_from(&checksum);

        // the new working image is prepared before anything is committed
        let next = partial_path(&st.working_path);
        rb.remove_file(next.clone());
        shared
            .tool
            .create_with_backing(&blob, &next, st.size_gb)
            .await?;

        remote.upload_metadata(name, &manifest).await?;
        rb.disarm();

        shared
            .state
            .reset_disk_layers(name, &LayerRecord::new(&id, &checksum, size))?;
        tokio::fs::rename(&next, &st.working_path).await?;
        materialize::prune_chain_dir(shared, name, None).await;
        let working_checksum = shared.tool.checksum(&st.working_path).await?;
        shared.state.update_disk(name, |r| {
            r.in_remote = true;
            r.checksum = Some(working_checksum);
            r.working_layer_id = None;
        })?;
        info!("pushed {name} as base layer {id} ({size} bytes)");
        Ok(PushOutcome {
            kind: PushKind::Base,
            layer_id: Some(id),
            finalized: true,
        })
    }

    #[allow(clippy::too_many_lines)]
    async fn push_incremental(
        &self,
        st: &DiskState,
        remote: &RemoteStore,
        record: &DiskRecord,
        mut manifest: RemoteManifest,
        rb: &mut Rollback,
    ) -> DiskResult<PushOutcome> {
        let shared = &self.shared;
        let name = self.name();
        let remote_ids = manifest.layer_ids();
        let local_ids = shared.state.get_disk_layer_ids(name)?;
        if !local_ids.starts_with(&remote_ids) {
            return Err(DiskError::integrity(format!(
                "local layers of {name} diverge from its remote manifest"
            )));
        }

        // layers committed locally (by a fork) that the remote lacks
        let pending = &local_ids[remote_ids.len()..];
        for id in pending {
            let layer = shared
                .state
                .get_layer(id)?
                .ok_or_else(|| DiskError::LayerNotFound(id.clone()))?;
            remote
                .upload_layer(name, id, &shared.cache.layer_path(id))
                .await?;
            manifest.push_layer(ManifestLayer {
                id: id.clone(),
                parent_id: None,
                created: Utc::now(),
                size: layer.size,
                checksum: layer.checksum,
                description: "committed layer".into(),
            });
            debug!("uploaded pending layer {id} of {name}");
        }

        let Some(top) = manifest.top().cloned() else {
            return Err(DiskError::integrity(format!("manifest of {name} has no top layer")));
        };
        let resized = manifest.size_gb != st.size_gb;
        manifest.size_gb = st.size_gb;
        let continues_top = record.working_layer_id.as_deref() == Some(top.id.as_str());
        let working_checksum = shared.tool.checksum(&st.working_path).await?;
        let unchanged = if continues_top {
            record.checksum.as_deref() == Some(working_checksum.as_str())
        } else {
            shared.tool.actual_size(&st.working_path).await? < shared.empty_layer_max()
        };
        if unchanged {
            if !pending.is_empty() || resized {
                manifest.modified = Utc::now();
                remote.upload_metadata(name, &manifest).await?;
                shared
                    .state
                    .update_remote_state(name, true, Some(working_checksum.as_str()))?;
                info!(
                    "pushed manifest of {name} ({} pending layer(s), {}G)",
                    pending.len(),
                    st.size_gb
                );
            } else {
                debug!("nothing to push for {name}");
            }
            return Ok(PushOutcome::skipped());
        }

        let threshold = shared.reuse_threshold();
        let top_refs = shared.state.get_layer(&top.id)?.map_or(0, |l| l.ref_count);
        let reuse = continues_top && top.size < threshold && top_refs <= 1;
        let id = if reuse { top.id.clone() } else { new_layer_id() };

        let blob = shared.cache.layer_path(&id);
        let tmp = partial_path(&blob);
        rb.remove_file(tmp.clone());
        materialize::strip_copy(shared, &st.working_path, &tmp).await?;
        let checksum = shared.tool.checksum(&tmp).await?;
        let size = shared.tool.actual_size(&tmp).await?;
        remote.upload_layer(name, &id, &tmp).await?;
        if !reuse {
            let undo_remote = remote.clone();
            let (undo_name, undo_id) = (name.to_string(), id.clone());
            rb.push(format!("delete remote layer {id}"), async move {
                undo_remote.delete_layer(&undo_name, &undo_id).await
            });
        }

        if reuse {
            if let Some(entry) = manifest.layers.iter_mut().find(|l| l.id == id) {
                entry.size = size;
                entry.checksum.clone_from(&checksum);
            }
        } else {
            manifest.push_layer(ManifestLayer {
                id: id.clone(),
                parent_id: None,
                created: Utc::now(),
                size,
                checksum: checksum.clone(),
                description: "incremental layer".into(),
            });
        }
        manifest.checksum.clone_from(&checksum);
        manifest.modified = Utc::now();
        remote.upload_metadata(name, &manifest).await?;
        rb.disarm();

        tokio::fs::rename(&tmp, &blob).await?;
        if reuse {
            shared.state.refresh_layer(&id, &checksum, size)?;
        } else {
            shared
                .cache
                .register(name, position(local_ids.len())?, &id)
                .await?;
        }

        let finalized = size >= threshold;
        if finalized {
            self.finalize_working(st).await?;
        }
        let working_checksum = if finalized {
            shared.tool.checksum(&st.working_path).await?
        } else {
            working_checksum
        };
        shared.state.update_disk(name, |r| {
            r.in_remote = true;
            r.checksum = Some(working_checksum);
            r.working_layer_id = if finalized { None } else { Some(id.clone()) };
        })?;

        let kind = if reuse {
            PushKind::ReusedLayer
        } else {
            PushKind::NewLayer
        };
        info!("pushed {name}: {kind:?} {id} ({size} bytes, finalized={finalized})");
        Ok(PushOutcome {
            kind,
            layer_id: Some(id),
            finalized,
        })
    }

    /// Fold the working image into a consolidated backing and start a new,
    /// empty working image on top of it
    async fn finalize_working(&self, st: &DiskState) -> DiskResult<()> {
        let shared = &self.shared;
        let name = self.name();
        let flat = materialize::flatten(shared, name, &st.working_path).await?;
        materialize::fresh_working(shared, &st.working_path, &flat, st.size_gb).await?;
        materialize::prune_chain_dir(shared, name, Some(flat.as_path())).await;
        debug!("finalized working image of {name} onto {}", flat.display());
        Ok(())
    }
}
