//! Turning cached layers into images a working image can sit on
//!
//! Cache blobs are stored without backing references. A disk's chain is
//! rebuilt as private copies under `layers/<name>/`, each rebased onto the
//! previous one, and usually flattened into a single consolidated image.
//! Consolidated images get a fresh name each time so a file some image
//! still references as its backing is never overwritten.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use sdisk_common::layout::partial_path;
use sdisk_common::{DiskError, DiskResult};

use crate::shared::{Shared, remove_if_exists};

fn consolidated_path(shared: &Shared, name: &str) -> PathBuf {
    shared
        .layout
        .chain_dir(name)
        .join(format!("consolidated-{}.qcow2", Uuid::new_v4().simple()))
}

/// Copy the blobs of `ids` (base first) into the chain directory of `name`
/// and link each copy to the previous one. Returns the link paths.
pub(crate) async fn rebuild_chain(shared: &Shared, name: &str, ids: &[String]) -> DiskResult<Vec<PathBuf>> {
    let dir = shared.layout.chain_dir(name);
    tokio::fs::create_dir_all(&dir).await?;
    let mut links: Vec<PathBuf> = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let link = dir.join(format!("link-{i:04}.qcow2"));
        if let Err(e) = link_layer(shared, id, &link, links.last().map(PathBuf::as_path)).await {
            links.push(link);
            remove_links(&links).await;
            return Err(e);
        }
        links.push(link);
    }
    debug!("rebuilt chain of {name} with {} link(s)", links.len());
    Ok(links)
}

async fn link_layer(shared: &Shared, id: &str, link: &Path, below: Option<&Path>) -> DiskResult<()> {
    tokio::fs::copy(shared.cache.layer_path(id), link).await?;
    match below {
        Some(below) => shared.tool.rebase_unsafe(link, Some(below)).await,
        None => {
            let mut perms = tokio::fs::metadata(link).await?.permissions();
            perms.set_readonly(true);
            tokio::fs::set_permissions(link, perms).await?;
            Ok(())
        }
    }
}

async fn remove_links(links: &[PathBuf]) {
    for link in links {
        if let Err(e) = remove_if_exists(link).await {
            warn!("failed to remove chain link {}: {e}", link.display());
        }
    }
}

/// A standalone image holding the stacked content of `ids`.
///
/// A single layer is used straight from the cache. Longer chains are
/// rebuilt and flattened into a new consolidated image owned by `name`.
pub(crate) async fn consolidate(shared: &Shared, name: &str, ids: &[String]) -> DiskResult<PathBuf> {
    match ids {
        [] => Err(DiskError::invalid_state(format!("{name} has no layers to consolidate"))),
        [only] => Ok(shared.cache.layer_path(only)),
        _ => {
            let links = rebuild_chain(shared, name, ids).await?;
            let out = consolidated_path(shared, name);
            let result = match links.last() {
                Some(top) => shared.tool.convert(top, &out).await,
                None => Err(DiskError::invalid_state("empty chain")),
            };
            remove_links(&links).await;
            result?;
            debug!("consolidated {} layer(s) of {name} into {}", ids.len(), out.display());
            Ok(out)
        }
    }
}

/// Flatten `image` and its whole backing chain into a new consolidated image
pub(crate) async fn flatten(shared: &Shared, name: &str, image: &Path) -> DiskResult<PathBuf> {
    tokio::fs::create_dir_all(shared.layout.chain_dir(name)).await?;
    let out = consolidated_path(shared, name);
    shared.tool.convert(image, &out).await?;
    Ok(out)
}

/// Copy `src` to `dest` and drop the copy's backing reference, leaving only
/// the clusters `src` itself holds
pub(crate) async fn strip_copy(shared: &Shared, src: &Path, dest: &Path) -> DiskResult<()> {
    tokio::fs::copy(src, dest).await?;
    shared.tool.rebase_unsafe(dest, None).await
}

/// Replace `working` with an empty overlay on `backing`
pub(crate) async fn fresh_working(
    shared: &Shared,
    working: &Path,
    backing: &Path,
    size_gb: u64,
) -> DiskResult<()> {
    let tmp = partial_path(working);
    shared.tool.create_with_backing(backing, &tmp, size_gb).await?;
    tokio::fs::rename(&tmp, working).await?;
    Ok(())
}

/// Remove everything in the chain directory of `name` except `keep`
pub(crate) async fn prune_chain_dir(shared: &Shared, name: &str, keep: Option<&Path>) {
    let dir = shared.layout.chain_dir(name);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("failed to read {}: {e}", dir.display());
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("failed to read {}: {e}", dir.display());
                break;
            }
        };
        let path = entry.path();
        if keep == Some(path.as_path()) {
            continue;
        }
        if let Err(e) = remove_if_exists(&path).await {
            warn!("failed to prune {}: {e}", path.display());
        }
    }
}
